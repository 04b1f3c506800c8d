use std::collections::{BTreeMap, BTreeSet};

use crate::error::StoreError;
use crate::HostStorage;

/// A point inside the staged writes that [`CrankBuffer::rollback_to`] can
/// return to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Savepoint {
    undo: usize,
    transcripts: usize,
}

/// Write-staging layer over a [`HostStorage`].
///
/// Reads see staged writes. [`HostStorage::commit`] pushes them into the
/// backing store and commits it; [`CrankBuffer::abort`] discards them.
pub struct CrankBuffer<S> {
    inner: S,
    writes: BTreeMap<String, Option<String>>,
    transcripts: Vec<(String, String)>,
    // Previous staged entry for every write, newest last. `None` means the
    // key had nothing staged.
    undo: Vec<(String, Option<Option<String>>)>,
}

impl<S: HostStorage> CrankBuffer<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            writes: BTreeMap::new(),
            transcripts: Vec::new(),
            undo: Vec::new(),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Unwrap the backing store. Staged writes are dropped.
    pub fn into_inner(self) -> S {
        self.inner
    }

    pub fn is_dirty(&self) -> bool {
        !self.writes.is_empty() || !self.transcripts.is_empty()
    }

    /// Drop everything staged since the last commit.
    pub fn abort(&mut self) {
        self.writes.clear();
        self.transcripts.clear();
        self.undo.clear();
    }

    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            undo: self.undo.len(),
            transcripts: self.transcripts.len(),
        }
    }

    /// Undo every write and transcript append staged after `savepoint`.
    /// Work staged before it is kept.
    pub fn rollback_to(&mut self, savepoint: Savepoint) {
        while self.undo.len() > savepoint.undo {
            let Some((key, previous)) = self.undo.pop() else {
                break;
            };
            match previous {
                Some(staged) => {
                    self.writes.insert(key, staged);
                }
                None => {
                    self.writes.remove(&key);
                }
            }
        }
        self.transcripts.truncate(savepoint.transcripts);
    }

    fn stage(&mut self, key: &str, value: Option<String>) {
        let previous = self.writes.insert(key.to_string(), value);
        self.undo.push((key.to_string(), previous));
    }
}

impl<S: HostStorage> HostStorage for CrankBuffer<S> {
    fn get(&self, key: &str) -> Option<String> {
        match self.writes.get(key) {
            Some(staged) => staged.clone(),
            None => self.inner.get(key),
        }
    }

    fn has(&self, key: &str) -> bool {
        match self.writes.get(key) {
            Some(staged) => staged.is_some(),
            None => self.inner.has(key),
        }
    }

    fn set(&mut self, key: &str, value: &str) {
        self.stage(key, Some(value.to_string()));
    }

    fn delete(&mut self, key: &str) {
        self.stage(key, None);
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: BTreeSet<String> = self.inner.keys_with_prefix(prefix).into_iter().collect();
        for (key, staged) in self
            .writes
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            if staged.is_some() {
                keys.insert(key.clone());
            } else {
                keys.remove(key);
            }
        }
        keys.into_iter().collect()
    }

    fn append_transcript(&mut self, stream: &str, entry: &str) -> u64 {
        let index = self.transcript_len(stream);
        self.transcripts.push((stream.to_string(), entry.to_string()));
        index
    }

    fn read_transcript(&self, stream: &str) -> Vec<String> {
        let mut entries = self.inner.read_transcript(stream);
        entries.extend(
            self.transcripts
                .iter()
                .filter(|(s, _)| s == stream)
                .map(|(_, e)| e.clone()),
        );
        entries
    }

    fn transcript_len(&self, stream: &str) -> u64 {
        let staged = self.transcripts.iter().filter(|(s, _)| s == stream).count();
        self.inner.transcript_len(stream) + staged as u64
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.undo.clear();
        for (key, staged) in std::mem::take(&mut self.writes) {
            match staged {
                Some(value) => self.inner.set(&key, &value),
                None => self.inner.delete(&key),
            }
        }
        for (stream, entry) in std::mem::take(&mut self.transcripts) {
            self.inner.append_transcript(&stream, &entry);
        }
        self.inner.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use proptest::prelude::*;

    #[test]
    fn staged_writes_are_visible_before_commit() {
        let mut inner = MemoryStore::new();
        inner.set("a", "1");
        let mut buf = CrankBuffer::new(inner);

        buf.set("b", "2");
        buf.delete("a");
        assert_eq!(buf.get("b").as_deref(), Some("2"));
        assert!(!buf.has("a"));
        assert_eq!(buf.inner().get("a").as_deref(), Some("1"));
        assert!(buf.is_dirty());
    }

    #[test]
    fn abort_discards_everything() {
        let mut buf = CrankBuffer::new(MemoryStore::new());
        buf.set("k", "v");
        buf.append_transcript("t", "entry");
        buf.abort();

        assert!(!buf.has("k"));
        assert_eq!(buf.transcript_len("t"), 0);
        buf.commit().unwrap();
        assert!(buf.inner().is_empty());
    }

    #[test]
    fn rollback_keeps_work_staged_before_the_savepoint() {
        let mut inner = MemoryStore::new();
        inner.set("base", "0");
        let mut buf = CrankBuffer::new(inner);

        buf.set("kept", "1");
        buf.append_transcript("t", "first");
        let sp = buf.savepoint();
        buf.set("kept", "2");
        buf.set("fresh", "3");
        buf.delete("base");
        buf.append_transcript("t", "second");
        buf.rollback_to(sp);

        assert_eq!(buf.get("kept").as_deref(), Some("1"));
        assert!(!buf.has("fresh"));
        assert_eq!(buf.get("base").as_deref(), Some("0"));
        assert_eq!(buf.read_transcript("t"), vec!["first"]);

        buf.commit().unwrap();
        let inner = buf.into_inner();
        assert_eq!(inner.get("kept").as_deref(), Some("1"));
        assert!(!inner.has("fresh"));
        assert_eq!(inner.get("base").as_deref(), Some("0"));
    }

    #[test]
    fn commit_applies_writes_and_transcripts() {
        let mut inner = MemoryStore::new();
        inner.set("gone", "x");
        inner.append_transcript("t", "first");
        let mut buf = CrankBuffer::new(inner);

        buf.set("k", "v");
        buf.delete("gone");
        assert_eq!(buf.append_transcript("t", "second"), 1);
        assert_eq!(buf.read_transcript("t"), vec!["first", "second"]);
        buf.commit().unwrap();

        let inner = buf.into_inner();
        assert_eq!(inner.get("k").as_deref(), Some("v"));
        assert!(!inner.has("gone"));
        assert_eq!(inner.read_transcript("t"), vec!["first", "second"]);
        assert_eq!(inner.commits(), 1);
    }

    #[test]
    fn prefix_scan_merges_staged_keys() {
        let mut inner = MemoryStore::new();
        inner.set("p.a", "1");
        inner.set("p.b", "2");
        let mut buf = CrankBuffer::new(inner);
        buf.delete("p.a");
        buf.set("p.c", "3");
        buf.set("q.d", "4");
        assert_eq!(buf.keys_with_prefix("p."), vec!["p.b", "p.c"]);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Set(u8, u8),
        Delete(u8),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6, any::<u8>()).prop_map(|(k, v)| Op::Set(k, v)),
            (0u8..6).prop_map(Op::Delete),
        ]
    }

    proptest! {
        #[test]
        fn committed_buffer_matches_direct_writes(ops in prop::collection::vec(arb_op(), 0..40)) {
            let mut direct = MemoryStore::new();
            let mut buf = CrankBuffer::new(MemoryStore::new());
            for op in &ops {
                match op {
                    Op::Set(k, v) => {
                        direct.set(&format!("k{k}"), &v.to_string());
                        buf.set(&format!("k{k}"), &v.to_string());
                    }
                    Op::Delete(k) => {
                        direct.delete(&format!("k{k}"));
                        buf.delete(&format!("k{k}"));
                    }
                }
            }
            prop_assert_eq!(buf.keys_with_prefix("k"), direct.keys_with_prefix("k"));
            buf.commit().unwrap();
            let inner = buf.into_inner();
            for k in 0..6 {
                let key = format!("k{k}");
                prop_assert_eq!(inner.get(&key), direct.get(&key));
            }
        }
    }
}
