use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::HostStorage;

/// Volatile storage. `commit` only counts.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    kv: BTreeMap<String, String>,
    transcripts: BTreeMap<String, Vec<String>>,
    commits: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful commits so far.
    pub fn commits(&self) -> u64 {
        self.commits
    }

    pub fn len(&self) -> usize {
        self.kv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kv.is_empty()
    }
}

impl HostStorage for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.kv.get(key).cloned()
    }

    fn has(&self, key: &str) -> bool {
        self.kv.contains_key(key)
    }

    fn set(&mut self, key: &str, value: &str) {
        self.kv.insert(key.to_string(), value.to_string());
    }

    fn delete(&mut self, key: &str) {
        self.kv.remove(key);
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn append_transcript(&mut self, stream: &str, entry: &str) -> u64 {
        let entries = self.transcripts.entry(stream.to_string()).or_default();
        entries.push(entry.to_string());
        entries.len() as u64 - 1
    }

    fn read_transcript(&self, stream: &str) -> Vec<String> {
        self.transcripts.get(stream).cloned().unwrap_or_default()
    }

    fn transcript_len(&self, stream: &str) -> u64 {
        self.transcripts.get(stream).map_or(0, |t| t.len() as u64)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.commits += 1;
        Ok(())
    }
}
