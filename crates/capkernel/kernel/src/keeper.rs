//! Typed access to the kernel's persistent state.
//!
//! Everything the kernel knows lives under string keys in a
//! [`CrankBuffer`] over the host store:
//!
//! | key | value |
//! |---|---|
//! | `initialized` | `"true"` once genesis is committed |
//! | `vat.names`, `device.names` | JSON list of names, in ID order |
//! | `vat.name.<name>`, `device.name.<name>` | `v<N>`, `d<N>` |
//! | `ko.nextID`, `kp.nextID`, `kd.nextID` | kernel slot counters |
//! | `ko<N>.owner`, `kd<N>.owner` | owning vat or device |
//! | `kp<N>` | JSON promise record |
//! | `<vat>.c.<kslot>`, `<vat>.c.<vslot>` | CList entries, both directions |
//! | `<vat>.<kind>.nextImport` | per-vat import counters |
//! | `<dev>.root`, `<dev>.deviceState` | device slot and state |
//! | `runQueue.head`, `runQueue.tail` | run-queue bounds, `[head, tail)` |
//! | `runQueue.<N>` | one JSON run-queue entry |
//! | `log.length`, `log.<N>` | kernel log lines, append-only |
//! | `crankNumber`, `activityhash` | crank bookkeeping |
//!
//! plus one transcript stream per vat, `transcript.<vat>`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use capkernel_store::{CrankBuffer, HostStorage, Savepoint};
use capkernel_types::{DeviceId, KernelMessage, KernelSlot, SlotKind, VatId};

use crate::error::KernelError;
use crate::promise::{Decider, KernelPromise};
use crate::transcript::TranscriptEntry;

pub(crate) const FIRST_OBJECT_ID: u64 = 20;
pub(crate) const FIRST_DEVICE_ID: u64 = 30;
pub(crate) const FIRST_PROMISE_ID: u64 = 40;
pub(crate) const FIRST_IMPORT_ID: u64 = 10;

/// One unit of pending kernel work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunQueueEntry {
    Send {
        target: KernelSlot,
        msg: KernelMessage,
    },
    Notify {
        vat: VatId,
        kpid: KernelSlot,
    },
}

pub struct KernelKeeper {
    store: CrankBuffer<Box<dyn HostStorage>>,
}

impl KernelKeeper {
    pub fn new(storage: Box<dyn HostStorage>) -> Self {
        Self {
            store: CrankBuffer::new(storage),
        }
    }

    pub fn into_storage(self) -> Box<dyn HostStorage> {
        self.store.into_inner()
    }

    pub fn commit(&mut self) -> Result<(), KernelError> {
        self.store.commit()?;
        Ok(())
    }

    pub fn abort(&mut self) {
        self.store.abort();
    }

    pub fn savepoint(&self) -> Savepoint {
        self.store.savepoint()
    }

    /// Drop state staged after `savepoint`, keeping the rest of the crank.
    pub fn rollback_to(&mut self, savepoint: Savepoint) {
        self.store.rollback_to(savepoint);
    }

    // ---- raw access ----

    pub(crate) fn get(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    pub(crate) fn set(&mut self, key: &str, value: &str) {
        self.store.set(key, value);
    }

    pub(crate) fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.store.keys_with_prefix(prefix)
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, KernelError> {
        match self.store.get(key) {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| KernelError::Corrupt(format!("{key}: {e}"))),
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), KernelError> {
        let raw = serde_json::to_string(value)?;
        self.store.set(key, &raw);
        Ok(())
    }

    fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, KernelError>
    where
        T::Err: std::fmt::Display,
    {
        match self.store.get(key) {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e| KernelError::Corrupt(format!("{key}={raw}: {e}"))),
            None => Ok(None),
        }
    }

    /// Take the next value of a counter, starting at `initial`.
    pub(crate) fn allocate(&mut self, key: &str, initial: u64) -> Result<u64, KernelError> {
        let next = self.get_parsed::<u64>(key)?.unwrap_or(initial);
        self.store.set(key, &(next + 1).to_string());
        Ok(next)
    }

    // ---- genesis ----

    pub fn is_initialized(&self) -> bool {
        self.store.has("initialized")
    }

    pub fn set_initialized(&mut self) {
        self.store.set("initialized", "true");
    }

    pub fn vat_names(&self) -> Result<Vec<String>, KernelError> {
        Ok(self.get_json("vat.names")?.unwrap_or_default())
    }

    pub fn allocate_vat_id(&mut self, name: &str) -> Result<VatId, KernelError> {
        let id = VatId(self.allocate("vat.nextID", 1)? as u32);
        let mut names = self.vat_names()?;
        names.push(name.to_string());
        self.set_json("vat.names", &names)?;
        self.store.set(&format!("vat.name.{name}"), &id.to_string());
        Ok(id)
    }

    pub fn vat_id(&self, name: &str) -> Result<Option<VatId>, KernelError> {
        self.get_parsed(&format!("vat.name.{name}"))
    }

    pub fn device_names(&self) -> Result<Vec<String>, KernelError> {
        Ok(self.get_json("device.names")?.unwrap_or_default())
    }

    /// Assign a device ID and its kernel-owned `kd` slot.
    pub fn allocate_device(&mut self, name: &str) -> Result<(DeviceId, KernelSlot), KernelError> {
        let id = DeviceId(self.allocate("device.nextID", 1)? as u32);
        let mut names = self.device_names()?;
        names.push(name.to_string());
        self.set_json("device.names", &names)?;
        self.store.set(&format!("device.name.{name}"), &id.to_string());

        let slot = KernelSlot::device(self.allocate("kd.nextID", FIRST_DEVICE_ID)?);
        self.store.set(&format!("{slot}.owner"), &id.to_string());
        self.store.set(&format!("{id}.root"), &slot.to_string());
        Ok((id, slot))
    }

    pub fn device_id(&self, name: &str) -> Result<Option<DeviceId>, KernelError> {
        self.get_parsed(&format!("device.name.{name}"))
    }

    pub fn device_slot(&self, device: DeviceId) -> Result<KernelSlot, KernelError> {
        self.get_parsed(&format!("{device}.root"))?
            .ok_or_else(|| KernelError::Corrupt(format!("{device} has no root slot")))
    }

    pub fn device_owner(&self, slot: KernelSlot) -> Result<DeviceId, KernelError> {
        self.get_parsed(&format!("{slot}.owner"))?
            .ok_or_else(|| KernelError::Corrupt(format!("{slot} has no owner")))
    }

    pub fn device_state(&self, device: DeviceId) -> Option<String> {
        self.store.get(&format!("{device}.deviceState"))
    }

    pub fn set_device_state(&mut self, device: DeviceId, state: &str) {
        self.store.set(&format!("{device}.deviceState"), state);
    }

    // ---- kernel objects ----

    pub fn add_kernel_object(&mut self, owner: VatId) -> Result<KernelSlot, KernelError> {
        let slot = KernelSlot::object(self.allocate("ko.nextID", FIRST_OBJECT_ID)?);
        self.store.set(&format!("{slot}.owner"), &owner.to_string());
        Ok(slot)
    }

    pub fn object_owner(&self, slot: KernelSlot) -> Result<VatId, KernelError> {
        self.get_parsed(&format!("{slot}.owner"))?
            .ok_or_else(|| KernelError::Corrupt(format!("{slot} has no owner")))
    }

    /// Every kernel object with its owner, in allocation order.
    pub fn kernel_objects(&self) -> Result<Vec<(KernelSlot, VatId)>, KernelError> {
        let mut objects = Vec::new();
        for key in self.store.keys_with_prefix("ko") {
            let Some(slot) = key.strip_suffix(".owner").and_then(|s| s.parse().ok()) else {
                continue;
            };
            objects.push((slot, self.object_owner(slot)?));
        }
        objects.sort_by_key(|(slot, _)| slot.index);
        Ok(objects)
    }

    // ---- kernel promises ----

    pub fn add_kernel_promise(&mut self, decider: Decider) -> Result<KernelSlot, KernelError> {
        let slot = KernelSlot::promise(self.allocate("kp.nextID", FIRST_PROMISE_ID)?);
        self.set_promise(slot, &KernelPromise::new(decider))?;
        Ok(slot)
    }

    pub fn promise(&self, kpid: KernelSlot) -> Result<KernelPromise, KernelError> {
        self.get_json(&kpid.to_string())?
            .ok_or_else(|| KernelError::Corrupt(format!("unknown promise {kpid}")))
    }

    pub fn set_promise(&mut self, kpid: KernelSlot, promise: &KernelPromise) -> Result<(), KernelError> {
        self.set_json(&kpid.to_string(), promise)
    }

    /// Every kernel promise, in allocation order.
    pub fn kernel_promises(&self) -> Result<Vec<(KernelSlot, KernelPromise)>, KernelError> {
        let mut promises = Vec::new();
        for key in self.store.keys_with_prefix("kp") {
            let Ok(slot) = key.parse::<KernelSlot>() else {
                continue;
            };
            promises.push((slot, self.promise(slot)?));
        }
        promises.sort_by_key(|(slot, _)| slot.index);
        Ok(promises)
    }

    // ---- run queue ----

    fn run_queue_bounds(&self) -> Result<(u64, u64), KernelError> {
        let head = self.get_parsed("runQueue.head")?.unwrap_or(0);
        let tail = self.get_parsed("runQueue.tail")?.unwrap_or(0);
        Ok((head, tail))
    }

    pub fn run_queue_len(&self) -> Result<usize, KernelError> {
        let (head, tail) = self.run_queue_bounds()?;
        Ok(tail.saturating_sub(head) as usize)
    }

    /// Every pending entry, oldest first.
    pub fn run_queue(&self) -> Result<Vec<RunQueueEntry>, KernelError> {
        let (head, tail) = self.run_queue_bounds()?;
        (head..tail)
            .map(|n| {
                let key = format!("runQueue.{n}");
                self.get_json(&key)?
                    .ok_or_else(|| KernelError::Corrupt(format!("missing {key}")))
            })
            .collect()
    }

    pub fn push_run_queue(&mut self, entry: RunQueueEntry) -> Result<(), KernelError> {
        let (_, tail) = self.run_queue_bounds()?;
        self.set_json(&format!("runQueue.{tail}"), &entry)?;
        self.store.set("runQueue.tail", &(tail + 1).to_string());
        Ok(())
    }

    pub fn pop_run_queue(&mut self) -> Result<Option<RunQueueEntry>, KernelError> {
        let (head, tail) = self.run_queue_bounds()?;
        if head >= tail {
            return Ok(None);
        }
        let key = format!("runQueue.{head}");
        let entry = self
            .get_json(&key)?
            .ok_or_else(|| KernelError::Corrupt(format!("missing {key}")))?;
        self.store.delete(&key);
        self.store.set("runQueue.head", &(head + 1).to_string());
        Ok(Some(entry))
    }

    // ---- kernel log ----

    pub fn append_log(&mut self, line: &str) -> Result<u64, KernelError> {
        let index = self.allocate("log.length", 0)?;
        self.store.set(&format!("log.{index}"), line);
        Ok(index)
    }

    pub fn log_lines(&self) -> Result<Vec<String>, KernelError> {
        let len: u64 = self.get_parsed("log.length")?.unwrap_or(0);
        (0..len)
            .map(|n| {
                let key = format!("log.{n}");
                self.store
                    .get(&key)
                    .ok_or_else(|| KernelError::Corrupt(format!("missing {key}")))
            })
            .collect()
    }

    // ---- cranks ----

    pub fn crank_number(&self) -> Result<u64, KernelError> {
        Ok(self.get_parsed("crankNumber")?.unwrap_or(0))
    }

    pub fn activity_hash(&self) -> String {
        self.store.get("activityhash").unwrap_or_default()
    }

    /// Record a finished crank and fold its summary into the activity hash.
    pub fn finish_crank(&mut self, crank: u64, summary: &[u8]) {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.activity_hash().as_bytes());
        hasher.update(&crank.to_le_bytes());
        hasher.update(summary);
        let hash = hasher.finalize();
        self.store.set("crankNumber", &crank.to_string());
        self.store.set("activityhash", hash.to_hex().as_str());
    }

    // ---- transcripts ----

    pub fn append_transcript(&mut self, vat: VatId, entry: &TranscriptEntry) -> Result<u64, KernelError> {
        let raw = serde_json::to_string(entry)?;
        Ok(self.store.append_transcript(&format!("transcript.{vat}"), &raw))
    }

    pub fn transcript(&self, vat: VatId) -> Result<Vec<TranscriptEntry>, KernelError> {
        self.store
            .read_transcript(&format!("transcript.{vat}"))
            .iter()
            .enumerate()
            .map(|(i, raw)| {
                serde_json::from_str(raw)
                    .map_err(|e| KernelError::Corrupt(format!("transcript.{vat}[{i}]: {e}")))
            })
            .collect()
    }

    pub fn transcript_len(&self, vat: VatId) -> u64 {
        self.store.transcript_len(&format!("transcript.{vat}"))
    }

    pub(crate) fn import_counter_key(vat: VatId, kind: SlotKind) -> String {
        let tag = match kind {
            SlotKind::Object => 'o',
            SlotKind::Promise => 'p',
            SlotKind::Device => 'd',
        };
        format!("{vat}.{tag}.nextImport")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capkernel_store::MemoryStore;
    use capkernel_types::{CapData, Message};

    fn keeper() -> KernelKeeper {
        KernelKeeper::new(Box::new(MemoryStore::new()))
    }

    #[test]
    fn counters_start_at_original_values() {
        let mut k = keeper();
        let v1 = k.allocate_vat_id("alice").unwrap();
        assert_eq!(v1, VatId(1));
        assert_eq!(k.add_kernel_object(v1).unwrap(), KernelSlot::object(20));
        assert_eq!(k.add_kernel_object(v1).unwrap(), KernelSlot::object(21));
        assert_eq!(
            k.add_kernel_promise(Decider::Kernel).unwrap(),
            KernelSlot::promise(40)
        );
        let (d1, kd) = k.allocate_device("timer").unwrap();
        assert_eq!(d1, DeviceId(1));
        assert_eq!(kd, KernelSlot::device(30));
        assert_eq!(k.device_owner(kd).unwrap(), d1);
        assert_eq!(k.device_slot(d1).unwrap(), kd);
    }

    #[test]
    fn names_resolve_to_ids() {
        let mut k = keeper();
        k.allocate_vat_id("alice").unwrap();
        k.allocate_vat_id("bob").unwrap();
        assert_eq!(k.vat_id("bob").unwrap(), Some(VatId(2)));
        assert_eq!(k.vat_id("carol").unwrap(), None);
        assert_eq!(k.vat_names().unwrap(), vec!["alice", "bob"]);
    }

    #[test]
    fn run_queue_is_fifo() {
        let mut k = keeper();
        let msg = |m: &str| Message::new(m, CapData::new("[]", vec![]), None);
        k.push_run_queue(RunQueueEntry::Send {
            target: KernelSlot::object(20),
            msg: msg("first"),
        })
        .unwrap();
        k.push_run_queue(RunQueueEntry::Notify {
            vat: VatId(1),
            kpid: KernelSlot::promise(40),
        })
        .unwrap();

        assert!(matches!(
            k.pop_run_queue().unwrap(),
            Some(RunQueueEntry::Send { .. })
        ));
        assert!(matches!(
            k.pop_run_queue().unwrap(),
            Some(RunQueueEntry::Notify { .. })
        ));
        assert_eq!(k.pop_run_queue().unwrap(), None);
    }

    #[test]
    fn popped_run_queue_entries_are_deleted() {
        let mut k = keeper();
        for n in 0..3 {
            k.push_run_queue(RunQueueEntry::Notify {
                vat: VatId(1),
                kpid: KernelSlot::promise(40 + n),
            })
            .unwrap();
        }
        k.pop_run_queue().unwrap();
        k.commit().unwrap();

        assert_eq!(k.run_queue_len().unwrap(), 2);
        assert!(k.get("runQueue.0").is_none());
        assert!(k.get("runQueue.2").is_some());
        assert_eq!(
            k.run_queue().unwrap().first(),
            Some(&RunQueueEntry::Notify {
                vat: VatId(1),
                kpid: KernelSlot::promise(41),
            })
        );
        // One entry per key: a push touches only its own key and the tail.
        assert_eq!(k.keys_with_prefix("runQueue.").len(), 4);
    }

    #[test]
    fn log_is_append_only() {
        let mut k = keeper();
        assert!(k.log_lines().unwrap().is_empty());
        assert_eq!(k.append_log("one").unwrap(), 0);
        assert_eq!(k.append_log("two").unwrap(), 1);
        assert_eq!(k.log_lines().unwrap(), vec!["one", "two"]);
        assert_eq!(k.get("log.1").as_deref(), Some("two"));
    }

    #[test]
    fn rollback_keeps_earlier_crank_state() {
        let mut k = keeper();
        let kept = k.add_kernel_object(VatId(1)).unwrap();
        let sp = k.savepoint();
        k.add_kernel_object(VatId(1)).unwrap();
        k.append_log("dropped").unwrap();
        k.rollback_to(sp);

        assert_eq!(k.kernel_objects().unwrap(), vec![(kept, VatId(1))]);
        assert!(k.log_lines().unwrap().is_empty());
        assert_eq!(k.add_kernel_object(VatId(1)).unwrap(), KernelSlot::object(21));
    }

    #[test]
    fn listings_sort_numerically() {
        let mut k = keeper();
        for _ in 0..85 {
            k.add_kernel_object(VatId(1)).unwrap();
        }
        let objects = k.kernel_objects().unwrap();
        assert_eq!(objects.first().unwrap().0, KernelSlot::object(20));
        assert_eq!(objects.last().unwrap().0, KernelSlot::object(104));
    }

    #[test]
    fn activity_hash_chains() {
        let mut k = keeper();
        k.finish_crank(1, b"a");
        let first = k.activity_hash();
        k.finish_crank(2, b"b");
        assert_ne!(first, k.activity_hash());
        assert_eq!(k.crank_number().unwrap(), 2);

        let mut other = keeper();
        other.finish_crank(1, b"a");
        assert_eq!(other.activity_hash(), first);
    }

    #[test]
    fn abort_discards_uncommitted_state() {
        let mut k = keeper();
        k.allocate_vat_id("alice").unwrap();
        k.commit().unwrap();
        k.add_kernel_object(VatId(1)).unwrap();
        k.abort();
        assert!(k.kernel_objects().unwrap().is_empty());
        assert_eq!(k.vat_id("alice").unwrap(), Some(VatId(1)));
    }
}
