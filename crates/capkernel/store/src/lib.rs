//! Host storage for the capkernel.
//!
//! The kernel keeps all of its durable state (CLists, promise table,
//! run-queue, counters) as string keys and values, plus one append-only
//! transcript stream per vat. Nothing is durable until [`HostStorage::commit`]
//! returns.
//!
//! - [`MemoryStore`]: everything in memory, for tests and embedding.
//! - [`JournalStore`]: a segmented, CRC-checked journal on disk.
//! - [`CrankBuffer`]: stages one crank's writes so they can be dropped.

pub mod buffer;
pub mod error;
pub mod journal;
pub mod memory;

pub use buffer::{CrankBuffer, Savepoint};
pub use error::StoreError;
pub use journal::{IntegrityReport, JournalConfig, JournalStore, SegmentMeta, SyncMode};
pub use memory::MemoryStore;

/// The key-value and transcript contract the kernel stores its state in.
pub trait HostStorage {
    fn get(&self, key: &str) -> Option<String>;

    fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn set(&mut self, key: &str, value: &str);

    fn delete(&mut self, key: &str);

    /// All keys starting with `prefix`, in ascending order.
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;

    /// Append an entry to a transcript stream, returning its index.
    fn append_transcript(&mut self, stream: &str, entry: &str) -> u64;

    fn read_transcript(&self, stream: &str) -> Vec<String>;

    fn transcript_len(&self, stream: &str) -> u64 {
        self.read_transcript(stream).len() as u64
    }

    /// Make every write so far durable.
    fn commit(&mut self) -> Result<(), StoreError>;
}

impl<T: HostStorage + ?Sized> HostStorage for Box<T> {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn has(&self, key: &str) -> bool {
        (**self).has(key)
    }

    fn set(&mut self, key: &str, value: &str) {
        (**self).set(key, value)
    }

    fn delete(&mut self, key: &str) {
        (**self).delete(key)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        (**self).keys_with_prefix(prefix)
    }

    fn append_transcript(&mut self, stream: &str, entry: &str) -> u64 {
        (**self).append_transcript(stream, entry)
    }

    fn read_transcript(&self, stream: &str) -> Vec<String> {
        (**self).read_transcript(stream)
    }

    fn transcript_len(&self, stream: &str) -> u64 {
        (**self).transcript_len(stream)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        (**self).commit()
    }
}
