use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::HostStorage;

/// Journal magic bytes: "CKJL" (capkernel journal)
const JOURNAL_MAGIC: [u8; 4] = [b'C', b'K', b'J', b'L'];
/// Current journal format version
const JOURNAL_VERSION: u16 = 1;
/// Segment header size: magic(4) + version(2) + reserved(2) = 8
const SEGMENT_HEADER_SIZE: usize = 8;
/// Record overhead: length(4) + sequence(8) + crc32(4) = 16
const RECORD_OVERHEAD: usize = 16;

/// When the journal calls `fsync`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// fsync after every commit
    #[default]
    Immediate,
    /// fsync every `batch_size` commits
    Batched,
    /// No explicit fsync, relies on the OS
    OsManaged,
}

/// Journal configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Segment size that triggers rotation (default: 64MB)
    pub max_segment_size: u64,
    pub sync_mode: SyncMode,
    /// Commits per fsync in batched mode
    pub batch_size: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            max_segment_size: 64 * 1024 * 1024,
            sync_mode: SyncMode::Immediate,
            batch_size: 64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentMeta {
    pub id: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub size_bytes: u64,
    pub record_count: u64,
}

/// Result of [`JournalStore::verify`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub total_records: u64,
    pub verified_records: u64,
    pub corrupted_records: u64,
    /// `(segment id, byte offset)` of every bad record
    pub corrupted_offsets: Vec<(u64, u64)>,
    pub segments_checked: u32,
    /// Bytes at the end of the last segment that do not form a record.
    pub torn_tail_bytes: u64,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.corrupted_records == 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum JournalOp {
    Set { key: String, value: String },
    Delete { key: String },
    Transcript { stream: String, entry: String },
}

/// Durable [`HostStorage`] backed by a directory of journal segments.
///
/// The full state is held in memory. Every write is also recorded as an
/// op; `commit` appends all ops since the previous commit as one record, so
/// a commit is all-or-nothing on disk.
///
/// Segment format: `[magic:4][version:2][reserved:2][records...]`
/// Record format:  `[length:4][sequence:8][ops_json:N][crc32:4]`
pub struct JournalStore {
    dir: PathBuf,
    config: JournalConfig,
    kv: BTreeMap<String, String>,
    transcripts: BTreeMap<String, Vec<String>>,
    pending: Vec<JournalOp>,
    writer: Option<BufWriter<File>>,
    segments: Vec<SegmentMeta>,
    sequence: u64,
    unsynced_commits: usize,
}

impl JournalStore {
    /// Open or create a journal in `dir`, replaying every committed record.
    ///
    /// A torn record at the end of the newest segment (a crash in the
    /// middle of a commit) is cut off. Damage anywhere else is an error.
    pub fn open(dir: impl Into<PathBuf>, config: JournalConfig) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut store = Self {
            dir,
            config,
            kv: BTreeMap::new(),
            transcripts: BTreeMap::new(),
            pending: Vec::new(),
            writer: None,
            segments: Vec::new(),
            sequence: 0,
            unsynced_commits: 0,
        };

        let ids = list_segments(&store.dir)?;
        for (i, &id) in ids.iter().enumerate() {
            let is_last = i + 1 == ids.len();
            store.load_segment(id, is_last)?;
        }

        let reusable = store
            .segments
            .last()
            .filter(|s| s.size_bytes < store.config.max_segment_size)
            .map(|s| s.id);
        let writer = match reusable {
            Some(id) => append_segment(&store.dir, id)?,
            None => {
                let new_id = store.segments.last().map_or(1, |s| s.id + 1);
                store.push_segment(new_id);
                create_segment(&store.dir, new_id)?
            }
        };
        store.writer = Some(writer);

        info!(
            dir = %store.dir.display(),
            segments = store.segments.len(),
            sequence = store.sequence,
            keys = store.kv.len(),
            "Journal opened"
        );
        Ok(store)
    }

    /// Open a journal that must already exist. Nothing is created when
    /// `dir` holds no segments.
    pub fn open_existing(dir: impl Into<PathBuf>, config: JournalConfig) -> Result<Self, StoreError> {
        let dir = dir.into();
        if list_segments(&dir)?.is_empty() {
            return Err(StoreError::NotFound(dir));
        }
        Self::open(dir, config)
    }

    /// Scan every segment in `dir` without opening it for writing.
    pub fn verify(dir: &Path) -> Result<IntegrityReport, StoreError> {
        let mut report = IntegrityReport::default();
        let ids = list_segments(dir)?;
        if ids.is_empty() {
            return Err(StoreError::NotFound(dir.to_path_buf()));
        }
        for (i, &id) in ids.iter().enumerate() {
            report.segments_checked += 1;
            let bytes = fs::read(segment_path(dir, id))?;
            if bytes.len() < SEGMENT_HEADER_SIZE || bytes[..4] != JOURNAL_MAGIC {
                report.corrupted_records += 1;
                report.corrupted_offsets.push((id, 0));
                continue;
            }
            let scan = scan_records(&bytes);
            for record in &scan.records {
                report.total_records += 1;
                let valid = record.crc_ok
                    && serde_json::from_slice::<Vec<JournalOp>>(&record.payload).is_ok();
                if valid {
                    report.verified_records += 1;
                } else {
                    report.corrupted_records += 1;
                    report.corrupted_offsets.push((id, record.offset));
                }
            }
            if let Some(offset) = scan.torn_at {
                if i + 1 == ids.len() {
                    report.torn_tail_bytes = bytes.len() as u64 - offset;
                } else {
                    report.corrupted_records += 1;
                    report.corrupted_offsets.push((id, offset));
                }
            }
        }
        Ok(report)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Sequence number of the last committed record.
    pub fn latest_sequence(&self) -> u64 {
        self.sequence
    }

    pub fn segments(&self) -> &[SegmentMeta] {
        &self.segments
    }

    /// Force everything written so far to disk.
    pub fn sync(&mut self) -> Result<(), StoreError> {
        let writer = self.writer.as_mut().ok_or(StoreError::Closed)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        self.unsynced_commits = 0;
        Ok(())
    }

    fn load_segment(&mut self, id: u64, is_last: bool) -> Result<(), StoreError> {
        let path = segment_path(&self.dir, id);
        let bytes = fs::read(&path)?;

        if bytes.len() < SEGMENT_HEADER_SIZE {
            if is_last {
                warn!(segment_id = id, "Removing segment with torn header");
                fs::remove_file(&path)?;
                return Ok(());
            }
            return Err(StoreError::Corruption {
                offset: 0,
                reason: format!("segment {id} shorter than its header"),
            });
        }
        if bytes[..4] != JOURNAL_MAGIC {
            return Err(StoreError::Corruption {
                offset: 0,
                reason: format!("segment {id} has bad magic"),
            });
        }

        self.push_segment(id);
        let scan = scan_records(&bytes);
        let record_count = scan.records.len();
        let mut valid_end = SEGMENT_HEADER_SIZE as u64;

        for (n, record) in scan.records.into_iter().enumerate() {
            let is_tail = is_last && n + 1 == record_count && scan.torn_at.is_none();
            if !record.crc_ok {
                if is_tail {
                    warn!(segment_id = id, offset = record.offset, "CRC mismatch on final record, truncating");
                    break;
                }
                return Err(StoreError::Corruption {
                    offset: record.offset,
                    reason: format!("CRC mismatch in segment {id}"),
                });
            }
            if record.sequence != self.sequence + 1 {
                return Err(StoreError::Corruption {
                    offset: record.offset,
                    reason: format!(
                        "sequence {} follows {} in segment {id}",
                        record.sequence, self.sequence
                    ),
                });
            }
            let ops: Vec<JournalOp> =
                serde_json::from_slice(&record.payload).map_err(|e| StoreError::Corruption {
                    offset: record.offset,
                    reason: e.to_string(),
                })?;
            self.apply(ops);
            self.sequence = record.sequence;
            valid_end = record.end;
            self.note_record(record.sequence, valid_end);
        }

        if valid_end < bytes.len() as u64 {
            if !is_last {
                return Err(StoreError::Corruption {
                    offset: valid_end,
                    reason: format!("segment {id} has trailing garbage"),
                });
            }
            warn!(
                segment_id = id,
                offset = valid_end,
                dropped_bytes = bytes.len() as u64 - valid_end,
                "Truncating torn journal tail"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(valid_end)?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn apply(&mut self, ops: Vec<JournalOp>) {
        for op in ops {
            match op {
                JournalOp::Set { key, value } => {
                    self.kv.insert(key, value);
                }
                JournalOp::Delete { key } => {
                    self.kv.remove(&key);
                }
                JournalOp::Transcript { stream, entry } => {
                    self.transcripts.entry(stream).or_default().push(entry);
                }
            }
        }
    }

    fn push_segment(&mut self, id: u64) {
        self.segments.push(SegmentMeta {
            id,
            first_sequence: self.sequence + 1,
            last_sequence: self.sequence,
            size_bytes: SEGMENT_HEADER_SIZE as u64,
            record_count: 0,
        });
    }

    fn note_record(&mut self, sequence: u64, size_bytes: u64) {
        if let Some(last) = self.segments.last_mut() {
            last.last_sequence = sequence;
            last.size_bytes = size_bytes;
            last.record_count += 1;
        }
    }

    fn write_record(&mut self, record: &[u8]) -> Result<(), StoreError> {
        let writer = self.writer.as_mut().ok_or(StoreError::Closed)?;
        writer.write_all(record)?;
        writer.flush()?;
        match self.config.sync_mode {
            SyncMode::Immediate => writer.get_ref().sync_data()?,
            SyncMode::Batched => {
                self.unsynced_commits += 1;
                if self.unsynced_commits >= self.config.batch_size.max(1) {
                    writer.get_ref().sync_data()?;
                    self.unsynced_commits = 0;
                }
            }
            SyncMode::OsManaged => {}
        }
        Ok(())
    }

    fn rotate_segment(&mut self) -> Result<(), StoreError> {
        self.sync()?;
        let new_id = self.segments.last().map_or(1, |s| s.id + 1);
        self.writer = Some(create_segment(&self.dir, new_id)?);
        self.push_segment(new_id);
        info!(segment_id = new_id, "Journal segment rotated");
        Ok(())
    }
}

impl HostStorage for JournalStore {
    fn get(&self, key: &str) -> Option<String> {
        self.kv.get(key).cloned()
    }

    fn has(&self, key: &str) -> bool {
        self.kv.contains_key(key)
    }

    fn set(&mut self, key: &str, value: &str) {
        self.kv.insert(key.to_string(), value.to_string());
        self.pending.push(JournalOp::Set {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    fn delete(&mut self, key: &str) {
        self.kv.remove(key);
        self.pending.push(JournalOp::Delete {
            key: key.to_string(),
        });
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
        self.pending.push(JournalOp::Transcript {
            stream: stream.to_string(),
            entry: entry.to_string(),
        });
        entries.len() as u64 - 1
    }

    fn read_transcript(&self, stream: &str) -> Vec<String> {
        self.transcripts.get(stream).cloned().unwrap_or_default()
    }

    fn transcript_len(&self, stream: &str) -> u64 {
        self.transcripts.get(stream).map_or(0, |t| t.len() as u64)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if self.writer.is_none() {
            return Err(StoreError::Closed);
        }
        if self.pending.is_empty() {
            return Ok(());
        }

        let payload = serde_json::to_vec(&self.pending)?;
        let sequence = self.sequence + 1;
        let record = encode_record(sequence, &payload);

        if let Err(e) = self.write_record(&record) {
            // The segment tail is now unknown; refuse further commits.
            self.writer = None;
            return Err(e);
        }

        let ops = self.pending.len();
        self.pending.clear();
        self.sequence = sequence;
        let size = self.segments.last().map_or(0, |s| s.size_bytes) + record.len() as u64;
        self.note_record(sequence, size);
        debug!(sequence, ops, bytes = record.len(), "Journal commit");

        if size >= self.config.max_segment_size {
            self.rotate_segment()?;
        }
        Ok(())
    }
}

struct RawRecord {
    offset: u64,
    end: u64,
    sequence: u64,
    payload: Vec<u8>,
    crc_ok: bool,
}

struct RecordScan {
    records: Vec<RawRecord>,
    /// Offset of a trailing partial record, if any.
    torn_at: Option<u64>,
}

fn scan_records(bytes: &[u8]) -> RecordScan {
    let mut records = Vec::new();
    let mut pos = SEGMENT_HEADER_SIZE;
    let mut torn_at = None;

    while pos < bytes.len() {
        if bytes.len() - pos < RECORD_OVERHEAD {
            torn_at = Some(pos as u64);
            break;
        }
        let length = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
            as usize;
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&bytes[pos + 4..pos + 12]);
        let sequence = u64::from_le_bytes(seq);

        let payload_start = pos + 12;
        let end = payload_start + length + 4;
        if length == 0 || end > bytes.len() {
            torn_at = Some(pos as u64);
            break;
        }
        let payload = &bytes[payload_start..payload_start + length];
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&bytes[end - 4..end]);
        let stored_crc = u32::from_le_bytes(crc);

        records.push(RawRecord {
            offset: pos as u64,
            end: end as u64,
            sequence,
            payload: payload.to_vec(),
            crc_ok: crc32fast::hash(payload) == stored_crc,
        });
        pos = end;
    }

    RecordScan { records, torn_at }
}

fn encode_record(sequence: u64, payload: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(RECORD_OVERHEAD + payload.len());
    record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    record.extend_from_slice(&sequence.to_le_bytes());
    record.extend_from_slice(payload);
    record.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    record
}

fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("journal-{:016x}.seg", segment_id))
}

fn list_segments(dir: &Path) -> Result<Vec<u64>, StoreError> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(hex) = name
            .strip_prefix("journal-")
            .and_then(|s| s.strip_suffix(".seg"))
        {
            if let Ok(id) = u64::from_str_radix(hex, 16) {
                segments.push(id);
            }
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

fn create_segment(dir: &Path, segment_id: u64) -> Result<BufWriter<File>, StoreError> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(segment_path(dir, segment_id))?;
    let mut writer = BufWriter::new(file);
    let mut header = [0u8; SEGMENT_HEADER_SIZE];
    header[..4].copy_from_slice(&JOURNAL_MAGIC);
    header[4..6].copy_from_slice(&JOURNAL_VERSION.to_le_bytes());
    // bytes 6..8 reserved
    writer.write_all(&header)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(writer)
}

fn append_segment(dir: &Path, segment_id: u64) -> Result<BufWriter<File>, StoreError> {
    let file = OpenOptions::new()
        .append(true)
        .open(segment_path(dir, segment_id))?;
    Ok(BufWriter::new(file))
}
