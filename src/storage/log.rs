//! Append-only event log.
//!
//! Every mutation of the store is framed and appended here before it is
//! applied to the in-memory index. On open the log is replayed to rebuild
//! the index.

use crate::error::{Result, StoreError};
use crate::types::{BucketMetadata, Event};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes for log entries.
const LOG_MAGIC: &[u8; 4] = b"HBL\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Entry header size: magic + version + flags + payload length.
const ENTRY_HEADER_SIZE: usize = 4 + 1 + 1 + 4;

/// Entry trailer size: crc32 of the payload.
const ENTRY_TRAILER_SIZE: usize = 4;

/// A single logged mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LogEntry {
    CreateBucket(BucketMetadata),
    DeleteBucket { bucket_id: String },
    InsertEvent { bucket_id: String, event: Event },
    ReplaceEvent { bucket_id: String, event: Event },
}

struct LogWriter {
    file: File,
    size: u64,
    writes_since_sync: u64,
}

/// Append-only log of store mutations.
pub struct EventLog {
    /// Path to the log file.
    path: PathBuf,

    /// Write handle plus bookkeeping.
    writer: Mutex<LogWriter>,

    /// Sync every N writes.
    sync_interval: u64,
}

impl EventLog {
    /// Default sync interval.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 100;

    /// Open or create a log with the default sync interval.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a log, syncing to disk every `sync_interval` writes.
    /// An interval of 0 behaves like 1.
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path,
            writer: Mutex::new(LogWriter {
                file,
                size,
                writes_since_sync: 0,
            }),
            sync_interval: sync_interval.max(1),
        })
    }

    /// Append an entry, returning the offset it was written at.
    pub fn append(&self, entry: &LogEntry) -> Result<u64> {
        let payload = rmp_serde::to_vec_named(entry)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| StoreError::InvalidOperation("log entry too large".into()))?;

        let mut buf = Vec::with_capacity(ENTRY_HEADER_SIZE + payload.len() + ENTRY_TRAILER_SIZE);
        buf.extend_from_slice(LOG_MAGIC);
        buf.push(LOG_VERSION);
        buf.push(0u8); // flags (reserved)
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());

        let mut writer = self.writer.lock();
        let offset = writer.size;
        writer.file.seek(SeekFrom::Start(offset))?;
        writer.file.write_all(&buf)?;
        writer.size = offset + buf.len() as u64;

        writer.writes_since_sync += 1;
        if writer.writes_since_sync >= self.sync_interval {
            writer.file.sync_all()?;
            writer.writes_since_sync = 0;
        }

        Ok(offset)
    }

    /// Read every entry from the start of the log.
    ///
    /// A partially written final entry is truncated away so that later
    /// appends start on an entry boundary.
    pub fn replay(&self) -> Result<Vec<(u64, LogEntry)>> {
        let mut writer = self.writer.lock();
        let size = writer.size;

        let mut reader = BufReader::new(writer.file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut entries = Vec::new();
        let mut offset = 0u64;
        while offset < size {
            match read_entry(&mut reader)? {
                Some((entry, len)) => {
                    entries.push((offset, entry));
                    offset += len;
                }
                None => {
                    warn!(
                        path = %self.path.display(),
                        offset,
                        dropped_bytes = size - offset,
                        "truncating torn entry at end of log"
                    );
                    writer.file.set_len(offset)?;
                    writer.file.sync_all()?;
                    writer.size = offset;
                    break;
                }
            }
        }

        Ok(entries)
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.file.sync_all()?;
        writer.writes_since_sync = 0;
        Ok(())
    }

    /// Current log size in bytes.
    pub fn size(&self) -> u64 {
        self.writer.lock().size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read one entry. `Ok(None)` means the log ended mid-entry.
fn read_entry(reader: &mut impl Read) -> Result<Option<(LogEntry, u64)>> {
    let mut header = [0u8; ENTRY_HEADER_SIZE];
    if !read_full(reader, &mut header)? {
        return Ok(None);
    }

    if &header[0..4] != LOG_MAGIC {
        return Err(StoreError::Corruption("Invalid log entry magic".into()));
    }
    if header[4] != LOG_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported log version: {}",
            header[4]
        )));
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[6..10]);
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }

    let mut checksum_bytes = [0u8; ENTRY_TRAILER_SIZE];
    if !read_full(reader, &mut checksum_bytes)? {
        return Ok(None);
    }
    let stored_checksum = u32::from_le_bytes(checksum_bytes);
    let computed_checksum = crc32fast::hash(&payload);
    if stored_checksum != computed_checksum {
        return Err(StoreError::ChecksumMismatch {
            expected: stored_checksum,
            got: computed_checksum,
        });
    }

    let entry: LogEntry = rmp_serde::from_slice(&payload)?;
    Ok(Some((
        entry,
        (ENTRY_HEADER_SIZE + len + ENTRY_TRAILER_SIZE) as u64,
    )))
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}
