//! Durable store for the raft record
//!
//! The core hands the store one opaque, already-encoded record and expects it
//! on disk before `save_raft_state` returns. [`FileStorage`] replaces the
//! record atomically (temp file, fsync, rename). Tests use an in-memory store
//! that survives a simulated restart by being cloned.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::Arc;
use std::sync::{Mutex, PoisonError};

use serde_derive::{Deserialize, Serialize};

use super::errors::{Error, Result};
use super::message::LogEntry;
use super::raft_log::RaftLog;

const STATE_FILE: &str = "raft_state";
const STATE_TMP_FILE: &str = "raft_state.tmp";
const HEADER_SIZE: usize = 8; // little-endian payload length

pub trait Storage: Send + Sync {
    fn save_raft_state(&self, state: &[u8]) -> io::Result<()>;

    /// `None` when nothing was ever saved
    fn read_raft_state(&self) -> io::Result<Option<Vec<u8>>>;

    /// Size in bytes of the last saved record
    fn raft_state_size(&self) -> u64;
}

/// Record layout: term, vote, snapshot index, log from the snapshot sentinel
/// onward, snapshot bytes
#[derive(Serialize)]
struct PersistedStateRef<'a> {
    term: u64,
    voted_for: Option<u64>,
    snapshot_index: u64,
    log: &'a [LogEntry],
    snapshot: &'a [u8],
}

#[derive(Debug, Deserialize)]
struct PersistedState {
    term: u64,
    voted_for: Option<u64>,
    snapshot_index: u64,
    log: Vec<LogEntry>,
    snapshot: Vec<u8>,
}

/// Decoded and validated durable state
#[derive(Debug)]
pub struct RestoredState {
    pub term: u64,
    pub voted_for: Option<u64>,
    pub log: RaftLog,
    pub snapshot: Vec<u8>,
}

pub fn encode_state(
    term: u64,
    voted_for: Option<u64>,
    log: &RaftLog,
    snapshot: &[u8],
) -> Result<Vec<u8>> {
    let record = PersistedStateRef {
        term,
        voted_for,
        snapshot_index: log.snapshot_index(),
        log: log.suffix(),
        snapshot,
    };
    Ok(bincode::serialize(&record)?)
}

pub fn decode_state(bytes: &[u8]) -> Result<RestoredState> {
    let record: PersistedState = bincode::deserialize(bytes)?;
    let log = RaftLog::from_parts(record.snapshot_index, record.log)?;
    if record.voted_for == Some(0) {
        return Err(Error::Corrupt("vote recorded for peer 0".to_string()));
    }
    Ok(RestoredState {
        term: record.term,
        voted_for: record.voted_for,
        log,
        snapshot: record.snapshot,
    })
}

/// File-backed store rooted at a directory
pub struct FileStorage {
    base_path: PathBuf,
    size: Mutex<u64>,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> io::Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        let storage = FileStorage {
            base_path,
            size: Mutex::new(0),
        };
        let size = storage
            .read_raft_state()?
            .map(|s| s.len() as u64)
            .unwrap_or(0);
        *storage.size.lock().unwrap_or_else(PoisonError::into_inner) = size;
        Ok(storage)
    }

    fn state_path(&self) -> PathBuf {
        self.base_path.join(STATE_FILE)
    }
}

impl Storage for FileStorage {
    fn save_raft_state(&self, state: &[u8]) -> io::Result<()> {
        let mut size = self.size.lock().unwrap_or_else(PoisonError::into_inner);
        let temp_path = self.base_path.join(STATE_TMP_FILE);

        // Write to temporary file first
        let mut file = File::create(&temp_path)?;
        file.write_all(&(state.len() as u64).to_le_bytes())?;
        file.write_all(state)?;
        file.sync_all()?;

        fs::rename(&temp_path, self.state_path())?;
        *size = state.len() as u64;
        Ok(())
    }

    fn read_raft_state(&self) -> io::Result<Option<Vec<u8>>> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let mut buf = Vec::new();
        File::open(&path)?.read_to_end(&mut buf)?;
        if buf.len() < HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "raft state file shorter than its header",
            ));
        }
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&buf[..HEADER_SIZE]);
        let len = u64::from_le_bytes(header) as usize;
        if buf.len() - HEADER_SIZE != len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "raft state file holds {} bytes, header says {}",
                    buf.len() - HEADER_SIZE,
                    len
                ),
            ));
        }
        buf.drain(..HEADER_SIZE);
        Ok(Some(buf))
    }

    fn raft_state_size(&self) -> u64 {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory store; clones share the same record
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MemStorage {
    state: Arc<Mutex<Option<Vec<u8>>>>,
}

#[cfg(test)]
impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl Storage for MemStorage {
    fn save_raft_state(&self, state: &[u8]) -> io::Result<()> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(state.to_vec());
        Ok(())
    }

    fn read_raft_state(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn raft_state_size(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.len() as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_log() -> RaftLog {
        let mut log = RaftLog::new();
        log.append(LogEntry::new(1, b"a".to_vec()));
        log.append(LogEntry::new(2, b"b".to_vec()));
        log.append(LogEntry::new(2, b"c".to_vec()));
        log
    }

    #[test]
    fn test_state_codec() {
        let mut log = sample_log();
        log.compact_to(2);
        let bytes = encode_state(7, Some(3), &log, b"snap").unwrap();
        let restored = decode_state(&bytes).unwrap();

        assert_eq!(restored.term, 7);
        assert_eq!(restored.voted_for, Some(3));
        assert_eq!(restored.log.snapshot_index(), 2);
        assert_eq!(restored.log.snapshot_term(), 2);
        assert_eq!(restored.log.last_index(), 3);
        assert_eq!(restored.log.entry(3).unwrap().command, b"c".to_vec());
        assert_eq!(restored.snapshot, b"snap".to_vec());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_state(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_decode_rejects_missing_sentinel() {
        let record = PersistedStateRef {
            term: 1,
            voted_for: None,
            snapshot_index: 5,
            log: &[],
            snapshot: &[],
        };
        let bytes = bincode::serialize(&record).unwrap();
        assert!(matches!(decode_state(&bytes), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_mem_storage_clones_share_state() {
        let storage = MemStorage::new();
        assert!(storage.read_raft_state().unwrap().is_none());
        assert_eq!(storage.raft_state_size(), 0);

        let restarted = storage.clone();
        storage.save_raft_state(b"record").unwrap();
        assert_eq!(restarted.read_raft_state().unwrap(), Some(b"record".to_vec()));
        assert_eq!(restarted.raft_state_size(), 6);
    }

    #[test]
    fn test_file_storage_survives_restart() {
        let dir = tempdir().unwrap();
        let bytes = encode_state(4, Some(1), &sample_log(), &[]).unwrap();
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            assert!(storage.read_raft_state().unwrap().is_none());
            storage.save_raft_state(&bytes).unwrap();
            assert_eq!(storage.raft_state_size(), bytes.len() as u64);
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.raft_state_size(), bytes.len() as u64);
        let restored = decode_state(&storage.read_raft_state().unwrap().unwrap()).unwrap();
        assert_eq!(restored.term, 4);
        assert_eq!(restored.log.last_index(), 3);
    }

    #[test]
    fn test_file_storage_detects_truncated_record() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        storage.save_raft_state(b"0123456789").unwrap();

        let path = dir.path().join(STATE_FILE);
        let full = fs::read(&path).unwrap();
        fs::write(&path, &full[..full.len() - 3]).unwrap();

        let err = storage.read_raft_state().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
