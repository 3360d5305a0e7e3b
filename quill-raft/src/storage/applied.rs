//! Durable applied-index store.
//!
//! A single big-endian u64 in `quorum-raft-state/applied-index`, rewritten
//! atomically (write-temp-then-rename) after every applied entry. On
//! startup the Raft node is configured with this value so committed entries
//! at or below it are not redelivered.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};

use crate::error::{RaftError, RaftResult};

const FILE_NAME: &str = "applied-index";

/// The applied-index store.
pub struct AppliedIndexStore {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl AppliedIndexStore {
    /// Open (creating the directory if needed).
    pub fn open(dir: &Path) -> RaftResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(AppliedIndexStore {
            path: dir.join(FILE_NAME),
            tmp_path: dir.join(format!("{FILE_NAME}.tmp")),
        })
    }

    /// The last durably recorded applied index; 0 if none was ever written.
    pub fn load(&self) -> RaftResult<u64> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        if data.len() != 8 {
            return Err(RaftError::Corrupt(format!(
                "applied-index file holds {} bytes, expected 8",
                data.len()
            )));
        }
        Ok(BigEndian::read_u64(&data))
    }

    /// Durably record `index`.
    pub fn write(&self, index: u64) -> RaftResult<()> {
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, index);

        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.tmp_path)?;
        tmp.write_all(&buf)?;
        tmp.sync_data()?;
        drop(tmp);

        fs::rename(&self.tmp_path, &self.path)?;
        if let Some(dir) = self.path.parent() {
            // Make the rename itself durable.
            File::open(dir)?.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_reads_as_zero() {
        let dir = TempDir::new().unwrap();
        let store = AppliedIndexStore::open(dir.path()).unwrap();
        assert_eq!(store.load().unwrap(), 0);
    }

    #[test]
    fn write_then_load() {
        let dir = TempDir::new().unwrap();
        let store = AppliedIndexStore::open(dir.path()).unwrap();

        store.write(42).unwrap();
        assert_eq!(store.load().unwrap(), 42);

        store.write(43).unwrap();
        assert_eq!(store.load().unwrap(), 43);

        // Survives reopening.
        let store = AppliedIndexStore::open(dir.path()).unwrap();
        assert_eq!(store.load().unwrap(), 43);
    }

    #[test]
    fn value_is_big_endian_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = AppliedIndexStore::open(dir.path()).unwrap();
        store.write(0x0102_0304_0506_0708).unwrap();

        let raw = fs::read(dir.path().join(FILE_NAME)).unwrap();
        assert_eq!(raw, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = AppliedIndexStore::open(dir.path()).unwrap();
        fs::write(dir.path().join(FILE_NAME), [1, 2, 3]).unwrap();
        assert!(matches!(store.load(), Err(RaftError::Corrupt(_))));
    }
}
