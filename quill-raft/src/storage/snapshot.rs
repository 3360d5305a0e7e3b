//! Snapshot persistence.
//!
//! A snapshot is the Raft library's `Snapshot` protobuf: the metadata holds
//! the conf state, index and term; the data holds a [`SnapshotPayload`] with
//! the peer address book and the tombstone set, so a restarted (or freshly
//! joined) node can re-establish connections before its Raft node starts.
//!
//! Each snapshot is one file, `<term>-<index>.snap`, a CRC-framed protobuf
//! blob written via temp-file-then-rename. `load_latest` walks candidates
//! newest-first and skips damaged files.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use prost::Message as _;
use raft::eraftpb::Snapshot;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::address::{Address, RaftId};
use crate::error::{RaftError, RaftResult};

/// Membership state carried in snapshot data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    /// Addresses of every conf-state member, self included.
    pub addresses: Vec<Address>,
    /// Permanently removed Raft IDs.
    pub removed: Vec<RaftId>,
}

impl SnapshotPayload {
    /// Serialize for embedding as `Snapshot.data`.
    pub fn to_bytes(&self) -> RaftResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RaftError::Codec(e.to_string()))
    }

    /// Inverse of [`SnapshotPayload::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> RaftResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| RaftError::Codec(e.to_string()))
    }
}

/// The snapshot directory.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Open (creating the directory if needed).
    pub fn open(dir: &Path) -> RaftResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(SnapshotStore {
            dir: dir.to_path_buf(),
        })
    }

    /// Durably persist a snapshot.
    pub fn save(&self, snapshot: &Snapshot) -> RaftResult<()> {
        let meta = snapshot.get_metadata();
        let name = format!("{:016x}-{:016x}.snap", meta.term, meta.index);
        let path = self.dir.join(&name);
        let tmp_path = self.dir.join(format!("{name}.tmp"));

        let payload = snapshot.encode_to_vec();
        let mut header = [0u8; 8];
        LittleEndian::write_u32(&mut header[0..4], payload.len() as u32);
        LittleEndian::write_u32(&mut header[4..8], crc32fast::hash(&payload));

        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(&header)?;
        tmp.write_all(&payload)?;
        tmp.sync_data()?;
        drop(tmp);

        fs::rename(&tmp_path, &path)?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    /// Load the newest readable snapshot, or `None` if the directory holds
    /// no usable one.
    pub fn load_latest(&self) -> RaftResult<Option<Snapshot>> {
        let mut names: Vec<String> = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let name = dirent?.file_name().to_string_lossy().into_owned();
            if name.ends_with(".snap") {
                names.push(name);
            }
        }
        // `<term>-<index>` zero-padded hex sorts chronologically.
        names.sort();

        for name in names.iter().rev() {
            match self.read_file(&self.dir.join(name)) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => {
                    warn!(file = %name, error = %e, "skipping unreadable snapshot");
                }
            }
        }
        Ok(None)
    }

    fn read_file(&self, path: &Path) -> RaftResult<Snapshot> {
        let data = fs::read(path)?;
        if data.len() < 8 {
            return Err(RaftError::Corrupt("snapshot file too short".into()));
        }
        let payload_len = LittleEndian::read_u32(&data[0..4]) as usize;
        let stored_crc = LittleEndian::read_u32(&data[4..8]);
        if data.len() < 8 + payload_len {
            return Err(RaftError::Corrupt("snapshot file truncated".into()));
        }
        let payload = &data[8..8 + payload_len];
        if crc32fast::hash(payload) != stored_crc {
            return Err(RaftError::Corrupt("snapshot checksum mismatch".into()));
        }
        Ok(Snapshot::decode(payload)?)
    }
}
