//! Raft write-ahead log.
//!
//! Append-only segmented log of everything the Raft library asks us to
//! persist: log entries and the hard state. Each record is a framed,
//! checksummed blob:
//!
//! ```text
//! ┌──────────────┬────────┬────────┬─────────────────────┐
//! │ payload len  │ CRC32  │ kind   │ payload (protobuf)  │
//! │ (4 B, LE)    │ (4 B)  │ (1 B)  │ (var)               │
//! └──────────────┴────────┴────────┴─────────────────────┘
//! ```
//!
//! Replay walks the segments in order and rebuilds the entry window with
//! Raft overwrite semantics: an entry record at index `i` supersedes any
//! buffered entry with index ≥ `i` (a new leader may rewrite an uncommitted
//! tail). A torn or checksum-failing record at the tail of the *last*
//! segment is the normal artifact of a crash mid-append and marks the end of
//! the log; damage anywhere else is unrecoverable corruption.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use prost::Message as _;
use raft::eraftpb::{Entry, HardState};
use tracing::{debug, info, warn};

use crate::error::{RaftError, RaftResult};

/// Frame header: payload length + CRC32 + kind byte.
const FRAME_HEADER: usize = 4 + 4 + 1;

/// Rotate the active segment once it exceeds this size.
const SEGMENT_MAX_BYTES: u64 = 16 * 1024 * 1024;

/// Guard against absurd length fields when scanning damaged files.
const MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

const KIND_ENTRY: u8 = 1;
const KIND_HARD_STATE: u8 = 2;

/// State recovered from the log on open.
#[derive(Debug, Default)]
pub struct WalReplay {
    /// The last hard state written, if any.
    pub hard_state: Option<HardState>,
    /// The surviving entry window, contiguous and ascending.
    pub entries: Vec<Entry>,
}

/// The write-ahead log.
pub struct RaftWal {
    dir: PathBuf,
    file: BufWriter<File>,
    segment_seq: u64,
    segment_bytes: u64,
}

impl RaftWal {
    /// Whether a log already exists under `dir`. Decides restart vs
    /// bootstrap/join.
    pub fn exists(dir: &Path) -> bool {
        segment_paths(dir).map(|s| !s.is_empty()).unwrap_or(false)
    }

    /// Open the log, replaying whatever is already on disk.
    pub fn open(dir: &Path) -> RaftResult<(Self, WalReplay)> {
        fs::create_dir_all(dir)?;

        let segments = segment_paths(dir)?;
        let mut replay = WalReplay::default();

        for (i, (seq, path)) in segments.iter().enumerate() {
            let is_last = i + 1 == segments.len();
            let data = fs::read(path)?;
            let valid_len = scan_segment(&data, &mut replay).map_err(|e| {
                RaftError::Corrupt(format!("wal segment {}: {e}", path.display()))
            })?;

            if (valid_len as u64) < data.len() as u64 {
                if !is_last {
                    return Err(RaftError::Corrupt(format!(
                        "wal segment {} is damaged mid-log",
                        path.display()
                    )));
                }
                warn!(
                    segment = seq,
                    dropped = data.len() - valid_len,
                    "truncating torn record at wal tail"
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(valid_len as u64)?;
                file.sync_data()?;
            }
        }

        let (segment_seq, path, fresh) = match segments.last() {
            Some((seq, path)) => (*seq, path.clone(), false),
            None => (1, segment_path(dir, 1), true),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let segment_bytes = file.metadata()?.len();

        if fresh {
            info!(dir = %dir.display(), "created new raft wal");
        } else {
            debug!(
                dir = %dir.display(),
                entries = replay.entries.len(),
                segments = segments.len(),
                "replayed raft wal"
            );
        }

        Ok((
            RaftWal {
                dir: dir.to_path_buf(),
                file: BufWriter::new(file),
                segment_seq,
                segment_bytes,
            },
            replay,
        ))
    }

    /// Durably append entries and, if present, the hard state. Returns only
    /// after the data is synced; the driver must not ship or apply anything
    /// that is not yet on disk.
    pub fn save(&mut self, hard_state: Option<&HardState>, entries: &[Entry]) -> RaftResult<()> {
        if hard_state.is_none() && entries.is_empty() {
            return Ok(());
        }

        self.maybe_rotate()?;

        for entry in entries {
            self.write_frame(KIND_ENTRY, &entry.encode_to_vec())?;
        }
        if let Some(hs) = hard_state {
            self.write_frame(KIND_HARD_STATE, &hs.encode_to_vec())?;
        }

        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }

    fn write_frame(&mut self, kind: u8, payload: &[u8]) -> RaftResult<()> {
        let mut header = [0u8; FRAME_HEADER];
        LittleEndian::write_u32(&mut header[0..4], payload.len() as u32);
        LittleEndian::write_u32(&mut header[4..8], crc32fast::hash(payload));
        header[8] = kind;

        self.file.write_all(&header)?;
        self.file.write_all(payload)?;
        self.segment_bytes += (FRAME_HEADER + payload.len()) as u64;
        Ok(())
    }

    fn maybe_rotate(&mut self) -> RaftResult<()> {
        if self.segment_bytes < SEGMENT_MAX_BYTES {
            return Ok(());
        }

        self.file.flush()?;
        self.file.get_ref().sync_data()?;

        self.segment_seq += 1;
        let path = segment_path(&self.dir, self.segment_seq);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.file = BufWriter::new(file);
        self.segment_bytes = 0;

        debug!(segment = self.segment_seq, "rotated wal segment");
        Ok(())
    }
}

/// Parse one segment into `replay`, returning the length of the valid
/// prefix. A cleanly parsed file returns its full length.
fn scan_segment(data: &[u8], replay: &mut WalReplay) -> RaftResult<usize> {
    let mut offset = 0;

    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() < FRAME_HEADER {
            return Ok(offset); // torn header
        }

        let payload_len = LittleEndian::read_u32(&rest[0..4]);
        if payload_len > MAX_PAYLOAD {
            return Ok(offset); // garbage length field
        }
        let stored_crc = LittleEndian::read_u32(&rest[4..8]);
        let kind = rest[8];

        let frame_len = FRAME_HEADER + payload_len as usize;
        if rest.len() < frame_len {
            return Ok(offset); // torn payload
        }

        let payload = &rest[FRAME_HEADER..frame_len];
        if crc32fast::hash(payload) != stored_crc {
            return Ok(offset); // bit rot or torn rewrite
        }

        match kind {
            KIND_ENTRY => {
                let entry = Entry::decode(payload)
                    .map_err(|e| RaftError::Corrupt(format!("undecodable entry: {e}")))?;
                // A rewrite at index i supersedes everything from i on.
                while replay
                    .entries
                    .last()
                    .map(|last| last.index >= entry.index)
                    .unwrap_or(false)
                {
                    replay.entries.pop();
                }
                replay.entries.push(entry);
            }
            KIND_HARD_STATE => {
                let hs = HardState::decode(payload)
                    .map_err(|e| RaftError::Corrupt(format!("undecodable hard state: {e}")))?;
                replay.hard_state = Some(hs);
            }
            other => {
                return Err(RaftError::Corrupt(format!("unknown record kind {other}")));
            }
        }

        offset += frame_len;
    }

    Ok(offset)
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("wal-{seq:012}.log"))
}

/// All segment files under `dir`, ordered by sequence number.
fn segment_paths(dir: &Path) -> RaftResult<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(segments),
        Err(e) => return Err(e.into()),
    };

    for dirent in read {
        let dirent = dirent?;
        let name = dirent.file_name();
        let name = name.to_string_lossy();
        if let Some(seq) = name
            .strip_prefix("wal-")
            .and_then(|s| s.strip_suffix(".log"))
            .and_then(|s| s.parse::<u64>().ok())
        {
            segments.push((seq, dirent.path()));
        }
    }

    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft::eraftpb::EntryType;
    use tempfile::TempDir;

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut e = Entry::default();
        e.set_entry_type(EntryType::EntryNormal);
        e.index = index;
        e.term = term;
        e.data = data.to_vec().into();
        e
    }

    fn hard_state(term: u64, vote: u64, commit: u64) -> HardState {
        let mut hs = HardState::default();
        hs.term = term;
        hs.vote = vote;
        hs.commit = commit;
        hs
    }

    #[test]
    fn save_and_replay() {
        let dir = TempDir::new().unwrap();

        {
            let (mut wal, replay) = RaftWal::open(dir.path()).unwrap();
            assert!(replay.entries.is_empty());
            wal.save(
                Some(&hard_state(1, 1, 2)),
                &[entry(1, 1, b"a"), entry(2, 1, b"b")],
            )
            .unwrap();
            wal.save(None, &[entry(3, 1, b"c")]).unwrap();
        }

        let (_, replay) = RaftWal::open(dir.path()).unwrap();
        assert_eq!(replay.entries.len(), 3);
        assert_eq!(replay.entries[0].index, 1);
        assert_eq!(replay.entries[2].index, 3);
        assert_eq!(&replay.entries[2].data[..], b"c");
        assert_eq!(replay.hard_state.unwrap().commit, 2);
    }

    #[test]
    fn replay_applies_overwrite_semantics() {
        let dir = TempDir::new().unwrap();

        {
            let (mut wal, _) = RaftWal::open(dir.path()).unwrap();
            wal.save(None, &[entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")])
                .unwrap();
            // A new leader rewrites the tail from index 2.
            wal.save(Some(&hard_state(2, 2, 1)), &[entry(2, 2, b"x")])
                .unwrap();
        }

        let (_, replay) = RaftWal::open(dir.path()).unwrap();
        assert_eq!(replay.entries.len(), 2);
        assert_eq!(replay.entries[1].index, 2);
        assert_eq!(replay.entries[1].term, 2);
        assert_eq!(&replay.entries[1].data[..], b"x");
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();

        {
            let (mut wal, _) = RaftWal::open(dir.path()).unwrap();
            wal.save(None, &[entry(1, 1, b"a"), entry(2, 1, b"b")]).unwrap();
        }

        // Simulate a crash mid-append: chop bytes off the segment tail.
        let (_, path) = segment_paths(dir.path()).unwrap().pop().unwrap();
        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() - 3]).unwrap();

        let (mut wal, replay) = RaftWal::open(dir.path()).unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(replay.entries[0].index, 1);

        // The log keeps working after truncation.
        wal.save(None, &[entry(2, 1, b"b2")]).unwrap();
        drop(wal);
        let (_, replay) = RaftWal::open(dir.path()).unwrap();
        assert_eq!(replay.entries.len(), 2);
        assert_eq!(&replay.entries[1].data[..], b"b2");
    }

    #[test]
    fn corrupt_payload_stops_replay_at_valid_prefix() {
        let dir = TempDir::new().unwrap();

        {
            let (mut wal, _) = RaftWal::open(dir.path()).unwrap();
            wal.save(None, &[entry(1, 1, b"aaaa"), entry(2, 1, b"bbbb")])
                .unwrap();
        }

        // Flip a payload byte of the second record.
        let (_, path) = segment_paths(dir.path()).unwrap().pop().unwrap();
        let mut data = fs::read(&path).unwrap();
        let len = data.len();
        data[len - 1] ^= 0xff;
        fs::write(&path, &data).unwrap();

        let (_, replay) = RaftWal::open(dir.path()).unwrap();
        assert_eq!(replay.entries.len(), 1);
    }

    #[test]
    fn exists_reports_segments() {
        let dir = TempDir::new().unwrap();
        assert!(!RaftWal::exists(dir.path()));
        {
            let (mut wal, _) = RaftWal::open(dir.path()).unwrap();
            wal.save(None, &[entry(1, 1, b"a")]).unwrap();
        }
        assert!(RaftWal::exists(dir.path()));
    }
}
