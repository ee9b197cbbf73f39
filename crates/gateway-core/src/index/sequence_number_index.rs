//! Durable, single-writer, multi-reader map from `session_id` to the last
//! sequence numbers and stream position the engine has accepted.
//!
//! On-disk layout is sector-aligned and CRC-checksummed: a fixed header,
//! then one fixed-width record per session, each sector closed off with a
//! trailing CRC32. Commits go through write-temp -> fsync -> atomic-rename,
//! with a side "passing place" file that lets startup recover from a crash
//! between the fsync and the rename.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;

use crate::error::{Error, Result};

const MAGIC: [u8; 8] = *b"GWSEQIDX";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 4096;
const RECORD_SIZE: usize = 64;
const SECTOR_SIZE: usize = 4096;

/// In-memory mirror of one session's sequencing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceNumberRecord {
    pub session_id: u64,
    pub last_received_msg_seq_num: u64,
    pub last_sent_msg_seq_num: u64,
    pub sequence_index: u32,
    pub meta_data_position: u64,
}

impl SequenceNumberRecord {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.session_id)?;
        w.write_u64::<LittleEndian>(self.last_received_msg_seq_num)?;
        w.write_u64::<LittleEndian>(self.last_sent_msg_seq_num)?;
        w.write_u32::<LittleEndian>(self.sequence_index)?;
        w.write_u64::<LittleEndian>(self.meta_data_position)?;
        // pad to RECORD_SIZE
        w.write_all(&[0u8; RECORD_SIZE - 8 - 8 - 8 - 4 - 8])?;
        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let session_id = r.read_u64::<LittleEndian>()?;
        let last_received_msg_seq_num = r.read_u64::<LittleEndian>()?;
        let last_sent_msg_seq_num = r.read_u64::<LittleEndian>()?;
        let sequence_index = r.read_u32::<LittleEndian>()?;
        let meta_data_position = r.read_u64::<LittleEndian>()?;
        let mut pad = [0u8; RECORD_SIZE - 8 - 8 - 8 - 4 - 8];
        r.read_exact(&mut pad)?;
        Ok(SequenceNumberRecord {
            session_id,
            last_received_msg_seq_num,
            last_sent_msg_seq_num,
            sequence_index,
            meta_data_position,
        })
    }
}

/// Sentinel returned by [`SequenceNumberIndex::last_known_sequence_number`]
/// when nothing has ever been recorded for a session.
pub const UNKNOWN_SEQUENCE_NUMBER: u64 = u64::MAX;

/// Durable map of `session_id -> SequenceNumberRecord`.
///
/// Single writer, many readers: readers call the lock-free accessor methods
/// against the in-memory mirror (a `parking_lot::Mutex`-guarded map kept
/// current by the one writer thread), while the writer periodically flushes
/// the mirror to disk.
pub struct SequenceNumberIndex {
    path: PathBuf,
    passing_place: PathBuf,
    mirror: Mutex<HashMap<u64, SequenceNumberRecord>>,
    indexed_position: AtomicU64,
    dirty_records: AtomicU64,
    last_flush: Mutex<Instant>,
    flush_interval: Duration,
    flush_records: usize,
}

impl SequenceNumberIndex {
    /// Opens (creating if absent) the index file at `dir/sequence_number_index`.
    ///
    /// Startup recovery: both the canonical file and its passing-place
    /// sibling are checksummed independently; the valid file with the
    /// strictly greater `indexed_position` wins. If only one validates, it
    /// wins outright. If neither validates, returns
    /// [`Error::Corruption`] and does not start a writer.
    pub fn open(dir: impl AsRef<Path>, flush_interval: Duration, flush_records: usize) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join("sequence_number_index");
        let passing_place = dir.join("sequence_number_index.passing_place");

        let canonical = read_validated(&path);
        let passing = read_validated(&passing_place);

        let (mirror, indexed_position) = match (canonical, passing) {
            (Some((m, p)), Some((m2, p2))) => {
                if p2 > p {
                    (m2, p2)
                } else {
                    (m, p)
                }
            }
            (Some((m, p)), None) => (m, p),
            (None, Some((m, p))) => (m, p),
            (None, None) => {
                if path.exists() || passing_place.exists() {
                    return Err(Error::Corruption(
                        "sequence number index failed checksum on both canonical and passing-place files"
                            .into(),
                    ));
                }
                (HashMap::new(), 0)
            }
        };

        Ok(SequenceNumberIndex {
            path,
            passing_place,
            mirror: Mutex::new(mirror),
            indexed_position: AtomicU64::new(indexed_position),
            dirty_records: AtomicU64::new(0),
            last_flush: Mutex::new(Instant::now()),
            flush_interval,
            flush_records,
        })
    }

    /// Records (idempotently) the latest sequencing state observed for a
    /// session. A `stream_position` at or behind the already-indexed
    /// position is a no-op, making replayed writes safe.
    pub fn record(
        &self,
        session_id: u64,
        last_received_msg_seq_num: u64,
        sequence_index: u32,
        stream_position: u64,
    ) {
        if stream_position <= self.indexed_position.load(Ordering::Acquire) {
            return;
        }
        let mut mirror = self.mirror.lock();
        let entry = mirror.entry(session_id).or_insert(SequenceNumberRecord {
            session_id,
            last_received_msg_seq_num: 0,
            last_sent_msg_seq_num: 0,
            sequence_index: 0,
            meta_data_position: 0,
        });
        entry.last_received_msg_seq_num = last_received_msg_seq_num;
        entry.sequence_index = sequence_index;
        entry.meta_data_position = stream_position;
        drop(mirror);

        self.indexed_position.store(stream_position, Ordering::Release);
        let dirty = self.dirty_records.fetch_add(1, Ordering::AcqRel) + 1;

        let should_flush = dirty as usize >= self.flush_records || {
            let last = *self.last_flush.lock();
            last.elapsed() >= self.flush_interval
        };
        if should_flush {
            if let Err(e) = self.flush() {
                log::warn!("[SequenceNumberIndex] flush failed: {e}");
            }
        }
    }

    /// Records the sequence number last sent by this engine, used to resume
    /// outbound numbering after a restart.
    pub fn record_sent(&self, session_id: u64, last_sent_msg_seq_num: u64) {
        let mut mirror = self.mirror.lock();
        let entry = mirror.entry(session_id).or_insert(SequenceNumberRecord {
            session_id,
            last_received_msg_seq_num: 0,
            last_sent_msg_seq_num: 0,
            sequence_index: 0,
            meta_data_position: 0,
        });
        entry.last_sent_msg_seq_num = last_sent_msg_seq_num;
    }

    pub fn last_known_sequence_number(&self, session_id: u64) -> u64 {
        self.mirror
            .lock()
            .get(&session_id)
            .map(|r| r.last_received_msg_seq_num)
            .unwrap_or(UNKNOWN_SEQUENCE_NUMBER)
    }

    pub fn last_sent_sequence_number(&self, session_id: u64) -> u64 {
        self.mirror
            .lock()
            .get(&session_id)
            .map(|r| r.last_sent_msg_seq_num)
            .unwrap_or(0)
    }

    pub fn sequence_index(&self, session_id: u64) -> u32 {
        self.mirror
            .lock()
            .get(&session_id)
            .map(|r| r.sequence_index)
            .unwrap_or(0)
    }

    /// The stream position up to which this index is guaranteed consistent.
    pub fn indexed_position(&self) -> u64 {
        self.indexed_position.load(Ordering::Acquire)
    }

    /// Atomically wipes all state, on disk and in memory.
    pub fn reset_sequence_numbers(&self) -> Result<()> {
        self.mirror.lock().clear();
        self.indexed_position.store(0, Ordering::Release);
        self.flush()
    }

    /// Flush the in-memory mirror to disk via write-temp -> fsync -> rename.
    pub fn flush(&self) -> Result<()> {
        let mirror = self.mirror.lock();
        let indexed_position = self.indexed_position.load(Ordering::Acquire);
        let tmp_path = self.path.with_extension("tmp");
        write_file(&tmp_path, &mirror, indexed_position)?;
        drop(mirror);

        // Leave a passing-place copy before the rename commits, so a crash
        // between fsync and rename can still be recovered from on restart.
        fs::copy(&tmp_path, &self.passing_place)?;
        fs::rename(&tmp_path, &self.path)?;

        *self.last_flush.lock() = Instant::now();
        self.dirty_records.store(0, Ordering::Release);
        Ok(())
    }
}

fn write_file(path: &Path, mirror: &HashMap<u64, SequenceNumberRecord>, indexed_position: u64) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let mut w = io::BufWriter::new(&file);

    let mut header = Vec::with_capacity(HEADER_SIZE);
    header.write_all(&MAGIC)?;
    header.write_u32::<LittleEndian>(FORMAT_VERSION)?;
    header.write_u64::<LittleEndian>(indexed_position)?;
    header.write_u32::<LittleEndian>(mirror.len() as u32)?;
    header.resize(HEADER_SIZE - 4, 0);
    let crc = crc32fast::hash(&header);
    header.write_u32::<LittleEndian>(crc)?;
    w.write_all(&header)?;

    let mut records: Vec<&SequenceNumberRecord> = mirror.values().collect();
    records.sort_by_key(|r| r.session_id);

    let mut sector = Vec::with_capacity(SECTOR_SIZE);
    for rec in records {
        if sector.len() + RECORD_SIZE + 4 > SECTOR_SIZE {
            flush_sector(&mut w, &mut sector)?;
        }
        rec.write(&mut sector)?;
    }
    if !sector.is_empty() {
        flush_sector(&mut w, &mut sector)?;
    }

    w.flush()?;
    w.get_ref().sync_all()?;
    Ok(())
}

fn flush_sector<W: Write>(w: &mut W, sector: &mut Vec<u8>) -> io::Result<()> {
    sector.resize(SECTOR_SIZE - 4, 0);
    let crc = crc32fast::hash(sector);
    sector.write_u32::<LittleEndian>(crc)?;
    w.write_all(sector)?;
    sector.clear();
    Ok(())
}

fn read_validated(path: &Path) -> Option<(HashMap<u64, SequenceNumberRecord>, u64)> {
    let mut file = File::open(path).ok()?;
    let mut header = vec![0u8; HEADER_SIZE];
    file.read_exact(&mut header).ok()?;

    let stored_crc = (&header[HEADER_SIZE - 4..]).read_u32::<LittleEndian>().ok()?;
    let mut header_for_crc = header.clone();
    header_for_crc[HEADER_SIZE - 4..].copy_from_slice(&[0u8; 4]);
    if crc32fast::hash(&header_for_crc) != stored_crc {
        log::debug!("[SequenceNumberIndex] {path:?} header checksum mismatch");
        return None;
    }

    let mut cursor = io::Cursor::new(&header[..]);
    let mut magic = [0u8; 8];
    cursor.read_exact(&mut magic).ok()?;
    if magic != MAGIC {
        log::debug!("[SequenceNumberIndex] {path:?} bad magic");
        return None;
    }
    let _version = cursor.read_u32::<LittleEndian>().ok()?;
    let indexed_position = cursor.read_u64::<LittleEndian>().ok()?;
    let record_count = cursor.read_u32::<LittleEndian>().ok()? as usize;

    let mut map = HashMap::with_capacity(record_count);
    let mut remaining = record_count;
    'sectors: while remaining > 0 {
        let mut sector = vec![0u8; SECTOR_SIZE];
        if file.read_exact(&mut sector).is_err() {
            return None;
        }
        let stored_crc = match (&sector[SECTOR_SIZE - 4..]).read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => return None,
        };
        let mut for_crc = sector.clone();
        for_crc[SECTOR_SIZE - 4..].copy_from_slice(&[0u8; 4]);
        if crc32fast::hash(&for_crc) != stored_crc {
            log::debug!("[SequenceNumberIndex] {path:?} sector checksum mismatch");
            return None;
        }
        let mut cursor = io::Cursor::new(&sector[..]);
        let records_in_sector = (SECTOR_SIZE - 4) / RECORD_SIZE;
        for _ in 0..records_in_sector {
            if remaining == 0 {
                break 'sectors;
            }
            let rec = match SequenceNumberRecord::read(&mut cursor) {
                Ok(r) => r,
                Err(_) => return None,
            };
            map.insert(rec.session_id, rec);
            remaining -= 1;
        }
    }

    Some((map, indexed_position))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn record_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let idx = SequenceNumberIndex::open(dir.path(), Duration::from_millis(1), 1).unwrap();
        idx.record(1, 42, 0, 100);
        assert_eq!(idx.last_known_sequence_number(1), 42);
        assert_eq!(idx.indexed_position(), 100);
    }

    #[test]
    fn unknown_session_returns_sentinel() {
        let dir = tempdir().unwrap();
        let idx = SequenceNumberIndex::open(dir.path(), Duration::from_millis(1), 1).unwrap();
        assert_eq!(idx.last_known_sequence_number(999), UNKNOWN_SEQUENCE_NUMBER);
    }

    #[test]
    fn record_is_idempotent_on_replay() {
        let dir = tempdir().unwrap();
        let idx = SequenceNumberIndex::open(dir.path(), Duration::from_millis(1), 1).unwrap();
        idx.record(1, 10, 0, 50);
        idx.record(1, 10, 0, 50);
        assert_eq!(idx.last_known_sequence_number(1), 10);
        idx.record(1, 5, 0, 10); // stale stream_position, ignored
        assert_eq!(idx.last_known_sequence_number(1), 10);
    }

    #[test]
    fn survives_restart_across_flush() {
        let dir = tempdir().unwrap();
        {
            let idx = SequenceNumberIndex::open(dir.path(), Duration::from_millis(1), 1).unwrap();
            idx.record(7, 99, 2, 1000);
            idx.flush().unwrap();
        }
        let idx2 = SequenceNumberIndex::open(dir.path(), Duration::from_millis(1), 1).unwrap();
        assert_eq!(idx2.last_known_sequence_number(7), 99);
        assert_eq!(idx2.sequence_index(7), 2);
    }

    #[test]
    fn reset_wipes_everything() {
        let dir = tempdir().unwrap();
        let idx = SequenceNumberIndex::open(dir.path(), Duration::from_millis(1), 1).unwrap();
        idx.record(1, 10, 0, 50);
        idx.reset_sequence_numbers().unwrap();
        assert_eq!(idx.last_known_sequence_number(1), UNKNOWN_SEQUENCE_NUMBER);
        assert_eq!(idx.indexed_position(), 0);
    }

    #[test]
    fn corrupted_canonical_file_is_rejected_at_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sequence_number_index");
        fs::write(&path, vec![0xffu8; HEADER_SIZE]).unwrap();
        let result = SequenceNumberIndex::open(dir.path(), Duration::from_millis(1), 1);
        assert!(result.is_err());
    }
}
