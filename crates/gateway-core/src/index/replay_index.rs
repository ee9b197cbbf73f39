//! Per-session, memory-mapped, lock-free ring mapping sequence numbers to
//! archive positions.
//!
//! The mapping technique is raw `mmap` over a file, accessed through atomics,
//! wrapped in a type that frees the mapping on `Drop`: a plain (non-shared,
//! file-backed) mapping, since the replay index only ever has one writer
//! and one process.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// One entry in the replay index: everything [`crate::index::ReplayQuery`]
/// needs to turn a sequence range into an archive read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct ReplayRecord {
    pub stream_position: u64,
    pub sequence_index: u32,
    pub sequence_number: u64,
    pub recording_id: u32,
    pub length: u32,
}

const RECORD_LEN: usize = std::mem::size_of::<ReplayRecordSlot>();

#[repr(C)]
struct ReplayRecordSlot {
    /// `(logical_index << 1) | 1` while being written, `logical_index << 1` once committed.
    seq: AtomicU64,
    record: ReplayRecord,
}

#[repr(C)]
struct Header {
    magic: [u8; 8],
    version: u32,
    capacity: u32,
    begin_change: AtomicU64,
    end_change: AtomicU64,
}

const MAGIC: [u8; 8] = *b"GWRPLIDX";
const FORMAT_VERSION: u32 = 1;

struct Mapping {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: the mapping is only ever touched through the atomic header
// counters and per-slot sequence fields below; the payload fields are only
// mutated by the single writer while the slot's seq is odd.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/size came from a successful mmap in `map_file` and are
        // not used again after this call.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

fn map_file(path: &Path, size: usize) -> Result<Mapping> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;
    file.set_len(size as u64)?;

    // SAFETY:
    // - file is a valid, open file descriptor sized to exactly `size` bytes above
    // - PROT_READ | PROT_WRITE matches the file's read/write open mode
    // - MAP_SHARED means writes are visible to any other mapping of the same file
    //   (not required here since there's one mapping, but matches the on-disk
    //   semantics we want: the mapping is a view of file content, not a private copy)
    // - offset 0 maps from the start of the file
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(Mapping {
        ptr: ptr as *mut u8,
        size,
    })
}

fn layout(capacity: usize) -> usize {
    std::mem::size_of::<Header>() + capacity * RECORD_LEN
}

/// The single writer for one `(session_id, stream_id)` replay index.
pub struct ReplayIndexWriter {
    mapping: Mapping,
    capacity: u64,
    path: PathBuf,
}

impl ReplayIndexWriter {
    /// Creates (or reopens, preserving content) the ring file for
    /// `session_id`/`stream_id` under `dir`.
    pub fn create(dir: impl AsRef<Path>, session_id: u64, stream_id: &str, capacity: usize) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("replay_index_{session_id}_{stream_id}"));
        let fresh = !path.exists();
        let size = layout(capacity);
        let mapping = map_file(&path, size)?;

        let header = header_ref(&mapping);
        if fresh {
            header.magic.copy_from_slice(&MAGIC);
            header.version = FORMAT_VERSION;
            header.capacity = capacity as u32;
            header.begin_change.store(0, Ordering::Release);
            header.end_change.store(0, Ordering::Release);
        } else if header.magic != MAGIC || header.capacity as usize != capacity {
            return Err(Error::Corruption(format!(
                "{path:?} has incompatible replay index header"
            )));
        }

        Ok(ReplayIndexWriter {
            mapping,
            capacity: capacity as u64,
            path,
        })
    }

    fn header(&self) -> &Header {
        header_ref(&self.mapping)
    }

    fn slot(&self, logical_index: u64) -> &mut ReplayRecordSlot {
        let idx = (logical_index % self.capacity) as usize;
        // SAFETY: idx < capacity by construction; the mapping was sized to
        // hold exactly `capacity` slots after the header in `map_file`.
        unsafe {
            let base = self.mapping.ptr.add(std::mem::size_of::<Header>()) as *mut ReplayRecordSlot;
            &mut *base.add(idx)
        }
    }

    /// Appends one record, overwriting the oldest slot once the ring wraps.
    pub fn append(&self, record: ReplayRecord) {
        let header = self.header();
        let logical_index = header.end_change.load(Ordering::Relaxed);
        if logical_index >= self.capacity {
            header
                .begin_change
                .store(logical_index - self.capacity + 1, Ordering::Release);
        }
        let slot = self.slot(logical_index);
        slot.seq.store((logical_index << 1) | 1, Ordering::Relaxed);
        slot.record = record;
        slot.seq.store(logical_index << 1, Ordering::Release);
        header.end_change.store(logical_index + 1, Ordering::Release);
    }

    pub fn reader(&self) -> ReplayIndexReader {
        ReplayIndexReader {
            mapping_ptr: self.mapping.ptr,
            capacity: self.capacity,
            cursor: self.header().begin_change.load(Ordering::Acquire),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn header_ref(mapping: &Mapping) -> &'static mut Header {
    // SAFETY: Header lives at offset 0 of a mapping sized by `layout`, which
    // always reserves at least `size_of::<Header>()` bytes, and the mapping
    // outlives every reference handed out from this module.
    unsafe { &mut *(mapping.ptr as *mut Header) }
}

/// Outcome of advancing a [`ReplayIndexReader`].
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Record(ReplayRecord),
    /// No new record since the last read.
    Empty,
    /// The writer overwrote unread records; the cursor has been resynced to
    /// `begin_change` and the caller should decide whether to retry or
    /// treat the covered range as lost.
    Lapped,
}

/// A read-only cursor over a [`ReplayIndexWriter`]'s ring.
///
/// Holds a raw pointer into the writer's mapping rather than its own mmap,
/// since the writer and its readers live in the same process and share the
/// writer's lifetime by construction (the writer is only ever dropped after
/// its session's state machine is torn down).
pub struct ReplayIndexReader {
    mapping_ptr: *mut u8,
    capacity: u64,
    cursor: u64,
}

// SAFETY: the reader only ever performs atomic loads on the header and slots,
// and the torn-read guard in `next()` mirrors the production ring's
// double-check pattern.
unsafe impl Send for ReplayIndexReader {}

impl ReplayIndexReader {
    fn header(&self) -> &Header {
        // SAFETY: see `header_ref`; the pointer was copied from a live
        // `ReplayIndexWriter` mapping that outlives this reader.
        unsafe { &*(self.mapping_ptr as *const Header) }
    }

    fn slot(&self, logical_index: u64) -> &ReplayRecordSlot {
        let idx = (logical_index % self.capacity) as usize;
        // SAFETY: idx < capacity; see `ReplayIndexWriter::slot`.
        unsafe {
            let base = self.mapping_ptr.add(std::mem::size_of::<Header>()) as *const ReplayRecordSlot;
            &*base.add(idx)
        }
    }

    /// Advance the cursor by one record, per the algorithm in the replay
    /// index's lap-detection rule: if the writer has advanced
    /// `begin_change` past our cursor, we were lapped and resync.
    pub fn next(&mut self) -> ReadOutcome {
        let header = self.header();
        let begin = header.begin_change.load(Ordering::Acquire);
        if self.cursor < begin {
            self.cursor = begin;
            return ReadOutcome::Lapped;
        }
        let end = header.end_change.load(Ordering::Acquire);
        if self.cursor >= end {
            return ReadOutcome::Empty;
        }
        let slot = self.slot(self.cursor);
        let seq1 = slot.seq.load(Ordering::Acquire);
        if seq1 != self.cursor << 1 {
            // writer is mid-commit on this slot; try again next poll
            return ReadOutcome::Empty;
        }
        let record = slot.record;
        let seq2 = slot.seq.load(Ordering::Acquire);
        if seq2 != seq1 {
            log::debug!("[ReplayIndexReader] torn read at logical index {}", self.cursor);
            return ReadOutcome::Empty;
        }
        // re-check we weren't lapped during the read itself
        let begin_after = header.begin_change.load(Ordering::Acquire);
        if self.cursor < begin_after {
            self.cursor = begin_after;
            return ReadOutcome::Lapped;
        }
        self.cursor += 1;
        ReadOutcome::Record(record)
    }

    /// Repositions the cursor to the start of the currently-live range.
    pub fn seek_to_oldest(&mut self) {
        self.cursor = self.header().begin_change.load(Ordering::Acquire);
    }

    /// Repositions the cursor to a specific logical index (used by
    /// [`crate::index::ReplayQuery`] to jump forward rather than scan).
    pub fn seek(&mut self, logical_index: u64) {
        self.cursor = logical_index;
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}
