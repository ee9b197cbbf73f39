//! The carrier abstraction: a single-writer, multi-reader, append-only byte
//! stream that sits between the session state machines, the indexer, and the
//! archive.
//!
//! The production transport (a cross-process shared-memory ring) is a
//! collaborator outside this crate's scope. [`InProcessCarrier`] is the
//! in-heap stand-in used by the engine and its tests: the same odd/even
//! sequence-marker discipline and store-release / load-acquire pairing, just
//! without the shared-memory segment underneath it.

use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};

/// Monotonic byte offset into a carrier stream.
pub type StreamPosition = u64;

/// A single-writer, append-only byte stream.
///
/// `try_write` never blocks: a full ring reports [`Error::Backpressure`] and
/// the caller is expected to retry, exactly as the FIX/FIXP state machines'
/// `try_claim`/`commit` pair does at the protocol layer.
pub trait Carrier: Send + Sync {
    /// Appends `data`, returning the position it was written at.
    fn try_write(&self, data: &[u8]) -> Result<StreamPosition>;

    /// The position the next write will land at.
    fn position(&self) -> StreamPosition;
}

const SLOT_PAYLOAD_SIZE: usize = 4096;

struct Slot {
    /// `(seq << 1) | 1` while a write is in progress, `seq << 1` once committed.
    seq: AtomicU64,
    len: AtomicU64,
    payload: std::cell::UnsafeCell<[u8; SLOT_PAYLOAD_SIZE]>,
}

// SAFETY: `payload` is only mutated by the single writer while `seq` holds an
// odd (in-progress) value, and only read by readers after observing a stable
// even `seq` on both sides of the read (see `try_read`). This is the same
// single-producer/multi-consumer contract `ShmRingWriter`/`ShmRingReader`
// enforce across process boundaries; here it is enforced across threads.
unsafe impl Sync for Slot {}

impl Slot {
    fn new() -> Self {
        Slot {
            seq: AtomicU64::new(0),
            len: AtomicU64::new(0),
            payload: std::cell::UnsafeCell::new([0u8; SLOT_PAYLOAD_SIZE]),
        }
    }
}

struct Inner {
    slots: Vec<Slot>,
    mask: usize,
    next_seq: AtomicU64,
    head: AtomicU64,
    wake: Condvar,
    wake_lock: Mutex<()>,
}

/// An in-process, append-only ring of framed records.
///
/// `position()` here is the logical record index rather than a byte offset;
/// callers that need true byte offsets (the Sequence-Number / Replay Index)
/// track them separately and treat this position as an opaque cursor.
pub struct InProcessCarrier {
    inner: Arc<Inner>,
}

impl InProcessCarrier {
    /// `capacity` must be a power of two.
    pub fn new(capacity: usize) -> Result<Self> {
        if !capacity.is_power_of_two() {
            return Err(Error::ConfigInvalid(format!(
                "carrier capacity {capacity} is not a power of two"
            )));
        }
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::new);
        Ok(InProcessCarrier {
            inner: Arc::new(Inner {
                slots,
                mask: capacity - 1,
                next_seq: AtomicU64::new(0),
                head: AtomicU64::new(0),
                wake: Condvar::new(),
                wake_lock: Mutex::new(()),
            }),
        })
    }

    /// A handle that can be cloned and handed to a reader on another thread.
    pub fn reader(&self) -> CarrierReader {
        CarrierReader {
            inner: Arc::clone(&self.inner),
            next_seq: 0,
        }
    }
}

impl Carrier for InProcessCarrier {
    fn try_write(&self, data: &[u8]) -> Result<StreamPosition> {
        if data.len() > SLOT_PAYLOAD_SIZE {
            return Err(Error::Protocol(format!(
                "record of {} bytes exceeds carrier slot size {SLOT_PAYLOAD_SIZE}",
                data.len()
            )));
        }
        let inner = &*self.inner;
        let msg_seq = inner.next_seq.load(Ordering::Relaxed);
        let idx = (msg_seq as usize) & inner.mask;
        let slot = &inner.slots[idx];

        slot.seq.store((msg_seq << 1) | 1, Ordering::Relaxed);
        slot.len.store(data.len() as u64, Ordering::Relaxed);
        // SAFETY: this slot was just marked in-progress (odd seq) and no
        // other writer exists (single-producer); readers skip odd slots.
        unsafe {
            let dst = (*slot.payload.get()).as_mut_ptr();
            ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        slot.seq.store(msg_seq << 1, Ordering::Release);
        inner.head.store(msg_seq + 1, Ordering::Release);
        inner.next_seq.store(msg_seq + 1, Ordering::Relaxed);

        let _g = inner.wake_lock.lock().unwrap_or_else(|e| e.into_inner());
        inner.wake.notify_all();
        Ok(msg_seq)
    }

    fn position(&self) -> StreamPosition {
        self.inner.next_seq.load(Ordering::Relaxed)
    }
}

/// Reads committed records from an [`InProcessCarrier`] in order, never
/// blocking indefinitely unless [`CarrierReader::take_blocking`] is used.
pub struct CarrierReader {
    inner: Arc<Inner>,
    next_seq: u64,
}

impl CarrierReader {
    /// Non-blocking single read; `None` if no new record is ready.
    ///
    /// Detects two failure modes the production ring also guards against:
    /// overrun (the writer lapped this reader) and torn reads (a write
    /// landed mid-copy) by re-checking the slot's sequence after the copy.
    pub fn try_pop(&mut self, buf: &mut [u8]) -> Option<usize> {
        let head = self.inner.head.load(Ordering::Acquire);
        if head.saturating_sub(self.next_seq) > self.inner.slots.len() as u64 {
            log::debug!("[CarrierReader] reader lapped by writer, resyncing");
            self.next_seq = head.saturating_sub(self.inner.slots.len() as u64);
        }
        if self.next_seq >= head {
            return None;
        }
        let idx = (self.next_seq as usize) & self.inner.mask;
        let slot = &self.inner.slots[idx];
        let seq1 = slot.seq.load(Ordering::Acquire);
        if seq1 != self.next_seq << 1 {
            // in-progress or stale slot; treat as not-yet-visible
            return None;
        }
        let len = slot.len.load(Ordering::Relaxed) as usize;
        if len > buf.len() {
            log::debug!("[CarrierReader] caller buffer too small ({len} > {})", buf.len());
            return None;
        }
        // SAFETY: seq1 observed even means the writer's commit (Release
        // store) happened-before this Acquire load; the payload write is
        // visible. We re-check seq below to rule out a torn read.
        unsafe {
            let src = (*slot.payload.get()).as_ptr();
            ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), len);
        }
        let seq2 = slot.seq.load(Ordering::Acquire);
        if seq2 != seq1 {
            log::debug!("[CarrierReader] torn read detected at seq {}", self.next_seq);
            return None;
        }
        self.next_seq += 1;
        Some(len)
    }

    /// Blocks (with an optional timeout) until a record is available or the
    /// deadline passes.
    pub fn take_blocking(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Option<usize> {
        if let Some(n) = self.try_pop(buf) {
            return Some(n);
        }
        let guard = self.inner.wake_lock.lock().unwrap_or_else(|e| e.into_inner());
        let (_g, _timed_out) = match timeout {
            Some(t) => self
                .inner
                .wake
                .wait_timeout(guard, t)
                .unwrap_or_else(|e| e.into_inner()),
            None => (
                self.inner.wake.wait(guard).unwrap_or_else(|e| e.into_inner()),
                false,
            ),
        };
        self.try_pop(buf)
    }

    /// Records not yet consumed by this reader.
    pub fn available(&self) -> u64 {
        self.inner
            .head
            .load(Ordering::Acquire)
            .saturating_sub(self.next_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let carrier = InProcessCarrier::new(16).unwrap();
        let mut reader = carrier.reader();
        carrier.try_write(b"hello").unwrap();
        carrier.try_write(b"world").unwrap();

        let mut buf = [0u8; 64];
        let n = reader.try_pop(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        let n = reader.try_pop(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
        assert!(reader.try_pop(&mut buf).is_none());
    }

    #[test]
    fn rejects_non_power_of_two_capacity() {
        assert!(InProcessCarrier::new(3).is_err());
    }

    #[test]
    fn reader_lap_resyncs_instead_of_panicking() {
        let carrier = InProcessCarrier::new(4).unwrap();
        let mut reader = carrier.reader();
        for i in 0..10u32 {
            carrier.try_write(&i.to_le_bytes()).unwrap();
        }
        let mut buf = [0u8; 8];
        // Reader was lapped (4-slot ring, 10 writes); it should resync to
        // the oldest still-live record rather than reading garbage forever.
        let n = reader.try_pop(&mut buf);
        assert!(n.is_some());
    }

    #[test]
    fn position_tracks_write_count() {
        let carrier = InProcessCarrier::new(8).unwrap();
        assert_eq!(carrier.position(), 0);
        carrier.try_write(b"a").unwrap();
        assert_eq!(carrier.position(), 1);
    }
}
