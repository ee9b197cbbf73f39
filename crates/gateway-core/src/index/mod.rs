//! The two durable indexes the session engine depends on for crash-safe,
//! exactly-once delivery: the [`sequence_number_index`] (last-known sequence
//! numbers per session) and the [`replay_index`] (per-session ring mapping
//! sequence numbers to archive positions), plus [`replay_query`] which turns
//! a sequence range into archive ranges.

pub mod replay_index;
pub mod replay_query;
pub mod sequence_number_index;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use replay_index::{ReplayIndexReader, ReplayIndexWriter, ReplayRecord};
pub use replay_query::{RecordingRange, ReplayQuery};
pub use sequence_number_index::SequenceNumberIndex;

/// What a protocol state machine needs to record every accepted/sent
/// business message at a real position in the engine-wide carrier stream,
/// rather than at its own session-local sequence number.
///
/// `stream_position` is shared by every session the engine is running:
/// [`SequenceNumberIndex::record`] gates on a single, index-wide position, so
/// two sessions both recording at their own small sequence numbers would
/// shadow each other. Routing every accepted message through one
/// `fetch_add` here is what keeps that gate meaningful.
#[derive(Clone)]
pub struct ReplaySink {
    pub stream_position: Arc<AtomicU64>,
    pub recording_id: u32,
    pub inbound: Arc<ReplayIndexWriter>,
    pub outbound: Arc<ReplayIndexWriter>,
}

impl ReplaySink {
    pub fn next_position(&self) -> u64 {
        self.stream_position.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// A freshly-opened [`ReplaySink`] over a throwaway directory, for state
/// machine unit tests that don't exercise the engine's recording coordinator.
#[cfg(test)]
pub(crate) fn test_replay_sink(dir: &std::path::Path, session_id: u64) -> ReplaySink {
    ReplaySink {
        stream_position: Arc::new(AtomicU64::new(0)),
        recording_id: 0,
        inbound: Arc::new(ReplayIndexWriter::create(dir, session_id, "in", 64).unwrap()),
        outbound: Arc::new(ReplayIndexWriter::create(dir, session_id, "out", 64).unwrap()),
    }
}
