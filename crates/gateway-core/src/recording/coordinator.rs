//! Assigns each carrier stream to an archive recording and remembers which
//! recording ids are idle, so a restart extends a prior recording instead of
//! making the counterparty's sequence space appear to jump.
//!
//! The persisted `used`/`free` id sets are a small serde struct written as
//! JSON rather than a binary segment format, since this state is small and
//! rarely hot.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// What the coordinator knows about one active recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingDescriptor {
    pub recording_id: u32,
    /// Position to extend the recording from, rather than start fresh.
    pub stop_position: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    free: BTreeSet<u32>,
    used: BTreeSet<u32>,
    next_fresh_id: u32,
}

/// Tracks which archive recording ids are idle (`free`) versus owned by an
/// active publication (`used`), persisting the split to
/// `recording_coordinator` under the configured log directory.
pub struct RecordingCoordinator {
    path: PathBuf,
    state: Mutex<PersistedState>,
}

impl RecordingCoordinator {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join("recording_coordinator");
        let state = if path.exists() {
            let text = fs::read_to_string(&path)?;
            serde_json::from_str(&text).unwrap_or_default()
        } else {
            PersistedState::default()
        };
        Ok(RecordingCoordinator {
            path,
            state: Mutex::new(state),
        })
    }

    /// Assigns a recording to a newly-connecting stream: reuses a free id
    /// (extending whatever was previously recorded there) if one exists,
    /// otherwise mints a fresh one.
    pub fn assign(&self, known_stop_position: impl Fn(u32) -> u64) -> Result<RecordingDescriptor> {
        let mut state = self.state.lock();
        let recording_id = if let Some(&id) = state.free.iter().next() {
            state.free.remove(&id);
            id
        } else {
            let id = state.next_fresh_id;
            state.next_fresh_id += 1;
            id
        };
        state.used.insert(recording_id);
        let stop_position = known_stop_position(recording_id);
        drop(state);
        self.persist()?;
        Ok(RecordingDescriptor {
            recording_id,
            stop_position,
        })
    }

    /// Releases a recording back to the free pool (called when a
    /// publication's session ends gracefully).
    pub fn release(&self, recording_id: u32) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.used.remove(&recording_id);
            state.free.insert(recording_id);
        }
        self.persist()
    }

    pub fn used_count(&self) -> usize {
        self.state.lock().used.len()
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    fn persist(&self) -> Result<()> {
        let state = self.state.lock();
        let text = serde_json::to_string_pretty(&*state)
            .map_err(|e| crate::Error::Corruption(e.to_string()))?;
        drop(state);
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
