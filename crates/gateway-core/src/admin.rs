//! Admin RPC surface: the operations exposed verbatim to the
//! embedding application and, through `gateway-admin`, to the operator.

use crate::error::Result;
use crate::session::SessionKey;

/// One entry in [`AdminApi::all_sessions`].
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: u64,
    pub key: SessionKey,
    pub bound: bool,
    pub sequence_index: u32,
}

/// Backend-agnostic admin surface over a running engine.
///
/// A narrow trait over whatever concrete engine state backs it, so the
/// daemon and test code can exercise the same operations without reaching
/// into engine internals.
pub trait AdminApi {
    /// Forces `last_known_sequence_number`/`last_sent_sequence_number` for a
    /// session back to zero without touching its `sequence_index`.
    fn reset_sequence_number(&self, session_id: u64) -> Result<()>;

    /// Wipes all sequence-number and replay index state, first copying the
    /// current files into `backup_dir`.
    fn reset_session_ids(&self, backup_dir: &std::path::Path) -> Result<()>;

    /// Advances each recording's reachable start position to the earliest
    /// point any live session could still request a replay from, returning
    /// the new start position per recording id.
    fn prune_archive(&self) -> Result<Vec<(u32, u64)>>;

    /// Resolves the session id bound to a given protocol-specific key, if any.
    fn lookup_session_id(&self, key: &SessionKey) -> Option<u64>;

    /// Snapshot of every session the registry knows about.
    fn all_sessions(&self) -> Vec<SessionSummary>;
}
