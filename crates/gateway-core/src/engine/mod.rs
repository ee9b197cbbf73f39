//! Ties the session registry, sequence-number index, recording coordinator,
//! and protocol state machines into one engine object, and implements
//! [`AdminApi`] over it.
//!
//! One struct owns the registry, index, and recording collaborators and
//! exposes a single facade the daemon binary drives.

pub mod dispatcher;

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::admin::{AdminApi, SessionSummary};
use crate::auth::{NullAuthenticationStrategy, SharedAuthenticationStrategy};
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::fix::state_machine::{FixAction, FixSessionStateMachine};
use crate::fixp::state_machine::{FixPAction, FixPSessionStateMachine};
use crate::index::replay_index::ReplayIndexWriter;
use crate::index::sequence_number_index::SequenceNumberIndex;
use crate::index::{ReplayQuery, ReplaySink};
use crate::recording::coordinator::RecordingCoordinator;
use crate::session::{SessionKey, SessionsRegistry};

/// Owns every collaborator one running gateway needs and dispatches inbound
/// frames to the matching protocol state machine.
pub struct GatewayEngine {
    config: Arc<GatewayConfig>,
    sessions: Arc<SessionsRegistry>,
    seq_index: Arc<SequenceNumberIndex>,
    recording: Arc<RecordingCoordinator>,
    auth: SharedAuthenticationStrategy,
    /// Single engine-wide allocator backing every session's `ReplaySink`:
    /// see [`crate::index::ReplaySink`] for why this must not be per-session.
    stream_position: Arc<AtomicU64>,
    replay: Mutex<HashMap<u64, ReplaySink>>,
    fix: Mutex<HashMap<u64, FixSessionStateMachine>>,
    fixp: Mutex<HashMap<u64, FixPSessionStateMachine>>,
}

impl GatewayEngine {
    /// Opens (or recovers) every durable collaborator under
    /// `config.log_file_dir` and returns an engine with no active sessions.
    pub fn open(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let seq_index = Arc::new(SequenceNumberIndex::open(
            &config.log_file_dir,
            config.index_flush_interval,
            config.index_flush_records,
        )?);
        let recording = Arc::new(RecordingCoordinator::open(&config.log_file_dir)?);
        // Resume the allocator above whatever the index already considers
        // indexed, so a restart can't reissue a position the index would
        // silently treat as stale (see `SequenceNumberIndex::record`).
        let stream_position = Arc::new(AtomicU64::new(seq_index.indexed_position()));
        Ok(GatewayEngine {
            config,
            sessions: Arc::new(SessionsRegistry::new()),
            seq_index,
            recording,
            auth: Arc::new(NullAuthenticationStrategy),
            stream_position,
            replay: Mutex::new(HashMap::new()),
            fix: Mutex::new(HashMap::new()),
            fixp: Mutex::new(HashMap::new()),
        })
    }

    /// Opens (or reopens, across a restart) the pair of durable replay-index
    /// writers for `session_id`, assigning a fresh archive recording on first
    /// use and reusing the same one on rebind.
    fn replay_sink(&self, session_id: u64) -> Result<ReplaySink> {
        if let Some(sink) = self.replay.lock().get(&session_id) {
            return Ok(sink.clone());
        }
        let recording = self.recording.assign(|_| 0)?;
        let inbound = Arc::new(ReplayIndexWriter::create(
            &self.config.log_file_dir,
            session_id,
            "in",
            self.config.replay_index_capacity,
        )?);
        let outbound = Arc::new(ReplayIndexWriter::create(
            &self.config.log_file_dir,
            session_id,
            "out",
            self.config.replay_index_capacity,
        )?);
        let sink = ReplaySink {
            stream_position: Arc::clone(&self.stream_position),
            recording_id: recording.recording_id,
            inbound,
            outbound,
        };
        self.replay.lock().insert(session_id, sink.clone());
        Ok(sink)
    }

    pub fn with_authentication_strategy(mut self, auth: SharedAuthenticationStrategy) -> Self {
        self.auth = auth;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn recording_coordinator(&self) -> &RecordingCoordinator {
        &self.recording
    }

    /// Forces the sequence-number index to disk; called on graceful
    /// shutdown when `flush_on_shutdown` is set.
    pub fn flush(&self) -> Result<()> {
        self.seq_index.flush()
    }

    /// Binds (or rebinds, if offline) the FIX session named by
    /// `sender_comp_id`/`target_comp_id` and runs the inbound `Logon` through
    /// a fresh state machine.
    pub fn fix_logon(
        &self,
        sender_comp_id: &str,
        target_comp_id: &str,
        reset_seq_num: bool,
        logon_bytes: &[u8],
    ) -> Result<(u64, Vec<FixAction>)> {
        let key = SessionKey::Fix {
            sender_comp_id: sender_comp_id.to_string(),
            target_comp_id: target_comp_id.to_string(),
        };
        let ctx = self.sessions.bind(key, reset_seq_num)?;
        let mut sm = FixSessionStateMachine::new(
            Arc::clone(&ctx),
            Arc::clone(&self.config),
            Arc::clone(&self.seq_index),
            self.replay_sink(ctx.session_id)?,
            Arc::clone(&self.auth),
            sender_comp_id.to_string(),
            target_comp_id.to_string(),
        );
        let actions = sm.on_message(logon_bytes)?;
        self.fix.lock().insert(ctx.session_id, sm);
        Ok((ctx.session_id, actions))
    }

    /// Routes one inbound FIX frame to its already-logged-on session.
    pub fn fix_message(&self, session_id: u64, raw: &[u8]) -> Result<Vec<FixAction>> {
        let mut fix = self.fix.lock();
        let sm = fix
            .get_mut(&session_id)
            .ok_or_else(|| Error::InvalidState("unknown FIX session".into()))?;
        sm.on_message(raw)
    }

    /// Sweeps every FIX session's liveness timer; callers run this on the
    /// engine's heartbeat tick.
    pub fn fix_timer_tick(&self) -> Vec<(u64, Vec<FixAction>)> {
        self.fix
            .lock()
            .iter_mut()
            .map(|(id, sm)| (*id, sm.on_timer_tick()))
            .filter(|(_, actions)| !actions.is_empty())
            .collect()
    }

    pub fn fix_disconnect(&self, session_id: u64) {
        if let Some(ctx) = self.sessions.all_sessions().into_iter().find(|c| c.session_id == session_id) {
            ctx.unbind();
        }
        self.fix.lock().remove(&session_id);
    }

    /// Accepts an inbound FIXP connection and runs its first frame (expected
    /// to be `Negotiate`) through a fresh state machine, binding the session
    /// registry entry named by the negotiated `session_id`.
    pub fn fixp_accept(&self, negotiate_session_id: u64, frame: &[u8]) -> Result<Vec<FixPAction>> {
        let ctx = self
            .sessions
            .bind(SessionKey::FixP { session_id: negotiate_session_id }, false)?;
        let mut sm = FixPSessionStateMachine::new(
            Arc::clone(&ctx),
            Arc::clone(&self.config),
            Arc::clone(&self.seq_index),
            self.replay_sink(ctx.session_id)?,
            Arc::clone(&self.auth),
        );
        let actions = sm.on_message(frame)?;
        self.fixp.lock().insert(ctx.session_id, sm);
        Ok(actions)
    }

    pub fn fixp_message(&self, session_id: u64, frame: &[u8]) -> Result<Vec<FixPAction>> {
        let mut fixp = self.fixp.lock();
        let sm = fixp
            .get_mut(&session_id)
            .ok_or_else(|| Error::InvalidState("unknown FIXP session".into()))?;
        sm.on_message(frame)
    }

    /// Accepts one inbound business payload already decoded by the (out of
    /// scope) SBE schema layer, sequencing it against the session's
    /// `expected_seq`.
    pub fn fixp_business_message(
        &self,
        session_id: u64,
        seq_no: u64,
        bytes: Vec<u8>,
    ) -> Result<Vec<FixPAction>> {
        let mut fixp = self.fixp.lock();
        let sm = fixp
            .get_mut(&session_id)
            .ok_or_else(|| Error::InvalidState("unknown FIXP session".into()))?;
        sm.accept_business_message(seq_no, bytes)
    }

    pub fn fixp_timer_tick(&self) -> Vec<(u64, Vec<FixPAction>)> {
        self.fixp
            .lock()
            .iter_mut()
            .map(|(id, sm)| (*id, sm.on_timer_tick()))
            .filter(|(_, actions)| !actions.is_empty())
            .collect()
    }

    pub fn fixp_disconnect(&self, session_id: u64) {
        if let Some(ctx) = self.sessions.all_sessions().into_iter().find(|c| c.session_id == session_id) {
            ctx.ended.store(true, std::sync::atomic::Ordering::Release);
            ctx.unbind();
        }
        self.fixp.lock().remove(&session_id);
    }
}

impl AdminApi for GatewayEngine {
    fn reset_sequence_number(&self, session_id: u64) -> Result<()> {
        self.seq_index.record(session_id, 0, 0, self.seq_index.indexed_position() + 1);
        self.seq_index.record_sent(session_id, 0);
        Ok(())
    }

    fn reset_session_ids(&self, backup_dir: &std::path::Path) -> Result<()> {
        std::fs::create_dir_all(backup_dir)?;
        let src = self.config.log_file_dir.join("sequence_number_index");
        if src.exists() {
            std::fs::copy(&src, backup_dir.join("sequence_number_index"))?;
        }
        self.seq_index.reset_sequence_numbers()
    }

    /// Merges [`ReplayQuery::start_positions`] across every session's
    /// inbound and outbound replay index, taking the minimum reachable
    /// position per `recording_id` — the floor below which archive bytes are
    /// no longer reachable by any future replay.
    fn prune_archive(&self) -> Result<Vec<(u32, u64)>> {
        let mut floors: Vec<(u32, u64)> = Vec::new();
        for sink in self.replay.lock().values() {
            for (recording_id, position) in ReplayQuery::start_positions(sink.inbound.reader()) {
                merge_floor(&mut floors, recording_id, position);
            }
            for (recording_id, position) in ReplayQuery::start_positions(sink.outbound.reader()) {
                merge_floor(&mut floors, recording_id, position);
            }
        }
        floors.sort_by_key(|(id, _)| *id);
        Ok(floors)
    }

    fn lookup_session_id(&self, key: &SessionKey) -> Option<u64> {
        self.sessions.lookup_session_id(key)
    }

    fn all_sessions(&self) -> Vec<SessionSummary> {
        self.sessions
            .all_sessions()
            .into_iter()
            .map(|ctx| SessionSummary {
                session_id: ctx.session_id,
                key: ctx.key.clone(),
                bound: ctx.is_bound(),
                sequence_index: ctx.sequence_index.load(std::sync::atomic::Ordering::Acquire),
            })
            .collect()
    }
}

fn merge_floor(floors: &mut Vec<(u32, u64)>, recording_id: u32, position: u64) {
    match floors.iter_mut().find(|(id, _)| *id == recording_id) {
        Some((_, existing)) => {
            if position < *existing {
                *existing = position;
            }
        }
        None => floors.push((recording_id, position)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::message::{build_admin_message, AdminMsgType};
    use chrono::Utc;
    use tempfile::tempdir;

    fn logon_bytes(sender: &str, target: &str, seq: u32) -> Vec<u8> {
        build_admin_message(
            AdminMsgType::Logon,
            sender,
            target,
            seq,
            Utc::now(),
            crate::config::TimestampPrecision::Millis,
            &[(108, "30".into())],
        )
    }

    #[test]
    fn fix_logon_creates_routable_session() {
        let dir = tempdir().unwrap();
        let config = GatewayConfig::builder().log_file_dir(dir.path()).build();
        let engine = GatewayEngine::open(config).unwrap();

        let (session_id, actions) = engine.fix_logon("INIT", "ACC", false, &logon_bytes("INIT", "ACC", 1)).unwrap();
        assert!(!actions.is_empty());
        assert_eq!(engine.all_sessions().len(), 1);

        let hb = build_admin_message(
            AdminMsgType::Heartbeat,
            "INIT",
            "ACC",
            2,
            Utc::now(),
            crate::config::TimestampPrecision::Millis,
            &[],
        );
        assert!(engine.fix_message(session_id, &hb).is_ok());
    }

    #[test]
    fn duplicate_logon_while_bound_is_rejected() {
        let dir = tempdir().unwrap();
        let config = GatewayConfig::builder().log_file_dir(dir.path()).build();
        let engine = GatewayEngine::open(config).unwrap();
        engine.fix_logon("INIT", "ACC", false, &logon_bytes("INIT", "ACC", 1)).unwrap();
        let result = engine.fix_logon("INIT", "ACC", false, &logon_bytes("INIT", "ACC", 1));
        assert!(matches!(result, Err(Error::DuplicateSession)));
    }

    #[test]
    fn disconnect_then_relogon_reuses_session_id() {
        let dir = tempdir().unwrap();
        let config = GatewayConfig::builder().log_file_dir(dir.path()).build();
        let engine = GatewayEngine::open(config).unwrap();
        let (first_id, _) = engine.fix_logon("INIT", "ACC", false, &logon_bytes("INIT", "ACC", 1)).unwrap();
        engine.fix_disconnect(first_id);
        let (second_id, _) = engine.fix_logon("INIT", "ACC", false, &logon_bytes("INIT", "ACC", 1)).unwrap();
        assert_eq!(first_id, second_id);
    }

    #[test]
    fn reset_sequence_number_clears_known_sequence() {
        let dir = tempdir().unwrap();
        let config = GatewayConfig::builder().log_file_dir(dir.path()).build();
        let engine = GatewayEngine::open(config).unwrap();
        let (session_id, _) = engine.fix_logon("INIT", "ACC", false, &logon_bytes("INIT", "ACC", 1)).unwrap();
        engine.reset_sequence_number(session_id).unwrap();
    }
}
