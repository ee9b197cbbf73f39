//! FIX session state machine: `CONNECTED -> SENT_LOGON -> ACTIVE
//! -> [AWAITING_LOGOUT ->] DISCONNECTED`, with `DISABLED` as the terminal
//! state after a library timeout.
//!
//! The outbound message cache-and-replay logic is a bounded ring with
//! eviction on capacity and lock-poison recovery: a cache hit answers a
//! resend request directly, a cache miss collects the range into a
//! `SEQUENCE_RESET(GAP_FILL=Y)`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;

use crate::auth::{AuthResult, LogonFields, SharedAuthenticationStrategy};
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::fix::message::{build_admin_message, set_poss_dup, AdminMsgType, FixMessage};
use crate::index::sequence_number_index::SequenceNumberIndex;
use crate::index::{ReplayRecord, ReplaySink};
use crate::session::SessionContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixState {
    Connected,
    SentLogon,
    Active,
    AwaitingLogout,
    Disconnected,
    Disabled,
}

/// Bounded cache of recently-sent messages keyed by `MsgSeqNum`, used to
/// satisfy `RESEND_REQUEST`s without reaching into the archive.
struct OutboundCache {
    ring: Mutex<VecDeque<(u32, Vec<u8>)>>,
    capacity: usize,
}

impl OutboundCache {
    fn new(capacity: usize) -> Self {
        OutboundCache {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn insert(&self, seq: u32, bytes: Vec<u8>) {
        let mut ring = self.ring.lock();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back((seq, bytes));
    }

    fn get(&self, seq: u32) -> Option<Vec<u8>> {
        self.ring
            .lock()
            .iter()
            .find(|(s, _)| *s == seq)
            .map(|(_, b)| b.clone())
    }
}

/// One outbound item produced in response to inbound traffic: either a raw
/// frame to send as-is, or an instruction the caller renders into bytes.
#[derive(Debug, Clone)]
pub enum FixAction {
    Send(Vec<u8>),
    Disconnect { reason: String },
}

pub struct FixSessionStateMachine {
    pub state: FixState,
    session: Arc<SessionContext>,
    config: Arc<GatewayConfig>,
    seq_index: Arc<SequenceNumberIndex>,
    replay: ReplaySink,
    auth: SharedAuthenticationStrategy,
    sender_comp_id: String,
    target_comp_id: String,
    next_sent_seq: AtomicU32,
    expected_seq: u32,
    outbound_cache: OutboundCache,
    last_inbound_at: Instant,
    pending_test_req_id: Option<String>,
    outstanding_resend_requests: u32,
}

impl FixSessionStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<SessionContext>,
        config: Arc<GatewayConfig>,
        seq_index: Arc<SequenceNumberIndex>,
        replay: ReplaySink,
        auth: SharedAuthenticationStrategy,
        sender_comp_id: String,
        target_comp_id: String,
    ) -> Self {
        let next_sent_seq = seq_index.last_sent_sequence_number(session.session_id) as u32 + 1;
        let expected_seq = seq_index.last_known_sequence_number(session.session_id);
        let expected_seq = if expected_seq == crate::index::sequence_number_index::UNKNOWN_SEQUENCE_NUMBER {
            1
        } else {
            expected_seq as u32 + 1
        };
        FixSessionStateMachine {
            state: FixState::Connected,
            session,
            config,
            seq_index,
            replay,
            auth,
            sender_comp_id,
            target_comp_id,
            next_sent_seq: AtomicU32::new(next_sent_seq.max(1)),
            expected_seq,
            outbound_cache: OutboundCache::new(4096),
            last_inbound_at: Instant::now(),
            pending_test_req_id: None,
            outstanding_resend_requests: 0,
        }
    }

    fn allocate_seq(&self) -> u32 {
        self.next_sent_seq.fetch_add(1, Ordering::AcqRel)
    }

    /// Encodes and caches one outbound admin message, returning the bytes to
    /// send.
    fn emit_admin(&self, msg_type: AdminMsgType, extra: &[(u32, String)]) -> Vec<u8> {
        let seq = self.allocate_seq();
        let bytes = build_admin_message(
            msg_type,
            &self.sender_comp_id,
            &self.target_comp_id,
            seq,
            Utc::now(),
            self.config.fix_timestamp_precision,
            extra,
        );
        self.outbound_cache.insert(seq, bytes.clone());
        self.replay.outbound.append(ReplayRecord {
            stream_position: self.replay.next_position(),
            sequence_index: self.session.sequence_index.load(Ordering::Acquire),
            sequence_number: seq as u64,
            recording_id: self.replay.recording_id,
            length: bytes.len() as u32,
        });
        self.seq_index.record_sent(self.session.session_id, seq as u64);
        bytes
    }

    /// Handles one inbound frame, advancing the state machine and returning
    /// zero or more outbound actions.
    pub fn on_message(&mut self, raw: &[u8]) -> Result<Vec<FixAction>> {
        self.last_inbound_at = Instant::now();
        let msg = FixMessage::parse(raw).map_err(|e| Error::Protocol(e.to_string()))?;

        if msg.sender_comp_id != self.target_comp_id || msg.target_comp_id != self.sender_comp_id {
            return Ok(vec![FixAction::Disconnect {
                reason: "COMPID_PROBLEM".into(),
            }]);
        }
        if let Some(sending_time) = msg.sending_time {
            let skew = (Utc::now() - sending_time).num_milliseconds().unsigned_abs();
            if skew > self.config.fix_send_window.as_millis() as u64 {
                return Ok(vec![FixAction::Disconnect {
                    reason: "SENDING_TIME_ACCURACY".into(),
                }]);
            }
        }

        match msg.admin_type() {
            Some(AdminMsgType::Logon) => self.handle_logon(&msg),
            _ => self.handle_sequenced(&msg, raw),
        }
    }

    fn handle_logon(&mut self, msg: &FixMessage) -> Result<Vec<FixAction>> {
        let fields = LogonFields {
            sender_comp_id: &msg.sender_comp_id,
            target_comp_id: &msg.target_comp_id,
            raw_data: None,
            username: None,
        };
        if let AuthResult::Reject { reason } = self.auth.authenticate_fix(&fields) {
            return Ok(vec![FixAction::Disconnect { reason }]);
        }

        if msg.reset_seq_num_flag {
            self.expected_seq = 1;
            self.next_sent_seq.store(1, Ordering::Release);
        }

        let ordering = self.accept_sequence(msg);
        self.state = FixState::Active;
        let reply = self.emit_admin(
            AdminMsgType::Logon,
            &[(108, self.config.heartbeat_interval.as_secs().to_string())],
        );
        let mut actions = vec![FixAction::Send(reply)];
        actions.extend(ordering?);
        Ok(actions)
    }

    /// Shared sequencing logic for every non-Logon message:
    /// in order -> accept, ahead -> resend-request the gap, behind -> ignore
    /// if PossDup else logout.
    fn handle_sequenced(&mut self, msg: &FixMessage, raw: &[u8]) -> Result<Vec<FixAction>> {
        if msg.admin_type() == Some(AdminMsgType::ResendRequest) {
            // ResendRequest itself doesn't have to be in-sequence to be served.
            return self.handle_resend_request(msg);
        }
        let mut actions = self.accept_sequence(msg)?;

        match msg.admin_type() {
            Some(AdminMsgType::TestRequest) => {
                if let Some(id) = &msg.test_req_id {
                    actions.push(FixAction::Send(
                        self.emit_admin(AdminMsgType::Heartbeat, &[(112, id.clone())]),
                    ));
                }
            }
            Some(AdminMsgType::SequenceReset) => {
                // handled inside accept_sequence's gap-fill branch
            }
            Some(AdminMsgType::Logout) => {
                let reply = self.emit_admin(AdminMsgType::Logout, &[]);
                self.state = FixState::Disconnected;
                actions.push(FixAction::Send(reply));
            }
            _ => {
                if !msg.is_admin() {
                    let sequence_index = self.session.sequence_index.load(Ordering::Acquire);
                    let position = self.replay.next_position();
                    self.replay.inbound.append(ReplayRecord {
                        stream_position: position,
                        sequence_index,
                        sequence_number: msg.msg_seq_num as u64,
                        recording_id: self.replay.recording_id,
                        length: raw.len() as u32,
                    });
                    self.seq_index.record(
                        self.session.session_id,
                        msg.msg_seq_num as u64,
                        sequence_index,
                        position,
                    );
                }
            }
        }
        Ok(actions)
    }

    fn accept_sequence(&mut self, msg: &FixMessage) -> Result<Vec<FixAction>> {
        use std::cmp::Ordering as Ord;
        match msg.msg_seq_num.cmp(&self.expected_seq) {
            Ord::Equal => {
                if let Some(new_seq_no) = msg.new_seq_no.filter(|_| msg.gap_fill_flag) {
                    self.expected_seq = new_seq_no;
                } else {
                    self.expected_seq += 1;
                }
                Ok(vec![])
            }
            Ord::Greater => {
                let gap_begin = self.expected_seq;
                let reply = self.emit_admin(
                    AdminMsgType::ResendRequest,
                    &[(7, gap_begin.to_string()), (16, "0".to_string())],
                );
                Ok(vec![FixAction::Send(reply)])
            }
            Ord::Less => {
                if msg.poss_dup_flag {
                    Ok(vec![])
                } else {
                    Err(Error::SequenceTooLow {
                        expected: self.expected_seq as u64,
                        received: msg.msg_seq_num as u64,
                    })
                }
            }
        }
    }

    /// Services a `RESEND_REQUEST(begin, end)`.
    /// `end == 0` means "to the highest sequence number sent so far".
    fn handle_resend_request(&mut self, msg: &FixMessage) -> Result<Vec<FixAction>> {
        let begin = msg.begin_seq_no.unwrap_or(1);
        let highest_sent = self.next_sent_seq.load(Ordering::Acquire).saturating_sub(1);
        let end = match msg.end_seq_no {
            Some(0) | None => highest_sent,
            Some(e) => e,
        };

        if end.saturating_sub(begin) as u64 > self.config.max_retransmission_range {
            return Err(Error::ReplayLimitExceeded);
        }
        self.outstanding_resend_requests += 1;
        if self.outstanding_resend_requests > 4 {
            log::debug!("[FixSessionStateMachine] dropping duplicate ResendRequest");
            return Ok(vec![]);
        }

        let mut actions = Vec::new();
        let mut gap_start: Option<u32> = None;

        let mut seq = begin;
        while seq <= end {
            match self.outbound_cache.get(seq) {
                Some(bytes) => {
                    if let Some(start) = gap_start.take() {
                        actions.push(FixAction::Send(self.gap_fill(start, seq)));
                    }
                    let cached = FixMessage::parse(&bytes).map_err(|e| Error::Protocol(e.to_string()))?;
                    let orig_sending_time = cached.sending_time.unwrap_or_else(Utc::now);
                    let resend = set_poss_dup(&bytes, orig_sending_time, self.config.fix_timestamp_precision);
                    actions.push(FixAction::Send(resend));
                }
                None => {
                    if gap_start.is_none() {
                        gap_start = Some(seq);
                    }
                }
            }
            seq += 1;
        }
        if let Some(start) = gap_start {
            actions.push(FixAction::Send(self.gap_fill(start, end + 1)));
        }
        self.outstanding_resend_requests = self.outstanding_resend_requests.saturating_sub(1);
        Ok(actions)
    }

    /// Coalesces a contiguous missing range into one `SEQUENCE_RESET(GAP_FILL=Y)`.
    fn gap_fill(&self, begin: u32, new_seq_no: u32) -> Vec<u8> {
        build_admin_message(
            AdminMsgType::SequenceReset,
            &self.sender_comp_id,
            &self.target_comp_id,
            begin,
            Utc::now(),
            self.config.fix_timestamp_precision,
            &[(123, "Y".into()), (36, new_seq_no.to_string()), (43, "Y".into())],
        )
    }

    /// Called by the liveness timer: emits a `TEST_REQUEST` if nothing has
    /// arrived within `heartbeat_interval`, or reports that the session
    /// should be disconnected if a previous test request went unanswered.
    pub fn on_timer_tick(&mut self) -> Vec<FixAction> {
        if self.last_inbound_at.elapsed() < self.config.heartbeat_interval {
            return vec![];
        }
        if self.pending_test_req_id.is_some() {
            self.state = FixState::Disconnected;
            return vec![FixAction::Disconnect {
                reason: "test request unanswered".into(),
            }];
        }
        let id = format!("TR{}", self.allocate_seq());
        self.pending_test_req_id = Some(id.clone());
        vec![FixAction::Send(
            self.emit_admin(AdminMsgType::TestRequest, &[(112, id)]),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NullAuthenticationStrategy;
    use crate::session::{SessionKey, SessionsRegistry};
    use tempfile::tempdir;

    fn make_sm(dir: &std::path::Path) -> FixSessionStateMachine {
        let registry = SessionsRegistry::new();
        let session = registry
            .bind(
                SessionKey::Fix {
                    sender_comp_id: "ACC".into(),
                    target_comp_id: "INIT".into(),
                },
                false,
            )
            .unwrap();
        let seq_index = Arc::new(SequenceNumberIndex::open(dir, Duration::from_millis(1), 1).unwrap());
        let replay = crate::index::test_replay_sink(dir, session.session_id);
        FixSessionStateMachine::new(
            session,
            Arc::new(GatewayConfig::default()),
            seq_index,
            replay,
            Arc::new(NullAuthenticationStrategy),
            "ACC".into(),
            "INIT".into(),
        )
    }

    fn logon_bytes(seq: u32) -> Vec<u8> {
        build_admin_message(
            AdminMsgType::Logon,
            "INIT",
            "ACC",
            seq,
            Utc::now(),
            crate::config::TimestampPrecision::Millis,
            &[(108, "30".into())],
        )
    }

    #[test]
    fn logon_transitions_to_active() {
        let dir = tempdir().unwrap();
        let mut sm = make_sm(dir.path());
        let actions = sm.on_message(&logon_bytes(1)).unwrap();
        assert_eq!(sm.state, FixState::Active);
        assert!(matches!(actions[0], FixAction::Send(_)));
    }

    #[test]
    fn heartbeat_echoes_test_req_id() {
        let dir = tempdir().unwrap();
        let mut sm = make_sm(dir.path());
        sm.on_message(&logon_bytes(1)).unwrap();

        let test_req = build_admin_message(
            AdminMsgType::TestRequest,
            "INIT",
            "ACC",
            2,
            Utc::now(),
            crate::config::TimestampPrecision::Millis,
            &[(112, "TR1".into())],
        );
        let actions = sm.on_message(&test_req).unwrap();
        let FixAction::Send(bytes) = &actions[0] else {
            panic!("expected Send action")
        };
        let reply = FixMessage::parse(bytes).unwrap();
        assert_eq!(reply.msg_type, "0");
        assert_eq!(reply.test_req_id.as_deref(), Some("TR1"));
    }

    #[test]
    fn gap_triggers_resend_request() {
        let dir = tempdir().unwrap();
        let mut sm = make_sm(dir.path());
        sm.on_message(&logon_bytes(1)).unwrap();

        let skipped = build_admin_message(
            AdminMsgType::TestRequest,
            "INIT",
            "ACC",
            5,
            Utc::now(),
            crate::config::TimestampPrecision::Millis,
            &[(112, "TR9".into())],
        );
        let actions = sm.on_message(&skipped).unwrap();
        let FixAction::Send(bytes) = &actions[0] else {
            panic!("expected Send action")
        };
        let reply = FixMessage::parse(bytes).unwrap();
        assert_eq!(reply.msg_type, "2"); // ResendRequest
        assert_eq!(reply.begin_seq_no, Some(2));
    }

    #[test]
    fn low_seq_without_poss_dup_is_rejected() {
        let dir = tempdir().unwrap();
        let mut sm = make_sm(dir.path());
        sm.on_message(&logon_bytes(1)).unwrap();
        sm.expected_seq = 10;

        let low = build_admin_message(
            AdminMsgType::TestRequest,
            "INIT",
            "ACC",
            3,
            Utc::now(),
            crate::config::TimestampPrecision::Millis,
            &[(112, "TR2".into())],
        );
        let result = sm.on_message(&low);
        assert!(matches!(result, Err(Error::SequenceTooLow { .. })));
    }

    #[test]
    fn resend_request_serves_cached_message() {
        let dir = tempdir().unwrap();
        let mut sm = make_sm(dir.path());
        sm.on_message(&logon_bytes(1)).unwrap();
        sm.on_timer_tick(); // seq 2, cached

        let resend = build_admin_message(
            AdminMsgType::ResendRequest,
            "INIT",
            "ACC",
            3,
            Utc::now(),
            crate::config::TimestampPrecision::Millis,
            &[(7, "2".into()), (16, "2".into())],
        );
        let actions = sm.on_message(&resend).unwrap();
        assert!(!actions.is_empty());
    }

    #[test]
    fn resend_request_republishes_cached_bytes_with_poss_dup() {
        let dir = tempdir().unwrap();
        let mut sm = make_sm(dir.path());
        sm.on_message(&logon_bytes(1)).unwrap();
        let heartbeat = sm.emit_admin(AdminMsgType::Heartbeat, &[]); // seq 2, cached
        let _ = heartbeat;

        let resend = build_admin_message(
            AdminMsgType::ResendRequest,
            "INIT",
            "ACC",
            3,
            Utc::now(),
            crate::config::TimestampPrecision::Millis,
            &[(7, "2".into()), (16, "2".into())],
        );
        let actions = sm.on_message(&resend).unwrap();
        let FixAction::Send(bytes) = &actions[0] else {
            panic!("expected Send action")
        };
        let resent = FixMessage::parse(bytes).unwrap();
        assert!(resent.poss_dup_flag);
        assert!(resent.orig_sending_time.is_some());
        assert_eq!(resent.msg_type, "0");
        assert_eq!(resent.msg_seq_num, 2);
    }
}
