//! FIXP session state machine: `ACCEPTED -> NEGOTIATED ->
//! ESTABLISHED -> [UNBINDING | SENT_FINISHED_SENDING | RECV_FINISHED_SENDING]
//! -> UNBOUND`.
//!
//! Reuses the bounded-cache/gap-coalescing shape from
//! [`crate::fix::state_machine`]: a cache hit answers a
//! `RetransmitRequest` directly, a cache miss collapses into a
//! `RetransmitReject`, mirroring how the FIX side collapses misses into a
//! `SEQUENCE_RESET(GAP_FILL=Y)`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::auth::{AuthResult, NegotiateFields, SharedAuthenticationStrategy};
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::fixp::message::{
    EstablishRejectCode, FixPMessage, NegotiateRejectCode, RetransmitRejectCode,
};
use crate::index::sequence_number_index::SequenceNumberIndex;
use crate::index::{ReplayRecord, ReplaySink};
use crate::session::SessionContext;

/// `TERMINATE` reason sent when no more specific code applies: a sequence
/// message announcing a lower-than-expected number, or a business message
/// arriving after `FINISHED_SENDING` has been sent.
const TERMINATE_REASON_UNSPECIFIED: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixPState {
    Accepted,
    Negotiated,
    Established,
    Unbinding,
    SentFinishedSending,
    RecvFinishedSending,
    Unbound,
}

/// Bounded cache of recently-sent business messages keyed by sequence
/// number, used to satisfy `RetransmitRequest`s.
struct OutboundCache {
    ring: Mutex<VecDeque<(u64, Vec<u8>)>>,
    capacity: usize,
}

impl OutboundCache {
    fn new(capacity: usize) -> Self {
        OutboundCache {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn insert(&self, seq: u64, bytes: Vec<u8>) {
        let mut ring = self.ring.lock();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back((seq, bytes));
    }

    fn get(&self, seq: u64) -> Option<Vec<u8>> {
        self.ring
            .lock()
            .iter()
            .find(|(s, _)| *s == seq)
            .map(|(_, b)| b.clone())
    }

    fn contiguous_available(&self, from: u64, count: u64) -> bool {
        let ring = self.ring.lock();
        (from..from + count).all(|seq| ring.iter().any(|(s, _)| *s == seq))
    }
}

#[derive(Debug, Clone)]
pub enum FixPAction {
    Send(Vec<u8>),
    Terminate { reason_code: u32 },
}

pub struct FixPSessionStateMachine {
    pub state: FixPState,
    session: Arc<SessionContext>,
    config: Arc<GatewayConfig>,
    seq_index: Arc<SequenceNumberIndex>,
    replay: ReplaySink,
    auth: SharedAuthenticationStrategy,
    next_sent_seq: AtomicU64,
    expected_seq: u64,
    outbound_cache: OutboundCache,
    last_inbound_at: Instant,
    keep_alive_interval: Duration,
    peer_last_seq_no: Option<u64>,
}

impl FixPSessionStateMachine {
    pub fn new(
        session: Arc<SessionContext>,
        config: Arc<GatewayConfig>,
        seq_index: Arc<SequenceNumberIndex>,
        replay: ReplaySink,
        auth: SharedAuthenticationStrategy,
    ) -> Self {
        let next_sent_seq = seq_index.last_sent_sequence_number(session.session_id) + 1;
        let expected_seq = seq_index.last_known_sequence_number(session.session_id);
        let expected_seq = if expected_seq == crate::index::sequence_number_index::UNKNOWN_SEQUENCE_NUMBER {
            1
        } else {
            expected_seq + 1
        };
        FixPSessionStateMachine {
            state: FixPState::Accepted,
            session,
            config,
            seq_index,
            replay,
            auth,
            next_sent_seq: AtomicU64::new(next_sent_seq.max(1)),
            expected_seq,
            outbound_cache: OutboundCache::new(4096),
            last_inbound_at: Instant::now(),
            keep_alive_interval: Duration::from_secs(10),
            peer_last_seq_no: None,
        }
    }

    fn allocate_seq(&self) -> u64 {
        self.next_sent_seq.fetch_add(1, Ordering::AcqRel)
    }

    fn record_outbound(&self, msg: &FixPMessage) -> Vec<u8> {
        let bytes = msg.encode();
        if let FixPMessage::Sequence { next_seq_no } = msg {
            // Sequence messages themselves aren't retransmittable business
            // traffic, only the keep-alive marker; nothing to cache.
            let _ = next_seq_no;
        }
        bytes
    }

    /// Handles one inbound framed message (already stripped of any outer
    /// transport framing beyond the SOFH itself).
    pub fn on_message(&mut self, frame: &[u8]) -> Result<Vec<FixPAction>> {
        self.last_inbound_at = Instant::now();
        let msg = FixPMessage::decode(frame).map_err(|e| Error::Protocol(e.to_string()))?;

        match (&self.state, &msg) {
            (FixPState::Accepted, FixPMessage::Negotiate { .. }) => self.handle_negotiate(&msg),
            (FixPState::Accepted, FixPMessage::Establish { .. }) => {
                let reject = FixPMessage::EstablishReject {
                    reason: EstablishRejectCode::Unnegotiated,
                };
                Ok(vec![FixPAction::Send(self.record_outbound(&reject))])
            }
            (FixPState::Negotiated, FixPMessage::Establish { .. }) => self.handle_establish(&msg),
            (FixPState::Established, FixPMessage::Establish { .. }) => {
                let reject = FixPMessage::EstablishReject {
                    reason: EstablishRejectCode::AlreadyEstablished,
                };
                Ok(vec![FixPAction::Send(self.record_outbound(&reject))])
            }
            (FixPState::Established, FixPMessage::RetransmitRequest { .. }) => {
                self.handle_retransmit_request(&msg)
            }
            (FixPState::Established, FixPMessage::Sequence { next_seq_no }) => {
                self.handle_sequence(*next_seq_no)
            }
            (FixPState::Established, FixPMessage::NotApplied { from_seq_no, count }) => {
                self.handle_not_applied(*from_seq_no, *count)
            }
            (FixPState::Established, FixPMessage::FinishedSending { last_seq_no }) => {
                self.state = FixPState::RecvFinishedSending;
                let _ = last_seq_no;
                Ok(vec![FixPAction::Send(self.record_outbound(&FixPMessage::FinishedReceiving))])
            }
            (_, FixPMessage::Terminate { reason_code }) => {
                self.state = FixPState::Unbound;
                Ok(vec![FixPAction::Terminate {
                    reason_code: *reason_code,
                }])
            }
            (FixPState::Negotiated, FixPMessage::Negotiate { .. }) => {
                // Duplicate Negotiate while awaiting Establish: re-answer rather
                // than treat it as a protocol violation.
                self.handle_negotiate(&msg)
            }
            (FixPState::Unbound, FixPMessage::Negotiate { .. }) => {
                // Renegotiation after a finished-sending/finished-receiving
                // teardown is allowed only with a strictly higher
                // session_ver_id; handle_negotiate enforces that.
                self.handle_negotiate(&msg)
            }
            _ => Err(Error::InvalidState(format!(
                "unexpected message in state {:?}",
                self.state
            ))),
        }
    }

    fn handle_negotiate(&mut self, msg: &FixPMessage) -> Result<Vec<FixPAction>> {
        let FixPMessage::Negotiate {
            session_id,
            session_ver_id,
            timestamp,
        } = msg
        else {
            unreachable!()
        };

        // A session that has completed finished-sending/finished-receiving
        // may only be reopened with a strictly higher session_ver_id; the
        // same or a lower one is rejected as a duplicate.
        let last_negotiated = self.session.session_version_id.load(Ordering::Acquire);
        let already_ended = self.session.ended.load(Ordering::Acquire);
        if already_ended && *session_ver_id <= last_negotiated {
            let reject = FixPMessage::NegotiateReject {
                session_id: *session_id,
                reason: NegotiateRejectCode::DuplicateId,
            };
            return Ok(vec![FixPAction::Send(self.record_outbound(&reject))]);
        }

        let fields = NegotiateFields {
            session_id: *session_id,
            session_ver_id: *session_ver_id,
            entering_firm: None,
            credentials: None,
        };
        if let AuthResult::Reject { .. } = self.auth.authenticate_fixp(&fields) {
            let reject = FixPMessage::NegotiateReject {
                session_id: *session_id,
                reason: NegotiateRejectCode::Credentials,
            };
            return Ok(vec![FixPAction::Send(self.record_outbound(&reject))]);
        }

        self.session
            .session_version_id
            .store(*session_ver_id, Ordering::Release);
        if *session_ver_id > last_negotiated {
            self.session.ended.store(false, Ordering::Release);
            self.expected_seq = 1;
            self.next_sent_seq.store(1, Ordering::Release);
        }
        self.state = FixPState::Negotiated;
        let response = FixPMessage::NegotiateResponse {
            session_id: *session_id,
            request_timestamp: *timestamp,
        };
        Ok(vec![FixPAction::Send(self.record_outbound(&response))])
    }

    fn handle_establish(&mut self, msg: &FixPMessage) -> Result<Vec<FixPAction>> {
        let FixPMessage::Establish {
            session_id,
            keep_alive_interval_ms,
            ..
        } = msg
        else {
            unreachable!()
        };

        if *keep_alive_interval_ms == 0 {
            let reject = FixPMessage::EstablishReject {
                reason: EstablishRejectCode::KeepaliveInterval,
            };
            return Ok(vec![FixPAction::Send(self.record_outbound(&reject))]);
        }

        self.keep_alive_interval = Duration::from_millis(*keep_alive_interval_ms as u64);
        self.state = FixPState::Established;
        let ack = FixPMessage::EstablishAck {
            next_seq_no: self.next_sent_seq.load(Ordering::Acquire),
            prev_seq_no: self.expected_seq.saturating_sub(1),
        };
        let _ = session_id;
        Ok(vec![FixPAction::Send(self.record_outbound(&ack))])
    }

    /// Accepts (or rejects) one business message already validated at the
    /// transport layer, caching it for retransmission and recording its
    /// sequence number durably.
    pub fn accept_business_message(&mut self, seq_no: u64, bytes: Vec<u8>) -> Result<Vec<FixPAction>> {
        if self.state != FixPState::Established {
            return Err(Error::InvalidState(
                "business message outside ESTABLISHED".into(),
            ));
        }
        if seq_no > self.expected_seq {
            let not_applied = FixPMessage::NotApplied {
                from_seq_no: self.expected_seq,
                count: seq_no - self.expected_seq,
            };
            self.expected_seq = seq_no + 1;
            return Ok(vec![FixPAction::Send(self.record_outbound(&not_applied))]);
        }
        if seq_no < self.expected_seq {
            return Ok(vec![]); // already-applied duplicate, drop silently
        }
        self.expected_seq += 1;
        let sequence_index = self.session.sequence_index.load(Ordering::Acquire);
        let position = self.replay.next_position();
        self.replay.inbound.append(ReplayRecord {
            stream_position: position,
            sequence_index,
            sequence_number: seq_no,
            recording_id: self.replay.recording_id,
            length: bytes.len() as u32,
        });
        self.seq_index.record(self.session.session_id, seq_no, sequence_index, position);
        Ok(vec![])
    }

    /// Allocates the next outbound sequence number for a business message and
    /// caches its bytes for retransmission.
    pub fn send_business_message(&self, bytes: Vec<u8>) -> u64 {
        let seq = self.allocate_seq();
        let length = bytes.len() as u32;
        self.outbound_cache.insert(seq, bytes);
        let position = self.replay.next_position();
        self.replay.outbound.append(ReplayRecord {
            stream_position: position,
            sequence_index: self.session.sequence_index.load(Ordering::Acquire),
            sequence_number: seq,
            recording_id: self.replay.recording_id,
            length,
        });
        self.seq_index.record_sent(self.session.session_id, seq);
        seq
    }

    fn handle_retransmit_request(&mut self, msg: &FixPMessage) -> Result<Vec<FixPAction>> {
        let FixPMessage::RetransmitRequest {
            from_seq_no, count, ..
        } = msg
        else {
            unreachable!()
        };

        if *count > self.config.max_retransmission_range {
            let reject = FixPMessage::RetransmitReject {
                reason: RetransmitRejectCode::RequestLimitExceeded,
            };
            return Ok(vec![FixPAction::Send(self.record_outbound(&reject))]);
        }
        if !self.outbound_cache.contiguous_available(*from_seq_no, *count) {
            let reject = FixPMessage::RetransmitReject {
                reason: RetransmitRejectCode::OutOfRange,
            };
            return Ok(vec![FixPAction::Send(self.record_outbound(&reject))]);
        }

        let mut actions = vec![FixPAction::Send(self.record_outbound(&FixPMessage::Retransmission {
            from_seq_no: *from_seq_no,
            count: *count,
        }))];
        for seq in *from_seq_no..*from_seq_no + *count {
            if let Some(bytes) = self.outbound_cache.get(seq) {
                actions.push(FixPAction::Send(bytes));
            }
        }
        Ok(actions)
    }

    /// Handles an inbound keep-alive `Sequence`, which announces the next
    /// sequence number the peer will use. A number ahead of what's expected
    /// means intervening messages were skipped; a number behind it is a
    /// protocol violation.
    fn handle_sequence(&mut self, next_seq_no: u64) -> Result<Vec<FixPAction>> {
        if next_seq_no < self.expected_seq {
            self.state = FixPState::Unbound;
            return Ok(vec![FixPAction::Terminate {
                reason_code: TERMINATE_REASON_UNSPECIFIED,
            }]);
        }
        if next_seq_no > self.expected_seq {
            let not_applied = FixPMessage::NotApplied {
                from_seq_no: self.expected_seq,
                count: next_seq_no - self.expected_seq,
            };
            self.expected_seq = next_seq_no;
            self.peer_last_seq_no = Some(next_seq_no);
            return Ok(vec![FixPAction::Send(self.record_outbound(&not_applied))]);
        }
        self.peer_last_seq_no = Some(next_seq_no);
        Ok(vec![])
    }

    fn handle_not_applied(&mut self, from_seq_no: u64, count: u64) -> Result<Vec<FixPAction>> {
        if count == 0 {
            return Ok(vec![]);
        }
        let request = FixPMessage::RetransmitRequest {
            session_id: self.session.session_id,
            from_seq_no,
            count,
        };
        Ok(vec![FixPAction::Send(self.record_outbound(&request))])
    }

    /// Begins the orderly-close handshake: emits
    /// `FinishedSending` and moves to `SENT_FINISHED_SENDING`.
    pub fn begin_unbind(&mut self) -> Vec<FixPAction> {
        self.state = FixPState::SentFinishedSending;
        let last_seq_no = self.next_sent_seq.load(Ordering::Acquire).saturating_sub(1);
        vec![FixPAction::Send(self.record_outbound(&FixPMessage::FinishedSending {
            last_seq_no,
        }))]
    }

    /// Called by the liveness timer: emits a keep-alive `Sequence` message if
    /// nothing has been sent recently, or reports the session should be
    /// terminated if the peer has gone silent past the negotiated interval.
    pub fn on_timer_tick(&mut self) -> Vec<FixPAction> {
        if self.state != FixPState::Established {
            return vec![];
        }
        if self.last_inbound_at.elapsed() > self.keep_alive_interval * 2 {
            self.state = FixPState::Unbound;
            return vec![FixPAction::Terminate { reason_code: 1 }];
        }
        let next_seq_no = self.next_sent_seq.load(Ordering::Acquire);
        vec![FixPAction::Send(self.record_outbound(&FixPMessage::Sequence { next_seq_no }))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NullAuthenticationStrategy;
    use crate::session::{SessionKey, SessionsRegistry};
    use tempfile::tempdir;

    fn make_sm(dir: &std::path::Path) -> FixPSessionStateMachine {
        let registry = SessionsRegistry::new();
        let session = registry.bind(SessionKey::FixP { session_id: 7 }, false).unwrap();
        let seq_index = Arc::new(SequenceNumberIndex::open(dir, Duration::from_millis(1), 1).unwrap());
        let replay = crate::index::test_replay_sink(dir, session.session_id);
        FixPSessionStateMachine::new(
            session,
            Arc::new(GatewayConfig::default()),
            seq_index,
            replay,
            Arc::new(NullAuthenticationStrategy),
        )
    }

    fn negotiate(session_id: u64) -> Vec<u8> {
        FixPMessage::Negotiate {
            session_id,
            session_ver_id: 1,
            timestamp: 1000,
        }
        .encode()
    }

    fn establish(session_id: u64) -> Vec<u8> {
        FixPMessage::Establish {
            session_id,
            keep_alive_interval_ms: 5000,
            timestamp: 2000,
        }
        .encode()
    }

    #[test]
    fn negotiate_transitions_to_negotiated() {
        let dir = tempdir().unwrap();
        let mut sm = make_sm(dir.path());
        let actions = sm.on_message(&negotiate(7)).unwrap();
        assert_eq!(sm.state, FixPState::Negotiated);
        assert!(matches!(actions[0], FixPAction::Send(_)));
    }

    #[test]
    fn establish_after_negotiate_reaches_established() {
        let dir = tempdir().unwrap();
        let mut sm = make_sm(dir.path());
        sm.on_message(&negotiate(7)).unwrap();
        let actions = sm.on_message(&establish(7)).unwrap();
        assert_eq!(sm.state, FixPState::Established);
        let FixPAction::Send(bytes) = &actions[0] else {
            panic!("expected Send")
        };
        assert!(matches!(FixPMessage::decode(bytes).unwrap(), FixPMessage::EstablishAck { .. }));
    }

    #[test]
    fn establish_before_negotiate_is_rejected() {
        let dir = tempdir().unwrap();
        let mut sm = make_sm(dir.path());
        let result = sm.on_message(&establish(7));
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[test]
    fn retransmit_request_outside_cache_is_rejected() {
        let dir = tempdir().unwrap();
        let mut sm = make_sm(dir.path());
        sm.on_message(&negotiate(7)).unwrap();
        sm.on_message(&establish(7)).unwrap();

        let request = FixPMessage::RetransmitRequest {
            session_id: 7,
            from_seq_no: 1,
            count: 5,
        }
        .encode();
        let actions = sm.on_message(&request).unwrap();
        let FixPAction::Send(bytes) = &actions[0] else {
            panic!("expected Send")
        };
        assert!(matches!(
            FixPMessage::decode(bytes).unwrap(),
            FixPMessage::RetransmitReject {
                reason: RetransmitRejectCode::OutOfRange
            }
        ));
    }

    #[test]
    fn retransmit_request_served_from_cache() {
        let dir = tempdir().unwrap();
        let mut sm = make_sm(dir.path());
        sm.on_message(&negotiate(7)).unwrap();
        sm.on_message(&establish(7)).unwrap();

        let seq1 = sm.send_business_message(b"order-1".to_vec());
        let seq2 = sm.send_business_message(b"order-2".to_vec());
        assert_eq!(seq2, seq1 + 1);

        let request = FixPMessage::RetransmitRequest {
            session_id: 7,
            from_seq_no: seq1,
            count: 2,
        }
        .encode();
        let actions = sm.on_message(&request).unwrap();
        assert_eq!(actions.len(), 3); // Retransmission header + 2 messages
    }

    #[test]
    fn gap_in_business_sequence_triggers_not_applied() {
        let dir = tempdir().unwrap();
        let mut sm = make_sm(dir.path());
        sm.on_message(&negotiate(7)).unwrap();
        sm.on_message(&establish(7)).unwrap();

        let actions = sm.accept_business_message(5, b"order".to_vec()).unwrap();
        let FixPAction::Send(bytes) = &actions[0] else {
            panic!("expected Send")
        };
        assert!(matches!(FixPMessage::decode(bytes).unwrap(), FixPMessage::NotApplied { .. }));
    }

    #[test]
    fn terminate_moves_to_unbound_from_any_state() {
        let dir = tempdir().unwrap();
        let mut sm = make_sm(dir.path());
        let actions = sm
            .on_message(&FixPMessage::Terminate { reason_code: 3 }.encode())
            .unwrap();
        assert_eq!(sm.state, FixPState::Unbound);
        assert!(matches!(actions[0], FixPAction::Terminate { reason_code: 3 }));
    }
}
