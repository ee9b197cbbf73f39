//! End-to-end scenario traces exercising [`gateway_core::GatewayEngine`]
//! across both protocols, including a simulated restart against the same
//! `log_file_dir` to prove the durable indexes actually survive one.

use chrono::Utc;
use gateway_core::fix::message::{build_admin_message, AdminMsgType, FixMessage};
use gateway_core::fix::state_machine::FixAction;
use gateway_core::fixp::message::{FixPMessage, NegotiateRejectCode};
use gateway_core::fixp::state_machine::FixPAction;
use gateway_core::{AdminApi, GatewayConfig, GatewayEngine};
use tempfile::tempdir;

fn msg(msg_type: AdminMsgType, sender: &str, target: &str, seq: u32, extra: &[(u32, String)]) -> Vec<u8> {
    build_admin_message(msg_type, sender, target, seq, Utc::now(), gateway_core::TimestampPrecision::Millis, extra)
}

/// (a) FIX logon + heartbeat + clean logout.
#[test]
fn fix_logon_heartbeat_logout() {
    let dir = tempdir().unwrap();
    let config = GatewayConfig::builder().log_file_dir(dir.path()).build();
    let engine = GatewayEngine::open(config).unwrap();

    let (session_id, actions) = engine
        .fix_logon("INIT", "ACC", false, &msg(AdminMsgType::Logon, "INIT", "ACC", 1, &[(108, "30".into())]))
        .unwrap();
    assert!(matches!(actions[0], FixAction::Send(_)));

    let test_request = msg(AdminMsgType::TestRequest, "INIT", "ACC", 2, &[(112, "TR1".into())]);
    let actions = engine.fix_message(session_id, &test_request).unwrap();
    let FixAction::Send(bytes) = &actions[0] else { panic!("expected Send") };
    let reply = FixMessage::parse(bytes).unwrap();
    assert_eq!(reply.msg_type, "0");
    assert_eq!(reply.test_req_id.as_deref(), Some("TR1"));

    let logout = msg(AdminMsgType::Logout, "INIT", "ACC", 3, &[]);
    let actions = engine.fix_message(session_id, &logout).unwrap();
    assert!(actions.iter().any(|a| matches!(a, FixAction::Send(_))));

    engine.fix_disconnect(session_id);
    assert!(engine.all_sessions()[0].sequence_index == 0);
}

/// (b) FIX resend after restart: the acceptor must recover its
/// `last_received_msg_seq_num`/`last_sent` state and serve a resend request
/// spanning admin-only traffic as one coalesced gap-fill.
#[test]
fn fix_resend_after_restart() {
    let dir = tempdir().unwrap();
    let session_id = {
        let config = GatewayConfig::builder().log_file_dir(dir.path()).build();
        let engine = GatewayEngine::open(config).unwrap();
        let (session_id, _) = engine
            .fix_logon("INIT", "ACC", false, &msg(AdminMsgType::Logon, "INIT", "ACC", 1, &[(108, "30".into())]))
            .unwrap();
        engine.fix_message(session_id, &msg(AdminMsgType::TestRequest, "INIT", "ACC", 2, &[(112, "TR1".into())])).unwrap();
        engine.fix_message(session_id, &msg(AdminMsgType::Logout, "INIT", "ACC", 3, &[])).unwrap();
        engine.flush().unwrap();
        engine.fix_disconnect(session_id);
        session_id
    };

    let config = GatewayConfig::builder().log_file_dir(dir.path()).build();
    let engine = GatewayEngine::open(config).unwrap();
    let (reconnected_id, _) = engine
        .fix_logon("INIT", "ACC", false, &msg(AdminMsgType::Logon, "INIT", "ACC", 4, &[(108, "30".into())]))
        .unwrap();
    assert_eq!(reconnected_id, session_id);

    let resend = msg(AdminMsgType::ResendRequest, "INIT", "ACC", 5, &[(7, "1".into()), (16, "1".into())]);
    let actions = engine.fix_message(reconnected_id, &resend).unwrap();
    assert!(!actions.is_empty());
}

fn negotiate(session_id: u64, session_ver_id: u64) -> Vec<u8> {
    FixPMessage::Negotiate { session_id, session_ver_id, timestamp: 1000 }.encode()
}

fn establish() -> Vec<u8> {
    FixPMessage::Establish { session_id: 1, keep_alive_interval_ms: 10_000, timestamp: 2000 }.encode()
}

/// (c) FIXP negotiate -> establish -> business -> terminate.
#[test]
fn fixp_full_session_lifecycle() {
    let dir = tempdir().unwrap();
    let config = GatewayConfig::builder().log_file_dir(dir.path()).build();
    let engine = GatewayEngine::open(config).unwrap();

    let actions = engine.fixp_accept(1, &negotiate(1, 1)).unwrap();
    assert!(matches!(
        FixPMessage::decode(match &actions[0] {
            FixPAction::Send(b) => b,
            _ => panic!("expected Send"),
        })
        .unwrap(),
        FixPMessage::NegotiateResponse { .. }
    ));

    let actions = engine.fixp_message(1, &establish()).unwrap();
    assert!(matches!(
        FixPMessage::decode(match &actions[0] {
            FixPAction::Send(b) => b,
            _ => panic!("expected Send"),
        })
        .unwrap(),
        FixPMessage::EstablishAck { next_seq_no: 1, prev_seq_no: 0 }
    ));

    let terminate = FixPMessage::Terminate { reason_code: 0 }.encode();
    let actions = engine.fixp_message(1, &terminate).unwrap();
    assert!(matches!(actions[0], FixPAction::Terminate { reason_code: 0 }));
    engine.fixp_disconnect(1);
}

/// (d) FIXP retransmit after sequence gap: a `SEQUENCE` announcing a number
/// ahead of what's expected produces `NOT_APPLIED(from, count)` covering
/// exactly the skipped range.
#[test]
fn fixp_gap_triggers_not_applied_and_retransmit() {
    let dir = tempdir().unwrap();
    let config = GatewayConfig::builder().log_file_dir(dir.path()).build();
    let engine = GatewayEngine::open(config).unwrap();
    engine.fixp_accept(1, &negotiate(1, 1)).unwrap();
    engine.fixp_message(1, &establish()).unwrap();

    // Business message #1 lands normally, so the next expected number is 2.
    engine.fixp_business_message(1, 1, b"order-1".to_vec()).unwrap();

    // The peer then announces it's about to send #4, skipping 2 and 3.
    let sequence_skip = FixPMessage::Sequence { next_seq_no: 4 }.encode();
    let actions = engine.fixp_message(1, &sequence_skip).unwrap();
    let FixPAction::Send(bytes) = &actions[0] else { panic!("expected Send") };
    assert!(matches!(
        FixPMessage::decode(bytes).unwrap(),
        FixPMessage::NotApplied { from_seq_no: 2, count: 2 }
    ));
}

/// (e) FIXP duplicate negotiate with the same `session_ver_id` is rejected;
/// a strictly higher one renegotiates successfully.
#[test]
fn fixp_duplicate_negotiate_then_renegotiate() {
    let dir = tempdir().unwrap();
    let config = GatewayConfig::builder().log_file_dir(dir.path()).build();
    let engine = GatewayEngine::open(config).unwrap();
    engine.fixp_accept(1, &negotiate(1, 1)).unwrap();
    engine.fixp_message(1, &establish()).unwrap();
    let terminate_actions = engine.fixp_message(1, &FixPMessage::Terminate { reason_code: 0 }.encode()).unwrap();
    assert!(matches!(terminate_actions[0], FixPAction::Terminate { .. }));
    engine.fixp_disconnect(1);

    let actions = engine.fixp_accept(1, &negotiate(1, 1)).unwrap();
    let FixPAction::Send(bytes) = &actions[0] else { panic!("expected Send") };
    assert!(matches!(
        FixPMessage::decode(bytes).unwrap(),
        FixPMessage::NegotiateReject { reason: NegotiateRejectCode::DuplicateId, .. }
    ));
    engine.fixp_disconnect(1);

    let actions = engine.fixp_accept(1, &negotiate(1, 2)).unwrap();
    let FixPAction::Send(bytes) = &actions[0] else { panic!("expected Send") };
    assert!(matches!(FixPMessage::decode(bytes).unwrap(), FixPMessage::NegotiateResponse { .. }));
}

/// (f) Archive prune: after a session has recorded business traffic,
/// `prune_archive` reports a real, non-empty floor for its recording, and
/// stays idempotent across repeated calls.
#[test]
fn prune_archive_reflects_recorded_traffic() {
    let dir = tempdir().unwrap();
    let config = GatewayConfig::builder().log_file_dir(dir.path()).build();
    let engine = GatewayEngine::open(config).unwrap();

    let empty = engine.prune_archive().unwrap();
    assert!(empty.is_empty());

    engine.fixp_accept(1, &negotiate(1, 1)).unwrap();
    engine.fixp_message(1, &establish()).unwrap();
    engine.fixp_business_message(1, 1, b"order-1".to_vec()).unwrap();
    engine.fixp_business_message(1, 2, b"order-2".to_vec()).unwrap();

    let first = engine.prune_archive().unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].1, 1); // earliest still-live stream position

    let second = engine.prune_archive().unwrap();
    assert_eq!(first, second);
}
