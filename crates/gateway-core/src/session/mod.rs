//! Session identity and the gateway-wide sessions registry: looking up or
//! creating a [`SessionContext`] by protocol-specific key, and guarding
//! against two connections claiming the same session.
//!
//! The registry is a [`DashMap`], sharded internally so a lookup for one
//! session never blocks a bind for another.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{Error, Result};

/// Protocol-specific identification tuple a counterparty presents at
/// logon/negotiate time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Fix {
        sender_comp_id: String,
        target_comp_id: String,
    },
    FixP {
        session_id: u64,
    },
}

/// Stable per-session state that outlives any one connection.
pub struct SessionContext {
    pub session_id: u64,
    pub key: SessionKey,
    pub sequence_index: AtomicU32,
    pub session_version_id: AtomicU64,
    pub last_logon_time: RwLock<Option<Instant>>,
    pub last_sequence_reset_time: RwLock<Option<Instant>>,
    /// `true` once a FIXP session has completed its finished-sending /
    /// finished-receiving handshake and been torn down (§4.6); the same
    /// `session_version_id` can then never be re-established.
    pub ended: std::sync::atomic::AtomicBool,
    /// `true` while a connection currently owns this session.
    bound: std::sync::atomic::AtomicBool,
}

impl SessionContext {
    fn new(session_id: u64, key: SessionKey) -> Self {
        SessionContext {
            session_id,
            key,
            sequence_index: AtomicU32::new(0),
            session_version_id: AtomicU64::new(0),
            last_logon_time: RwLock::new(None),
            last_sequence_reset_time: RwLock::new(None),
            ended: std::sync::atomic::AtomicBool::new(false),
            bound: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    fn bind(&self) -> bool {
        self.bound
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn unbind(&self) {
        self.bound.store(false, Ordering::Release);
    }
}

/// Gateway-wide map of `SessionKey -> SessionContext`.
pub struct SessionsRegistry {
    by_key: DashMap<SessionKey, Arc<SessionContext>>,
    next_session_id: AtomicU64,
}

impl Default for SessionsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionsRegistry {
    pub fn new() -> Self {
        SessionsRegistry {
            by_key: DashMap::new(),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Handles a logon/negotiate attempt: binds the caller to either a fresh
    /// or a pre-existing offline [`SessionContext`], or reports
    /// [`Error::DuplicateSession`] if another connection already holds it.
    ///
    /// `reset_sequence` mirrors `ResetSeqNumFlag=Y` (FIX) / an explicit
    /// renegotiation policy (FIXP): when true, `sequence_index` is
    /// incremented before the context is handed back.
    pub fn bind(&self, key: SessionKey, reset_sequence: bool) -> Result<Arc<SessionContext>> {
        match self.by_key.entry(key) {
            Entry::Occupied(entry) => {
                let ctx = entry.get();
                if !ctx.bind() {
                    return Err(Error::DuplicateSession);
                }
                if reset_sequence {
                    ctx.sequence_index.fetch_add(1, Ordering::AcqRel);
                }
                Ok(Arc::clone(ctx))
            }
            Entry::Vacant(entry) => {
                let session_id = self.next_session_id.fetch_add(1, Ordering::AcqRel);
                let ctx = Arc::new(SessionContext::new(session_id, entry.key().clone()));
                ctx.bind();
                entry.insert(Arc::clone(&ctx));
                Ok(ctx)
            }
        }
    }

    pub fn lookup(&self, key: &SessionKey) -> Option<Arc<SessionContext>> {
        self.by_key.get(key).map(|r| Arc::clone(r.value()))
    }

    pub fn all_sessions(&self) -> Vec<Arc<SessionContext>> {
        self.by_key.iter().map(|r| Arc::clone(r.value())).collect()
    }

    pub fn lookup_session_id(&self, key: &SessionKey) -> Option<u64> {
        self.lookup(key).map(|ctx| ctx.session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix_key(s: &str) -> SessionKey {
        SessionKey::Fix {
            sender_comp_id: s.to_string(),
            target_comp_id: "ACC".to_string(),
        }
    }

    #[test]
    fn first_bind_creates_fresh_context() {
        let registry = SessionsRegistry::new();
        let ctx = registry.bind(fix_key("A"), false).unwrap();
        assert_eq!(ctx.sequence_index.load(Ordering::Acquire), 0);
    }

    #[test]
    fn second_bind_while_bound_is_duplicate() {
        let registry = SessionsRegistry::new();
        let _ctx = registry.bind(fix_key("A"), false).unwrap();
        let result = registry.bind(fix_key("A"), false);
        assert!(matches!(result, Err(Error::DuplicateSession)));
    }

    #[test]
    fn unbind_then_rebind_reuses_session_id() {
        let registry = SessionsRegistry::new();
        let ctx = registry.bind(fix_key("A"), false).unwrap();
        let id = ctx.session_id;
        ctx.unbind();
        let ctx2 = registry.bind(fix_key("A"), false).unwrap();
        assert_eq!(ctx2.session_id, id);
    }

    #[test]
    fn reset_sequence_increments_index() {
        let registry = SessionsRegistry::new();
        let ctx = registry.bind(fix_key("A"), false).unwrap();
        ctx.unbind();
        let ctx2 = registry.bind(fix_key("A"), true).unwrap();
        assert_eq!(ctx2.sequence_index.load(Ordering::Acquire), 1);
    }
}
