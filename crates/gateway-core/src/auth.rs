//! Authentication/customisation seam.
//!
//! A single narrow trait a session holds by `Arc<dyn AuthenticationStrategy>`
//! and invokes synchronously at logon/negotiate time, rather than a
//! runtime-registered callback.

use std::sync::Arc;

/// Outcome of a credential check at logon (FIX) or negotiate (FIXP) time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Accept,
    Reject { reason: String },
}

/// Fields presented in a FIX `Logon` that an authentication strategy may
/// inspect.
#[derive(Debug, Clone)]
pub struct LogonFields<'a> {
    pub sender_comp_id: &'a str,
    pub target_comp_id: &'a str,
    pub raw_data: Option<&'a [u8]>,
    pub username: Option<&'a str>,
}

/// Fields presented in a FIXP `Negotiate` that an authentication strategy
/// may inspect.
#[derive(Debug, Clone)]
pub struct NegotiateFields<'a> {
    pub session_id: u64,
    pub session_ver_id: u64,
    pub entering_firm: Option<&'a str>,
    pub credentials: Option<&'a [u8]>,
}

/// Pluggable credential check, invoked directly by the session state
/// machines. Applications supply their own; [`NullAuthenticationStrategy`]
/// accepts everything and is the crate default (and what the test suite
/// uses).
pub trait AuthenticationStrategy: Send + Sync {
    fn authenticate_fix(&self, fields: &LogonFields<'_>) -> AuthResult;
    fn authenticate_fixp(&self, fields: &NegotiateFields<'_>) -> AuthResult;
}

/// Accepts every logon/negotiate. Used as the engine default and in tests.
#[derive(Debug, Default)]
pub struct NullAuthenticationStrategy;

impl AuthenticationStrategy for NullAuthenticationStrategy {
    fn authenticate_fix(&self, _fields: &LogonFields<'_>) -> AuthResult {
        AuthResult::Accept
    }

    fn authenticate_fixp(&self, _fields: &NegotiateFields<'_>) -> AuthResult {
        AuthResult::Accept
    }
}

/// Shared handle to whatever strategy a session was configured with.
pub type SharedAuthenticationStrategy = Arc<dyn AuthenticationStrategy>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_strategy_always_accepts() {
        let strategy = NullAuthenticationStrategy;
        let fields = LogonFields {
            sender_comp_id: "A",
            target_comp_id: "B",
            raw_data: None,
            username: None,
        };
        assert_eq!(strategy.authenticate_fix(&fields), AuthResult::Accept);
    }
}
