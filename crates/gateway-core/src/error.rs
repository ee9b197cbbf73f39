//! Error taxonomy for the gateway session engine.

use std::fmt;

/// Errors produced by the session engine.
///
/// Variants are grouped by the taxonomy the engine reports to callers and,
/// ultimately, to operators: protocol violations, sequencing problems,
/// authentication rejects, backpressure, on-disk corruption, bad
/// configuration, and timeouts.
#[derive(Debug)]
pub enum Error {
    // ------------------------------------------------------------------
    // Protocol errors
    // ------------------------------------------------------------------
    /// Counterparty violated the wire protocol (bad comp-ids, malformed frame).
    Protocol(String),
    /// Message authentication/credential check failed.
    Authentication(String),

    // ------------------------------------------------------------------
    // Sequencing errors
    // ------------------------------------------------------------------
    /// Inbound sequence number lower than expected and not a possible duplicate.
    SequenceTooLow { expected: u64, received: u64 },
    /// A replay/retransmit range could not be satisfied from the archive.
    SequenceGapUnresolved { begin: u64, end: u64 },
    /// Too many outstanding retransmit requests for one session.
    ReplayLimitExceeded,

    // ------------------------------------------------------------------
    // Resource errors
    // ------------------------------------------------------------------
    /// Carrier has no room for this write; caller should retry.
    Backpressure,

    // ------------------------------------------------------------------
    // Durability errors
    // ------------------------------------------------------------------
    /// An on-disk index failed its checksum or magic check.
    Corruption(String),
    /// Underlying I/O failure.
    Io(std::io::Error),

    // ------------------------------------------------------------------
    // Configuration errors
    // ------------------------------------------------------------------
    /// Configuration is internally inconsistent or points at unusable paths.
    ConfigInvalid(String),

    // ------------------------------------------------------------------
    // Timing errors
    // ------------------------------------------------------------------
    /// A reply deadline expired (establish, negotiate, reset-sequence).
    Timeout,

    /// Session key not found or state machine in the wrong state for the request.
    InvalidState(String),
    /// The session is already bound to another active connection.
    DuplicateSession,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::Authentication(msg) => write!(f, "authentication failure: {msg}"),
            Error::SequenceTooLow { expected, received } => write!(
                f,
                "MsgSeqNum too low, expecting {expected} but received {received}"
            ),
            Error::SequenceGapUnresolved { begin, end } => {
                write!(f, "unresolved sequence gap [{begin}, {end}]")
            }
            Error::ReplayLimitExceeded => write!(f, "replay limit exceeded"),
            Error::Backpressure => write!(f, "carrier is backpressured"),
            Error::Corruption(msg) => write!(f, "file system corruption: {msg}"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::ConfigInvalid(msg) => write!(f, "invalid configuration: {msg}"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Error::DuplicateSession => write!(f, "duplicate session"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Convenience alias for engine results.
pub type Result<T> = core::result::Result<T, Error>;
