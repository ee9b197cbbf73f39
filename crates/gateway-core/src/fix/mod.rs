//! FIX (tag=value) session termination: parsing the fields the session
//! state machine needs, and the session state machine itself.
//!
//! The wire codec here is intentionally minimal — enough to validate and
//! re-encode session-level messages — not a full FIX dictionary compiler;
//! that full codec is an out-of-scope collaborator here.

pub mod message;
pub mod state_machine;

pub use message::{FixMessage, FixParseError};
pub use state_machine::{FixSessionStateMachine, FixState};
