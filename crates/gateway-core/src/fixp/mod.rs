//! FIXP / Binary Entry Point acceptor: Simple Open Framing Header (SOFH) +
//! SBE-style binary session messages, and the acceptor state machine
//! and the acceptor state machine.

pub mod message;
pub mod state_machine;

pub use message::{FixPMessage, FixPParseError};
pub use state_machine::{FixPSessionStateMachine, FixPState};
