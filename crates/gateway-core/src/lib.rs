//! Session-terminating gateway engine for FIX (tag=value) and FIXP/Binary
//! Entry Point, with exactly-once, in-order, crash-safe message delivery.
//!
//! This crate is the protocol- and durability-engine layer: session state
//! machines, the sequence-number and replay indexes, the archive-recording
//! coordinator, and the narrow seams (`Carrier`, `AuthenticationStrategy`,
//! `AdminApi`) an embedding application implements against. Wire transport,
//! an SBE schema compiler, and a full FIX data-dictionary codec are
//! out-of-scope collaborators; see each module's doc comment for the exact
//! boundary.

pub mod admin;
pub mod auth;
pub mod carrier;
pub mod config;
pub mod engine;
pub mod error;
pub mod fix;
pub mod fixp;
pub mod index;
pub mod recording;
pub mod session;

pub use admin::{AdminApi, SessionSummary};
pub use config::{GatewayConfig, GatewayConfigBuilder, TimestampPrecision};
pub use engine::GatewayEngine;
pub use error::{Error, Result};
pub use session::{SessionContext, SessionKey, SessionsRegistry};
