//! Assigns carrier streams to archive recordings and persists which
//! recording ids are free to reuse across restarts.

pub mod coordinator;

pub use coordinator::{RecordingCoordinator, RecordingDescriptor};
