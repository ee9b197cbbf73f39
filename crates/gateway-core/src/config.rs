//! Gateway engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Timestamp precision used when encoding FIX `SendingTime`/`OrigSendingTime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampPrecision {
    Seconds,
    Millis,
    Micros,
    Nanos,
}

/// Session-engine configuration.
///
/// A plain data struct with a sane [`Default`] and a fluent
/// [`GatewayConfigBuilder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Directory all index, replay, and recording-coordinator files live under.
    pub log_file_dir: PathBuf,

    /// FIX/FIXP heartbeat / keep-alive interval.
    pub heartbeat_interval: Duration,

    /// Maximum allowed clock skew between a message's `SendingTime` and now.
    pub fix_send_window: Duration,

    /// Timestamp precision for outbound FIX `SendingTime`.
    pub fix_timestamp_precision: TimestampPrecision,

    /// Flush the sequence-number index after this many milliseconds of
    /// inactivity, whichever of (time, record count) triggers first.
    pub index_flush_interval: Duration,

    /// Flush the sequence-number index after this many records.
    pub index_flush_records: usize,

    /// Capacity (in records) of each per-session replay index ring.
    pub replay_index_capacity: usize,

    /// Maximum outstanding messages a single resend/retransmit request may cover.
    pub max_retransmission_range: u64,

    /// Timeout waiting for a FIXP `ESTABLISH` after `NEGOTIATE`.
    pub no_logon_disconnect_timeout: Duration,

    /// Whether to flush indexes unconditionally on graceful shutdown.
    pub flush_on_shutdown: bool,

    /// Drain in-flight recordings before exiting (§4.4 graceful shutdown).
    pub graceful_shutdown: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log_file_dir: PathBuf::from("./gateway-log"),
            heartbeat_interval: Duration::from_secs(30),
            fix_send_window: Duration::from_secs(2),
            fix_timestamp_precision: TimestampPrecision::Millis,
            index_flush_interval: Duration::from_millis(200),
            index_flush_records: 1000,
            replay_index_capacity: 8192,
            max_retransmission_range: 1000,
            no_logon_disconnect_timeout: Duration::from_secs(10),
            flush_on_shutdown: true,
            graceful_shutdown: true,
        }
    }
}

impl GatewayConfig {
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// Checks the cross-field invariants the daemon must reject at startup
    /// with `CONFIG_INVALID` (exit code 2) rather than let surface later as
    /// `FILE_SYSTEM_CORRUPTION`.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.replay_index_capacity == 0 {
            return Err(crate::Error::ConfigInvalid(
                "replay_index_capacity must be nonzero".into(),
            ));
        }
        if self.max_retransmission_range == 0 {
            return Err(crate::Error::ConfigInvalid(
                "max_retransmission_range must be nonzero".into(),
            ));
        }
        Ok(())
    }
}

/// Fluent builder for [`GatewayConfig`].
#[derive(Debug, Default)]
pub struct GatewayConfigBuilder {
    log_file_dir: Option<PathBuf>,
    heartbeat_interval: Option<Duration>,
    fix_send_window: Option<Duration>,
    fix_timestamp_precision: Option<TimestampPrecision>,
    index_flush_interval: Option<Duration>,
    index_flush_records: Option<usize>,
    replay_index_capacity: Option<usize>,
    max_retransmission_range: Option<u64>,
    no_logon_disconnect_timeout: Option<Duration>,
    flush_on_shutdown: Option<bool>,
    graceful_shutdown: Option<bool>,
}

impl GatewayConfigBuilder {
    pub fn log_file_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_file_dir = Some(dir.into());
        self
    }

    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.heartbeat_interval = Some(d);
        self
    }

    pub fn fix_send_window(mut self, d: Duration) -> Self {
        self.fix_send_window = Some(d);
        self
    }

    pub fn fix_timestamp_precision(mut self, p: TimestampPrecision) -> Self {
        self.fix_timestamp_precision = Some(p);
        self
    }

    pub fn index_flush_interval(mut self, d: Duration) -> Self {
        self.index_flush_interval = Some(d);
        self
    }

    pub fn index_flush_records(mut self, n: usize) -> Self {
        self.index_flush_records = Some(n);
        self
    }

    pub fn replay_index_capacity(mut self, n: usize) -> Self {
        self.replay_index_capacity = Some(n);
        self
    }

    pub fn max_retransmission_range(mut self, n: u64) -> Self {
        self.max_retransmission_range = Some(n);
        self
    }

    pub fn no_logon_disconnect_timeout(mut self, d: Duration) -> Self {
        self.no_logon_disconnect_timeout = Some(d);
        self
    }

    pub fn flush_on_shutdown(mut self, b: bool) -> Self {
        self.flush_on_shutdown = Some(b);
        self
    }

    pub fn graceful_shutdown(mut self, b: bool) -> Self {
        self.graceful_shutdown = Some(b);
        self
    }

    pub fn build(self) -> GatewayConfig {
        let defaults = GatewayConfig::default();
        GatewayConfig {
            log_file_dir: self.log_file_dir.unwrap_or(defaults.log_file_dir),
            heartbeat_interval: self.heartbeat_interval.unwrap_or(defaults.heartbeat_interval),
            fix_send_window: self.fix_send_window.unwrap_or(defaults.fix_send_window),
            fix_timestamp_precision: self
                .fix_timestamp_precision
                .unwrap_or(defaults.fix_timestamp_precision),
            index_flush_interval: self
                .index_flush_interval
                .unwrap_or(defaults.index_flush_interval),
            index_flush_records: self
                .index_flush_records
                .unwrap_or(defaults.index_flush_records),
            replay_index_capacity: self
                .replay_index_capacity
                .unwrap_or(defaults.replay_index_capacity),
            max_retransmission_range: self
                .max_retransmission_range
                .unwrap_or(defaults.max_retransmission_range),
            no_logon_disconnect_timeout: self
                .no_logon_disconnect_timeout
                .unwrap_or(defaults.no_logon_disconnect_timeout),
            flush_on_shutdown: self.flush_on_shutdown.unwrap_or(defaults.flush_on_shutdown),
            graceful_shutdown: self.graceful_shutdown.unwrap_or(defaults.graceful_shutdown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let cfg = GatewayConfig::builder()
            .log_file_dir("/tmp/gw")
            .replay_index_capacity(256)
            .max_retransmission_range(50)
            .build();

        assert_eq!(cfg.log_file_dir, PathBuf::from("/tmp/gw"));
        assert_eq!(cfg.replay_index_capacity, 256);
        assert_eq!(cfg.max_retransmission_range, 50);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.replay_index_capacity, 8192);
        assert!(cfg.flush_on_shutdown);
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let cfg = GatewayConfig::builder().replay_index_capacity(0).build();
        assert!(cfg.validate().is_err());
    }
}
