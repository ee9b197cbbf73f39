//! TOML-backed daemon configuration, mirroring the router's
//! `RouterConfig::from_file`/`GenConfig` shape but carrying the fields
//! [`gateway_core::GatewayConfig`] needs (as plain seconds/counts, since TOML
//! has no native duration type).

use std::path::{Path, PathBuf};
use std::time::Duration;

use gateway_core::{GatewayConfig, TimestampPrecision};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampPrecisionConfig {
    Seconds,
    Millis,
    Micros,
    Nanos,
}

impl From<TimestampPrecisionConfig> for TimestampPrecision {
    fn from(p: TimestampPrecisionConfig) -> Self {
        match p {
            TimestampPrecisionConfig::Seconds => TimestampPrecision::Seconds,
            TimestampPrecisionConfig::Millis => TimestampPrecision::Millis,
            TimestampPrecisionConfig::Micros => TimestampPrecision::Micros,
            TimestampPrecisionConfig::Nanos => TimestampPrecision::Nanos,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_log_file_dir")]
    pub log_file_dir: PathBuf,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_fix_send_window_secs")]
    pub fix_send_window_secs: u64,

    #[serde(default = "default_precision")]
    pub fix_timestamp_precision: TimestampPrecisionConfig,

    #[serde(default = "default_index_flush_interval_ms")]
    pub index_flush_interval_ms: u64,

    #[serde(default = "default_index_flush_records")]
    pub index_flush_records: usize,

    #[serde(default = "default_replay_index_capacity")]
    pub replay_index_capacity: usize,

    #[serde(default = "default_max_retransmission_range")]
    pub max_retransmission_range: u64,

    #[serde(default = "default_no_logon_disconnect_secs")]
    pub no_logon_disconnect_secs: u64,

    #[serde(default = "default_true")]
    pub flush_on_shutdown: bool,

    #[serde(default = "default_true")]
    pub graceful_shutdown: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_file_dir() -> PathBuf {
    PathBuf::from("./gateway-log")
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_fix_send_window_secs() -> u64 {
    2
}
fn default_precision() -> TimestampPrecisionConfig {
    TimestampPrecisionConfig::Millis
}
fn default_index_flush_interval_ms() -> u64 {
    200
}
fn default_index_flush_records() -> usize {
    1000
}
fn default_replay_index_capacity() -> usize {
    8192
}
fn default_max_retransmission_range() -> u64 {
    1000
}
fn default_no_logon_disconnect_secs() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            log_file_dir: default_log_file_dir(),
            heartbeat_interval_secs: default_heartbeat_secs(),
            fix_send_window_secs: default_fix_send_window_secs(),
            fix_timestamp_precision: default_precision(),
            index_flush_interval_ms: default_index_flush_interval_ms(),
            index_flush_records: default_index_flush_records(),
            replay_index_capacity: default_replay_index_capacity(),
            max_retransmission_range: default_max_retransmission_range(),
            no_logon_disconnect_secs: default_no_logon_disconnect_secs(),
            flush_on_shutdown: default_true(),
            graceful_shutdown: default_true(),
            log_level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn to_gateway_config(&self) -> GatewayConfig {
        GatewayConfig::builder()
            .log_file_dir(self.log_file_dir.clone())
            .heartbeat_interval(Duration::from_secs(self.heartbeat_interval_secs))
            .fix_send_window(Duration::from_secs(self.fix_send_window_secs))
            .fix_timestamp_precision(self.fix_timestamp_precision.into())
            .index_flush_interval(Duration::from_millis(self.index_flush_interval_ms))
            .index_flush_records(self.index_flush_records)
            .replay_index_capacity(self.replay_index_capacity)
            .max_retransmission_range(self.max_retransmission_range)
            .no_logon_disconnect_timeout(Duration::from_secs(self.no_logon_disconnect_secs))
            .flush_on_shutdown(self.flush_on_shutdown)
            .graceful_shutdown(self.graceful_shutdown)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = DaemonConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: DaemonConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.heartbeat_interval_secs, cfg.heartbeat_interval_secs);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let parsed: DaemonConfig = toml::from_str("log_file_dir = \"/tmp/gw\"\n").unwrap();
        assert_eq!(parsed.replay_index_capacity, default_replay_index_capacity());
    }
}
