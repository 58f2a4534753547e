//! Transport configuration.
//!
//! [`TransportConfig`] is the runtime form used by backends and listeners.
//! [`TransportConfigFile`] is its TOML representation, where every field is
//! optional and durations are written as `"20ms"`, `"1s"` or `"2m"`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TransportError, TransportResult};

/// Configuration shared by a listener pool and the backends using it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Number of I/O listener threads (default: 4).
    pub listener_threads: usize,
    /// Baseline inbound buffer per connection (default: 64 KiB).
    pub inbound_buffer_size: usize,
    /// Initial capacity handed to the codec when encoding (default: 8 KiB).
    pub encode_size_hint: usize,
    /// Upper bound on establishing a new connection (default: 20ms).
    pub connect_timeout: Duration,
    /// Interval of the idle-connection sweep (default: 1s).
    pub sweep_interval: Duration,
    /// Inbound packets buffered per channel before new ones are dropped
    /// (default: 4096).
    pub channel_queue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listener_threads: 4,
            inbound_buffer_size: 64 * 1024,
            encode_size_hint: 8 * 1024,
            connect_timeout: Duration::from_millis(20),
            sweep_interval: Duration::from_secs(1),
            channel_queue_capacity: 4096,
        }
    }
}

impl TransportConfig {
    /// Parse a TOML document into a validated configuration.
    pub fn from_toml_str(content: &str) -> TransportResult<Self> {
        let file: TransportConfigFile =
            toml::from_str(content).map_err(|e| TransportError::Config(e.to_string()))?;
        file.into_config()
    }

    /// Read and parse a TOML configuration file.
    pub fn from_file(path: &Path) -> TransportResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Reject configurations the transport cannot run with.
    pub fn validate(&self) -> TransportResult<()> {
        if self.listener_threads == 0 {
            return Err(TransportError::Config(
                "listener_threads must be at least 1".to_string(),
            ));
        }
        if self.inbound_buffer_size == 0 {
            return Err(TransportError::Config(
                "inbound_buffer_size must be non-zero".to_string(),
            ));
        }
        if self.channel_queue_capacity == 0 {
            return Err(TransportError::Config(
                "channel_queue_capacity must be non-zero".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(TransportError::Config(
                "sweep_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Builder method: set the number of listener threads.
    pub fn with_listener_threads(self, listener_threads: usize) -> Self {
        Self {
            listener_threads,
            ..self
        }
    }

    /// Builder method: set the baseline inbound buffer size.
    pub fn with_inbound_buffer_size(self, inbound_buffer_size: usize) -> Self {
        Self {
            inbound_buffer_size,
            ..self
        }
    }

    /// Builder method: set the initial encode buffer capacity.
    pub fn with_encode_size_hint(self, encode_size_hint: usize) -> Self {
        Self {
            encode_size_hint,
            ..self
        }
    }

    /// Builder method: set the connect timeout.
    pub fn with_connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..self
        }
    }

    /// Builder method: set the idle sweep interval.
    pub fn with_sweep_interval(self, sweep_interval: Duration) -> Self {
        Self {
            sweep_interval,
            ..self
        }
    }

    /// Builder method: set the per-channel inbound queue bound.
    pub fn with_channel_queue_capacity(self, channel_queue_capacity: usize) -> Self {
        Self {
            channel_queue_capacity,
            ..self
        }
    }
}

/// TOML form of [`TransportConfig`].
///
/// ```toml
/// listener_threads = 8
/// inbound_buffer_size = 262144
/// connect_timeout = "20ms"
/// sweep_interval = "1s"
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfigFile {
    pub listener_threads: Option<usize>,
    pub inbound_buffer_size: Option<usize>,
    pub encode_size_hint: Option<usize>,
    pub connect_timeout: Option<String>,
    pub sweep_interval: Option<String>,
    pub channel_queue_capacity: Option<usize>,
}

impl TransportConfigFile {
    /// Fill unset fields from [`TransportConfig::default`] and validate.
    pub fn into_config(self) -> TransportResult<TransportConfig> {
        let defaults = TransportConfig::default();
        let config = TransportConfig {
            listener_threads: self.listener_threads.unwrap_or(defaults.listener_threads),
            inbound_buffer_size: self
                .inbound_buffer_size
                .unwrap_or(defaults.inbound_buffer_size),
            encode_size_hint: self.encode_size_hint.unwrap_or(defaults.encode_size_hint),
            connect_timeout: duration_field("connect_timeout", self.connect_timeout)?
                .unwrap_or(defaults.connect_timeout),
            sweep_interval: duration_field("sweep_interval", self.sweep_interval)?
                .unwrap_or(defaults.sweep_interval),
            channel_queue_capacity: self
                .channel_queue_capacity
                .unwrap_or(defaults.channel_queue_capacity),
        };
        config.validate()?;
        Ok(config)
    }
}

fn duration_field(name: &str, value: Option<String>) -> TransportResult<Option<Duration>> {
    match value {
        None => Ok(None),
        Some(raw) => parse_duration(&raw)
            .map(Some)
            .ok_or_else(|| TransportError::Config(format!("{name}: invalid duration '{raw}'"))),
    }
}

/// Parse `"500ms"`, `"5s"`, `"2m"` or a bare number of seconds.
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.listener_threads, 4);
        assert_eq!(config.inbound_buffer_size, 65536);
        assert_eq!(config.connect_timeout, Duration::from_millis(20));
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_methods_chain() {
        let config = TransportConfig::default()
            .with_listener_threads(2)
            .with_inbound_buffer_size(1024)
            .with_encode_size_hint(256)
            .with_connect_timeout(Duration::from_millis(500))
            .with_sweep_interval(Duration::from_secs(5))
            .with_channel_queue_capacity(16);
        assert_eq!(config.listener_threads, 2);
        assert_eq!(config.inbound_buffer_size, 1024);
        assert_eq!(config.encode_size_hint, 256);
        assert_eq!(config.connect_timeout, Duration::from_millis(500));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.channel_queue_capacity, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = TransportConfig::from_toml_str("").unwrap();
        assert_eq!(config, TransportConfig::default());
    }

    #[test]
    fn toml_overrides_fields() {
        let config = TransportConfig::from_toml_str(
            r#"
            listener_threads = 8
            inbound_buffer_size = 262144
            connect_timeout = "250ms"
            sweep_interval = "2s"
            "#,
        )
        .unwrap();
        assert_eq!(config.listener_threads, 8);
        assert_eq!(config.inbound_buffer_size, 262144);
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.sweep_interval, Duration::from_secs(2));
        assert_eq!(config.channel_queue_capacity, 4096);
    }

    #[test]
    fn invalid_duration_is_rejected() {
        let err = TransportConfig::from_toml_str(r#"connect_timeout = "soon""#).unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
        assert!(err.to_string().contains("connect_timeout"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = TransportConfig::from_toml_str("max_retries = 3").unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[test]
    fn zero_queue_capacity_fails_validation() {
        let config = TransportConfig::default().with_channel_queue_capacity(0);
        assert!(matches!(config.validate(), Err(TransportError::Config(_))));
    }

    #[test]
    fn zero_listeners_fail_validation() {
        let err = TransportConfig::from_toml_str("listener_threads = 0").unwrap_err();
        assert!(err.to_string().contains("listener_threads"));
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mplex.toml");
        std::fs::write(&path, "channel_queue_capacity = 16\n").unwrap();
        let config = TransportConfig::from_file(&path).unwrap();
        assert_eq!(config.channel_queue_capacity, 16);
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("fast"), None);
    }
}
