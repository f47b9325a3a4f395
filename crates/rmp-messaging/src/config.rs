use std::path::{Path, PathBuf};
use std::time::Duration;

use rmp_core::Tick;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Reliable-messaging tunables, expressed in virtual ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Retransmit timeout until the peer has sent anything on the exchange.
    pub initial_retransmit_ticks: Tick,
    /// Retransmit timeout once the peer has proven responsive, and for every
    /// retry after the first transmission.
    pub active_retransmit_ticks: Tick,
    /// How long a pending ack may wait for an outgoing message to ride on.
    pub ack_piggyback_ticks: Tick,
    /// Transmissions allowed (including the first) before delivery fails.
    pub max_retransmissions: u32,
}

/// Shared default used by contexts registered without an override.
pub const DEFAULT_PROTOCOL_CONFIG: ProtocolConfig = ProtocolConfig {
    initial_retransmit_ticks: 3,
    active_retransmit_ticks: 3,
    ack_piggyback_ticks: 1,
    max_retransmissions: 3,
};

impl Default for ProtocolConfig {
    fn default() -> Self {
        DEFAULT_PROTOCOL_CONFIG
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_retransmit_ticks == 0 || self.active_retransmit_ticks == 0 {
            return Err(ConfigError::Invalid("retransmit timeouts must be non-zero"));
        }
        if self.max_retransmissions == 0 {
            return Err(ConfigError::Invalid("max_retransmissions must be non-zero"));
        }
        Ok(())
    }
}

/// Manager-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Wall-clock length of one virtual tick.
    #[serde(with = "humantime_serde")]
    pub timer_tick: Duration,
    /// Bounded number of messages that may await an ack at once.
    pub retrans_table_size: usize,
    /// Default protocol tunables for contexts without an override.
    pub protocol: ProtocolConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            timer_tick: Duration::from_millis(64),
            retrans_table_size: 16,
            protocol: DEFAULT_PROTOCOL_CONFIG,
        }
    }
}

impl ManagerConfig {
    /// Parses and validates a TOML document. Missing keys keep defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: ManagerConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timer_tick < Duration::from_millis(1) {
            return Err(ConfigError::Invalid("timer_tick must be at least 1ms"));
        }
        if self.retrans_table_size == 0 {
            return Err(ConfigError::Invalid("retrans_table_size must be non-zero"));
        }
        self.protocol.validate()
    }

    /// Tick length in whole milliseconds, never zero.
    pub fn tick_ms(&self) -> u64 {
        u64::try_from(self.timer_tick.as_millis())
            .unwrap_or(u64::MAX)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use super::{ConfigError, ManagerConfig, ProtocolConfig, DEFAULT_PROTOCOL_CONFIG};

    #[test]
    fn defaults_match_shared_protocol_config() {
        let cfg = ManagerConfig::default();
        assert_eq!(cfg.protocol, DEFAULT_PROTOCOL_CONFIG);
        assert_eq!(cfg.timer_tick, Duration::from_millis(64));
        assert_eq!(cfg.tick_ms(), 64);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn toml_overrides_only_named_fields() {
        let cfg = ManagerConfig::from_toml_str(
            r#"
            timer_tick = "10ms"
            retrans_table_size = 4

            [protocol]
            active_retransmit_ticks = 5
            max_retransmissions = 2
            "#,
        )
        .expect("config should parse");

        assert_eq!(cfg.timer_tick, Duration::from_millis(10));
        assert_eq!(cfg.retrans_table_size, 4);
        assert_eq!(cfg.protocol.active_retransmit_ticks, 5);
        assert_eq!(cfg.protocol.max_retransmissions, 2);
        assert_eq!(
            cfg.protocol.initial_retransmit_ticks,
            DEFAULT_PROTOCOL_CONFIG.initial_retransmit_ticks
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = ManagerConfig::from_toml_str("retrans_table_size = 0")
            .expect_err("zero table size should be rejected");
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = ManagerConfig::from_toml_str("[protocol]\nmax_retransmissions = 0")
            .expect_err("zero retries should be rejected");
        assert!(matches!(err, ConfigError::Invalid(_)));

        let cfg = ProtocolConfig {
            active_retransmit_ticks: 0,
            ..ProtocolConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = ManagerConfig::from_toml_str("timer_tick = [")
            .expect_err("broken toml should fail");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file should be created");
        writeln!(file, "timer_tick = \"32ms\"").expect("write should succeed");

        let cfg = ManagerConfig::from_file(file.path()).expect("config file should load");
        assert_eq!(cfg.tick_ms(), 32);

        let err = ManagerConfig::from_file("/definitely/not/here.toml")
            .expect_err("missing file should fail");
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
