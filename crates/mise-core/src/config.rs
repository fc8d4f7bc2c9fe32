//! Engine configuration.
//!
//! Every section is optional in TOML and falls back to the defaults below.
//! Durations are whole seconds except the retry base delay.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level engine settings, deserialized from the `[finalization]`,
/// `[materialization]`, `[worker]`, `[tally]`, and `[publisher]` tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub finalization: SweepConfig,
    pub materialization: SweepConfig,
    pub worker: WorkerConfig,
    pub tally: TallyConfig,
    pub publisher: PublisherConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Seconds between sweeps.
    pub sweep_interval: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { sweep_interval: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Seconds. Defaults to twice the longer sweep interval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_ttl: Option<u64>,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub batch_size: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            lease_ttl: None,
            max_attempts: 8,
            retry_base_delay_ms: 200,
            batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Lowest option id wins.
    #[default]
    Lexicographic,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    pub tie_break: TieBreak,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublisherSink {
    #[default]
    Log,
    PgNotify,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub sink: PublisherSink,
    /// `NOTIFY` channel for the `pg_notify` sink.
    pub channel: String,
    /// Messages buffered before new ones are dropped.
    pub buffer: usize,
    /// Seconds to wait for the buffer to drain on shutdown.
    pub flush_timeout: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            sink: PublisherSink::Log,
            channel: "mise_data_changes".to_owned(),
            buffer: 1024,
            flush_timeout: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("worker.lease_ttl ({ttl}s) is shorter than the {sweep} sweep interval ({interval}s)")]
    LeaseTooShort {
        ttl: u64,
        sweep: &'static str,
        interval: u64,
    },

    #[error("publisher.channel must be a plain identifier, got {0:?}")]
    BadChannel(String),
}

impl EngineConfig {
    pub fn finalization_interval(&self) -> Duration {
        Duration::from_secs(self.finalization.sweep_interval)
    }

    pub fn materialization_interval(&self) -> Duration {
        Duration::from_secs(self.materialization.sweep_interval)
    }

    pub fn lease_ttl_secs(&self) -> u64 {
        self.worker.lease_ttl.unwrap_or_else(|| {
            2 * self
                .finalization
                .sweep_interval
                .max(self.materialization.sweep_interval)
        })
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs())
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.worker.retry_base_delay_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.publisher.flush_timeout)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.finalization.sweep_interval == 0 {
            return Err(ConfigError::Zero("finalization.sweep_interval"));
        }
        if self.materialization.sweep_interval == 0 {
            return Err(ConfigError::Zero("materialization.sweep_interval"));
        }
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Zero("worker.concurrency"));
        }
        if self.worker.max_attempts == 0 {
            return Err(ConfigError::Zero("worker.max_attempts"));
        }
        if self.worker.batch_size <= 0 {
            return Err(ConfigError::Zero("worker.batch_size"));
        }
        if self.publisher.buffer == 0 {
            return Err(ConfigError::Zero("publisher.buffer"));
        }

        let ttl = self.lease_ttl_secs();
        for (sweep, interval) in [
            ("finalization", self.finalization.sweep_interval),
            ("materialization", self.materialization.sweep_interval),
        ] {
            if ttl < interval {
                return Err(ConfigError::LeaseTooShort {
                    ttl,
                    sweep,
                    interval,
                });
            }
        }

        let channel = &self.publisher.channel;
        if channel.is_empty()
            || !channel
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::BadChannel(channel.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.finalization_interval(), Duration::from_secs(30));
        assert_eq!(cfg.materialization_interval(), Duration::from_secs(30));
        assert_eq!(cfg.worker.concurrency, 4);
        assert_eq!(cfg.worker.max_attempts, 8);
        assert_eq!(cfg.lease_ttl(), Duration::from_secs(60));
        assert_eq!(cfg.tally.tie_break, TieBreak::Lexicographic);
        assert_eq!(cfg.publisher.sink, PublisherSink::Log);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn lease_ttl_follows_longer_interval() {
        let mut cfg = EngineConfig::default();
        cfg.materialization.sweep_interval = 45;
        assert_eq!(cfg.lease_ttl_secs(), 90);
        cfg.worker.lease_ttl = Some(120);
        assert_eq!(cfg.lease_ttl_secs(), 120);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: EngineConfig = toml::from_str(
            r#"
[worker]
concurrency = 2

[publisher]
sink = "pg_notify"
"#,
        )
        .expect("should parse");
        assert_eq!(cfg.worker.concurrency, 2);
        assert_eq!(cfg.worker.max_attempts, 8);
        assert_eq!(cfg.publisher.sink, PublisherSink::PgNotify);
        assert_eq!(cfg.publisher.channel, "mise_data_changes");
        assert_eq!(cfg.finalization.sweep_interval, 30);
    }

    #[test]
    fn validate_rejects_zero_and_short_lease() {
        let mut cfg = EngineConfig::default();
        cfg.worker.concurrency = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::Zero("worker.concurrency")));

        let mut cfg = EngineConfig::default();
        cfg.worker.lease_ttl = Some(10);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::LeaseTooShort { ttl: 10, .. })
        ));

        let mut cfg = EngineConfig::default();
        cfg.publisher.channel = "bad channel; drop".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::BadChannel(_))));
    }

    #[test]
    fn unknown_tie_break_is_rejected() {
        let result: Result<EngineConfig, _> = toml::from_str("[tally]\ntie_break = \"random\"\n");
        assert!(result.is_err());
    }
}
