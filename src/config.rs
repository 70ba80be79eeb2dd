//! Controller configuration, loadable from TOML.

use crate::error::DhiError;
use crate::geometry::ScannerModel;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which backend carries commands to the heads.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkConfig {
    Serial {
        port: String,
        #[serde(default = "default_baud")]
        baud: u32,
    },
    Network {
        address: String,
    },
    Simulation(SimulationConfig),
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig::Simulation(SimulationConfig::default())
    }
}

fn default_baud() -> u32 {
    38400
}

/// Timing of the simulated scanner.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Base latency of every exchange.
    pub latency_ms: u64,
    /// Fixed delay of each file transfer chunk.
    pub file_delay_ms: u64,
    /// Duration of long-running operations (zap, calibrations, flash).
    pub operation_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            latency_ms: 5,
            file_delay_ms: 2000,
            operation_ms: 3000,
        }
    }
}

/// Timeouts and retry budgets for command dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempt_timeout_ms: u64,
    pub total_timeout_ms: u64,
    pub correlation_retries: u32,
    pub bus_backoff_ms: u64,
    pub progress_interval_ms: u64,
    pub progress_limit_ms: u64,
    pub checksum_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempt_timeout_ms: 20_000,
            total_timeout_ms: 180_000,
            correlation_retries: 3,
            bus_backoff_ms: 250,
            progress_interval_ms: 1_000,
            progress_limit_ms: 900_000,
            checksum_retries: 3,
        }
    }
}

impl RetryPolicy {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }

    pub fn bus_backoff(&self) -> Duration {
        Duration::from_millis(self.bus_backoff_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn progress_limit(&self) -> Duration {
        Duration::from_millis(self.progress_limit_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub scanner: ScannerModel,
    /// Active configuration, fixed at start of day.
    pub configuration: u8,
    pub link: LinkConfig,
    /// Directory of per-head settings snapshots; none disables them.
    pub settings_dir: Option<PathBuf>,
    /// Persistent text error log; none keeps errors in memory only.
    pub error_log: Option<PathBuf>,
    pub error_capacity: usize,
    pub retry: RetryPolicy,
    /// Fraction of blocks that must share a new value before one
    /// broadcast write replaces per-block writes.
    pub broadcast_fraction: f64,
    /// Accept cached settings when the device checksum matches.
    pub verify_with_checksum: bool,
    /// Check live singles before trusting a remembered head mode.
    pub sanity_check: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            scanner: ScannerModel::default(),
            configuration: 0,
            link: LinkConfig::default(),
            settings_dir: None,
            error_log: None,
            error_capacity: 32,
            retry: RetryPolicy::default(),
            broadcast_fraction: 0.25,
            verify_with_checksum: true,
            sanity_check: false,
        }
    }
}

impl ControllerConfig {
    pub fn from_toml(text: &str) -> Result<Self, DhiError> {
        let config: ControllerConfig =
            toml::from_str(text).map_err(|e| DhiError::Config(format!("parse: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, DhiError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DhiError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), DhiError> {
        if self.scanner.head_count() == 0 || self.scanner.blocks_per_head() == 0 {
            return Err(DhiError::Config("scanner has no heads or blocks".into()));
        }
        if self.scanner.head_count() as u16 >= crate::protocol::CP_ADDRESS as u16 {
            return Err(DhiError::Config(format!(
                "{} heads collide with the coincidence processor address",
                self.scanner.head_count()
            )));
        }
        if self.scanner.blocks_per_head() >= crate::protocol::ALL_BLOCKS {
            return Err(DhiError::Config("too many blocks per head".into()));
        }
        if !(0.0..=1.0).contains(&self.broadcast_fraction) {
            return Err(DhiError::Config(format!(
                "broadcast_fraction {} outside 0..=1",
                self.broadcast_fraction
            )));
        }
        if self.error_capacity == 0 {
            return Err(DhiError::Config("error_capacity must be positive".into()));
        }
        let r = &self.retry;
        if r.attempt_timeout_ms == 0 || r.total_timeout_ms < r.attempt_timeout_ms {
            return Err(DhiError::Config(
                "total timeout must cover at least one attempt".into(),
            ));
        }
        if r.progress_interval_ms == 0 {
            return Err(DhiError::Config("progress interval must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ControllerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry.attempt_timeout(), Duration::from_secs(20));
        assert_eq!(config.retry.total_timeout(), Duration::from_secs(180));
    }

    #[test]
    fn test_parse_toml() {
        let config = ControllerConfig::from_toml(
            r#"
            configuration = 1
            broadcast_fraction = 0.5

            [scanner]
            kind = "ring"
            heads = 4
            blocks = 16
            layers = 1

            [link]
            kind = "serial"
            port = "/dev/ttyS0"

            [retry]
            correlation_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.configuration, 1);
        assert_eq!(config.scanner.head_count(), 4);
        assert_eq!(
            config.link,
            LinkConfig::Serial {
                port: "/dev/ttyS0".into(),
                baud: 38400
            }
        );
        assert_eq!(config.retry.correlation_retries, 5);
        assert_eq!(config.retry.attempt_timeout_ms, 20_000);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(ControllerConfig::from_toml("broadcast_fraction = 2.0").is_err());
        assert!(ControllerConfig::from_toml("error_capacity = 0").is_err());
        assert!(ControllerConfig::from_toml("[retry]\ntotal_timeout_ms = 10").is_err());
    }
}
