use crate::error::EngineError;
use crate::payload::PayloadParams;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StoreConfig {
    #[default]
    InMemory,
    OnDisk {
        #[serde(default = "default_on_disk_path")]
        path: PathBuf,
    },
}

fn default_on_disk_path() -> PathBuf {
    PathBuf::from("./.crossfuzz_runs")
}

/// Defaults applied to jobs that do not override them.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct JobDefaults {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: Option<u32>,
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_concurrency() -> usize {
    16
}

fn default_rate_limit_per_sec() -> Option<u32> {
    Some(10_000)
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            concurrency: default_concurrency(),
            rate_limit_per_sec: default_rate_limit_per_sec(),
        }
    }
}

/// Engine-wide settings shared by every job the scheduler creates.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Per-subscriber queue bound; events beyond it are dropped and counted.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    /// How long `stop()` waits for in-flight dispatches before abandoning them.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Minimum spacing between two metrics snapshots of one job.
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
    /// Width of the rolling window behind packets/sec.
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
    /// Smoothing factor of the RTT moving average, in (0, 1].
    #[serde(default = "default_rtt_ema_alpha")]
    pub rtt_ema_alpha: f64,
    /// Consecutive connection errors after which the driver is probed again.
    #[serde(default = "default_max_consecutive_connection_errors")]
    pub max_consecutive_connection_errors: u32,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub job_defaults: JobDefaults,
}

fn default_event_queue_capacity() -> usize {
    1024
}

fn default_stop_grace_ms() -> u64 {
    2000
}

fn default_snapshot_interval_ms() -> u64 {
    250
}

fn default_rate_window_ms() -> u64 {
    1000
}

fn default_rtt_ema_alpha() -> f64 {
    0.2
}

fn default_max_consecutive_connection_errors() -> u32 {
    32
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: default_event_queue_capacity(),
            stop_grace_ms: default_stop_grace_ms(),
            snapshot_interval_ms: default_snapshot_interval_ms(),
            rate_window_ms: default_rate_window_ms(),
            rtt_ema_alpha: default_rtt_ema_alpha(),
            max_consecutive_connection_errors: default_max_consecutive_connection_errors(),
            store: StoreConfig::default(),
            job_defaults: JobDefaults::default(),
        }
    }
}

impl EngineConfig {
    /// Parses a TOML document; every omitted key takes its default.
    pub fn from_toml_str(content: &str) -> Result<Self, anyhow::Error> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse engine configuration TOML: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.event_queue_capacity == 0 {
            return Err(EngineError::Validation(
                "event-queue-capacity must be at least 1".to_string(),
            ));
        }
        if !(self.rtt_ema_alpha > 0.0 && self.rtt_ema_alpha <= 1.0) {
            return Err(EngineError::Validation(format!(
                "rtt-ema-alpha must be in (0, 1], got {}",
                self.rtt_ema_alpha
            )));
        }
        if self.rate_window_ms == 0 {
            return Err(EngineError::Validation(
                "rate-window-ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }
}

/// Configuration of one fuzzing job.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub target: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub payload: PayloadParams,
    #[serde(default)]
    pub rate_limit_per_sec: Option<u32>,
    /// Wall-clock bound for runs whose payload count is unbounded.
    #[serde(default)]
    pub max_duration_ms: Option<u64>,
    /// Overrides [`EngineConfig::stop_grace_ms`] for this job.
    #[serde(default)]
    pub stop_grace_ms: Option<u64>,
}

impl JobConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self::with_defaults(target, &JobDefaults::default())
    }

    pub fn with_defaults(target: impl Into<String>, defaults: &JobDefaults) -> Self {
        Self {
            target: target.into(),
            timeout_ms: defaults.timeout_ms,
            concurrency: defaults.concurrency,
            payload: PayloadParams::default(),
            rate_limit_per_sec: defaults.rate_limit_per_sec,
            max_duration_ms: None,
            stop_grace_ms: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.target.trim().is_empty() {
            return Err(EngineError::Validation("target must not be empty".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(EngineError::Validation("timeout must be greater than 0 ms".to_string()));
        }
        if self.concurrency == 0 {
            return Err(EngineError::Validation("concurrency must be at least 1".to_string()));
        }
        if self.rate_limit_per_sec == Some(0) {
            return Err(EngineError::Validation(
                "rate limit must be positive when set".to_string(),
            ));
        }
        if self.max_duration_ms == Some(0) {
            return Err(EngineError::Validation(
                "max duration must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Profile;

    #[test]
    fn empty_document_yields_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.job_defaults.concurrency, 16);
        assert_eq!(config.job_defaults.rate_limit_per_sec, Some(10_000));
    }

    #[test]
    fn overrides_and_on_disk_store_parse() {
        let config = EngineConfig::from_toml_str(
            r#"
            stop-grace-ms = 200
            event-queue-capacity = 8

            [store.on-disk]
            path = "/tmp/runs"

            [job-defaults]
            concurrency = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.stop_grace(), Duration::from_millis(200));
        assert_eq!(config.event_queue_capacity, 8);
        assert_eq!(
            config.store,
            StoreConfig::OnDisk {
                path: PathBuf::from("/tmp/runs")
            }
        );
        assert_eq!(config.job_defaults.concurrency, 4);
        assert_eq!(config.job_defaults.timeout_ms, 1000);
    }

    #[test]
    fn on_disk_store_without_path_uses_default_directory() {
        let config = EngineConfig::from_toml_str("[store.on-disk]\n").unwrap();
        assert_eq!(
            config.store,
            StoreConfig::OnDisk {
                path: PathBuf::from("./.crossfuzz_runs")
            }
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(EngineConfig::from_toml_str("verbosity = \"loud\"").is_err());
    }

    #[test]
    fn out_of_range_alpha_is_rejected() {
        assert!(EngineConfig::from_toml_str("rtt-ema-alpha = 0.0").is_err());
        assert!(EngineConfig::from_toml_str("rtt-ema-alpha = 1.5").is_err());
    }

    #[test]
    fn job_config_parses_with_payload_section() {
        let job: JobConfig = toml::from_str(
            r#"
            target = "10.0.0.5"
            concurrency = 2

            [payload]
            seed = "0xBEEF"
            profile = "Easy"
            count = 10
            "#,
        )
        .unwrap();
        assert_eq!(job.timeout_ms, 1000);
        assert_eq!(job.payload.profile, Profile::Easy);
        assert_eq!(job.payload.count, Some(10));
        assert!(job.validate().is_ok());
    }

    #[test]
    fn job_config_validation_rejects_bad_values() {
        let mut job = JobConfig::new("127.0.0.1");
        assert!(job.validate().is_ok());

        job.timeout_ms = 0;
        assert!(matches!(job.validate(), Err(EngineError::Validation(_))));
        job.timeout_ms = 10;

        job.concurrency = 0;
        assert!(matches!(job.validate(), Err(EngineError::Validation(_))));
        job.concurrency = 1;

        job.rate_limit_per_sec = Some(0);
        assert!(matches!(job.validate(), Err(EngineError::Validation(_))));
        job.rate_limit_per_sec = None;

        job.target = " ".to_string();
        assert!(matches!(job.validate(), Err(EngineError::Validation(_))));
    }
}
