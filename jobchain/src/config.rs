use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::plugin::PluginRange;
use crate::runtime::WorkerConfig;

/// Upper bound for `job_timeout_secs`: ten years.
pub const MAX_JOB_TIMEOUT_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Top-level scheduler configuration, loadable from TOML.
///
/// ```toml
/// job_timeout_secs = 3600
/// cache_dir = "/var/lib/jobchain/cache"
///
/// [dependency]
/// damping_delay_ms = 250
/// max_resubmits = 100
///
/// [worker]
/// parallelism = 8
///
/// [plugin_ranges.reports]
/// start = 1000
/// end = 1099
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Idle time after which a non-terminal job reads as timed out.
    pub job_timeout_secs: u64,
    pub dependency: DependencyConfig,
    /// Directory of the result cache.
    pub cache_dir: PathBuf,
    pub worker: WorkerConfig,
    /// Operation code range per plugin id.
    pub plugin_ranges: BTreeMap<String, PluginRange>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: 86_400,
            dependency: DependencyConfig::default(),
            cache_dir: PathBuf::from("./job-cache"),
            worker: WorkerConfig::default(),
            plugin_ranges: BTreeMap::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
                path: path.display().to_string(),
                message: err.to_string(),
            })?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "job_timeout_secs must be positive".into(),
            ));
        }
        if self.job_timeout_secs > MAX_JOB_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "job_timeout_secs ({}) exceeds {MAX_JOB_TIMEOUT_SECS}",
                self.job_timeout_secs
            )));
        }
        if self.worker.parallelism == 0 {
            return Err(ConfigError::Invalid(
                "worker.parallelism must be positive".into(),
            ));
        }
        let base = self.dependency.resubmit_base_delay_ms;
        let max = self.dependency.resubmit_max_delay_ms;
        if base > max {
            return Err(ConfigError::Invalid(format!(
                "dependency.resubmit_base_delay_ms ({base}) \
                 exceeds resubmit_max_delay_ms ({max})"
            )));
        }
        Ok(())
    }

    /// The configured timeout, clamped to [`MAX_JOB_TIMEOUT_SECS`].
    pub fn job_timeout(&self) -> chrono::Duration {
        let secs = self.job_timeout_secs.min(MAX_JOB_TIMEOUT_SECS);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }

    pub fn with_job_timeout_secs(mut self, secs: u64) -> Self {
        self.job_timeout_secs = secs;
        self
    }

    pub fn with_dependency(mut self, dependency: DependencyConfig) -> Self {
        self.dependency = dependency;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_plugin_range(
        mut self,
        plugin_id: impl Into<String>,
        range: PluginRange,
    ) -> Self {
        self.plugin_ranges.insert(plugin_id.into(), range);
        self
    }
}

/// Tuning of dependency waits and re-submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyConfig {
    /// Pause before re-submitting a job whose predecessor is still running.
    pub damping_delay_ms: u64,
    /// Transport delay of the first re-submission; doubles per attempt.
    pub resubmit_base_delay_ms: u64,
    pub resubmit_max_delay_ms: u64,
    /// Re-submissions allowed before the job is failed. `None` is unbounded.
    pub max_resubmits: Option<u32>,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            damping_delay_ms: 500,
            resubmit_base_delay_ms: 1_000,
            resubmit_max_delay_ms: 60_000,
            max_resubmits: Some(1_440),
        }
    }
}

impl DependencyConfig {
    /// No waiting at all, with an attempt cap. Useful in tests.
    pub fn immediate(max_resubmits: Option<u32>) -> Self {
        Self {
            damping_delay_ms: 0,
            resubmit_base_delay_ms: 0,
            resubmit_max_delay_ms: 0,
            max_resubmits,
        }
    }

    pub fn damping_delay(&self) -> Duration {
        Duration::from_millis(self.damping_delay_ms)
    }

    /// Delay before re-submission attempt `attempt` (1-based):
    /// `min(base * 2^(attempt - 1), max)`.
    pub fn resubmit_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.resubmit_base_delay_ms == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let scaled = self.resubmit_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(scaled.min(self.resubmit_max_delay_ms))
    }
}
