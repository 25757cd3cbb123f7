use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::ConfigError;
use crate::Result;

/// Overrides `execution.max_parallel_workers`.
pub const ENV_MAX_WORKERS: &str = "STRATUM_MAX_WORKERS";
/// Overrides `execution.task_timeout_secs`.
pub const ENV_TASK_TIMEOUT: &str = "STRATUM_TASK_TIMEOUT_SECS";
/// Overrides `quality.enabled`.
pub const ENV_QUALITY_ENABLED: &str = "STRATUM_QUALITY_ENABLED";

/// Named worker/timeout/retry presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Maximum parallelism, short timeout, no retries.
    Aggressive,
    Conservative,
    #[default]
    Hybrid,
    /// One worker at a time.
    Sequential,
}

impl ExecutionStrategy {
    /// `(max_parallel_workers, task_timeout_secs, auto_retry)` for this preset.
    pub fn preset(self) -> (usize, u64, bool) {
        match self {
            ExecutionStrategy::Aggressive => (5, 20 * 60, false),
            ExecutionStrategy::Conservative => (2, 60 * 60, true),
            ExecutionStrategy::Hybrid => (3, 30 * 60, true),
            ExecutionStrategy::Sequential => (1, 45 * 60, true),
        }
    }
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionStrategy::Aggressive => "aggressive",
            ExecutionStrategy::Conservative => "conservative",
            ExecutionStrategy::Hybrid => "hybrid",
            ExecutionStrategy::Sequential => "sequential",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub max_parallel_workers: usize,
    pub strategy: ExecutionStrategy,
    /// Hard per-attempt timeout. Zero disables it.
    pub task_timeout_secs: u64,
    pub auto_retry_failed_tasks: bool,
    pub max_retries: u32,
    /// Minimum layer success rate required to start the next layer.
    pub continuation_threshold: f64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            max_parallel_workers: 3,
            strategy: ExecutionStrategy::Hybrid,
            task_timeout_secs: 1800,
            auto_retry_failed_tasks: true,
            max_retries: 2,
            continuation_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySettings {
    pub enabled: bool,
    pub min_coverage: f64,
    pub max_execution_time_secs: f64,
    pub max_memory_mb: f64,
    pub max_medium_severity: u32,
    pub max_complexity: f64,
    pub min_documentation_coverage: f64,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_coverage: 95.0,
            max_execution_time_secs: 300.0,
            max_memory_mb: 500.0,
            max_medium_severity: 2,
            max_complexity: 10.0,
            min_documentation_coverage: 80.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub history_capacity: usize,
    pub max_task_duration_secs: u64,
    pub max_failure_rate: f64,
    pub min_completion_rate: f64,
    /// Completion-rate alerts only fire after this much elapsed time.
    pub min_completion_elapsed_secs: u64,
    pub min_worker_utilization: f64,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5,
            history_capacity: 100,
            max_task_duration_secs: 1800,
            max_failure_rate: 0.2,
            min_completion_rate: 0.3,
            min_completion_elapsed_secs: 300,
            min_worker_utilization: 0.5,
        }
    }
}

/// Which dependency inference strategies the graph builder runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    pub file: bool,
    pub keyword: bool,
    pub phase: bool,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            file: true,
            keyword: true,
            phase: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExecutionConfig {
    pub execution: ExecutionSettings,
    pub quality: QualitySettings,
    pub monitoring: MonitoringSettings,
    pub inference: InferenceSettings,
}

impl ExecutionConfig {
    pub fn stratum_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or(ConfigError::NoHomeDir)?
            .join(".stratum"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::stratum_dir()?.join("config.toml"))
    }

    /// Load `~/.stratum/config.toml`, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading config");
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<PathBuf> {
        let dir = Self::stratum_dir()?;
        if !dir.exists() {
            debug!(dir = %dir.display(), "Creating stratum directory");
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    /// Apply a strategy preset over the execution section.
    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        let (workers, timeout, retry) = strategy.preset();
        self.execution.strategy = strategy;
        self.execution.max_parallel_workers = workers;
        self.execution.task_timeout_secs = timeout;
        self.execution.auto_retry_failed_tasks = retry;
        self
    }

    /// Apply `STRATUM_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub(crate) fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MAX_WORKERS) {
            self.execution.max_parallel_workers = parse_env(ENV_MAX_WORKERS, &value)?;
        }
        if let Some(value) = lookup(ENV_TASK_TIMEOUT) {
            self.execution.task_timeout_secs = parse_env(ENV_TASK_TIMEOUT, &value)?;
        }
        if let Some(value) = lookup(ENV_QUALITY_ENABLED) {
            self.quality.enabled = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "{} must be a boolean, got '{}'",
                        ENV_QUALITY_ENABLED, other
                    ))
                    .into())
                }
            };
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> crate::Error { ConfigError::Invalid(msg).into() };

        if self.execution.max_parallel_workers == 0 {
            return Err(invalid("execution.max_parallel_workers must be at least 1".into()));
        }
        let fractions = [
            ("execution.continuation_threshold", self.execution.continuation_threshold),
            ("monitoring.max_failure_rate", self.monitoring.max_failure_rate),
            ("monitoring.min_completion_rate", self.monitoring.min_completion_rate),
            ("monitoring.min_worker_utilization", self.monitoring.min_worker_utilization),
        ];
        for (name, value) in fractions {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!("{} must be within [0, 1], got {}", name, value)));
            }
        }
        if !(0.0..=100.0).contains(&self.quality.min_coverage) {
            return Err(invalid(format!(
                "quality.min_coverage must be within [0, 100], got {}",
                self.quality.min_coverage
            )));
        }
        if self.monitoring.interval_secs == 0 {
            return Err(invalid("monitoring.interval_secs must be at least 1".into()));
        }
        if self.monitoring.history_capacity == 0 {
            return Err(invalid("monitoring.history_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        ConfigError::Invalid(format!("{} has an invalid value '{}'", key, value)).into()
    })
}
