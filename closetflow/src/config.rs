//! Runtime configuration.
//!
//! Configuration comes from defaults, an optional JSON file named by
//! `CLOSETFLOW_CONFIG`, and environment overrides, in that order.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::RetentionPolicy;
use crate::errors::{PipelineError, Result};
use crate::pipeline::BackoffPolicy;

/// Environment variable naming the JSON config file.
pub const ENV_CONFIG: &str = "CLOSETFLOW_CONFIG";
/// Overrides [`PipelineConfig::ai_base`].
pub const ENV_AI_BASE: &str = "CLOSETFLOW_AI_BASE";
/// Overrides [`PipelineConfig::data_dir`].
pub const ENV_DATA_DIR: &str = "CLOSETFLOW_DATA_DIR";
/// Overrides [`PipelineConfig::queue_dir`].
pub const ENV_QUEUE_DIR: &str = "CLOSETFLOW_QUEUE_DIR";
/// Overrides [`PipelineConfig::log_format`].
pub const ENV_LOG_FORMAT: &str = "CLOSETFLOW_LOG_FORMAT";
/// Overrides [`PipelineConfig::shutdown_grace_secs`].
pub const ENV_SHUTDOWN_GRACE_SECS: &str = "CLOSETFLOW_SHUTDOWN_GRACE_SECS";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, multi-line.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(PipelineError::Configuration(format!(
                "unknown log format '{other}', expected 'pretty' or 'json'"
            ))),
        }
    }
}

/// Settings of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Full endpoint URL; derived from the AI base when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Number of worker slots.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Maximum attempts per job.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Delay between attempts.
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Deadline of one attempt in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_concurrency() -> usize {
    1
}

fn default_attempts() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            concurrency: default_concurrency(),
            attempts: default_attempts(),
            backoff: BackoffPolicy::default(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl StageConfig {
    /// Sets the number of worker slots.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Sets the backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the attempt deadline in seconds.
    #[must_use]
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Sets an explicit endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Attempt deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self, stage: &str) -> Result<()> {
        if self.concurrency == 0 {
            return Err(PipelineError::Configuration(format!(
                "stage '{stage}' needs a concurrency of at least 1"
            )));
        }
        if self.attempts == 0 {
            return Err(PipelineError::Configuration(format!(
                "stage '{stage}' needs at least 1 attempt"
            )));
        }
        if self.timeout_secs == 0 {
            return Err(PipelineError::Configuration(format!(
                "stage '{stage}' needs a non-zero timeout"
            )));
        }
        Ok(())
    }
}

/// Configuration of the whole pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Scheme and host of the inference services, without port.
    #[serde(default = "default_ai_base")]
    pub ai_base: String,
    /// Root directory that uploaded files must live under.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory of durable queue files; queues are in-memory when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_dir: Option<PathBuf>,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
    /// How long shutdown waits for in-flight handlers.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Fallback interval at which idle worker slots re-check their queue.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Terminal job retention for every queue.
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// Landmark prediction stage.
    #[serde(default = "default_predict")]
    pub predict: StageConfig,
    /// Texture generation stage.
    #[serde(default = "default_cloth2tex")]
    pub cloth2tex: StageConfig,
    /// Mannequin generation stage.
    #[serde(default)]
    pub mannequin: StageConfig,
}

fn default_ai_base() -> String {
    "http://15.165.129.131".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_predict() -> StageConfig {
    StageConfig::default().with_concurrency(3)
}

fn default_cloth2tex() -> StageConfig {
    StageConfig::default().with_timeout_secs(30 * 60)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ai_base: default_ai_base(),
            data_dir: default_data_dir(),
            queue_dir: None,
            log_format: LogFormat::default(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            retention: RetentionPolicy::default(),
            predict: default_predict(),
            cloth2tex: default_cloth2tex(),
            mannequin: StageConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the file named by `CLOSETFLOW_CONFIG`, if any, then applies
    /// environment overrides and validates the result.
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Like [`load`](Self::load) with a custom variable lookup.
    pub fn load_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = match lookup(ENV_CONFIG) {
            Some(path) if !path.trim().is_empty() => Self::from_file(path)?,
            _ => Self::default(),
        };
        let config = config.with_env_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            PipelineError::Configuration(format!("invalid config {}: {e}", path.display()))
        })
    }

    /// Applies `CLOSETFLOW_*` overrides.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base) = lookup(ENV_AI_BASE) {
            self.ai_base = base;
        }
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_QUEUE_DIR) {
            self.queue_dir = if dir.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(dir))
            };
        }
        if let Some(format) = lookup(ENV_LOG_FORMAT) {
            self.log_format = format.parse()?;
        }
        if let Some(secs) = lookup(ENV_SHUTDOWN_GRACE_SECS) {
            self.shutdown_grace_secs = secs.trim().parse().map_err(|_| {
                PipelineError::Configuration(format!(
                    "{ENV_SHUTDOWN_GRACE_SECS} must be a whole number of seconds, got '{secs}'"
                ))
            })?;
        }
        Ok(self)
    }

    /// Checks the configuration for inconsistencies.
    pub fn validate(&self) -> Result<()> {
        let base = self.ai_base.trim();
        if base.is_empty() {
            return Err(PipelineError::Configuration("ai_base must not be empty".into()));
        }
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(PipelineError::Configuration(format!(
                "ai_base '{base}' must start with http:// or https://"
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(PipelineError::Configuration(
                "poll_interval_ms must be at least 1".into(),
            ));
        }
        self.predict.validate("predict")?;
        self.cloth2tex.validate("cloth2tex")?;
        self.mannequin.validate("mannequin")
    }

    /// Sets the AI base.
    #[must_use]
    pub fn with_ai_base(mut self, ai_base: impl Into<String>) -> Self {
        self.ai_base = ai_base.into();
        self
    }

    /// Sets the data root.
    #[must_use]
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Enables durable queues under `queue_dir`.
    #[must_use]
    pub fn with_queue_dir(mut self, queue_dir: impl Into<PathBuf>) -> Self {
        self.queue_dir = Some(queue_dir.into());
        self
    }

    /// Sets the shutdown grace period in seconds.
    #[must_use]
    pub fn with_shutdown_grace_secs(mut self, secs: u64) -> Self {
        self.shutdown_grace_secs = secs;
        self
    }

    /// Sets the idle poll interval in milliseconds.
    #[must_use]
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Applies `f` to every stage's settings.
    #[must_use]
    pub fn map_stages(mut self, f: impl Fn(StageConfig) -> StageConfig) -> Self {
        self.predict = f(self.predict);
        self.cloth2tex = f(self.cloth2tex);
        self.mannequin = f(self.mannequin);
        self
    }

    /// Endpoint of a service on the AI host.
    #[must_use]
    pub fn service_url(&self, port: u16, path: &str) -> String {
        format!("{}:{port}{path}", self.ai_base.trim_end_matches('/'))
    }

    /// Shutdown grace period.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Idle poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
