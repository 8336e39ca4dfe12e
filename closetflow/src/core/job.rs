//! Job records, submission options and the chain key.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use super::{JobState, StageOutput};
use crate::errors::{PipelineError, Result};
use crate::pipeline::BackoffPolicy;
use crate::stages::StagePayload;

const CHAIN_KEY_PATTERN: &str = r"^[A-Za-z0-9_-]{1,128}$";

fn chain_key_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(CHAIN_KEY_PATTERN))
        .as_ref()
        .map_err(|e| PipelineError::Configuration(format!("invalid chain key pattern: {e}")))
}

/// The identifier a logical unit of work keeps across every queue of its
/// chain. It is used verbatim as the job id in each queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChainKey(String);

impl ChainKey {
    /// Validates and wraps a chain key.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if !chain_key_pattern()?.is_match(&key) {
            return Err(PipelineError::InputValidation {
                message: format!(
                    "chain key '{key}' must be 1-128 characters of letters, digits, '-' or '_'"
                ),
                field: Some("chain_key".to_string()),
            });
        }
        Ok(Self(key))
    }

    /// Generates a fresh random chain key.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ChainKey {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ChainKey> for String {
    fn from(key: ChainKey) -> Self {
        key.0
    }
}

impl AsRef<str> for ChainKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What happens to a job record once it reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Delete the record immediately.
    Remove,
    /// Keep the record indefinitely.
    Keep,
    /// Keep only the most recent `n` records in that terminal state.
    KeepLast(usize),
}

/// Retention rules for both terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Applied on `completed`.
    pub on_complete: Retention,
    /// Applied on `failed`.
    pub on_fail: Retention,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            on_complete: Retention::Remove,
            on_fail: Retention::Keep,
        }
    }
}

impl RetentionPolicy {
    /// The rule for a terminal state.
    #[must_use]
    pub fn for_state(&self, state: JobState) -> Option<Retention> {
        match state {
            JobState::Completed => Some(self.on_complete),
            JobState::Failed => Some(self.on_fail),
            JobState::Waiting | JobState::Active => None,
        }
    }
}

/// Options supplied with an enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Explicit job id; acts as the dedup key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Maximum number of attempts, including the first.
    pub attempts: u32,
    /// Delay policy between attempts.
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Terminal record retention.
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// Per-attempt deadline in milliseconds; the stage default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            id: None,
            attempts: 3,
            backoff: BackoffPolicy::default(),
            retention: RetentionPolicy::default(),
            timeout_ms: None,
        }
    }
}

impl JobOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the job id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
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

    /// Sets the retention policy.
    #[must_use]
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the per-attempt deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// The per-attempt deadline, if set.
    #[must_use]
    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_ms.map(std::time::Duration::from_millis)
    }
}

/// A unit of work held by a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job id, unique within its queue.
    pub id: String,
    /// Owning queue.
    pub queue: String,
    /// Stage-specific input.
    pub payload: StagePayload,
    /// Submission options.
    pub options: JobOptions,
    /// Current state.
    pub state: JobState,
    /// Failed or in-flight attempts counted so far.
    pub attempts_made: u32,
    /// Advisory progress, 0 to 100.
    pub progress: u8,
    /// Return value once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Message of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    /// Handler output kept when a follow-up step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_output: Option<StageOutput>,
    /// Insertion sequence within the queue.
    pub seq: u64,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be claimed.
    pub available_at: DateTime<Utc>,
    /// When the current or last attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a waiting job.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        queue: impl Into<String>,
        payload: StagePayload,
        options: JobOptions,
        seq: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            queue: queue.into(),
            payload,
            options,
            state: JobState::Waiting,
            attempts_made: 0,
            progress: 0,
            result: None,
            failed_reason: None,
            stage_output: None,
            seq,
            created_at: now,
            available_at: now,
            processed_at: None,
            finished_at: None,
        }
    }

    /// The stage this job runs.
    #[must_use]
    pub fn stage(&self) -> &'static str {
        self.payload.stage_name()
    }

    /// Returns true if a waiting job's backoff delay has elapsed.
    #[must_use]
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Waiting && self.available_at <= now
    }

    /// Attempts left before the job fails permanently.
    #[must_use]
    pub fn attempts_remaining(&self) -> u32 {
        self.options.attempts.saturating_sub(self.attempts_made)
    }
}
