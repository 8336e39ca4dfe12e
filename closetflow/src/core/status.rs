//! Job state and reported status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle state of a job inside its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed (possibly delayed by backoff).
    Waiting,
    /// Claimed by a worker slot and executing.
    Active,
    /// Finished successfully.
    Completed,
    /// Failed permanently.
    Failed,
}

impl Default for JobState {
    fn default() -> Self {
        Self::Waiting
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl JobState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 4] = [Self::Waiting, Self::Active, Self::Completed, Self::Failed];

    /// Returns true if the state is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Status reported to a polling caller.
///
/// Mirrors [`JobState`] plus `NotFound` for chain keys no queue or record
/// knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// The current stage's job is waiting.
    Waiting,
    /// The current stage's job is executing.
    Active,
    /// The chain (or the reported stage) completed.
    Completed,
    /// The chain failed at the reported stage.
    Failed,
    /// Nothing is known about the chain key.
    NotFound,
}

impl From<JobState> for ReportStatus {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Waiting => Self::Waiting,
            JobState::Active => Self::Active,
            JobState::Completed => Self::Completed,
            JobState::Failed => Self::Failed,
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::NotFound => write!(f, "not_found"),
        }
    }
}
