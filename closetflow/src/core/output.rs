//! Stage output returned by a successful handler run.

use serde::{Deserialize, Serialize};

use crate::stages::StagePayload;

/// What a handler produced.
///
/// `result` becomes the job's return value. `next`, when present, is the
/// payload the worker submits to the following stage of the chain under
/// the same chain key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// The job's return value.
    pub result: serde_json::Value,
    /// Payload for the next stage, if the chain continues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<StagePayload>,
}

impl StageOutput {
    /// Output of a terminal stage.
    #[must_use]
    pub fn done(result: serde_json::Value) -> Self {
        Self { result, next: None }
    }

    /// Output that continues the chain with `next`.
    #[must_use]
    pub fn chain(result: serde_json::Value, next: impl Into<StagePayload>) -> Self {
        Self {
            result,
            next: Some(next.into()),
        }
    }

    /// Returns true if the chain continues after this output.
    #[must_use]
    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }
}
