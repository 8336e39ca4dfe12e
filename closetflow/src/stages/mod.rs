//! Stage handlers and the payloads they consume.
//!
//! A handler runs one attempt of one job: it makes exactly one inference
//! call, validates the response and returns a [`StageOutput`]. Chaining,
//! retries and state transitions belong to the worker.

mod cloth2tex;
mod envelope;
mod mannequin;
mod payload;
mod predict;

pub use cloth2tex::Cloth2TexHandler;
pub use envelope::ResponseEnvelope;
pub use mannequin::MannequinHandler;
pub use payload::{
    Category, Cloth2TexPayload, MannequinPayload, PredictPayload, StagePayload, SubCategory,
};
pub use predict::PredictHandler;

use async_trait::async_trait;
use std::fmt::Debug;

use crate::core::StageOutput;
use crate::errors::{PipelineError, Result};
use crate::worker::JobContext;

/// Trait for stage handlers.
///
/// Handlers must be safe to re-run: an attempt that fails after its
/// inference call succeeded is retried from the start.
#[async_trait]
pub trait StageHandler: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Runs one attempt of the job in `ctx`.
    async fn handle(&self, ctx: &JobContext) -> Result<StageOutput>;
}

/// A handler backed by a synchronous closure.
pub struct FnHandler<F>
where
    F: Fn(&JobContext) -> Result<StageOutput> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&JobContext) -> Result<StageOutput> + Send + Sync,
{
    /// Creates a new closure handler.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnHandler<F>
where
    F: Fn(&JobContext) -> Result<StageOutput> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<F> StageHandler for FnHandler<F>
where
    F: Fn(&JobContext) -> Result<StageOutput> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: &JobContext) -> Result<StageOutput> {
        (self.func)(ctx)
    }
}

fn wrong_payload(stage: &str, payload: &StagePayload) -> PipelineError {
    PipelineError::InputValidation {
        message: format!(
            "{stage} handler received a {} payload",
            payload.stage_name()
        ),
        field: Some("stage".to_string()),
    }
}

fn persistence_error(err: PipelineError) -> PipelineError {
    match err {
        PipelineError::Persistence(_) => err,
        other => PipelineError::persistence(other.to_string()),
    }
}
