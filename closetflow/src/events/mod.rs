//! Lifecycle events for queues and workers.
//!
//! Queues emit one event per job state change; workers add `chain.enqueued`
//! when they hand a job to the next stage. Events go to the [`EventSink`]
//! attached to the runtime.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::core::Job;

/// A job was enqueued or returned to waiting.
pub const JOB_WAITING: &str = "job.waiting";
/// A job was claimed by a worker slot.
pub const JOB_ACTIVE: &str = "job.active";
/// A handler reported progress.
pub const JOB_PROGRESS: &str = "job.progress";
/// A failed attempt was scheduled for retry.
pub const JOB_RETRY_SCHEDULED: &str = "job.retry_scheduled";
/// A job completed.
pub const JOB_COMPLETED: &str = "job.completed";
/// A job failed permanently.
pub const JOB_FAILED: &str = "job.failed";
/// A job record was removed.
pub const JOB_REMOVED: &str = "job.removed";
/// A worker enqueued the next stage of a chain.
pub const CHAIN_ENQUEUED: &str = "chain.enqueued";

/// Builds the common event body for a job.
#[must_use]
pub fn job_event_data(job: &Job) -> serde_json::Value {
    serde_json::json!({
        "queue": job.queue,
        "job_id": job.id,
        "stage": job.stage(),
        "state": job.state,
        "attempts_made": job.attempts_made,
        "progress": job.progress,
    })
}
