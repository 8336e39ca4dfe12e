//! Per-invocation context handed to stage handlers.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::cancellation::CancellationToken;
use crate::core::Job;
use crate::queue::JobQueue;
use crate::stages::StagePayload;

/// What a handler sees of the job it runs.
///
/// The job is a snapshot taken at claim time. Progress goes back to the
/// owning queue; the cancellation token is fresh for every invocation.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Job,
    queue: Arc<JobQueue>,
    cancel: Arc<CancellationToken>,
    deadline: Duration,
}

impl JobContext {
    /// Creates a context for a claimed job.
    #[must_use]
    pub fn new(
        job: Job,
        queue: Arc<JobQueue>,
        cancel: Arc<CancellationToken>,
        deadline: Duration,
    ) -> Self {
        Self {
            job,
            queue,
            cancel,
            deadline,
        }
    }

    /// The claimed job.
    #[must_use]
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// The job payload.
    #[must_use]
    pub fn payload(&self) -> &StagePayload {
        &self.job.payload
    }

    /// The queue the job was claimed from.
    #[must_use]
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// The chain key, which is also the job id.
    #[must_use]
    pub fn chain_key(&self) -> &str {
        &self.job.id
    }

    /// 1-based number of the running attempt.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.job.attempts_made + 1
    }

    /// Deadline of the invocation, for the outbound call.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Token cancelled when the invocation is aborted.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Reports progress. Failures are logged, never raised: progress is
    /// advisory.
    pub async fn report_progress(&self, percent: u8) {
        if let Err(e) = self.queue.update_progress(&self.job.id, percent).await {
            warn!(
                queue = %self.queue.name(),
                job_id = %self.job.id,
                progress = percent,
                error = %e,
                "Failed to record progress"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{JobOptions, JobState};
    use crate::stages::MannequinPayload;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_context_reports_progress() {
        let queue = Arc::new(JobQueue::in_memory("mannequinGenerationQueue"));
        queue
            .enqueue(
                MannequinPayload {
                    user_id: "u".into(),
                    image: PathBuf::from("/data/m.jpg"),
                    file_name: "m.jpg".into(),
                }
                .into(),
                JobOptions::new().with_id("m-1"),
            )
            .await
            .unwrap();
        let job = queue.claim().await.unwrap().unwrap();

        let ctx = JobContext::new(
            job,
            queue.clone(),
            Arc::new(CancellationToken::new()),
            Duration::from_secs(5),
        );
        assert_eq!(ctx.chain_key(), "m-1");
        assert_eq!(ctx.attempt(), 1);
        assert_eq!(ctx.payload().stage_name(), "mannequin");

        ctx.report_progress(60).await;
        let stored = queue.get_job("m-1").await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Active);
        assert_eq!(stored.progress, 60);
    }

    #[tokio::test]
    async fn test_progress_on_finished_job_is_ignored() {
        let queue = Arc::new(JobQueue::in_memory("q"));
        let job = queue
            .enqueue(
                MannequinPayload {
                    user_id: "u".into(),
                    image: PathBuf::from("/data/m.jpg"),
                    file_name: "m.jpg".into(),
                }
                .into(),
                JobOptions::new(),
            )
            .await
            .unwrap();

        let ctx = JobContext::new(
            job,
            queue,
            Arc::new(CancellationToken::new()),
            Duration::from_secs(5),
        );
        ctx.report_progress(10).await;
    }
}
