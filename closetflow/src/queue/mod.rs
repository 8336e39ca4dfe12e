//! Named job queues.
//!
//! A [`JobQueue`] owns one [`QueueStore`] and implements the job lifecycle on
//! top of it: dedup-by-id admission, FIFO claims, progress, completion,
//! failed attempts with backoff, and terminal retention. Every state change
//! is reported to the queue's [`EventSink`].

mod factory;
mod file;
mod scan;
mod store;

pub use factory::{FileStoreFactory, MemoryStoreFactory, QueueStoreFactory};
pub use file::FileQueueStore;
pub use scan::JobScan;
pub use store::{JobCounts, MemoryQueueStore, QueueStore};

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::core::{Job, JobOptions, JobState, Retention, StageOutput};
use crate::errors::{PipelineError, Result};
use crate::events::{self, job_event_data, EventSink, NoOpEventSink};
use crate::pipeline::{should_retry, RetryDecision};
use crate::stages::StagePayload;

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job went back to waiting and becomes claimable after `delay`.
    Retrying {
        /// Backoff before the next attempt.
        delay: Duration,
        /// Attempts counted so far.
        attempts_made: u32,
    },
    /// The job failed permanently.
    Failed {
        /// Attempts counted so far.
        attempts_made: u32,
    },
}

impl FailOutcome {
    /// Returns true if the job will be retried.
    #[must_use]
    pub fn is_retrying(&self) -> bool {
        matches!(self, Self::Retrying { .. })
    }
}

/// A named FIFO queue of jobs.
pub struct JobQueue {
    name: String,
    store: Arc<dyn QueueStore>,
    notify: Arc<Notify>,
    closed: AtomicBool,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl JobQueue {
    /// Creates a queue over a store.
    #[must_use]
    pub fn new(name: impl Into<String>, store: Arc<dyn QueueStore>) -> Self {
        Self {
            name: name.into(),
            store,
            notify: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Creates a queue over a fresh in-memory store.
    #[must_use]
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::new(name, Arc::new(MemoryQueueStore::new()))
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wakes idle worker slots when a job becomes available.
    #[must_use]
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Adds a job.
    ///
    /// The job id is `options.id` when given, otherwise a UUID v4. Fails with
    /// `DuplicateJob` while a job with that id is held in any state, with
    /// `QueueClosed` after [`close`](Self::close), and with `InputValidation`
    /// when `options.attempts` is zero.
    pub async fn enqueue(&self, payload: StagePayload, options: JobOptions) -> Result<Job> {
        if self.is_closed() {
            return Err(PipelineError::QueueClosed(self.name.clone()));
        }
        if options.attempts == 0 {
            return Err(PipelineError::InputValidation {
                message: "attempts must be at least 1".to_string(),
                field: Some("attempts".to_string()),
            });
        }
        payload.validate()?;

        let id = options
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let job = self
            .store
            .insert(Job::new(id, self.name.clone(), payload, options, 0))
            .await?;

        debug!(queue = %self.name, job_id = %job.id, stage = job.stage(), "Job enqueued");
        self.events.try_emit(events::JOB_WAITING, Some(job_event_data(&job)));
        self.notify.notify_one();
        Ok(job)
    }

    /// Returns a job by id.
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.store.get(id).await
    }

    /// Returns the state of a job by id.
    pub async fn get_state(&self, id: &str) -> Result<Option<JobState>> {
        Ok(self.store.get(id).await?.map(|job| job.state))
    }

    /// Lists jobs in the given states, most recent first.
    #[must_use]
    pub fn list_jobs(&self, states: &[JobState]) -> JobScan {
        JobScan::new(self.store.clone(), states)
    }

    /// Claims the oldest ready waiting job.
    pub async fn claim(&self) -> Result<Option<Job>> {
        let claimed = self.store.claim_next(Utc::now()).await?;
        if let Some(job) = &claimed {
            self.events.try_emit(events::JOB_ACTIVE, Some(job_event_data(job)));
        }
        Ok(claimed)
    }

    async fn active_job(&self, id: &str, to: JobState) -> Result<Job> {
        let job = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::job_not_found(&self.name, id))?;
        if job.state != JobState::Active {
            return Err(PipelineError::invalid_transition(id, job.state, to));
        }
        Ok(job)
    }

    /// Records handler progress on an active job, clamped to 100.
    pub async fn update_progress(&self, id: &str, percent: u8) -> Result<()> {
        let mut job = self.active_job(id, JobState::Active).await?;
        job.progress = percent.min(100);
        self.store.update(job.clone()).await?;

        self.events.try_emit(events::JOB_PROGRESS, Some(job_event_data(&job)));
        Ok(())
    }

    /// Keeps a successful handler output on an active job.
    pub async fn preserve_output(&self, id: &str, output: StageOutput) -> Result<()> {
        let mut job = self.active_job(id, JobState::Active).await?;
        job.stage_output = Some(output);
        self.store.update(job).await
    }

    /// Moves an active job to completed and applies retention.
    pub async fn complete(&self, id: &str, result: serde_json::Value) -> Result<Job> {
        let mut job = self.active_job(id, JobState::Completed).await?;
        job.state = JobState::Completed;
        job.result = Some(result);
        job.stage_output = None;
        job.finished_at = Some(Utc::now());
        self.store.update(job.clone()).await?;

        info!(queue = %self.name, job_id = %job.id, attempt = job.attempts_made + 1, "Job completed");
        self.events.try_emit(events::JOB_COMPLETED, Some(job_event_data(&job)));
        self.apply_retention(&job).await?;
        Ok(job)
    }

    /// Records a failed attempt on an active job.
    ///
    /// Retryable errors with attempts left send the job back to waiting
    /// behind its backoff delay; anything else fails it permanently.
    pub async fn fail_attempt(&self, id: &str, error: &PipelineError) -> Result<FailOutcome> {
        let mut job = self.active_job(id, JobState::Failed).await?;
        job.attempts_made += 1;
        job.failed_reason = Some(error.to_string());

        let decision = should_retry(
            job.attempts_made,
            job.options.attempts,
            error.is_retryable(),
            &job.options.backoff,
        );

        match decision {
            RetryDecision::Retry(delay) => {
                job.state = JobState::Waiting;
                job.available_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                self.store.update(job.clone()).await?;

                warn!(
                    queue = %self.name,
                    job_id = %job.id,
                    attempt = job.attempts_made,
                    delay_ms = millis(delay),
                    error = %error,
                    "Attempt failed, retry scheduled"
                );
                let mut data = job_event_data(&job);
                data["delay_ms"] = serde_json::json!(millis(delay));
                data["error"] = serde_json::json!(error.to_string());
                self.events.try_emit(events::JOB_RETRY_SCHEDULED, Some(data));

                Ok(FailOutcome::Retrying {
                    delay,
                    attempts_made: job.attempts_made,
                })
            }
            RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                job.state = JobState::Failed;
                job.finished_at = Some(Utc::now());
                self.store.update(job.clone()).await?;

                warn!(
                    queue = %self.name,
                    job_id = %job.id,
                    attempt = job.attempts_made,
                    retryable = error.is_retryable(),
                    error = %error,
                    "Job failed"
                );
                let mut data = job_event_data(&job);
                data["error"] = serde_json::json!(error.to_string());
                self.events.try_emit(events::JOB_FAILED, Some(data));
                self.apply_retention(&job).await?;

                Ok(FailOutcome::Failed {
                    attempts_made: job.attempts_made,
                })
            }
        }
    }

    /// Removes a job in any state.
    pub async fn remove(&self, id: &str) -> Result<Option<Job>> {
        let removed = self.store.remove(id).await?;
        if let Some(job) = &removed {
            self.events.try_emit(events::JOB_REMOVED, Some(job_event_data(job)));
        }
        Ok(removed)
    }

    async fn apply_retention(&self, job: &Job) -> Result<()> {
        match job.options.retention.for_state(job.state) {
            Some(Retention::Remove) => {
                self.remove(&job.id).await?;
            }
            Some(Retention::KeepLast(keep)) => {
                let ids = self.store.ids_by_recency(&[job.state]).await?;
                for id in ids.iter().skip(keep) {
                    self.remove(id).await?;
                }
            }
            Some(Retention::Keep) | None => {}
        }
        Ok(())
    }

    /// Per-state job counts.
    pub async fn counts(&self) -> Result<JobCounts> {
        self.store.counts().await
    }

    /// Stops admitting new jobs. Held jobs are untouched.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(queue = %self.name, "Queue closed to new jobs");
        }
    }

    /// Returns true once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Persists the backing store.
    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RetentionPolicy;
    use crate::events::CollectingEventSink;
    use crate::pipeline::BackoffPolicy;
    use crate::stages::MannequinPayload;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn payload(user: &str) -> StagePayload {
        MannequinPayload {
            user_id: user.into(),
            image: PathBuf::from("/data/m.jpg"),
            file_name: "m.jpg".into(),
        }
        .into()
    }

    fn quick() -> JobOptions {
        JobOptions::new().with_backoff(BackoffPolicy::fixed(0))
    }

    #[tokio::test]
    async fn test_enqueue_generates_id() {
        let queue = JobQueue::in_memory("q");
        let job = queue.enqueue(payload("u"), JobOptions::new()).await.unwrap();

        assert!(uuid::Uuid::parse_str(&job.id).is_ok());
        assert_eq!(queue.get_state(&job.id).await.unwrap(), Some(JobState::Waiting));
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_per_id() {
        let queue = JobQueue::in_memory("q");
        queue
            .enqueue(payload("u"), JobOptions::new().with_id("cloth-1"))
            .await
            .unwrap();

        let err = queue
            .enqueue(payload("u"), JobOptions::new().with_id("cloth-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateJob { ref id, .. } if id == "cloth-1"));
        assert_eq!(queue.counts().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_payload() {
        let queue = JobQueue::in_memory("q");
        let err = queue.enqueue(payload(""), JobOptions::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::InputValidation { .. }));
        assert_eq!(queue.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_zero_attempts() {
        let queue = JobQueue::in_memory("q");
        let err = queue
            .enqueue(payload("u"), JobOptions::new().with_attempts(0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InputValidation { field: Some(ref f), .. } if f == "attempts"
        ));
        assert_eq!(queue.counts().await.unwrap().total(), 0);

        queue
            .enqueue(payload("u"), JobOptions::new().with_attempts(1))
            .await
            .unwrap();
        assert_eq!(queue.counts().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects() {
        let queue = JobQueue::in_memory("q");
        queue.close();
        assert!(queue.is_closed());

        let err = queue.enqueue(payload("u"), JobOptions::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::QueueClosed(_)));
    }

    #[tokio::test]
    async fn test_complete_removes_by_default() {
        let sink = Arc::new(CollectingEventSink::new());
        let queue = JobQueue::in_memory("q").with_event_sink(sink.clone());
        let job = queue.enqueue(payload("u"), JobOptions::new()).await.unwrap();

        queue.claim().await.unwrap().unwrap();
        queue.update_progress(&job.id, 250).await.unwrap();
        let done = queue.complete(&job.id, serde_json::json!({"ok": true})).await.unwrap();

        assert_eq!(done.progress, 100);
        assert!(queue.get_job(&job.id).await.unwrap().is_none());
        assert_eq!(
            sink.names(),
            vec!["job.waiting", "job.active", "job.progress", "job.completed", "job.removed"]
        );
    }

    #[tokio::test]
    async fn test_complete_requires_active() {
        let queue = JobQueue::in_memory("q");
        let job = queue.enqueue(payload("u"), JobOptions::new()).await.unwrap();

        let err = queue.complete(&job.id, serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));

        let err = queue.complete("ghost", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, PipelineError::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn test_fail_attempt_retries_then_fails() {
        let queue = JobQueue::in_memory("q");
        let job = queue
            .enqueue(payload("u"), quick().with_attempts(2))
            .await
            .unwrap();
        let error = PipelineError::external("http://ai/predict", Some(500), "boom");

        queue.claim().await.unwrap().unwrap();
        let outcome = queue.fail_attempt(&job.id, &error).await.unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                delay: Duration::ZERO,
                attempts_made: 1
            }
        );
        assert_eq!(queue.get_state(&job.id).await.unwrap(), Some(JobState::Waiting));

        queue.claim().await.unwrap().unwrap();
        let outcome = queue.fail_attempt(&job.id, &error).await.unwrap();
        assert_eq!(outcome, FailOutcome::Failed { attempts_made: 2 });

        let failed = queue.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert!(failed.failed_reason.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let queue = JobQueue::in_memory("q");
        let job = queue.enqueue(payload("u"), quick()).await.unwrap();

        queue.claim().await.unwrap().unwrap();
        let outcome = queue
            .fail_attempt(&job.id, &PipelineError::blob_not_found("/data/gone.jpg"))
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Failed { attempts_made: 1 });
    }

    #[tokio::test]
    async fn test_retry_respects_backoff_delay() {
        let queue = JobQueue::in_memory("q");
        let job = queue
            .enqueue(payload("u"), JobOptions::new().with_backoff(BackoffPolicy::fixed(60_000)))
            .await
            .unwrap();

        queue.claim().await.unwrap().unwrap();
        let outcome = queue
            .fail_attempt(&job.id, &PipelineError::persistence("down"))
            .await
            .unwrap();
        assert!(outcome.is_retrying());
        assert!(queue.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keep_last_retention() {
        let queue = JobQueue::in_memory("q");
        let options = quick().with_attempts(1).with_retention(RetentionPolicy {
            on_complete: Retention::Remove,
            on_fail: Retention::KeepLast(2),
        });

        for i in 0..4 {
            let job = queue
                .enqueue(payload("u"), options.clone().with_id(format!("job-{i}")))
                .await
                .unwrap();
            queue.claim().await.unwrap().unwrap();
            queue.fail_attempt(&job.id, &PipelineError::input("bad")).await.unwrap();
        }

        let kept: Vec<String> = queue
            .list_jobs(&[JobState::Failed])
            .collect()
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.id)
            .collect();
        assert_eq!(kept, vec!["job-3", "job-2"]);
    }

    #[tokio::test]
    async fn test_failed_job_still_blocks_same_id() {
        let queue = JobQueue::in_memory("q");
        let options = quick().with_attempts(1).with_id("cloth-9");
        queue.enqueue(payload("u"), options.clone()).await.unwrap();
        queue.claim().await.unwrap().unwrap();
        queue
            .fail_attempt("cloth-9", &PipelineError::input("bad"))
            .await
            .unwrap();

        let err = queue.enqueue(payload("u"), options).await.unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateJob { .. }));

        queue.remove("cloth-9").await.unwrap();
        assert!(queue
            .enqueue(payload("u"), quick().with_id("cloth-9"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_preserve_output_survives_retry() {
        let queue = JobQueue::in_memory("q");
        let job = queue.enqueue(payload("u"), quick()).await.unwrap();
        queue.claim().await.unwrap().unwrap();

        queue
            .preserve_output(&job.id, StageOutput::done(serde_json::json!({"k": 1})))
            .await
            .unwrap();
        queue
            .fail_attempt(&job.id, &PipelineError::chain_enqueue("cloth2tex", "closed"))
            .await
            .unwrap();

        let retried = queue.claim().await.unwrap().unwrap();
        assert_eq!(
            retried.stage_output,
            Some(StageOutput::done(serde_json::json!({"k": 1})))
        );
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiter() {
        let queue = Arc::new(JobQueue::in_memory("q"));
        let notify = queue.notifier();
        let waiter = tokio::spawn(async move { notify.notified().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(payload("u"), JobOptions::new()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be notified")
            .unwrap();
    }
}
