//! Stage workers.
//!
//! A [`StageWorker`] runs a fixed pool of slot tasks against one queue.
//! Each slot claims a job, runs the stage handler under the stage deadline,
//! submits the handler's next payload to the following stage and records
//! the outcome on the job. Slots never busy-wait: between claims they sleep
//! on the queue notifier, the poll interval or the stop token.

mod context;

pub use context::JobContext;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cancellation::CancellationToken;
use crate::core::{Job, StageOutput};
use crate::errors::{PipelineError, Result};
use crate::events::{self, job_event_data, EventSink, NoOpEventSink};
use crate::observability::SpanTimer;
use crate::pipeline::StageDefinition;
use crate::queue::{FailOutcome, JobQueue};
use crate::stages::{StageHandler, StagePayload};

/// Default interval between claim attempts of an idle slot.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The stage a worker hands its output to.
#[derive(Debug, Clone)]
pub struct NextStage {
    /// Definition of the following stage.
    pub stage: StageDefinition,
    /// Queue of the following stage.
    pub queue: Arc<JobQueue>,
}

impl NextStage {
    /// Creates a next-stage link.
    #[must_use]
    pub fn new(stage: StageDefinition, queue: Arc<JobQueue>) -> Self {
        Self { stage, queue }
    }
}

enum Attempt {
    Finished(Result<StageOutput>),
    Aborted,
}

struct Shared {
    stage: StageDefinition,
    queue: Arc<JobQueue>,
    handler: Arc<dyn StageHandler>,
    next: Option<NextStage>,
    events: Arc<dyn EventSink>,
    poll_interval: Duration,
    stop: CancellationToken,
    in_flight: Mutex<HashMap<String, Arc<CancellationToken>>>,
}

/// A pool of `concurrency` slots consuming one stage queue.
pub struct StageWorker {
    shared: Arc<Shared>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    started: Mutex<bool>,
}

impl StageWorker {
    /// Creates a worker for `stage`, consuming `queue` with `handler`.
    #[must_use]
    pub fn new(
        stage: StageDefinition,
        queue: Arc<JobQueue>,
        handler: Arc<dyn StageHandler>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                stage,
                queue,
                handler,
                next: None,
                events: Arc::new(NoOpEventSink),
                poll_interval: DEFAULT_POLL_INTERVAL,
                stop: CancellationToken::new(),
                in_flight: Mutex::new(HashMap::new()),
            }),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
            started: Mutex::new(false),
        }
    }

    fn shared_mut(&mut self) -> Option<&mut Shared> {
        Arc::get_mut(&mut self.shared)
    }

    /// Sets the stage that receives this stage's output.
    ///
    /// Builder methods only take effect before [`start`](Self::start).
    #[must_use]
    pub fn with_next(mut self, next: NextStage) -> Self {
        if let Some(shared) = self.shared_mut() {
            shared.next = Some(next);
        }
        self
    }

    /// Sets the event sink used for chain events.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        if let Some(shared) = self.shared_mut() {
            shared.events = events;
        }
        self
    }

    /// Sets the idle poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        if let Some(shared) = self.shared_mut() {
            shared.poll_interval = poll_interval;
        }
        self
    }

    /// Name of the stage.
    #[must_use]
    pub fn stage(&self) -> &StageDefinition {
        &self.shared.stage
    }

    /// The consumed queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.shared.queue
    }

    /// Number of handler invocations currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    /// Returns true once [`stop`](Self::stop) was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_cancelled()
    }

    /// Spawns the slot tasks. Calling it again is a no-op.
    pub async fn start(&self) {
        {
            let mut started = self.started.lock();
            if *started {
                return;
            }
            *started = true;
        }

        let concurrency = self.shared.stage.concurrency.max(1);
        info!(
            stage = %self.shared.stage.name,
            queue = %self.shared.queue.name(),
            concurrency,
            "Starting stage worker"
        );

        let mut tasks = self.tasks.lock().await;
        for slot in 0..concurrency {
            let shared = self.shared.clone();
            tasks.spawn(async move { shared.run_slot(slot).await });
        }
    }

    /// Stops claiming new jobs. In-flight handlers keep running.
    pub fn stop(&self) {
        self.shared.stop.cancel("worker stopping");
    }

    /// Cancels every in-flight invocation. Their jobs stay active.
    pub fn abort(&self) {
        let tokens: Vec<(String, Arc<CancellationToken>)> = self
            .shared
            .in_flight
            .lock()
            .iter()
            .map(|(id, token)| (id.clone(), token.clone()))
            .collect();
        for (job_id, token) in tokens {
            warn!(stage = %self.shared.stage.name, job_id = %job_id, "Aborting in-flight job");
            token.cancel("shutdown grace period expired");
        }
    }

    /// Waits up to `timeout` for every slot to exit.
    ///
    /// Returns false if slots are still running; they can be joined again.
    pub async fn join(&self, timeout: Duration) -> bool {
        let mut tasks = self.tasks.lock().await;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(stage = %self.shared.stage.name, error = %e, "Worker slot panicked");
                }
            }
        })
        .await;
        drained.is_ok()
    }
}

impl std::fmt::Debug for StageWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageWorker")
            .field("stage", &self.shared.stage.name)
            .field("queue", &self.shared.queue.name())
            .field("handler", &self.shared.handler)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl Shared {
    async fn run_slot(self: Arc<Self>, slot: usize) {
        let notifier = self.queue.notifier();
        debug!(stage = %self.stage.name, slot, "Worker slot started");

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            match self.queue.claim().await {
                Ok(Some(job)) => {
                    self.process(job).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(stage = %self.stage.name, slot, error = %e, "Failed to claim job");
                }
            }

            tokio::select! {
                biased;
                () = self.stop.cancelled() => break,
                () = notifier.notified() => {}
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        debug!(stage = %self.stage.name, slot, "Worker slot stopped");
    }

    async fn process(&self, job: Job) {
        let cancel = Arc::new(CancellationToken::new());
        self.in_flight.lock().insert(job.id.clone(), cancel.clone());

        let attempt = self.attempt(&job, &cancel).await;
        match attempt {
            Attempt::Finished(Ok(output)) => self.succeed(&job, output).await,
            Attempt::Finished(Err(e)) => self.fail(&job, &e).await,
            Attempt::Aborted => {
                warn!(
                    stage = %self.stage.name,
                    job_id = %job.id,
                    attempt = job.attempts_made + 1,
                    "Invocation aborted, job left active"
                );
            }
        }

        self.in_flight.lock().remove(&job.id);
    }

    async fn attempt(&self, job: &Job, cancel: &Arc<CancellationToken>) -> Attempt {
        if let Some(output) = &job.stage_output {
            debug!(
                stage = %self.stage.name,
                job_id = %job.id,
                "Reusing preserved handler output"
            );
            return Attempt::Finished(Ok(output.clone()));
        }

        let deadline = job.options.timeout().unwrap_or(self.stage.timeout);
        let ctx = JobContext::new(
            job.clone(),
            self.queue.clone(),
            cancel.clone(),
            deadline,
        );
        let timer = SpanTimer::start(self.stage.name.clone());
        info!(
            stage = %self.stage.name,
            job_id = %job.id,
            attempt = ctx.attempt(),
            "Processing job"
        );

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Attempt::Aborted,
            result = tokio::time::timeout(deadline, self.handler.handle(&ctx)) => match result {
                Ok(result) => Attempt::Finished(result),
                Err(_) => Attempt::Finished(Err(PipelineError::external(
                    &self.stage.endpoint,
                    None,
                    format!("{} timed out after {}s", self.stage.name, deadline.as_secs_f64()),
                ))),
            },
        };

        debug!(
            stage = %self.stage.name,
            job_id = %job.id,
            duration_ms = timer.finish(),
            "Handler returned"
        );
        outcome
    }

    async fn succeed(&self, job: &Job, output: StageOutput) {
        if let Some(next) = output.next.clone() {
            if let Err(e) = self.chain(job, next).await {
                error!(
                    stage = %self.stage.name,
                    job_id = %job.id,
                    result = %output.result,
                    error = %e,
                    "Failed to chain next stage, keeping handler output"
                );
                if let Err(preserve_err) = self.queue.preserve_output(&job.id, output).await {
                    error!(job_id = %job.id, error = %preserve_err, "Failed to preserve output");
                }
                self.fail(job, &e).await;
                return;
            }
        }

        if let Err(e) = self.queue.complete(&job.id, output.result).await {
            error!(stage = %self.stage.name, job_id = %job.id, error = %e, "Failed to complete job");
        }
    }

    async fn chain(&self, job: &Job, payload: StagePayload) -> Result<()> {
        let Some(next) = &self.next else {
            return Err(PipelineError::Configuration(format!(
                "stage '{}' produced a {} payload but has no next stage",
                self.stage.name,
                payload.stage_name()
            )));
        };
        if payload.stage_name() != next.stage.name {
            return Err(PipelineError::Configuration(format!(
                "stage '{}' produced a {} payload, next stage is '{}'",
                self.stage.name,
                payload.stage_name(),
                next.stage.name
            )));
        }

        let options = next.stage.options.clone().with_id(job.id.clone());
        match next.queue.enqueue(payload, options).await {
            Ok(chained) => {
                info!(
                    stage = %self.stage.name,
                    job_id = %job.id,
                    next_stage = %next.stage.name,
                    next_queue = %next.queue.name(),
                    "Chained next stage"
                );
                let mut data = job_event_data(&chained);
                data["from_stage"] = serde_json::json!(self.stage.name);
                self.events.try_emit(events::CHAIN_ENQUEUED, Some(data));
                Ok(())
            }
            Err(PipelineError::DuplicateJob { .. }) => {
                debug!(
                    job_id = %job.id,
                    next_stage = %next.stage.name,
                    "Next stage already enqueued"
                );
                Ok(())
            }
            Err(e) => Err(PipelineError::chain_enqueue(&next.stage.name, e.to_string())),
        }
    }

    async fn fail(&self, job: &Job, error: &PipelineError) {
        match self.queue.fail_attempt(&job.id, error).await {
            Ok(FailOutcome::Retrying { delay, attempts_made }) => {
                debug!(
                    stage = %self.stage.name,
                    job_id = %job.id,
                    attempts_made,
                    delay = ?delay,
                    "Retry scheduled"
                );
            }
            Ok(FailOutcome::Failed { attempts_made }) => {
                debug!(
                    stage = %self.stage.name,
                    job_id = %job.id,
                    attempts_made,
                    "Job failed permanently"
                );
            }
            Err(e) => {
                error!(stage = %self.stage.name, job_id = %job.id, error = %e, "Failed to record failure");
            }
        }
    }
}
