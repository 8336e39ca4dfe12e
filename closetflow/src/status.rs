//! Unified status of a chain key across its queues.
//!
//! Successful jobs are pruned from their queues, so a key that no queue
//! knows about anymore is looked up in the record store before it is
//! reported as `not_found`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::core::{Job, JobState, ReportStatus};
use crate::errors::{PipelineError, Result};
use crate::pipeline::{ChainDefinition, StageDefinition, CLOTH2TEX, MANNEQUIN};
use crate::queue::JobQueue;
use crate::records::RecordStore;
use crate::stages::StagePayload;

/// What a polling caller sees for a chain key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Stage the report is about; `<stage>_completed` when a non-terminal
    /// stage finished and its successor is not visible.
    pub stage: String,
    /// Reported status.
    pub status: ReportStatus,
    /// Progress of the reported job, 0 to 100.
    pub progress: u8,
    /// Return value of a completed job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure message of a failed job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Id of the successor job, set when the report comes from a chained stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_job_id: Option<String>,
}

impl StatusReport {
    /// Report for an unknown key.
    #[must_use]
    pub fn not_found() -> Self {
        Self {
            stage: String::new(),
            status: ReportStatus::NotFound,
            progress: 0,
            result: None,
            error: None,
            next_job_id: None,
        }
    }

    fn from_job(stage: &str, job: &Job) -> Self {
        let mut report = Self {
            stage: stage.to_string(),
            status: job.state.into(),
            progress: job.progress,
            result: None,
            error: None,
            next_job_id: None,
        };
        match job.state {
            JobState::Completed => report.result = job.result.clone(),
            JobState::Failed => report.error = job.failed_reason.clone(),
            JobState::Waiting | JobState::Active => {}
        }
        report
    }

    /// Returns true once polling can stop.
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(
            self.status,
            ReportStatus::Completed | ReportStatus::Failed | ReportStatus::NotFound
        ) && !self.stage.ends_with("_completed")
    }
}

/// Status of a user's mannequin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MannequinStatus {
    /// Reported status.
    pub status: ReportStatus,
    /// Model URL of the persisted mannequin, once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_url: Option<String>,
    /// Failure message of a failed job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Id of the job the status was read from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// Reads job state from the queues of a chain, falling back to persisted
/// records.
pub struct StatusAggregator {
    queues: HashMap<String, Arc<JobQueue>>,
    records: Arc<dyn RecordStore>,
}

impl StatusAggregator {
    /// Creates an aggregator over `queues`.
    pub fn new(
        queues: impl IntoIterator<Item = Arc<JobQueue>>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            queues: queues
                .into_iter()
                .map(|queue| (queue.name().to_string(), queue))
                .collect(),
            records,
        }
    }

    fn queue(&self, stage: &StageDefinition) -> Result<&Arc<JobQueue>> {
        self.queues.get(&stage.queue).ok_or_else(|| {
            PipelineError::Configuration(format!(
                "no queue '{}' registered for stage '{}'",
                stage.queue, stage.name
            ))
        })
    }

    /// Reports the status of `key` in `chain`.
    ///
    /// Stages are read in chain order. A waiting, active or failed job
    /// ends the lookup; a completed job hands over to its successor when the
    /// successor's job exists.
    pub async fn status(&self, chain: &ChainDefinition, key: &str) -> Result<StatusReport> {
        let mut chained = false;

        for (index, stage) in chain.stages.iter().enumerate() {
            let Some(job) = self.queue(stage)?.get_job(key).await? else {
                chained = false;
                continue;
            };

            let mut report = StatusReport::from_job(&stage.name, &job);
            if chained {
                report.next_job_id = Some(job.id.clone());
            }

            if job.state != JobState::Completed {
                return Ok(report);
            }

            let Some(next) = chain.stages.get(index + 1) else {
                return Ok(report);
            };
            if self.queue(next)?.get_job(key).await?.is_some() {
                chained = true;
                continue;
            }

            if let Some(persisted) = self.fallback(chain, key).await? {
                return Ok(persisted);
            }
            report.stage = format!("{}_completed", stage.name);
            report.next_job_id = Some(job.id);
            return Ok(report);
        }

        debug!(chain = %chain.name, key, "No job holds the key, checking records");
        Ok(self
            .fallback(chain, key)
            .await?
            .unwrap_or_else(StatusReport::not_found))
    }

    async fn fallback(&self, chain: &ChainDefinition, key: &str) -> Result<Option<StatusReport>> {
        let Some(terminal) = chain.terminal() else {
            return Ok(None);
        };
        let result = match terminal.name.as_str() {
            CLOTH2TEX => match self.records.find_garment(key).await? {
                Some(garment) if garment.has_model() => json!({
                    "status": "success",
                    "textureUrl": garment.model_url,
                    "cloth": serde_json::to_value(&garment)?,
                }),
                _ => return Ok(None),
            },
            MANNEQUIN => match self.records.find_mannequin_by_key(key).await? {
                Some(mannequin) => json!({
                    "status": "success",
                    "modelUrl": mannequin.model_url,
                    "mannequin": serde_json::to_value(&mannequin)?,
                }),
                None => return Ok(None),
            },
            _ => return Ok(None),
        };

        Ok(Some(StatusReport {
            stage: terminal.name.clone(),
            status: ReportStatus::Completed,
            progress: 100,
            result: Some(result),
            error: None,
            next_job_id: None,
        }))
    }

    /// Reports the status of the most recent mannequin job of `user_id` on
    /// `queue`.
    pub async fn mannequin_status(&self, queue: &JobQueue, user_id: &str) -> Result<MannequinStatus> {
        let mut scan = queue.list_jobs(&JobState::ALL);
        while let Some(job) = scan.next().await? {
            let StagePayload::Mannequin(payload) = &job.payload else {
                continue;
            };
            if payload.user_id != user_id {
                continue;
            }

            let mut status = MannequinStatus {
                status: job.state.into(),
                model_url: None,
                error: None,
                job_id: Some(job.id.clone()),
            };
            match job.state {
                JobState::Completed => {
                    status.model_url = self
                        .records
                        .find_mannequin(user_id)
                        .await?
                        .map(|record| record.model_url);
                }
                JobState::Failed => status.error = job.failed_reason.clone(),
                JobState::Waiting | JobState::Active => {}
            }
            return Ok(status);
        }

        let persisted = self.records.find_mannequin(user_id).await?;
        Ok(MannequinStatus {
            status: if persisted.is_some() {
                ReportStatus::Completed
            } else {
                ReportStatus::NotFound
            },
            model_url: persisted.map(|record| record.model_url),
            error: None,
            job_id: None,
        })
    }
}

impl std::fmt::Debug for StatusAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusAggregator")
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
