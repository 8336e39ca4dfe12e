//! The assembled pipeline: queues, workers and admission.
//!
//! [`PipelineRuntime`] owns everything a process needs: one queue per stage,
//! one [`StageWorker`] per stage wired to its successor, the record store
//! and the status aggregator. It replaces any process-wide registry; tests
//! build as many runtimes as they like.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::blob::BlobResolver;
use crate::config::PipelineConfig;
use crate::core::{ChainKey, ReportStatus};
use crate::errors::{PipelineError, Result};
use crate::events::{EventSink, NoOpEventSink};
use crate::inference::InferenceClient;
use crate::pipeline::{
    ChainDefinition, StageDefinition, CLOTH2TEX, MANNEQUIN, MANNEQUIN_QUEUE, PREDICT,
};
use crate::queue::{FileStoreFactory, JobQueue, MemoryStoreFactory, QueueStoreFactory};
use crate::records::{MemoryRecordStore, RecordStore};
use crate::shutdown::{ShutdownController, ShutdownReport};
use crate::stages::{
    Category, Cloth2TexHandler, MannequinHandler, MannequinPayload, PredictHandler,
    PredictPayload, StageHandler, SubCategory,
};
use crate::status::{MannequinStatus, StatusAggregator, StatusReport};
use crate::worker::{NextStage, StageWorker};

/// A garment upload to run through the garment chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GarmentSubmission {
    /// Garment id; becomes the chain key.
    pub cloth_id: String,
    /// Owner.
    pub user_id: String,
    /// Display name; `<category>_<YYYY-MM-DD>` when blank.
    #[serde(default)]
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Web category.
    pub category: Category,
    /// Web sub-category.
    #[serde(rename = "subCategory")]
    pub sub_category: SubCategory,
    /// Uploaded front photo.
    pub front_image: PathBuf,
    /// Uploaded back photo.
    pub back_image: PathBuf,
}

/// A body photo to turn into a mannequin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MannequinSubmission {
    /// Owner.
    pub user_id: String,
    /// Uploaded body photo.
    pub image: PathBuf,
}

/// Acknowledgement of an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    /// Key to poll status with.
    pub chain_key: String,
    /// Id of the first-stage job.
    pub job_id: String,
    /// First stage of the chain.
    pub stage: String,
    /// Acceptance time.
    pub accepted_at: DateTime<Utc>,
}

/// Builder for [`PipelineRuntime`].
pub struct PipelineRuntimeBuilder {
    config: PipelineConfig,
    client: Option<Arc<dyn InferenceClient>>,
    records: Option<Arc<dyn RecordStore>>,
    events: Option<Arc<dyn EventSink>>,
    stores: Option<Arc<dyn QueueStoreFactory>>,
}

impl PipelineRuntimeBuilder {
    /// Sets the inference transport.
    #[must_use]
    pub fn inference_client(mut self, client: Arc<dyn InferenceClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Sets the record store. Defaults to an in-memory store.
    #[must_use]
    pub fn record_store(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    /// Sets the event sink shared by queues and workers.
    #[must_use]
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Sets how queue stores are opened. Defaults to files under
    /// `queue_dir` when configured, memory otherwise.
    #[must_use]
    pub fn queue_store_factory(mut self, stores: Arc<dyn QueueStoreFactory>) -> Self {
        self.stores = Some(stores);
        self
    }

    fn default_client() -> Result<Arc<dyn InferenceClient>> {
        #[cfg(feature = "http")]
        {
            Ok(Arc::new(crate::inference::HttpInferenceClient::new()?))
        }
        #[cfg(not(feature = "http"))]
        {
            Err(PipelineError::Configuration(
                "no inference client configured and the http feature is disabled".into(),
            ))
        }
    }

    /// Opens the queues and wires the workers. Nothing runs until
    /// [`PipelineRuntime::start`].
    pub async fn build(self) -> Result<PipelineRuntime> {
        self.config.validate()?;

        let client = match self.client {
            Some(client) => client,
            None => Self::default_client()?,
        };
        let records = self
            .records
            .unwrap_or_else(|| Arc::new(MemoryRecordStore::new()));
        let events = self.events.unwrap_or_else(|| Arc::new(NoOpEventSink));
        let stores: Arc<dyn QueueStoreFactory> = match (self.stores, &self.config.queue_dir) {
            (Some(stores), _) => stores,
            (None, Some(dir)) => Arc::new(FileStoreFactory::new(dir)),
            (None, None) => Arc::new(MemoryStoreFactory),
        };
        let blobs = BlobResolver::new(&self.config.data_dir);

        let clothes = ChainDefinition::clothes(&self.config)?;
        let mannequin = ChainDefinition::mannequin(&self.config)?;

        let mut queues = HashMap::new();
        for stage in clothes.stages.iter().chain(&mannequin.stages) {
            let store = stores.open(&stage.queue).await?;
            let queue = JobQueue::new(stage.queue.clone(), store).with_event_sink(events.clone());
            queues.insert(stage.queue.clone(), Arc::new(queue));
        }

        let mut workers = Vec::new();
        for chain in [&clothes, &mannequin] {
            for (index, stage) in chain.stages.iter().enumerate() {
                let handler = build_handler(stage, &client, &records, &blobs)?;
                let mut worker = StageWorker::new(stage.clone(), queue_of(&queues, stage)?, handler)
                    .with_poll_interval(self.config.poll_interval())
                    .with_event_sink(events.clone());
                if let Some(next) = chain.stages.get(index + 1) {
                    worker = worker.with_next(NextStage::new(next.clone(), queue_of(&queues, next)?));
                }
                workers.push(worker);
            }
        }

        let status = StatusAggregator::new(queues.values().cloned(), records.clone());
        info!(
            queues = queues.len(),
            workers = workers.len(),
            data_dir = %self.config.data_dir.display(),
            "Pipeline runtime built"
        );

        Ok(PipelineRuntime {
            config: self.config,
            clothes,
            mannequin,
            queues,
            workers,
            records,
            blobs,
            status,
        })
    }
}

/// The trimmed name, or `<category>_<YYYY-MM-DD>` when it is blank.
fn display_name(name: &str, category: Category, now: DateTime<Utc>) -> String {
    let name = name.trim();
    if name.is_empty() {
        format!("{}_{}", category.as_str(), now.format("%Y-%m-%d"))
    } else {
        name.to_string()
    }
}

fn queue_of(queues: &HashMap<String, Arc<JobQueue>>, stage: &StageDefinition) -> Result<Arc<JobQueue>> {
    queues.get(&stage.queue).cloned().ok_or_else(|| {
        PipelineError::Configuration(format!("queue '{}' was not opened", stage.queue))
    })
}

fn build_handler(
    stage: &StageDefinition,
    client: &Arc<dyn InferenceClient>,
    records: &Arc<dyn RecordStore>,
    blobs: &BlobResolver,
) -> Result<Arc<dyn StageHandler>> {
    let handler: Arc<dyn StageHandler> = match stage.name.as_str() {
        PREDICT => Arc::new(PredictHandler::new(stage.clone(), client.clone(), blobs.clone())),
        CLOTH2TEX => Arc::new(Cloth2TexHandler::new(
            stage.clone(),
            client.clone(),
            records.clone(),
        )),
        MANNEQUIN => Arc::new(MannequinHandler::new(
            stage.clone(),
            client.clone(),
            blobs.clone(),
            records.clone(),
        )),
        other => {
            return Err(PipelineError::Configuration(format!(
                "no handler for stage '{other}'"
            )))
        }
    };
    Ok(handler)
}

/// The running pipeline.
pub struct PipelineRuntime {
    config: PipelineConfig,
    clothes: ChainDefinition,
    mannequin: ChainDefinition,
    queues: HashMap<String, Arc<JobQueue>>,
    workers: Vec<StageWorker>,
    records: Arc<dyn RecordStore>,
    blobs: BlobResolver,
    status: StatusAggregator,
}

impl PipelineRuntime {
    /// Starts building a runtime from `config`.
    #[must_use]
    pub fn builder(config: PipelineConfig) -> PipelineRuntimeBuilder {
        PipelineRuntimeBuilder {
            config,
            client: None,
            records: None,
            events: None,
            stores: None,
        }
    }

    /// Spawns every worker's slots.
    pub async fn start(&self) {
        for worker in &self.workers {
            worker.start().await;
        }
        info!(workers = self.workers.len(), "Pipeline started");
    }

    /// Admits a garment: validates the input, checks both photos and
    /// enqueues the predict job under the garment id.
    pub async fn submit_garment(&self, submission: GarmentSubmission) -> Result<Admission> {
        let key = ChainKey::new(submission.cloth_id.as_str())?;
        let first = self.first_stage(&self.clothes)?;

        let front = self.blobs.resolve_image(&submission.front_image).await?;
        let back = self.blobs.resolve_image(&submission.back_image).await?;
        let name = display_name(&submission.name, submission.category, Utc::now());
        let payload = PredictPayload {
            user_id: submission.user_id,
            cloth_id: key.to_string(),
            name,
            description: submission.description,
            category: submission.category,
            sub_category: submission.sub_category,
            file_name_front: front.file_name(),
            file_name_back: back.file_name(),
            front_image: front.path,
            back_image: back.path,
        };

        let job = queue_of(&self.queues, first)?
            .enqueue(payload.into(), first.options.clone().with_id(key.as_str()))
            .await?;
        info!(job_id = %job.id, stage = %first.name, "Garment admitted");
        Ok(Admission {
            chain_key: key.to_string(),
            job_id: job.id,
            stage: first.name.clone(),
            accepted_at: job.created_at,
        })
    }

    /// Admits a body photo under a generated chain key.
    pub async fn submit_mannequin(&self, submission: MannequinSubmission) -> Result<Admission> {
        let key = ChainKey::generate();
        let first = self.first_stage(&self.mannequin)?;

        let image = self.blobs.resolve_image(&submission.image).await?;
        let payload = MannequinPayload {
            user_id: submission.user_id,
            file_name: image.file_name(),
            image: image.path,
        };

        let job = queue_of(&self.queues, first)?
            .enqueue(payload.into(), first.options.clone().with_id(key.as_str()))
            .await?;
        info!(job_id = %job.id, stage = %first.name, "Mannequin admitted");
        Ok(Admission {
            chain_key: key.to_string(),
            job_id: job.id,
            stage: first.name.clone(),
            accepted_at: job.created_at,
        })
    }

    fn first_stage<'a>(&self, chain: &'a ChainDefinition) -> Result<&'a StageDefinition> {
        chain.first().ok_or_else(|| {
            PipelineError::Configuration(format!("chain '{}' has no stages", chain.name))
        })
    }

    /// Status of a chain key of either chain.
    pub async fn status(&self, chain_key: &str) -> Result<StatusReport> {
        for chain in self.chains() {
            let report = self.status.status(chain, chain_key).await?;
            if report.status != ReportStatus::NotFound {
                return Ok(report);
            }
        }
        Ok(StatusReport::not_found())
    }

    /// Status of a user's most recent mannequin.
    pub async fn mannequin_status(&self, user_id: &str) -> Result<MannequinStatus> {
        let queue = self.queues.get(MANNEQUIN_QUEUE).ok_or_else(|| {
            PipelineError::Configuration(format!("queue '{MANNEQUIN_QUEUE}' was not opened"))
        })?;
        self.status.mannequin_status(queue, user_id).await
    }

    /// A queue by name.
    #[must_use]
    pub fn queue(&self, name: &str) -> Option<&Arc<JobQueue>> {
        self.queues.get(name)
    }

    /// Every queue.
    pub fn queues(&self) -> impl Iterator<Item = &Arc<JobQueue>> {
        self.queues.values()
    }

    /// The garment and mannequin chains.
    #[must_use]
    pub fn chains(&self) -> [&ChainDefinition; 2] {
        [&self.clothes, &self.mannequin]
    }

    /// Every stage worker.
    #[must_use]
    pub fn workers(&self) -> &[StageWorker] {
        &self.workers
    }

    /// The record store.
    #[must_use]
    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    /// The configuration the runtime was built from.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Stops the pipeline, giving in-flight handlers up to `grace`.
    pub async fn shutdown(&self, grace: Duration) -> Result<ShutdownReport> {
        ShutdownController::new(grace).shutdown(self).await
    }
}

impl std::fmt::Debug for PipelineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRuntime")
            .field("clothes", &self.clothes.name)
            .field("mannequin", &self.mannequin.name)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JobState;
    use crate::pipeline::PREDICT_QUEUE;
    use crate::testing::{fast_config, write_photo, ScriptedInferenceClient};

    async fn runtime(root: &std::path::Path) -> PipelineRuntime {
        PipelineRuntime::builder(fast_config(root))
            .inference_client(Arc::new(ScriptedInferenceClient::new()))
            .build()
            .await
            .unwrap()
    }

    fn garment(root: &std::path::Path, cloth_id: &str) -> GarmentSubmission {
        let dir = root.join("uploads");
        GarmentSubmission {
            cloth_id: cloth_id.to_string(),
            user_id: "user-1".into(),
            name: "tee".into(),
            description: String::new(),
            category: Category::Bottom,
            sub_category: SubCategory::Pants,
            front_image: write_photo(&dir, "1700-front.jpg").unwrap(),
            back_image: write_photo(&dir, "1700-back.jpg").unwrap(),
        }
    }

    #[tokio::test]
    async fn test_build_wires_three_queues_and_workers() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path()).await;

        assert_eq!(runtime.queues().count(), 3);
        assert_eq!(runtime.workers().len(), 3);
        assert_eq!(runtime.chains()[0].name, "clothes");
        assert!(runtime.queue(PREDICT_QUEUE).is_some());
    }

    #[tokio::test]
    async fn test_submit_garment_enqueues_predict_under_key() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path()).await;

        let admission = runtime.submit_garment(garment(dir.path(), "cloth-42")).await.unwrap();
        assert_eq!(admission.chain_key, "cloth-42");
        assert_eq!(admission.job_id, "cloth-42");
        assert_eq!(admission.stage, "predict");

        let job = runtime
            .queue(PREDICT_QUEUE)
            .unwrap()
            .get_job("cloth-42")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.state, JobState::Waiting);
        let crate::stages::StagePayload::Predict(payload) = job.payload else {
            panic!("expected a predict payload");
        };
        assert_eq!(payload.file_name_front, "1700-front.jpg");
        assert_eq!(payload.category.inference_name(), "trousers");
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path()).await;

        runtime.submit_garment(garment(dir.path(), "dup")).await.unwrap();
        let err = runtime.submit_garment(garment(dir.path(), "dup")).await.unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateJob { .. }));
    }

    #[tokio::test]
    async fn test_invalid_key_is_rejected_before_enqueue() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path()).await;

        let err = runtime
            .submit_garment(garment(dir.path(), "bad key/../x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InputValidation { .. }));
        let counts = runtime.queue(PREDICT_QUEUE).unwrap().counts().await.unwrap();
        assert_eq!(counts.total(), 0);
    }

    #[tokio::test]
    async fn test_submit_mannequin_generates_key() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path()).await;
        let image = write_photo(&dir.path().join("m"), "body.jpg").unwrap();

        let a = runtime
            .submit_mannequin(MannequinSubmission {
                user_id: "u".into(),
                image: image.clone(),
            })
            .await
            .unwrap();
        let b = runtime
            .submit_mannequin(MannequinSubmission {
                user_id: "u".into(),
                image,
            })
            .await
            .unwrap();
        assert_ne!(a.chain_key, b.chain_key);
        assert_eq!(a.stage, "mannequin");

        let status = runtime.mannequin_status("u").await.unwrap();
        assert_eq!(status.job_id.as_deref(), Some(b.job_id.as_str()));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_build() {
        let config = fast_config("/tmp").with_ai_base("ftp://nope");
        let err = PipelineRuntime::builder(config)
            .inference_client(Arc::new(ScriptedInferenceClient::new()))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_blank_name_defaults_to_category_and_date() {
        let now = DateTime::parse_from_rfc3339("2024-03-05T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(display_name("  ", Category::Top, now), "top_2024-03-05");
        assert_eq!(display_name(" Linen ", Category::Top, now), "Linen");
    }

    #[tokio::test]
    async fn test_submission_without_name_gets_default() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path()).await;
        let mut submission = garment(dir.path(), "unnamed");
        submission.name = String::new();

        runtime.submit_garment(submission).await.unwrap();
        let job = runtime
            .queue(PREDICT_QUEUE)
            .unwrap()
            .get_job("unnamed")
            .await
            .unwrap()
            .unwrap();
        let crate::stages::StagePayload::Predict(payload) = job.payload else {
            panic!("expected a predict payload");
        };
        assert!(payload.name.starts_with("bottom_"));
        assert_eq!(payload.name.len(), "bottom_YYYY-MM-DD".len());
    }

    #[tokio::test]
    async fn test_unaccepted_photo_type_is_rejected_before_enqueue() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path()).await;
        let mut submission = garment(dir.path(), "gif");
        submission.back_image = write_photo(&dir.path().join("uploads"), "anim.gif").unwrap();

        let err = runtime.submit_garment(submission).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InputValidation { field: Some(ref f), .. } if f == "extension"
        ));
        let counts = runtime.queue(PREDICT_QUEUE).unwrap().counts().await.unwrap();
        assert_eq!(counts.total(), 0);
    }

    #[tokio::test]
    async fn test_oversized_body_photo_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path()).await;
        let image = write_photo(&dir.path().join("m"), "huge.png").unwrap();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&image)
            .unwrap()
            .set_len(crate::blob::MAX_IMAGE_BYTES + 1)
            .unwrap();

        let err = runtime
            .submit_mannequin(MannequinSubmission {
                user_id: "u".into(),
                image,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InputValidation { field: Some(ref f), .. } if f == "size"
        ));
        let counts = runtime.queue(MANNEQUIN_QUEUE).unwrap().counts().await.unwrap();
        assert_eq!(counts.total(), 0);
    }

    #[tokio::test]
    async fn test_status_finds_mannequin_chain_key() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path()).await;
        let image = write_photo(&dir.path().join("m"), "body.jpg").unwrap();
        let admission = runtime
            .submit_mannequin(MannequinSubmission {
                user_id: "u".into(),
                image,
            })
            .await
            .unwrap();

        let report = runtime.status(&admission.chain_key).await.unwrap();
        assert_eq!(report.stage, "mannequin");
        assert_eq!(report.status, ReportStatus::Waiting);
        assert_eq!(runtime.status("missing").await.unwrap().status, ReportStatus::NotFound);
    }
}
