//! Static declaration of the processing chains.
//!
//! A chain is an ordered list of stages sharing one chain key. Stage `i`
//! hands its output to stage `i + 1` by enqueuing on that stage's queue
//! with the chain key as job id; the last stage writes the persisted record.

use std::collections::HashSet;
use std::time::Duration;

use crate::config::{PipelineConfig, StageConfig};
use crate::core::JobOptions;
use crate::errors::{PipelineError, Result};

/// Name of the landmark prediction stage.
pub const PREDICT: &str = "predict";
/// Name of the texture generation stage.
pub const CLOTH2TEX: &str = "cloth2tex";
/// Name of the mannequin generation stage.
pub const MANNEQUIN: &str = "mannequin";

/// Name of the garment chain.
pub const CLOTHES_CHAIN: &str = "clothes";
/// Name of the mannequin chain.
pub const MANNEQUIN_CHAIN: &str = "mannequin";

/// Queue of the predict stage.
pub const PREDICT_QUEUE: &str = "clothProcessingQueue";
/// Queue of the cloth2tex stage.
pub const CLOTH2TEX_QUEUE: &str = "cloth2texQueue";
/// Queue of the mannequin stage.
pub const MANNEQUIN_QUEUE: &str = "mannequinGenerationQueue";

/// Response fields of the landmark service.
pub const PREDICT_RESPONSE_FIELDS: &[&str] = &[
    "front_image_path",
    "back_image_path",
    "front_json_path",
    "back_json_path",
];
/// Response fields of the texture service.
pub const CLOTH2TEX_RESPONSE_FIELDS: &[&str] = &["textureUrl"];
/// Response fields of the mannequin service.
pub const MANNEQUIN_RESPONSE_FIELDS: &[&str] = &["modelUrl"];

/// One stage of a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDefinition {
    /// Stage name.
    pub name: String,
    /// Queue the stage consumes.
    pub queue: String,
    /// Inference endpoint called by the handler.
    pub endpoint: String,
    /// Fields the inference response must carry.
    pub required_fields: Vec<String>,
    /// Number of worker slots.
    pub concurrency: usize,
    /// Options of jobs enqueued on this stage.
    pub options: JobOptions,
    /// Deadline of one attempt.
    pub timeout: Duration,
}

impl StageDefinition {
    /// Creates a stage with one slot and default options.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        queue: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            endpoint: endpoint.into(),
            required_fields: Vec::new(),
            concurrency: 1,
            options: JobOptions::default(),
            timeout: Duration::from_secs(120),
        }
    }

    fn from_config(
        name: &str,
        queue: &str,
        default_endpoint: String,
        required: &[&str],
        stage: &StageConfig,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            queue: queue.to_string(),
            endpoint: stage.endpoint.clone().unwrap_or(default_endpoint),
            required_fields: required.iter().map(|f| (*f).to_string()).collect(),
            concurrency: stage.concurrency,
            options: JobOptions::new()
                .with_attempts(stage.attempts)
                .with_backoff(stage.backoff)
                .with_retention(config.retention),
            timeout: stage.timeout(),
        }
    }

    /// Sets the response fields the stage requires.
    #[must_use]
    pub fn with_required_fields(mut self, fields: &[&str]) -> Self {
        self.required_fields = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    /// Sets the number of worker slots.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the job options.
    #[must_use]
    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the attempt deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Required fields as string slices.
    #[must_use]
    pub fn required(&self) -> Vec<&str> {
        self.required_fields.iter().map(String::as_str).collect()
    }
}

/// An ordered list of stages sharing one chain key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainDefinition {
    /// Chain name.
    pub name: String,
    /// Stages in execution order.
    pub stages: Vec<StageDefinition>,
}

impl ChainDefinition {
    /// Creates and validates a chain.
    pub fn new(name: impl Into<String>, stages: Vec<StageDefinition>) -> Result<Self> {
        let chain = Self {
            name: name.into(),
            stages,
        };
        chain.validate()?;
        Ok(chain)
    }

    /// The garment chain: `predict -> cloth2tex`.
    pub fn clothes(config: &PipelineConfig) -> Result<Self> {
        Self::new(
            CLOTHES_CHAIN,
            vec![
                StageDefinition::from_config(
                    PREDICT,
                    PREDICT_QUEUE,
                    config.service_url(8000, "/api/predict"),
                    PREDICT_RESPONSE_FIELDS,
                    &config.predict,
                    config,
                ),
                StageDefinition::from_config(
                    CLOTH2TEX,
                    CLOTH2TEX_QUEUE,
                    config.service_url(8001, "/api/cloth2tex"),
                    CLOTH2TEX_RESPONSE_FIELDS,
                    &config.cloth2tex,
                    config,
                ),
            ],
        )
    }

    /// The single-stage mannequin chain.
    pub fn mannequin(config: &PipelineConfig) -> Result<Self> {
        Self::new(
            MANNEQUIN_CHAIN,
            vec![StageDefinition::from_config(
                MANNEQUIN,
                MANNEQUIN_QUEUE,
                config.service_url(8002, "/mannequin"),
                MANNEQUIN_RESPONSE_FIELDS,
                &config.mannequin,
                config,
            )],
        )
    }

    /// Checks that the chain is non-empty, names are unique and every stage
    /// can run at least once.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "chain '{}' has no stages",
                self.name
            )));
        }

        let mut names = HashSet::new();
        let mut queues = HashSet::new();
        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "chain '{}' declares stage '{}' twice",
                    self.name, stage.name
                )));
            }
            if !queues.insert(stage.queue.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "chain '{}' uses queue '{}' for more than one stage",
                    self.name, stage.queue
                )));
            }
            if stage.concurrency == 0 {
                return Err(PipelineError::Configuration(format!(
                    "stage '{}' needs a concurrency of at least 1",
                    stage.name
                )));
            }
            if stage.options.attempts == 0 {
                return Err(PipelineError::Configuration(format!(
                    "stage '{}' needs at least 1 attempt",
                    stage.name
                )));
            }
        }
        Ok(())
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Position of a stage in the chain.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// The stage that follows `name`, if any.
    #[must_use]
    pub fn next_after(&self, name: &str) -> Option<&StageDefinition> {
        self.position(name).and_then(|i| self.stages.get(i + 1))
    }

    /// The entry stage.
    #[must_use]
    pub fn first(&self) -> Option<&StageDefinition> {
        self.stages.first()
    }

    /// The stage that writes the persisted record.
    #[must_use]
    pub fn terminal(&self) -> Option<&StageDefinition> {
        self.stages.last()
    }

    /// Returns true if `name` is the last stage.
    #[must_use]
    pub fn is_terminal(&self, name: &str) -> bool {
        self.terminal().is_some_and(|s| s.name == name)
    }
}
