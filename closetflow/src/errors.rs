//! Error types for the closetflow job pipeline.
//!
//! Every failure a stage can hit ends up as a [`PipelineError`]. The worker
//! records the error message on the job and consults
//! [`PipelineError::is_retryable`] to decide between a backoff retry and a
//! permanent failure.

use std::collections::HashMap;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// The main error type for closetflow operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A payload or submission was rejected before a job was created.
    #[error("Invalid input: {message}")]
    InputValidation {
        /// What was wrong with the input.
        message: String,
        /// The offending field, when known.
        field: Option<String>,
    },

    /// A referenced input file is missing or unreadable.
    #[error("Blob not found: {path}")]
    BlobNotFound {
        /// The path that failed to resolve.
        path: String,
    },

    /// The inference service failed or could not be reached.
    #[error("External service error at {endpoint}: {message}")]
    ExternalService {
        /// Endpoint URL of the failing call.
        endpoint: String,
        /// HTTP status, if the service answered.
        status: Option<u16>,
        /// Transport or response detail.
        message: String,
    },

    /// A successful response is missing fields the stage requires.
    #[error("[{stage}] response is missing required fields: {}", missing.join(", "))]
    ResponseValidation {
        /// Stage that validated the response.
        stage: String,
        /// Fields that were absent, null or empty.
        missing: Vec<String>,
    },

    /// The next stage's job could not be submitted.
    #[error("Failed to enqueue next stage '{next_stage}': {message}")]
    ChainEnqueue {
        /// The stage that was to be enqueued.
        next_stage: String,
        /// Underlying failure.
        message: String,
    },

    /// The terminal upsert against the record store failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A job with the same id already exists in the queue.
    #[error("Job '{id}' already exists in queue '{queue}'")]
    DuplicateJob {
        /// Queue name.
        queue: String,
        /// The duplicated job id.
        id: String,
    },

    /// The queue no longer admits jobs.
    #[error("Queue '{0}' is closed")]
    QueueClosed(String),

    /// A job id was not present in the queue.
    #[error("Job '{id}' not found in queue '{queue}'")]
    JobNotFound {
        /// Queue name.
        queue: String,
        /// Missing job id.
        id: String,
    },

    /// A state transition was requested from the wrong state.
    #[error("Job '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        /// Job id.
        id: String,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// The invocation was cancelled before the handler finished.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Creates an input validation error.
    #[must_use]
    pub fn input(message: impl Into<String>) -> Self {
        Self::InputValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Creates an input validation error for a specific field.
    #[must_use]
    pub fn missing_field(field: impl Into<String>) -> Self {
        let field = field.into();
        Self::InputValidation {
            message: format!("required field '{field}' is missing or empty"),
            field: Some(field),
        }
    }

    /// Creates a blob not found error.
    #[must_use]
    pub fn blob_not_found(path: impl AsRef<std::path::Path>) -> Self {
        Self::BlobNotFound {
            path: path.as_ref().display().to_string(),
        }
    }

    /// Creates an external service error.
    #[must_use]
    pub fn external(
        endpoint: impl Into<String>,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Self::ExternalService {
            endpoint: endpoint.into(),
            status,
            message: message.into(),
        }
    }

    /// Creates a response validation error.
    #[must_use]
    pub fn response_missing(stage: impl Into<String>, missing: Vec<String>) -> Self {
        Self::ResponseValidation {
            stage: stage.into(),
            missing,
        }
    }

    /// Creates a chain enqueue error.
    #[must_use]
    pub fn chain_enqueue(next_stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ChainEnqueue {
            next_stage: next_stage.into(),
            message: message.into(),
        }
    }

    /// Creates a persistence error.
    #[must_use]
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    /// Creates a duplicate job error.
    #[must_use]
    pub fn duplicate(queue: impl Into<String>, id: impl Into<String>) -> Self {
        Self::DuplicateJob {
            queue: queue.into(),
            id: id.into(),
        }
    }

    /// Creates a job not found error.
    #[must_use]
    pub fn job_not_found(queue: impl Into<String>, id: impl Into<String>) -> Self {
        Self::JobNotFound {
            queue: queue.into(),
            id: id.into(),
        }
    }

    /// Creates an invalid transition error.
    #[must_use]
    pub fn invalid_transition(
        id: impl Into<String>,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            id: id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Returns true if another attempt could plausibly succeed.
    ///
    /// Missing files, rejected input and cancellations do not heal on
    /// their own, so they fail the job without consuming more attempts.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ExternalService { .. }
                | Self::ResponseValidation { .. }
                | Self::ChainEnqueue { .. }
                | Self::Persistence(_)
                | Self::Io(_)
        )
    }

    /// Returns a stable, machine-readable name for the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InputValidation { .. } => "InputValidationError",
            Self::BlobNotFound { .. } => "BlobNotFoundError",
            Self::ExternalService { .. } => "ExternalServiceError",
            Self::ResponseValidation { .. } => "ResponseValidationError",
            Self::ChainEnqueue { .. } => "ChainEnqueueError",
            Self::Persistence(_) => "PersistenceError",
            Self::DuplicateJob { .. } => "DuplicateJobError",
            Self::QueueClosed(_) => "QueueClosedError",
            Self::JobNotFound { .. } => "JobNotFoundError",
            Self::InvalidTransition { .. } => "InvalidTransitionError",
            Self::Cancelled(_) => "CancelledError",
            Self::Configuration(_) => "ConfigurationError",
            Self::Serialization(_) => "SerializationError",
            Self::Io(_) => "IoError",
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map.insert("retryable".to_string(), serde_json::json!(self.is_retryable()));

        match self {
            Self::InputValidation { field: Some(field), .. } => {
                map.insert("field".to_string(), serde_json::json!(field));
            }
            Self::BlobNotFound { path } => {
                map.insert("path".to_string(), serde_json::json!(path));
            }
            Self::ExternalService { endpoint, status, .. } => {
                map.insert("endpoint".to_string(), serde_json::json!(endpoint));
                if let Some(status) = status {
                    map.insert("status".to_string(), serde_json::json!(status));
                }
            }
            Self::ResponseValidation { stage, missing } => {
                map.insert("stage".to_string(), serde_json::json!(stage));
                map.insert("missing".to_string(), serde_json::json!(missing));
            }
            Self::DuplicateJob { queue, id } | Self::JobNotFound { queue, id } => {
                map.insert("queue".to_string(), serde_json::json!(queue));
                map.insert("id".to_string(), serde_json::json!(id));
            }
            _ => {}
        }

        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_validation_message_lists_fields() {
        let err = PipelineError::response_missing(
            "predict",
            vec!["front_json_path".to_string(), "back_json_path".to_string()],
        );

        assert_eq!(
            err.to_string(),
            "[predict] response is missing required fields: front_json_path, back_json_path"
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(PipelineError::external("http://ai/predict", Some(500), "boom").is_retryable());
        assert!(PipelineError::response_missing("predict", vec!["x".into()]).is_retryable());
        assert!(PipelineError::chain_enqueue("cloth2tex", "closed").is_retryable());
        assert!(PipelineError::persistence("write failed").is_retryable());

        assert!(!PipelineError::blob_not_found("/data/f.jpg").is_retryable());
        assert!(!PipelineError::input("bad category").is_retryable());
        assert!(!PipelineError::Cancelled("shutdown".into()).is_retryable());
    }

    #[test]
    fn test_missing_field_records_field() {
        let err = PipelineError::missing_field("front_image");
        match &err {
            PipelineError::InputValidation { field, .. } => {
                assert_eq!(field.as_deref(), Some("front_image"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("front_image"));
    }

    #[test]
    fn test_to_dict() {
        let err = PipelineError::external("http://ai:8000/api/predict", Some(502), "bad gateway");
        let dict = err.to_dict();

        assert_eq!(dict.get("type").unwrap(), "ExternalServiceError");
        assert_eq!(dict.get("status").unwrap(), 502);
        assert_eq!(dict.get("retryable").unwrap(), true);
    }

    #[test]
    fn test_duplicate_to_dict() {
        let dict = PipelineError::duplicate("clothProcessingQueue", "cloth-42").to_dict();
        assert_eq!(dict.get("queue").unwrap(), "clothProcessingQueue");
        assert_eq!(dict.get("id").unwrap(), "cloth-42");
    }
}
