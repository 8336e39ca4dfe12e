//! # Closetflow
//!
//! An asynchronous job pipeline that turns garment and body photos into 3D
//! assets by calling AI inference services.
//!
//! Closetflow provides:
//!
//! - **Durable job queues**: deduplicated by chain key, with retry backoff
//!   and retention of terminal jobs
//! - **Stage workers**: bounded concurrency per stage, attempt deadlines and
//!   cooperative cancellation
//! - **Chaining**: a successful stage enqueues its successor under the same
//!   key (`predict -> cloth2tex`, and the single-stage `mannequin` chain)
//! - **Status aggregation**: one report per chain key, falling back to
//!   persisted records once jobs are pruned
//! - **Graceful shutdown**: admission closes, in-flight work drains within a
//!   grace period
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use closetflow::prelude::*;
//!
//! let runtime = PipelineRuntime::builder(PipelineConfig::load()?)
//!     .build()
//!     .await?;
//! runtime.start().await;
//!
//! let admission = runtime.submit_garment(submission).await?;
//! let report = runtime.status(&admission.chain_key).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod blob;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod inference;
pub mod observability;
pub mod pipeline;
pub mod queue;
pub mod records;
pub mod runtime;
pub mod shutdown;
pub mod stages;
pub mod status;
pub mod testing;
pub mod worker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::blob::{BlobRef, BlobResolver};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{LogFormat, PipelineConfig, StageConfig};
    pub use crate::core::{ChainKey, Job, JobOptions, JobState, ReportStatus, StageOutput};
    pub use crate::errors::{PipelineError, Result};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::inference::{InferenceClient, InferenceRequest};
    pub use crate::pipeline::{BackoffPolicy, ChainDefinition, StageDefinition};
    pub use crate::queue::{JobQueue, QueueStore, QueueStoreFactory};
    pub use crate::records::{GarmentRecord, MannequinRecord, RecordStore};
    pub use crate::runtime::{
        Admission, GarmentSubmission, MannequinSubmission, PipelineRuntime,
    };
    pub use crate::shutdown::{wait_for_signal, ShutdownController, ShutdownReport};
    pub use crate::stages::{Category, StageHandler, StagePayload, SubCategory};
    pub use crate::status::{MannequinStatus, StatusAggregator, StatusReport};
    pub use crate::worker::{JobContext, StageWorker};
}
