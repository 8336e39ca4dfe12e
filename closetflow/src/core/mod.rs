//! Core domain model types for closetflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Job state and reported status enums
//! - Job records, options and the chain key
//! - The output of a successful stage run

mod job;
mod output;
mod status;

pub use job::{ChainKey, Job, JobOptions, Retention, RetentionPolicy};
pub use output::StageOutput;
pub use status::{JobState, ReportStatus};
