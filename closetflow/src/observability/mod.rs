//! Logging setup and timing helpers.

mod tracing;

pub use tracing::{init_tracing, SpanTimer, DEFAULT_FILTER};
