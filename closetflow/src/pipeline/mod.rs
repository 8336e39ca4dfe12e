//! Chain declarations and retry policy.
//!
//! This module provides:
//! - Chain and stage definitions built from configuration
//! - Backoff policies and retry decisions

mod chain;
mod retry;

pub use chain::{
    ChainDefinition, StageDefinition, CLOTH2TEX, CLOTH2TEX_QUEUE, CLOTH2TEX_RESPONSE_FIELDS,
    CLOTHES_CHAIN, MANNEQUIN, MANNEQUIN_CHAIN, MANNEQUIN_QUEUE, MANNEQUIN_RESPONSE_FIELDS,
    PREDICT, PREDICT_QUEUE, PREDICT_RESPONSE_FIELDS,
};
pub use retry::{should_retry, BackoffKind, BackoffPolicy, JitterStrategy, RetryDecision};
