//! Testing utilities for closetflow pipelines.
//!
//! This module provides:
//! - Scripted inference clients and stage handlers
//! - Sample payloads, responses and configuration
//! - Polling helpers for asynchronous job state

mod fixtures;
mod mocks;
mod waiting;

pub use fixtures::{
    claimed_context, cloth2tex_payload, fast_config, mannequin_payload, mannequin_response,
    predict_payload, predict_response, texture_response, write_photo,
};
pub use mocks::{
    HandlerOutcome, RecordedCall, ScriptedHandler, ScriptedInferenceClient, ScriptedResponse,
};
pub use waiting::{wait_for_state, wait_until};
