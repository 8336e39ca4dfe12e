//! Scripted collaborators for exercising workers and handlers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::core::StageOutput;
use crate::errors::{PipelineError, Result};
use crate::inference::{InferenceClient, InferenceRequest};
use crate::stages::{ResponseEnvelope, StageHandler};
use crate::worker::JobContext;

/// One scripted answer of an inference endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedResponse {
    /// 2xx with this JSON body.
    Json(serde_json::Value),
    /// Non-2xx with this body.
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
    /// Never answers; resolves only on deadline or cancellation.
    Hang,
}

impl ScriptedResponse {
    /// A 2xx JSON answer.
    #[must_use]
    pub fn json(value: serde_json::Value) -> Self {
        Self::Json(value)
    }

    /// An HTTP 500 answer.
    #[must_use]
    pub fn server_error(body: impl Into<String>) -> Self {
        Self::Status {
            status: 500,
            body: body.into(),
        }
    }
}

/// A request seen by [`ScriptedInferenceClient`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Endpoint that was called.
    pub endpoint: String,
    /// The form that was sent.
    pub request: InferenceRequest,
}

/// An [`InferenceClient`] answering from per-endpoint scripts.
///
/// Queued answers are consumed in order; once an endpoint's queue is empty
/// its `always` answer repeats. An endpoint with neither answers 404.
#[derive(Debug, Default)]
pub struct ScriptedInferenceClient {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedResponse>>>,
    fallback: Mutex<HashMap<String, ScriptedResponse>>,
    calls: Mutex<Vec<RecordedCall>>,
    delay: Duration,
}

impl ScriptedInferenceClient {
    /// Creates a client with no scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every answer.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queues one answer for `endpoint`.
    #[must_use]
    pub fn respond(self, endpoint: impl Into<String>, response: ScriptedResponse) -> Self {
        self.scripts
            .lock()
            .entry(endpoint.into())
            .or_default()
            .push_back(response);
        self
    }

    /// Sets the repeating answer for `endpoint`.
    #[must_use]
    pub fn always(self, endpoint: impl Into<String>, response: ScriptedResponse) -> Self {
        self.fallback.lock().insert(endpoint.into(), response);
        self
    }

    /// Every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of calls made to `endpoint`.
    #[must_use]
    pub fn calls_to(&self, endpoint: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.endpoint == endpoint)
            .count()
    }

    fn next_response(&self, endpoint: &str) -> ScriptedResponse {
        if let Some(response) = self
            .scripts
            .lock()
            .get_mut(endpoint)
            .and_then(VecDeque::pop_front)
        {
            return response;
        }
        self.fallback
            .lock()
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| ScriptedResponse::Status {
                status: 404,
                body: "no scripted response".to_string(),
            })
    }
}

#[async_trait]
impl InferenceClient for ScriptedInferenceClient {
    async fn post_multipart(
        &self,
        endpoint: &str,
        request: InferenceRequest,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<ResponseEnvelope> {
        self.calls.lock().push(RecordedCall {
            endpoint: endpoint.to_string(),
            request,
        });
        let response = self.next_response(endpoint);

        let wait = match response {
            ScriptedResponse::Hang => deadline,
            _ => self.delay.min(deadline),
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(PipelineError::external(endpoint, None, "request cancelled"));
            }
            () = tokio::time::sleep(wait) => {}
        }

        match response {
            ScriptedResponse::Json(value) => ResponseEnvelope::from_value(value),
            ScriptedResponse::Status { status, body } => Err(PipelineError::external(
                endpoint,
                Some(status),
                format!("HTTP {status}: {body}"),
            )),
            ScriptedResponse::Hang => Err(PipelineError::external(
                endpoint,
                None,
                format!("no response within {}s", deadline.as_secs()),
            )),
        }
    }
}

/// What a [`ScriptedHandler`] does on one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// Return this output.
    Output(StageOutput),
    /// Fail with a retryable external error.
    Retryable(String),
    /// Fail with a non-retryable input error.
    Fatal(String),
    /// Sleep, then return this output.
    Slow(Duration, StageOutput),
}

/// A [`StageHandler`] playing back scripted outcomes.
#[derive(Debug)]
pub struct ScriptedHandler {
    name: String,
    outcomes: Mutex<VecDeque<HandlerOutcome>>,
    default: HandlerOutcome,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl ScriptedHandler {
    /// Creates a handler that returns an empty result once its script runs out.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcomes: Mutex::new(VecDeque::new()),
            default: HandlerOutcome::Output(StageOutput::done(serde_json::json!({}))),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Queues an outcome.
    #[must_use]
    pub fn then(self, outcome: HandlerOutcome) -> Self {
        self.outcomes.lock().push_back(outcome);
        self
    }

    /// Sets the outcome used once the script runs out.
    #[must_use]
    pub fn otherwise(mut self, outcome: HandlerOutcome) -> Self {
        self.default = outcome;
        self
    }

    /// Number of invocations so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Job ids seen, in invocation order.
    #[must_use]
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl StageHandler for ScriptedHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: &JobContext) -> Result<StageOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(ctx.chain_key().to_string());

        let outcome = self
            .outcomes
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        match outcome {
            HandlerOutcome::Output(output) => Ok(output),
            HandlerOutcome::Retryable(message) => {
                Err(PipelineError::external(&self.name, Some(500), message))
            }
            HandlerOutcome::Fatal(message) => Err(PipelineError::input(message)),
            HandlerOutcome::Slow(delay, output) => {
                tokio::select! {
                    () = ctx.cancellation().cancelled() => {
                        Err(PipelineError::Cancelled(self.name.clone()))
                    }
                    () = tokio::time::sleep(delay) => Ok(output),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripted_client_consumes_then_repeats() {
        let client = ScriptedInferenceClient::new()
            .respond("http://ai/p", ScriptedResponse::server_error("boom"))
            .always("http://ai/p", ScriptedResponse::json(json!({"ok": true})));
        let cancel = CancellationToken::new();
        let deadline = Duration::from_secs(1);

        let first = client
            .post_multipart("http://ai/p", InferenceRequest::new(), deadline, &cancel)
            .await;
        assert!(matches!(
            first,
            Err(PipelineError::ExternalService { status: Some(500), .. })
        ));

        for _ in 0..2 {
            let ok = client
                .post_multipart("http://ai/p", InferenceRequest::new(), deadline, &cancel)
                .await
                .unwrap();
            assert_eq!(ok.get("ok"), Some(&json!(true)));
        }
        assert_eq!(client.calls_to("http://ai/p"), 3);
    }

    #[tokio::test]
    async fn test_unscripted_endpoint_is_404() {
        let client = ScriptedInferenceClient::new();
        let err = client
            .post_multipart(
                "http://ai/x",
                InferenceRequest::new(),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_hang_times_out_at_deadline() {
        let client = ScriptedInferenceClient::new().always("http://ai/h", ScriptedResponse::Hang);
        let err = client
            .post_multipart(
                "http://ai/h",
                InferenceRequest::new(),
                Duration::from_millis(20),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no response"));
    }
}
