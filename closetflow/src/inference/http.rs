//! reqwest-backed inference client.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{FormPart, InferenceClient, InferenceRequest};
use crate::cancellation::CancellationToken;
use crate::errors::{PipelineError, Result};
use crate::stages::ResponseEnvelope;

const USER_AGENT: &str = concat!("closetflow/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY: usize = 2048;

/// Sends inference requests as multipart HTTP POSTs.
#[derive(Debug, Clone)]
pub struct HttpInferenceClient {
    client: reqwest::Client,
}

impl HttpInferenceClient {
    /// Creates a client with a fresh connection pool.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("http client: {e}")))?;
        Ok(Self { client })
    }

    /// Wraps an existing reqwest client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn build_form(request: InferenceRequest) -> Result<Form> {
        let mut form = Form::new();
        for part in request.parts {
            form = match part {
                FormPart::Text { name, value } => form.text(name, value),
                FormPart::File {
                    name,
                    path,
                    file_name,
                } => {
                    let bytes = tokio::fs::read(&path)
                        .await
                        .map_err(|_| PipelineError::blob_not_found(&path))?;
                    form.part(name, Part::bytes(bytes).file_name(file_name))
                }
            };
        }
        Ok(form)
    }

    async fn send(
        &self,
        endpoint: &str,
        form: Form,
        deadline: Duration,
    ) -> Result<ResponseEnvelope> {
        let response = self
            .client
            .post(endpoint)
            .multipart(form)
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| {
                let message = if e.is_timeout() {
                    format!("no response within {}s", deadline.as_secs())
                } else {
                    e.to_string()
                };
                PipelineError::external(endpoint, None, message)
            })?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(PipelineError::external(
                endpoint,
                Some(status.as_u16()),
                format!("HTTP {status}: {body}"),
            ));
        }

        let value: serde_json::Value = response.json().await.map_err(|e| {
            PipelineError::external(endpoint, Some(status.as_u16()), format!("invalid JSON body: {e}"))
        })?;
        ResponseEnvelope::from_value(value)
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn post_multipart(
        &self,
        endpoint: &str,
        request: InferenceRequest,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<ResponseEnvelope> {
        let form = Self::build_form(request).await?;
        let started = Instant::now();
        debug!(endpoint, deadline_secs = deadline.as_secs(), "POST inference request");

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PipelineError::external(
                endpoint,
                None,
                format!("request cancelled: {}", cancel.reason().unwrap_or_default()),
            )),
            result = self.send(endpoint, form, deadline) => result,
        };

        match &result {
            Ok(_) => debug!(
                endpoint,
                duration_ms = millis(started.elapsed()),
                "Inference request succeeded"
            ),
            Err(e) => warn!(endpoint, error = %e, "Inference request failed"),
        }
        result
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
