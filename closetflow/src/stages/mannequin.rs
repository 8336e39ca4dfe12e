//! Mannequin generation from a single body photo.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use super::{persistence_error, wrong_payload, StageHandler, StagePayload};
use crate::blob::BlobResolver;
use crate::core::StageOutput;
use crate::errors::Result;
use crate::inference::{InferenceClient, InferenceRequest};
use crate::pipeline::StageDefinition;
use crate::records::{MannequinRecord, RecordStore};
use crate::worker::JobContext;

/// Uploads a body photo and stores the generated model as the user's
/// mannequin.
pub struct MannequinHandler {
    stage: StageDefinition,
    client: Arc<dyn InferenceClient>,
    blobs: BlobResolver,
    records: Arc<dyn RecordStore>,
}

impl MannequinHandler {
    /// Creates the handler for `stage`.
    #[must_use]
    pub fn new(
        stage: StageDefinition,
        client: Arc<dyn InferenceClient>,
        blobs: BlobResolver,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            stage,
            client,
            blobs,
            records,
        }
    }
}

impl std::fmt::Debug for MannequinHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MannequinHandler")
            .field("stage", &self.stage.name)
            .field("endpoint", &self.stage.endpoint)
            .field("data_root", &self.blobs.root())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StageHandler for MannequinHandler {
    fn name(&self) -> &str {
        &self.stage.name
    }

    async fn handle(&self, ctx: &JobContext) -> Result<StageOutput> {
        let StagePayload::Mannequin(payload) = ctx.payload() else {
            return Err(wrong_payload(&self.stage.name, ctx.payload()));
        };
        ctx.report_progress(10).await;

        let image = self.blobs.resolve(&payload.image).await?;
        let request = InferenceRequest::new().file("image", &image.path, &payload.file_name);

        let envelope = self
            .client
            .post_multipart(
                &self.stage.endpoint,
                request,
                ctx.deadline(),
                ctx.cancellation(),
            )
            .await?;
        envelope.require(&self.stage.name, &self.stage.required())?;
        let model_url = envelope.string("modelUrl")?;
        ctx.report_progress(60).await;

        let record = self
            .records
            .upsert_mannequin(MannequinRecord::new(
                &payload.user_id,
                ctx.chain_key(),
                &model_url,
                &payload.file_name,
            ))
            .await
            .map_err(persistence_error)?;
        ctx.report_progress(100).await;

        info!(job_id = %ctx.chain_key(), user_id = %record.user_id, "Mannequin generated");
        Ok(StageOutput::done(json!({
            "status": "success",
            "modelUrl": model_url,
            "mannequin": serde_json::to_value(&record)?,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::errors::PipelineError;
    use crate::pipeline::{ChainDefinition, MANNEQUIN};
    use crate::records::MemoryRecordStore;
    use crate::testing::{
        claimed_context, mannequin_payload, mannequin_response, ScriptedInferenceClient,
        ScriptedResponse,
    };
    use std::time::Duration;

    const ENDPOINT: &str = "http://ai.test:8002/mannequin";

    fn stage() -> StageDefinition {
        let config = PipelineConfig::default().with_ai_base("http://ai.test");
        ChainDefinition::mannequin(&config)
            .unwrap()
            .stage(MANNEQUIN)
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn test_mannequin_is_stored_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let payload = mannequin_payload(dir.path(), "user-1").unwrap();
        let client = Arc::new(ScriptedInferenceClient::new().respond(
            ENDPOINT,
            ScriptedResponse::json(mannequin_response("https://cdn/m.glb")),
        ));
        let records = Arc::new(MemoryRecordStore::new());
        let handler = MannequinHandler::new(
            stage(),
            client.clone(),
            BlobResolver::new(dir.path()),
            records.clone(),
        );
        let ctx = claimed_context(payload.into(), "m-1", Duration::from_secs(5))
            .await
            .unwrap();

        let output = handler.handle(&ctx).await.unwrap();
        assert_eq!(output.result["modelUrl"], "https://cdn/m.glb");
        assert_eq!(output.result["mannequin"]["image_url"], "/images/mannequins/body.jpg");

        let stored = records.find_mannequin("user-1").await.unwrap().unwrap();
        assert_eq!(stored.model_url, "https://cdn/m.glb");
        assert_eq!(stored.chain_key, "m-1");
        assert!(client.calls()[0].request.file_path("image").is_some());
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_external_error() {
        let dir = tempfile::tempdir().unwrap();
        let payload = mannequin_payload(dir.path(), "user-2").unwrap();
        let client = Arc::new(ScriptedInferenceClient::new().always(ENDPOINT, ScriptedResponse::Hang));
        let handler = MannequinHandler::new(
            stage(),
            client,
            BlobResolver::new(dir.path()),
            Arc::new(MemoryRecordStore::new()),
        );
        let ctx = claimed_context(payload.into(), "m-2", Duration::from_millis(30))
            .await
            .unwrap();

        let err = handler.handle(&ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::ExternalService { .. }));
        assert!(err.is_retryable());
    }
}
