//! Texture synthesis: the terminal stage of the garment chain.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use super::{persistence_error, wrong_payload, StageHandler, StagePayload};
use crate::core::StageOutput;
use crate::errors::Result;
use crate::inference::{InferenceClient, InferenceRequest};
use crate::pipeline::StageDefinition;
use crate::records::{GarmentRecord, RecordStore};
use crate::worker::JobContext;

/// Calls the texture service with the keypoints of the predict stage and
/// upserts the finished garment.
pub struct Cloth2TexHandler {
    stage: StageDefinition,
    client: Arc<dyn InferenceClient>,
    records: Arc<dyn RecordStore>,
}

impl Cloth2TexHandler {
    /// Creates the handler for `stage`.
    #[must_use]
    pub fn new(
        stage: StageDefinition,
        client: Arc<dyn InferenceClient>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            stage,
            client,
            records,
        }
    }
}

impl std::fmt::Debug for Cloth2TexHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cloth2TexHandler")
            .field("stage", &self.stage.name)
            .field("endpoint", &self.stage.endpoint)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StageHandler for Cloth2TexHandler {
    fn name(&self) -> &str {
        &self.stage.name
    }

    async fn handle(&self, ctx: &JobContext) -> Result<StageOutput> {
        let StagePayload::Cloth2Tex(payload) = ctx.payload() else {
            return Err(wrong_payload(&self.stage.name, ctx.payload()));
        };
        payload.validate()?;
        ctx.report_progress(65).await;

        let request = InferenceRequest::new()
            .text("user_id", &payload.user_id)
            .text("cloth_id", &payload.cloth_id)
            .text("subCategory", payload.sub_category.as_str())
            .text("front_image_path", &payload.front_image_path)
            .text("back_image_path", &payload.back_image_path)
            .text("front_json_path", &payload.front_json_path)
            .text("back_json_path", &payload.back_json_path);

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
        let texture_url = envelope.string("textureUrl")?;
        ctx.report_progress(80).await;

        let record = self
            .records
            .upsert_garment(GarmentRecord::from_texture(payload, &texture_url))
            .await
            .map_err(persistence_error)?;
        ctx.report_progress(100).await;

        info!(
            job_id = %ctx.chain_key(),
            user_id = %record.user_id,
            texture_url = %texture_url,
            "Garment textured"
        );
        Ok(StageOutput::done(json!({
            "status": "success",
            "textureUrl": texture_url,
            "cloth": serde_json::to_value(&record)?,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::errors::PipelineError;
    use crate::pipeline::{ChainDefinition, CLOTH2TEX};
    use crate::records::{MemoryRecordStore, MockRecordStore};
    use crate::testing::{
        claimed_context, cloth2tex_payload, texture_response, ScriptedInferenceClient,
        ScriptedResponse,
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const ENDPOINT: &str = "http://ai.test:8001/api/cloth2tex";

    fn stage() -> StageDefinition {
        let config = PipelineConfig::default().with_ai_base("http://ai.test");
        ChainDefinition::clothes(&config)
            .unwrap()
            .stage(CLOTH2TEX)
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn test_texture_upserts_garment() {
        let client = Arc::new(ScriptedInferenceClient::new().respond(
            ENDPOINT,
            ScriptedResponse::json(texture_response("https://cdn/cloth-42.glb")),
        ));
        let records = Arc::new(MemoryRecordStore::new());
        let handler = Cloth2TexHandler::new(stage(), client.clone(), records.clone());
        let ctx = claimed_context(
            cloth2tex_payload("user-1", "cloth-42").into(),
            "cloth-42",
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let output = handler.handle(&ctx).await.unwrap();

        assert!(!output.has_next());
        assert_eq!(output.result["status"], "success");
        assert_eq!(output.result["textureUrl"], "https://cdn/cloth-42.glb");
        assert_eq!(output.result["cloth"]["cloth_id"], "cloth-42");

        let stored = records.find_garment("cloth-42").await.unwrap().unwrap();
        assert_eq!(stored.model_url, "https://cdn/cloth-42.glb");
        assert_eq!(stored.image_url_front, "/images/clothes/front.jpg");

        let form = &client.calls()[0].request;
        assert_eq!(form.text_value("front_json_path"), Some("/ai/cloth-42/front.json"));
        assert_eq!(form.text_value("subCategory"), Some("T-shirt"));

        let job = ctx.queue().get_job("cloth-42").await.unwrap().unwrap();
        assert_eq!(job.progress, 100);
    }

    #[tokio::test]
    async fn test_missing_texture_url_is_not_persisted() {
        let client = Arc::new(
            ScriptedInferenceClient::new()
                .respond(ENDPOINT, ScriptedResponse::json(serde_json::json!({"textureUrl": ""}))),
        );
        let mut records = MockRecordStore::new();
        records.expect_upsert_garment().never();
        let handler = Cloth2TexHandler::new(stage(), client, Arc::new(records));
        let ctx = claimed_context(
            cloth2tex_payload("user-1", "cloth-1").into(),
            "cloth-1",
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let err = handler.handle(&ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::ResponseValidation { .. }));
    }

    #[tokio::test]
    async fn test_store_failure_is_retryable_persistence_error() {
        let client = Arc::new(ScriptedInferenceClient::new().always(
            ENDPOINT,
            ScriptedResponse::json(texture_response("https://cdn/c.glb")),
        ));
        let mut records = MockRecordStore::new();
        records
            .expect_upsert_garment()
            .times(1)
            .returning(|_| Err(PipelineError::Io(std::io::Error::other("disk full"))));
        let handler = Cloth2TexHandler::new(stage(), client, Arc::new(records));
        let ctx = claimed_context(
            cloth2tex_payload("user-1", "cloth-3").into(),
            "cloth-3",
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let err = handler.handle(&ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::Persistence(_)));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("disk full"));
    }

    #[tokio::test]
    async fn test_rejects_foreign_payload() {
        let dir = tempfile::tempdir().unwrap();
        let payload = crate::testing::mannequin_payload(dir.path(), "user-1").unwrap();
        let handler = Cloth2TexHandler::new(
            stage(),
            Arc::new(ScriptedInferenceClient::new()),
            Arc::new(MemoryRecordStore::new()),
        );
        let ctx = claimed_context(payload.into(), "m-1", Duration::from_secs(5))
            .await
            .unwrap();

        let err = handler.handle(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("cloth2tex handler received a mannequin payload"));
    }
}
