//! Landmark prediction: the first stage of the garment chain.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use super::{wrong_payload, Cloth2TexPayload, ResponseEnvelope, StageHandler, StagePayload};
use crate::blob::BlobResolver;
use crate::core::StageOutput;
use crate::errors::Result;
use crate::inference::{InferenceClient, InferenceRequest};
use crate::pipeline::StageDefinition;
use crate::worker::JobContext;

/// Sends both garment photos to the landmark service and hands the
/// returned keypoint paths to the texture stage.
pub struct PredictHandler {
    stage: StageDefinition,
    client: Arc<dyn InferenceClient>,
    blobs: BlobResolver,
}

impl PredictHandler {
    /// Creates the handler for `stage`.
    #[must_use]
    pub fn new(
        stage: StageDefinition,
        client: Arc<dyn InferenceClient>,
        blobs: BlobResolver,
    ) -> Self {
        Self {
            stage,
            client,
            blobs,
        }
    }
}

impl std::fmt::Debug for PredictHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictHandler")
            .field("stage", &self.stage.name)
            .field("endpoint", &self.stage.endpoint)
            .field("data_root", &self.blobs.root())
            .finish()
    }
}

#[async_trait]
impl StageHandler for PredictHandler {
    fn name(&self) -> &str {
        &self.stage.name
    }

    async fn handle(&self, ctx: &JobContext) -> Result<StageOutput> {
        let StagePayload::Predict(payload) = ctx.payload() else {
            return Err(wrong_payload(&self.stage.name, ctx.payload()));
        };
        ctx.report_progress(5).await;

        let front = self.blobs.resolve(&payload.front_image).await?;
        let back = self.blobs.resolve(&payload.back_image).await?;

        let request = InferenceRequest::new()
            .text("user_id", &payload.user_id)
            .text("cloth_id", &payload.cloth_id)
            .text("category", payload.category.inference_name())
            .text("subCategory", payload.sub_category.as_str())
            .file("cloth_front", &front.path, &payload.file_name_front)
            .file("cloth_back", &back.path, &payload.file_name_back);

        ctx.report_progress(15).await;
        debug!(
            job_id = %ctx.chain_key(),
            endpoint = %self.stage.endpoint,
            attempt = ctx.attempt(),
            "Requesting landmarks"
        );
        let envelope: ResponseEnvelope = self
            .client
            .post_multipart(
                &self.stage.endpoint,
                request,
                ctx.deadline(),
                ctx.cancellation(),
            )
            .await?;
        envelope.require(&self.stage.name, &self.stage.required())?;
        ctx.report_progress(40).await;

        let next = Cloth2TexPayload::from_prediction(payload, &envelope)?;
        let result = json!({
            "status": "landmark_done",
            "front_json_path": next.front_json_path,
            "back_json_path": next.back_json_path,
            "front_vis_path": next.front_vis_path,
            "back_vis_path": next.back_vis_path,
        });

        ctx.report_progress(60).await;
        info!(job_id = %ctx.chain_key(), "Landmarks ready");
        Ok(StageOutput::chain(result, next))
    }
}
