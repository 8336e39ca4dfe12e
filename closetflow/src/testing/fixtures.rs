//! Sample payloads, inference responses and configuration for tests.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::core::JobOptions;
use crate::errors::{PipelineError, Result};
use crate::pipeline::BackoffPolicy;
use crate::queue::JobQueue;
use crate::stages::{
    Category, Cloth2TexPayload, MannequinPayload, PredictPayload, StagePayload, SubCategory,
};
use crate::worker::JobContext;

/// Writes a small fake photo to `dir/name` and returns its path.
pub fn write_photo(dir: &Path, name: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(name);
    std::fs::write(&path, b"\xFF\xD8\xFF\xE0 fake jpeg")?;
    Ok(path)
}

/// A predict payload whose photos exist under `root/<user>/<cloth>/`.
pub fn predict_payload(root: &Path, user_id: &str, cloth_id: &str) -> Result<PredictPayload> {
    let dir = root.join(user_id).join(cloth_id);
    let front = write_photo(&dir, "front.jpg")?;
    let back = write_photo(&dir, "back.jpg")?;
    Ok(PredictPayload {
        user_id: user_id.to_string(),
        cloth_id: cloth_id.to_string(),
        name: "summer tee".to_string(),
        description: "white cotton".to_string(),
        category: Category::Top,
        sub_category: SubCategory::TShirt,
        front_image: front,
        back_image: back,
        file_name_front: "front.jpg".to_string(),
        file_name_back: "back.jpg".to_string(),
    })
}

/// A texture payload as produced from [`predict_response`].
#[must_use]
pub fn cloth2tex_payload(user_id: &str, cloth_id: &str) -> Cloth2TexPayload {
    Cloth2TexPayload {
        user_id: user_id.to_string(),
        cloth_id: cloth_id.to_string(),
        name: "summer tee".to_string(),
        description: "white cotton".to_string(),
        category: Category::Top,
        sub_category: SubCategory::TShirt,
        file_name_front: "front.jpg".to_string(),
        file_name_back: "back.jpg".to_string(),
        front_image_path: format!("/ai/{cloth_id}/front.png"),
        back_image_path: format!("/ai/{cloth_id}/back.png"),
        front_json_path: format!("/ai/{cloth_id}/front.json"),
        back_json_path: format!("/ai/{cloth_id}/back.json"),
        front_vis_path: None,
        back_vis_path: None,
    }
}

/// A mannequin payload whose photo exists under `root/<user>/`.
pub fn mannequin_payload(root: &Path, user_id: &str) -> Result<MannequinPayload> {
    let image = write_photo(&root.join(user_id), "body.jpg")?;
    Ok(MannequinPayload {
        user_id: user_id.to_string(),
        image,
        file_name: "body.jpg".to_string(),
    })
}

/// A complete landmark service answer for `cloth_id`.
#[must_use]
pub fn predict_response(cloth_id: &str) -> Value {
    json!({
        "front_image_path": format!("/ai/{cloth_id}/front.png"),
        "back_image_path": format!("/ai/{cloth_id}/back.png"),
        "front_json_path": format!("/ai/{cloth_id}/front.json"),
        "back_json_path": format!("/ai/{cloth_id}/back.json"),
        "front_vis_path": format!("/ai/{cloth_id}/front_vis.png"),
        "back_vis_path": format!("/ai/{cloth_id}/back_vis.png"),
    })
}

/// A texture service answer.
#[must_use]
pub fn texture_response(texture_url: &str) -> Value {
    json!({ "textureUrl": texture_url })
}

/// A mannequin service answer.
#[must_use]
pub fn mannequin_response(model_url: &str) -> Value {
    json!({ "modelUrl": model_url })
}

/// Configuration with millisecond backoff and polling, rooted at `data_dir`.
#[must_use]
pub fn fast_config(data_dir: impl Into<PathBuf>) -> PipelineConfig {
    PipelineConfig::default()
        .with_ai_base("http://ai.test")
        .with_data_dir(data_dir)
        .with_poll_interval_ms(20)
        .with_shutdown_grace_secs(1)
        .map_stages(|stage| {
            stage
                .with_backoff(BackoffPolicy::fixed(10))
                .with_timeout_secs(5)
        })
}

/// Enqueues `payload` under `id` on a fresh in-memory queue, claims it and
/// wraps it in a context.
pub async fn claimed_context(
    payload: StagePayload,
    id: &str,
    deadline: Duration,
) -> Result<JobContext> {
    let queue = Arc::new(JobQueue::in_memory(format!("{}-test", payload.stage_name())));
    queue
        .enqueue(payload, JobOptions::new().with_id(id))
        .await?;
    let job = queue
        .claim()
        .await?
        .ok_or_else(|| PipelineError::job_not_found(queue.name(), id))?;
    Ok(JobContext::new(
        job,
        queue,
        Arc::new(CancellationToken::new()),
        deadline,
    ))
}
