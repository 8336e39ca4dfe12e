//! Typed job payloads, one variant per stage.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::{PipelineError, Result};

/// Garment category as submitted by the web client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Upper-body garment.
    Top,
    /// Lower-body garment.
    Bottom,
}

impl Category {
    /// The category name the landmark model understands.
    #[must_use]
    pub fn inference_name(&self) -> &'static str {
        match self {
            Self::Top => "blouse",
            Self::Bottom => "trousers",
        }
    }

    /// The web-facing name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Top => "top",
            Self::Bottom => "bottom",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "top" => Ok(Self::Top),
            "bottom" => Ok(Self::Bottom),
            other => Err(PipelineError::InputValidation {
                message: format!("unknown category '{other}'"),
                field: Some("category".to_string()),
            }),
        }
    }
}

/// Garment sub-category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubCategory {
    /// T-shirt.
    #[serde(rename = "T-shirt")]
    TShirt,
    /// Shirt.
    Shirt,
    /// Hoodie.
    Hoodie,
    /// Sweatshirt.
    Sweatshirt,
    /// Skirt.
    Skirt,
    /// Pants.
    Pants,
    /// Shorts.
    Shorts,
}

impl SubCategory {
    /// The wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TShirt => "T-shirt",
            Self::Shirt => "Shirt",
            Self::Hoodie => "Hoodie",
            Self::Sweatshirt => "Sweatshirt",
            Self::Skirt => "Skirt",
            Self::Pants => "Pants",
            Self::Shorts => "Shorts",
        }
    }
}

impl fmt::Display for SubCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubCategory {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "T-shirt" => Ok(Self::TShirt),
            "Shirt" => Ok(Self::Shirt),
            "Hoodie" => Ok(Self::Hoodie),
            "Sweatshirt" => Ok(Self::Sweatshirt),
            "Skirt" => Ok(Self::Skirt),
            "Pants" => Ok(Self::Pants),
            "Shorts" => Ok(Self::Shorts),
            other => Err(PipelineError::InputValidation {
                message: format!("unknown sub-category '{other}'"),
                field: Some("subCategory".to_string()),
            }),
        }
    }
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(PipelineError::missing_field(field));
    }
    Ok(())
}

fn require_path(field: &str, value: &std::path::Path) -> Result<()> {
    if value.as_os_str().is_empty() {
        return Err(PipelineError::missing_field(field));
    }
    Ok(())
}

/// Input of the landmark prediction stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictPayload {
    /// Owner of the garment.
    pub user_id: String,
    /// Garment id; the chain key.
    pub cloth_id: String,
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Garment category.
    pub category: Category,
    /// Garment sub-category.
    #[serde(rename = "subCategory")]
    pub sub_category: SubCategory,
    /// Front photo on disk.
    pub front_image: PathBuf,
    /// Back photo on disk.
    pub back_image: PathBuf,
    /// Stored file name of the front photo.
    pub file_name_front: String,
    /// Stored file name of the back photo.
    pub file_name_back: String,
}

impl PredictPayload {
    /// Required keys of this payload.
    pub const REQUIRED: &'static [&'static str] = &[
        "user_id",
        "cloth_id",
        "category",
        "subCategory",
        "front_image",
        "back_image",
    ];

    /// Checks that every required field is populated.
    pub fn validate(&self) -> Result<()> {
        require_text("user_id", &self.user_id)?;
        require_text("cloth_id", &self.cloth_id)?;
        require_text("name", &self.name)?;
        require_path("front_image", &self.front_image)?;
        require_path("back_image", &self.back_image)?;
        require_text("file_name_front", &self.file_name_front)?;
        require_text("file_name_back", &self.file_name_back)?;
        Ok(())
    }
}

/// Input of the texture synthesis stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cloth2TexPayload {
    /// Owner of the garment.
    pub user_id: String,
    /// Garment id; the chain key.
    pub cloth_id: String,
    /// Display name, passed through for the final record.
    pub name: String,
    /// Description, passed through for the final record.
    #[serde(default)]
    pub description: String,
    /// Garment category.
    pub category: Category,
    /// Garment sub-category.
    #[serde(rename = "subCategory")]
    pub sub_category: SubCategory,
    /// Stored file name of the front photo.
    pub file_name_front: String,
    /// Stored file name of the back photo.
    pub file_name_back: String,
    /// Front image path on the inference host.
    pub front_image_path: String,
    /// Back image path on the inference host.
    pub back_image_path: String,
    /// Front keypoints JSON path on the inference host.
    pub front_json_path: String,
    /// Back keypoints JSON path on the inference host.
    pub back_json_path: String,
    /// Front landmark visualisation, when the service produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub front_vis_path: Option<String>,
    /// Back landmark visualisation, when the service produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back_vis_path: Option<String>,
}

impl Cloth2TexPayload {
    /// Required keys of this payload.
    pub const REQUIRED: &'static [&'static str] = &[
        "name",
        "description",
        "category",
        "subCategory",
        "front_image_path",
        "back_image_path",
        "front_json_path",
        "back_json_path",
    ];

    /// Builds the texture payload from a prediction and its validated response.
    ///
    /// The envelope must already have passed the predict stage's
    /// required-field check.
    pub fn from_prediction(
        predict: &PredictPayload,
        envelope: &super::ResponseEnvelope,
    ) -> Result<Self> {
        let payload = Self {
            user_id: predict.user_id.clone(),
            cloth_id: predict.cloth_id.clone(),
            name: predict.name.clone(),
            description: predict.description.clone(),
            category: predict.category,
            sub_category: predict.sub_category,
            file_name_front: predict.file_name_front.clone(),
            file_name_back: predict.file_name_back.clone(),
            front_image_path: envelope.string("front_image_path")?,
            back_image_path: envelope.string("back_image_path")?,
            front_json_path: envelope.string("front_json_path")?,
            back_json_path: envelope.string("back_json_path")?,
            front_vis_path: envelope.optional_string("front_vis_path"),
            back_vis_path: envelope.optional_string("back_vis_path"),
        };
        payload.validate()?;
        Ok(payload)
    }

    /// Checks that every required field is populated.
    pub fn validate(&self) -> Result<()> {
        require_text("user_id", &self.user_id)?;
        require_text("cloth_id", &self.cloth_id)?;
        require_text("name", &self.name)?;
        require_text("front_image_path", &self.front_image_path)?;
        require_text("back_image_path", &self.back_image_path)?;
        require_text("front_json_path", &self.front_json_path)?;
        require_text("back_json_path", &self.back_json_path)?;
        Ok(())
    }
}

/// Input of the mannequin generation stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MannequinPayload {
    /// Owner of the body photo.
    pub user_id: String,
    /// Body photo on disk.
    pub image: PathBuf,
    /// Stored file name of the body photo.
    pub file_name: String,
}

impl MannequinPayload {
    /// Required keys of this payload.
    pub const REQUIRED: &'static [&'static str] = &["user_id", "image", "file_name"];

    /// Checks that every required field is populated.
    pub fn validate(&self) -> Result<()> {
        require_text("user_id", &self.user_id)?;
        require_path("image", &self.image)?;
        require_text("file_name", &self.file_name)?;
        Ok(())
    }
}

/// The payload of any job, tagged by stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StagePayload {
    /// Landmark prediction.
    Predict(PredictPayload),
    /// Texture synthesis and garment persistence.
    #[serde(rename = "cloth2tex")]
    Cloth2Tex(Cloth2TexPayload),
    /// Mannequin generation and persistence.
    Mannequin(MannequinPayload),
}

impl StagePayload {
    /// The stage this payload belongs to.
    #[must_use]
    pub fn stage_name(&self) -> &'static str {
        match self {
            Self::Predict(_) => "predict",
            Self::Cloth2Tex(_) => "cloth2tex",
            Self::Mannequin(_) => "mannequin",
        }
    }

    /// The user the work belongs to.
    #[must_use]
    pub fn user_id(&self) -> &str {
        match self {
            Self::Predict(p) => &p.user_id,
            Self::Cloth2Tex(p) => &p.user_id,
            Self::Mannequin(p) => &p.user_id,
        }
    }

    /// Required keys declared by the variant.
    #[must_use]
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Predict(_) => PredictPayload::REQUIRED,
            Self::Cloth2Tex(_) => Cloth2TexPayload::REQUIRED,
            Self::Mannequin(_) => MannequinPayload::REQUIRED,
        }
    }

    /// Validates the wrapped payload.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Predict(p) => p.validate(),
            Self::Cloth2Tex(p) => p.validate(),
            Self::Mannequin(p) => p.validate(),
        }
    }
}

impl From<PredictPayload> for StagePayload {
    fn from(payload: PredictPayload) -> Self {
        Self::Predict(payload)
    }
}

impl From<Cloth2TexPayload> for StagePayload {
    fn from(payload: Cloth2TexPayload) -> Self {
        Self::Cloth2Tex(payload)
    }
}

impl From<MannequinPayload> for StagePayload {
    fn from(payload: MannequinPayload) -> Self {
        Self::Mannequin(payload)
    }
}
