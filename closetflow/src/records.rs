//! Persisted garment and mannequin records.
//!
//! Only terminal stages write here. Upserts are keyed by the chain key for
//! garments and by user id for mannequins, and keep the `created_at` of an
//! existing record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::stages::{Category, Cloth2TexPayload, SubCategory};

/// URL prefix of uploaded garment photos.
pub const CLOTHES_IMAGE_PREFIX: &str = "/images/clothes";
/// URL prefix of uploaded body photos.
pub const MANNEQUIN_IMAGE_PREFIX: &str = "/images/mannequins";

/// A textured garment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GarmentRecord {
    /// Garment id, equal to the chain key.
    pub cloth_id: String,
    /// Owner.
    pub user_id: String,
    /// Display name.
    pub name: String,
    /// Free-text description.
    pub description: String,
    /// Web category.
    pub category: Category,
    /// Web sub-category.
    pub sub_category: SubCategory,
    /// Public URL of the front photo.
    pub image_url_front: String,
    /// Public URL of the back photo.
    pub image_url_back: String,
    /// URL of the textured model.
    pub model_url: String,
    /// First insert time.
    pub created_at: DateTime<Utc>,
    /// Last upsert time.
    pub updated_at: DateTime<Utc>,
}

impl GarmentRecord {
    /// Builds the record written when texturing finishes.
    #[must_use]
    pub fn from_texture(payload: &Cloth2TexPayload, texture_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            cloth_id: payload.cloth_id.clone(),
            user_id: payload.user_id.clone(),
            name: payload.name.clone(),
            description: payload.description.clone(),
            category: payload.category,
            sub_category: payload.sub_category,
            image_url_front: format!("{CLOTHES_IMAGE_PREFIX}/{}", payload.file_name_front),
            image_url_back: format!("{CLOTHES_IMAGE_PREFIX}/{}", payload.file_name_back),
            model_url: texture_url.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true once a model URL has been stored.
    #[must_use]
    pub fn has_model(&self) -> bool {
        !self.model_url.trim().is_empty()
    }
}

/// A generated mannequin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MannequinRecord {
    /// Owner.
    pub user_id: String,
    /// Chain key of the job that generated it.
    #[serde(default)]
    pub chain_key: String,
    /// URL of the generated model.
    pub model_url: String,
    /// Public URL of the body photo.
    pub image_url: String,
    /// First insert time.
    pub created_at: DateTime<Utc>,
    /// Last upsert time.
    pub updated_at: DateTime<Utc>,
}

impl MannequinRecord {
    /// Builds the record written when generation finishes.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        chain_key: impl Into<String>,
        model_url: impl Into<String>,
        file_name: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            chain_key: chain_key.into(),
            model_url: model_url.into(),
            image_url: format!("{MANNEQUIN_IMAGE_PREFIX}/{file_name}"),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Document store for finished records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts or replaces a garment, keeping an existing `created_at`.
    async fn upsert_garment(&self, record: GarmentRecord) -> Result<GarmentRecord>;

    /// Finds a garment by id.
    async fn find_garment(&self, cloth_id: &str) -> Result<Option<GarmentRecord>>;

    /// Inserts or replaces a user's mannequin, keeping an existing `created_at`.
    async fn upsert_mannequin(&self, record: MannequinRecord) -> Result<MannequinRecord>;

    /// Finds the mannequin of a user.
    async fn find_mannequin(&self, user_id: &str) -> Result<Option<MannequinRecord>>;

    /// Finds the mannequin generated under a chain key. A mannequin
    /// replaced by a newer one of the same user is no longer found.
    async fn find_mannequin_by_key(&self, chain_key: &str) -> Result<Option<MannequinRecord>>;

    /// Persists pending writes.
    async fn flush(&self) -> Result<()>;
}

/// In-memory record store.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    garments: DashMap<String, GarmentRecord>,
    mannequins: DashMap<String, MannequinRecord>,
}

impl MemoryRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored garments.
    #[must_use]
    pub fn garment_count(&self) -> usize {
        self.garments.len()
    }

    /// Number of stored mannequins.
    #[must_use]
    pub fn mannequin_count(&self) -> usize {
        self.mannequins.len()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert_garment(&self, mut record: GarmentRecord) -> Result<GarmentRecord> {
        let mut entry = self
            .garments
            .entry(record.cloth_id.clone())
            .or_insert_with(|| record.clone());
        record.created_at = entry.created_at;
        *entry = record.clone();
        Ok(record)
    }

    async fn find_garment(&self, cloth_id: &str) -> Result<Option<GarmentRecord>> {
        Ok(self.garments.get(cloth_id).map(|r| r.value().clone()))
    }

    async fn upsert_mannequin(&self, mut record: MannequinRecord) -> Result<MannequinRecord> {
        let mut entry = self
            .mannequins
            .entry(record.user_id.clone())
            .or_insert_with(|| record.clone());
        record.created_at = entry.created_at;
        *entry = record.clone();
        Ok(record)
    }

    async fn find_mannequin(&self, user_id: &str) -> Result<Option<MannequinRecord>> {
        Ok(self.mannequins.get(user_id).map(|r| r.value().clone()))
    }

    async fn find_mannequin_by_key(&self, chain_key: &str) -> Result<Option<MannequinRecord>> {
        Ok(self
            .mannequins
            .iter()
            .find(|r| r.chain_key == chain_key)
            .map(|r| r.value().clone()))
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn texture_payload() -> Cloth2TexPayload {
        Cloth2TexPayload {
            user_id: "user-1".into(),
            cloth_id: "cloth-42".into(),
            name: "Linen shirt".into(),
            description: String::new(),
            category: Category::Top,
            sub_category: SubCategory::Shirt,
            file_name_front: "f.jpg".into(),
            file_name_back: "b.jpg".into(),
            front_image_path: "/ai/f.png".into(),
            back_image_path: "/ai/b.png".into(),
            front_json_path: "/ai/f.json".into(),
            back_json_path: "/ai/b.json".into(),
            front_vis_path: None,
            back_vis_path: None,
        }
    }

    #[test]
    fn test_garment_image_urls() {
        let record = GarmentRecord::from_texture(&texture_payload(), "http://cdn/t.glb");
        assert_eq!(record.image_url_front, "/images/clothes/f.jpg");
        assert_eq!(record.image_url_back, "/images/clothes/b.jpg");
        assert!(record.has_model());
    }

    #[test]
    fn test_mannequin_image_url() {
        let record = MannequinRecord::new("user-1", "m-key", "http://cdn/m.glb", "body.jpg");
        assert_eq!(record.image_url, "/images/mannequins/body.jpg");
    }

    #[tokio::test]
    async fn test_upsert_keeps_created_at() {
        let store = MemoryRecordStore::new();
        let first = store
            .upsert_garment(GarmentRecord::from_texture(&texture_payload(), "v1"))
            .await
            .unwrap();

        let mut second = GarmentRecord::from_texture(&texture_payload(), "v2");
        second.created_at = first.created_at + chrono::Duration::hours(1);
        let saved = store.upsert_garment(second).await.unwrap();

        assert_eq!(saved.created_at, first.created_at);
        assert_eq!(saved.model_url, "v2");
        assert_eq!(store.garment_count(), 1);

        let found = store.find_garment("cloth-42").await.unwrap().unwrap();
        assert_eq!(found, saved);
    }

    #[tokio::test]
    async fn test_mannequin_upsert_by_user() {
        let store = MemoryRecordStore::new();
        store
            .upsert_mannequin(MannequinRecord::new("u", "k1", "m1", "a.jpg"))
            .await
            .unwrap();
        store
            .upsert_mannequin(MannequinRecord::new("u", "k2", "m2", "b.jpg"))
            .await
            .unwrap();

        assert_eq!(store.mannequin_count(), 1);
        let found = store.find_mannequin("u").await.unwrap().unwrap();
        assert_eq!(found.model_url, "m2");
        assert!(store.find_mannequin("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_mannequin_by_chain_key() {
        let store = MemoryRecordStore::new();
        store
            .upsert_mannequin(MannequinRecord::new("u", "k1", "m1", "a.jpg"))
            .await
            .unwrap();
        store
            .upsert_mannequin(MannequinRecord::new("v", "k2", "m2", "b.jpg"))
            .await
            .unwrap();

        let found = store.find_mannequin_by_key("k2").await.unwrap().unwrap();
        assert_eq!(found.user_id, "v");
        assert_eq!(found.model_url, "m2");

        store
            .upsert_mannequin(MannequinRecord::new("u", "k3", "m3", "c.jpg"))
            .await
            .unwrap();
        assert!(store.find_mannequin_by_key("k1").await.unwrap().is_none());
        assert_eq!(store.find_mannequin_by_key("k3").await.unwrap().unwrap().model_url, "m3");
    }
}
