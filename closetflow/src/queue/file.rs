//! Durable queue store persisted as a JSON file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::store::{JobCounts, MemoryQueueStore, QueueStore};
use crate::core::{Job, JobState};
use crate::errors::Result;

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    jobs: Vec<Job>,
}

/// A [`MemoryQueueStore`] mirrored to a JSON file after every mutation.
///
/// On open, jobs that were `active` when the previous process stopped are
/// returned to `waiting` without counting the interrupted attempt.
#[derive(Debug)]
pub struct FileQueueStore {
    path: PathBuf,
    inner: MemoryQueueStore,
    write_lock: tokio::sync::Mutex<()>,
    recovered: usize,
}

impl FileQueueStore {
    /// Opens the store at `path`, creating parent directories as needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut jobs = match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice::<QueueFile>(&bytes)?.jobs,
            Ok(_) => Vec::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();
        let mut recovered = 0;
        for job in jobs.iter_mut().filter(|job| job.state == JobState::Active) {
            job.state = JobState::Waiting;
            job.available_at = now;
            recovered += 1;
        }
        if recovered > 0 {
            info!(path = %path.display(), recovered, "Recovered interrupted jobs");
        }

        let store = Self {
            path,
            inner: MemoryQueueStore::from_jobs(jobs),
            write_lock: tokio::sync::Mutex::new(()),
            recovered,
        };
        store.persist().await?;
        Ok(store)
    }

    /// Number of active jobs returned to waiting at open.
    #[must_use]
    pub fn recovered(&self) -> usize {
        self.recovered
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let file = QueueFile {
            jobs: self.inner.snapshot(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), jobs = file.jobs.len(), "Persisted queue");
        Ok(())
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn insert(&self, job: Job) -> Result<Job> {
        let job = self.inner.insert(job).await?;
        self.persist().await?;
        Ok(job)
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        self.inner.get(id).await
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let claimed = self.inner.claim_next(now).await?;
        if claimed.is_some() {
            self.persist().await?;
        }
        Ok(claimed)
    }

    async fn update(&self, job: Job) -> Result<()> {
        self.inner.update(job).await?;
        self.persist().await
    }

    async fn remove(&self, id: &str) -> Result<Option<Job>> {
        let removed = self.inner.remove(id).await?;
        if removed.is_some() {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn ids_by_recency(&self, states: &[JobState]) -> Result<Vec<String>> {
        self.inner.ids_by_recency(states).await
    }

    async fn counts(&self) -> Result<JobCounts> {
        self.inner.counts().await
    }

    async fn flush(&self) -> Result<()> {
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JobOptions;
    use crate::stages::MannequinPayload;
    use pretty_assertions::assert_eq;

    fn job(id: &str) -> Job {
        Job::new(
            id,
            "mannequinGenerationQueue",
            MannequinPayload {
                user_id: "u".into(),
                image: PathBuf::from("/data/m.jpg"),
                file_name: "m.jpg".into(),
            }
            .into(),
            JobOptions::new(),
            0,
        )
    }

    #[tokio::test]
    async fn test_open_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileQueueStore::open(dir.path().join("nested/q.json")).await.unwrap();

        assert_eq!(store.counts().await.unwrap().total(), 0);
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn test_jobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.json");

        {
            let store = FileQueueStore::open(&path).await.unwrap();
            store.insert(job("a")).await.unwrap();
            store.insert(job("b")).await.unwrap();
        }

        let store = FileQueueStore::open(&path).await.unwrap();
        assert_eq!(store.recovered(), 0);
        assert_eq!(
            store.ids_by_recency(&[JobState::Waiting]).await.unwrap(),
            vec!["b", "a"]
        );
        let c = store.insert(job("c")).await.unwrap();
        assert_eq!(c.seq, 3);
    }

    #[tokio::test]
    async fn test_reopen_recovers_active_jobs_without_counting_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.json");

        {
            let store = FileQueueStore::open(&path).await.unwrap();
            store.insert(job("interrupted")).await.unwrap();
            let claimed = store.claim_next(Utc::now()).await.unwrap().unwrap();
            assert_eq!(claimed.state, JobState::Active);
        }

        let store = FileQueueStore::open(&path).await.unwrap();
        assert_eq!(store.recovered(), 1);

        let job = store.get("interrupted").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(store.claim_next(Utc::now()).await.unwrap().unwrap().id, "interrupted");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.json");
        std::fs::write(&path, b"{not json").unwrap();

        assert!(FileQueueStore::open(&path).await.is_err());
    }
}
