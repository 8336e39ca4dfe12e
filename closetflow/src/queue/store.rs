//! Storage backends for job queues.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::core::{Job, JobState};
use crate::errors::{PipelineError, Result};

/// Number of jobs per state held by a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    /// Waiting jobs, including those delayed by backoff.
    pub waiting: usize,
    /// Jobs held by a worker slot.
    pub active: usize,
    /// Retained completed jobs.
    pub completed: usize,
    /// Retained failed jobs.
    pub failed: usize,
}

impl JobCounts {
    /// Total number of jobs held.
    #[must_use]
    pub fn total(&self) -> usize {
        self.waiting + self.active + self.completed + self.failed
    }

    fn bump(&mut self, state: JobState) {
        match state {
            JobState::Waiting => self.waiting += 1,
            JobState::Active => self.active += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
        }
    }
}

/// Backing storage of one queue.
///
/// Implementations must make `insert` and `claim_next` atomic: two callers
/// can never both insert the same id, and a waiting job is handed to at
/// most one claimer.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Inserts a new job, assigning its sequence number.
    ///
    /// Fails with `DuplicateJob` if the id is already held.
    async fn insert(&self, job: Job) -> Result<Job>;

    /// Returns a job by id.
    async fn get(&self, id: &str) -> Result<Option<Job>>;

    /// Moves the oldest ready waiting job to active and returns it.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>>;

    /// Replaces a held job.
    ///
    /// Fails with `JobNotFound` if the id is not held.
    async fn update(&self, job: Job) -> Result<()>;

    /// Removes a job, returning it if it was held.
    async fn remove(&self, id: &str) -> Result<Option<Job>>;

    /// Ids of jobs in the given states, most recent first.
    async fn ids_by_recency(&self, states: &[JobState]) -> Result<Vec<String>>;

    /// Per-state job counts.
    async fn counts(&self) -> Result<JobCounts>;

    /// Persists pending changes. A no-op for volatile stores.
    async fn flush(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct StoreState {
    jobs: HashMap<String, Job>,
    /// Waiting jobs ordered by insertion sequence.
    waiting: BTreeSet<(u64, String)>,
    next_seq: u64,
}

impl StoreState {
    fn index(&mut self, job: &Job) {
        if job.state == JobState::Waiting {
            self.waiting.insert((job.seq, job.id.clone()));
        }
    }

    fn unindex(&mut self, job: &Job) {
        self.waiting.remove(&(job.seq, job.id.clone()));
    }
}

/// Volatile in-memory queue store.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    state: Mutex<StoreState>,
}

impl MemoryQueueStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding previously persisted jobs.
    #[must_use]
    pub fn from_jobs(jobs: Vec<Job>) -> Self {
        let mut state = StoreState::default();
        for job in jobs {
            state.next_seq = state.next_seq.max(job.seq);
            state.index(&job);
            state.jobs.insert(job.id.clone(), job);
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// Returns every held job in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Job> {
        let state = self.state.lock();
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.seq);
        jobs
    }

    /// Returns the number of held jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Returns true if no jobs are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().jobs.is_empty()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn insert(&self, mut job: Job) -> Result<Job> {
        let mut state = self.state.lock();
        if state.jobs.contains_key(&job.id) {
            return Err(PipelineError::duplicate(job.queue, job.id));
        }

        state.next_seq += 1;
        job.seq = state.next_seq;
        state.index(&job);
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.state.lock().jobs.get(id).cloned())
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut state = self.state.lock();
        let ready = state
            .waiting
            .iter()
            .find(|(_, id)| state.jobs.get(id).is_some_and(|job| job.is_ready(now)))
            .cloned();

        let Some(key) = ready else {
            return Ok(None);
        };
        state.waiting.remove(&key);

        let Some(job) = state.jobs.get_mut(&key.1) else {
            return Ok(None);
        };
        job.state = JobState::Active;
        job.processed_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn update(&self, job: Job) -> Result<()> {
        let mut state = self.state.lock();
        let Some(previous) = state.jobs.remove(&job.id) else {
            return Err(PipelineError::job_not_found(job.queue, job.id));
        };
        state.unindex(&previous);
        state.index(&job);
        state.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<Option<Job>> {
        let mut state = self.state.lock();
        let removed = state.jobs.remove(id);
        if let Some(job) = &removed {
            state.unindex(job);
        }
        Ok(removed)
    }

    async fn ids_by_recency(&self, states: &[JobState]) -> Result<Vec<String>> {
        let state = self.state.lock();
        let mut matching: Vec<(u64, String)> = state
            .jobs
            .values()
            .filter(|job| states.contains(&job.state))
            .map(|job| (job.seq, job.id.clone()))
            .collect();
        matching.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        Ok(matching.into_iter().map(|(_, id)| id).collect())
    }

    async fn counts(&self) -> Result<JobCounts> {
        let state = self.state.lock();
        let mut counts = JobCounts::default();
        for job in state.jobs.values() {
            counts.bump(job.state);
        }
        Ok(counts)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JobOptions;
    use crate::stages::MannequinPayload;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn job(id: &str) -> Job {
        Job::new(
            id,
            "q",
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
    async fn test_insert_assigns_sequence() {
        let store = MemoryQueueStore::new();
        let a = store.insert(job("a")).await.unwrap();
        let b = store.insert(job("b")).await.unwrap();

        assert!(b.seq > a.seq);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_in_any_state() {
        let store = MemoryQueueStore::new();
        store.insert(job("a")).await.unwrap();

        let mut done = store.claim_next(Utc::now()).await.unwrap().unwrap();
        done.state = JobState::Failed;
        store.update(done).await.unwrap();

        let err = store.insert(job("a")).await.unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateJob { .. }));
    }

    #[tokio::test]
    async fn test_claim_is_fifo() {
        let store = MemoryQueueStore::new();
        for id in ["first", "second", "third"] {
            store.insert(job(id)).await.unwrap();
        }

        let mut claimed = Vec::new();
        while let Some(job) = store.claim_next(Utc::now()).await.unwrap() {
            assert_eq!(job.state, JobState::Active);
            assert!(job.processed_at.is_some());
            claimed.push(job.id);
        }
        assert_eq!(claimed, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_claim_skips_delayed_jobs() {
        let store = MemoryQueueStore::new();
        let mut delayed = job("delayed");
        delayed.available_at = Utc::now() + chrono::Duration::seconds(60);
        store.insert(delayed).await.unwrap();
        store.insert(job("ready")).await.unwrap();

        let claimed = store.claim_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, "ready");
        assert!(store.claim_next(Utc::now()).await.unwrap().is_none());

        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(store.claim_next(later).await.unwrap().unwrap().id, "delayed");
    }

    #[tokio::test]
    async fn test_concurrent_claims_hand_out_each_job_once() {
        let store = Arc::new(MemoryQueueStore::new());
        for i in 0..20 {
            store.insert(job(&format!("job-{i}"))).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(job) = store.claim_next(Utc::now()).await.unwrap() {
                    mine.push(job.id);
                }
                mine
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 20);
        assert_eq!(store.counts().await.unwrap().active, 20);
    }

    #[tokio::test]
    async fn test_update_returns_job_to_waiting_index() {
        let store = MemoryQueueStore::new();
        store.insert(job("a")).await.unwrap();

        let mut active = store.claim_next(Utc::now()).await.unwrap().unwrap();
        active.state = JobState::Waiting;
        store.update(active).await.unwrap();

        assert_eq!(store.claim_next(Utc::now()).await.unwrap().unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_update_unknown_job() {
        let store = MemoryQueueStore::new();
        let err = store.update(job("ghost")).await.unwrap_err();
        assert!(matches!(err, PipelineError::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn test_ids_by_recency_and_counts() {
        let store = MemoryQueueStore::new();
        for id in ["a", "b", "c"] {
            store.insert(job(id)).await.unwrap();
        }
        let mut a = store.claim_next(Utc::now()).await.unwrap().unwrap();
        a.state = JobState::Completed;
        store.update(a).await.unwrap();

        assert_eq!(
            store.ids_by_recency(&[JobState::Waiting]).await.unwrap(),
            vec!["c", "b"]
        );
        assert_eq!(
            store.ids_by_recency(&JobState::ALL).await.unwrap(),
            vec!["c", "b", "a"]
        );
        assert_eq!(
            store.counts().await.unwrap(),
            JobCounts {
                waiting: 2,
                active: 0,
                completed: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_remove_drops_waiting_index() {
        let store = MemoryQueueStore::new();
        store.insert(job("a")).await.unwrap();

        assert!(store.remove("a").await.unwrap().is_some());
        assert!(store.remove("a").await.unwrap().is_none());
        assert!(store.claim_next(Utc::now()).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_from_jobs_continues_sequence() {
        let mut restored = job("old");
        restored.seq = 41;
        let store = MemoryQueueStore::from_jobs(vec![restored]);

        let fresh = store.insert(job("new")).await.unwrap();
        assert_eq!(fresh.seq, 42);
    }
}
