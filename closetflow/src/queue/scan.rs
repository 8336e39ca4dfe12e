//! Lazy, restartable listing of queue jobs.

use futures::stream::{self, Stream};
use std::sync::Arc;

use super::store::QueueStore;
use crate::core::{Job, JobState};
use crate::errors::Result;

/// Cursor over the jobs of a queue in some states, most recent first.
///
/// The id list is taken on the first call to [`next`](Self::next); each job
/// is then fetched individually so records removed in the meantime are
/// skipped, and a job whose state changed out of the filter is skipped too.
pub struct JobScan {
    store: Arc<dyn QueueStore>,
    states: Vec<JobState>,
    ids: Option<Vec<String>>,
    position: usize,
}

impl JobScan {
    pub(crate) fn new(store: Arc<dyn QueueStore>, states: &[JobState]) -> Self {
        Self {
            store,
            states: states.to_vec(),
            ids: None,
            position: 0,
        }
    }

    /// Fetches the next matching job.
    pub async fn next(&mut self) -> Result<Option<Job>> {
        if self.ids.is_none() {
            self.ids = Some(self.store.ids_by_recency(&self.states).await?);
        }

        loop {
            let Some(id) = self.ids.as_ref().and_then(|ids| ids.get(self.position)).cloned() else {
                return Ok(None);
            };
            self.position += 1;

            if let Some(job) = self.store.get(&id).await? {
                if self.states.contains(&job.state) {
                    return Ok(Some(job));
                }
            }
        }
    }

    /// Restarts the scan; the id list is taken again on the next call.
    pub fn rewind(&mut self) {
        self.ids = None;
        self.position = 0;
    }

    /// Collects every remaining job.
    pub async fn collect(mut self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        while let Some(job) = self.next().await? {
            jobs.push(job);
        }
        Ok(jobs)
    }

    /// Adapts the scan into a stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<Job>> + Send {
        stream::unfold(self, |mut scan| async move {
            match scan.next().await {
                Ok(Some(job)) => Some((Ok(job), scan)),
                Ok(None) => None,
                Err(e) => Some((Err(e), scan)),
            }
        })
    }
}

impl std::fmt::Debug for JobScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScan")
            .field("states", &self.states)
            .field("position", &self.position)
            .finish()
    }
}
