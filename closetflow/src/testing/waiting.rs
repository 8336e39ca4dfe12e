//! Polling helpers for jobs that settle on background workers.

use std::future::Future;
use std::time::Duration;

use crate::core::{Job, JobState};
use crate::errors::{PipelineError, Result};
use crate::queue::JobQueue;

const POLL: Duration = Duration::from_millis(10);

/// Polls `check` until it returns `Some`, or fails after `timeout`.
pub async fn wait_until<T, F, Fut>(timeout: Duration, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let polled = tokio::time::timeout(timeout, async {
        loop {
            if let Some(value) = check().await? {
                return Ok(value);
            }
            tokio::time::sleep(POLL).await;
        }
    })
    .await;
    match polled {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Cancelled(format!(
            "condition not met within {timeout:?}"
        ))),
    }
}

/// Waits until job `id` of `queue` reaches `state`.
pub async fn wait_for_state(
    queue: &JobQueue,
    id: &str,
    state: JobState,
    timeout: Duration,
) -> Result<Job> {
    wait_until(timeout, || async move {
        Ok::<_, PipelineError>(queue.get_job(id).await?.filter(|job| job.state == state))
    })
    .await
    .map_err(|_| {
        PipelineError::Cancelled(format!(
            "job '{id}' in '{}' did not reach {state} within {timeout:?}",
            queue.name()
        ))
    })
}
