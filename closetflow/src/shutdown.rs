//! Graceful shutdown.
//!
//! Shutdown closes admission, lets workers finish what they hold within a
//! grace period, aborts whatever is left and flushes every store. Only the
//! entry queue of each chain is closed up front; successor queues keep
//! accepting hand-offs until the workers have stopped. A handler that
//! returned before the abort is always recorded: either completed, or failed
//! with its output preserved for the retry.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::errors::Result;
use crate::runtime::PipelineRuntime;

/// How long aborted slots get to exit.
const ABORT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// True if every worker drained within the grace period.
    pub drained: bool,
    /// In-flight invocations cancelled after the grace period.
    pub aborted: usize,
    /// Wall time spent shutting down.
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Drives the shutdown sequence of a [`PipelineRuntime`].
#[derive(Debug, Clone, Copy)]
pub struct ShutdownController {
    grace: Duration,
}

impl ShutdownController {
    /// Creates a controller with the given grace period.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// The grace period.
    #[must_use]
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Runs the shutdown sequence.
    pub async fn shutdown(&self, runtime: &PipelineRuntime) -> Result<ShutdownReport> {
        let started = Instant::now();
        info!(grace = ?self.grace, "Shutting down pipeline");

        for chain in runtime.chains() {
            if let Some(queue) = chain.first().and_then(|stage| runtime.queue(&stage.queue)) {
                queue.close();
            }
        }
        for worker in runtime.workers() {
            worker.stop();
        }

        let deadline = started + self.grace;
        let mut drained = true;
        for worker in runtime.workers() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !worker.join(remaining).await {
                drained = false;
            }
        }

        let mut aborted = 0;
        if !drained {
            for worker in runtime.workers() {
                aborted += worker.in_flight();
                worker.abort();
            }
            warn!(aborted, "Grace period expired; aborted in-flight jobs");
            for worker in runtime.workers() {
                if !worker.join(ABORT_JOIN_TIMEOUT).await {
                    error!(stage = %worker.stage().name, "Worker slots did not exit after abort");
                }
            }
        }

        for queue in runtime.queues() {
            queue.close();
            queue.flush().await?;
        }
        runtime.records().flush().await?;

        let report = ShutdownReport {
            drained,
            aborted,
            elapsed: started.elapsed(),
        };
        info!(
            drained = report.drained,
            aborted = report.aborted,
            elapsed = ?report.elapsed,
            "Pipeline shut down"
        );
        Ok(report)
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received terminate signal, shutting down"),
    }
}
