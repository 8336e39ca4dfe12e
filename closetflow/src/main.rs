//! Closetflow worker process.
//!
//! Loads configuration from `CLOSETFLOW_*` variables, runs every stage
//! worker against the configured inference services and shuts down
//! gracefully on Ctrl-C or SIGTERM.

use anyhow::Context;
use std::sync::Arc;
use tracing::info;

use closetflow::config::PipelineConfig;
use closetflow::events::LoggingEventSink;
use closetflow::observability::init_tracing;
use closetflow::runtime::PipelineRuntime;
use closetflow::shutdown::wait_for_signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PipelineConfig::load().context("failed to load configuration")?;
    init_tracing(config.log_format);

    info!(
        ai_base = %config.ai_base,
        data_dir = %config.data_dir.display(),
        durable = config.queue_dir.is_some(),
        "Starting closetflow"
    );

    let grace = config.shutdown_grace();
    let runtime = PipelineRuntime::builder(config)
        .event_sink(Arc::new(LoggingEventSink::debug()))
        .build()
        .await
        .context("failed to build pipeline runtime")?;
    runtime.start().await;

    wait_for_signal().await;

    let report = runtime
        .shutdown(grace)
        .await
        .context("shutdown did not complete cleanly")?;
    if !report.drained {
        anyhow::bail!("{} in-flight jobs were aborted at shutdown", report.aborted);
    }
    Ok(())
}
