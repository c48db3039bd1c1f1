//! Periodic ingest runs on the leader instance.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::pipeline::{IngestPipeline, RunTrigger};

/// Run the pipeline every `poll_interval` until `shutdown` is cancelled. The first run starts
/// immediately; a run that overruns the interval delays the next tick instead of queueing it.
pub async fn run_ingest_scheduler(pipeline: IngestPipeline, poll_interval: Duration, shutdown: CancellationToken) {
    info!(interval = ?poll_interval, "Ingest scheduler started");
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = pipeline.run(RunTrigger::Scheduled) => match result {
                Ok(Some(run)) => debug!(run_id = %run.id, fetched = run.fetched, "Scheduled ingest run complete"),
                Ok(None) => debug!("Scheduled ingest run skipped, another run is in progress"),
                Err(e) => error!(error = %e, "Scheduled ingest run failed"),
            },
        }
    }

    info!("Ingest scheduler stopped");
}
