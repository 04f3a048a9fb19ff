//! Startup negotiation with the ring neighbours.
//!
//! A restarted node has durable metadata but an empty resident set. Two tasks
//! run in parallel:
//! - pull: fetch every record this node owns back from the successor (which
//!   holds the backups), falling back to the durable file system once the
//!   retry budget is exhausted;
//! - push: ask the predecessor to re-replicate its owned records to us, since
//!   we are its successor and lost its backups.
//!
//! Only after both finish is the client-facing surface marked ready.

use std::sync::Arc;
use std::time::Instant;

use crate::config::{BOOTSTRAP_MAX_RETRY_INTERVAL, BOOTSTRAP_MIN_RETRY_INTERVAL};
use crate::meta::MetaStore;
use crate::peer_client::RingClient;
use crate::types::{BatchFilter, CacheError, CheckpointState, ITERATION_UNKNOWN};
use crate::NodeState;

/// Run the bootstrap dance. Returns once local state is recovered and the
/// predecessor has re-replicated, or immediately for a single-node world.
pub async fn run(state: Arc<NodeState>) {
    if state.config.bootstrap_skipped() {
        tracing::warn!("bootstrap skipped by configuration");
        return;
    }
    if state.world.world_size < 2 {
        tracing::warn!(world_size = state.world.world_size, "world too small, skip bootstrap");
        return;
    }

    tracing::info!("bootstrap start");
    let start = Instant::now();

    let pull = tokio::spawn(pull_task(state.clone()));
    let push = tokio::spawn(push_task(state.clone()));
    let (pull, push) = tokio::join!(pull, push);
    if let Err(err) = pull {
        tracing::error!(error = %err, "bootstrap pull task panicked");
    }
    if let Err(err) = push {
        tracing::error!(error = %err, "bootstrap push task panicked");
    }

    tracing::info!(elapsed_s = start.elapsed().as_secs(), "bootstrap complete");
}

/// Recover owned records from the successor, then from the file system.
async fn pull_task(state: Arc<NodeState>) {
    let mut wait = BOOTSTRAP_MIN_RETRY_INTERVAL;
    while wait <= BOOTSTRAP_MAX_RETRY_INTERVAL {
        if retrieve_from_successor(&state).await {
            return;
        }
        tokio::time::sleep(wait).await;
        wait *= 2;
    }
    if retrieve_from_file_system(&state).await {
        tracing::info!("recovered checkpoints from the file system");
    } else {
        tracing::error!("file system fallback failed, owned records stay unrecovered");
    }
}

async fn retrieve_from_successor(state: &Arc<NodeState>) -> bool {
    tracing::info!("try retrieving checkpoints from the successor");
    let filter = BatchFilter::by_rank(state.world.node_rank);
    match state.ring.batch_load_remote(&filter, false).await {
        Ok(records) => {
            tracing::info!(count = records.len(), "retrieved checkpoints from successor");
            true
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to retrieve checkpoints from successor, retry");
            false
        }
    }
}

/// Ask the predecessor to push its owned records back to us. Retries until it
/// answers; a predecessor that is itself restarting will refuse until its own
/// pull finished.
async fn push_task(state: Arc<NodeState>) {
    let mut wait = BOOTSTRAP_MIN_RETRY_INTERVAL;
    loop {
        match state.ring.notify_backup().await {
            Ok(()) => {
                tracing::info!("predecessor notified to re-replicate");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot notify predecessor, retry");
            }
        }
        tokio::time::sleep(wait).await;
        wait = (wait * 2).min(BOOTSTRAP_MAX_RETRY_INTERVAL);
    }
}

/// Rebuild owned records straight from durable storage. Also restores the
/// iteration queue, which lives nowhere else.
async fn retrieve_from_file_system(state: &Arc<NodeState>) -> bool {
    tracing::info!("try retrieving checkpoints from the file system");
    let filter = BatchFilter::by_rank(state.world.node_rank);
    let records = match state.meta.batch_load(&filter) {
        Ok(records) => records,
        Err(CacheError::NotFound) => {
            tracing::info!("no owned records to recover");
            return true;
        }
        Err(err) => {
            tracing::error!(error = %err, "metadata listing failed");
            return false;
        }
    };

    for metadata in records {
        if metadata.state == CheckpointState::Obsolescent {
            continue;
        }
        if metadata.iteration != ITERATION_UNKNOWN {
            if let Ok(iteration) = metadata.iteration.parse::<u64>() {
                if !state.iterations.exists(iteration) {
                    state.iterations.push(iteration);
                }
            }
        }
        let region = match state.monitor.try_allocate(&metadata) {
            Ok(region) => region,
            Err(err) => {
                tracing::error!(file = %metadata.filename, error = %err, "allocation failed");
                return false;
            }
        };
        if let Err(err) = state
            .persistence
            .load_into_region(&metadata.filename, region.clone())
            .await
        {
            tracing::error!(file = %metadata.filename, error = %err, "durable read failed");
            return false;
        }
        if let Err(err) = state.registry.save(&metadata, region) {
            tracing::error!(file = %metadata.filename, error = %err, "registry save failed");
            return false;
        }
    }
    true
}
