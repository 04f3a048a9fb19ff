//! Iteration retention: evict the oldest iteration once the cache holds the
//! configured number of distinct iterations.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::{BOOTSTRAP_MAX_RETRY_INTERVAL, BOOTSTRAP_MIN_RETRY_INTERVAL};
use crate::meta::MetaStore;
use crate::types::{BatchFilter, CacheError, CacheResult, CheckpointState, ITERATION_UNKNOWN};
use crate::NodeState;

/// Poll interval while waiting for the reconciler to finish a deletion.
const DELETION_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// FIFO of iteration numbers seen for records owned by this node.
pub struct IterationManager {
    max_iterations: usize,
    queue: Mutex<VecDeque<u64>>,
    /// Serializes the whole evaluate-evict-push sequence so two new
    /// iterations cannot be admitted past the cap concurrently.
    admission: AsyncMutex<()>,
}

impl IterationManager {
    pub fn new(max_iterations: usize) -> Arc<Self> {
        Arc::new(IterationManager {
            max_iterations,
            queue: Mutex::new(VecDeque::new()),
            admission: AsyncMutex::new(()),
        })
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn total(&self) -> usize {
        self.queue.lock().expect("iteration queue lock").len()
    }

    pub fn oldest(&self) -> Option<u64> {
        self.queue
            .lock()
            .expect("iteration queue lock")
            .front()
            .copied()
    }

    pub fn last(&self) -> Option<u64> {
        self.queue
            .lock()
            .expect("iteration queue lock")
            .back()
            .copied()
    }

    pub fn exists(&self, iteration: u64) -> bool {
        self.queue
            .lock()
            .expect("iteration queue lock")
            .contains(&iteration)
    }

    pub fn push(&self, iteration: u64) {
        let mut queue = self.queue.lock().expect("iteration queue lock");
        tracing::debug!(
            iteration,
            total = queue.len(),
            oldest = queue.front().copied().unwrap_or(u64::MAX),
            "push iteration"
        );
        queue.push_back(iteration);
    }

    pub fn pop_oldest(&self) {
        self.queue.lock().expect("iteration queue lock").pop_front();
    }

    pub fn snapshot(&self) -> Vec<u64> {
        self.queue
            .lock()
            .expect("iteration queue lock")
            .iter()
            .copied()
            .collect()
    }
}

/// Admit an iteration tag for a newly created checkpoint, evicting the oldest
/// iteration first when the cap is reached. Returns a human-readable note
/// when an eviction ran.
pub async fn admit(state: &Arc<NodeState>, iteration: &str) -> CacheResult<Option<String>> {
    // Non-numeric tags (including "unknown") sit outside retention entirely.
    if iteration == ITERATION_UNKNOWN {
        return Ok(None);
    }
    let Ok(parsed) = iteration.parse::<u64>() else {
        tracing::warn!(iteration, "iteration tag is not numeric, skipping retention");
        return Ok(None);
    };

    let iterations = state.iterations.clone();
    let _guard = iterations.admission.lock().await;
    if iterations.exists(parsed) {
        return Ok(None);
    }

    let mut note = None;
    if iterations.total() >= iterations.max_iterations() {
        let oldest = iterations
            .oldest()
            .ok_or_else(|| anyhow!("iteration queue empty at capacity"))?;
        tracing::warn!(
            max = iterations.max_iterations(),
            total = iterations.total(),
            oldest,
            "exceeded max iterations in cache"
        );
        note = Some(format!(
            "exceed max iteration: {}, delete only the oldest iteration: {oldest} in-memory, \
             persistent checkpoints are kept",
            iterations.max_iterations()
        ));
        delete_oldest(state, oldest).await?;
    }
    iterations.push(parsed);
    Ok(note)
}

/// Evict every owned record tagged with `oldest`: wait for transient states
/// to settle, mark OBSOLESCENT, enqueue for the reconciler, and poll until
/// the resident entry is gone.
async fn delete_oldest(state: &Arc<NodeState>, oldest: u64) -> CacheResult<()> {
    let filter = BatchFilter::by_rank_and_iteration(state.world.node_rank, oldest.to_string());
    let records = state.meta.batch_load(&filter).map_err(|err| match err {
        CacheError::NotFound => {
            CacheError::Unknown(anyhow!("no records found for oldest iteration {oldest}"))
        }
        other => other,
    })?;

    for mut metadata in records {
        // A record mid-replication or mid-persistence must settle before it
        // can be marked for deletion.
        let mut wait = BOOTSTRAP_MIN_RETRY_INTERVAL;
        loop {
            let replicating =
                metadata.state == CheckpointState::Cached && state.world.world_size > 1;
            let persisting = metadata.state == CheckpointState::BackedUp
                && state.persistence.enabled();
            if !replicating && !persisting {
                break;
            }
            tracing::info!(
                file = %metadata.filename,
                state = %metadata.state,
                wait_s = wait.as_secs(),
                "waiting for transient state to settle before eviction"
            );
            tokio::time::sleep(wait).await;
            wait = (wait * 2).min(BOOTSTRAP_MAX_RETRY_INTERVAL);
            metadata = state.meta.load(&metadata.filename)?;
        }

        state
            .meta
            .update_state(&metadata.filename, CheckpointState::Obsolescent)?;
        state.operator.add_rate_limited(&metadata.filename).await;

        while state.registry.load(&metadata).is_some() {
            tracing::debug!(file = %metadata.filename, "waiting for deletion to complete");
            tokio::time::sleep(DELETION_POLL_INTERVAL).await;
        }
        tracing::info!(file = %metadata.filename, "evicted from cache");
    }

    state.iterations.pop_oldest();
    Ok(())
}
