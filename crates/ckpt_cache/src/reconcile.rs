//! The reconcile handler: one legal state transition per tick.
//!
//! Doing one thing at a time keeps replication fast while the long-tail
//! persistence trails behind: a CACHED record replicates and comes back for
//! persistence on a later tick. Backup replicas are passive and are only
//! touched here once their owner marks them OBSOLESCENT.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::REPLICATION_RETRY_DELAY;
use crate::meta::MetaStore;
use crate::operator::ReconcileHandler;
use crate::peer_client::RingClient;
use crate::types::{CacheError, CheckpointState, Metadata};
use crate::NodeState;

pub struct ReconcileTask {
    state: Arc<NodeState>,
}

impl ReconcileTask {
    pub fn new(state: Arc<NodeState>) -> Arc<Self> {
        Arc::new(ReconcileTask { state })
    }

    fn update_state(&self, metadata: &Metadata, target: CheckpointState) -> bool {
        if metadata.state == target {
            return true;
        }
        match self.state.meta.update_state(&metadata.filename, target) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(
                    file = %metadata.filename,
                    target = %target,
                    error = %err,
                    "cannot update checkpoint state"
                );
                false
            }
        }
    }

    async fn persist(&self, metadata: &Metadata) -> bool {
        let Some(region) = self.state.registry.load(metadata) else {
            tracing::error!(file = %metadata.filename, "data entry vanished before persistence");
            return false;
        };
        match self.state.persistence.write(&metadata.filename, region).await {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(file = %metadata.filename, error = %err, "persistence failed");
                false
            }
        }
    }

    async fn replicate(&self, metadata: &Metadata, only_metadata: bool) -> bool {
        let region = if only_metadata {
            None
        } else {
            self.state.registry.load(metadata)
        };
        match self.state.ring.backup(metadata, region, only_metadata).await {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(
                    file = %metadata.filename,
                    error = %err,
                    "backup to remote node failed"
                );
                false
            }
        }
    }
}

#[async_trait]
impl ReconcileHandler for ReconcileTask {
    /// Returns `true` when the key is terminal for this tick.
    async fn reconcile(&self, key: &str) -> bool {
        let state = &self.state;
        tracing::info!(key, "start reconcile");

        let metadata = match state.meta.load(key) {
            Ok(metadata) => metadata,
            Err(CacheError::NotFound) => {
                tracing::warn!(key, "record not found in database, no longer reconcile");
                return true;
            }
            Err(err) => {
                tracing::error!(key, error = %err, "load metadata failed, retry");
                return false;
            }
        };

        // Backup data is passive; its transitions are driven by the owner.
        if metadata.node_rank != state.world.node_rank
            && metadata.state != CheckpointState::Obsolescent
        {
            tracing::info!(
                file = %metadata.filename,
                owner = metadata.node_rank,
                "backup file, skip reconciliation"
            );
            return true;
        }

        // The record must have bytes behind it before anything else happens.
        let complete = metadata.size > 0 && state.registry.load(&metadata).is_some();
        if !complete {
            if metadata.state == CheckpointState::Obsolescent {
                return true;
            }
            tracing::error!(
                file = %metadata.filename,
                state = %metadata.state,
                "data incomplete, marking record broken"
            );
            if !self.update_state(&metadata, CheckpointState::Broken) {
                return false;
            }
            // Broken records are never reconciled again.
            return true;
        }

        match metadata.state {
            CheckpointState::Pending => {
                tracing::info!(file = %metadata.filename, "ignore pending checkpoint");
                true
            }

            CheckpointState::Cached => {
                if state.world.world_size < 2 {
                    tracing::info!(file = %metadata.filename, "start persistence");
                    if !self.persist(&metadata).await {
                        return false;
                    }
                } else {
                    tracing::info!(file = %metadata.filename, "start backup to successor");
                    if !self.replicate(&metadata, false).await {
                        // State unchanged; pause before the retry tick.
                        tokio::time::sleep(REPLICATION_RETRY_DELAY).await;
                        return false;
                    }
                }
                let next = if state.world.world_size > 1 {
                    CheckpointState::BackedUp
                } else {
                    CheckpointState::Persistent
                };
                if !self.update_state(&metadata, next) {
                    return false;
                }
                tracing::info!(file = %metadata.filename, next = %next, "re-enqueue");
                false
            }

            CheckpointState::BackedUp => {
                tracing::info!(file = %metadata.filename, "start persistence");
                if !self.persist(&metadata).await {
                    return false;
                }
                if !self.update_state(&metadata, CheckpointState::Persistent) {
                    return false;
                }
                tracing::info!(file = %metadata.filename, "checkpoint persistent");
                true
            }

            CheckpointState::Persistent => {
                tracing::debug!(file = %metadata.filename, "ignore persistent checkpoint");
                true
            }

            CheckpointState::Obsolescent => {
                tracing::info!(file = %metadata.filename, "obsolescent, deleting local data");
                if state.world.world_size > 1 && metadata.node_rank == state.world.node_rank {
                    // Metadata-only backup: the successor enqueues the same
                    // key and runs its own deletion.
                    if !self.replicate(&metadata, true).await {
                        tokio::time::sleep(REPLICATION_RETRY_DELAY).await;
                        return false;
                    }
                }
                if !state.registry.delete(&metadata) {
                    tracing::error!(file = %metadata.filename, "failed to delete from registry");
                    return false;
                }
                true
            }

            CheckpointState::Broken => {
                tracing::error!(file = %metadata.filename, "record broken, no longer reconciled");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::memory::{MemoryMonitor, Region};
    use crate::meta::{MetaStore, SqliteMetaStore};
    use crate::registry::StorageRegistry;
    use crate::types::{BatchFilter, CacheResult};
    use clap::Parser;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Ring client that records calls and answers from a script.
    struct FakeRing {
        backups: Mutex<Vec<(String, bool)>>,
        fail_backups: std::sync::atomic::AtomicBool,
    }

    impl FakeRing {
        fn new() -> Arc<Self> {
            Arc::new(FakeRing {
                backups: Mutex::new(Vec::new()),
                fail_backups: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl crate::peer_client::RingClient for FakeRing {
        async fn backup(
            &self,
            metadata: &Metadata,
            _region: Option<Arc<Region>>,
            only_metadata: bool,
        ) -> CacheResult<()> {
            if self.fail_backups.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(CacheError::OutOfMemory);
            }
            self.backups
                .lock()
                .unwrap()
                .push((metadata.filename.clone(), only_metadata));
            Ok(())
        }

        async fn load_remote(
            &self,
            _filename: &str,
            _rank: i64,
            _only_metadata: bool,
        ) -> CacheResult<Metadata> {
            Err(CacheError::NotFound)
        }

        async fn batch_load_remote(
            &self,
            _filter: &BatchFilter,
            _only_metadata: bool,
        ) -> CacheResult<Vec<Metadata>> {
            Ok(Vec::new())
        }

        async fn notify_backup(&self) -> CacheResult<()> {
            Ok(())
        }
    }

    struct Fixture {
        state: Arc<NodeState>,
        task: Arc<ReconcileTask>,
        ring: Arc<FakeRing>,
        _dir: TempDir,
    }

    fn fixture(world_size: i64, persist: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = Config::parse_from([
            "ckpt-cache-node",
            "--job-name",
            "j",
            "--node-rank",
            "0",
            "--world-size",
            &world_size.to_string(),
            "--hosts",
            &"a,b,c,d"[..(world_size as usize * 2 - 1)],
            "--storage-root",
            dir.path().to_str().unwrap(),
            "--enable-persistent",
            if persist { "on" } else { "off" },
        ]);
        let meta = SqliteMetaStore::open_in_memory("j").unwrap();
        let monitor = MemoryMonitor::new(Some(1 << 20));
        let registry = StorageRegistry::new(0, monitor.clone());
        let ring = FakeRing::new();
        let state =
            NodeState::assemble(config, meta, monitor, registry, ring.clone()).unwrap();
        let task = ReconcileTask::new(state.clone());
        Fixture {
            state,
            task,
            ring,
            _dir: dir,
        }
    }

    fn cached_record(fixture: &Fixture, filename: &str, size: u64) -> Metadata {
        let metadata = Metadata {
            job: "j".into(),
            filename: filename.into(),
            node_rank: 0,
            iteration: "1".into(),
            state: CheckpointState::Cached,
            size,
        };
        fixture.state.meta.save(&metadata).unwrap();
        let region = fixture.state.monitor.try_allocate(&metadata).unwrap();
        region.write_at(0, &vec![0xAB; size as usize]).unwrap();
        fixture.state.registry.save(&metadata, region).unwrap();
        metadata
    }

    #[tokio::test]
    async fn missing_record_is_terminal() {
        let fixture = fixture(1, true);
        assert!(fixture.task.reconcile("/never-created").await);
    }

    #[tokio::test]
    async fn foreign_live_record_is_passive() {
        let fixture = fixture(2, true);
        let metadata = Metadata {
            job: "j".into(),
            filename: "/theirs".into(),
            node_rank: 1,
            iteration: "1".into(),
            state: CheckpointState::Cached,
            size: 8,
        };
        fixture.state.meta.save(&metadata).unwrap();
        assert!(fixture.task.reconcile("/theirs").await);
        assert!(fixture.ring.backups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_data_breaks_the_record_once() {
        let fixture = fixture(1, true);
        let metadata = Metadata {
            job: "j".into(),
            filename: "/no-bytes".into(),
            node_rank: 0,
            iteration: "1".into(),
            state: CheckpointState::Cached,
            size: 8,
        };
        fixture.state.meta.save(&metadata).unwrap();

        assert!(fixture.task.reconcile("/no-bytes").await);
        assert_eq!(
            fixture.state.meta.load("/no-bytes").unwrap().state,
            CheckpointState::Broken
        );
        // A later tick sees BROKEN and does nothing further.
        assert!(fixture.task.reconcile("/no-bytes").await);
        assert_eq!(
            fixture.state.meta.load("/no-bytes").unwrap().state,
            CheckpointState::Broken
        );
    }

    #[tokio::test]
    async fn single_node_cached_record_persists() {
        let fixture = fixture(1, true);
        let metadata = cached_record(&fixture, "/ckpt/a", 64);

        // CACHED -> PERSISTENT, then re-enqueued once.
        assert!(!fixture.task.reconcile("/ckpt/a").await);
        assert_eq!(
            fixture.state.meta.load("/ckpt/a").unwrap().state,
            CheckpointState::Persistent
        );
        let durable = fixture.state.persistence.path_for(&metadata.filename);
        assert_eq!(std::fs::metadata(&durable).unwrap().len(), 64);

        // The follow-up tick is a no-op.
        assert!(fixture.task.reconcile("/ckpt/a").await);
    }

    #[tokio::test]
    async fn disabled_persistence_leaves_a_placeholder() {
        let fixture = fixture(1, false);
        let metadata = cached_record(&fixture, "/ckpt/a", 64);

        assert!(!fixture.task.reconcile("/ckpt/a").await);
        assert_eq!(
            fixture.state.meta.load("/ckpt/a").unwrap().state,
            CheckpointState::Persistent
        );
        let durable = fixture.state.persistence.path_for(&metadata.filename);
        assert_eq!(std::fs::metadata(&durable).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn replication_advances_to_backed_up_then_persists() {
        let fixture = fixture(2, true);
        cached_record(&fixture, "/ckpt/a", 64);

        assert!(!fixture.task.reconcile("/ckpt/a").await);
        assert_eq!(
            fixture.state.meta.load("/ckpt/a").unwrap().state,
            CheckpointState::BackedUp
        );
        assert_eq!(
            fixture.ring.backups.lock().unwrap().as_slice(),
            &[("/ckpt/a".to_string(), false)]
        );

        assert!(fixture.task.reconcile("/ckpt/a").await);
        assert_eq!(
            fixture.state.meta.load("/ckpt/a").unwrap().state,
            CheckpointState::Persistent
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_replication_keeps_state_and_retries() {
        let fixture = fixture(2, true);
        cached_record(&fixture, "/ckpt/a", 64);
        fixture
            .ring
            .fail_backups
            .store(true, std::sync::atomic::Ordering::SeqCst);

        assert!(!fixture.task.reconcile("/ckpt/a").await);
        assert_eq!(
            fixture.state.meta.load("/ckpt/a").unwrap().state,
            CheckpointState::Cached
        );

        // Once the successor has room again, the transition goes through.
        fixture
            .ring
            .fail_backups
            .store(false, std::sync::atomic::Ordering::SeqCst);
        assert!(!fixture.task.reconcile("/ckpt/a").await);
        assert_eq!(
            fixture.state.meta.load("/ckpt/a").unwrap().state,
            CheckpointState::BackedUp
        );
    }

    #[tokio::test]
    async fn owned_obsolescent_propagates_then_deletes() {
        let fixture = fixture(2, true);
        let metadata = cached_record(&fixture, "/ckpt/a", 64);
        fixture
            .state
            .meta
            .update_state("/ckpt/a", CheckpointState::Obsolescent)
            .unwrap();

        assert!(fixture.task.reconcile("/ckpt/a").await);
        assert_eq!(
            fixture.ring.backups.lock().unwrap().as_slice(),
            &[("/ckpt/a".to_string(), true)]
        );
        assert!(fixture.state.registry.load(&metadata).is_none());
    }

    #[tokio::test]
    async fn backup_obsolescent_deletes_without_propagating() {
        let fixture = fixture(2, true);
        let metadata = Metadata {
            job: "j".into(),
            filename: "/ckpt/b".into(),
            node_rank: 1,
            iteration: "1".into(),
            state: CheckpointState::Obsolescent,
            size: 32,
        };
        fixture.state.meta.save(&metadata).unwrap();
        let region = fixture.state.monitor.try_allocate(&metadata).unwrap();
        fixture.state.registry.save(&metadata, region).unwrap();

        assert!(fixture.task.reconcile("/ckpt/b").await);
        assert!(fixture.ring.backups.lock().unwrap().is_empty());
        assert!(fixture.state.registry.load(&metadata).is_none());
    }
}
