//! Distributed in-memory checkpoint cache for large-scale training jobs.
//!
//! One service instance runs per training node; instances form a logical
//! ring ordered by node rank. A checkpoint write lands in memfd-backed shared
//! memory, replicates to the ring successor, then persists asynchronously to
//! durable storage, keeping disk I/O off the training critical path. Reads
//! locate any checkpoint in the fleet and stream it into local shared memory
//! on demand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

pub mod bootstrap;
pub mod bulk;
pub mod config;
pub mod http_api;
pub mod iteration;
pub mod loader;
pub mod memory;
pub mod meta;
pub mod operator;
pub mod peer_client;
pub mod peer_server;
pub mod persist;
pub mod reconcile;
pub mod registry;
pub mod types;
pub mod wire;

use config::{Config, World, BOOTSTRAP_MIN_RETRY_INTERVAL, CHECK_BOOTSTRAP_RETRY_INTERVAL};
use iteration::IterationManager;
use loader::RemoteFileLoader;
use memory::MemoryMonitor;
use meta::{MetaStore, SqliteMetaStore};
use operator::Operator;
use peer_client::{RingClient, TcpRingClient};
use persist::Persistence;
use registry::StorageRegistry;

/// Everything one node shares between its surfaces and background tasks.
///
/// Constructed once at startup; each component is built here and handed down,
/// so tests can swap any seam (metadata store, ring client) for a fake.
pub struct NodeState {
    pub config: Config,
    pub world: World,
    pub meta: Arc<dyn MetaStore>,
    pub monitor: Arc<MemoryMonitor>,
    pub registry: Arc<StorageRegistry>,
    pub operator: Arc<Operator>,
    pub persistence: Arc<Persistence>,
    pub ring: Arc<dyn RingClient>,
    pub loader: Arc<RemoteFileLoader>,
    pub iterations: Arc<IterationManager>,
    ready: AtomicBool,
}

impl NodeState {
    /// Build a node with the default component set: SQLite metadata store and
    /// TCP ring client.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.storage_root).with_context(|| {
            format!("create storage root {}", config.storage_root.display())
        })?;
        let meta = SqliteMetaStore::open(config.db_path(), config.job_name.clone())?;
        let world = config.world()?;
        let monitor = MemoryMonitor::new(config.user_mem_limit_bytes());
        let registry = StorageRegistry::new(world.node_rank, monitor.clone());
        let ring = TcpRingClient::new(world.clone(), monitor.clone(), registry.clone());
        Self::assemble(config, meta, monitor, registry, ring)
    }

    /// Wire a node from externally built components.
    pub fn assemble(
        config: Config,
        meta: Arc<dyn MetaStore>,
        monitor: Arc<MemoryMonitor>,
        registry: Arc<StorageRegistry>,
        ring: Arc<dyn RingClient>,
    ) -> Result<Arc<Self>> {
        let world = config.world()?;
        let operator = Operator::new();
        let persistence = Persistence::new(&config.storage_root, config.persist_enabled());
        let loader = RemoteFileLoader::new(ring.clone());
        let iterations = IterationManager::new(config.max_iterations);
        Ok(Arc::new(NodeState {
            config,
            world,
            meta,
            monitor,
            registry,
            operator,
            persistence,
            ring,
            loader,
            iterations,
            ready: AtomicBool::new(false),
        }))
    }

    /// Flip the readiness flag once bootstrap has finished.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
        tracing::info!("node marked ready");
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Wait for bootstrap to finish, backing off exponentially. Returns false
    /// once the bounded wait is exhausted.
    pub async fn wait_ready(&self) -> bool {
        let mut wait = BOOTSTRAP_MIN_RETRY_INTERVAL;
        while !self.is_ready() {
            if wait > CHECK_BOOTSTRAP_RETRY_INTERVAL {
                return false;
            }
            tracing::info!(wait_s = wait.as_secs(), "waiting for bootstrap to complete");
            tokio::time::sleep(wait).await;
            wait *= 2;
        }
        true
    }
}
