//! Helpers for in-process multi-node tests: every "node" is a full
//! `NodeState` with its own peer listener, reconciler, and memory budget,
//! sharing one metadata store the way the fleet shares its metadata service.

// Each test binary uses its own subset of these helpers.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;

use ckpt_cache::config::Config;
use ckpt_cache::memory::MemoryMonitor;
use ckpt_cache::meta::MetaStore;
use ckpt_cache::peer_client::TcpRingClient;
use ckpt_cache::peer_server;
use ckpt_cache::reconcile::ReconcileTask;
use ckpt_cache::registry::StorageRegistry;
use ckpt_cache::types::{CheckpointState, Metadata};
use ckpt_cache::NodeState;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(20);

/// Reserve a port by binding to an ephemeral one and dropping the socket.
pub fn pick_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

pub struct NodeOptions<'a> {
    pub rank: i64,
    pub world_size: i64,
    pub hosts: &'a str,
    pub tcp_port: u16,
    pub storage_root: &'a Path,
    pub mem_limit: u64,
    pub persist: bool,
}

/// Build one node and start its background machinery and peer listener.
/// Readiness (and bootstrap, when a test wants it) stays with the caller.
pub async fn spawn_node(
    options: NodeOptions<'_>,
    meta: Arc<dyn MetaStore>,
) -> Arc<NodeState> {
    let config = Config::parse_from([
        "ckpt-cache-node",
        "--job-name",
        "test-job",
        "--node-rank",
        &options.rank.to_string(),
        "--world-size",
        &options.world_size.to_string(),
        "--hosts",
        options.hosts,
        "--tcp-port",
        &options.tcp_port.to_string(),
        "--storage-root",
        options.storage_root.to_str().unwrap(),
        "--enable-persistent",
        if options.persist { "on" } else { "off" },
    ]);
    let world = config.world().expect("world geometry");
    let monitor = MemoryMonitor::new(Some(options.mem_limit));
    let registry = StorageRegistry::new(options.rank, monitor.clone());
    let ring = TcpRingClient::new(world, monitor.clone(), registry.clone());
    let state = NodeState::assemble(config, meta, monitor, registry, ring).expect("assemble node");

    state.operator.set_handler(ReconcileTask::new(state.clone()));
    state.operator.run();
    state.loader.start();

    let listener = peer_server::bind(options.tcp_port)
        .await
        .expect("bind peer listener");
    tokio::spawn(peer_server::serve(state.clone(), listener));

    state
}

/// Create a CACHED record on `state` with the given payload, registered in
/// memory and saved in the metadata store, as the ingest surface would.
pub fn create_cached(state: &Arc<NodeState>, filename: &str, iteration: &str, payload: &[u8]) -> Metadata {
    let metadata = Metadata {
        job: state.world.job_name.clone(),
        filename: filename.to_string(),
        node_rank: state.world.node_rank,
        iteration: iteration.to_string(),
        state: CheckpointState::Cached,
        size: payload.len() as u64,
    };
    state.meta.save(&metadata).expect("save metadata");
    let region = state.monitor.try_allocate(&metadata).expect("allocate region");
    region.write_at(0, payload).expect("write payload");
    state.registry.save(&metadata, region).expect("register region");
    metadata
}

/// Poll the metadata store until the record reaches `target`.
pub async fn wait_for_state(
    meta: &Arc<dyn MetaStore>,
    filename: &str,
    target: CheckpointState,
) {
    let start = Instant::now();
    loop {
        if let Ok(record) = meta.load(filename) {
            if record.state == target {
                return;
            }
        }
        if start.elapsed() > WAIT_TIMEOUT {
            let last = meta.load(filename).map(|m| m.state.to_string());
            panic!("timed out waiting for {filename} to reach {target}, last state {last:?}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Read the resident bytes for a record out of a node's registry.
pub fn resident_bytes(state: &Arc<NodeState>, metadata: &Metadata) -> Option<Vec<u8>> {
    let region = state.registry.load(metadata)?;
    let mut out = vec![0u8; region.len()];
    region.read_at(0, &mut out).ok()?;
    Some(out)
}
