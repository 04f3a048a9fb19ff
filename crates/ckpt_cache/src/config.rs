//! Node configuration and cluster identity.
//!
//! Everything here comes from the environment (with CLI overrides) because the
//! service is launched by a job scheduler, not by hand. `TRANSOM_*` variables
//! carry the cluster identity handed down by the trainer launcher; the
//! `CKPT_ENGINE_*` variables tune the engine itself.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;

/// Work queue depth; submissions past this block the submitter.
pub const WORKQUEUE_CAPACITY: usize = 10_000;

/// Reconciler enqueue rate limit, permits per second.
pub const RATE_LIMITER_RATE: f64 = 500.0;

/// Concurrent reconciliation workers.
pub const OPERATOR_WORKERS: usize = 8;

/// Bulk transfer chunk size. One completion is observed per chunk.
pub const CHUNK_SIZE: u64 = 1 << 30;

/// First completion-poll interval; doubles up to [`POLL_MAX`].
pub const POLL_MIN: Duration = Duration::from_millis(25);
pub const POLL_MAX: Duration = Duration::from_millis(200);

/// Synchronization tokens closing a bulk transfer.
pub const TOKEN_WRITE: &str = "W";
pub const TOKEN_READ: &str = "R";

pub const BOOTSTRAP_MIN_RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const BOOTSTRAP_MAX_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Concurrent transfers during bootstrap, sized to drive multiple NICs.
pub const BOOTSTRAP_CONCURRENCY: usize = 8;

/// Cap on how long a client-facing request waits for bootstrap to finish.
pub const CHECK_BOOTSTRAP_RETRY_INTERVAL: Duration = Duration::from_secs(50);

/// Delay before retrying a failed replication from the reconciler.
pub const REPLICATION_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Remote-file loader request queue depth.
pub const LOADER_QUEUE_CAPACITY: usize = 4;

/// Remote-file loader readiness poll interval.
pub const LOADER_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Give up waiting for a remote fetch after this long.
pub const LOADER_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Interval between cgroup statistics refreshes.
pub const MEM_WATCH_PERIOD: Duration = Duration::from_secs(1_000_000);

pub const DEFAULT_TCP_PORT: u16 = 18080;
pub const DEFAULT_HTTP_PORT: u16 = 15345;

/// Node options. Every flag falls back to the corresponding environment
/// variable so the scheduler can configure the service without arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "ckpt-cache-node")]
pub struct Config {
    /// Tenant key of the training job.
    #[arg(long, env = "TRANSOM_JOBNAME", default_value = "test-job")]
    pub job_name: String,

    /// Rank of this node within the job.
    #[arg(long, env = "TRANSOM_RANK", default_value_t = 0)]
    pub node_rank: i64,

    /// Number of nodes in the job.
    #[arg(long, env = "TRANSOM_WORLD_SIZE", default_value_t = 1)]
    pub world_size: i64,

    /// Comma-separated hostnames ordered by rank. An entry may carry an
    /// explicit `host:port` to override the peer port.
    #[arg(long, env = "TRANSOM_HOSTS", default_value = "127.0.0.1")]
    pub hosts: String,

    /// Peer protocol listen port.
    #[arg(long, env = "CKPT_ENGINE_TCP_PORT", default_value_t = DEFAULT_TCP_PORT)]
    pub tcp_port: u16,

    /// Intra-node HTTP listen port.
    #[arg(long, env = "CKPT_ENGINE_HTTP_PORT", default_value_t = DEFAULT_HTTP_PORT)]
    pub http_port: u16,

    /// Root directory for durable checkpoint bytes.
    #[arg(long, env = "CKPT_ENGINE_STORAGE_ROOT", default_value = ".")]
    pub storage_root: PathBuf,

    /// Metadata database path. Defaults to `<storage_root>/ckpt-metadata.db`.
    #[arg(long, env = "CKPT_ENGINE_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Cache memory ceiling in GiB. Unbounded when unset.
    #[arg(long, env = "CKPT_ENGINE_MEM_LIMIT_GB")]
    pub mem_limit_gb: Option<u64>,

    /// Distinct iterations kept in cache before the oldest is evicted.
    #[arg(long, env = "CKPT_ENGINE_MAX_ITERATION_IN_CACHE", default_value_t = 999)]
    pub max_iterations: usize,

    /// "on" writes real payloads to durable storage; "off" writes empty
    /// placeholder files for downstream-reader compatibility.
    #[arg(long, env = "CKPT_ENGINE_ENABLE_PERSISTENT", default_value = "on")]
    pub enable_persistent: String,

    /// Debug only: "on" skips neighbour negotiation at startup.
    #[arg(long, env = "CKPT_ENGINE_SKIP_BOOTSTRAP", default_value = "off")]
    pub skip_bootstrap: String,
}

impl Config {
    pub fn persist_enabled(&self) -> bool {
        self.enable_persistent != "off"
    }

    pub fn bootstrap_skipped(&self) -> bool {
        self.skip_bootstrap == "on"
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.storage_root.join("ckpt-metadata.db"))
    }

    pub fn user_mem_limit_bytes(&self) -> Option<u64> {
        self.mem_limit_gb.map(|gb| gb * (1 << 30))
    }

    pub fn world(&self) -> Result<World> {
        let hosts: Vec<String> = self
            .hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();
        if self.world_size < 1 {
            bail!("world size must be at least 1, got {}", self.world_size);
        }
        if self.node_rank < 0 || self.node_rank >= self.world_size {
            bail!(
                "node rank {} outside world [0, {})",
                self.node_rank,
                self.world_size
            );
        }
        if (hosts.len() as i64) < self.world_size {
            bail!(
                "{} hosts configured for world size {}",
                hosts.len(),
                self.world_size
            );
        }
        Ok(World {
            job_name: self.job_name.clone(),
            node_rank: self.node_rank,
            world_size: self.world_size,
            hosts,
            tcp_port: self.tcp_port,
        })
    }
}

/// Training job world state: who we are and where the ring neighbours live.
#[derive(Debug, Clone)]
pub struct World {
    pub job_name: String,
    pub node_rank: i64,
    pub world_size: i64,
    pub hosts: Vec<String>,
    tcp_port: u16,
}

impl World {
    pub fn next_rank(&self) -> i64 {
        (self.node_rank + 1) % self.world_size
    }

    pub fn prev_rank(&self) -> i64 {
        (self.node_rank + self.world_size - 1) % self.world_size
    }

    /// Successor rank of the given owner; the rank that holds its backup.
    pub fn successor_of(&self, rank: i64) -> i64 {
        (rank + 1) % self.world_size
    }

    /// Peer address of a rank, appending the default port when the host entry
    /// does not carry one.
    pub fn addr_of_rank(&self, rank: i64) -> Result<String> {
        if rank < 0 || rank >= self.world_size {
            bail!("expect rank in [0, {}), got {}", self.world_size, rank);
        }
        let host = &self.hosts[rank as usize];
        if host.contains(':') {
            Ok(host.clone())
        } else {
            Ok(format!("{}:{}", host, self.tcp_port))
        }
    }

    pub fn next_addr(&self) -> Result<String> {
        self.addr_of_rank(self.next_rank())
    }

    pub fn prev_addr(&self) -> Result<String> {
        self.addr_of_rank(self.prev_rank())
    }
}
