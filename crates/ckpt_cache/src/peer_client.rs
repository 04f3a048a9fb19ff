//! Client side of the inter-node protocol.
//!
//! Each call opens a fresh connection to the target peer, sends the routine
//! id and request frame, reads the response frame, and runs the bulk-transfer
//! handshake when payload moves. The trait exists so the reconciler and
//! bootstrap can be exercised against a fake ring in tests.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::net::TcpStream;

use crate::bulk;
use crate::config::{World, BOOTSTRAP_CONCURRENCY, TOKEN_READ, TOKEN_WRITE};
use crate::memory::{MemoryMonitor, Region};
use crate::registry::StorageRegistry;
use crate::types::{
    BatchFilter, CacheError, CacheResult, DataEntry, Metadata, CODE_NOT_FOUND, CODE_SUCCESS,
};
use crate::wire::{
    self, BackupRequest, BackupResponse, BatchLoadRequest, BatchLoadResponse, LoadRequest,
    LoadResponse, NotifyBackupResponse, Routine,
};

/// Requests this node can issue around the ring.
#[async_trait]
pub trait RingClient: Send + Sync {
    /// Replicate a record to the ring successor. `region` carries the payload
    /// unless `only_metadata` is set.
    async fn backup(
        &self,
        metadata: &Metadata,
        region: Option<Arc<Region>>,
        only_metadata: bool,
    ) -> CacheResult<()>;

    /// Fetch a record from the node at `target_rank` (the owner for reads,
    /// the successor for bootstrap recovery). Unless `only_metadata`, the
    /// payload is streamed into a freshly allocated local region and
    /// registered in the storage registry under the record's true owner.
    async fn load_remote(
        &self,
        filename: &str,
        target_rank: i64,
        only_metadata: bool,
    ) -> CacheResult<Metadata>;

    /// Filtered metadata listing from the ring successor, following up with
    /// per-record loads when payloads are requested.
    async fn batch_load_remote(
        &self,
        filter: &BatchFilter,
        only_metadata: bool,
    ) -> CacheResult<Vec<Metadata>>;

    /// Ask the ring predecessor to re-replicate its owned records to us.
    async fn notify_backup(&self) -> CacheResult<()>;
}

pub struct TcpRingClient {
    world: World,
    monitor: Arc<MemoryMonitor>,
    registry: Arc<StorageRegistry>,
}

impl TcpRingClient {
    pub fn new(
        world: World,
        monitor: Arc<MemoryMonitor>,
        registry: Arc<StorageRegistry>,
    ) -> Arc<Self> {
        Arc::new(TcpRingClient {
            world,
            monitor,
            registry,
        })
    }

    async fn connect(&self, addr: &str) -> CacheResult<wire::Conn> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect to peer {addr}"))?;
        Ok(wire::framed(stream))
    }
}

#[async_trait]
impl RingClient for TcpRingClient {
    async fn backup(
        &self,
        metadata: &Metadata,
        region: Option<Arc<Region>>,
        only_metadata: bool,
    ) -> CacheResult<()> {
        let addr = self.world.next_addr().map_err(CacheError::Unknown)?;
        let mut conn = self.connect(&addr).await?;
        wire::send_routine(&mut conn, Routine::Backup).await?;

        let entry = region.as_ref().map_or(DataEntry::default(), |r| r.entry());
        let request = BackupRequest {
            metadata: metadata.clone(),
            entry,
            only_metadata,
        };
        wire::send(&mut conn, &request).await?;

        let response: BackupResponse = wire::recv(&mut conn).await?;
        CacheError::check(response.code)?;

        if !only_metadata {
            let region = region
                .ok_or_else(|| anyhow!("backup of {} without a local region", metadata.filename))?;
            let mut session = bulk::handshake(&mut conn, false, region).await?;
            session.remote_write(0, 0, metadata.size).await?;
            bulk::send_token(&mut conn, TOKEN_WRITE).await?;
        }
        tracing::debug!(file = %metadata.filename, only_metadata, "backup to successor done");
        Ok(())
    }

    async fn load_remote(
        &self,
        filename: &str,
        target_rank: i64,
        only_metadata: bool,
    ) -> CacheResult<Metadata> {
        let addr = self
            .world
            .addr_of_rank(target_rank)
            .map_err(CacheError::Unknown)?;
        let mut conn = self.connect(&addr).await?;
        wire::send_routine(&mut conn, Routine::Load).await?;

        let mut key = Metadata::key(self.world.job_name.clone(), filename);
        key.node_rank = target_rank;
        let request = LoadRequest {
            metadata: key,
            only_metadata,
        };
        wire::send(&mut conn, &request).await?;

        let response: LoadResponse = wire::recv(&mut conn).await?;
        CacheError::check(response.code)?;
        if only_metadata {
            return Ok(response.metadata);
        }

        let region = self.monitor.try_allocate(&response.metadata)?;
        self.registry.save(&response.metadata, region.clone())?;
        let mut session = bulk::handshake(&mut conn, false, region).await?;
        session.remote_read(0, 0, response.metadata.size).await?;
        bulk::send_token(&mut conn, TOKEN_READ).await?;
        tracing::debug!(file = %filename, target_rank, "loaded checkpoint from remote node");
        Ok(response.metadata)
    }

    async fn batch_load_remote(
        &self,
        filter: &BatchFilter,
        only_metadata: bool,
    ) -> CacheResult<Vec<Metadata>> {
        let addr = self.world.next_addr().map_err(CacheError::Unknown)?;
        let mut conn = self.connect(&addr).await?;
        wire::send_routine(&mut conn, Routine::BatchLoad).await?;
        let request = BatchLoadRequest {
            filter: filter.clone(),
            only_metadata,
        };
        wire::send(&mut conn, &request).await?;

        let response: BatchLoadResponse = wire::recv(&mut conn).await?;
        if response.code == CODE_NOT_FOUND {
            // Nothing matched on the peer; that is a complete answer.
            return Ok(Vec::new());
        }
        CacheError::check(response.code)?;

        if only_metadata {
            return Ok(response.items.into_iter().map(|i| i.metadata).collect());
        }

        // The batch response names the records; payloads arrive through
        // follow-up LOADs against the successor (who holds the backups),
        // several at a time to use every NIC.
        let target = self.world.next_rank();
        let results: Vec<CacheResult<Metadata>> = stream::iter(response.items)
            .map(|item| {
                let filename = item.metadata.filename.clone();
                async move { self.load_remote(&filename, target, false).await }
            })
            .buffer_unordered(BOOTSTRAP_CONCURRENCY)
            .collect()
            .await;

        let mut loaded = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(metadata) => loaded.push(metadata),
                Err(err) => {
                    tracing::error!(error = %err, "batch load of one record failed");
                    return Err(err);
                }
            }
        }
        Ok(loaded)
    }

    async fn notify_backup(&self) -> CacheResult<()> {
        let addr = self.world.prev_addr().map_err(CacheError::Unknown)?;
        let mut conn = self.connect(&addr).await?;
        wire::send_routine(&mut conn, Routine::NotifyBackup).await?;
        let response: NotifyBackupResponse = wire::recv(&mut conn).await?;
        if response.code == CODE_SUCCESS || response.code == CODE_NOT_FOUND {
            // A predecessor with no owned records has nothing to push back.
            return Ok(());
        }
        CacheError::check(response.code)
    }
}
