//! Server side of the inter-node protocol.
//!
//! One acceptor task; one task per accepted connection, serving framed
//! requests serially until the peer hangs up. Every request is answered with
//! a status code; payload transfer happens through the bulk channel after the
//! response frame.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures_util::stream::{self, StreamExt};
use tokio::net::{TcpListener, TcpStream};

use crate::bulk;
use crate::config::{BOOTSTRAP_CONCURRENCY, TOKEN_READ, TOKEN_WRITE};
use crate::meta::MetaStore;
use crate::peer_client::RingClient;
use crate::types::{
    BatchFilter, CacheError, CheckpointState, DataEntry, Metadata, CODE_SUCCESS, CODE_UNKNOWN,
};
use crate::wire::{
    self, BackupRequest, BackupResponse, BatchLoadRequest, BatchLoadResponse, LoadRequest,
    LoadResponse, NotifyBackupResponse, Routine,
};
use crate::NodeState;

/// Bind the peer listener. Failure here is fatal at startup.
pub async fn bind(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("bind peer listener on port {port}"))
}

/// Accept loop. Runs until the process exits.
pub async fn serve(state: Arc<NodeState>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(state, stream).await {
                        tracing::debug!(peer = %peer, error = %err, "peer connection closed");
                    }
                });
            }
            Err(err) => {
                tracing::error!(error = %err, "accept failed");
            }
        }
    }
}

async fn handle_connection(state: Arc<NodeState>, stream: TcpStream) -> Result<()> {
    let mut conn = wire::framed(stream);
    while let Some(raw) = wire::recv_routine(&mut conn).await? {
        let Some(routine) = Routine::from_u64(raw) else {
            bail!("routine {raw} undefined");
        };
        tracing::debug!(routine = %routine, "dispatching peer request");
        match routine {
            Routine::Backup => handle_backup(&state, &mut conn).await?,
            Routine::Load => handle_load(&state, &mut conn).await?,
            Routine::BatchLoad => handle_batch_load(&state, &mut conn).await?,
            Routine::NotifyBackup => handle_notify_backup(&state, &mut conn).await?,
        }
    }
    Ok(())
}

/// BACKUP: admit the payload into the backup map and hand the writer a bulk
/// channel. The filename is enqueued afterwards so the fresh replica is
/// considered for its own downstream transitions.
async fn handle_backup(state: &Arc<NodeState>, conn: &mut wire::Conn) -> Result<()> {
    let request: BackupRequest = wire::recv(conn).await?;
    tracing::debug!(
        metadata = %request.metadata,
        entry = %request.entry,
        only_metadata = request.only_metadata,
        "inter-node backup request"
    );

    let mut code = CODE_SUCCESS;
    if !request.only_metadata && !state.monitor.has_room(request.metadata.size) {
        tracing::warn!(
            require = request.metadata.size,
            idle = state.monitor.stat().total_idle,
            "backup would overrun the memory budget"
        );
        code = CacheError::OutOfMemory.code();
    }

    wire::send(conn, &BackupResponse { code }).await?;
    if code != CODE_SUCCESS {
        return Ok(());
    }

    if !request.only_metadata {
        let region = match state.registry.load(&request.metadata) {
            Some(existing) => {
                tracing::debug!(file = %request.metadata.filename, "reusing resident memfd");
                match state.monitor.try_resize(&request.metadata, &existing) {
                    Ok(None) => existing,
                    Ok(Some(replacement)) => {
                        state.registry.save(&request.metadata, replacement.clone())?;
                        replacement
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            None => {
                let region = state.monitor.try_allocate(&request.metadata)?;
                state.registry.save(&request.metadata, region.clone())?;
                region
            }
        };

        let session = bulk::handshake(conn, true, region).await?;
        let token = session.serve().await?;
        if token != TOKEN_WRITE {
            bail!("write finish notification mismatch, expect {TOKEN_WRITE}, got {token}");
        }
    }

    state
        .operator
        .add_rate_limited(&request.metadata.filename)
        .await;
    Ok(())
}

/// LOAD: answer with metadata (and the data entry) and stream the region to
/// the reader over the bulk channel.
async fn handle_load(state: &Arc<NodeState>, conn: &mut wire::Conn) -> Result<()> {
    let request: LoadRequest = wire::recv(conn).await?;
    tracing::debug!(metadata = %request.metadata, only_metadata = request.only_metadata, "inter-node load request");

    let mut response = LoadResponse {
        metadata: request.metadata.clone(),
        entry: DataEntry::default(),
        code: CODE_SUCCESS,
    };
    let mut region = None;
    match state.meta.load(&request.metadata.filename) {
        Ok(metadata) => response.metadata = metadata,
        Err(err) => {
            tracing::error!(file = %request.metadata.filename, error = %err, "load metadata failed");
            response.code = err.code();
        }
    }
    if response.code == CODE_SUCCESS && !request.only_metadata {
        match state.registry.load(&response.metadata) {
            Some(resident) => {
                response.entry = resident.entry();
                region = Some(resident);
            }
            None => {
                tracing::error!(file = %response.metadata.filename, "no resident data entry for load");
                response.code = CODE_UNKNOWN;
            }
        }
    }

    wire::send(conn, &response).await?;
    if response.code != CODE_SUCCESS || request.only_metadata {
        return Ok(());
    }

    let session = bulk::handshake(conn, true, region.expect("resident region")).await?;
    let token = session.serve().await?;
    if token != TOKEN_READ {
        bail!("read finish notification mismatch, expect {TOKEN_READ}, got {token}");
    }
    Ok(())
}

/// BATCH_LOAD: filtered metadata listing with data entries attached. No bulk
/// transfer here; follow-up LOADs carry the payloads.
async fn handle_batch_load(state: &Arc<NodeState>, conn: &mut wire::Conn) -> Result<()> {
    let request: BatchLoadRequest = wire::recv(conn).await?;
    tracing::debug!(filter = ?request.filter, only_metadata = request.only_metadata, "inter-node batch-load request");

    let mut response = BatchLoadResponse {
        items: Vec::new(),
        code: CODE_SUCCESS,
    };
    match state.meta.batch_load(&request.filter) {
        Ok(records) => {
            for metadata in records {
                if metadata.state == CheckpointState::Obsolescent {
                    continue;
                }
                let mut item = LoadResponse {
                    metadata,
                    entry: DataEntry::default(),
                    code: CODE_SUCCESS,
                };
                if !request.only_metadata {
                    match state.registry.load(&item.metadata) {
                        Some(region) => item.entry = region.entry(),
                        None => {
                            tracing::error!(
                                file = %item.metadata.filename,
                                "data entry missing during batch load"
                            );
                            response.code = CODE_UNKNOWN;
                            break;
                        }
                    }
                }
                response.items.push(item);
            }
        }
        Err(CacheError::NotFound) => {
            tracing::info!("batch-load matched no records");
            response.code = CacheError::NotFound.code();
        }
        Err(err) => {
            tracing::error!(error = %err, "batch-load metadata failed");
            response.code = err.code();
        }
    }

    wire::send(conn, &response).await?;
    Ok(())
}

/// NOTIFY_BACKUP: re-replicate every owned record to the ring successor, so
/// a restarted successor regains its backups.
async fn handle_notify_backup(state: &Arc<NodeState>, conn: &mut wire::Conn) -> Result<()> {
    let mut response = NotifyBackupResponse { code: CODE_SUCCESS };

    let records = match state
        .meta
        .batch_load(&BatchFilter::by_rank(state.world.node_rank))
    {
        Ok(records) => records,
        Err(CacheError::NotFound) => {
            // Nothing owned here, so nothing to push to the successor.
            response.code = CacheError::NotFound.code();
            wire::send(conn, &response).await?;
            return Ok(());
        }
        Err(err) => {
            tracing::error!(error = %err, "batch-load for notify-backup failed");
            response.code = err.code();
            wire::send(conn, &response).await?;
            return Ok(());
        }
    };

    // A node that is still restoring its own regions must not fan out stale
    // data: every settled record needs its bytes resident.
    let settled = records
        .iter()
        .filter(|m| {
            matches!(
                m.state,
                CheckpointState::BackedUp | CheckpointState::Persistent
            )
        })
        .count();
    let resident = state.registry.owned_len();
    if settled != resident {
        tracing::error!(settled, resident, "refusing notify-backup while mid-restore");
        response.code = CODE_UNKNOWN;
        wire::send(conn, &response).await?;
        return Ok(());
    }

    let results: Vec<bool> = stream::iter(
        records
            .into_iter()
            .filter(|m| m.state != CheckpointState::Obsolescent),
    )
    .map(|metadata| {
        let state = state.clone();
        async move { backup_one(&state, &metadata).await }
    })
    .buffer_unordered(BOOTSTRAP_CONCURRENCY)
    .collect()
    .await;

    if results.iter().any(|ok| !ok) {
        response.code = CODE_UNKNOWN;
    }
    wire::send(conn, &response).await?;
    Ok(())
}

async fn backup_one(state: &Arc<NodeState>, metadata: &Metadata) -> bool {
    let Some(region) = state.registry.load(metadata) else {
        tracing::error!(file = %metadata.filename, "cannot load record from registry");
        return false;
    };
    match state.ring.backup(metadata, Some(region), false).await {
        Ok(()) => {
            tracing::debug!(file = %metadata.filename, "re-replicated to successor");
            true
        }
        Err(err) => {
            tracing::error!(file = %metadata.filename, error = %err, "re-replication failed");
            false
        }
    }
}
