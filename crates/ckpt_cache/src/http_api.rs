//! Intra-node HTTP surface for training clients.
//!
//! Endpoints:
//! - POST /createMetadata - allocate a region and create the record
//! - POST /updateMetadata - advance the record state (typically to CACHED)
//! - POST /getMetadata    - resolve a record to a local (pid, memfd) handle
//! - GET  /getAllMetadata - diagnostic dump of the metadata table
//! - GET  /getAllStorage  - diagnostic dump of the resident-set maps
//!
//! Every data-path handler gates on bootstrap readiness; the response always
//! carries a status, a human message, and the last-known state integer.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::config::CHECK_BOOTSTRAP_RETRY_INTERVAL;
use crate::iteration;
use crate::meta::MetaStore;
use crate::types::{BatchFilter, CacheError, CheckpointState, Metadata};
use crate::NodeState;

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub filename: String,
    pub checkpointstate: i64,
    pub iteration: String,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub filename: String,
    pub checkpointstate: i64,
}

#[derive(Debug, Deserialize)]
pub struct GetRequest {
    pub filename: String,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub status: String,
    pub message: String,
    pub checkpointstate: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memfd: Option<i32>,
}

impl ApiResponse {
    fn ok(message: impl Into<String>, state: i64) -> Self {
        let message = message.into();
        tracing::info!(message = %message, "http ok");
        ApiResponse {
            status: "OK".into(),
            message: format!("server: {message}"),
            checkpointstate: state,
            pid: None,
            memfd: None,
        }
    }

    fn error(message: impl Into<String>, state: i64) -> Self {
        let message = message.into();
        tracing::error!(message = %message, "http error");
        ApiResponse {
            status: "ERROR".into(),
            message: format!("server: {message}"),
            checkpointstate: state,
            pid: None,
            memfd: None,
        }
    }

    fn with_entry(mut self, pid: i32, memfd: i32) -> Self {
        self.pid = Some(pid);
        self.memfd = Some(memfd);
        self
    }
}

#[derive(Debug, Serialize)]
struct MetadataRow {
    filename: String,
    noderank: i64,
    iteration: String,
    checkpointstate: i64,
    size: u64,
}

#[derive(Debug, Serialize)]
struct MetadataDump {
    status: String,
    metadata: Vec<MetadataRow>,
}

#[derive(Debug, Serialize)]
struct StorageRow {
    filename: String,
    address: u64,
    pid: i32,
    memfd: i32,
}

#[derive(Debug, Serialize)]
struct StorageDump {
    status: String,
    dict: Vec<StorageRow>,
    backup_dict: Vec<StorageRow>,
}

pub fn router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/createMetadata", post(create_metadata))
        .route("/updateMetadata", post(update_metadata))
        .route("/getMetadata", post(get_metadata))
        .route("/getAllMetadata", get(get_all_metadata))
        .route("/getAllStorage", get(get_all_storage))
        .with_state(state)
}

/// Bind and serve the intra-node surface. Bind failure is fatal at startup.
pub async fn serve(state: Arc<NodeState>, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("bind http listener on port {port}"))?;
    tracing::info!(port, "intra-node http surface listening");
    axum::serve(listener, router(state))
        .await
        .context("serve http")
}

fn not_ready_response() -> ApiResponse {
    ApiResponse::error(
        format!(
            "bootstrap timed out in {}s and did not complete, check the server",
            CHECK_BOOTSTRAP_RETRY_INTERVAL.as_secs()
        ),
        -1,
    )
}

async fn create_metadata(
    State(state): State<Arc<NodeState>>,
    Json(request): Json<CreateRequest>,
) -> Json<ApiResponse> {
    if !state.wait_ready().await {
        return Json(not_ready_response());
    }
    let requested_state =
        CheckpointState::from_i64(request.checkpointstate).unwrap_or(CheckpointState::Pending);
    let metadata = Metadata {
        job: state.world.job_name.clone(),
        filename: request.filename.clone(),
        node_rank: state.world.node_rank,
        iteration: request.iteration.clone(),
        state: requested_state,
        size: request.size,
    };

    // Retention first: admitting this iteration may evict the oldest one.
    let note = match iteration::admit(&state, &request.iteration).await {
        Ok(note) => note,
        Err(err) => {
            return Json(ApiResponse::error(
                format!("delete oldest iteration failed: {err}"),
                -1,
            ));
        }
    };

    let region = match state.registry.load(&metadata) {
        Some(existing) => {
            tracing::debug!(file = %metadata.filename, "region exists, re-truncating");
            match state.monitor.try_resize(&metadata, &existing) {
                Ok(None) => existing,
                Ok(Some(replacement)) => {
                    if let Err(err) = state.registry.save(&metadata, replacement.clone()) {
                        return Json(ApiResponse::error(
                            format!("registry save failed: {err}"),
                            request.checkpointstate,
                        ));
                    }
                    replacement
                }
                Err(CacheError::OutOfMemory) => {
                    return Json(ApiResponse::error(
                        "allocation failed: out of memory",
                        request.checkpointstate,
                    ));
                }
                Err(err) => {
                    return Json(ApiResponse::error(
                        format!("resize failed: {err}"),
                        request.checkpointstate,
                    ));
                }
            }
        }
        None => match state.monitor.try_allocate(&metadata) {
            Ok(region) => {
                if let Err(err) = state.registry.save(&metadata, region.clone()) {
                    return Json(ApiResponse::error(
                        format!("registry save failed: {err}"),
                        request.checkpointstate,
                    ));
                }
                region
            }
            Err(CacheError::OutOfMemory) => {
                return Json(ApiResponse::error(
                    "allocation failed: out of memory",
                    request.checkpointstate,
                ));
            }
            Err(err) => {
                return Json(ApiResponse::error(
                    format!("allocation failed: {err}"),
                    request.checkpointstate,
                ));
            }
        },
    };

    if let Err(err) = state.meta.save(&metadata) {
        return Json(ApiResponse::error(
            format!("save metadata failed: {err}"),
            request.checkpointstate,
        ));
    }

    let entry = region.entry();
    let message = match note {
        Some(note) => format!("metadata created; {note}"),
        None => "metadata created".to_string(),
    };
    Json(ApiResponse::ok(message, request.checkpointstate).with_entry(entry.pid, entry.memfd))
}

async fn update_metadata(
    State(state): State<Arc<NodeState>>,
    Json(request): Json<UpdateRequest>,
) -> Json<ApiResponse> {
    if !state.wait_ready().await {
        return Json(not_ready_response());
    }
    let Some(next) = CheckpointState::from_i64(request.checkpointstate) else {
        return Json(ApiResponse::error(
            format!("unknown checkpoint state {}", request.checkpointstate),
            -1,
        ));
    };
    if let Err(err) = state.meta.update_state(&request.filename, next) {
        return Json(ApiResponse::error(
            format!("update metadata state failed: {err}"),
            request.checkpointstate - 1,
        ));
    }
    state.operator.add_rate_limited(&request.filename).await;
    Json(ApiResponse::ok(
        "metadata updated",
        request.checkpointstate,
    ))
}

async fn get_metadata(
    State(state): State<Arc<NodeState>>,
    Json(request): Json<GetRequest>,
) -> Json<ApiResponse> {
    if !state.wait_ready().await {
        return Json(not_ready_response());
    }
    let metadata = match state.meta.load(&request.filename) {
        Ok(metadata) => metadata,
        Err(err) => {
            return Json(ApiResponse::error(
                format!("get metadata failed, does the file exist? ({err})"),
                -1,
            ));
        }
    };

    // A record in one of these states has no readable bytes anywhere.
    if matches!(
        metadata.state,
        CheckpointState::Broken | CheckpointState::Obsolescent | CheckpointState::Pending
    ) {
        tracing::warn!(file = %metadata.filename, state = %metadata.state, "record is not readable");
        return Json(ApiResponse::error(
            format!("checkpoint state is {}", metadata.state),
            metadata.state.as_i64(),
        ));
    }

    // If we are the owner's successor the bytes already sit in the backup
    // map; otherwise a foreign record must be fetched from its owner first.
    let backed_up_here =
        state.world.successor_of(metadata.node_rank) == state.world.node_rank;
    if !backed_up_here && metadata.node_rank != state.world.node_rank {
        if let Err(err) = state
            .loader
            .fetch(&request.filename, metadata.node_rank)
            .await
        {
            return Json(ApiResponse::error(
                format!("remote fetch failed: {err}"),
                metadata.state.as_i64(),
            ));
        }
    }

    match state.registry.load(&metadata) {
        Some(region) => {
            let entry = region.entry();
            Json(
                ApiResponse::ok("metadata resolved", metadata.state.as_i64())
                    .with_entry(entry.pid, entry.memfd),
            )
        }
        None => Json(ApiResponse::error(
            "in-memory checkpoint does not exist locally or as backup",
            metadata.state.as_i64(),
        )),
    }
}

async fn get_all_metadata(State(state): State<Arc<NodeState>>) -> Json<MetadataDump> {
    let rows = match state.meta.batch_load(&BatchFilter::default()) {
        Ok(records) => records
            .into_iter()
            .map(|m| MetadataRow {
                filename: m.filename,
                noderank: m.node_rank,
                iteration: m.iteration,
                checkpointstate: m.state.as_i64(),
                size: m.size,
            })
            .collect(),
        Err(CacheError::NotFound) => Vec::new(),
        Err(err) => {
            tracing::error!(error = %err, "metadata dump failed");
            return Json(MetadataDump {
                status: "ERROR".into(),
                metadata: Vec::new(),
            });
        }
    };
    Json(MetadataDump {
        status: "OK".into(),
        metadata: rows,
    })
}

async fn get_all_storage(State(state): State<Arc<NodeState>>) -> Json<StorageDump> {
    let (owned, backup) = state.registry.snapshot();
    let to_rows = |entries: Vec<(String, crate::types::DataEntry)>| {
        entries
            .into_iter()
            .map(|(filename, entry)| StorageRow {
                filename,
                address: entry.address,
                pid: entry.pid,
                memfd: entry.memfd,
            })
            .collect()
    };
    Json(StorageDump {
        status: "OK".into(),
        dict: to_rows(owned),
        backup_dict: to_rows(backup),
    })
}
