//! End-to-end exercise of the intra-node HTTP surface on a single node:
//! create, write bytes, update to CACHED, watch the reconciler persist, then
//! read the handle back and dump diagnostics.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use ckpt_cache::http_api;
use ckpt_cache::meta::{MetaStore, SqliteMetaStore};
use ckpt_cache::types::{CheckpointState, Metadata};

use common::{pick_free_port, spawn_node, wait_for_state, NodeOptions};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn create_update_get_round_trip() {
    let tcp_port = pick_free_port();
    let http_port = pick_free_port();
    let dir = TempDir::new().unwrap();
    let meta: Arc<dyn MetaStore> = SqliteMetaStore::open_in_memory("test-job").unwrap();

    let state = spawn_node(
        NodeOptions {
            rank: 0,
            world_size: 1,
            hosts: "127.0.0.1",
            tcp_port,
            storage_root: dir.path(),
            mem_limit: 1 << 20,
            persist: true,
        },
        meta.clone(),
    )
    .await;
    state.mark_ready();

    let http_state = state.clone();
    tokio::spawn(async move {
        if let Err(err) = http_api::serve(http_state, http_port).await {
            panic!("http surface failed: {err}");
        }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let base = format!("http://127.0.0.1:{http_port}");
    let client = reqwest::Client::new();

    // create: allocate 16 bytes and return the region handle.
    let created: serde_json::Value = client
        .post(format!("{base}/createMetadata"))
        .json(&json!({
            "filename": "/ckpt/http-0",
            "checkpointstate": CheckpointState::Pending.as_i64(),
            "iteration": "1",
            "size": 16,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["status"], "OK", "create failed: {created}");
    assert_eq!(created["pid"], std::process::id() as i64);
    let memfd = created["memfd"].as_i64().unwrap();
    assert!(memfd > 0);

    // The client would now mmap /proc/<pid>/fd/<memfd> and copy bytes in;
    // here the registry region stands in for that mapping.
    let payload: Vec<u8> = (0u8..16).collect();
    let record = Metadata {
        job: "test-job".into(),
        filename: "/ckpt/http-0".into(),
        node_rank: 0,
        iteration: "1".into(),
        state: CheckpointState::Pending,
        size: 16,
    };
    let region = state.registry.load(&record).expect("region registered");
    assert_eq!(region.entry().memfd as i64, memfd);
    region.write_at(0, &payload).unwrap();

    // update to CACHED kicks off reconciliation.
    let updated: serde_json::Value = client
        .post(format!("{base}/updateMetadata"))
        .json(&json!({
            "filename": "/ckpt/http-0",
            "checkpointstate": CheckpointState::Cached.as_i64(),
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["status"], "OK", "update failed: {updated}");

    wait_for_state(&meta, "/ckpt/http-0", CheckpointState::Persistent).await;
    let durable = state.persistence.path_for("/ckpt/http-0");
    assert_eq!(std::fs::read(&durable).unwrap(), payload);

    // get returns the same handle.
    let fetched: serde_json::Value = client
        .post(format!("{base}/getMetadata"))
        .json(&json!({ "filename": "/ckpt/http-0" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["status"], "OK", "get failed: {fetched}");
    assert_eq!(
        fetched["checkpointstate"],
        CheckpointState::Persistent.as_i64()
    );
    assert_eq!(fetched["memfd"].as_i64().unwrap(), memfd);

    // Diagnostics list the record in both dumps.
    let all_meta: serde_json::Value = client
        .get(format!("{base}/getAllMetadata"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all_meta["status"], "OK");
    assert_eq!(all_meta["metadata"][0]["filename"], "/ckpt/http-0");

    let all_storage: serde_json::Value = client
        .get(format!("{base}/getAllStorage"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all_storage["status"], "OK");
    assert_eq!(all_storage["dict"][0]["filename"], "/ckpt/http-0");
    assert!(all_storage["backup_dict"].as_array().unwrap().is_empty());
}
