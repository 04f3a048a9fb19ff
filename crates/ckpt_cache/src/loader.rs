//! Deduplicated loading of checkpoints that live on other nodes.
//!
//! Several local ranks typically ask for the same model state at once; one
//! inter-node LOAD is enough. Requests flow through a bounded channel into a
//! single consumer task; the `ongoing` map records which files are in flight
//! (`false`) or resident (`true`), and waiters poll it until their file is
//! ready.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use anyhow::anyhow;
use tokio::sync::mpsc;

use crate::config::{LOADER_POLL_INTERVAL, LOADER_QUEUE_CAPACITY, LOADER_WAIT_TIMEOUT};
use crate::peer_client::RingClient;
use crate::types::{CacheError, CacheResult};

struct FetchRequest {
    filename: String,
    rank: i64,
}

pub struct RemoteFileLoader {
    ring: Arc<dyn RingClient>,
    tx: mpsc::Sender<FetchRequest>,
    rx: Mutex<Option<mpsc::Receiver<FetchRequest>>>,
    ongoing: RwLock<HashMap<String, bool>>,
}

impl RemoteFileLoader {
    pub fn new(ring: Arc<dyn RingClient>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(LOADER_QUEUE_CAPACITY);
        Arc::new(RemoteFileLoader {
            ring,
            tx,
            rx: Mutex::new(Some(rx)),
            ongoing: RwLock::new(HashMap::new()),
        })
    }

    /// Start the consumer task.
    pub fn start(self: &Arc<Self>) {
        let loader = self.clone();
        let mut rx = self
            .rx
            .lock()
            .expect("loader receiver lock")
            .take()
            .expect("loader already started");
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                loader.process(request).await;
            }
        });
    }

    async fn process(&self, request: FetchRequest) {
        // First writer wins; everyone else just waits on the map.
        {
            let mut ongoing = self.ongoing.write().expect("loader map lock");
            if ongoing.contains_key(&request.filename) {
                tracing::trace!(file = %request.filename, "fetch already in flight");
                return;
            }
            ongoing.insert(request.filename.clone(), false);
        }

        match self
            .ring
            .load_remote(&request.filename, request.rank, false)
            .await
        {
            Ok(_) => {
                self.ongoing
                    .write()
                    .expect("loader map lock")
                    .insert(request.filename.clone(), true);
                tracing::debug!(file = %request.filename, "loaded from remote into shared memory");
            }
            Err(err) => {
                tracing::error!(file = %request.filename, error = %err, "remote load failed");
                // Erase so a later request can enqueue the key again.
                self.ongoing
                    .write()
                    .expect("loader map lock")
                    .remove(&request.filename);
            }
        }
    }

    /// Queue a file for loading from the node that owns it. Blocks when the
    /// request channel is full.
    pub async fn add_key(&self, filename: &str, rank: i64) {
        let request = FetchRequest {
            filename: filename.to_string(),
            rank,
        };
        if self.tx.send(request).await.is_err() {
            tracing::error!(file = %filename, "loader channel closed");
        }
    }

    /// Wait until the file is resident locally, bounded by
    /// [`LOADER_WAIT_TIMEOUT`] so a dead owner surfaces as an error instead
    /// of a hung client request.
    pub async fn wait_until_ready(&self, filename: &str) -> CacheResult<()> {
        let deadline = Instant::now() + LOADER_WAIT_TIMEOUT;
        loop {
            let ready = self
                .ongoing
                .read()
                .expect("loader map lock")
                .get(filename)
                .copied();
            if ready == Some(true) {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(CacheError::Unknown(anyhow!(
                    "timed out waiting for remote load of {filename}"
                )));
            }
            tokio::time::sleep(LOADER_POLL_INTERVAL).await;
        }
    }

    /// Enqueue and wait in one step.
    pub async fn fetch(&self, filename: &str, rank: i64) -> CacheResult<()> {
        self.add_key(filename, rank).await;
        self.wait_until_ready(filename).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Region;
    use crate::types::{BatchFilter, Metadata};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingRing {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl RingClient for CountingRing {
        async fn backup(
            &self,
            _metadata: &Metadata,
            _region: Option<Arc<Region>>,
            _only_metadata: bool,
        ) -> CacheResult<()> {
            Ok(())
        }

        async fn load_remote(
            &self,
            filename: &str,
            rank: i64,
            _only_metadata: bool,
        ) -> CacheResult<Metadata> {
            // Slow enough that concurrent fetches overlap.
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.loads.fetch_add(1, Ordering::SeqCst);
            let mut metadata = Metadata::key("j", filename);
            metadata.node_rank = rank;
            Ok(metadata)
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

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_fetches_coalesce() {
        let ring = Arc::new(CountingRing {
            loads: AtomicUsize::new(0),
        });
        let loader = RemoteFileLoader::new(ring.clone());
        loader.start();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let loader = loader.clone();
            tasks.push(tokio::spawn(async move {
                loader.fetch("/ckpt/shared", 1).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(ring.loads.load(Ordering::SeqCst), 1);
    }
}
