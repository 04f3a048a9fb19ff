//! Work-queue operator driving per-checkpoint reconciliation.
//!
//! Keys (filenames) enter through a token-bucket rate limiter into a bounded
//! queue; a fixed pool of workers pops keys and runs the registered handler.
//! A handler returning `false` re-enqueues the key through the limiter, so a
//! record marches one state transition per tick until it is terminal.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{OPERATOR_WORKERS, RATE_LIMITER_RATE, WORKQUEUE_CAPACITY};

/// Classic token bucket. Permits accrue at `rate` per second up to
/// `max_permits`; a claim past the stored permits pushes the next free slot
/// out by `fresh × interval`.
pub struct RateLimiter {
    origin: Instant,
    inner: Mutex<Bucket>,
}

struct Bucket {
    interval_us: f64,
    max_permits: f64,
    stored_permits: f64,
    next_free_us: u64,
}

impl RateLimiter {
    /// `rate` is permits per second; `burst` is the stored-permit ceiling.
    pub fn new(rate: f64, burst: f64) -> Self {
        assert!(rate > 0.0, "rate limiter rate must be positive");
        RateLimiter {
            origin: Instant::now(),
            inner: Mutex::new(Bucket {
                interval_us: 1_000_000.0 / rate,
                max_permits: burst,
                stored_permits: 0.0,
                next_free_us: 0,
            }),
        }
    }

    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    /// Reserve `permits` and return how long the caller must wait.
    fn claim_next(&self, permits: f64) -> Duration {
        let now = self.now_us();
        let mut bucket = self.inner.lock().expect("rate limiter lock");

        // Past the last reservation: replenish stored permits.
        if now > bucket.next_free_us {
            let accrued = (now - bucket.next_free_us) as f64 / bucket.interval_us;
            bucket.stored_permits = bucket.max_permits.min(bucket.stored_permits + accrued);
            bucket.next_free_us = now;
        }

        let wait_us = bucket.next_free_us - now;
        let stored = permits.min(bucket.stored_permits);
        let fresh = permits - stored;
        bucket.next_free_us += (fresh * bucket.interval_us) as u64;
        bucket.stored_permits -= stored;

        Duration::from_micros(wait_us)
    }

    /// Acquire permits, sleeping as long as the bucket demands. Returns the
    /// time spent waiting.
    pub async fn acquire(&self, permits: u32) -> Duration {
        assert!(permits > 0, "must request a positive amount of permits");
        let wait = self.claim_next(f64::from(permits));
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Acquire unless the earliest available slot lies beyond `timeout`; in
    /// that case refuse without blocking.
    pub async fn try_acquire(&self, permits: u32, timeout: Duration) -> bool {
        {
            let bucket = self.inner.lock().expect("rate limiter lock");
            let deadline = self.now_us() + timeout.as_micros() as u64;
            if bucket.next_free_us > deadline {
                return false;
            }
        }
        self.acquire(permits).await;
        true
    }
}

/// The reconciliation callback. Returns `true` when the key is terminal for
/// this tick and must not be re-enqueued.
#[async_trait]
pub trait ReconcileHandler: Send + Sync {
    async fn reconcile(&self, key: &str) -> bool;
}

pub struct Operator {
    tx: mpsc::Sender<String>,
    rx: Mutex<Option<mpsc::Receiver<String>>>,
    limiter: RateLimiter,
    handler: OnceLock<Arc<dyn ReconcileHandler>>,
    workers: usize,
}

impl Operator {
    pub fn new() -> Arc<Self> {
        Self::with_options(WORKQUEUE_CAPACITY, RATE_LIMITER_RATE, OPERATOR_WORKERS)
    }

    pub fn with_options(capacity: usize, rate: f64, workers: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity);
        Arc::new(Operator {
            tx,
            rx: Mutex::new(Some(rx)),
            limiter: RateLimiter::new(rate, 0.0),
            handler: OnceLock::new(),
            workers,
        })
    }

    /// Register the reconcile handler. Must happen once, before [`run`].
    pub fn set_handler(&self, handler: Arc<dyn ReconcileHandler>) {
        if self.handler.set(handler).is_err() {
            tracing::error!("reconcile handler registered twice, keeping the first");
        }
    }

    /// Enqueue a key through the rate limiter. Blocks while the queue is at
    /// capacity.
    pub async fn add_rate_limited(&self, key: &str) {
        let waited = self.limiter.acquire(1).await;
        tracing::trace!(key, waited_us = waited.as_micros() as u64, "enqueue");
        if self.tx.send(key.to_string()).await.is_err() {
            tracing::error!(key, "work queue closed, dropping key");
        }
    }

    /// Start the worker pool.
    pub fn run(self: &Arc<Self>) {
        let handler = self
            .handler
            .get()
            .expect("reconcile handler must be set before run")
            .clone();
        let rx = self
            .rx
            .lock()
            .expect("operator receiver lock")
            .take()
            .expect("operator already running");
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker in 0..self.workers {
            let rx = rx.clone();
            let handler = handler.clone();
            let operator = self.clone();
            tokio::spawn(async move {
                tracing::info!(worker, "reconciliation worker started");
                loop {
                    let key = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(key) = key else {
                        break;
                    };
                    tracing::trace!(worker, key = %key, "fetched key");
                    if !handler.reconcile(&key).await {
                        operator.add_rate_limited(&key).await;
                    }
                }
                tracing::info!(worker, "reconciliation worker stopped");
            });
        }
        tracing::info!(workers = self.workers, "all reconciliation workers started");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[tokio::test]
    async fn successive_acquires_pace_out() {
        // 200 permits/s: every acquire past the first waits 5ms.
        let limiter = RateLimiter::new(200.0, 0.0);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire(1).await;
        }
        assert!(
            start.elapsed() >= Duration::from_millis(4 * 5),
            "five acquires must take at least four intervals, took {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn try_acquire_refuses_far_reservations() {
        let limiter = RateLimiter::new(10.0, 0.0);
        // Push the next free slot ~500ms out.
        limiter.acquire(5).await;
        assert!(!limiter.try_acquire(1, Duration::from_millis(10)).await);
        assert!(limiter.try_acquire(1, Duration::from_secs(2)).await);
    }

    struct GatedHandler {
        gate: Notify,
        seen: AtomicUsize,
    }

    #[async_trait]
    impl ReconcileHandler for GatedHandler {
        async fn reconcile(&self, _key: &str) -> bool {
            self.gate.notified().await;
            self.seen.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_queue_blocks_the_submitter() {
        let operator = Operator::with_options(2, 100_000.0, 1);
        let handler = Arc::new(GatedHandler {
            gate: Notify::new(),
            seen: AtomicUsize::new(0),
        });
        operator.set_handler(handler.clone());
        operator.run();

        // One key parked inside the handler, two filling the queue.
        operator.add_rate_limited("a").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        operator.add_rate_limited("b").await;
        operator.add_rate_limited("c").await;

        let blocked =
            tokio::time::timeout(Duration::from_millis(100), operator.add_rate_limited("d")).await;
        assert!(blocked.is_err(), "submission past capacity must block");

        // Drain: every parked key gets processed once released.
        for _ in 0..8 {
            handler.gate.notify_one();
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while handler.seen.load(Ordering::SeqCst) < 3 {
                handler.gate.notify_one();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queued keys must drain once the handler unblocks");
    }

    struct RetryOnce {
        attempts: std::sync::Mutex<HashMap<String, usize>>,
        done: Notify,
    }

    #[async_trait]
    impl ReconcileHandler for RetryOnce {
        async fn reconcile(&self, key: &str) -> bool {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(key.to_string()).or_insert(0);
            *n += 1;
            if *n >= 2 {
                self.done.notify_one();
                true
            } else {
                false
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_terminal_keys_are_requeued() {
        let operator = Operator::with_options(16, 100_000.0, 2);
        let handler = Arc::new(RetryOnce {
            attempts: std::sync::Mutex::new(HashMap::new()),
            done: Notify::new(),
        });
        operator.set_handler(handler.clone());
        operator.run();

        operator.add_rate_limited("x").await;
        tokio::time::timeout(Duration::from_secs(2), handler.done.notified())
            .await
            .expect("key must come back for a second tick");
        assert_eq!(handler.attempts.lock().unwrap()["x"], 2);
    }
}
