//! Worker pools
//!
//! A [`Pool`] owns a fixed number of workers against one [`ConnectionConfig`]:
//! - Dispatch picks a Connected worker per request using a [`DispatchStrategy`]
//! - A watchdog task monitors every worker task and replaces the ones that
//!   terminate fatally, so the configured size is restored without operator
//!   intervention
//! - Requests are never retried across workers once a worker accepted them

pub mod strategy;

pub use strategy::{DispatchStrategy, Dispatcher};

use crate::config::ConnectionConfig;
use crate::error::{PushError, StartupError};
use crate::request::{Request, Response, SendOptions, SendOutcome};
use crate::worker::{self, WorkerExit, WorkerHandle, WorkerStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Point-in-time view of a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub name: String,

    /// Configured number of workers
    pub configured: usize,

    /// Workers currently Connected
    pub live: usize,

    /// Requests in flight across all workers
    pub in_flight: usize,

    /// Workers replaced by the watchdog since start
    pub replaced: u64,
}

struct PoolInner {
    name: String,
    config: Arc<ConnectionConfig>,

    /// One slot per configured worker; written only at start and by the watchdog
    workers: RwLock<Vec<WorkerHandle>>,
    next_worker_id: AtomicUsize,
    replaced: AtomicU64,
    cancel: CancellationToken,
}

impl PoolInner {
    async fn start_worker(
        &self,
    ) -> Result<(WorkerHandle, JoinHandle<WorkerExit>), StartupError> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        worker::start(id, &self.name, Arc::clone(&self.config)).await
    }
}

/// A fixed-size, self-healing set of workers for one target
pub struct Pool {
    inner: Arc<PoolInner>,
    strategy: DispatchStrategy,
    dispatcher: Dispatcher,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl Pool {
    /// Start `size` workers and the watchdog
    ///
    /// Any worker startup failure is fatal: workers already started are shut
    /// down and the error is returned.
    pub async fn start(
        name: impl Into<String>,
        config: ConnectionConfig,
        size: usize,
        strategy: DispatchStrategy,
    ) -> Result<Self, StartupError> {
        let name = name.into();
        if size == 0 {
            return Err(StartupError::Config(format!(
                "pool {} needs at least one worker",
                name
            )));
        }

        let inner = Arc::new(PoolInner {
            name,
            config: Arc::new(config),
            workers: RwLock::new(Vec::with_capacity(size)),
            next_worker_id: AtomicUsize::new(0),
            replaced: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });

        let mut handles = Vec::with_capacity(size);
        let mut tasks = Vec::with_capacity(size);
        for _ in 0..size {
            match inner.start_worker().await {
                Ok((handle, task)) => {
                    handles.push(handle);
                    tasks.push(task);
                }
                Err(e) => {
                    error!(pool = %inner.name, error = %e, "Worker failed to start");
                    for handle in &handles {
                        handle.shutdown().await;
                    }
                    return Err(e);
                }
            }
        }

        *inner.workers.write().await = handles;

        let mut monitors = JoinSet::new();
        for (slot, task) in tasks.into_iter().enumerate() {
            monitors.spawn(monitor(slot, task));
        }
        let watchdog = tokio::spawn(watchdog(Arc::clone(&inner), monitors));

        info!(
            pool = %inner.name,
            workers = size,
            strategy = %strategy,
            addr = %inner.config.authority(),
            "Pool started"
        );

        Ok(Self {
            inner,
            strategy,
            dispatcher: Dispatcher::new(),
            watchdog: Mutex::new(Some(watchdog)),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn strategy(&self) -> DispatchStrategy {
        self.strategy
    }

    /// Snapshot of the current worker slots
    pub async fn workers(&self) -> Vec<WorkerHandle> {
        self.inner.workers.read().await.clone()
    }

    async fn live_workers(&self) -> Vec<WorkerHandle> {
        self.inner
            .workers
            .read()
            .await
            .iter()
            .filter(|w| w.is_connected())
            .cloned()
            .collect()
    }

    /// Send one request through a live worker
    ///
    /// The timeout is the first of `options.timeout`, `request.timeout` and
    /// the config's `default_timeout`. Returns `not_ready` when no worker is
    /// Connected.
    pub async fn send_request(
        &self,
        request: Request,
        options: SendOptions,
    ) -> Result<SendOutcome, PushError> {
        let timeout = options
            .timeout
            .or(request.timeout)
            .unwrap_or(self.inner.config.default_timeout);
        // One deadline for every worker tried
        let deadline = Instant::now() + timeout;
        let strategy = options.strategy.unwrap_or(self.strategy);

        let live = self.live_workers().await;
        let loads: Vec<usize> = live.iter().map(|w| w.in_flight()).collect();
        let first = self
            .dispatcher
            .select(strategy, &loads)
            .ok_or(PushError::NotReady)?;

        for offset in 0..live.len() {
            let worker = &live[(first + offset) % live.len()];
            match worker
                .send_until(request.clone(), options.mode.clone(), deadline)
                .await
            {
                Err(PushError::NotReady) => {
                    debug!(pool = %self.inner.name, worker = worker.id(), "Worker not ready, trying next");
                }
                other => return other,
            }
        }

        Err(PushError::NotReady)
    }

    /// Send every request asynchronously and collect one outcome per request,
    /// in input order
    pub async fn send_batch(
        &self,
        requests: Vec<Request>,
        timeout: Option<Duration>,
    ) -> Vec<Result<Response, PushError>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut results: Vec<Option<Result<Response, PushError>>> = vec![None; requests.len()];
        let mut positions = HashMap::new();

        for (idx, request) in requests.into_iter().enumerate() {
            let mut options = SendOptions::asynchronous(tx.clone());
            options.timeout = timeout;
            match self.send_request(request, options).await {
                Ok(SendOutcome::Accepted(id)) => {
                    positions.insert(id, idx);
                }
                Ok(SendOutcome::Completed(response)) => results[idx] = Some(Ok(response)),
                Err(e) => results[idx] = Some(Err(e)),
            }
        }
        drop(tx);

        while !positions.is_empty() {
            let Some(delivery) = rx.recv().await else {
                break;
            };
            if let Some(idx) = positions.remove(&delivery.request_id) {
                results[idx] = Some(delivery.result);
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or(Err(PushError::ConnectionLost)))
            .collect()
    }

    pub async fn stats(&self) -> PoolStats {
        let workers = self.inner.workers.read().await;
        PoolStats {
            name: self.inner.name.clone(),
            configured: workers.len(),
            live: workers.iter().filter(|w| w.is_connected()).count(),
            in_flight: workers.iter().map(|w| w.in_flight()).sum(),
            replaced: self.inner.replaced.load(Ordering::Relaxed),
        }
    }

    /// Stop the watchdog and every worker
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(watchdog) = self.watchdog.lock().await.take() {
            let _ = watchdog.await;
        }

        let workers = self.workers().await;
        for worker in &workers {
            worker.shutdown().await;
        }
        for worker in &workers {
            worker.wait_for_status(WorkerStatus::Terminated).await;
        }
        info!(pool = %self.inner.name, "Pool stopped");
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

async fn monitor(slot: usize, task: JoinHandle<WorkerExit>) -> (usize, WorkerExit) {
    let exit = match task.await {
        Ok(exit) => exit,
        Err(e) => WorkerExit::Panicked(e.to_string()),
    };
    (slot, exit)
}

async fn watchdog(inner: Arc<PoolInner>, mut monitors: JoinSet<(usize, WorkerExit)>) {
    loop {
        let joined = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            joined = monitors.join_next() => joined,
        };

        let (slot, exit) = match joined {
            Some(Ok(done)) => done,
            Some(Err(e)) => {
                error!(pool = %inner.name, error = %e, "Worker monitor failed");
                continue;
            }
            None => break,
        };

        if !exit.is_fatal() {
            debug!(pool = %inner.name, slot, "Worker exited cleanly");
            continue;
        }

        warn!(pool = %inner.name, slot, exit = ?exit, "Worker died, replacing");
        match replace(&inner, slot).await {
            Some(task) => {
                monitors.spawn(monitor(slot, task));
            }
            None => break,
        }
    }
    debug!(pool = %inner.name, "Watchdog stopped");
}

/// Start a worker for `slot`, retrying until it succeeds or the pool stops
async fn replace(inner: &PoolInner, slot: usize) -> Option<JoinHandle<WorkerExit>> {
    let mut delay = inner.config.reconnect_backoff;
    let max_delay = inner.config.reconnect_backoff * 8;

    loop {
        match inner.start_worker().await {
            Ok((handle, task)) => {
                let id = handle.id();
                if let Some(current) = inner.workers.write().await.get_mut(slot) {
                    *current = handle;
                }
                inner.replaced.fetch_add(1, Ordering::Relaxed);
                info!(pool = %inner.name, slot, worker = id, "Worker replaced");
                return Some(task);
            }
            Err(e) => {
                error!(pool = %inner.name, slot, error = %e, "Replacement worker failed to start");
            }
        }

        tokio::select! {
            _ = inner.cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(max_delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthStrategy;
    use crate::config::Scheme;

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let mut config = ConnectionConfig::new("localhost", 8443, AuthStrategy::static_token("authorization", "t"));
        config.scheme = Scheme::Http;
        match Pool::start("empty", config, 0, DispatchStrategy::default()).await {
            Err(StartupError::Config(detail)) => assert!(detail.contains("empty")),
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_unreachable_target_fails_startup() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = ConnectionConfig::new("127.0.0.1", port, AuthStrategy::static_token("authorization", "t"));
        config.scheme = Scheme::Http;
        let result = Pool::start("down", config, 2, DispatchStrategy::RoundRobin).await;
        assert!(matches!(result, Err(StartupError::Connect { .. })));
    }
}
