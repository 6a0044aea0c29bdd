//! Named pool registry
//!
//! A [`PoolsWarden`] maps logical pool names to running pools. It is an
//! ordinary value: create one at process start, pass it (usually inside an
//! `Arc`) to whatever needs to send, and call [`PoolsWarden::shutdown_all`]
//! on the way out.

use crate::config::PoolsConfig;
use crate::error::{PushError, StartupError};
use crate::pool::Pool;
use crate::request::{Request, SendOptions, SendOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct PoolsWarden {
    pools: RwLock<HashMap<String, Arc<Pool>>>,
}

impl PoolsWarden {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start every pool in `config`
    ///
    /// All or nothing: if one pool fails to start, the pools started by this
    /// call are shut down again and the error is returned.
    pub async fn start_pools(&self, config: &PoolsConfig) -> Result<(), StartupError> {
        let mut started = Vec::new();

        for (name, definition) in &config.pools {
            let result = match definition.connection_config() {
                Ok(connection) => {
                    Pool::start(name, connection, definition.workers, definition.strategy).await
                }
                Err(e) => Err(StartupError::Config(format!("pool {}: {:#}", name, e))),
            };

            match result {
                Ok(pool) => {
                    let pool = Arc::new(pool);
                    if let Some(previous) = self.add(Arc::clone(&pool)).await {
                        previous.shutdown().await;
                    }
                    started.push(name.clone());
                }
                Err(e) => {
                    warn!(pool = %name, error = %e, "Pool failed to start, rolling back");
                    for name in &started {
                        self.remove(name).await;
                    }
                    return Err(e);
                }
            }
        }

        info!(pools = started.len(), "Pools started");
        Ok(())
    }

    /// Register a running pool under its name, returning the pool it replaced
    pub async fn add(&self, pool: Arc<Pool>) -> Option<Arc<Pool>> {
        self.pools
            .write()
            .await
            .insert(pool.name().to_string(), pool)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Pool>> {
        self.pools.read().await.get(name).cloned()
    }

    /// Registered names, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Send through the pool registered as `name`
    pub async fn send_request(
        &self,
        name: &str,
        request: Request,
        options: SendOptions,
    ) -> Result<SendOutcome, PushError> {
        let pool = self
            .get(name)
            .await
            .ok_or_else(|| PushError::UnknownPool(name.to_string()))?;
        pool.send_request(request, options).await
    }

    /// Unregister and shut down a pool; false if no such pool
    pub async fn remove(&self, name: &str) -> bool {
        let removed = self.pools.write().await.remove(name);
        match removed {
            Some(pool) => {
                pool.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn shutdown_all(&self) {
        let pools: Vec<Arc<Pool>> = self.pools.write().await.drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.shutdown().await;
        }
        info!("All pools stopped");
    }
}
