//! Example sending APNS notifications through a pool
//!
//! This example shows how to:
//! 1. Describe the target and its token authentication
//! 2. Start a pool and send blocking and non-blocking requests
//! 3. Register the pool with a warden and address it by name
//! 4. Inspect pool statistics
//!
//! Set `APNS_TOPIC`, `APNS_DEVICE` and `APNS_JWT` before running.

use pushpool::{
    AuthStrategy, ConnectionConfig, DispatchStrategy, Pool, PoolType, PoolsWarden, Request,
    SendOptions, SendOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let topic = std::env::var("APNS_TOPIC")?;
    let device = std::env::var("APNS_DEVICE")?;

    // The token is re-read on every request, so rotating APNS_JWT is picked up
    let auth = AuthStrategy::env_token("authorization", "APNS_JWT", Some("bearer".to_string()));

    let mut config = ConnectionConfig::new(
        PoolType::ApnsSandbox.default_domain().unwrap_or("api.sandbox.push.apple.com"),
        443,
        auth,
    );
    config.pool_type = PoolType::ApnsSandbox;
    config.default_timeout = Duration::from_secs(10);

    let pool = Pool::start("apns", config, 2, DispatchStrategy::RoundRobin).await?;
    let path = format!("/3/device/{}", device);

    // Blocking send
    let request = Request::post(path.clone(), r#"{"aps":{"alert":"hello"}}"#)
        .with_header("apns-topic", topic.clone())
        .with_header("apns-push-type", "alert");
    match pool.send_request(request, SendOptions::sync()).await {
        Ok(SendOutcome::Completed(response)) => {
            info!("APNS answered {:?}: {}", response.status(), String::from_utf8_lossy(&response.body));
        }
        Ok(other) => warn!("Unexpected outcome: {:?}", other),
        Err(e) => warn!("Push failed: {} ({})", e, e.tag()),
    }

    // Non-blocking sends, collected from one channel
    let (tx, mut rx) = mpsc::unbounded_channel();
    for i in 0..3 {
        let request = Request::post(path.clone(), format!(r#"{{"aps":{{"alert":"update {}"}}}}"#, i))
            .with_header("apns-topic", topic.clone());
        pool.send_request(request, SendOptions::asynchronous(tx.clone()))
            .await?;
    }
    drop(tx);
    while let Some(delivery) = rx.recv().await {
        match delivery.result {
            Ok(response) => info!("Request {} -> {:?}", delivery.request_id, response.status()),
            Err(e) => warn!("Request {} failed: {}", delivery.request_id, e),
        }
    }

    // Address the pool by name
    let warden = PoolsWarden::new();
    warden.add(Arc::new(pool)).await;
    if let Some(pool) = warden.get("apns").await {
        let stats = pool.stats().await;
        info!(
            "Pool {}: {}/{} workers live, {} replaced",
            stats.name, stats.live, stats.configured, stats.replaced
        );
    }

    warden.shutdown_all().await;
    Ok(())
}
