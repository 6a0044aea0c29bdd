use anyhow::{Context, Result};
use pushpool::{
    Pool, PoolsConfig, PoolsWarden, Request, Response, SendOptions, SendOutcome,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Arguments of the `send` command
#[derive(Debug, Clone)]
pub struct SendArgs {
    pub pool: String,
    pub path: String,
    pub headers: Vec<String>,
    pub body: Option<String>,
    pub data: Option<String>,
    pub timeout_ms: Option<u64>,
    pub asynchronous: bool,
}

/// Parse a `name:value` header argument
pub fn parse_header(arg: &str) -> Result<(String, String)> {
    let (name, value) = arg
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("header must be name:value, got {:?}", arg))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("header name is empty in {:?}", arg);
    }
    Ok((name.to_lowercase(), value.trim().to_string()))
}

fn build_request(args: &SendArgs) -> Result<Request> {
    let mut request = Request::new(args.path.clone());
    for header in &args.headers {
        let (name, value) = parse_header(header)?;
        request = request.with_header(name, value);
    }

    if let Some(path) = &args.body {
        let body = std::fs::read(path).with_context(|| format!("Failed to read body file: {}", path))?;
        request = request.with_body(body);
    } else if let Some(data) = &args.data {
        request = request.with_body(data.clone());
    }

    if let Some(ms) = args.timeout_ms {
        request = request.with_timeout(Duration::from_millis(ms));
    }
    Ok(request)
}

fn print_response(response: &Response) {
    for (name, value) in &response.headers {
        println!("{}: {}", name, value);
    }
    println!();
    println!("{}", String::from_utf8_lossy(&response.body));
}

/// Start the named pool, send one request and print the response
pub async fn cmd_send(config: &PoolsConfig, args: SendArgs) -> Result<()> {
    let definition = config
        .pools
        .get(&args.pool)
        .ok_or_else(|| anyhow::anyhow!("No pool named {:?} in configuration", args.pool))?;
    let request = build_request(&args)?;

    let pool = Pool::start(
        args.pool.clone(),
        definition.connection_config()?,
        definition.workers,
        definition.strategy,
    )
    .await
    .with_context(|| format!("Failed to start pool {}", args.pool))?;

    let result = if args.asynchronous {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = pool.send_request(request, SendOptions::asynchronous(tx)).await;
        match outcome {
            Ok(SendOutcome::Accepted(id)) => {
                info!(request = %id, "Request accepted");
                match rx.recv().await {
                    Some(delivery) => delivery.result,
                    None => Err(pushpool::PushError::ConnectionLost),
                }
            }
            Ok(SendOutcome::Completed(response)) => Ok(response),
            Err(e) => Err(e),
        }
    } else {
        match pool.send_request(request, SendOptions::sync()).await {
            Ok(SendOutcome::Completed(response)) => Ok(response),
            Ok(SendOutcome::Accepted(id)) => {
                anyhow::bail!("request {} was accepted without a response", id)
            }
            Err(e) => Err(e),
        }
    };

    pool.shutdown().await;

    let response = result.with_context(|| format!("Request through pool {} failed", args.pool))?;
    print_response(&response);
    Ok(())
}

/// Start all configured pools and print their stats
pub async fn cmd_check(config: &PoolsConfig) -> Result<()> {
    if config.pools.is_empty() {
        anyhow::bail!("No pools configured");
    }

    let warden = PoolsWarden::new();
    warden
        .start_pools(config)
        .await
        .context("Failed to start pools")?;

    println!("{:<20} {:>10} {:>6} {:>10} {:>9}", "POOL", "CONFIGURED", "LIVE", "IN_FLIGHT", "REPLACED");
    for name in warden.names().await {
        if let Some(pool) = warden.get(&name).await {
            let stats = pool.stats().await;
            println!(
                "{:<20} {:>10} {:>6} {:>10} {:>9}",
                stats.name, stats.configured, stats.live, stats.in_flight, stats.replaced
            );
        }
    }

    warden.shutdown_all().await;
    Ok(())
}
