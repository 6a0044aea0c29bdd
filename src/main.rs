use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

#[derive(Parser)]
#[command(name = "pushpool")]
#[command(version, about = "Pooled HTTP/2 push notification sender", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Pools file path (YAML); falls back to PUSHPOOL_* environment variables
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request through a pool
    Send {
        /// Pool name
        #[arg(long, default_value = "default")]
        pool: String,

        /// Request path (e.g. /3/device/<token>)
        #[arg(long)]
        path: String,

        /// Extra header as name:value (repeatable)
        #[arg(long = "header", short = 'H')]
        headers: Vec<String>,

        /// Read the body from a file
        #[arg(long, conflicts_with = "data")]
        body: Option<String>,

        /// Inline body
        #[arg(long)]
        data: Option<String>,

        /// Request timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Submit asynchronously and wait for the delivery
        #[arg(long = "async")]
        asynchronous: bool,
    },

    /// Start every configured pool and print its stats
    Check,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = pushpool::config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Send {
            pool,
            path,
            headers,
            body,
            data,
            timeout_ms,
            asynchronous,
        } => {
            let args = cli::commands::SendArgs {
                pool,
                path,
                headers,
                body,
                data,
                timeout_ms,
                asynchronous,
            };
            cli::commands::cmd_send(&config, args).await?;
        }
        Commands::Check => {
            cli::commands::cmd_check(&config).await?;
        }
    }

    Ok(())
}
