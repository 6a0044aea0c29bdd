//! Connection and pool configuration
//!
//! [`ConnectionConfig`] is the immutable description of one push target that
//! every worker of a pool shares. Operators usually describe pools in a YAML
//! file ([`load_from_yaml`]) or, for a single pool, through environment
//! variables ([`load_from_env`]).

use crate::auth::AuthStrategy;
use crate::error::StartupError;
use crate::pool::DispatchStrategy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 443;
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(5_000);
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_millis(200);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_WORKERS: usize = 4;

/// Which provider a pool talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    Apns,
    ApnsSandbox,
    Fcm,
    #[default]
    Generic,
}

impl PoolType {
    /// Well-known endpoint used when the operator does not name one
    pub fn default_domain(&self) -> Option<&'static str> {
        match self {
            PoolType::Apns => Some("api.push.apple.com"),
            PoolType::ApnsSandbox => Some("api.sandbox.push.apple.com"),
            PoolType::Fcm => Some("fcm.googleapis.com"),
            PoolType::Generic => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PoolType::Apns => "apns",
            PoolType::ApnsSandbox => "apns_sandbox",
            PoolType::Fcm => "fcm",
            PoolType::Generic => "generic",
        }
    }
}

impl FromStr for PoolType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "apns" => Ok(PoolType::Apns),
            "apns_sandbox" => Ok(PoolType::ApnsSandbox),
            "fcm" => Ok(PoolType::Fcm),
            "generic" => Ok(PoolType::Generic),
            other => anyhow::bail!("unknown pool type: {}", other),
        }
    }
}

/// URI scheme of the session; `http` means cleartext HTTP/2 with prior knowledge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    #[default]
    Https,
    Http,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Https => "https",
            Scheme::Http => "http",
        }
    }
}

/// Peer verification mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verify {
    VerifyPeer,
    #[default]
    VerifyNone,
}

/// TLS knobs applied to every session of a pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    pub verify: Verify,

    /// PEM bundle of trusted CAs; required with `verify_peer`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cacertfile: Option<PathBuf>,

    /// SNI / verification name when it differs from the domain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

/// Immutable description of one push target
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub domain: String,
    pub port: u16,
    pub scheme: Scheme,
    pub authentication: AuthStrategy,
    pub tls_options: TlsOptions,

    /// Interval between keep-alive pings; a ping unanswered for a full
    /// interval declares the connection lost
    pub ping_interval: Duration,

    /// Reconnection attempts after a connection loss before the worker gives up
    pub reconnect_attempts: u32,

    /// First delay between reconnection attempts, doubled per attempt up to 8x
    pub reconnect_backoff: Duration,

    /// Request timeout used when the caller does not supply one
    pub default_timeout: Duration,

    /// Bound on TCP connect + TLS + HTTP/2 handshake + first ping
    pub connect_timeout: Duration,

    pub pool_type: PoolType,
}

impl ConnectionConfig {
    pub fn new(domain: impl Into<String>, port: u16, authentication: AuthStrategy) -> Self {
        Self {
            domain: domain.into(),
            port,
            scheme: Scheme::default(),
            authentication,
            tls_options: TlsOptions::default(),
            ping_interval: DEFAULT_PING_INTERVAL,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            default_timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool_type: PoolType::default(),
        }
    }

    /// `host:port` used both for dialing and as the `:authority`
    pub fn authority(&self) -> String {
        format!("{}:{}", self.domain, self.port)
    }

    pub fn validate(&self) -> Result<(), StartupError> {
        if self.domain.is_empty() {
            return Err(StartupError::Config("domain is empty".to_string()));
        }
        if self.port == 0 {
            return Err(StartupError::Config("port must be in 1..=65535".to_string()));
        }
        if self.ping_interval.is_zero() {
            return Err(StartupError::Config("ping_interval must be positive".to_string()));
        }
        if self.default_timeout.is_zero() {
            return Err(StartupError::Config("default_timeout must be positive".to_string()));
        }
        if self.scheme == Scheme::Http && self.authentication.is_certificate() {
            return Err(StartupError::Config(
                "certificate authentication requires the https scheme".to_string(),
            ));
        }
        Ok(())
    }
}

/// Authentication as written in a pool definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthDefinition {
    Certificate {
        certfile: PathBuf,
        keyfile: PathBuf,
    },
    Token {
        #[serde(default = "default_token_header")]
        header: String,

        /// Fixed token value
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,

        /// Environment variable read on every request
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env: Option<String>,

        /// Prefix such as `bearer`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scheme: Option<String>,
    },
}

fn default_token_header() -> String {
    "authorization".to_string()
}

impl AuthDefinition {
    pub fn strategy(&self) -> Result<AuthStrategy> {
        match self {
            AuthDefinition::Certificate { certfile, keyfile } => {
                Ok(AuthStrategy::certificate(certfile.clone(), keyfile.clone()))
            }
            AuthDefinition::Token {
                header,
                value,
                env,
                scheme,
            } => match (value, env) {
                (Some(value), None) => {
                    let value = match scheme {
                        Some(scheme) => format!("{} {}", scheme, value),
                        None => value.clone(),
                    };
                    Ok(AuthStrategy::static_token(header.clone(), value))
                }
                (None, Some(env)) => Ok(AuthStrategy::env_token(
                    header.clone(),
                    env.clone(),
                    scheme.clone(),
                )),
                _ => anyhow::bail!("token auth needs exactly one of `value` or `env`"),
            },
        }
    }
}

/// One named pool in the pools file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDefinition {
    #[serde(default)]
    pub pool_type: PoolType,

    /// Falls back to the pool type's well-known domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub scheme: Scheme,

    pub auth: AuthDefinition,

    #[serde(default)]
    pub tls: TlsOptions,

    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub strategy: DispatchStrategy,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_ping_interval_ms() -> u64 {
    DEFAULT_PING_INTERVAL.as_millis() as u64
}

fn default_reconnect_attempts() -> u32 {
    DEFAULT_RECONNECT_ATTEMPTS
}

fn default_reconnect_backoff_ms() -> u64 {
    DEFAULT_RECONNECT_BACKOFF.as_millis() as u64
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

impl PoolDefinition {
    pub fn connection_config(&self) -> Result<ConnectionConfig> {
        let domain = match (&self.domain, self.pool_type.default_domain()) {
            (Some(domain), _) => domain.clone(),
            (None, Some(domain)) => domain.to_string(),
            (None, None) => anyhow::bail!(
                "pool type {} has no default domain; set `domain`",
                self.pool_type.name()
            ),
        };

        Ok(ConnectionConfig {
            domain,
            port: self.port,
            scheme: self.scheme,
            authentication: self.auth.strategy()?,
            tls_options: self.tls.clone(),
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
            default_timeout: Duration::from_millis(self.default_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            pool_type: self.pool_type,
        })
    }
}

/// All pools a process runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolsConfig {
    #[serde(default)]
    pub pools: BTreeMap<String, PoolDefinition>,
}

/// Load pool definitions from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<PoolsConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: PoolsConfig =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load a single pool named `default` from environment variables
///
/// - PUSHPOOL_TYPE (apns, apns_sandbox, fcm, generic; default generic)
/// - PUSHPOOL_DOMAIN (optional when the type has a well-known domain)
/// - PUSHPOOL_PORT (default 443)
/// - PUSHPOOL_CERTFILE + PUSHPOOL_KEYFILE, or PUSHPOOL_TOKEN_ENV
///   (+ optional PUSHPOOL_TOKEN_SCHEME)
/// - PUSHPOOL_CACERTFILE (switches verification to verify_peer)
/// - PUSHPOOL_WORKERS, PUSHPOOL_STRATEGY
pub fn load_from_env() -> Result<PoolsConfig> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let pool_type = match std::env::var("PUSHPOOL_TYPE") {
        Ok(value) => value.parse()?,
        Err(_) => PoolType::default(),
    };

    let domain = std::env::var("PUSHPOOL_DOMAIN").ok();
    if domain.is_none() && pool_type.default_domain().is_none() {
        anyhow::bail!("PUSHPOOL_DOMAIN environment variable not set");
    }

    let auth = match (
        std::env::var("PUSHPOOL_CERTFILE"),
        std::env::var("PUSHPOOL_KEYFILE"),
        std::env::var("PUSHPOOL_TOKEN_ENV"),
    ) {
        (Ok(certfile), Ok(keyfile), _) => AuthDefinition::Certificate {
            certfile: certfile.into(),
            keyfile: keyfile.into(),
        },
        (_, _, Ok(env)) => AuthDefinition::Token {
            header: default_token_header(),
            value: None,
            env: Some(env),
            scheme: std::env::var("PUSHPOOL_TOKEN_SCHEME").ok(),
        },
        _ => anyhow::bail!(
            "Neither PUSHPOOL_CERTFILE/PUSHPOOL_KEYFILE nor PUSHPOOL_TOKEN_ENV is set"
        ),
    };

    let mut pool = PoolDefinition {
        pool_type,
        domain,
        port: DEFAULT_PORT,
        scheme: Scheme::default(),
        auth,
        tls: TlsOptions::default(),
        ping_interval_ms: default_ping_interval_ms(),
        reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
        reconnect_backoff_ms: default_reconnect_backoff_ms(),
        default_timeout_ms: default_timeout_ms(),
        connect_timeout_ms: default_connect_timeout_ms(),
        workers: DEFAULT_WORKERS,
        strategy: DispatchStrategy::default(),
    };

    if let Ok(port) = std::env::var("PUSHPOOL_PORT") {
        pool.port = port.parse().context("PUSHPOOL_PORT is not a valid port")?;
    }

    if let Ok(cacertfile) = std::env::var("PUSHPOOL_CACERTFILE") {
        pool.tls.verify = Verify::VerifyPeer;
        pool.tls.cacertfile = Some(cacertfile.into());
    }

    if let Ok(workers) = std::env::var("PUSHPOOL_WORKERS") {
        if let Ok(val) = workers.parse() {
            pool.workers = val;
        }
    }

    if let Ok(strategy) = std::env::var("PUSHPOOL_STRATEGY") {
        pool.strategy = strategy.parse()?;
    }

    let mut config = PoolsConfig::default();
    config.pools.insert("default".to_string(), pool);
    Ok(config)
}

/// Load pools from a YAML file when given, otherwise from the environment
pub fn load_config(config_path: Option<&str>) -> Result<PoolsConfig> {
    match config_path {
        Some(path) => load_from_yaml(path),
        None => load_from_env(),
    }
}
