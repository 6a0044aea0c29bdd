//! pushpool - pooled HTTP/2 connections for push notification providers

pub mod auth;
pub mod config;
pub mod error;
pub mod pool;
pub mod request;
pub mod tls;
pub mod warden;
pub mod worker;

pub use auth::{AuthStrategy, TokenProvider};
pub use config::{ConnectionConfig, PoolType, PoolsConfig, Scheme, TlsOptions, Verify};
pub use error::{PushError, StartupError};
pub use pool::{DispatchStrategy, Pool, PoolStats};
pub use request::{Delivery, Request, RequestId, Response, SendMode, SendOptions, SendOutcome};
pub use warden::PoolsWarden;
pub use worker::{WorkerExit, WorkerHandle, WorkerStatus};
