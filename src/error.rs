//! Error types surfaced by workers, pools and the warden
//!
//! Two families exist:
//! - [`PushError`]: the outcome of a single request. Always resolved to exactly
//!   one caller and never fatal to the worker that produced it.
//! - [`StartupError`]: failures while establishing a session. Fatal to the
//!   worker (and to pool construction) and never retried automatically.

use std::time::Duration;

/// Per-request failure delivered to the caller
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    /// The session died while the request was outstanding
    #[error("connection lost")]
    ConnectionLost,

    /// The deadline elapsed before a response arrived
    #[error("request timed out")]
    RequestTimeout,

    /// No connected worker could accept the request
    #[error("no worker ready to accept the request")]
    NotReady,

    /// The peer reset this one stream; the session itself is still healthy
    #[error("stream reset by peer: {0}")]
    StreamReset(String),

    /// The token provider could not produce an authorization header
    #[error("authorization unavailable: {0}")]
    Auth(String),

    /// The request could not be turned into an HTTP/2 request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No pool is registered under this name
    #[error("unknown pool: {0}")]
    UnknownPool(String),

    /// Any other transport-level failure, passed through untouched
    #[error("transport error: {0}")]
    Transport(String),
}

impl PushError {
    /// Short snake_case tag, stable across releases
    pub fn tag(&self) -> &'static str {
        match self {
            PushError::ConnectionLost => "connection_lost",
            PushError::RequestTimeout => "request_timeout",
            PushError::NotReady => "not_ready",
            PushError::StreamReset(_) => "stream_reset",
            PushError::Auth(_) => "auth",
            PushError::InvalidRequest(_) => "invalid_request",
            PushError::UnknownPool(_) => "unknown_pool",
            PushError::Transport(_) => "transport",
        }
    }
}

/// Fatal failure while bringing a session up
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// The peer (or the local stack) aborted the TLS handshake with an alert
    #[error("tls alert: {alert}")]
    TlsAlert { alert: String },

    /// A TLS option is malformed or references something unusable
    #[error("invalid tls option {option}: {detail}")]
    Options { option: &'static str, detail: String },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tls handshake failed: {0}")]
    Tls(String),

    #[error("http/2 handshake failed: {0}")]
    Handshake(String),

    #[error("session not established within {0:?}")]
    Timeout(Duration),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StartupError {
    pub(crate) fn option(option: &'static str, detail: impl Into<String>) -> Self {
        StartupError::Options {
            option,
            detail: detail.into(),
        }
    }
}
