//! Request and response values exchanged with the core
//!
//! Requests are built by the provider layer (APNS/FCM body and path) and are
//! opaque to workers apart from turning them into one HTTP/2 stream.

use crate::config::ConnectionConfig;
use crate::error::PushError;
use crate::pool::DispatchStrategy;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::Method;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one submitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) fn next() -> Self {
        RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One outbound push request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,

    /// Regular headers in send order; pseudo-headers are derived from
    /// `method`, `path` and the pool's target
    pub headers: Vec<(String, String)>,
    pub body: Bytes,

    /// Per-request timeout; the pool default applies when unset
    pub timeout: Option<Duration>,
}

impl Request {
    /// A `POST` to `path` with an empty body
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            headers: Vec::new(),
            body: Bytes::new(),
            timeout: None,
        }
    }

    pub fn post(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(path).with_body(body)
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the HTTP/2 request head for `config`, appending `auth` last
    pub(crate) fn to_http(
        &self,
        config: &ConnectionConfig,
        auth: Option<(HeaderName, HeaderValue)>,
    ) -> Result<http::Request<()>, PushError> {
        if !self.path.starts_with('/') {
            return Err(PushError::InvalidRequest(format!(
                "path must start with '/': {:?}",
                self.path
            )));
        }

        let uri = format!(
            "{}://{}{}",
            config.scheme.as_str(),
            config.authority(),
            self.path
        );
        let mut builder = http::Request::builder().method(self.method.clone()).uri(uri);

        for (name, value) in &self.headers {
            if name.starts_with(':') {
                return Err(PushError::InvalidRequest(format!(
                    "pseudo-header {} cannot be set directly",
                    name
                )));
            }
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| PushError::InvalidRequest(format!("header {:?}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| PushError::InvalidRequest(format!("header {}: {}", name, e)))?;
            builder = builder.header(name, value);
        }

        if let Some((name, value)) = auth {
            builder = builder.header(name, value);
        }

        builder
            .body(())
            .map_err(|e| PushError::InvalidRequest(e.to_string()))
    }
}

/// Raw response of one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Headers in receive order, starting with the `:status` pseudo-header
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub(crate) fn from_parts(parts: &http::response::Parts, body: Bytes) -> Self {
        let mut headers = Vec::with_capacity(parts.headers.len() + 1);
        headers.push((":status".to_string(), parts.status.as_u16().to_string()));
        for (name, value) in parts.headers.iter() {
            headers.push((
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            ));
        }
        Self { headers, body }
    }

    pub fn status(&self) -> Option<u16> {
        self.header(":status").and_then(|s| s.parse().ok())
    }

    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Terminal outcome of an async request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub request_id: RequestId,
    pub result: Result<Response, PushError>,
}

pub type DeliveryTx = mpsc::UnboundedSender<Delivery>;

/// How the caller waits for the outcome
#[derive(Debug, Clone, Default)]
pub enum SendMode {
    /// Block until the response, a timeout or a connection loss
    #[default]
    Sync,

    /// Return once accepted; the outcome arrives later on this channel
    Async(DeliveryTx),
}

/// What `send` returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Completed(Response),
    Accepted(RequestId),
}

impl SendOutcome {
    pub fn into_response(self) -> Option<Response> {
        match self {
            SendOutcome::Completed(response) => Some(response),
            SendOutcome::Accepted(_) => None,
        }
    }
}

/// Per-call knobs for [`crate::Pool::send_request`]
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub mode: SendMode,

    /// Overrides both the request's and the pool's timeout
    pub timeout: Option<Duration>,

    /// Overrides the pool's dispatch strategy
    pub strategy: Option<DispatchStrategy>,
}

impl SendOptions {
    pub fn sync() -> Self {
        Self::default()
    }

    pub fn asynchronous(tx: DeliveryTx) -> Self {
        Self {
            mode: SendMode::Async(tx),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_strategy(mut self, strategy: DispatchStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}
