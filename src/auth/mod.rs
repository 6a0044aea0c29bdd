//! Authentication strategies for push endpoints
//!
//! A worker never knows which kind of credential it carries. It asks the
//! strategy for two things:
//! - [`AuthStrategy::apply_to_handshake`]: finish the TLS client config,
//!   attaching a client certificate when the strategy is certificate based.
//! - [`AuthStrategy::resolve_header`]: produce the authorization header for
//!   one outbound request when the strategy is token based.
//!
//! Token providers are invoked once per request and never cached by the
//! worker, so token rotation stays the provider's own business.

use crate::error::{PushError, StartupError};
use crate::tls;
use http::header::{HeaderName, HeaderValue};
use rustls::client::WantsClientCert;
use rustls::{ClientConfig, ConfigBuilder};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A `(header-name, header-value)` pair
pub type HeaderPair = (String, String);

/// Source of a fresh authorization header
pub trait TokenProvider: Send + Sync {
    fn authorization(&self) -> anyhow::Result<HeaderPair>;
}

impl<F> TokenProvider for F
where
    F: Fn() -> anyhow::Result<HeaderPair> + Send + Sync,
{
    fn authorization(&self) -> anyhow::Result<HeaderPair> {
        self()
    }
}

/// How a worker proves its identity to the push endpoint
#[derive(Clone)]
pub enum AuthStrategy {
    /// Mutual TLS with a client certificate and private key (PEM files)
    Certificate { certfile: PathBuf, keyfile: PathBuf },

    /// Bearer-style header resolved on every request
    Token(Arc<dyn TokenProvider>),
}

impl AuthStrategy {
    pub fn certificate(certfile: impl Into<PathBuf>, keyfile: impl Into<PathBuf>) -> Self {
        AuthStrategy::Certificate {
            certfile: certfile.into(),
            keyfile: keyfile.into(),
        }
    }

    pub fn token<F>(getter: F) -> Self
    where
        F: Fn() -> anyhow::Result<HeaderPair> + Send + Sync + 'static,
    {
        AuthStrategy::Token(Arc::new(getter))
    }

    pub fn from_provider(provider: Arc<dyn TokenProvider>) -> Self {
        AuthStrategy::Token(provider)
    }

    /// A token that never changes
    pub fn static_token(header: impl Into<String>, value: impl Into<String>) -> Self {
        let header = header.into();
        let value = value.into();
        AuthStrategy::token(move || Ok((header.clone(), value.clone())))
    }

    /// A token read from an environment variable on every request
    ///
    /// `scheme` (e.g. `bearer`) is prepended with a single space when set.
    pub fn env_token(
        header: impl Into<String>,
        env_var: impl Into<String>,
        scheme: Option<String>,
    ) -> Self {
        let header = header.into();
        let env_var = env_var.into();
        AuthStrategy::token(move || {
            let token = std::env::var(&env_var)
                .map_err(|_| anyhow::anyhow!("environment variable {} is not set", env_var))?;
            let value = match &scheme {
                Some(scheme) => format!("{} {}", scheme, token),
                None => token,
            };
            Ok((header.clone(), value))
        })
    }

    pub fn is_certificate(&self) -> bool {
        matches!(self, AuthStrategy::Certificate { .. })
    }

    /// Certificate and key paths, if this strategy authenticates at handshake time
    pub fn client_identity(&self) -> Option<(&Path, &Path)> {
        match self {
            AuthStrategy::Certificate { certfile, keyfile } => {
                Some((certfile.as_path(), keyfile.as_path()))
            }
            AuthStrategy::Token(_) => None,
        }
    }

    /// Finish a TLS client configuration with this strategy's credentials
    pub fn apply_to_handshake(
        &self,
        builder: ConfigBuilder<ClientConfig, WantsClientCert>,
    ) -> Result<ClientConfig, StartupError> {
        match self {
            AuthStrategy::Certificate { certfile, keyfile } => {
                let certs = tls::load_certs(certfile)
                    .map_err(|detail| StartupError::option("certfile", detail))?;
                let key = tls::load_private_key(keyfile)
                    .map_err(|detail| StartupError::option("keyfile", detail))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| StartupError::option("keyfile", e.to_string()))
            }
            AuthStrategy::Token(_) => Ok(builder.with_no_client_auth()),
        }
    }

    /// Authorization header for one outbound request
    pub fn resolve_header(&self) -> Result<Option<(HeaderName, HeaderValue)>, PushError> {
        let provider = match self {
            AuthStrategy::Certificate { .. } => return Ok(None),
            AuthStrategy::Token(provider) => provider,
        };

        let (name, value) = provider
            .authorization()
            .map_err(|e| PushError::Auth(e.to_string()))?;
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| PushError::Auth(format!("bad header name {:?}: {}", name, e)))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|e| PushError::Auth(format!("bad header value: {}", e)))?;
        Ok(Some((name, value)))
    }
}

impl fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthStrategy::Certificate { certfile, keyfile } => f
                .debug_struct("Certificate")
                .field("certfile", certfile)
                .field("keyfile", keyfile)
                .finish(),
            AuthStrategy::Token(_) => f.write_str("Token(..)"),
        }
    }
}
