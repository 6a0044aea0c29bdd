//! Establishing one HTTP/2 session
//!
//! TCP connect, optional TLS (with the pool's client identity), HTTP/2
//! handshake, and one confirmed ping round-trip. The connection is driven
//! inline until the ping is answered so that a peer rejecting the client
//! certificate after a TLS 1.3 handshake still fails here, not later.

use crate::config::ConnectionConfig;
use crate::error::StartupError;
use crate::tls;
use bytes::Bytes;
use h2::client::SendRequest;
use h2::{Ping, PingPong};
use rustls::ClientConfig;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// A live HTTP/2 session owned by exactly one worker
pub(crate) struct Session {
    pub send_request: SendRequest<Bytes>,
    pub ping_pong: PingPong,

    /// Drives the connection; completes when the transport closes
    pub driver: JoinHandle<Result<(), h2::Error>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Open a session within `config.connect_timeout`
pub(crate) async fn establish(
    config: &ConnectionConfig,
    tls_config: Option<&Arc<ClientConfig>>,
) -> Result<Session, StartupError> {
    tokio::time::timeout(config.connect_timeout, connect(config, tls_config))
        .await
        .map_err(|_| StartupError::Timeout(config.connect_timeout))?
}

async fn connect(
    config: &ConnectionConfig,
    tls_config: Option<&Arc<ClientConfig>>,
) -> Result<Session, StartupError> {
    let addr = config.authority();
    let connect_error = |source: std::io::Error| StartupError::Connect {
        addr: addr.clone(),
        source,
    };

    let stream = TcpStream::connect(&addr).await.map_err(connect_error)?;
    stream.set_nodelay(true).map_err(connect_error)?;

    // Configure TCP keep-alive
    let socket = socket2::Socket::from(stream.into_std().map_err(connect_error)?);
    socket.set_keepalive(true).map_err(connect_error)?;
    let stream = TcpStream::from_std(socket.into()).map_err(connect_error)?;

    debug!(addr = %addr, tls = tls_config.is_some(), "TCP connected");

    match tls_config {
        Some(tls_config) => {
            let server_name = tls::server_name(&config.tls_options, &config.domain)?;
            let connector = TlsConnector::from(Arc::clone(tls_config));
            let stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| match tls::alert_from_io(&e) {
                    Some(alert) => StartupError::TlsAlert { alert },
                    None => StartupError::Tls(e.to_string()),
                })?;
            handshake(stream).await
        }
        None => handshake(stream).await,
    }
}

async fn handshake<T>(io: T) -> Result<Session, StartupError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (send_request, mut connection) = h2::client::Builder::new()
        .handshake::<_, Bytes>(io)
        .await
        .map_err(|e| startup_error(&e))?;

    let mut ping_pong = connection
        .ping_pong()
        .ok_or_else(|| StartupError::Handshake("ping handle unavailable".to_string()))?;
    let mut connection = Box::pin(connection);

    {
        let confirm = ping_pong.ping(Ping::opaque());
        tokio::pin!(confirm);

        tokio::select! {
            closed = connection.as_mut() => {
                return Err(match closed {
                    Ok(()) => StartupError::Handshake("peer closed the connection".to_string()),
                    Err(e) => startup_error(&e),
                });
            }
            pong = &mut confirm => {
                pong.map_err(|e| startup_error(&e))?;
            }
        }
    }

    let driver = tokio::spawn(connection);

    Ok(Session {
        send_request,
        ping_pong,
        driver,
    })
}

fn startup_error(err: &h2::Error) -> StartupError {
    match tls::alert_from_h2(err) {
        Some(alert) => StartupError::TlsAlert { alert },
        None => StartupError::Handshake(err.to_string()),
    }
}
