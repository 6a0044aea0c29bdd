//! Shared fixtures: a local HTTP/2 endpoint and a throwaway PKI
//!
//! Endpoint routes:
//! - `/echo`         200 with the request body; `x-seen-authorization` and
//!                   `x-seen-method` reflect what arrived
//! - `/fingerprint`  200 with the hex SHA-256 of the client certificate
//! - `/hang`         never answers
//! - `/status/<n>`   answers with status `n`
//! - `/reset`        resets the stream without answering
#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use pushpool::{AuthStrategy, ConnectionConfig, Scheme, TlsOptions, Verify};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// One signed identity on disk
pub struct Identity {
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
    pub der: CertificateDer<'static>,
    key_der: Vec<u8>,
}

/// CA, server and client identities, plus a client signed by an unrelated CA
pub struct TestPki {
    dir: TempDir,
    pub cacertfile: PathBuf,
    ca_der: CertificateDer<'static>,
    pub server: Identity,
    pub client: Identity,
    pub rogue_client: Identity,
}

struct Authority {
    cert: rcgen::Certificate,
    key: KeyPair,
}

fn authority(name: &str) -> Authority {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name.push(DnType::CommonName, name);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let cert = params.self_signed(&key).unwrap();
    Authority { cert, key }
}

fn issue(
    dir: &TempDir,
    name: &str,
    san: &str,
    usage: ExtendedKeyUsagePurpose,
    issuer: &Authority,
) -> Identity {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec![san.to_string()]).unwrap();
    params.distinguished_name.push(DnType::CommonName, name);
    params.extended_key_usages = vec![usage];
    let cert = params.signed_by(&key, &issuer.cert, &issuer.key).unwrap();

    let certfile = dir.path().join(format!("{}.pem", name));
    let keyfile = dir.path().join(format!("{}-key.pem", name));
    std::fs::write(&certfile, cert.pem()).unwrap();
    std::fs::write(&keyfile, key.serialize_pem()).unwrap();

    Identity {
        certfile,
        keyfile,
        der: cert.der().clone(),
        key_der: key.serialize_der(),
    }
}

impl TestPki {
    pub fn generate() -> Self {
        let dir = TempDir::new().unwrap();
        let ca = authority("pushpool test ca");
        let rogue_ca = authority("unrelated ca");

        let cacertfile = dir.path().join("ca.pem");
        std::fs::write(&cacertfile, ca.cert.pem()).unwrap();

        let server = issue(&dir, "server", "localhost", ExtendedKeyUsagePurpose::ServerAuth, &ca);
        let client = issue(&dir, "client", "client.pushpool.test", ExtendedKeyUsagePurpose::ClientAuth, &ca);
        let rogue_client = issue(
            &dir,
            "rogue",
            "rogue.pushpool.test",
            ExtendedKeyUsagePurpose::ClientAuth,
            &rogue_ca,
        );

        Self {
            cacertfile,
            ca_der: ca.cert.der().clone(),
            server,
            client,
            rogue_client,
            dir,
        }
    }

    /// Server config that requires a client certificate issued by the CA
    fn server_config(&self) -> Arc<ServerConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_der.clone()).unwrap();
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
            .build()
            .unwrap();

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.server.key_der.clone()));
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_client_cert_verifier(verifier)
            .with_single_cert(vec![self.server.der.clone()], key)
            .unwrap();
        config.alpn_protocols = vec![b"h2".to_vec()];
        Arc::new(config)
    }
}

#[derive(Default)]
struct ServerState {
    accepted: AtomicUsize,
    hanging: AtomicUsize,
}

/// Local HTTP/2 endpoint; dropping it closes every connection
pub struct TestServer {
    pub addr: SocketAddr,
    state: Arc<ServerState>,
    drop_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl TestServer {
    /// Cleartext HTTP/2 with prior knowledge
    pub async fn plain() -> Self {
        Self::start(None).await
    }

    /// HTTP/2 over TLS, verifying client certificates against the PKI's CA
    pub async fn mtls(pki: &TestPki) -> Self {
        Self::start(Some(TlsAcceptor::from(pki.server_config()))).await
    }

    async fn start(acceptor: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::default());
        let (drop_tx, _) = broadcast::channel(4);

        let accept_task = {
            let state = Arc::clone(&state);
            let drop_tx = drop_tx.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        continue;
                    };
                    state.accepted.fetch_add(1, Ordering::SeqCst);
                    let drop_rx = drop_tx.subscribe();
                    let state = Arc::clone(&state);

                    match acceptor.clone() {
                        Some(acceptor) => {
                            tokio::spawn(async move {
                                // Rejected client certificates end here
                                let Ok(tls) = acceptor.accept(stream).await else {
                                    return;
                                };
                                let peer = tls
                                    .get_ref()
                                    .1
                                    .peer_certificates()
                                    .and_then(|certs| certs.first())
                                    .map(|cert| fingerprint(cert.as_ref()));
                                serve(tls, peer, state, drop_rx).await;
                            });
                        }
                        None => {
                            tokio::spawn(serve(stream, None, state, drop_rx));
                        }
                    }
                }
            })
        };

        Self {
            addr,
            state,
            drop_tx,
            accept_task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// `/hang` requests received so far
    pub fn hanging(&self) -> usize {
        self.state.hanging.load(Ordering::SeqCst)
    }

    /// Close every open connection without a GOAWAY
    pub fn drop_connections(&self) {
        let _ = self.drop_tx.send(());
    }

    /// Stop accepting and close every open connection
    pub fn stop(&self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve<T>(
    io: T,
    peer: Option<String>,
    state: Arc<ServerState>,
    mut drop_rx: broadcast::Receiver<()>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer = Arc::new(peer);
    let service = service_fn(move |req| {
        let peer = Arc::clone(&peer);
        let state = Arc::clone(&state);
        async move {
            // A failing service makes the server send RST_STREAM
            if req.uri().path() == "/reset" {
                return Err(io::Error::new(io::ErrorKind::Other, "reset requested"));
            }
            Ok(handle(req, &peer, &state).await)
        }
    });

    let connection = http2::Builder::new(TokioExecutor::new()).serve_connection(TokioIo::new(io), service);
    tokio::select! {
        _ = connection => {}
        _ = drop_rx.recv() => {}
    }
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn handle(
    req: Request<Incoming>,
    peer: &Option<String>,
    state: &ServerState,
) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_string();

    if path == "/echo" {
        let method = req.method().to_string();
        let authorization = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => return respond(StatusCode::BAD_REQUEST, "bad body"),
        };

        let mut response = respond(StatusCode::OK, body);
        let headers = response.headers_mut();
        headers.insert("x-seen-method", method.parse().unwrap());
        if let Some(value) = authorization {
            headers.insert("x-seen-authorization", value.parse().unwrap());
        }
        return response;
    }

    if path == "/fingerprint" {
        return match peer {
            Some(fp) => respond(StatusCode::OK, fp.clone()),
            None => respond(StatusCode::FORBIDDEN, "no client certificate"),
        };
    }

    if path == "/hang" {
        state.hanging.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
    }

    let status = path
        .strip_prefix("/status/")
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok());
    if let Some(status) = status {
        return respond(status, format!("status {}", status.as_u16()));
    }

    respond(StatusCode::NOT_FOUND, "not found")
}

/// Listener that accepts connections and never writes a byte
pub struct SilentServer {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl SilentServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        Self { addr, task }
    }
}

impl Drop for SilentServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// TCP relay in front of an endpoint
///
/// Paused relays keep both sockets open but forward nothing, which looks
/// like a half-open connection to the client.
pub struct TcpProxy {
    pub addr: SocketAddr,
    paused: watch::Sender<bool>,
    refuse: Arc<AtomicUsize>,
    refused: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl TcpProxy {
    pub async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (paused, paused_rx) = watch::channel(false);
        let refuse = Arc::new(AtomicUsize::new(0));
        let refused = Arc::new(AtomicUsize::new(0));

        let task = {
            let refuse = Arc::clone(&refuse);
            let refused = Arc::clone(&refused);
            tokio::spawn(async move {
                while let Ok((inbound, _)) = listener.accept().await {
                    let refusing = refuse
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok();
                    if refusing {
                        refused.fetch_add(1, Ordering::SeqCst);
                        drop(inbound);
                        continue;
                    }
                    let Ok(outbound) = TcpStream::connect(upstream).await else {
                        continue;
                    };
                    let (client_read, client_write) = inbound.into_split();
                    let (server_read, server_write) = outbound.into_split();
                    tokio::spawn(relay(client_read, server_write, paused_rx.clone()));
                    tokio::spawn(relay(server_read, client_write, paused_rx.clone()));
                }
            })
        };

        Self {
            addr,
            paused,
            refuse,
            refused,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Hold every byte in both directions until `resume`
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Close the next `n` accepted connections straight away
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    /// Connections closed by `refuse_next` so far
    pub fn refused(&self) -> usize {
        self.refused.load(Ordering::SeqCst)
    }
}

impl Drop for TcpProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn relay(mut from: OwnedReadHalf, mut to: OwnedWriteHalf, mut paused: watch::Receiver<bool>) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = match from.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if paused.wait_for(|paused| !*paused).await.is_err() {
            break;
        }
        if to.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = to.shutdown().await;
}

/// Cleartext config with a static bearer token and quick reconnects
pub fn plain_config(port: u16) -> ConnectionConfig {
    let mut config = ConnectionConfig::new(
        "127.0.0.1",
        port,
        AuthStrategy::static_token("authorization", "bearer test-token"),
    );
    config.scheme = Scheme::Http;
    config.ping_interval = Duration::from_millis(500);
    config.reconnect_attempts = 3;
    config.reconnect_backoff = Duration::from_millis(20);
    config.default_timeout = Duration::from_secs(5);
    config.connect_timeout = Duration::from_secs(2);
    config
}

/// TLS config presenting `identity`, verifying the server against the PKI's CA
pub fn mtls_config(port: u16, pki: &TestPki, identity: &Identity) -> ConnectionConfig {
    let mut config = ConnectionConfig::new(
        "127.0.0.1",
        port,
        AuthStrategy::certificate(&identity.certfile, &identity.keyfile),
    );
    config.tls_options = TlsOptions {
        verify: Verify::VerifyPeer,
        cacertfile: Some(pki.cacertfile.clone()),
        server_name: Some("localhost".to_string()),
    };
    config.ping_interval = Duration::from_millis(500);
    config.reconnect_backoff = Duration::from_millis(20);
    config.default_timeout = Duration::from_secs(5);
    config.connect_timeout = Duration::from_secs(2);
    config
}

/// Poll `check` every 10ms until it holds or `limit` passes
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
