//! TLS client configuration for worker sessions
//!
//! Builds a rustls `ClientConfig` from [`TlsOptions`] and the pool's
//! [`AuthStrategy`], validating every option before any socket is opened.
//! Also maps rustls failures buried inside transport errors back to a TLS
//! alert name so startup failures can be reported structurally.

use crate::auth::AuthStrategy;
use crate::config::{TlsOptions, Verify};
use crate::error::StartupError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

const ALPN_H2: &[u8] = b"h2";

/// Build the client config a worker uses for every (re)connection
pub fn client_config(
    options: &TlsOptions,
    auth: &AuthStrategy,
) -> Result<Arc<ClientConfig>, StartupError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| StartupError::option("versions", e.to_string()))?;

    let builder = match options.verify {
        Verify::VerifyPeer => {
            let cacertfile = options.cacertfile.as_ref().ok_or_else(|| {
                StartupError::option("cacertfile", "required when verify is verify_peer")
            })?;
            let mut roots = RootCertStore::empty();
            for cert in load_certs(cacertfile).map_err(|d| StartupError::option("cacertfile", d))? {
                roots
                    .add(cert)
                    .map_err(|e| StartupError::option("cacertfile", e.to_string()))?;
            }
            builder.with_root_certificates(roots)
        }
        Verify::VerifyNone => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier { provider })),
    };

    let mut config = auth.apply_to_handshake(builder)?;
    config.alpn_protocols = vec![ALPN_H2.to_vec()];

    Ok(Arc::new(config))
}

/// SNI name for the session, honoring an explicit override
pub fn server_name(options: &TlsOptions, domain: &str) -> Result<ServerName<'static>, StartupError> {
    let name = options.server_name.as_deref().unwrap_or(domain);
    ServerName::try_from(name.to_string())
        .map_err(|e| StartupError::option("server_name", format!("{}: {}", name, e)))
}

/// Load every PEM certificate from a file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, String> {
    let file = std::fs::File::open(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("{}: {}", path.display(), e))?;
    if certs.is_empty() {
        return Err(format!("{}: no certificates found", path.display()));
    }
    Ok(certs)
}

/// Load the first PEM private key from a file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, String> {
    let file = std::fs::File::open(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| format!("{}: {}", path.display(), e))?
        .ok_or_else(|| format!("{}: no private key found", path.display()))
}

/// Extract a TLS alert name from an I/O error raised by the TLS stream
pub fn alert_from_io(err: &std::io::Error) -> Option<String> {
    if let Some(tls_err) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        return alert_name(tls_err);
    }
    // h2 flattens transport errors to their message
    alert_from_message(&err.to_string())
}

fn alert_from_message(message: &str) -> Option<String> {
    if let Some((_, rest)) = message.split_once("received fatal alert: ") {
        let name: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();
        return (!name.is_empty()).then(|| snake_case(&name));
    }
    if message.contains("invalid peer certificate") {
        return Some(if message.contains("UnknownIssuer") {
            "unknown_ca".to_string()
        } else {
            "bad_certificate".to_string()
        });
    }
    None
}

/// Extract a TLS alert name from an HTTP/2 error whose cause was the TLS layer
pub fn alert_from_h2(err: &h2::Error) -> Option<String> {
    err.get_io().and_then(alert_from_io)
}

fn alert_name(err: &rustls::Error) -> Option<String> {
    match err {
        rustls::Error::AlertReceived(alert) => Some(snake_case(&format!("{:?}", alert))),
        rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer) => {
            Some("unknown_ca".to_string())
        }
        rustls::Error::InvalidCertificate(_) => Some("bad_certificate".to_string()),
        _ => None,
    }
}

fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

/// Accepts any server certificate; used for `verify_none`
#[derive(Debug)]
struct NoVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
