//! TLS material resolution and handshakes, shared by the implicit-TLS
//! listener and the STARTTLS upgrade.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::{Certificate, PrivateKey, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::config::ConfigValues;
use crate::error::{Error, Result};

pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolve a configured certificate or key path: as given first, then
/// under the certificate directory.
pub(crate) fn resolve_cert_file(certs_path: &Path, file: &Path) -> Result<PathBuf> {
    if file.is_file() {
        return Ok(file.to_path_buf());
    }
    let joined = certs_path.join(file);
    if joined.is_file() {
        return Ok(joined);
    }
    Err(Error::CertificateNotFound(file.to_path_buf()))
}

fn invalid(message: String) -> Error {
    Error::TlsSetup(io::Error::new(io::ErrorKind::InvalidData, message))
}

/// Load a PEM certificate chain and private key into an acceptor.
pub(crate) fn build_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_file = File::open(cert_path).map_err(Error::TlsSetup)?;
    let mut cert_reader = BufReader::new(cert_file);
    let cert_chain: Vec<Certificate> = rustls_pemfile::certs(&mut cert_reader)
        .map_err(Error::TlsSetup)?
        .into_iter()
        .map(Certificate)
        .collect();
    if cert_chain.is_empty() {
        return Err(invalid(format!(
            "no certificate found in {}",
            cert_path.display()
        )));
    }

    let key_file = File::open(key_path).map_err(Error::TlsSetup)?;
    let mut key_reader = BufReader::new(key_file);
    let mut keys =
        rustls_pemfile::pkcs8_private_keys(&mut key_reader).map_err(Error::TlsSetup)?;
    if keys.is_empty() {
        // Not PKCS#8; retry the file as a traditional RSA key.
        let key_file = File::open(key_path).map_err(Error::TlsSetup)?;
        let mut key_reader = BufReader::new(key_file);
        keys = rustls_pemfile::rsa_private_keys(&mut key_reader).map_err(Error::TlsSetup)?;
    }
    let key = keys
        .into_iter()
        .next()
        .ok_or_else(|| invalid(format!("no private key found in {}", key_path.display())))?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, PrivateKey(key))
        .map_err(|err| invalid(format!("failed to build TLS config: {err}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build an acceptor from the configured certificate/key paths.
pub(crate) fn acceptor_from_values(values: &ConfigValues) -> Result<TlsAcceptor> {
    let cert = resolve_cert_file(&values.ssl_certs_path, &values.ssl_cert_file)?;
    let key = resolve_cert_file(&values.ssl_certs_path, &values.ssl_key_file)?;
    build_acceptor(&cert, &key)
}

/// Run a server-side handshake, bounded by [`HANDSHAKE_TIMEOUT`].
///
/// A shutdown signal arriving mid-handshake is reported as
/// [`Error::HandshakeCancelled`], distinct from a handshake failure.
pub(crate) async fn handshake<S>(
    acceptor: &TlsAcceptor,
    stream: S,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        _ = shutdown.changed() => Err(Error::HandshakeCancelled),
        accepted = timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)) => match accepted {
            Err(_) => Err(Error::TlsSetup(io::Error::new(
                io::ErrorKind::TimedOut,
                "TLS handshake timed out",
            ))),
            Ok(Err(err)) => Err(Error::TlsSetup(err)),
            Ok(Ok(stream)) => Ok(stream),
        },
    }
}
