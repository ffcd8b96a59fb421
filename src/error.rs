use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Errors surfaced by the fixture outside of the SMTP dialogue itself.
///
/// Protocol-level problems (bad command sequence, failed authentication)
/// are reported to the client as status lines and never appear here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid boolean value {value:?} for {key}")]
    InvalidBool { key: String, value: String },

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },

    #[error("certificate file not found: {0}")]
    CertificateNotFound(PathBuf),

    #[error("failed to generate certificate: {0}")]
    CertificateGeneration(#[source] rcgen::Error),

    #[error("TLS setup failed: {0}")]
    TlsSetup(#[source] io::Error),

    #[error("TLS handshake cancelled by shutdown")]
    HandshakeCancelled,

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("listener did not become ready within {0:?}")]
    ReadyTimeout(Duration),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
