//! Throwaway self-signed certificates for TLS-enabled test runs.
//! Never use this material for anything beyond a test fixture.

use std::fs;
use std::path::{Path, PathBuf};

use rcgen::{generate_simple_self_signed, CertifiedKey};

use crate::error::{Error, Result};

/// Generate a self-signed certificate and key valid for localhost, and
/// write them to `cert.pem` / `key.pem` under `dir`.
///
/// Returns the two paths, ready for
/// [`Config::set_ssl_cert_files`](crate::Config::set_ssl_cert_files) or
/// `SMTPD_SSL_CERTS_PATH`.
pub fn generate(dir: &Path) -> Result<(PathBuf, PathBuf)> {
    let names = vec![
        "localhost".to_string(),
        "localhost.localdomain".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ];
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(names).map_err(Error::CertificateGeneration)?;

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    fs::write(&cert_path, cert.pem())?;
    fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}
