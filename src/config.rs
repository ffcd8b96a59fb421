//! Runtime configuration for the fixture server.
//!
//! `Config` is a cheaply cloneable handle. Every setter emits a change
//! notification; a running [`SmtpController`](crate::SmtpController)
//! consumes those notifications and restarts its listener, so tests can
//! flip a field mid-run and keep talking to the server at its new address.

use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::{Error, Result};

const DEFAULT_USERNAME: &str = "user";
const DEFAULT_PASSWORD: &str = "password";
const DEFAULT_CERT_FILE: &str = "cert.pem";
const DEFAULT_KEY_FILE: &str = "key.pem";
const DEFAULT_CERTS_PATH: &str = "certs";
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Strict boolean grammar shared by every `SMTPD_*` toggle.
pub(crate) fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "y" | "yes" | "t" | "true" | "on" | "1" => Ok(true),
        "n" | "no" | "f" | "false" | "off" | "0" => Ok(false),
        _ => Err(Error::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(value) => parse_bool(key, &value),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ConfigValues {
    pub host: String,
    pub port: u16,
    pub ready_timeout: Duration,
    pub login_username: String,
    pub login_password: String,
    pub enforce_auth: bool,
    pub auth_require_tls: bool,
    pub ssl_cert_file: PathBuf,
    pub ssl_key_file: PathBuf,
    pub ssl_certs_path: PathBuf,
    pub use_starttls: bool,
    pub use_ssl: bool,
}

impl Default for ConfigValues {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            // Port 0 binds an ephemeral port; the controller reports the
            // actual address once started.
            port: 0,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            login_username: DEFAULT_USERNAME.to_string(),
            login_password: DEFAULT_PASSWORD.to_string(),
            enforce_auth: false,
            auth_require_tls: true,
            ssl_cert_file: PathBuf::from(DEFAULT_CERT_FILE),
            ssl_key_file: PathBuf::from(DEFAULT_KEY_FILE),
            ssl_certs_path: PathBuf::from(DEFAULT_CERTS_PATH),
            use_starttls: false,
            use_ssl: false,
        }
    }
}

#[derive(Debug)]
struct Inner {
    values: Mutex<ConfigValues>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<()>>>,
}

/// Shared, mutable server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    inner: Arc<Inner>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// A configuration with built-in defaults, ignoring the environment.
    pub fn new() -> Self {
        Self::from_values(ConfigValues::default())
    }

    fn from_values(values: ConfigValues) -> Self {
        Self {
            inner: Arc::new(Inner {
                values: Mutex::new(values),
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Build a configuration from the `SMTPD_*` environment variables,
    /// falling back to defaults for anything unset.
    ///
    /// Fails fast on malformed booleans or numbers, and on an explicitly
    /// configured certificate or key file that does not exist.
    pub fn from_env() -> Result<Self> {
        let mut values = ConfigValues::default();

        if let Ok(host) = env::var("SMTPD_HOST") {
            values.host = host;
        }
        if let Ok(port) = env::var("SMTPD_PORT") {
            values.port = port.parse().map_err(|_| Error::InvalidValue {
                key: "SMTPD_PORT".to_string(),
                value: port.clone(),
            })?;
        }
        if let Ok(timeout) = env::var("SMTPD_READY_TIMEOUT") {
            let secs: f64 = timeout.parse().map_err(|_| Error::InvalidValue {
                key: "SMTPD_READY_TIMEOUT".to_string(),
                value: timeout.clone(),
            })?;
            values.ready_timeout = Duration::from_secs_f64(secs);
        }
        if let Ok(username) = env::var("SMTPD_LOGIN_NAME") {
            values.login_username = username;
        }
        if let Ok(password) = env::var("SMTPD_LOGIN_PASSWORD") {
            values.login_password = password;
        }
        values.enforce_auth = env_bool("SMTPD_ENFORCE_AUTH", false)?;
        values.auth_require_tls = env_bool("SMTPD_AUTH_REQUIRE_TLS", true)?;
        values.use_starttls = env_bool("SMTPD_USE_STARTTLS", false)?;
        // SMTPD_USE_TLS is an accepted alias; both spellings are parsed
        // so a malformed value in either fails fast.
        let use_ssl = env_bool("SMTPD_USE_SSL", false)?;
        let use_tls = env_bool("SMTPD_USE_TLS", false)?;
        values.use_ssl = use_ssl || use_tls;

        if let Ok(path) = env::var("SMTPD_SSL_CERTS_PATH") {
            values.ssl_certs_path = PathBuf::from(path);
        }
        if let Ok(file) = env::var("SMTPD_SSL_CERTIFICATE_FILE") {
            let file = PathBuf::from(file);
            if !file.is_file() {
                return Err(Error::CertificateNotFound(file));
            }
            values.ssl_cert_file = file;
        }
        if let Ok(file) = env::var("SMTPD_SSL_KEY_FILE") {
            let file = PathBuf::from(file);
            if !file.is_file() {
                return Err(Error::CertificateNotFound(file));
            }
            values.ssl_key_file = file;
        }

        Ok(Self::from_values(values))
    }

    pub(crate) fn snapshot(&self) -> ConfigValues {
        self.inner.values.lock().unwrap().clone()
    }

    /// Register a change watcher. Every setter call sends one message.
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.watchers.lock().unwrap().push(tx);
        rx
    }

    fn notify(&self) {
        let mut watchers = self.inner.watchers.lock().unwrap();
        watchers.retain(|w| w.send(()).is_ok());
    }

    fn update<R>(&self, apply: impl FnOnce(&mut ConfigValues) -> R) -> R {
        let result = apply(&mut self.inner.values.lock().unwrap());
        self.notify();
        result
    }

    pub fn host(&self) -> String {
        self.inner.values.lock().unwrap().host.clone()
    }

    pub fn set_host(&self, host: impl Into<String>) {
        let host = host.into();
        self.update(|v| v.host = host);
    }

    pub fn port(&self) -> u16 {
        self.inner.values.lock().unwrap().port
    }

    pub fn set_port(&self, port: u16) {
        self.update(|v| v.port = port);
    }

    pub fn ready_timeout(&self) -> Duration {
        self.inner.values.lock().unwrap().ready_timeout
    }

    pub fn set_ready_timeout(&self, timeout: Duration) {
        self.update(|v| v.ready_timeout = timeout);
    }

    pub fn login_username(&self) -> String {
        self.inner.values.lock().unwrap().login_username.clone()
    }

    pub fn set_login_username(&self, username: impl Into<String>) {
        let username = username.into();
        self.update(|v| v.login_username = username);
    }

    pub fn login_password(&self) -> String {
        self.inner.values.lock().unwrap().login_password.clone()
    }

    pub fn set_login_password(&self, password: impl Into<String>) {
        let password = password.into();
        self.update(|v| v.login_password = password);
    }

    pub fn enforce_auth(&self) -> bool {
        self.inner.values.lock().unwrap().enforce_auth
    }

    pub fn set_enforce_auth(&self, enforce: bool) {
        self.update(|v| v.enforce_auth = enforce);
    }

    pub fn auth_require_tls(&self) -> bool {
        self.inner.values.lock().unwrap().auth_require_tls
    }

    pub fn set_auth_require_tls(&self, require: bool) {
        self.update(|v| v.auth_require_tls = require);
    }

    pub fn use_starttls(&self) -> bool {
        self.inner.values.lock().unwrap().use_starttls
    }

    pub fn set_use_starttls(&self, enabled: bool) {
        self.update(|v| v.use_starttls = enabled);
    }

    pub fn use_ssl(&self) -> bool {
        self.inner.values.lock().unwrap().use_ssl
    }

    pub fn set_use_ssl(&self, enabled: bool) {
        self.update(|v| v.use_ssl = enabled);
    }

    pub fn ssl_certs_path(&self) -> PathBuf {
        self.inner.values.lock().unwrap().ssl_certs_path.clone()
    }

    pub fn set_ssl_certs_path(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.update(|v| v.ssl_certs_path = path);
    }

    pub fn ssl_cert_file(&self) -> PathBuf {
        self.inner.values.lock().unwrap().ssl_cert_file.clone()
    }

    pub fn ssl_key_file(&self) -> PathBuf {
        self.inner.values.lock().unwrap().ssl_key_file.clone()
    }

    /// Point the configuration at an explicit certificate/key pair.
    ///
    /// Both files must already exist; a missing file fails here rather
    /// than at the next listener start. Passing `None` for the key reuses
    /// the certificate file (combined PEM).
    pub fn set_ssl_cert_files(
        &self,
        cert: impl Into<PathBuf>,
        key: Option<PathBuf>,
    ) -> Result<()> {
        let cert = cert.into();
        if !cert.is_file() {
            return Err(Error::CertificateNotFound(cert));
        }
        let key = match key {
            Some(key) => {
                if !key.is_file() {
                    return Err(Error::CertificateNotFound(key));
                }
                key
            }
            None => cert.clone(),
        };
        self.update(|v| {
            v.ssl_cert_file = cert;
            v.ssl_key_file = key;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_the_usual_spellings() {
        for value in ["y", "YES", "t", "True", "on", "1"] {
            assert!(parse_bool("K", value).unwrap(), "{value}");
        }
        for value in ["n", "NO", "f", "False", "off", "0"] {
            assert!(!parse_bool("K", value).unwrap(), "{value}");
        }
    }

    #[test]
    fn parse_bool_rejects_anything_else() {
        for value in ["", "2", "maybe", "tru"] {
            assert!(matches!(
                parse_bool("SMTPD_ENFORCE_AUTH", value),
                Err(Error::InvalidBool { .. })
            ));
        }
    }

    #[test]
    fn defaults() {
        let config = Config::new();
        assert_eq!(config.host(), "localhost");
        assert_eq!(config.port(), 0);
        assert_eq!(config.login_username(), "user");
        assert_eq!(config.login_password(), "password");
        assert!(!config.enforce_auth());
        assert!(config.auth_require_tls());
        assert!(!config.use_starttls());
        assert!(!config.use_ssl());
    }

    #[test]
    fn setters_notify_subscribers_once_per_write() {
        let config = Config::new();
        let mut rx = config.subscribe();
        config.set_port(2525);
        config.set_enforce_auth(true);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn missing_cert_file_is_rejected_at_assignment() {
        let config = Config::new();
        let err = config
            .set_ssl_cert_files("/definitely/not/here.pem", None)
            .unwrap_err();
        assert!(matches!(err, Error::CertificateNotFound(_)));
    }
}
