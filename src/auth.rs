//! Credential store contract and the building blocks of the AUTH
//! mechanisms. The challenge/response I/O itself lives with the
//! connection in [`crate::server`]; everything here is pure.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use md5::Md5;

use crate::config::Config;

pub(crate) const AUTH_ALREADY_DONE: &str = "503 Already authenticated";
pub(crate) const AUTH_CANCELLED: &str = "501 Syntax error in parameters or arguments";
pub(crate) const AUTH_ENCRYPTION_REQUIRED: &str =
    "538 Encryption required for requested authentication mechanism";
pub(crate) const AUTH_FAILED: &str = "530 Authentication failed";
pub(crate) const AUTH_REQUIRED: &str = "530 SMTP authentication is required";
pub(crate) const AUTH_UNRECOGNIZED: &str = "504 Unrecognized authentication type";
pub(crate) const AUTH_SUCCEEDED: &str = "235 2.7.0 Authentication succeeded";
pub(crate) const VRFY_ACCEPTED: &str =
    "252 Cannot VRFY user, but will accept message and attempt delivery";
pub(crate) const VRFY_REJECTED: &str = "502 Could not VRFY";

// base64("Username:") / base64("Password:")
pub(crate) const LOGIN_USERNAME_CHALLENGE: &str = "334 VXNlcm5hbWU6";
pub(crate) const LOGIN_PASSWORD_CHALLENGE: &str = "334 UGFzc3dvcmQ6";

type HmacMd5 = Hmac<Md5>;

/// A credential store the server consults during authentication.
///
/// All three operations are pure queries over attacker-controlled input:
/// they must not panic, and any inability to answer must read as a
/// negative result. The mechanisms treat every non-positive answer as an
/// authentication failure, never as success.
pub trait Authenticator: Send + Sync {
    /// Does `password` authenticate `username`?
    fn validate(&self, username: &str, password: &str) -> bool;

    /// The expected password for `username`, used by challenge/response
    /// mechanisms that never see the plaintext password on the wire.
    ///
    /// Return `None` when the store does not support challenge/response
    /// (or does not know the user); the mechanism then fails closed.
    /// Never return an empty placeholder instead.
    fn get_password(&self, username: &str) -> Option<String>;

    /// Is `username` (bare, or a full address) known at all? Independent
    /// of authentication; drives the VRFY command.
    fn verify(&self, username: &str) -> bool;
}

/// Validates against the login credentials held in a live [`Config`],
/// so credential changes are picked up without rebuilding the server.
pub struct ConfigAuthenticator {
    config: Config,
}

impl ConfigAuthenticator {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self { config })
    }
}

impl Authenticator for ConfigAuthenticator {
    fn validate(&self, username: &str, password: &str) -> bool {
        username == self.config.login_username() && password == self.config.login_password()
    }

    fn get_password(&self, _username: &str) -> Option<String> {
        Some(self.config.login_password())
    }

    fn verify(&self, username: &str) -> bool {
        let expected = self.config.login_username();
        username == expected || username.split('@').next() == Some(expected.as_str())
    }
}

/// The AUTH sub-protocols the server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    Login,
    CramMd5,
}

impl Mechanism {
    pub const ALL: [Mechanism; 3] = [Mechanism::Plain, Mechanism::Login, Mechanism::CramMd5];

    pub fn name(&self) -> &'static str {
        match self {
            Mechanism::Plain => "PLAIN",
            Mechanism::Login => "LOGIN",
            Mechanism::CramMd5 => "CRAM-MD5",
        }
    }

    /// Unknown names map to `None`; the dispatcher answers those with
    /// `504 Unrecognized authentication type`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Mechanism::Plain),
            "LOGIN" => Some(Mechanism::Login),
            "CRAM-MD5" => Some(Mechanism::CramMd5),
            _ => None,
        }
    }

    /// PLAIN and LOGIN carry the password in the clear and are only
    /// offered on an encrypted channel (unless `auth_require_tls` is
    /// switched off). CRAM-MD5 never sends the password itself.
    pub fn requires_encryption(&self) -> bool {
        matches!(self, Mechanism::Plain | Mechanism::Login)
    }
}

impl std::fmt::Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) fn b64_encode(value: &str) -> String {
    BASE64.encode(value.as_bytes())
}

pub(crate) fn b64_decode(value: &str) -> Option<String> {
    let bytes = BASE64.decode(value.trim().as_bytes()).ok()?;
    String::from_utf8(bytes).ok()
}

/// Split a decoded PLAIN blob into (username, password).
///
/// The blob is `[authzid] NUL authcid NUL password`; the authzid is
/// ignored when present. Fewer than two fields is a failure.
pub(crate) fn parse_plain_credentials(decoded: &str) -> Option<(String, String)> {
    let fields: Vec<&str> = decoded.split('\0').collect();
    if fields.len() < 2 {
        return None;
    }
    let username = fields[fields.len() - 2];
    let password = fields[fields.len() - 1];
    Some((username.to_string(), password.to_string()))
}

/// RFC 2195 challenge: `<nonce-timestamp@hostname>`.
pub(crate) fn cram_md5_challenge(hostname: &str) -> String {
    let nonce: [u8; 8] = rand::random();
    let timestamp = chrono::Utc::now().timestamp();
    format!("<{}{}@{}>", hex::encode(nonce), timestamp, hostname)
}

/// Recompute HMAC-MD5(password, challenge) and compare against the
/// client's hex digest in constant time.
pub(crate) fn verify_cram_md5(password: &str, challenge: &str, received_hex: &str) -> bool {
    let Ok(received) = hex::decode(received_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacMd5::new_from_slice(password.as_bytes()) else {
        return false;
    };
    mac.update(challenge.as_bytes());
    mac.verify_slice(&received).is_ok()
}

/// The client's expected CRAM-MD5 digest, as hex text. Test helper.
pub fn cram_md5_digest(password: &str, challenge: &str) -> String {
    let mut mac =
        HmacMd5::new_from_slice(password.as_bytes()).expect("hmac accepts any key length");
    mac.update(challenge.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mechanism_names_round_trip() {
        for mechanism in Mechanism::ALL {
            assert_eq!(Mechanism::from_name(mechanism.name()), Some(mechanism));
        }
        assert_eq!(Mechanism::from_name("cram-md5"), Some(Mechanism::CramMd5));
        assert_eq!(Mechanism::from_name("SCRAM-SHA-256"), None);
        assert_eq!(Mechanism::from_name(""), None);
    }

    #[test]
    fn plain_blob_variants() {
        assert_eq!(
            parse_plain_credentials("\0user\0password"),
            Some(("user".to_string(), "password".to_string()))
        );
        assert_eq!(
            parse_plain_credentials("admin\0user\0password"),
            Some(("user".to_string(), "password".to_string()))
        );
        assert_eq!(
            parse_plain_credentials("user\0password"),
            Some(("user".to_string(), "password".to_string()))
        );
        assert_eq!(parse_plain_credentials("password"), None);
    }

    #[test]
    fn cram_md5_digest_round_trips() {
        let challenge = cram_md5_challenge("mail.example.org");
        assert!(challenge.starts_with('<'));
        assert!(challenge.ends_with("@mail.example.org>"));

        let digest = cram_md5_digest("password", &challenge);
        assert!(verify_cram_md5("password", &challenge, &digest));
        assert!(!verify_cram_md5("letmein", &challenge, &digest));
        assert!(!verify_cram_md5("password", &challenge, "zz-not-hex"));
    }

    #[test]
    fn config_authenticator_follows_live_config() {
        let config = Config::new();
        let auth = ConfigAuthenticator::new(config.clone());
        assert!(auth.validate("user", "password"));
        assert!(!auth.validate("user", "wrong"));

        config.set_login_password("hunter2");
        assert!(auth.validate("user", "hunter2"));
        assert_eq!(auth.get_password("user").as_deref(), Some("hunter2"));
    }

    #[test]
    fn config_authenticator_verifies_addresses() {
        let auth = ConfigAuthenticator::new(Config::new());
        assert!(auth.verify("user"));
        assert!(auth.verify("user@example.org"));
        assert!(!auth.verify("someone.else@example.org"));
    }

    #[test]
    fn base64_helpers_reject_garbage() {
        assert_eq!(b64_decode(&b64_encode("abc")).as_deref(), Some("abc"));
        assert_eq!(b64_decode("!!!"), None);
    }
}
