//! A disposable, in-process SMTP server for testing code that sends
//! email, without touching a real mail transfer agent.
//!
//! The server speaks plaintext, STARTTLS, and implicit-TLS submission,
//! optionally authenticates clients (PLAIN, LOGIN, CRAM-MD5), can require
//! authentication before accepting mail, and records every received
//! message in an in-memory log the test reads back. Changing any
//! [`Config`] field while the server runs restarts the listener in place,
//! keeping the captured messages.
//!
//! ```no_run
//! use smtp_fixture::{Config, SmtpController};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let server = SmtpController::new(Config::new());
//! server.start().await?;
//!
//! // Point the code under test at (server.hostname(), server.port()),
//! // let it send, then inspect what arrived:
//! let messages = server.messages();
//! assert_eq!(messages.len(), 1);
//! assert_eq!(messages[0].header("Subject"), Some("Foo"));
//!
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod auth;
pub mod certs;
mod config;
mod controller;
mod error;
mod message;
mod server;
mod session;
mod tls;

pub use auth::{cram_md5_digest, Authenticator, ConfigAuthenticator, Mechanism};
pub use config::Config;
pub use controller::{ControllerOptions, SmtpController};
pub use error::{Error, Result};
pub use message::Message;
