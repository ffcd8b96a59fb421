use std::path::PathBuf;

use anyhow::Result;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

use smtp_fixture::{certs, Config, SmtpController};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "smtp-fixture",
    about = "A disposable SMTP server for testing code that sends email"
)]
struct Opt {
    /// Listening address (overrides SMTPD_HOST)
    #[structopt(short = "a", long = "address")]
    address: Option<String>,

    /// Listening port; 0 picks a free port (overrides SMTPD_PORT)
    #[structopt(short = "p", long = "port")]
    port: Option<u16>,

    /// Require authentication before MAIL/RCPT/DATA
    #[structopt(long = "enforce-auth")]
    enforce_auth: bool,

    /// Login username
    #[structopt(long = "username")]
    username: Option<String>,

    /// Login password
    #[structopt(long = "password")]
    password: Option<String>,

    /// Allow PLAIN/LOGIN on unencrypted connections
    #[structopt(long = "allow-cleartext-auth")]
    allow_cleartext_auth: bool,

    /// Offer STARTTLS
    #[structopt(long = "starttls")]
    starttls: bool,

    /// Serve implicit TLS from the first byte
    #[structopt(long = "ssl")]
    ssl: bool,

    /// TLS certificate file
    #[structopt(long = "tls-cert", parse(from_os_str))]
    tls_cert: Option<PathBuf>,

    /// TLS private key file
    #[structopt(long = "tls-key", parse(from_os_str))]
    tls_key: Option<PathBuf>,

    /// Generate a throwaway self-signed certificate in this directory
    /// and use it
    #[structopt(long = "generate-certs", parse(from_os_str))]
    generate_certs: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opt = Opt::from_args();
    let config = Config::from_env()?;
    if let Some(address) = opt.address {
        config.set_host(address);
    }
    if let Some(port) = opt.port {
        config.set_port(port);
    }
    if opt.enforce_auth {
        config.set_enforce_auth(true);
    }
    if let Some(username) = opt.username {
        config.set_login_username(username);
    }
    if let Some(password) = opt.password {
        config.set_login_password(password);
    }
    if opt.allow_cleartext_auth {
        config.set_auth_require_tls(false);
    }
    if opt.starttls {
        config.set_use_starttls(true);
    }
    if opt.ssl {
        config.set_use_ssl(true);
    }
    if let Some(dir) = opt.generate_certs {
        std::fs::create_dir_all(&dir)?;
        let (cert, key) = certs::generate(&dir)?;
        config.set_ssl_cert_files(cert, Some(key))?;
    }
    if let Some(cert) = opt.tls_cert {
        config.set_ssl_cert_files(cert, opt.tls_key)?;
    }

    let server = SmtpController::new(config);
    server.start().await?;
    tracing::info!(
        "listening on {}:{} (ctrl-c to stop)",
        server.hostname(),
        server.port()
    );

    tokio::signal::ctrl_c().await?;
    server.stop().await;
    tracing::info!("captured {} message(s)", server.messages().len());
    Ok(())
}
