//! Listener lifecycle and the test-facing server handle.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::auth::{Authenticator, ConfigAuthenticator};
use crate::config::{Config, ConfigValues};
use crate::error::{Error, Result};
use crate::message::{Message, MessageLog};
use crate::server::{Connection, ConnectionSettings, Served};
use crate::tls;

/// Options for building a controller. Explicit values take precedence
/// over the configuration and are written back into it.
#[derive(Default)]
pub struct ControllerOptions {
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub config: Option<Config>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Pre-built acceptor used instead of resolving certificate files.
    pub tls_acceptor: Option<TlsAcceptor>,
}

struct Lifecycle {
    running: bool,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

/// The disposable SMTP server.
///
/// Owns the listener lifecycle, reacts to configuration changes by
/// restarting the listener (messages preserved), and exposes the
/// captured messages to the test.
///
/// Must be constructed inside a tokio runtime.
pub struct SmtpController {
    config: Config,
    authenticator: Arc<dyn Authenticator>,
    tls_acceptor: Option<TlsAcceptor>,
    log: MessageLog,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    bound: Mutex<Option<SocketAddr>>,
    last_error: Mutex<Option<Error>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SmtpController {
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_options(ControllerOptions {
            config: Some(config),
            ..Default::default()
        })
    }

    pub fn with_options(options: ControllerOptions) -> Arc<Self> {
        let config = options.config.unwrap_or_default();
        // Explicit arguments win, and the config reflects them. The
        // change watcher is not subscribed yet, so nothing restarts.
        if let Some(hostname) = options.hostname {
            config.set_host(hostname);
        }
        if let Some(port) = options.port {
            config.set_port(port);
        }
        let authenticator: Arc<dyn Authenticator> = match options.authenticator {
            Some(authenticator) => authenticator,
            None => ConfigAuthenticator::new(config.clone()),
        };

        let controller = Arc::new(Self {
            config,
            authenticator,
            tls_acceptor: options.tls_acceptor,
            log: MessageLog::default(),
            lifecycle: tokio::sync::Mutex::new(Lifecycle {
                running: false,
                shutdown: None,
                task: None,
            }),
            bound: Mutex::new(None),
            last_error: Mutex::new(None),
            watcher: Mutex::new(None),
        });
        Self::spawn_config_watcher(&controller);
        controller
    }

    /// Subscribed exactly once per controller: every configuration write
    /// becomes one reset, with messages preserved. Restart failures are
    /// recorded for [`take_last_error`](Self::take_last_error) instead of
    /// killing the watcher.
    fn spawn_config_watcher(controller: &Arc<Self>) {
        let mut changes = controller.config.subscribe();
        let weak = Arc::downgrade(controller);
        let task = tokio::spawn(async move {
            while changes.recv().await.is_some() {
                let Some(controller) = weak.upgrade() else { break };
                debug!("configuration changed, restarting listener");
                if let Err(err) = controller.reset().await {
                    warn!(error = %err, "restart after configuration change failed");
                    *controller.last_error.lock().unwrap() = Some(err);
                }
            }
        });
        *controller.watcher.lock().unwrap() = Some(task);
    }

    /// Bind and start accepting. Idempotent while running; bind problems
    /// surface here rather than in the background task.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.running {
            return Ok(());
        }
        let values = self.config.snapshot();

        // STARTTLS takes precedence over implicit TLS so a connection is
        // never double-wrapped.
        let starttls_acceptor = if values.use_starttls {
            Some(self.resolve_acceptor(&values)?)
        } else {
            None
        };
        let implicit_acceptor = if values.use_ssl && !values.use_starttls {
            Some(self.resolve_acceptor(&values)?)
        } else {
            None
        };

        let addr = format!("{}:{}", values.host, values.port);
        let listener = match timeout(values.ready_timeout, TcpListener::bind(&addr)).await {
            Err(_) => return Err(Error::ReadyTimeout(values.ready_timeout)),
            Ok(Err(source)) => return Err(Error::Bind { addr, source }),
            Ok(Ok(listener)) => listener,
        };
        let bound = listener.local_addr()?;
        *self.bound.lock().unwrap() = Some(bound);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            implicit_acceptor,
            starttls_acceptor,
            self.config.clone(),
            self.authenticator.clone(),
            self.log.clone(),
            shutdown_rx,
        ));

        lifecycle.running = true;
        lifecycle.shutdown = Some(shutdown_tx);
        lifecycle.task = Some(task);
        info!(address = %bound, "SMTP fixture listening");
        Ok(())
    }

    fn resolve_acceptor(&self, values: &ConfigValues) -> Result<TlsAcceptor> {
        if let Some(acceptor) = &self.tls_acceptor {
            return Ok(acceptor.clone());
        }
        tls::acceptor_from_values(values)
    }

    /// Stop accepting and close live connections. Stopping an already
    /// stopped controller is a no-op.
    pub async fn stop(&self) {
        let (shutdown, task) = {
            let mut lifecycle = self.lifecycle.lock().await;
            lifecycle.running = false;
            (lifecycle.shutdown.take(), lifecycle.task.take())
        };
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(task) = task {
            let _ = task.await;
            debug!("listener stopped");
        }
    }

    /// Tear down and rebuild from the current configuration, keeping the
    /// captured messages.
    pub async fn reset(&self) -> Result<()> {
        self.reset_with(true).await
    }

    /// Like [`reset`](Self::reset), optionally dropping the message log.
    /// Only restarts if the controller had been running.
    pub async fn reset_with(&self, persist_messages: bool) -> Result<()> {
        let was_running = self.lifecycle.lock().await.running;
        self.stop().await;
        if !persist_messages {
            self.log.clear();
        }
        if was_running {
            self.start().await?;
        }
        Ok(())
    }

    pub fn hostname(&self) -> String {
        self.config.host()
    }

    /// The port the server is reachable at: the bound port once started
    /// (meaningful with the ephemeral port 0), the configured port
    /// otherwise.
    pub fn port(&self) -> u16 {
        self.bound
            .lock()
            .unwrap()
            .map(|addr| addr.port())
            .unwrap_or_else(|| self.config.port())
    }

    pub fn address(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap()
    }

    pub fn config(&self) -> Config {
        self.config.clone()
    }

    /// Snapshot copy of every captured message, in arrival order.
    pub fn messages(&self) -> Vec<Message> {
        self.log.snapshot()
    }

    /// The last error from a background restart, if any.
    pub fn take_last_error(&self) -> Option<Error> {
        self.last_error.lock().unwrap().take()
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.running
    }
}

impl Drop for SmtpController {
    fn drop(&mut self) {
        if let Some(task) = self.watcher.lock().unwrap().take() {
            task.abort();
        }
        if let Ok(mut lifecycle) = self.lifecycle.try_lock() {
            if let Some(shutdown) = lifecycle.shutdown.take() {
                let _ = shutdown.send(true);
            }
            if let Some(task) = lifecycle.task.take() {
                task.abort();
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    implicit_tls: Option<TlsAcceptor>,
    starttls: Option<TlsAcceptor>,
    config: Config,
    authenticator: Arc<dyn Authenticator>,
    log: MessageLog,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("listener shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        implicit_tls.clone(),
                        starttls.clone(),
                        config.clone(),
                        authenticator.clone(),
                        log.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    implicit_tls: Option<TlsAcceptor>,
    starttls: Option<TlsAcceptor>,
    config: Config,
    authenticator: Arc<dyn Authenticator>,
    log: MessageLog,
    mut shutdown: watch::Receiver<bool>,
) {
    let values = config.snapshot();
    let settings = ConnectionSettings {
        hostname: values.host.clone(),
        enforce_auth: values.enforce_auth,
        auth_require_tls: values.auth_require_tls,
        tls_available: starttls.is_some(),
    };

    let mut abort = shutdown.clone();
    let result = tokio::select! {
        _ = abort.changed() => {
            debug!(%peer, "connection aborted by shutdown");
            Ok(())
        }
        outcome = serve_connection(
            stream,
            implicit_tls,
            starttls,
            settings,
            authenticator,
            log,
            &mut shutdown,
        ) => outcome,
    };
    match result {
        Ok(()) => debug!(%peer, "connection closed"),
        Err(Error::HandshakeCancelled) => debug!(%peer, "handshake cancelled by shutdown"),
        Err(err) => warn!(%peer, error = %err, "connection failed"),
    }
}

async fn serve_connection(
    stream: TcpStream,
    implicit_tls: Option<TlsAcceptor>,
    starttls: Option<TlsAcceptor>,
    settings: ConnectionSettings,
    authenticator: Arc<dyn Authenticator>,
    log: MessageLog,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    if let Some(acceptor) = implicit_tls {
        let tls_stream = tls::handshake(&acceptor, stream, shutdown).await?;
        let connection = Connection::new(tls_stream, true, settings, authenticator, log);
        connection.serve().await?;
        return Ok(());
    }

    let connection = Connection::new(
        stream,
        false,
        settings.clone(),
        authenticator.clone(),
        log.clone(),
    );
    match connection.serve().await? {
        Served::Closed => Ok(()),
        Served::StartTls(raw) => {
            let Some(acceptor) = starttls else {
                // serve() only offers STARTTLS when an acceptor exists.
                return Ok(());
            };
            let tls_stream = tls::handshake(&acceptor, raw, shutdown).await?;
            // Fresh, unauthenticated session on the encrypted channel; no
            // further STARTTLS and no second banner.
            let settings = ConnectionSettings {
                tls_available: false,
                ..settings
            };
            let connection = Connection::upgraded(tls_stream, settings, authenticator, log);
            connection.serve().await?;
            Ok(())
        }
    }
}
