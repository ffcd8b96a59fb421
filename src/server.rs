//! Per-connection protocol handling: the command dispatcher, the DATA
//! collector, and the AUTH mechanism exchanges.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tracing::{debug, info, warn};

use crate::auth::{self, Authenticator, Mechanism};
use crate::message::{Message, MessageLog};
use crate::session::Session;

pub(crate) const SERVICE_UNAVAILABLE: &str = "421 Service not available. Closing connection.";

const SEND_HELO_FIRST: &str = "503 Error: send HELO first";
const NEED_MAIL: &str = "503 Error: need MAIL command";
const NEED_RCPT: &str = "503 Error: need RCPT command";
const NESTED_MAIL: &str = "503 Error: nested MAIL command";
const OK: &str = "250 OK";
const BYE: &str = "221 Bye";
const START_DATA: &str = "354 End data with <CR><LF>.<CR><LF>";
const READY_TO_START_TLS: &str = "220 Ready to start TLS";
const TLS_NOT_AVAILABLE: &str = "454 TLS not available";
const STARTTLS_SYNTAX: &str = "501 Syntax: STARTTLS";
const UNRECOGNIZED: &str = "500 Command not recognized";
const BAD_SYNTAX: &str = "500 Error: bad syntax";
const HELP_TEXT: &str =
    "250 Supported commands: AUTH DATA EHLO HELO HELP MAIL NOOP QUIT RCPT RSET STARTTLS VRFY";

/// Per-connection settings, snapshotted from the configuration when the
/// connection is accepted.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    pub hostname: String,
    pub enforce_auth: bool,
    pub auth_require_tls: bool,
    /// Whether STARTTLS may be offered on this connection.
    pub tls_available: bool,
}

/// How a serve loop ended.
pub(crate) enum Served<S> {
    /// QUIT or disconnect.
    Closed,
    /// The client negotiated STARTTLS. The caller owns the handshake and
    /// re-enters [`Connection::serve`] with the encrypted stream.
    StartTls(S),
}

enum Flow {
    Continue,
    Quit,
    StartTls,
}

enum AuthOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

/// One SMTP connection: a line channel plus the session state machine.
pub(crate) struct Connection<S> {
    stream: BufStream<S>,
    session: Session,
    settings: ConnectionSettings,
    authenticator: Arc<dyn Authenticator>,
    log: MessageLog,
    greet: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(
        stream: S,
        tls_active: bool,
        settings: ConnectionSettings,
        authenticator: Arc<dyn Authenticator>,
        log: MessageLog,
    ) -> Self {
        Self {
            stream: BufStream::new(stream),
            session: Session::new(tls_active),
            settings,
            authenticator,
            log,
            greet: true,
        }
    }

    /// A connection continuing on the same socket after a STARTTLS
    /// upgrade: encrypted, session state discarded, and no second banner.
    pub fn upgraded(
        stream: S,
        settings: ConnectionSettings,
        authenticator: Arc<dyn Authenticator>,
        log: MessageLog,
    ) -> Self {
        let mut connection = Self::new(stream, true, settings, authenticator, log);
        connection.greet = false;
        connection
    }

    /// Run the command/response loop until the connection ends or the
    /// client upgrades to TLS.
    pub async fn serve(mut self) -> io::Result<Served<S>> {
        if self.greet {
            let banner = format!("220 {} service ready", self.settings.hostname);
            self.send(&banner).await?;
        }

        loop {
            let line = match self.read_line().await? {
                Some(line) => line,
                None => {
                    debug!("client disconnected");
                    return Ok(Served::Closed);
                }
            };

            let flow = match self.handle_command(&line).await {
                Ok(flow) => flow,
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(Served::Closed);
                }
                Err(err) => {
                    // Isolate the failure to this client; the listener
                    // stays up.
                    warn!(error = %err, "closing connection after error");
                    let _ = self.send(SERVICE_UNAVAILABLE).await;
                    return Err(err);
                }
            };

            match flow {
                Flow::Continue => {}
                Flow::Quit => return Ok(Served::Closed),
                Flow::StartTls => return Ok(Served::StartTls(self.stream.into_inner())),
            }
        }
    }

    async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    async fn send(&mut self, line: &str) -> io::Result<()> {
        debug!(response = line, "sending");
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await
    }

    /// The challenge/response primitive every AUTH mechanism is built on:
    /// push one status line, read one reply line.
    async fn challenge(&mut self, status: &str) -> io::Result<String> {
        self.send(status).await?;
        match self.read_line().await? {
            Some(line) => Ok(line.trim().to_string()),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client disconnected during authentication",
            )),
        }
    }

    fn mechanism_allowed(&self, mechanism: Mechanism) -> bool {
        self.session.tls_active
            || !mechanism.requires_encryption()
            || !self.settings.auth_require_tls
    }

    fn eligible_mechanisms(&self) -> String {
        Mechanism::ALL
            .into_iter()
            .filter(|m| self.mechanism_allowed(*m))
            .map(|m| m.name())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Status line to answer MAIL/RCPT/DATA with instead of processing,
    /// if a gate applies. Checked independently at each command.
    fn transaction_gate(&self) -> Option<&'static str> {
        if self.session.greeting_host.is_none() {
            return Some(SEND_HELO_FIRST);
        }
        if self.settings.enforce_auth && !self.session.authenticated {
            return Some(auth::AUTH_REQUIRED);
        }
        None
    }

    async fn handle_command(&mut self, line: &str) -> io::Result<Flow> {
        let line = line.trim();
        if line.is_empty() {
            self.send(BAD_SYNTAX).await?;
            return Ok(Flow::Continue);
        }
        let (verb, arg) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb.to_ascii_uppercase(), rest.trim()),
            None => (line.to_ascii_uppercase(), ""),
        };

        match verb.as_str() {
            "HELO" | "EHLO" => self.handle_greeting(&verb, arg).await,
            "STARTTLS" => self.handle_starttls(arg).await,
            "AUTH" => self.handle_auth(arg).await,
            "MAIL" => self.handle_mail(arg).await,
            "RCPT" => self.handle_rcpt(arg).await,
            "DATA" => self.handle_data(arg).await,
            "VRFY" => self.handle_vrfy(arg).await,
            "RSET" => {
                self.session.rset();
                self.send(OK).await?;
                Ok(Flow::Continue)
            }
            "NOOP" => {
                self.send(OK).await?;
                Ok(Flow::Continue)
            }
            "HELP" => {
                self.send(HELP_TEXT).await?;
                Ok(Flow::Continue)
            }
            "QUIT" => {
                self.send(BYE).await?;
                Ok(Flow::Quit)
            }
            _ => {
                self.send(UNRECOGNIZED).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_greeting(&mut self, verb: &str, arg: &str) -> io::Result<Flow> {
        if arg.is_empty() {
            let syntax = format!("501 Syntax: {verb} hostname");
            self.send(&syntax).await?;
            return Ok(Flow::Continue);
        }
        self.session.greeting_host = Some(arg.to_string());

        let hostname = self.settings.hostname.clone();
        let mechanisms = self.eligible_mechanisms();
        if verb == "EHLO" {
            self.send(&format!("250-{hostname}")).await?;
            if self.settings.tls_available && !self.session.tls_active {
                self.send("250-STARTTLS").await?;
            }
            self.send(&format!("250-AUTH {mechanisms}")).await?;
            self.send("250 HELP").await?;
        } else {
            self.send(&format!("250-AUTH {mechanisms}")).await?;
            self.send(&format!("250 {hostname}")).await?;
        }
        Ok(Flow::Continue)
    }

    async fn handle_starttls(&mut self, arg: &str) -> io::Result<Flow> {
        // A trailing argument is a syntax error no matter the TLS state.
        if !arg.is_empty() {
            self.send(STARTTLS_SYNTAX).await?;
            return Ok(Flow::Continue);
        }
        if !self.settings.tls_available || self.session.tls_active {
            self.send(TLS_NOT_AVAILABLE).await?;
            return Ok(Flow::Continue);
        }
        self.send(READY_TO_START_TLS).await?;
        Ok(Flow::StartTls)
    }

    async fn handle_auth(&mut self, arg: &str) -> io::Result<Flow> {
        if self.session.greeting_host.is_none() {
            self.send(SEND_HELO_FIRST).await?;
            return Ok(Flow::Continue);
        }
        if self.session.authenticated {
            self.send(auth::AUTH_ALREADY_DONE).await?;
            return Ok(Flow::Continue);
        }

        let mut parts = arg.split_whitespace();
        let mechanism = parts.next().and_then(Mechanism::from_name);
        let initial = parts.next();
        let Some(mechanism) = mechanism else {
            self.send(auth::AUTH_UNRECOGNIZED).await?;
            return Ok(Flow::Continue);
        };
        if !self.mechanism_allowed(mechanism) {
            self.send(auth::AUTH_ENCRYPTION_REQUIRED).await?;
            return Ok(Flow::Continue);
        }

        let outcome = match mechanism {
            Mechanism::Plain => self.auth_plain(initial).await?,
            Mechanism::Login => self.auth_login(initial).await?,
            Mechanism::CramMd5 => self.auth_cram_md5().await?,
        };
        let status = match outcome {
            AuthOutcome::Succeeded => {
                self.session.authenticated = true;
                info!(mechanism = mechanism.name(), "authentication succeeded");
                auth::AUTH_SUCCEEDED
            }
            AuthOutcome::Failed => {
                info!(mechanism = mechanism.name(), "authentication failed");
                auth::AUTH_FAILED
            }
            AuthOutcome::Cancelled => {
                debug!("client cancelled authentication");
                auth::AUTH_CANCELLED
            }
        };
        self.send(status).await?;
        Ok(Flow::Continue)
    }

    async fn auth_plain(&mut self, initial: Option<&str>) -> io::Result<AuthOutcome> {
        let blob = match initial {
            Some(blob) => blob.to_string(),
            None => self.challenge("334 ").await?,
        };
        let Some(decoded) = auth::b64_decode(&blob) else {
            return Ok(AuthOutcome::Failed);
        };
        let Some((username, password)) = auth::parse_plain_credentials(&decoded) else {
            return Ok(AuthOutcome::Failed);
        };
        if self.authenticator.validate(&username, &password) {
            Ok(AuthOutcome::Succeeded)
        } else {
            Ok(AuthOutcome::Failed)
        }
    }

    async fn auth_login(&mut self, initial: Option<&str>) -> io::Result<AuthOutcome> {
        let mut fields: Vec<String> = Vec::new();
        if let Some(blob) = initial {
            match auth::b64_decode(blob) {
                Some(decoded) => fields.push(decoded),
                None => return Ok(AuthOutcome::Failed),
            }
        }
        while fields.len() < 2 {
            let prompt = if fields.is_empty() {
                auth::LOGIN_USERNAME_CHALLENGE
            } else {
                auth::LOGIN_PASSWORD_CHALLENGE
            };
            let reply = self.challenge(prompt).await?;
            // "*" aborts the exchange, distinct from bad credentials.
            if reply.starts_with('*') {
                return Ok(AuthOutcome::Cancelled);
            }
            match auth::b64_decode(&reply) {
                Some(decoded) => fields.push(decoded),
                None => return Ok(AuthOutcome::Failed),
            }
        }
        if self.authenticator.validate(&fields[0], &fields[1]) {
            Ok(AuthOutcome::Succeeded)
        } else {
            Ok(AuthOutcome::Failed)
        }
    }

    async fn auth_cram_md5(&mut self) -> io::Result<AuthOutcome> {
        let hostname = self.settings.hostname.clone();
        let challenge_text = auth::cram_md5_challenge(&hostname);
        let status = format!("334 {}", auth::b64_encode(&challenge_text));
        let reply = self.challenge(&status).await?;

        let Some(decoded) = auth::b64_decode(&reply) else {
            return Ok(AuthOutcome::Failed);
        };
        let mut parts = decoded.split_whitespace();
        let (Some(username), Some(digest)) = (parts.next(), parts.next()) else {
            return Ok(AuthOutcome::Failed);
        };
        // Fail closed when the store cannot hand out the password.
        let Some(password) = self.authenticator.get_password(username) else {
            return Ok(AuthOutcome::Failed);
        };
        if auth::verify_cram_md5(&password, &challenge_text, digest) {
            Ok(AuthOutcome::Succeeded)
        } else {
            Ok(AuthOutcome::Failed)
        }
    }

    async fn handle_mail(&mut self, arg: &str) -> io::Result<Flow> {
        if let Some(status) = self.transaction_gate() {
            self.send(status).await?;
            return Ok(Flow::Continue);
        }
        if self.session.mail_from.is_some() {
            self.send(NESTED_MAIL).await?;
            return Ok(Flow::Continue);
        }
        let Some(address) = parse_path(arg, "FROM:") else {
            self.send("501 Syntax: MAIL FROM: <address>").await?;
            return Ok(Flow::Continue);
        };
        self.session.mail_from = Some(address);
        self.send(OK).await?;
        Ok(Flow::Continue)
    }

    async fn handle_rcpt(&mut self, arg: &str) -> io::Result<Flow> {
        if let Some(status) = self.transaction_gate() {
            self.send(status).await?;
            return Ok(Flow::Continue);
        }
        if self.session.mail_from.is_none() {
            self.send(NEED_MAIL).await?;
            return Ok(Flow::Continue);
        }
        let Some(address) = parse_path(arg, "TO:") else {
            self.send("501 Syntax: RCPT TO: <address>").await?;
            return Ok(Flow::Continue);
        };
        self.session.recipients.push(address);
        self.send(OK).await?;
        Ok(Flow::Continue)
    }

    async fn handle_data(&mut self, arg: &str) -> io::Result<Flow> {
        if let Some(status) = self.transaction_gate() {
            self.send(status).await?;
            return Ok(Flow::Continue);
        }
        if !arg.is_empty() {
            self.send("501 Syntax: DATA").await?;
            return Ok(Flow::Continue);
        }
        if self.session.recipients.is_empty() {
            self.send(NEED_RCPT).await?;
            return Ok(Flow::Continue);
        }
        self.send(START_DATA).await?;

        let mut lines = Vec::new();
        loop {
            match self.read_line().await? {
                // Disconnect mid-DATA discards the transaction.
                None => return Ok(Flow::Quit),
                Some(line) if line == "." => break,
                Some(line) => lines.push(line),
            }
        }

        let from = self.session.mail_from.take().unwrap_or_default();
        let recipients = std::mem::take(&mut self.session.recipients);
        let message = Message::parse(from, recipients, &lines);
        info!(
            from = message.from(),
            recipients = message.recipients().len(),
            "message received"
        );
        self.log.push(message);
        self.session.reset_transaction();
        self.send(OK).await?;
        Ok(Flow::Continue)
    }

    async fn handle_vrfy(&mut self, arg: &str) -> io::Result<Flow> {
        if arg.is_empty() {
            self.send("501 Syntax: VRFY <address>").await?;
            return Ok(Flow::Continue);
        }
        if self.authenticator.verify(arg) {
            self.send(auth::VRFY_ACCEPTED).await?;
        } else {
            let rejected = format!("{} {}", auth::VRFY_REJECTED, arg);
            self.send(&rejected).await?;
        }
        Ok(Flow::Continue)
    }
}

/// Extract the address from a `FROM:<addr>` / `TO:<addr>` argument,
/// tolerating optional whitespace and ESMTP parameters after the path.
fn parse_path(arg: &str, prefix: &str) -> Option<String> {
    let head = arg.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = arg[prefix.len()..].trim();
    let path = rest.split_whitespace().next()?;
    let address = path.trim_start_matches('<').trim_end_matches('>').trim();
    if address.is_empty() {
        return None;
    }
    Some(address.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ConfigAuthenticator;
    use crate::config::Config;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    struct Client {
        reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn read_line(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            line.trim_end().to_string()
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
        }

        async fn roundtrip(&mut self, line: &str) -> String {
            self.send(line).await;
            self.read_line().await
        }
    }

    fn spawn_connection(settings: ConnectionSettings) -> (Client, MessageLog) {
        let (server_side, client_side) = duplex(4096);
        let config = Config::new();
        let log = MessageLog::default();
        let connection = Connection::new(
            server_side,
            false,
            settings,
            ConfigAuthenticator::new(config),
            log.clone(),
        );
        tokio::spawn(async move {
            let _ = connection.serve().await;
        });
        let (reader, writer) = tokio::io::split(client_side);
        (
            Client {
                reader: BufReader::new(reader),
                writer,
            },
            log,
        )
    }

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            hostname: "fixture.test".to_string(),
            enforce_auth: false,
            auth_require_tls: true,
            tls_available: false,
        }
    }

    #[tokio::test]
    async fn greeting_is_required_before_mail() {
        let (mut client, _log) = spawn_connection(settings());
        assert!(client.read_line().await.starts_with("220"));
        let reply = client.roundtrip("MAIL FROM:<a@example.org>").await;
        assert_eq!(reply, "503 Error: send HELO first");
    }

    #[tokio::test]
    async fn ehlo_hides_plaintext_mechanisms_without_tls() {
        let (mut client, _log) = spawn_connection(settings());
        client.read_line().await;
        client.send("EHLO client.example").await;
        assert_eq!(client.read_line().await, "250-fixture.test");
        assert_eq!(client.read_line().await, "250-AUTH CRAM-MD5");
        assert_eq!(client.read_line().await, "250 HELP");
    }

    #[tokio::test]
    async fn helo_includes_auth_capability_line() {
        let mut relaxed = settings();
        relaxed.auth_require_tls = false;
        let (mut client, _log) = spawn_connection(relaxed);
        client.read_line().await;
        client.send("HELO client.example").await;
        assert_eq!(client.read_line().await, "250-AUTH PLAIN LOGIN CRAM-MD5");
        assert_eq!(client.read_line().await, "250 fixture.test");
    }

    #[tokio::test]
    async fn data_records_a_message() {
        let (mut client, log) = spawn_connection(settings());
        client.read_line().await;
        client.send("HELO client.example").await;
        client.read_line().await;
        client.read_line().await;
        assert_eq!(client.roundtrip("MAIL FROM:<a@example.org>").await, "250 OK");
        assert_eq!(client.roundtrip("RCPT TO:<b@example.org>").await, "250 OK");
        assert_eq!(
            client.roundtrip("DATA").await,
            "354 End data with <CR><LF>.<CR><LF>"
        );
        client.send("Subject: hi").await;
        client.send("").await;
        client.send("body").await;
        assert_eq!(client.roundtrip(".").await, "250 OK");

        let messages = log.snapshot();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].from(), "a@example.org");
        assert_eq!(messages[0].header("Subject"), Some("hi"));
    }

    #[test]
    fn parse_path_variants() {
        assert_eq!(
            parse_path("FROM:<a@example.org>", "FROM:").as_deref(),
            Some("a@example.org")
        );
        assert_eq!(
            parse_path("from: <a@example.org> SIZE=100", "FROM:").as_deref(),
            Some("a@example.org")
        );
        assert_eq!(parse_path("TO:", "TO:"), None);
        assert_eq!(parse_path("FRO:<a@b>", "FROM:"), None);
    }
}
