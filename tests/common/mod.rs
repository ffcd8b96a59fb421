#![allow(dead_code)]

use std::sync::Arc;

use smtp_fixture::{Config, SmtpController};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Minimal line-oriented SMTP client for driving the fixture directly.
pub struct LineClient<S> {
    reader: BufReader<tokio::io::ReadHalf<S>>,
    writer: tokio::io::WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite> LineClient<S> {
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> LineClient<S> {
    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    /// Read a full multiline reply; returns every line including the
    /// final `XYZ text` one.
    pub async fn read_multiline(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            let done = line.len() < 4 || line.as_bytes()[3] != b'-';
            lines.push(line);
            if done {
                break;
            }
        }
        lines
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    pub async fn roundtrip(&mut self, line: &str) -> String {
        self.send(line).await;
        self.read_line().await
    }

    /// Take the raw stream back, e.g. to wrap it in TLS after STARTTLS.
    pub fn into_inner(self) -> S {
        self.reader.into_inner().unsplit(self.writer)
    }
}

pub type TestClient = LineClient<TcpStream>;

impl TestClient {
    pub async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        Self::new(stream)
    }

    /// Connect and consume the 220 banner.
    pub async fn connect_greeted(port: u16) -> Self {
        let mut client = Self::connect(port).await;
        let banner = client.read_line().await;
        assert!(banner.starts_with("220 "), "unexpected banner: {banner}");
        client
    }
}

/// Start a fixture server on a loopback ephemeral port.
pub async fn start_server(config: Config) -> Arc<SmtpController> {
    config.set_host("127.0.0.1");
    let server = SmtpController::new(config);
    server.start().await.unwrap();
    server
}
