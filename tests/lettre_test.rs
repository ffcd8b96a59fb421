//! End-to-end submission through a real SMTP client library.

use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use smtp_fixture::{Config, SmtpController};

fn test_message() -> Message {
    Message::builder()
        .from("Hanako <hanako@example.com>".parse().unwrap())
        .reply_to("Replies <replies@example.com>".parse().unwrap())
        .to("Tarou <tarou@example.com>".parse().unwrap())
        .subject("Greetings")
        .body("Hello from the test suite".to_string())
        .unwrap()
}

async fn start_fixture(config: Config) -> std::sync::Arc<SmtpController> {
    config.set_host("127.0.0.1");
    let server = SmtpController::new(config);
    server.start().await.unwrap();
    server
}

#[tokio::test]
async fn basic_lettre_send() {
    let server = start_fixture(Config::new()).await;

    let mailer = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous("127.0.0.1")
        .port(server.port())
        .build();
    mailer.send(test_message()).await.unwrap();

    let messages = server.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].from(), "hanako@example.com");
    assert_eq!(messages[0].recipients(), ["tarou@example.com".to_string()]);
    assert_eq!(messages[0].header("Subject"), Some("Greetings"));
    assert_eq!(
        messages[0].header("Reply-To"),
        Some("Replies <replies@example.com>")
    );
    server.stop().await;
}

#[tokio::test]
async fn authenticated_submission_with_plain() {
    let config = Config::new();
    config.set_enforce_auth(true);
    config.set_auth_require_tls(false);
    let server = start_fixture(config).await;

    let mailer = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous("127.0.0.1")
        .port(server.port())
        .credentials(Credentials::new("user".to_string(), "password".to_string()))
        .authentication(vec![Mechanism::Plain])
        .build();
    mailer.send(test_message()).await.unwrap();

    assert_eq!(server.messages().len(), 1);
    server.stop().await;
}

#[tokio::test]
async fn unauthenticated_submission_is_refused_when_auth_is_enforced() {
    let config = Config::new();
    config.set_enforce_auth(true);
    config.set_auth_require_tls(false);
    let server = start_fixture(config).await;

    let mailer = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous("127.0.0.1")
        .port(server.port())
        .build();
    assert!(mailer.send(test_message()).await.is_err());

    assert!(server.messages().is_empty());
    server.stop().await;
}
