//! Captured messages and the shared in-memory log the test inspects.

use std::sync::{Arc, Mutex};

/// One email captured from a completed DATA transaction. Immutable.
#[derive(Debug, Clone)]
pub struct Message {
    from: String,
    recipients: Vec<String>,
    headers: Vec<(String, String)>,
    body: String,
    raw: String,
}

impl Message {
    /// Build a message from the envelope and the collected DATA lines
    /// (CRLF already stripped, terminating dot not included).
    pub(crate) fn parse(from: String, recipients: Vec<String>, lines: &[String]) -> Self {
        // Transparency per RFC 5321: a leading dot was doubled by the
        // client, drop one.
        let lines: Vec<&str> = lines
            .iter()
            .map(|line| {
                if let Some(stripped) = line.strip_prefix('.') {
                    stripped
                } else {
                    line.as_str()
                }
            })
            .collect();

        let mut headers: Vec<(String, String)> = Vec::new();
        let mut body_start = lines.len();
        for (index, line) in lines.iter().enumerate() {
            if line.is_empty() {
                body_start = index + 1;
                break;
            }
            if (line.starts_with(' ') || line.starts_with('\t')) && !headers.is_empty() {
                // Folded continuation line.
                let last = headers.last_mut().unwrap();
                last.1.push(' ');
                last.1.push_str(line.trim_start());
            } else if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim_start().to_string()));
            }
        }

        let body = lines
            .get(body_start..)
            .unwrap_or_default()
            .join("\r\n");
        let raw = lines.join("\r\n");

        Self {
            from,
            recipients,
            headers,
            body,
            raw,
        }
    }

    /// Envelope sender from MAIL FROM.
    pub fn from(&self) -> &str {
        &self.from
    }

    /// Envelope recipients from RCPT TO, in order.
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// First header with the given name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// The message text as received, dot-unstuffed.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// Append-only message sink shared between connections and the test.
/// Reads always return a snapshot copy.
#[derive(Debug, Clone, Default)]
pub(crate) struct MessageLog {
    inner: Arc<Mutex<Vec<Message>>>,
}

impl MessageLog {
    pub fn push(&self, message: Message) {
        self.inner.lock().unwrap().push(message);
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.inner.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn parses_headers_and_body() {
        let message = Message::parse(
            "from@example.org".to_string(),
            vec!["to@example.org".to_string()],
            &lines(&[
                "Sender: from.addr@example.org",
                "Reply-To: reply.addr@example.org",
                "Subject: Foo",
                "",
                "foo bar",
            ]),
        );
        assert_eq!(message.from(), "from@example.org");
        assert_eq!(message.header("sender"), Some("from.addr@example.org"));
        assert_eq!(message.header("Reply-To"), Some("reply.addr@example.org"));
        assert_eq!(message.header("X-Missing"), None);
        assert_eq!(message.body(), "foo bar");
    }

    #[test]
    fn unfolds_continuation_lines() {
        let message = Message::parse(
            String::new(),
            Vec::new(),
            &lines(&["Subject: a very", "\tlong subject", "", "body"]),
        );
        assert_eq!(message.header("Subject"), Some("a very long subject"));
    }

    #[test]
    fn removes_dot_stuffing() {
        let message = Message::parse(
            String::new(),
            Vec::new(),
            &lines(&["Subject: dots", "", "..leading dot", "plain"]),
        );
        assert_eq!(message.body(), ".leading dot\r\nplain");
    }

    #[test]
    fn log_reads_are_snapshots() {
        let log = MessageLog::default();
        log.push(Message::parse(String::new(), Vec::new(), &lines(&[""])));
        let mut copy = log.snapshot();
        copy.clear();
        assert_eq!(log.snapshot().len(), 1);
    }
}
