/// Mutable state for one SMTP connection. Owned exclusively by that
/// connection's dispatcher; nothing here is shared across connections.
pub(crate) struct Session {
    pub greeting_host: Option<String>,
    pub mail_from: Option<String>,
    pub recipients: Vec<String>,
    pub authenticated: bool,
    pub tls_active: bool,
}

impl Session {
    pub fn new(tls_active: bool) -> Self {
        Self {
            greeting_host: None,
            mail_from: None,
            recipients: Vec::new(),
            authenticated: false,
            tls_active,
        }
    }

    /// End-of-transaction cleanup (after a completed DATA). The client
    /// stays greeted and authenticated.
    pub fn reset_transaction(&mut self) {
        self.mail_from = None;
        self.recipients.clear();
    }

    /// Protocol RSET: back to the greeted state, authentication cleared.
    pub fn rset(&mut self) {
        self.reset_transaction();
        self.authenticated = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rset_clears_authentication_but_not_greeting() {
        let mut session = Session::new(false);
        session.greeting_host = Some("client.example".to_string());
        session.mail_from = Some("a@b".to_string());
        session.recipients.push("c@d".to_string());
        session.authenticated = true;

        session.rset();
        assert_eq!(session.greeting_host.as_deref(), Some("client.example"));
        assert!(session.mail_from.is_none());
        assert!(session.recipients.is_empty());
        assert!(!session.authenticated);
    }

    #[test]
    fn transaction_reset_preserves_authentication() {
        let mut session = Session::new(true);
        session.authenticated = true;
        session.mail_from = Some("a@b".to_string());
        session.reset_transaction();
        assert!(session.authenticated);
        assert!(session.tls_active);
    }
}
