//! Error types for the mail bridge.

/// Failures talking to the mailbox server.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("unable to connect to {server}: {reason}")]
    Connection { server: String, reason: String },

    #[error("unable to login as {user}: {reason}")]
    Auth { user: String, reason: String },

    #[error("{command} failed: {reason}")]
    Protocol { command: &'static str, reason: String },
}

impl MailboxError {
    pub fn protocol(command: &'static str, reason: impl ToString) -> Self {
        MailboxError::Protocol {
            command,
            reason: reason.to_string(),
        }
    }
}

/// Failures talking to the chat service.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat login failed for {user}: {reason}")]
    Auth { user: String, reason: String },

    #[error("chat session expired")]
    SessionExpired,

    #[error("did not find channel with name {0}")]
    ChannelNotFound(String),

    #[error("file upload failed: {0}")]
    Upload(String),

    #[error("create post failed: {0}")]
    Post(String),

    #[error("chat request failed: {0}")]
    Transport(String),
}

/// Anything that can stop a poll or idle step.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("mailbox: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("chat: {0}")]
    Chat(#[from] ChatError),
}

impl BridgeError {
    /// Whether the mailbox session must be rebuilt before the next step.
    ///
    /// Chat failures leave the mailbox connection untouched.
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, BridgeError::Mailbox(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_failures_keep_the_mailbox_session() {
        let err: BridgeError = ChatError::Upload("413".into()).into();
        assert!(!err.requires_reconnect());
    }

    #[test]
    fn protocol_failures_force_reconnect() {
        let err: BridgeError = MailboxError::protocol("UID SEARCH", "bye").into();
        assert!(err.requires_reconnect());
        assert_eq!(err.to_string(), "mailbox: UID SEARCH failed: bye");
    }
}
