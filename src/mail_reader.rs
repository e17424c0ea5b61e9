use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use std::fmt;
use std::time::Duration;

use crate::error::MailboxError;

pub mod header;
pub mod message;
pub mod imap;
pub mod watcher;
pub mod supervisor;

/// Server-assigned UID of a message in the selected mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One fetched message, exactly as the server returned it.
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    pub id: Option<MessageId>,
    pub flags: Vec<String>,
    pub internal_date: Option<DateTime<FixedOffset>>,
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    Idling,
    Polling,
    Failed,
}

impl SessionState {
    /// Sessions in these states can be handed to the watcher as they are.
    pub fn is_usable(self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Idling)
    }
}

/// Why an idle wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    Activity,
    KeepAliveExpired,
}

/// Dials the mailbox server.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    type Session: MailboxSession;

    async fn connect(&self) -> Result<Self::Session, MailboxError>;
}

/// A connection to the mailbox server.
///
/// Implementations move themselves to [`SessionState::Failed`] when a command
/// fails at the transport level.
#[async_trait]
pub trait MailboxSession: Send {
    fn state(&self) -> SessionState;

    async fn authenticate(&mut self, user: &str, secret: &str) -> Result<(), MailboxError>;

    async fn select_mailbox(&mut self, name: &str) -> Result<(), MailboxError>;

    async fn search_unseen(&mut self) -> Result<Vec<MessageId>, MailboxError>;

    /// Fetch flags, arrival time, UID, header and body of every message, in
    /// the order the server sends them.
    async fn fetch(&mut self, ids: &[MessageId]) -> Result<Vec<RawMessage>, MailboxError>;

    async fn mark_seen(&mut self, ids: &[MessageId]) -> Result<(), MailboxError>;

    /// Block until the server pushes activity or `keepalive` elapses.
    async fn idle_wait(&mut self, keepalive: Duration) -> Result<IdleOutcome, MailboxError>;

    async fn logout(&mut self, timeout: Duration) -> Result<(), MailboxError>;
}
