use std::sync::Arc;
use std::time::Duration;
use log::{error, info, warn};

use crate::chat::ChatService;
use crate::error::{BridgeError, MailboxError};
use crate::mail_reader::watcher::MailboxWatcher;
use crate::mail_reader::{MailboxConnector, MailboxSession};

const LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often a failed step is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        RetryPolicy {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Same attempts as production, without waiting.
    pub fn immediate() -> Self {
        RetryPolicy::fixed(2, Duration::ZERO)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Wait before attempt `attempt + 1`.
    pub fn backoff(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::fixed(2, Duration::from_secs(30))
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Poll,
    Idle,
}

impl Step {
    fn describe(self) -> &'static str {
        match self {
            Step::Poll => "Error on check new email:",
            Step::Idle => "Error Idle:",
        }
    }
}

/// Owns the mailbox session and drives the poll/idle loop.
pub struct ConnectionSupervisor<M: MailboxConnector> {
    connector: M,
    credentials: Credentials,
    policy: RetryPolicy,
    session: Option<M::Session>,
    name: Arc<str>,
}

impl<M: MailboxConnector> ConnectionSupervisor<M> {
    pub fn new(connector: M, credentials: Credentials, policy: RetryPolicy, name: Arc<str>) -> Self {
        ConnectionSupervisor {
            connector,
            credentials,
            policy,
            session: None,
            name,
        }
    }

    /// Hand out the current session, dialing and logging in again unless it
    /// is still authenticated.
    pub async fn ensure_session(&mut self) -> Result<&mut M::Session, MailboxError> {
        let reusable = self
            .session
            .as_ref()
            .is_some_and(|session| session.state().is_usable());
        if !reusable {
            self.session = None;
            let mut session = self.connector.connect().await?;
            session
                .authenticate(&self.credentials.user, &self.credentials.secret)
                .await?;
            info!("{}\tConnected as {}", self.name, self.credentials.user);
            self.session = Some(session);
        }
        self.session
            .as_mut()
            .ok_or_else(|| MailboxError::protocol("session", "not connected"))
    }

    /// Best-effort, time-boxed logout. Safe to call with no session.
    pub async fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.logout(LOGOUT_TIMEOUT).await {
                warn!("{}\tLogout failed: {}", self.name, e);
            }
        }
    }

    /// Run forever: poll once, then alternate idle and poll. A step that keeps
    /// failing restarts the cycle from a fresh session.
    pub async fn run<C: ChatService>(&mut self, watcher: &mut MailboxWatcher<C>) {
        loop {
            match self.cycle(watcher).await {
                Ok(never) => match never {},
                Err(e) => error!("{}\t{}, restarting", self.name, e),
            }
        }
    }

    async fn cycle<C: ChatService>(
        &mut self,
        watcher: &mut MailboxWatcher<C>,
    ) -> Result<std::convert::Infallible, BridgeError> {
        info!("{}\tChecking new emails", self.name);
        self.poll(watcher).await?;
        info!("{}\tWaiting new messages", self.name);
        loop {
            self.idle(watcher).await?;
            self.poll(watcher).await?;
        }
    }

    pub async fn poll<C: ChatService>(&mut self, watcher: &mut MailboxWatcher<C>) -> Result<(), BridgeError> {
        self.with_retry(Step::Poll, watcher).await
    }

    pub async fn idle<C: ChatService>(&mut self, watcher: &mut MailboxWatcher<C>) -> Result<(), BridgeError> {
        self.with_retry(Step::Idle, watcher).await
    }

    async fn with_retry<C: ChatService>(
        &mut self,
        step: Step,
        watcher: &mut MailboxWatcher<C>,
    ) -> Result<(), BridgeError> {
        let mut attempt = 1;
        loop {
            let result = self.attempt(step, watcher).await;
            let Err(e) = result else {
                return Ok(());
            };
            if e.requires_reconnect() {
                self.session = None;
            }
            if attempt >= self.policy.attempts() {
                return Err(e);
            }
            let delay = self.policy.backoff(attempt);
            warn!(
                "{}\t{} {}. Try again in {}s",
                self.name,
                step.describe(),
                e,
                delay.as_secs()
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt<C: ChatService>(
        &mut self,
        step: Step,
        watcher: &mut MailboxWatcher<C>,
    ) -> Result<(), BridgeError> {
        let session = self.ensure_session().await?;
        match step {
            Step::Poll => watcher.poll_once(session).await.map(|_| ()),
            Step::Idle => watcher.idle_once(session).await.map(|_| ()),
        }
    }

    #[cfg(test)]
    pub fn session(&self) -> Option<&M::Session> {
        self.session.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_least_one_attempt() {
        assert_eq!(RetryPolicy::fixed(0, Duration::ZERO).attempts(), 1);
    }

    #[test]
    fn default_retries_once_after_thirty_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts(), 2);
        assert_eq!(policy.backoff(1), Duration::from_secs(30));
    }
}
