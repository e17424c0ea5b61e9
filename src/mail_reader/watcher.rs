use std::sync::Arc;
use std::time::Duration;
use log::{debug, error, info};

use crate::chat::{ChatPublisher, ChatService};
use crate::error::{BridgeError, ChatError};
use crate::mail_reader::message::MimeTransformer;
use crate::mail_reader::{IdleOutcome, MailboxSession, MessageId};

/// What one poll did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub posted: Vec<MessageId>,
    pub undeliverable: Vec<MessageId>,
}

impl PollReport {
    pub fn seen(&self) -> Vec<MessageId> {
        let mut seen = self.posted.clone();
        seen.extend(&self.undeliverable);
        seen
    }
}

/// Moves unseen mail from the mailbox into the chat channel.
pub struct MailboxWatcher<C: ChatService> {
    mailbox: String,
    keepalive: Duration,
    transformer: MimeTransformer,
    publisher: ChatPublisher<C>,
    name: Arc<str>,
}

impl<C: ChatService> MailboxWatcher<C> {
    pub fn new(
        mailbox: impl Into<String>,
        keepalive: Duration,
        transformer: MimeTransformer,
        publisher: ChatPublisher<C>,
        name: Arc<str>,
    ) -> Self {
        MailboxWatcher {
            mailbox: mailbox.into(),
            keepalive,
            transformer,
            publisher,
            name,
        }
    }

    /// Post every unseen message, then flag the posted ones as seen.
    ///
    /// Messages go out in the order the server returned them. An upload or
    /// post failure stops the batch: the messages posted before it are still
    /// flagged, the failed one and everything after it stay unseen.
    pub async fn poll_once<S>(&mut self, session: &mut S) -> Result<PollReport, BridgeError>
    where
        S: MailboxSession + ?Sized,
    {
        session.select_mailbox(&self.mailbox).await?;
        let unseen = session.search_unseen().await?;
        if unseen.is_empty() {
            return Ok(PollReport::default());
        }

        let messages = session.fetch(&unseen).await?;
        debug!("{}\tFetched {} unseen messages", self.name, messages.len());

        let mut report = PollReport::default();
        for raw in &messages {
            let Some(id) = raw.id else {
                error!("{}\tServer returned a message without UID, skipping it", self.name);
                continue;
            };
            debug!(
                "{}\tMessage {} received {:?}, flags {:?}",
                self.name, id, raw.internal_date, raw.flags
            );

            let payload = self.transformer.transform(raw);
            match self.publisher.publish(&payload).await {
                Ok(()) => report.posted.push(id),
                Err(ChatError::ChannelNotFound(channel)) => {
                    error!(
                        "{}\tDid not find channel with name {}, dropping message {}",
                        self.name, channel, id
                    );
                    report.undeliverable.push(id);
                }
                Err(e) => {
                    if let Err(mark_error) = self.mark_seen(session, &report.seen()).await {
                        // Only one error travels up; the publish failure is reported here
                        error!("{}\tError post message {}: {}", self.name, id, e);
                        return Err(mark_error);
                    }
                    return Err(e.into());
                }
            }
        }

        self.mark_seen(session, &report.seen()).await?;
        if !report.posted.is_empty() {
            info!("{}\tPosted {} new messages", self.name, report.posted.len());
        }
        Ok(report)
    }

    /// Wait for the server to report activity or for the keep-alive to run out.
    ///
    /// Never fetches: the caller polls again whatever the outcome.
    pub async fn idle_once<S>(&mut self, session: &mut S) -> Result<IdleOutcome, BridgeError>
    where
        S: MailboxSession + ?Sized,
    {
        session.select_mailbox(&self.mailbox).await?;
        let outcome = session.idle_wait(self.keepalive).await?;
        debug!("{}\tIdle returned: {:?}", self.name, outcome);
        Ok(outcome)
    }

    /// Log out of the chat service, if logged in.
    pub async fn close(&mut self) {
        self.publisher.close().await;
    }

    async fn mark_seen<S>(&self, session: &mut S, ids: &[MessageId]) -> Result<(), BridgeError>
    where
        S: MailboxSession + ?Sized,
    {
        if ids.is_empty() {
            return Ok(());
        }
        session.mark_seen(ids).await?;
        Ok(())
    }
}
