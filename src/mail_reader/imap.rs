use anyhow::Result;
use async_imap::extensions::idle::IdleResponse;
use async_imap::types::Fetch;
use async_imap::{Client, Session};
use async_trait::async_trait;
use futures::TryStreamExt;
use std::mem;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use log::{debug, info};

use crate::error::MailboxError;
use crate::mail_reader::{
    IdleOutcome, MailboxConnector, MailboxSession, MessageId, RawMessage, SessionState,
};
use crate::settings::ImapConfig;

type ImapStream = Compat<tokio_native_tls::TlsStream<TcpStream>>;

// BODY.PEEK so that fetching never sets \Seen by itself
const FETCH_QUERY: &str = "(FLAGS INTERNALDATE UID RFC822.HEADER BODY.PEEK[])";

// Establish a TLS-encrypted connection to the IMAP server
async fn connect_to_server(server: &str, port: u16) -> Result<tokio_native_tls::TlsStream<TcpStream>> {
    let imap_addr = (server, port);
    let tcp_stream = TcpStream::connect(imap_addr).await?;
    let tls = tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
    let tls_stream = tls.connect(server, tcp_stream).await?;

    info!("-- connected to {}:{}", server, port);
    Ok(tls_stream)
}

fn uid_set(ids: &[MessageId]) -> String {
    ids.iter()
        .map(MessageId::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn raw_message(fetch: &Fetch) -> RawMessage {
    RawMessage {
        id: fetch.uid.map(MessageId),
        flags: fetch.flags().map(|flag| format!("{:?}", flag)).collect(),
        internal_date: fetch.internal_date(),
        header: fetch.header().map(<[u8]>::to_vec).unwrap_or_default(),
        body: fetch.body().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

/// Dials an IMAP server over TLS.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    server: String,
    port: u16,
}

impl ImapConnector {
    pub fn new(config: &ImapConfig) -> Self {
        ImapConnector {
            server: config.server.clone(),
            port: config.port,
        }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    type Session = ImapSession;

    async fn connect(&self) -> Result<ImapSession, MailboxError> {
        let tls_stream = connect_to_server(&self.server, self.port)
            .await
            .map_err(|e| MailboxError::Connection {
                server: format!("{}:{}", self.server, self.port),
                reason: format!("{:#}", e),
            })?;
        Ok(ImapSession {
            connection: Connection::Connected(Client::new(tls_stream.compat())),
            state: SessionState::Connecting,
        })
    }
}

enum Connection {
    Connected(Client<ImapStream>),
    Authenticated(Session<ImapStream>),
    Closed,
}

/// An async-imap connection, tracking where it is in its lifecycle.
pub struct ImapSession {
    connection: Connection,
    state: SessionState,
}

impl ImapSession {
    fn session(&mut self) -> Result<&mut Session<ImapStream>, MailboxError> {
        match &mut self.connection {
            Connection::Authenticated(session) => Ok(session),
            _ => Err(MailboxError::protocol("session", "not logged in")),
        }
    }

    // Any failed command leaves the connection unusable
    fn settle<T>(&mut self, result: Result<T, MailboxError>) -> Result<T, MailboxError> {
        self.state = if result.is_ok() {
            SessionState::Authenticated
        } else {
            SessionState::Failed
        };
        result
    }
}

#[async_trait]
impl MailboxSession for ImapSession {
    fn state(&self) -> SessionState {
        self.state
    }

    async fn authenticate(&mut self, user: &str, secret: &str) -> Result<(), MailboxError> {
        let Connection::Connected(client) = mem::replace(&mut self.connection, Connection::Closed)
        else {
            self.state = SessionState::Failed;
            return Err(MailboxError::Auth {
                user: user.to_string(),
                reason: "connection is not fresh".into(),
            });
        };

        match client.login(user, secret).await {
            Ok(session) => {
                info!("-- logged in as {}", user);
                self.connection = Connection::Authenticated(session);
                self.state = SessionState::Authenticated;
                Ok(())
            }
            Err((e, _client)) => {
                self.state = SessionState::Failed;
                Err(MailboxError::Auth {
                    user: user.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn select_mailbox(&mut self, name: &str) -> Result<(), MailboxError> {
        self.state = SessionState::Polling;
        let result = async {
            let mailbox = self
                .session()?
                .select(name)
                .await
                .map_err(|e| MailboxError::protocol("SELECT", e))?;
            debug!("-- {} selected, {} messages", name, mailbox.exists);
            Ok::<_, MailboxError>(())
        }
        .await;
        self.settle(result)
    }

    async fn search_unseen(&mut self) -> Result<Vec<MessageId>, MailboxError> {
        self.state = SessionState::Polling;
        let result = async {
            let uids = self
                .session()?
                .uid_search("UNSEEN")
                .await
                .map_err(|e| MailboxError::protocol("UID SEARCH", e))?;
            // async-imap hands back a set; sort it for a stable fetch set only
            let mut ids: Vec<MessageId> = uids.into_iter().map(MessageId).collect();
            ids.sort_unstable();
            Ok::<_, MailboxError>(ids)
        }
        .await;
        self.settle(result)
    }

    async fn fetch(&mut self, ids: &[MessageId]) -> Result<Vec<RawMessage>, MailboxError> {
        self.state = SessionState::Polling;
        let result = async {
            let fetches: Vec<Fetch> = self
                .session()?
                .uid_fetch(uid_set(ids), FETCH_QUERY)
                .await
                .map_err(|e| MailboxError::protocol("UID FETCH", e))?
                .try_collect()
                .await
                .map_err(|e| MailboxError::protocol("UID FETCH", e))?;
            Ok::<_, MailboxError>(fetches.iter().map(raw_message).collect::<Vec<_>>())
        }
        .await;
        self.settle(result)
    }

    async fn mark_seen(&mut self, ids: &[MessageId]) -> Result<(), MailboxError> {
        self.state = SessionState::Polling;
        let result = async {
            let _updates: Vec<Fetch> = self
                .session()?
                .uid_store(uid_set(ids), "+FLAGS.SILENT (\\Seen)")
                .await
                .map_err(|e| MailboxError::protocol("UID STORE", e))?
                .try_collect()
                .await
                .map_err(|e| MailboxError::protocol("UID STORE", e))?;
            Ok::<_, MailboxError>(())
        }
        .await;
        self.settle(result)
    }

    async fn idle_wait(&mut self, keepalive: Duration) -> Result<IdleOutcome, MailboxError> {
        let Connection::Authenticated(session) =
            mem::replace(&mut self.connection, Connection::Closed)
        else {
            self.state = SessionState::Failed;
            return Err(MailboxError::protocol("IDLE", "not logged in"));
        };
        self.state = SessionState::Idling;

        let mut handle = session.idle();
        let response = async {
            handle.init().await?;
            let (wait, interrupt) = handle.wait_with_timeout(keepalive);
            let response = wait.await;
            // Dropping the stop source early would end the wait at once
            drop(interrupt);
            response
        }
        .await;
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.state = SessionState::Failed;
                return Err(MailboxError::protocol("IDLE", e));
            }
        };

        match handle.done().await {
            Ok(session) => {
                self.connection = Connection::Authenticated(session);
                self.state = SessionState::Authenticated;
            }
            Err(e) => {
                self.state = SessionState::Failed;
                return Err(MailboxError::protocol("DONE", e));
            }
        }

        Ok(match response {
            IdleResponse::Timeout => IdleOutcome::KeepAliveExpired,
            IdleResponse::NewData(_) | IdleResponse::ManualInterrupt => IdleOutcome::Activity,
        })
    }

    async fn logout(&mut self, timeout: Duration) -> Result<(), MailboxError> {
        let connection = mem::replace(&mut self.connection, Connection::Closed);
        self.state = SessionState::Disconnected;
        let Connection::Authenticated(mut session) = connection else {
            return Ok(());
        };

        // Be nice to the server and log out
        match tokio::time::timeout(timeout, session.logout()).await {
            Ok(result) => result.map_err(|e| MailboxError::protocol("LOGOUT", e)),
            Err(_) => Err(MailboxError::protocol("LOGOUT", "timed out")),
        }
    }
}
