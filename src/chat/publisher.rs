use std::sync::Arc;
use log::{debug, info};

use crate::chat::{ChatService, PostPayload};
use crate::error::ChatError;

/// Posts payloads to the chat service.
///
/// One logged-in session is kept between publishes. An expired session is
/// renewed once per publish; any other failure drops the session so the next
/// publish starts from a fresh login.
pub struct ChatPublisher<C: ChatService> {
    service: C,
    session: Option<C::Session>,
    name: Arc<str>,
}

impl<C: ChatService> ChatPublisher<C> {
    pub fn new(service: C, name: Arc<str>) -> Self {
        ChatPublisher {
            service,
            session: None,
            name,
        }
    }

    pub async fn publish(&mut self, payload: &PostPayload) -> Result<(), ChatError> {
        let result = match self.publish_with_session(payload).await {
            Err(ChatError::SessionExpired) => {
                info!("{}\tChat session expired, logging in again", self.name);
                self.session = None;
                self.publish_with_session(payload).await
            }
            other => other,
        };

        if result.is_err() {
            self.close().await;
        }
        result
    }

    /// Best-effort logout of the cached session.
    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            self.service.logout(session).await;
        }
    }

    async fn publish_with_session(&mut self, payload: &PostPayload) -> Result<(), ChatError> {
        if self.session.is_none() {
            self.session = Some(self.service.login().await?);
            debug!("{}\tLogged in to chat service", self.name);
        }
        let Some(session) = self.session.as_ref() else {
            return Err(ChatError::SessionExpired);
        };
        post(&self.service, session, payload, &self.name).await
    }
}

async fn post<C: ChatService>(
    service: &C,
    session: &C::Session,
    payload: &PostPayload,
    name: &str,
) -> Result<(), ChatError> {
    let channels = service.list_channels(session).await?;
    let channel = channels
        .iter()
        .find(|channel| channel.name == payload.channel)
        .ok_or_else(|| ChatError::ChannelNotFound(payload.channel.clone()))?;

    info!("{}\tPost new message", name);

    let files = payload.files();
    let file_ids = if files.is_empty() {
        Vec::new()
    } else {
        service
            .upload_files(session, &channel.id, &files)
            .await
            .map_err(|e| match e {
                ChatError::SessionExpired | ChatError::Upload(_) => e,
                other => ChatError::Upload(other.to_string()),
            })?
    };

    match service
        .create_post(session, &channel.id, &payload.message, &file_ids)
        .await
    {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(ChatError::Post("no post was created".into())),
        Err(e @ (ChatError::SessionExpired | ChatError::Post(_))) => Err(e),
        Err(other) => Err(ChatError::Post(other.to_string())),
    }
}
