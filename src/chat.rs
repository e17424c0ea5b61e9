use async_trait::async_trait;

use crate::error::ChatError;

pub mod publisher;
pub mod mattermost;

pub use publisher::ChatPublisher;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub name: String,
    pub content_type: Option<String>,
    pub content: Vec<u8>,
}

impl FileUpload {
    pub fn new(name: impl Into<String>, content: Vec<u8>) -> Self {
        FileUpload {
            name: name.into(),
            content_type: None,
            content,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Everything needed to post one mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostPayload {
    pub channel: String,
    pub message: String,
    pub body_document: Option<FileUpload>,
    pub attachments: Vec<FileUpload>,
}

impl PostPayload {
    /// Files in upload order: the body document first, then attachments.
    pub fn files(&self) -> Vec<&FileUpload> {
        self.body_document.iter().chain(&self.attachments).collect()
    }
}

/// The chat service as seen by the publisher.
#[async_trait]
pub trait ChatService: Send + Sync {
    type Session: Send + Sync;

    async fn login(&self) -> Result<Self::Session, ChatError>;

    async fn list_channels(&self, session: &Self::Session) -> Result<Vec<Channel>, ChatError>;

    /// Returns the identifiers of the stored files, in upload order.
    async fn upload_files(
        &self,
        session: &Self::Session,
        channel_id: &str,
        files: &[&FileUpload],
    ) -> Result<Vec<String>, ChatError>;

    /// `Ok(None)` means the service answered without creating a post.
    async fn create_post(
        &self,
        session: &Self::Session,
        channel_id: &str,
        message: &str,
        file_ids: &[String],
    ) -> Result<Option<String>, ChatError>;

    async fn logout(&self, session: Self::Session);
}
