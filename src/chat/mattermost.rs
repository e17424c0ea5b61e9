//! Mattermost REST (v4) implementation of [`ChatService`].

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::chat::{Channel, ChatService, FileUpload};
use crate::error::ChatError;
use crate::settings::MattermostConfig;

pub struct MattermostClient {
    client: reqwest::Client,
    config: MattermostConfig,
}

/// Token and team resolved at login.
pub struct MattermostSession {
    token: String,
    team_id: String,
}

#[derive(Debug, Deserialize)]
struct Team {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ChannelInfo {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    id: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    file_infos: Vec<FileInfo>,
}

#[derive(Debug, Deserialize)]
struct Post {
    id: Option<String>,
}

impl MattermostClient {
    pub fn new(config: MattermostConfig) -> Self {
        MattermostClient {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/v4/{}", self.config.server.trim_end_matches('/'), path)
    }
}

// A type the server would reject is dropped rather than failing the upload
fn file_part(file: &FileUpload) -> Part {
    let part = || Part::bytes(file.content.clone()).file_name(file.name.clone());
    match &file.content_type {
        Some(content_type) => part().mime_str(content_type).unwrap_or_else(|e| {
            warn!("Ignoring content type {} of {}: {}", content_type, file.name, e);
            part()
        }),
        None => part(),
    }
}

fn transport(e: reqwest::Error) -> ChatError {
    ChatError::Transport(e.to_string())
}

// Non-success statuses become errors; 401 means the token is no longer valid
async fn check(resp: Response, wrap: fn(String) -> ChatError) -> Result<Response, ChatError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(ChatError::SessionExpired);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(wrap(format!("{}: {}", status, body)))
}

#[async_trait]
impl ChatService for MattermostClient {
    type Session = MattermostSession;

    async fn login(&self) -> Result<MattermostSession, ChatError> {
        let auth_error = |reason: String| ChatError::Auth {
            user: self.config.username.clone(),
            reason,
        };

        let resp = self
            .client
            .post(self.api_url("users/login"))
            .json(&json!({
                "login_id": self.config.username,
                "password": self.config.password,
            }))
            .send()
            .await
            .map_err(transport)?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(auth_error(format!("{}: {}", status, body)));
        }
        let token = resp
            .headers()
            .get("Token")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| auth_error("login response carried no token".into()))?;

        let team: Team = check(
            self.client
                .get(self.api_url(&format!("teams/name/{}", self.config.team)))
                .bearer_auth(&token)
                .send()
                .await
                .map_err(transport)?,
            ChatError::Transport,
        )
        .await?
        .json()
        .await
        .map_err(transport)?;

        debug!("Logged in to {} as {}", self.config.server, self.config.username);
        Ok(MattermostSession {
            token,
            team_id: team.id,
        })
    }

    async fn list_channels(&self, session: &MattermostSession) -> Result<Vec<Channel>, ChatError> {
        let resp = self
            .client
            .get(self.api_url(&format!("users/me/teams/{}/channels", session.team_id)))
            .bearer_auth(&session.token)
            .send()
            .await
            .map_err(transport)?;
        let channels: Vec<ChannelInfo> = check(resp, ChatError::Transport)
            .await?
            .json()
            .await
            .map_err(transport)?;
        Ok(channels
            .into_iter()
            .map(|c| Channel { id: c.id, name: c.name })
            .collect())
    }

    async fn upload_files(
        &self,
        session: &MattermostSession,
        channel_id: &str,
        files: &[&FileUpload],
    ) -> Result<Vec<String>, ChatError> {
        let mut form = Form::new().text("channel_id", channel_id.to_string());
        for file in files {
            form = form.part("files", file_part(file));
        }

        let resp = self
            .client
            .post(self.api_url("files"))
            .bearer_auth(&session.token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChatError::Upload(e.to_string()))?;
        let uploaded: UploadResponse = check(resp, ChatError::Upload)
            .await?
            .json()
            .await
            .map_err(|e| ChatError::Upload(e.to_string()))?;

        if uploaded.file_infos.len() != files.len() {
            return Err(ChatError::Upload(format!(
                "sent {} files, server stored {}",
                files.len(),
                uploaded.file_infos.len()
            )));
        }
        Ok(uploaded.file_infos.into_iter().map(|info| info.id).collect())
    }

    async fn create_post(
        &self,
        session: &MattermostSession,
        channel_id: &str,
        message: &str,
        file_ids: &[String],
    ) -> Result<Option<String>, ChatError> {
        let mut post = json!({
            "channel_id": channel_id,
            "message": message,
        });
        if !file_ids.is_empty() {
            post["file_ids"] = json!(file_ids);
        }

        let resp = self
            .client
            .post(self.api_url("posts"))
            .bearer_auth(&session.token)
            .json(&post)
            .send()
            .await
            .map_err(|e| ChatError::Post(e.to_string()))?;
        let created: Post = check(resp, ChatError::Post)
            .await?
            .json()
            .await
            .map_err(|e| ChatError::Post(e.to_string()))?;
        Ok(created.id)
    }

    async fn logout(&self, session: MattermostSession) {
        let result = self
            .client
            .post(self.api_url("users/logout"))
            .bearer_auth(&session.token)
            .send()
            .await;
        if let Err(e) = result {
            warn!("Chat logout failed: {}", e);
        }
    }
}
