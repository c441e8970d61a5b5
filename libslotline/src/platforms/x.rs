//! X (Twitter) API v2 adapter

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::config::XConfig;
use crate::error::{CredentialError, PlatformError, Result};
use crate::platforms::{Identity, Platform, ProcessingState, TokenGrant};
use crate::types::PLATFORM_X;

const UPLOAD_PATH: &str = "/2/media/upload";
const TOKEN_PATH: &str = "/2/oauth2/token";
const TWEETS_PATH: &str = "/2/tweets";
const ME_PATH: &str = "/2/users/me";

pub struct XPlatform {
    http: Client,
    api_base: String,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl XPlatform {
    /// Build an adapter from config. The client secret is read from the
    /// environment variable named by `client_secret_env`; public clients
    /// without a secret refresh with `client_id` only.
    pub fn new(config: &XConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(PlatformError::from)?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret().ok(),
        })
    }

    pub fn with_client_secret(mut self, secret: Option<String>) -> Self {
        self.client_secret = secret;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn basic_auth_header(&self, client_id: &str, secret: &str) -> String {
        let credentials = format!("{}:{}", client_id, secret);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(credentials)
        )
    }

    async fn send_upload_command(&self, token: &str, form: Form) -> Result<Response> {
        let resp = self
            .http
            .post(self.url(UPLOAD_PATH))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .map_err(PlatformError::from)?;
        Ok(resp)
    }
}

/// X rejects `video/quicktime` on upload; the same bytes pass as mp4.
pub fn upload_mime(mime: &str) -> &str {
    if mime == "video/quicktime" {
        "video/mp4"
    } else {
        mime
    }
}

pub fn media_category(mime: &str) -> &'static str {
    if mime.starts_with("video/") {
        "tweet_video"
    } else if mime == "image/gif" {
        "tweet_gif"
    } else {
        "tweet_image"
    }
}

/// Map a non-2xx response to a platform error tagged with the command name
async fn command_error(command: &str, context: &str, resp: Response) -> PlatformError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let message = format!("{} failed{} - status {}: {}", command, context, status, body);

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PlatformError::Authentication(message),
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimit(message),
        _ if command == "POST" => PlatformError::Posting(message),
        _ => PlatformError::Upload(message),
    }
}

async fn parse_json<T: for<'de> Deserialize<'de>>(command: &str, resp: Response) -> Result<T> {
    let text = resp.text().await.map_err(PlatformError::from)?;
    serde_json::from_str(&text).map_err(|e| {
        PlatformError::InvalidResponse(format!(
            "Failed to parse {} response: {} - body: {}",
            command, e, text
        ))
        .into()
    })
}

#[derive(Debug, Deserialize)]
struct MediaUploadResponse {
    data: MediaUploadData,
}

#[derive(Debug, Deserialize)]
struct MediaUploadData {
    id: String,
    processing_info: Option<MediaProcessingInfo>,
}

#[derive(Debug, Deserialize)]
struct MediaProcessingInfo {
    state: String,
    check_after_secs: Option<u64>,
    error: Option<MediaProcessingError>,
}

#[derive(Debug, Deserialize)]
struct MediaProcessingError {
    message: Option<String>,
}

impl MediaUploadData {
    /// No `processing_info` means the asset needs no server-side processing
    fn processing_state(&self) -> ProcessingState {
        let Some(info) = &self.processing_info else {
            return ProcessingState::Succeeded;
        };

        match info.state.as_str() {
            "succeeded" => ProcessingState::Succeeded,
            "failed" => ProcessingState::Failed(
                info.error
                    .as_ref()
                    .and_then(|e| e.message.clone())
                    .unwrap_or_else(|| "Media processing failed".to_string()),
            ),
            // pending, in_progress
            _ => ProcessingState::InProgress {
                check_after: info.check_after_secs.map(Duration::from_secs),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TweetResponseWrapper {
    data: TweetResponse,
}

#[derive(Debug, Deserialize)]
struct TweetResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    data: XUser,
}

#[derive(Debug, Deserialize)]
struct XUser {
    id: String,
    username: String,
}

#[async_trait]
impl Platform for XPlatform {
    fn name(&self) -> &str {
        PLATFORM_X
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant> {
        let client_id = self
            .client_id
            .as_deref()
            .ok_or_else(|| CredentialError::RefreshFailed("x.client_id is not configured".into()))?;

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
        ];

        let mut request = self.http.post(self.url(TOKEN_PATH)).form(&params);
        if let Some(secret) = &self.client_secret {
            request = request.header(
                reqwest::header::AUTHORIZATION,
                self.basic_auth_header(client_id, secret),
            );
        }

        let resp = request
            .send()
            .await
            .map_err(|e| CredentialError::RefreshFailed(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(
                CredentialError::RefreshFailed(format!("status {}: {}", status, body)).into(),
            );
        }

        let token: TokenResponse = parse_json("token refresh", resp).await?;
        Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in,
        })
    }

    async fn init_upload(&self, token: &str, total_bytes: u64, mime: &str) -> Result<String> {
        let media_type = upload_mime(mime);
        let form = Form::new()
            .text("command", "INIT")
            .text("media_type", media_type.to_string())
            .text("total_bytes", total_bytes.to_string())
            .text("media_category", media_category(media_type));

        let resp = self.send_upload_command(token, form).await?;
        if !resp.status().is_success() {
            return Err(command_error("INIT", "", resp).await.into());
        }

        let init: MediaUploadResponse = parse_json("INIT", resp).await?;
        tracing::debug!(media_id = %init.data.id, total_bytes, media_type, "INIT accepted");
        Ok(init.data.id)
    }

    async fn append_chunk(
        &self,
        token: &str,
        media_id: &str,
        segment: u32,
        chunk: Bytes,
    ) -> Result<()> {
        let len = chunk.len() as u64;
        let part = Part::stream_with_length(chunk, len)
            .file_name("chunk")
            .mime_str("application/octet-stream")
            .map_err(PlatformError::from)?;

        let form = Form::new()
            .text("command", "APPEND")
            .text("media_id", media_id.to_string())
            .text("segment_index", segment.to_string())
            .part("media", part);

        let resp = self.send_upload_command(token, form).await?;
        if !resp.status().is_success() {
            let context = format!(" at segment {}", segment);
            return Err(command_error("APPEND", &context, resp).await.into());
        }
        Ok(())
    }

    async fn finalize_upload(&self, token: &str, media_id: &str) -> Result<ProcessingState> {
        let form = Form::new()
            .text("command", "FINALIZE")
            .text("media_id", media_id.to_string());

        let resp = self.send_upload_command(token, form).await?;
        if !resp.status().is_success() {
            return Err(command_error("FINALIZE", "", resp).await.into());
        }

        let fin: MediaUploadResponse = parse_json("FINALIZE", resp).await?;
        Ok(fin.data.processing_state())
    }

    async fn upload_status(&self, token: &str, media_id: &str) -> Result<ProcessingState> {
        let resp = self
            .http
            .get(self.url(UPLOAD_PATH))
            .query(&[("command", "STATUS"), ("media_id", media_id)])
            .bearer_auth(token)
            .send()
            .await
            .map_err(PlatformError::from)?;

        if !resp.status().is_success() {
            return Err(command_error("STATUS", "", resp).await.into());
        }

        let st: MediaUploadResponse = parse_json("STATUS", resp).await?;
        Ok(st.data.processing_state())
    }

    async fn create_post(
        &self,
        token: &str,
        text: &str,
        media_ids: &[String],
        in_reply_to: Option<&str>,
    ) -> Result<String> {
        let mut body = serde_json::json!({ "text": text });

        if let Some(parent_id) = in_reply_to {
            body["reply"] = serde_json::json!({
                "in_reply_to_tweet_id": parent_id
            });
        }

        if !media_ids.is_empty() {
            body["media"] = serde_json::json!({
                "media_ids": media_ids
            });
        }

        let resp = self
            .http
            .post(self.url(TWEETS_PATH))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(PlatformError::from)?;

        if !resp.status().is_success() {
            return Err(command_error("POST", "", resp).await.into());
        }

        let wrapper: TweetResponseWrapper = parse_json("POST", resp).await?;
        Ok(wrapper.data.id)
    }

    async fn whoami(&self, token: &str) -> Result<Identity> {
        let resp = self
            .http
            .get(self.url(ME_PATH))
            .bearer_auth(token)
            .send()
            .await
            .map_err(PlatformError::from)?;

        if !resp.status().is_success() {
            return Err(command_error("whoami", "", resp).await.into());
        }

        let user: UserResponse = parse_json("whoami", resp).await?;
        Ok(Identity {
            id: user.data.id,
            username: user.data.username,
        })
    }
}
