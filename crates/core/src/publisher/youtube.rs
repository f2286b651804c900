//! YouTube Shorts via the Data API v3 resumable upload.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{AdapterError, PublishResult, PublisherAdapter, UploadRequest, YouTubeConfig};
use crate::catalog::Destination;

const PLATFORM: &str = "youtube";

/// Uploads with OAuth2 tokens taken from the destination credentials.
pub struct YouTubePublisher {
    client: Client,
    config: YouTubeConfig,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl YouTubePublisher {
    pub fn new(config: YouTubeConfig) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    /// Exchange a refresh token for a fresh access token.
    async fn refresh_access_token(
        &self,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<String, PublishResult> {
        let response = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ])
            .send()
            .await
            .map_err(|e| PublishResult::retryable(PLATFORM, format!("Token refresh failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // A rejected refresh token will not get better on retry.
            if status == StatusCode::BAD_REQUEST {
                return Err(PublishResult::fatal(
                    PLATFORM,
                    format!("Token refresh rejected: {}", body),
                ));
            }
            return Err(PublishResult::from_status(
                PLATFORM,
                status.as_u16(),
                "Token refresh",
                &body,
            ));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            PublishResult::retryable(PLATFORM, format!("Token refresh returned bad JSON: {}", e))
        })?;
        Ok(token.access_token)
    }

    async fn upload(
        &self,
        access_token: &str,
        upload: &UploadRequest,
    ) -> Result<PublishResult, AdapterError> {
        let bytes = match tokio::fs::read(&upload.file_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(PublishResult::fatal(
                    PLATFORM,
                    format!("Cannot read {}: {}", upload.file_path.display(), e),
                ))
            }
        };

        let metadata = json!({
            "snippet": {
                "title": truncate(&upload.title, 100),
                "description": truncate(&upload.description, 5000),
                "tags": upload.tags.iter().take(30).collect::<Vec<_>>(),
                "categoryId": "22",
            },
            "status": {
                "privacyStatus": "public",
                "selfDeclaredMadeForKids": false,
            },
        });

        info!(
            task_id = upload.task_id,
            size = bytes.len(),
            "Starting YouTube resumable upload"
        );

        let init = match self
            .client
            .post(&self.config.upload_url)
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .bearer_auth(access_token)
            .header("X-Upload-Content-Type", "video/mp4")
            .header("X-Upload-Content-Length", bytes.len().to_string())
            .json(&metadata)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Ok(transport_failure("Upload init", &e)),
        };

        let status = init.status();
        if status != StatusCode::OK && status.as_u16() != 308 {
            let body = init.text().await.unwrap_or_default();
            return Ok(PublishResult::from_status(
                PLATFORM,
                status.as_u16(),
                "YouTube init upload",
                &body,
            ));
        }

        let Some(session_url) = init
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
        else {
            return Ok(PublishResult::retryable(
                PLATFORM,
                "YouTube did not return an upload URL",
            ));
        };
        debug!(task_id = upload.task_id, "Upload session opened");

        let put = match self
            .client
            .put(&session_url)
            .header(header::CONTENT_TYPE, "video/mp4")
            .body(bytes)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Ok(transport_failure("Upload", &e)),
        };

        let status = put.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            let body = put.text().await.unwrap_or_default();
            return Ok(PublishResult::from_status(
                PLATFORM,
                status.as_u16(),
                "YouTube upload",
                &body,
            ));
        }

        let data: Value = put
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(format!("upload response: {}", e)))?;
        let Some(video_id) = data.get("id").and_then(Value::as_str).map(String::from) else {
            return Ok(PublishResult::retryable(PLATFORM, "YouTube response has no video id")
                .with_raw(data));
        };

        let url = format!("https://youtube.com/shorts/{}", video_id);
        info!(task_id = upload.task_id, url = %url, "Published to YouTube");
        Ok(PublishResult::ok(PLATFORM, video_id, Some(url), data))
    }
}

#[async_trait]
impl PublisherAdapter for YouTubePublisher {
    fn platform(&self) -> &str {
        PLATFORM
    }

    async fn publish(
        &self,
        destination: &Destination,
        upload: &UploadRequest,
    ) -> Result<PublishResult, AdapterError> {
        let access_token = destination.credential("access_token");
        let refresh_token = destination.credential("refresh_token");
        if access_token.is_none() && refresh_token.is_none() {
            return Ok(PublishResult::fatal(
                PLATFORM,
                "YouTube OAuth2 credentials missing (access_token / refresh_token)",
            ));
        }

        let client_id = destination
            .credential("client_id")
            .or(self.config.client_id.as_deref());
        let client_secret = destination
            .credential("client_secret")
            .or(self.config.client_secret.as_deref());

        let token = match (refresh_token, client_id, client_secret) {
            (Some(refresh), Some(id), Some(secret)) => {
                match self.refresh_access_token(refresh, id, secret).await {
                    Ok(token) => token,
                    Err(failure) => return Ok(failure),
                }
            }
            _ => match access_token {
                Some(token) => token.to_string(),
                None => {
                    return Ok(PublishResult::fatal(
                        PLATFORM,
                        "No valid access_token and no client credentials to refresh one",
                    ))
                }
            },
        };

        self.upload(&token, upload).await
    }
}

fn transport_failure(context: &str, error: &reqwest::Error) -> PublishResult {
    PublishResult::retryable(PLATFORM, format!("{} failed: {}", context, error))
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
