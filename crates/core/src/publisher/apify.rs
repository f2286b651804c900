//! TikTok and Instagram uploads through automation actors.
//!
//! Both platforms go through the same synchronous actor endpoint
//! (`run-sync-get-dataset-items`); they differ only in the actor, the input
//! and how the published item is identified.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::info;

use super::{AdapterError, ApifyConfig, PublishResult, PublisherAdapter, UploadRequest};
use crate::catalog::Destination;

const CAPTION_LIMIT: usize = 2200;

/// Which platform an actor publisher targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApifyTarget {
    TikTok,
    Instagram,
}

impl ApifyTarget {
    pub fn platform(&self) -> &'static str {
        match self {
            ApifyTarget::TikTok => "tiktok",
            ApifyTarget::Instagram => "instagram",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ApifyTarget::TikTok => "TikTok",
            ApifyTarget::Instagram => "Instagram",
        }
    }
}

pub struct ApifyPublisher {
    target: ApifyTarget,
    client: Client,
    config: ApifyConfig,
}

impl ApifyPublisher {
    pub fn new(target: ApifyTarget, config: ApifyConfig) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            target,
            client,
            config,
        })
    }

    fn actor(&self) -> &str {
        match self.target {
            ApifyTarget::TikTok => &self.config.tiktok_actor,
            ApifyTarget::Instagram => &self.config.instagram_actor,
        }
    }

    fn session_id<'a>(&self, destination: &'a Destination) -> Option<&'a str> {
        let session = destination
            .credential("session_id")
            .or_else(|| destination.credential("sessionid"));
        match self.target {
            ApifyTarget::TikTok => session,
            ApifyTarget::Instagram => session.or_else(|| destination.credential("ds_user_id")),
        }
    }

    fn input(&self, session_id: &str, upload: &UploadRequest) -> Value {
        let caption = build_caption(&upload.description, &upload.tags);
        let video_path = upload.file_path.to_string_lossy();
        match self.target {
            ApifyTarget::TikTok => json!({
                "sessionId": session_id,
                "videoPath": video_path,
                "caption": caption,
                "title": upload.title.chars().take(150).collect::<String>(),
            }),
            ApifyTarget::Instagram => json!({
                "sessionId": session_id,
                "videoPath": video_path,
                "caption": caption,
            }),
        }
    }

    /// External id and public URL of the published item, if the actor
    /// reported one.
    fn published_item(&self, destination: &Destination, item: &Value) -> Option<(String, Option<String>)> {
        match self.target {
            ApifyTarget::TikTok => {
                let video_id = id_field(item, "videoId")?;
                let handle = destination
                    .credential("handle")
                    .or(destination.handle.as_deref())
                    .filter(|h| !h.is_empty());
                let url =
                    handle.map(|h| format!("https://www.tiktok.com/@{}/video/{}", h, video_id));
                Some((video_id, url))
            }
            ApifyTarget::Instagram => {
                let media_id = id_field(item, "mediaId")?;
                let url = id_field(item, "shortcode")
                    .or_else(|| id_field(item, "code"))
                    .map(|code| format!("https://www.instagram.com/reel/{}/", code));
                Some((media_id, url))
            }
        }
    }
}

#[async_trait]
impl PublisherAdapter for ApifyPublisher {
    fn platform(&self) -> &str {
        self.target.platform()
    }

    async fn publish(
        &self,
        destination: &Destination,
        upload: &UploadRequest,
    ) -> Result<PublishResult, AdapterError> {
        let platform = self.target.platform();
        let Some(token) = self.config.token.as_deref().filter(|t| !t.is_empty()) else {
            return Ok(PublishResult::fatal(
                platform,
                format!("Apify token not configured, cannot publish to {}", self.target.label()),
            ));
        };
        let Some(session_id) = self.session_id(destination) else {
            return Ok(PublishResult::fatal(
                platform,
                format!("{} session_id missing in account credentials", self.target.label()),
            ));
        };

        let url = format!(
            "{}/acts/{}/run-sync-get-dataset-items",
            self.config.base_url.trim_end_matches('/'),
            self.actor().replace('/', "~")
        );
        info!(task_id = upload.task_id, actor = self.actor(), "Running upload actor");

        let response = match self
            .client
            .post(&url)
            .query(&[("token", token)])
            .json(&self.input(session_id, upload))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return Ok(PublishResult::retryable(
                    platform,
                    format!("Actor run failed: {}", e),
                ))
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Ok(PublishResult::from_status(
                platform,
                status.as_u16(),
                "Actor run",
                &body,
            ));
        }

        let items: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(format!("actor dataset: {}", e)))?;
        let first = items.as_array().and_then(|a| a.first());

        match first.and_then(|item| self.published_item(destination, item)) {
            Some((external_id, url)) => {
                info!(task_id = upload.task_id, external_id = %external_id, "Published via actor");
                Ok(PublishResult::ok(platform, external_id, url, json!({ "items": items })))
            }
            None => Ok(PublishResult::fatal(
                platform,
                format!(
                    "Actor run completed but reported no published item: {}",
                    first.map(Value::to_string).unwrap_or_else(|| "empty".to_string())
                ),
            )
            .with_raw(json!({ "items": items }))),
        }
    }
}

/// Description followed by `#tags`, capped at the platform caption limit.
pub(crate) fn build_caption(description: &str, tags: &[String]) -> String {
    let hashtags: Vec<String> = tags.iter().map(|t| format!("#{}", t)).collect();
    let caption = format!("{} {}", description, hashtags.join(" "));
    caption.trim().chars().take(CAPTION_LIMIT).collect()
}

fn id_field(item: &Value, key: &str) -> Option<String> {
    match item.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
