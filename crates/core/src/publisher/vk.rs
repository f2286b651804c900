//! VK clips: `video.save` for an upload URL, then a multipart upload.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::info;

use super::{AdapterError, PublishResult, PublisherAdapter, UploadRequest, VkConfig};
use crate::catalog::Destination;

const PLATFORM: &str = "vk";

/// VK API error codes worth retrying: rate limit, flood control, internal error.
const RETRYABLE_API_CODES: [i64; 3] = [6, 9, 10];

pub struct VkPublisher {
    client: Client,
    config: VkConfig,
}

impl VkPublisher {
    pub fn new(config: VkConfig) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn save_params(&self, token: &str, destination: &Destination, upload: &UploadRequest) -> Vec<(String, String)> {
        let mut params = vec![
            ("access_token".to_string(), token.to_string()),
            ("v".to_string(), self.config.api_version.clone()),
            ("name".to_string(), upload.title.chars().take(128).collect()),
            (
                "description".to_string(),
                upload.description.chars().take(2000).collect(),
            ),
            ("is_private".to_string(), "0".to_string()),
            ("wallpost".to_string(), "0".to_string()),
        ];
        if let Some(group_id) = group_id(destination) {
            params.push(("group_id".to_string(), group_id.to_string()));
        }
        params
    }
}

/// Group id for a community owner (negative `owner_id` credential).
fn group_id(destination: &Destination) -> Option<i64> {
    let owner = destination.credentials.get("owner_id")?;
    let owner = match owner {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    (owner < 0).then(|| owner.abs())
}

fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

#[async_trait]
impl PublisherAdapter for VkPublisher {
    fn platform(&self) -> &str {
        PLATFORM
    }

    async fn publish(
        &self,
        destination: &Destination,
        upload: &UploadRequest,
    ) -> Result<PublishResult, AdapterError> {
        let token = destination
            .credential("access_token")
            .or(self.config.access_token.as_deref())
            .filter(|t| !t.is_empty());
        let Some(token) = token else {
            return Ok(PublishResult::fatal(
                PLATFORM,
                "VK access token not configured, cannot publish to VK",
            ));
        };

        let bytes = match tokio::fs::read(&upload.file_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(PublishResult::fatal(
                    PLATFORM,
                    format!("Cannot read {}: {}", upload.file_path.display(), e),
                ))
            }
        };

        let save_url = format!("{}/video.save", self.config.base_url.trim_end_matches('/'));
        let save = match self
            .client
            .get(&save_url)
            .query(&self.save_params(token, destination, upload))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return Ok(PublishResult::retryable(
                    PLATFORM,
                    format!("video.save failed: {}", e),
                ))
            }
        };
        let status = save.status();
        if !status.is_success() {
            let body = save.text().await.unwrap_or_default();
            return Ok(PublishResult::from_status(
                PLATFORM,
                status.as_u16(),
                "video.save",
                &body,
            ));
        }

        let save_data: Value = save
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(format!("video.save: {}", e)))?;
        if let Some(error) = save_data.get("error") {
            let code = error.get("error_code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("error_msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            let text = format!("VK video.save error {}: {}", code, message);
            return Ok(if RETRYABLE_API_CODES.contains(&code) {
                PublishResult::retryable(PLATFORM, text)
            } else {
                PublishResult::fatal(PLATFORM, text)
            });
        }

        let response = save_data.get("response").cloned().unwrap_or(Value::Null);
        let Some(upload_url) = response.get("upload_url").and_then(Value::as_str) else {
            return Ok(PublishResult::retryable(
                PLATFORM,
                "VK video.save did not return upload_url",
            ));
        };

        info!(task_id = upload.task_id, size = bytes.len(), "Uploading to VK");
        let file_name = upload
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "video.mp4".to_string());
        let part = Part::bytes(bytes).file_name(file_name).mime_str("video/mp4")?;
        let form = Form::new().part("video_file", part);

        let uploaded = match self.client.post(upload_url).multipart(form).send().await {
            Ok(response) => response,
            Err(e) => {
                return Ok(PublishResult::retryable(
                    PLATFORM,
                    format!("VK upload failed: {}", e),
                ))
            }
        };
        let status = uploaded.status();
        if !status.is_success() {
            let body = uploaded.text().await.unwrap_or_default();
            return Ok(PublishResult::from_status(
                PLATFORM,
                status.as_u16(),
                "VK upload",
                &body,
            ));
        }
        let upload_data: Value = uploaded
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(format!("VK upload: {}", e)))?;
        if upload_data.get("error").is_some() {
            return Ok(PublishResult::retryable(PLATFORM, format!("VK upload error: {}", upload_data))
                .with_raw(upload_data));
        }

        let video = id_string(response.get("video_id")).or_else(|| id_string(upload_data.get("video_id")));
        let owner = id_string(response.get("owner_id")).or_else(|| id_string(upload_data.get("owner_id")));
        let raw = json!({ "save": response, "upload": upload_data });

        match (owner, video) {
            (Some(owner), Some(video)) => {
                let url = format!("https://vk.com/video{}_{}", owner, video);
                info!(task_id = upload.task_id, url = %url, "Published to VK");
                Ok(PublishResult::ok(
                    PLATFORM,
                    format!("{}_{}", owner, video),
                    Some(url),
                    raw,
                ))
            }
            (None, Some(video)) => Ok(PublishResult::ok(PLATFORM, video, None, raw)),
            _ => Ok(PublishResult::retryable(PLATFORM, "VK did not report a video id").with_raw(raw)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn destination(credentials: Value) -> Destination {
        let credentials: Map<String, Value> = serde_json::from_value(credentials).unwrap();
        Destination {
            id: 5,
            project_id: 1,
            platform: "vk".to_string(),
            social_account_id: 8,
            handle: None,
            active: true,
            credentials,
        }
    }

    fn publisher(server: &MockServer) -> VkPublisher {
        VkPublisher::new(VkConfig {
            access_token: Some("vk-token".to_string()),
            base_url: format!("{}/method", server.uri()),
            ..Default::default()
        })
        .unwrap()
    }

    fn upload(dir: &tempfile::TempDir) -> UploadRequest {
        let file_path = dir.path().join("final.mp4");
        std::fs::write(&file_path, b"video-bytes").unwrap();
        UploadRequest {
            task_id: 11,
            file_path,
            title: "clip".to_string(),
            description: "d".to_string(),
            tags: vec![],
        }
    }

    #[test]
    fn test_group_id_from_negative_owner() {
        assert_eq!(group_id(&destination(json!({"owner_id": -123}))), Some(123));
        assert_eq!(group_id(&destination(json!({"owner_id": "-77"}))), Some(77));
        assert_eq!(group_id(&destination(json!({"owner_id": 55}))), None);
        assert_eq!(group_id(&destination(json!({}))), None);
    }

    #[tokio::test]
    async fn test_save_then_upload() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        Mock::given(method("GET"))
            .and(path("/method/video.save"))
            .and(query_param("group_id", "42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": {
                    "upload_url": format!("{}/upload", server.uri()),
                    "video_id": 456,
                    "owner_id": -42
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"size": 11})))
            .mount(&server)
            .await;

        let result = publisher(&server)
            .publish(&destination(json!({"owner_id": -42})), &upload(&dir))
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.external_id.as_deref(), Some("-42_456"));
        assert_eq!(result.url.as_deref(), Some("https://vk.com/video-42_456"));
    }

    #[tokio::test]
    async fn test_api_error_codes() {
        for (code, retryable) in [(6, true), (5, false)] {
            let server = MockServer::start().await;
            let dir = tempfile::tempdir().unwrap();
            Mock::given(method("GET"))
                .and(path("/method/video.save"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "error": {"error_code": code, "error_msg": "nope"}
                })))
                .mount(&server)
                .await;

            let result = publisher(&server)
                .publish(&destination(json!({})), &upload(&dir))
                .await
                .unwrap();
            assert!(!result.success);
            assert_eq!(result.retryable, retryable, "code {}", code);
        }
    }

    #[tokio::test]
    async fn test_missing_token_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = VkPublisher::new(VkConfig::default()).unwrap();
        let result = publisher
            .publish(&destination(json!({})), &upload(&dir))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(!result.retryable);
    }
}
