//! T01_DOWNLOAD: fetch the source video into `raw.mp4`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use super::{param_str, path_arg};
use crate::executor::{StepContext, StepError, StepHandler};
use crate::sleeper::Sleeper;

/// Anything smaller is an error page or a truncated transfer, not a clip.
pub const MIN_DOWNLOAD_BYTES: u64 = 200 * 1024;

const ATTEMPTS: u32 = 2;
const BACKOFF_MS_PER_ATTEMPT: u64 = 1500;
const SNIFF_BYTES: usize = 2048;
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

pub struct DownloadHandler {
    client: Client,
    sleeper: Arc<dyn Sleeper>,
}

impl DownloadHandler {
    pub fn new(client: Client, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { client, sleeper }
    }

    /// One transfer into `dest`. Returns the byte count and the first bytes
    /// of the payload.
    async fn fetch(
        &self,
        url: &str,
        referer: Option<&str>,
        dest: &Path,
    ) -> Result<(u64, Vec<u8>), StepError> {
        let mut request = self
            .client
            .get(url)
            .header(header::USER_AGENT, USER_AGENT)
            .header(header::ACCEPT, "*/*");
        if let Some(referer) = referer {
            request = request.header(header::REFERER, referer);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StepError::failed(format!("Download request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StepError::failed(format!("Download failed: HTTP {}", status)));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut head = Vec::with_capacity(SNIFF_BYTES);
        let mut size: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| StepError::failed(format!("Download interrupted: {}", e)))?;
            if head.len() < SNIFF_BYTES {
                let take = (SNIFF_BYTES - head.len()).min(chunk.len());
                head.extend_from_slice(&chunk[..take]);
            }
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok((size, head))
    }
}

/// Reject payloads that cannot be a video.
fn check_payload(size: u64, head: &[u8]) -> Result<(), StepError> {
    if size < MIN_DOWNLOAD_BYTES {
        return Err(StepError::failed(format!("File too small: {} bytes", size)));
    }
    let text = String::from_utf8_lossy(head).to_lowercase();
    if text.contains("<html") || text.contains("<!doctype") {
        return Err(StepError::failed("Downloaded HTML instead of video"));
    }
    Ok(())
}

fn looks_like_mp4(head: &[u8]) -> bool {
    head.windows(4).any(|w| w == b"ftyp" || w == b"moov")
}

#[async_trait]
impl StepHandler for DownloadHandler {
    async fn execute(&self, ctx: &mut StepContext, params: &Value) -> Result<Value, StepError> {
        let url = param_str(params, "url")
            .map(String::from)
            .or_else(|| ctx.download_url.clone())
            .ok_or_else(|| StepError::failed("No download_url on task"))?;
        let referer = ctx.permalink.clone();
        let dest = ctx.raw_path();
        tokio::fs::create_dir_all(&ctx.work_dir).await?;

        let mut last_error = None;
        for attempt in 1..=ATTEMPTS {
            ctx.log(format!("Downloading {} (attempt {}/{})", url, attempt, ATTEMPTS));
            let result = match self.fetch(&url, referer.as_deref(), &dest).await {
                Ok((size, head)) => check_payload(size, &head).map(|_| (size, head)),
                Err(e) => Err(e),
            };

            match result {
                Ok((size, head)) => {
                    if !looks_like_mp4(&head) {
                        warn!(task_id = ctx.task_id, "Downloaded file has no ftyp/moov marker");
                        ctx.log("Warning: no ftyp/moov marker in file header");
                    }
                    info!(task_id = ctx.task_id, size, "Download complete");
                    ctx.set_output_video(&dest);
                    return Ok(json!({ "path": path_arg(&dest), "size": size }));
                }
                Err(e) => {
                    warn!(task_id = ctx.task_id, attempt, error = %e, "Download attempt failed");
                    ctx.log(format!("Download attempt {} failed: {}", attempt, e));
                    let _ = tokio::fs::remove_file(&dest).await;
                    last_error = Some(e);
                    if attempt < ATTEMPTS {
                        let delay = Duration::from_millis(BACKOFF_MS_PER_ATTEMPT * attempt as u64);
                        if self.sleeper.sleep(delay).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| StepError::failed("Download failed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Project;
    use crate::testing::{fixtures, RecordingSleeper};
    use wiremock::matchers::{header as header_matcher, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context(dir: &Path, url: String) -> StepContext {
        let mut task = fixtures::task(4, 1, 1);
        task.download_url = Some(url);
        task.permalink = Some("https://source.test/p/4".to_string());
        StepContext::for_task(&task, &Project::new("p"), None, dir)
    }

    fn mp4_body(len: usize) -> Vec<u8> {
        let mut body = vec![0u8; len];
        body[4..8].copy_from_slice(b"ftyp");
        body
    }

    #[test]
    fn test_check_payload() {
        assert!(check_payload(MIN_DOWNLOAD_BYTES, b"....ftyp").is_ok());
        let err = check_payload(1000, b"").unwrap_err();
        assert_eq!(err.to_string(), "File too small: 1000 bytes");
        let err = check_payload(MIN_DOWNLOAD_BYTES, b"<!DOCTYPE html><html>").unwrap_err();
        assert_eq!(err.to_string(), "Downloaded HTML instead of video");
    }

    #[tokio::test]
    async fn test_download_writes_raw_video() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clip.mp4"))
            .and(header_matcher("referer", "https://source.test/p/4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(mp4_body(300 * 1024)))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let sleeper = Arc::new(RecordingSleeper::new());
        let handler = DownloadHandler::new(Client::new(), sleeper.clone());
        let mut ctx = context(dir.path(), format!("{}/clip.mp4", server.uri()));

        let out = handler.execute(&mut ctx, &json!({})).await.unwrap();
        assert_eq!(out["size"], 300 * 1024);
        assert_eq!(ctx.input_video(), dir.path().join("raw.mp4"));
        assert_eq!(
            std::fs::metadata(dir.path().join("raw.mp4")).unwrap().len(),
            300 * 1024
        );
        assert!(sleeper.durations().is_empty());
    }

    #[tokio::test]
    async fn test_small_payload_fails_after_two_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(mp4_body(1024)))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let sleeper = Arc::new(RecordingSleeper::new());
        let handler = DownloadHandler::new(Client::new(), sleeper.clone());
        let mut ctx = context(dir.path(), format!("{}/clip.mp4", server.uri()));

        let err = handler.execute(&mut ctx, &json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "File too small: 1024 bytes");
        assert_eq!(sleeper.durations(), vec![Duration::from_millis(1500)]);
        assert!(!dir.path().join("raw.mp4").exists());
    }

    #[tokio::test]
    async fn test_missing_url() {
        let dir = tempfile::tempdir().unwrap();
        let handler = DownloadHandler::new(Client::new(), Arc::new(RecordingSleeper::new()));
        let task = fixtures::task(1, 1, 1);
        let mut ctx = StepContext::for_task(&task, &Project::new("p"), None, dir.path());
        assert!(handler.execute(&mut ctx, &json!({})).await.is_err());
    }
}
