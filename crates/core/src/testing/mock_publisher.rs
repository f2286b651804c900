//! Mock publisher adapter.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::catalog::Destination;
use crate::publisher::{AdapterError, PublishResult, PublisherAdapter, UploadRequest};

/// Scripted adapter.
///
/// Queued results are returned in order; once the queue is empty every
/// call succeeds with `mock-{task_id}` at `https://{platform}.test/{task_id}`.
#[derive(Debug)]
pub struct MockPublisher {
    platform: String,
    script: Mutex<VecDeque<Result<PublishResult, String>>>,
    uploads: Mutex<Vec<UploadRequest>>,
    delay: Option<Duration>,
}

impl MockPublisher {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            script: Mutex::new(VecDeque::new()),
            uploads: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Wait this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a result for the next call.
    pub fn push_result(&self, result: PublishResult) {
        self.script.lock().unwrap().push_back(Ok(result));
    }

    /// Queue an unexpected adapter error for the next call.
    pub fn push_error(&self, message: impl Into<String>) {
        self.script.lock().unwrap().push_back(Err(message.into()));
    }

    /// Uploads received so far.
    pub fn uploads(&self) -> Vec<UploadRequest> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

#[async_trait]
impl PublisherAdapter for MockPublisher {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn publish(
        &self,
        _destination: &Destination,
        upload: &UploadRequest,
    ) -> Result<PublishResult, AdapterError> {
        self.uploads.lock().unwrap().push(upload.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(result)) => Ok(result),
            Some(Err(message)) => Err(AdapterError::Protocol(message)),
            None => Ok(PublishResult::ok(
                &self.platform,
                format!("mock-{}", upload.task_id),
                Some(format!("https://{}.test/{}", self.platform, upload.task_id)),
                json!({ "mock": true }),
            )),
        }
    }
}
