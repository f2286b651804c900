//! Mock step handler for executor tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::executor::{StepContext, StepError, StepHandler};

/// Returns a fixed output (or error) and counts its invocations.
#[derive(Debug, Clone)]
pub struct MockStepHandler {
    result: Result<Value, String>,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
    params: Arc<Mutex<Vec<Value>>>,
}

impl MockStepHandler {
    /// Succeeds with `output`.
    pub fn ok(output: Value) -> Self {
        Self {
            result: Ok(output),
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
            params: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fails with `StepError::Failed(message)`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            result: Err(message.into()),
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
            params: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Sleep before answering, to exercise step timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared invocation counter, still readable after the handler moved
    /// into a registry.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Parameters of every invocation, shared like [`Self::calls`].
    pub fn params(&self) -> Arc<Mutex<Vec<Value>>> {
        self.params.clone()
    }
}

#[async_trait]
impl StepHandler for MockStepHandler {
    async fn execute(&self, _ctx: &mut StepContext, params: &Value) -> Result<Value, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.params.lock() {
            seen.push(params.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.result.clone().map_err(StepError::Failed)
    }
}
