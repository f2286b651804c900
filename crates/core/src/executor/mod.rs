//! Step registry and pipeline executor.
//!
//! A pipeline is an ordered list of [`StepSpec`]s. Each step names a tool id
//! that maps to a [`StepHandler`] in the [`HandlerRegistry`]. The
//! [`PipelineExecutor`] runs the list fail-fast and produces a complete
//! debug trail of [`StepRecord`](crate::task::StepRecord)s.

mod context;
pub mod handlers;
mod kind;
mod runner;

pub use context::{
    StepContext, CAPTIONS_SRT, FINAL_VIDEO, PREVIEW, PROBE_JSON, RAW_VIDEO, READY_VIDEO,
    THUMBNAIL,
};
pub use kind::StepKind;
pub use runner::{ExecutionReport, PipelineExecutor};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::catalog::PresetStep;
use crate::media::MediaError;

/// Errors a step handler can fail with.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Quality or policy violation. Retrying the same input cannot help.
    #[error("{0}")]
    Policy(String),

    #[error("step timed out after {secs}s")]
    Timeout { secs: u64 },
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// One entry of a pipeline's ordered step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    pub tool_id: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub params: Value,
}

fn default_enabled() -> bool {
    true
}

impl StepSpec {
    pub fn new(tool_id: impl Into<String>, params: Value) -> Self {
        let tool_id = tool_id.into();
        Self {
            id: tool_id.to_lowercase(),
            name: tool_id.clone(),
            tool_id,
            enabled: true,
            params,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Convert a project preset entry; `position` disambiguates repeated tools.
    pub fn from_preset(step: &PresetStep, position: usize) -> Self {
        Self {
            id: format!("preset_{}_{}", position, step.tool_id.to_lowercase()),
            tool_id: step.tool_id.clone(),
            name: step.name.clone().unwrap_or_else(|| step.tool_id.clone()),
            enabled: step.enabled,
            params: step.params.clone(),
        }
    }
}

/// Executes one kind of step.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Run the step, returning its output map.
    async fn execute(&self, ctx: &mut StepContext, params: &Value) -> Result<Value, StepError>;
}

/// Tool id to handler map, built once at startup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<StepKind, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: StepKind, handler: Arc<dyn StepHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, tool_id: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(&StepKind::from_tool_id(tool_id)).cloned()
    }

    pub fn contains(&self, tool_id: &str) -> bool {
        self.handlers.contains_key(&StepKind::from_tool_id(tool_id))
    }

    /// Registered tool ids, sorted.
    pub fn tool_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .handlers
            .keys()
            .map(|k| k.tool_id().to_string())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockStepHandler;
    use serde_json::json;

    #[test]
    fn test_registry_lookup_by_tool_id() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(StepKind::Probe, Arc::new(MockStepHandler::ok(json!({}))))
            .register(
                StepKind::Other("X99_CUSTOM".to_string()),
                Arc::new(MockStepHandler::ok(json!({}))),
            );

        assert!(registry.get("T02_PROBE").is_some());
        assert!(registry.contains("X99_CUSTOM"));
        assert!(registry.get("T01_DOWNLOAD").is_none());
        assert_eq!(registry.tool_ids(), vec!["T02_PROBE", "X99_CUSTOM"]);
    }

    #[test]
    fn test_step_spec_from_preset() {
        let mut preset = PresetStep::new("T16_WATERMARK", json!({"text": "@me"}));
        preset.name = Some("Watermark".to_string());
        preset.enabled = false;

        let spec = StepSpec::from_preset(&preset, 2);
        assert_eq!(spec.id, "preset_2_t16_watermark");
        assert_eq!(spec.name, "Watermark");
        assert!(!spec.enabled);
        assert_eq!(spec.params["text"], "@me");
    }
}
