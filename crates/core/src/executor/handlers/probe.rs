//! T02_PROBE: inspect the current video and persist `probe.json`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{path_arg, require_input};
use crate::executor::{StepContext, StepError, StepHandler};
use crate::media::MediaTool;

pub struct ProbeHandler {
    media: Arc<dyn MediaTool>,
}

impl ProbeHandler {
    pub fn new(media: Arc<dyn MediaTool>) -> Self {
        Self { media }
    }
}

#[async_trait]
impl StepHandler for ProbeHandler {
    async fn execute(&self, ctx: &mut StepContext, _params: &Value) -> Result<Value, StepError> {
        let input = require_input(ctx)?;
        let info = self.media.probe(&input).await?;

        let probe_path = ctx.probe_path();
        let document = serde_json::to_vec_pretty(&info.raw)
            .map_err(|e| StepError::failed(format!("Cannot serialize probe: {}", e)))?;
        tokio::fs::write(&probe_path, document).await?;

        ctx.log(format!(
            "Probe: {}x{} {:.1}s audio={}",
            info.width.unwrap_or(0),
            info.height.unwrap_or(0),
            info.duration_secs.unwrap_or(0.0),
            info.has_audio
        ));
        let outputs = json!({
            "duration": info.duration_secs,
            "width": info.width,
            "height": info.height,
            "fps": info.fps,
            "has_audio": info.has_audio,
            "probe_path": path_arg(&probe_path),
        });
        ctx.probe = Some(info);
        Ok(outputs)
    }
}
