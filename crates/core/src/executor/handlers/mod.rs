//! Built-in step handlers.
//!
//! Transform steps build ffmpeg argument lists and run them through the
//! [`MediaTool`] boundary; each one reads `ctx.input_video()` and moves the
//! current video pointer to the file it wrote.

mod captions;
mod download;
mod probe;
mod publish;
mod qc;
mod transform;

pub use captions::{BuildCaptionsHandler, BurnCaptionsHandler};
pub use download::{DownloadHandler, MIN_DOWNLOAD_BYTES};
pub use probe::ProbeHandler;
pub use publish::PublishStepHandler;
pub use qc::QualityCheckHandler;
pub use transform::{
    CopyReadyHandler, CropResizeHandler, EffectsHandler, NormalizeHandler, PackageHandler,
    PreviewHandler, SpeedHandler, ThumbnailHandler, TrimHandler, WatermarkHandler,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};

use super::{HandlerRegistry, StepContext, StepError, StepKind};
use crate::media::{MediaError, MediaTool};
use crate::publisher::PublishService;
use crate::sleeper::Sleeper;

/// What the built-in handlers need from the outside world.
#[derive(Clone)]
pub struct HandlerDeps {
    pub media: Arc<dyn MediaTool>,
    pub http: reqwest::Client,
    pub sleeper: Arc<dyn Sleeper>,
    /// Backs `P01_PUBLISH`; the step is left unregistered without it.
    pub publish: Option<Arc<PublishService>>,
}

/// Registry with every built-in handler.
pub fn builtin_registry(deps: &HandlerDeps) -> HandlerRegistry {
    let media = &deps.media;
    let mut registry = HandlerRegistry::new();
    registry
        .register(
            StepKind::Download,
            Arc::new(DownloadHandler::new(deps.http.clone(), deps.sleeper.clone())),
        )
        .register(StepKind::Probe, Arc::new(ProbeHandler::new(media.clone())))
        .register(StepKind::Normalize, Arc::new(NormalizeHandler::new(media.clone())))
        .register(StepKind::CropResize, Arc::new(CropResizeHandler::new(media.clone())))
        .register(StepKind::Thumbnail, Arc::new(ThumbnailHandler::new(media.clone())))
        .register(StepKind::Preview, Arc::new(PreviewHandler::new(media.clone())))
        .register(StepKind::BuildCaptions, Arc::new(BuildCaptionsHandler))
        .register(StepKind::BurnCaptions, Arc::new(BurnCaptionsHandler::new(media.clone())))
        .register(StepKind::Effects, Arc::new(EffectsHandler::new(media.clone())))
        .register(StepKind::Watermark, Arc::new(WatermarkHandler::new(media.clone())))
        .register(StepKind::Package, Arc::new(PackageHandler::new(media.clone())))
        .register(StepKind::QualityCheck, Arc::new(QualityCheckHandler::new(media.clone())))
        .register(StepKind::Speed, Arc::new(SpeedHandler::new(media.clone())))
        .register(StepKind::Trim, Arc::new(TrimHandler::new(media.clone())))
        .register(StepKind::CopyReady, Arc::new(CopyReadyHandler::new(media.clone())));
    if let Some(ref service) = deps.publish {
        registry.register(StepKind::Publish, Arc::new(PublishStepHandler::new(service.clone())));
    }
    registry
}

// ============================================================================
// Parameter helpers
// ============================================================================

pub(crate) fn param_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Numeric parameter; numeric strings are accepted.
pub(crate) fn param_f64(params: &Value, key: &str) -> Option<f64> {
    match params.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn param_u32(params: &Value, key: &str) -> Option<u32> {
    param_f64(params, key)
        .filter(|v| *v > 0.0 && *v <= u32::MAX as f64)
        .map(|v| v.round() as u32)
}

pub(crate) fn param_bool(params: &Value, key: &str, default: bool) -> bool {
    match params.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.as_str(), "true" | "1" | "yes"),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        _ => default,
    }
}

/// Bitrate like `2M`, `800k` or `1500000` in bits per second.
pub(crate) fn parse_bitrate(value: &str) -> Option<u64> {
    let value = value.trim();
    let (number, multiplier) = match value.chars().last()? {
        'k' | 'K' => (&value[..value.len() - 1], 1_000.0),
        'm' | 'M' => (&value[..value.len() - 1], 1_000_000.0),
        _ => (value, 1.0),
    };
    let number: f64 = number.trim().parse().ok()?;
    (number >= 0.0).then(|| (number * multiplier) as u64)
}

// ============================================================================
// Shared step plumbing
// ============================================================================

pub(crate) fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// The current video, which must exist on disk.
pub(crate) fn require_input(ctx: &StepContext) -> Result<PathBuf, StepError> {
    let input = ctx.input_video();
    if !input.is_file() {
        return Err(MediaError::InputNotFound { path: input }.into());
    }
    Ok(input)
}

/// Run ffmpeg and log the invocation in the run log.
pub(crate) async fn run_ffmpeg(
    media: &dyn MediaTool,
    ctx: &mut StepContext,
    args: Vec<String>,
) -> Result<(), StepError> {
    ctx.log(format!("{} {}", media.name(), args.join(" ")));
    media.ffmpeg(&args).await?;
    Ok(())
}

/// Outputs of a step that chose not to run.
pub(crate) fn skipped(reason: &str) -> Value {
    json!({ "skipped": true, "reason": reason })
}
