//! T18_QC: probe-based quality gate plus content policy enforcement.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{param_bool, param_str, param_u32, parse_bitrate, path_arg, require_input, run_ffmpeg};
use crate::catalog::ContentPolicy;
use crate::executor::{StepContext, StepError, StepHandler};
use crate::media::{MediaTool, ProbeInfo};

const MIN_FILE_BYTES: u64 = 500_000;

/// Tools that satisfy each policy requirement.
const VOICE_TOOLS: &[&str] = &["T10_VOICE_CONVERT", "G03_TTS", "T12_REPLACE_AUDIO"];
const CAPTION_TOOLS: &[&str] = &["T13_BUILD_CAPTIONS", "T14_BURN_CAPTIONS", "G02_CAPTIONS"];
const VISUAL_TOOLS: &[&str] = &["T15_EFFECTS", "T04_CROP_RESIZE", "T16_WATERMARK"];
const HOOK_TOOLS: &[&str] = &["G01_SCRIPT", "T21_TRIM"];

/// Policy requirements not met by the steps that produced outputs.
pub(crate) fn policy_violations(policy: &ContentPolicy, ctx: &StepContext) -> Vec<String> {
    let checks = [
        (policy.require_voice_change, "require_voice_change", VOICE_TOOLS),
        (policy.require_caption_rewrite, "require_caption_rewrite", CAPTION_TOOLS),
        (policy.require_visual_transform, "require_visual_transform", VISUAL_TOOLS),
        (policy.require_hook_rewrite, "require_hook_rewrite", HOOK_TOOLS),
    ];
    checks
        .iter()
        .filter(|(required, _, tools)| *required && !tools.iter().any(|t| ctx.has_output(t)))
        .map(|(_, name, tools)| format!("Policy {} not satisfied (needs one of {})", name, tools.join(", ")))
        .collect()
}

/// Thresholds for the probe checks.
#[derive(Debug, Clone)]
pub(crate) struct QcThresholds {
    pub min_resolution: u32,
    pub check_audio: bool,
    pub min_bitrate: Option<u64>,
}

impl QcThresholds {
    pub(crate) fn from_params(params: &Value) -> Self {
        Self {
            min_resolution: param_u32(params, "min_resolution").unwrap_or(720),
            check_audio: param_bool(params, "check_audio", true),
            min_bitrate: parse_bitrate(param_str(params, "min_bitrate").unwrap_or("2M")),
        }
    }
}

/// Split probe findings into (errors, warnings).
pub(crate) fn probe_findings(info: &ProbeInfo, thresholds: &QcThresholds) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if !info.has_video {
        errors.push("No video stream found".to_string());
    }
    if let (Some(w), Some(h)) = (info.width, info.height) {
        if w < thresholds.min_resolution || h < thresholds.min_resolution {
            warnings.push(format!("Low resolution: {}x{}", w, h));
        }
    }
    if thresholds.check_audio && !info.has_audio {
        warnings.push("No audio stream found".to_string());
    }
    if let (Some(actual), Some(min)) = (info.bit_rate, thresholds.min_bitrate) {
        if actual < min {
            warnings.push(format!("Low bitrate: {} < {}", actual, min));
        }
    }
    if let Some(size) = info.size_bytes {
        if size < MIN_FILE_BYTES {
            warnings.push(format!("Small file size: {} bytes", size));
        }
    }
    (errors, warnings)
}

pub struct QualityCheckHandler {
    media: Arc<dyn MediaTool>,
}

impl QualityCheckHandler {
    pub fn new(media: Arc<dyn MediaTool>) -> Self {
        Self { media }
    }
}

#[async_trait]
impl StepHandler for QualityCheckHandler {
    async fn execute(&self, ctx: &mut StepContext, params: &Value) -> Result<Value, StepError> {
        let mut issues = policy_violations(&ctx.policy, ctx);

        let input = require_input(ctx)?;
        let info = self.media.probe(&input).await?;
        let (errors, warnings) = probe_findings(&info, &QcThresholds::from_params(params));
        issues.extend(errors);
        if param_bool(params, "fail_on_warning", false) {
            issues.extend(warnings.iter().cloned());
        }
        for warning in &warnings {
            ctx.log(format!("QC warning: {}", warning));
        }
        if !issues.is_empty() {
            return Err(StepError::Policy(format!("QC failed: {}", issues.join("; "))));
        }

        let ready = ctx.ready_path();
        if input != ready {
            let args = vec![
                "-y".to_string(),
                "-i".to_string(),
                path_arg(&input),
                "-c".to_string(),
                "copy".to_string(),
                path_arg(&ready),
            ];
            run_ffmpeg(self.media.as_ref(), ctx, args).await?;
            ctx.set_output_video(&ready);
        }
        Ok(json!({
            "passed": true,
            "warnings": warnings,
            "path": path_arg(&ready),
        }))
    }
}
