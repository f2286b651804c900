//! ffmpeg-backed transform steps.
//!
//! Each `*_args` function is a pure builder of the ffmpeg argument list
//! (output path last); the handlers resolve inputs, run it, and advance the
//! current video.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    param_bool, param_f64, param_str, param_u32, parse_bitrate, path_arg, require_input,
    run_ffmpeg, skipped,
};
use crate::catalog::ExportProfile;
use crate::executor::{StepContext, StepError, StepHandler};
use crate::media::MediaTool;

const DEFAULT_FPS: u32 = 30;
const DEFAULT_WIDTH: u32 = 1080;
const DEFAULT_HEIGHT: u32 = 1920;

fn strings<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// `libx265` for h265/hevc, `libx264` otherwise.
fn video_encoder(codec: Option<&str>) -> &'static str {
    match codec.map(|c| c.to_lowercase()) {
        Some(c) if c.contains("265") || c.contains("hevc") => "libx265",
        _ => "libx264",
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

// ============================================================================
// Argument builders
// ============================================================================

pub(crate) fn normalize_args(input: &Path, output: &Path, fps: u32, codec: Option<&str>) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-i".to_string(), path_arg(input)];
    args.extend(["-r".to_string(), fps.to_string()]);
    args.extend(["-c:v".to_string(), video_encoder(codec).to_string()]);
    args.extend(strings(["-preset", "medium", "-crf", "23", "-pix_fmt", "yuv420p"]));
    args.extend(strings(["-c:a", "aac", "-b:a", "192k", "-ar", "48000"]));
    args.push(path_arg(output));
    args
}

/// Scale to cover `width`x`height` keeping the aspect ratio, then center-crop.
pub(crate) fn crop_resize_args(input: &Path, output: &Path, width: u32, height: u32) -> Vec<String> {
    let ratio = format!("{}/{}", width, height);
    let filter = format!(
        "scale='if(gte(a,{r}),-2,{w})':'if(gte(a,{r}),{h},-2)',crop={w}:{h},setsar=1",
        r = ratio,
        w = width,
        h = height
    );
    let mut args = vec!["-y".to_string(), "-i".to_string(), path_arg(input)];
    args.extend(strings(["-map", "0:v:0", "-map", "0:a:0?"]));
    args.extend(["-vf".to_string(), filter]);
    args.extend(strings(["-c:v", "libx264", "-preset", "veryfast", "-crf", "20"]));
    args.extend(strings(["-c:a", "aac", "-b:a", "128k"]));
    args.push(path_arg(output));
    args
}

pub(crate) fn thumbnail_args(input: &Path, output: &Path, timestamp: &str) -> Vec<String> {
    let mut args = strings(["-y", "-ss"]);
    args.push(timestamp.to_string());
    args.extend(["-i".to_string(), path_arg(input)]);
    args.extend(strings(["-frames:v", "1", "-q:v", "2"]));
    args.push(path_arg(output));
    args
}

pub(crate) fn preview_args(input: &Path, output: &Path, seconds: f64, width: u32) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-i".to_string(), path_arg(input)];
    args.extend(["-t".to_string(), format_number(seconds), "-an".to_string()]);
    args.extend(["-vf".to_string(), format!("scale={}:-2", width)]);
    args.extend(strings(["-c:v", "libx264", "-preset", "ultrafast", "-crf", "28"]));
    args.push(path_arg(output));
    args
}

/// Visual effects requested by a T15 step.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Effects {
    pub mirror: bool,
    pub zoom: Option<f64>,
    pub hue_shift: Option<f64>,
    pub grain: Option<f64>,
    pub strip_metadata: bool,
}

impl Effects {
    pub(crate) fn from_params(params: &Value) -> Self {
        Self {
            mirror: param_bool(params, "mirror", false),
            zoom: param_f64(params, "zoom_max").filter(|z| *z > 1.0),
            hue_shift: param_f64(params, "color_shift").filter(|h| *h != 0.0),
            grain: param_f64(params, "grain").filter(|g| *g > 0.0),
            strip_metadata: param_bool(params, "strip_metadata", true),
        }
    }

    fn filters(&self) -> Vec<String> {
        let mut filters = Vec::new();
        if self.mirror {
            filters.push("hflip".to_string());
        }
        if let Some(z) = self.zoom {
            let z = format_number(z);
            filters.push(format!("scale=iw*{z}:ih*{z},crop=iw/{z}:ih/{z}", z = z));
        }
        if let Some(h) = self.hue_shift {
            filters.push(format!("hue=h={}", format_number(h)));
        }
        if let Some(g) = self.grain {
            filters.push(format!("noise=c0s={}:c0f=t+u", format_number((g * 20.0).round())));
        }
        filters
    }

    fn is_noop(&self) -> bool {
        self.filters().is_empty() && !self.strip_metadata
    }
}

pub(crate) fn effects_args(input: &Path, output: &Path, effects: &Effects) -> Vec<String> {
    let filters = effects.filters();
    let mut args = vec!["-y".to_string(), "-i".to_string(), path_arg(input)];
    if filters.is_empty() {
        args.extend(strings(["-c:v", "copy"]));
    } else {
        args.extend(["-vf".to_string(), filters.join(",")]);
        args.extend(strings(["-c:v", "libx264", "-preset", "medium", "-crf", "20"]));
    }
    args.extend(strings(["-c:a", "copy"]));
    if effects.strip_metadata {
        args.extend(strings(["-map_metadata", "-1"]));
    }
    args.push(path_arg(output));
    args
}

/// Escape text for use inside a drawtext `text='...'` value.
pub(crate) fn escape_drawtext(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            ':' => escaped.push_str("\\:"),
            '\'' => escaped.push_str("\\'"),
            '%' => escaped.push_str("\\%"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// drawtext x/y and overlay x/y expressions for a named position.
fn position_exprs(position: &str, margin: u32, text: bool) -> (String, String) {
    let (w, h) = if text { ("tw", "th") } else { ("overlay_w", "overlay_h") };
    let (frame_w, frame_h) = if text { ("w", "h") } else { ("main_w", "main_h") };
    let m = margin;
    match position {
        "top_left" => (m.to_string(), m.to_string()),
        "top_right" => (format!("{}-{}-{}", frame_w, w, m), m.to_string()),
        "bottom_left" => (m.to_string(), format!("{}-{}-{}", frame_h, h, m)),
        "center" => (
            format!("({}-{})/2", frame_w, w),
            format!("({}-{})/2", frame_h, h),
        ),
        _ => (
            format!("{}-{}-{}", frame_w, w, m),
            format!("{}-{}-{}", frame_h, h, m),
        ),
    }
}

/// What a T16 step stamps on the video.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Watermark {
    Text { text: String, font_size: u32 },
    Image { path: String },
}

pub(crate) fn watermark_args(
    input: &Path,
    output: &Path,
    watermark: &Watermark,
    position: &str,
    opacity: f64,
    margin: u32,
) -> Vec<String> {
    let opacity = format_number(opacity.clamp(0.0, 1.0));
    let mut args = vec!["-y".to_string(), "-i".to_string(), path_arg(input)];
    match watermark {
        Watermark::Text { text, font_size } => {
            let (x, y) = position_exprs(position, margin, true);
            let filter = format!(
                "drawtext=text='{}':fontsize={}:fontcolor=white@{}:x={}:y={}:shadowcolor=black@0.5:shadowx=2:shadowy=2",
                escape_drawtext(text),
                font_size,
                opacity,
                x,
                y
            );
            args.extend(["-vf".to_string(), filter]);
        }
        Watermark::Image { path } => {
            let (x, y) = position_exprs(position, margin, false);
            args.extend(["-i".to_string(), path.clone()]);
            let filter = format!(
                "[1:v]format=rgba,colorchannelmixer=aa={}[wm];[0:v][wm]overlay={}:{}",
                opacity, x, y
            );
            args.extend(["-filter_complex".to_string(), filter]);
        }
    }
    args.extend(strings(["-c:v", "libx264", "-preset", "medium", "-crf", "20", "-c:a", "copy"]));
    args.push(path_arg(output));
    args
}

/// Final encode settings, resolved from params over the export profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PackageSettings {
    pub codec: Option<String>,
    pub crf: u32,
    pub video_bitrate: Option<String>,
    pub fps: Option<u32>,
    pub max_duration: Option<f64>,
}

impl PackageSettings {
    pub(crate) fn resolve(params: &Value, profile: &ExportProfile) -> Self {
        Self {
            codec: param_str(params, "codec")
                .map(String::from)
                .or_else(|| profile.codec.clone()),
            crf: param_u32(params, "crf").unwrap_or(20),
            video_bitrate: param_str(params, "video_bitrate")
                .map(String::from)
                .or_else(|| profile.video_bitrate.clone()),
            fps: param_u32(params, "fps").or(profile.fps),
            max_duration: param_f64(params, "max_duration_sec")
                .or(profile.max_duration_sec)
                .filter(|d| *d > 0.0),
        }
    }
}

pub(crate) fn package_args(input: &Path, output: &Path, settings: &PackageSettings) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-i".to_string(), path_arg(input)];
    if let Some(max) = settings.max_duration {
        args.extend(["-t".to_string(), format_number(max)]);
    }
    args.extend(["-c:v".to_string(), video_encoder(settings.codec.as_deref()).to_string()]);
    args.extend(strings(["-preset", "slow", "-crf"]));
    args.push(settings.crf.to_string());
    if let Some(ref bitrate) = settings.video_bitrate {
        let bufsize = parse_bitrate(bitrate)
            .map(|b| (b * 2).to_string())
            .unwrap_or_else(|| bitrate.clone());
        args.extend(["-b:v".to_string(), bitrate.clone()]);
        args.extend(["-maxrate".to_string(), bitrate.clone()]);
        args.extend(["-bufsize".to_string(), bufsize]);
    }
    if let Some(fps) = settings.fps {
        args.extend(["-r".to_string(), fps.to_string()]);
    }
    args.extend(strings(["-pix_fmt", "yuv420p", "-c:a", "aac", "-b:a", "192k", "-ar", "44100"]));
    args.extend(strings(["-movflags", "+faststart", "-map_metadata", "-1"]));
    args.push(path_arg(output));
    args
}

pub(crate) fn speed_args(input: &Path, output: &Path, factor: f64, has_audio: bool) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-i".to_string(), path_arg(input)];
    args.extend(["-filter:v".to_string(), format!("setpts=PTS/{}", format_number(factor))]);
    if has_audio {
        let tempo = factor.clamp(0.5, 2.0);
        args.extend(["-filter:a".to_string(), format!("atempo={}", format_number(tempo))]);
        args.extend(strings(["-c:a", "aac"]));
    } else {
        args.push("-an".to_string());
    }
    args.extend(strings(["-c:v", "libx264", "-preset", "medium", "-crf", "20"]));
    args.push(path_arg(output));
    args
}

/// Trim window of a T21 step. `duration` wins over `end`.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct TrimWindow {
    pub start: Option<f64>,
    pub duration: Option<f64>,
    pub end: Option<f64>,
}

impl TrimWindow {
    pub(crate) fn from_params(params: &Value) -> Self {
        Self {
            start: param_f64(params, "start").filter(|s| *s > 0.0),
            duration: param_f64(params, "duration").filter(|d| *d > 0.0),
            end: param_f64(params, "end").filter(|e| *e > 0.0),
        }
    }

    fn is_empty(&self) -> bool {
        self.start.is_none() && self.duration.is_none() && self.end.is_none()
    }
}

pub(crate) fn trim_args(input: &Path, output: &Path, window: &TrimWindow) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-i".to_string(), path_arg(input)];
    if let Some(start) = window.start {
        args.extend(["-ss".to_string(), format_number(start)]);
    }
    if let Some(duration) = window.duration {
        args.extend(["-t".to_string(), format_number(duration)]);
    } else if let Some(end) = window.end {
        args.extend(["-to".to_string(), format_number(end)]);
    }
    args.extend(strings(["-c:v", "libx264", "-preset", "medium", "-crf", "20", "-c:a", "aac"]));
    args.push(path_arg(output));
    args
}

pub(crate) fn copy_args(input: &Path, output: &Path) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-i".to_string(), path_arg(input)];
    args.extend(strings(["-c", "copy"]));
    args.push(path_arg(output));
    args
}

// ============================================================================
// Handlers
// ============================================================================

macro_rules! media_handler {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub struct $name {
            media: Arc<dyn MediaTool>,
        }

        impl $name {
            pub fn new(media: Arc<dyn MediaTool>) -> Self {
                Self { media }
            }
        }
    };
}

media_handler!(
    /// T03_NORMALIZE
    NormalizeHandler
);
media_handler!(
    /// T04_CROP_RESIZE
    CropResizeHandler
);
media_handler!(
    /// T05_THUMBNAIL
    ThumbnailHandler
);
media_handler!(
    /// T05_PREVIEW
    PreviewHandler
);
media_handler!(
    /// T15_EFFECTS
    EffectsHandler
);
media_handler!(
    /// T16_WATERMARK
    WatermarkHandler
);
media_handler!(
    /// T17_PACKAGE
    PackageHandler
);
media_handler!(
    /// T20_SPEED
    SpeedHandler
);
media_handler!(
    /// T21_TRIM
    TrimHandler
);
media_handler!(
    /// T30_COPY_READY
    CopyReadyHandler
);

/// Run `args` and make `output` the current video.
async fn transform(
    media: &dyn MediaTool,
    ctx: &mut StepContext,
    args: Vec<String>,
    output: &Path,
) -> Result<Value, StepError> {
    run_ffmpeg(media, ctx, args).await?;
    ctx.set_output_video(output);
    Ok(json!({ "path": path_arg(output) }))
}

#[async_trait]
impl StepHandler for NormalizeHandler {
    async fn execute(&self, ctx: &mut StepContext, params: &Value) -> Result<Value, StepError> {
        let input = require_input(ctx)?;
        let output = ctx.path("normalized.mp4");
        let fps = param_u32(params, "fps")
            .or(ctx.export_profile.fps)
            .unwrap_or(DEFAULT_FPS);
        let codec = param_str(params, "codec")
            .map(String::from)
            .or_else(|| ctx.export_profile.codec.clone());
        let args = normalize_args(&input, &output, fps, codec.as_deref());
        transform(self.media.as_ref(), ctx, args, &output).await
    }
}

#[async_trait]
impl StepHandler for CropResizeHandler {
    async fn execute(&self, ctx: &mut StepContext, params: &Value) -> Result<Value, StepError> {
        let input = require_input(ctx)?;
        let output = ctx.ready_path();
        let width = param_u32(params, "width")
            .or(ctx.export_profile.width)
            .unwrap_or(DEFAULT_WIDTH);
        let height = param_u32(params, "height")
            .or(ctx.export_profile.height)
            .unwrap_or(DEFAULT_HEIGHT);
        let args = crop_resize_args(&input, &output, width, height);
        let mut out = transform(self.media.as_ref(), ctx, args, &output).await?;
        out["width"] = json!(width);
        out["height"] = json!(height);
        Ok(out)
    }
}

#[async_trait]
impl StepHandler for ThumbnailHandler {
    async fn execute(&self, ctx: &mut StepContext, params: &Value) -> Result<Value, StepError> {
        let input = require_input(ctx)?;
        let output = ctx.thumb_path();
        let timestamp = param_str(params, "timestamp").unwrap_or("00:00:01");
        let args = thumbnail_args(&input, &output, timestamp);
        run_ffmpeg(self.media.as_ref(), ctx, args).await?;
        Ok(json!({ "path": path_arg(&output) }))
    }
}

#[async_trait]
impl StepHandler for PreviewHandler {
    async fn execute(&self, ctx: &mut StepContext, params: &Value) -> Result<Value, StepError> {
        let input = require_input(ctx)?;
        let output = ctx.preview_path();
        let seconds = param_f64(params, "duration").unwrap_or(5.0);
        let width = param_u32(params, "width").unwrap_or(480);
        let args = preview_args(&input, &output, seconds, width);
        run_ffmpeg(self.media.as_ref(), ctx, args).await?;
        Ok(json!({ "path": path_arg(&output) }))
    }
}

#[async_trait]
impl StepHandler for EffectsHandler {
    async fn execute(&self, ctx: &mut StepContext, params: &Value) -> Result<Value, StepError> {
        let effects = Effects::from_params(params);
        if effects.is_noop() {
            return Ok(skipped("no effects requested"));
        }
        let input = require_input(ctx)?;
        let output = ctx.path("effects.mp4");
        let args = effects_args(&input, &output, &effects);
        let mut out = transform(self.media.as_ref(), ctx, args, &output).await?;
        out["filters"] = json!(effects.filters());
        Ok(out)
    }
}

#[async_trait]
impl StepHandler for WatermarkHandler {
    async fn execute(&self, ctx: &mut StepContext, params: &Value) -> Result<Value, StepError> {
        let kind = param_str(params, "type").unwrap_or("text");
        let watermark = match kind {
            "image" => match param_str(params, "image_path") {
                Some(path) => Watermark::Image {
                    path: path.to_string(),
                },
                None => return Ok(skipped("no image_path")),
            },
            _ => match param_str(params, "text") {
                Some(text) => Watermark::Text {
                    text: text.to_string(),
                    font_size: param_u32(params, "font_size").unwrap_or(36),
                },
                None => return Ok(skipped("no watermark text")),
            },
        };

        let input = require_input(ctx)?;
        let output = ctx.path("watermarked.mp4");
        let position = param_str(params, "position").unwrap_or("bottom_right");
        let opacity = param_f64(params, "opacity").unwrap_or(0.7);
        let margin = param_u32(params, "margin").unwrap_or(20);
        let args = watermark_args(&input, &output, &watermark, position, opacity, margin);
        transform(self.media.as_ref(), ctx, args, &output).await
    }
}

#[async_trait]
impl StepHandler for PackageHandler {
    async fn execute(&self, ctx: &mut StepContext, params: &Value) -> Result<Value, StepError> {
        let input = require_input(ctx)?;
        let output = ctx.final_path();
        let settings = PackageSettings::resolve(params, &ctx.export_profile);
        let args = package_args(&input, &output, &settings);
        transform(self.media.as_ref(), ctx, args, &output).await
    }
}

#[async_trait]
impl StepHandler for SpeedHandler {
    async fn execute(&self, ctx: &mut StepContext, params: &Value) -> Result<Value, StepError> {
        let factor = param_f64(params, "factor")
            .or_else(|| param_f64(params, "speed"))
            .unwrap_or(1.0);
        if factor <= 0.0 {
            return Err(StepError::failed(format!("Invalid speed factor: {}", factor)));
        }
        if (factor - 1.0).abs() < f64::EPSILON {
            return Ok(skipped("speed factor 1.0"));
        }
        let input = require_input(ctx)?;
        let output = ctx.path("speed.mp4");
        let has_audio = ctx.probe.as_ref().map_or(true, |p| p.has_audio);
        let args = speed_args(&input, &output, factor, has_audio);
        let mut out = transform(self.media.as_ref(), ctx, args, &output).await?;
        out["factor"] = json!(factor);
        Ok(out)
    }
}

#[async_trait]
impl StepHandler for TrimHandler {
    async fn execute(&self, ctx: &mut StepContext, params: &Value) -> Result<Value, StepError> {
        let window = TrimWindow::from_params(params);
        if window.is_empty() {
            return Ok(skipped("no trim window"));
        }
        let input = require_input(ctx)?;
        let output = ctx.path("trimmed.mp4");
        let args = trim_args(&input, &output, &window);
        transform(self.media.as_ref(), ctx, args, &output).await
    }
}

#[async_trait]
impl StepHandler for CopyReadyHandler {
    async fn execute(&self, ctx: &mut StepContext, _params: &Value) -> Result<Value, StepError> {
        let input = require_input(ctx)?;
        let output = ctx.ready_path();
        if input == output {
            return Ok(json!({ "path": path_arg(&output), "skipped": true }));
        }
        let args = copy_args(&input, &output);
        transform(self.media.as_ref(), ctx, args, &output).await
    }
}
