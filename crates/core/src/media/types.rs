//! Probe results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::MediaError;

/// What ffprobe reports about a video file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeInfo {
    /// Duration in seconds (video stream first, then container).
    pub duration_secs: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f32>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub audio_sample_rate: Option<String>,
    /// Container bitrate in bits per second.
    pub bit_rate: Option<u64>,
    pub size_bytes: Option<u64>,
    pub has_video: bool,
    pub has_audio: bool,
    /// The untouched ffprobe document, persisted as `probe.json`.
    #[serde(default)]
    pub raw: Value,
}

impl ProbeInfo {
    /// Parse `ffprobe -print_format json -show_streams -show_format` output.
    pub fn parse(output: &str) -> Result<Self, MediaError> {
        #[derive(Deserialize)]
        struct ProbeOutput {
            #[serde(default)]
            format: ProbeFormat,
            #[serde(default)]
            streams: Vec<ProbeStream>,
        }

        #[derive(Default, Deserialize)]
        struct ProbeFormat {
            duration: Option<String>,
            size: Option<String>,
            bit_rate: Option<String>,
        }

        #[derive(Deserialize)]
        struct ProbeStream {
            codec_type: String,
            codec_name: Option<String>,
            sample_rate: Option<String>,
            width: Option<u32>,
            height: Option<u32>,
            duration: Option<String>,
            r_frame_rate: Option<String>,
        }

        let raw: Value = serde_json::from_str(output).map_err(|e| MediaError::ParseError {
            reason: format!("Failed to parse ffprobe output: {}", e),
        })?;
        let probe: ProbeOutput =
            serde_json::from_value(raw.clone()).map_err(|e| MediaError::ParseError {
                reason: format!("Unexpected ffprobe document: {}", e),
            })?;

        let video = probe.streams.iter().find(|s| s.codec_type == "video");
        let audio = probe.streams.iter().find(|s| s.codec_type == "audio");

        let duration_secs = video
            .and_then(|s| s.duration.as_deref())
            .or(probe.format.duration.as_deref())
            .and_then(|d| d.parse::<f64>().ok());

        Ok(Self {
            duration_secs,
            width: video.and_then(|s| s.width),
            height: video.and_then(|s| s.height),
            fps: video
                .and_then(|s| s.r_frame_rate.as_deref())
                .and_then(parse_frame_rate),
            video_codec: video.and_then(|s| s.codec_name.clone()),
            audio_codec: audio.and_then(|s| s.codec_name.clone()),
            audio_sample_rate: audio.and_then(|s| s.sample_rate.clone()),
            bit_rate: probe.format.bit_rate.and_then(|b| b.parse().ok()),
            size_bytes: probe.format.size.and_then(|s| s.parse().ok()),
            has_video: video.is_some(),
            has_audio: audio.is_some(),
            raw,
        })
    }
}

/// Parse frame rates like "30000/1001" or "25".
fn parse_frame_rate(rate: &str) -> Option<f32> {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num = num.parse::<f32>().ok()?;
            let den = den.parse::<f32>().ok()?;
            (den > 0.0).then(|| num / den)
        }
        None => rate.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vertical_clip() {
        let json = r#"{
            "format": {"duration": "31.2", "size": "7340032", "bit_rate": "1882000"},
            "streams": [
                {"codec_type": "video", "codec_name": "h264", "width": 1080, "height": 1920,
                 "duration": "31.166", "r_frame_rate": "30000/1001"},
                {"codec_type": "audio", "codec_name": "aac", "sample_rate": "44100"}
            ]
        }"#;

        let info = ProbeInfo::parse(json).unwrap();
        assert!(info.has_video && info.has_audio);
        assert_eq!(info.width, Some(1080));
        assert_eq!(info.height, Some(1920));
        assert!((info.duration_secs.unwrap() - 31.166).abs() < 1e-6);
        assert!((info.fps.unwrap() - 29.97).abs() < 0.01);
        assert_eq!(info.bit_rate, Some(1_882_000));
        assert_eq!(info.size_bytes, Some(7_340_032));
        assert_eq!(info.raw["format"]["size"], "7340032");
    }

    #[test]
    fn test_parse_audio_only_uses_container_duration() {
        let json = r#"{
            "format": {"duration": "12.5"},
            "streams": [{"codec_type": "audio", "codec_name": "mp3"}]
        }"#;

        let info = ProbeInfo::parse(json).unwrap();
        assert!(!info.has_video);
        assert_eq!(info.duration_secs, Some(12.5));
        assert_eq!(info.width, None);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            ProbeInfo::parse("not json"),
            Err(MediaError::ParseError { .. })
        ));
    }
}
