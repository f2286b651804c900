//! Known pipeline tools.

use std::fmt;

/// A pipeline tool, identified by its stable tool id.
///
/// Unknown ids are kept verbatim in [`StepKind::Other`] so that presets
/// referencing tools this build has no handler for still round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StepKind {
    Download,
    Probe,
    Normalize,
    CropResize,
    Thumbnail,
    Preview,
    BuildCaptions,
    BurnCaptions,
    Effects,
    Watermark,
    Package,
    QualityCheck,
    Speed,
    Trim,
    CopyReady,
    Publish,
    Other(String),
}

impl StepKind {
    /// Every kind with a built-in handler.
    pub const BUILTIN: [StepKind; 16] = [
        StepKind::Download,
        StepKind::Probe,
        StepKind::Normalize,
        StepKind::CropResize,
        StepKind::Thumbnail,
        StepKind::Preview,
        StepKind::BuildCaptions,
        StepKind::BurnCaptions,
        StepKind::Effects,
        StepKind::Watermark,
        StepKind::Package,
        StepKind::QualityCheck,
        StepKind::Speed,
        StepKind::Trim,
        StepKind::CopyReady,
        StepKind::Publish,
    ];

    pub fn from_tool_id(tool_id: &str) -> Self {
        match tool_id {
            "T01_DOWNLOAD" => StepKind::Download,
            "T02_PROBE" => StepKind::Probe,
            "T03_NORMALIZE" => StepKind::Normalize,
            "T04_CROP_RESIZE" => StepKind::CropResize,
            "T05_THUMBNAIL" => StepKind::Thumbnail,
            "T05_PREVIEW" => StepKind::Preview,
            "T13_BUILD_CAPTIONS" => StepKind::BuildCaptions,
            "T14_BURN_CAPTIONS" => StepKind::BurnCaptions,
            "T15_EFFECTS" => StepKind::Effects,
            "T16_WATERMARK" => StepKind::Watermark,
            "T17_PACKAGE" => StepKind::Package,
            "T18_QC" => StepKind::QualityCheck,
            "T20_SPEED" => StepKind::Speed,
            "T21_TRIM" => StepKind::Trim,
            "T30_COPY_READY" => StepKind::CopyReady,
            "P01_PUBLISH" => StepKind::Publish,
            other => StepKind::Other(other.to_string()),
        }
    }

    pub fn tool_id(&self) -> &str {
        match self {
            StepKind::Download => "T01_DOWNLOAD",
            StepKind::Probe => "T02_PROBE",
            StepKind::Normalize => "T03_NORMALIZE",
            StepKind::CropResize => "T04_CROP_RESIZE",
            StepKind::Thumbnail => "T05_THUMBNAIL",
            StepKind::Preview => "T05_PREVIEW",
            StepKind::BuildCaptions => "T13_BUILD_CAPTIONS",
            StepKind::BurnCaptions => "T14_BURN_CAPTIONS",
            StepKind::Effects => "T15_EFFECTS",
            StepKind::Watermark => "T16_WATERMARK",
            StepKind::Package => "T17_PACKAGE",
            StepKind::QualityCheck => "T18_QC",
            StepKind::Speed => "T20_SPEED",
            StepKind::Trim => "T21_TRIM",
            StepKind::CopyReady => "T30_COPY_READY",
            StepKind::Publish => "P01_PUBLISH",
            StepKind::Other(id) => id,
        }
    }
}

impl From<&str> for StepKind {
    fn from(tool_id: &str) -> Self {
        StepKind::from_tool_id(tool_id)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tool_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_ids_round_trip() {
        for kind in StepKind::BUILTIN.iter() {
            assert_eq!(&StepKind::from_tool_id(kind.tool_id()), kind);
        }
    }

    #[test]
    fn test_unknown_tool_is_preserved() {
        let kind = StepKind::from("G03_TTS");
        assert_eq!(kind, StepKind::Other("G03_TTS".to_string()));
        assert_eq!(kind.to_string(), "G03_TTS");
    }
}
