//! Conversion job model
//!
//! A [`Job`] is the complete, self-contained description of one conversion. It is
//! fully specified before submission; the orchestrator only fills in `threads` at
//! admission time.

use crate::media;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Audio encoding mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncodeMode {
    /// Constant bitrate from `bitrate`
    #[default]
    #[serde(rename = "CBR", alias = "cbr")]
    Cbr,
    /// Codec-specific quality scale from `vbr_quality`
    #[serde(rename = "VBR", alias = "vbr")]
    Vbr,
    #[serde(rename = "Lossless", alias = "lossless")]
    Lossless,
}

impl fmt::Display for EncodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeMode::Cbr => write!(f, "CBR"),
            EncodeMode::Vbr => write!(f, "VBR"),
            EncodeMode::Lossless => write!(f, "Lossless"),
        }
    }
}

impl FromStr for EncodeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cbr" => Ok(EncodeMode::Cbr),
            "vbr" => Ok(EncodeMode::Vbr),
            "lossless" => Ok(EncodeMode::Lossless),
            other => Err(format!("unknown encode mode '{}'", other)),
        }
    }
}

/// Named video quality preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    Medium,
    High,
    Ultra,
}

impl QualityPreset {
    /// CRF value for this preset
    pub fn crf(self) -> &'static str {
        match self {
            QualityPreset::Low => "32",
            QualityPreset::Medium => "28",
            QualityPreset::High => "23",
            QualityPreset::Ultra => "18",
        }
    }

    /// x264/x265 speed preset for this preset
    pub fn speed(self) -> &'static str {
        match self {
            QualityPreset::Low => "fast",
            QualityPreset::Medium => "medium",
            QualityPreset::High => "slow",
            QualityPreset::Ultra => "veryslow",
        }
    }
}

impl FromStr for QualityPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(QualityPreset::Low),
            "medium" => Ok(QualityPreset::Medium),
            "high" => Ok(QualityPreset::High),
            "ultra" => Ok(QualityPreset::Ultra),
            other => Err(format!("unknown quality preset '{}'", other)),
        }
    }
}

/// Crop rectangle. Offsets are only applied when both are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crop {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub x: Option<u32>,
    #[serde(default)]
    pub y: Option<u32>,
}

impl Crop {
    /// ffmpeg `crop` filter expression
    pub fn filter(&self) -> String {
        match (self.x, self.y) {
            (Some(x), Some(y)) => format!("crop={}:{}:{}:{}", self.width, self.height, x, y),
            _ => format!("crop={}:{}", self.width, self.height),
        }
    }
}

/// Metadata tags written to the output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tags {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub year: Option<String>,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub track: Option<String>,
}

impl Tags {
    /// Non-empty tags as `(ffmpeg key, value)` pairs in a fixed order.
    ///
    /// The year is written under ffmpeg's `date` key.
    pub fn entries(&self) -> Vec<(&'static str, &str)> {
        [
            ("title", &self.title),
            ("artist", &self.artist),
            ("album", &self.album),
            ("date", &self.year),
            ("genre", &self.genre),
            ("track", &self.track),
        ]
        .into_iter()
        .filter_map(|(key, value)| {
            value
                .as_deref()
                .filter(|v| !v.trim().is_empty())
                .map(|v| (key, v))
        })
        .collect()
    }
}

fn default_true() -> bool {
    true
}

fn default_target_lufs() -> f64 {
    -14.0
}

fn default_threads() -> u32 {
    1
}

/// A conversion job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Source media file
    pub source: PathBuf,
    /// Destination directory (`~` is expanded)
    pub output_dir: PathBuf,
    /// Target format name, e.g. `mp3` or `mkv`
    pub format: String,

    #[serde(default)]
    pub mode: EncodeMode,
    /// Audio bitrate in kbit/s ("320" or "320k")
    #[serde(default)]
    pub bitrate: Option<String>,
    #[serde(default)]
    pub vbr_quality: Option<String>,
    #[serde(default)]
    pub sample_rate: Option<String>,
    #[serde(default)]
    pub channels: Option<String>,
    /// Extra encoder arguments, split with shell-word rules
    #[serde(default)]
    pub custom_args: Option<String>,

    #[serde(default)]
    pub tags: Tags,
    #[serde(default = "default_true")]
    pub copy_metadata: bool,
    #[serde(default)]
    pub strip_metadata: bool,
    #[serde(default)]
    pub prefer_external_cover: bool,

    #[serde(default)]
    pub normalize: bool,
    #[serde(default = "default_target_lufs")]
    pub target_lufs: f64,

    #[serde(default)]
    pub video_codec: Option<String>,
    /// Video bitrate in kbit/s
    #[serde(default)]
    pub video_bitrate: Option<String>,
    /// Explicit CRF
    #[serde(default)]
    pub video_quality: Option<String>,
    /// `WIDTHxHEIGHT`
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub fps: Option<String>,
    #[serde(default)]
    pub quality_preset: Option<QualityPreset>,
    #[serde(default)]
    pub extract_audio_only: bool,

    #[serde(default)]
    pub reduce_size: bool,
    #[serde(default)]
    pub size_reduction_factor: Option<f64>,
    #[serde(default)]
    pub use_hevc: bool,
    #[serde(default)]
    pub two_pass: bool,

    #[serde(default)]
    pub trim_start: Option<f64>,
    #[serde(default)]
    pub trim_end: Option<f64>,
    #[serde(default)]
    pub fade_in: Option<f64>,
    #[serde(default)]
    pub fade_out: Option<f64>,
    #[serde(default)]
    pub video_trim_start: Option<f64>,
    #[serde(default)]
    pub video_trim_end: Option<f64>,
    #[serde(default)]
    pub crop: Option<Crop>,

    /// Absolute stream index of the subtitle to keep
    #[serde(default)]
    pub subtitle_stream: Option<u32>,
    /// Index among audio streams
    #[serde(default)]
    pub audio_track: Option<u32>,

    #[serde(default)]
    pub delete_original: bool,

    /// Encoder threads; overwritten at admission from the per-format table
    #[serde(default = "default_threads")]
    pub threads: u32,
}

impl Job {
    /// Create a job with every optional setting at its default
    pub fn new(source: impl Into<PathBuf>, output_dir: impl Into<PathBuf>, format: &str) -> Self {
        Self {
            source: source.into(),
            output_dir: output_dir.into(),
            format: format.to_string(),
            mode: EncodeMode::default(),
            bitrate: None,
            vbr_quality: None,
            sample_rate: None,
            channels: None,
            custom_args: None,
            tags: Tags::default(),
            copy_metadata: true,
            strip_metadata: false,
            prefer_external_cover: false,
            normalize: false,
            target_lufs: default_target_lufs(),
            video_codec: None,
            video_bitrate: None,
            video_quality: None,
            resolution: None,
            fps: None,
            quality_preset: None,
            extract_audio_only: false,
            reduce_size: false,
            size_reduction_factor: None,
            use_hevc: false,
            two_pass: false,
            trim_start: None,
            trim_end: None,
            fade_in: None,
            fade_out: None,
            video_trim_start: None,
            video_trim_end: None,
            crop: None,
            subtitle_stream: None,
            audio_track: None,
            delete_original: false,
            threads: default_threads(),
        }
    }

    /// Where this job writes its output
    pub fn destination(&self) -> PathBuf {
        media::output_path(&self.output_dir, &self.source, &self.format)
    }

    /// Whether this job runs as a two-pass size-reduction encode
    pub fn is_two_pass(&self) -> bool {
        self.two_pass
            && self.reduce_size
            && !self.extract_audio_only
            && media::is_video_format(&self.format)
    }
}
