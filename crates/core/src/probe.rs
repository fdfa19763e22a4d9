//! Media inspection with ffprobe
//!
//! Lists the audio and subtitle tracks of a source together with format-level
//! facts (duration, bitrate, size). Jobs select tracks by number: `audio_track`
//! counts audio streams only, `subtitle_stream` is the absolute stream index.
//! [`Track`] carries both.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Upper bound on one ffprobe run
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(windows)]
const FFPROBE_NAME: &str = "ffprobe.exe";
#[cfg(not(windows))]
const FFPROBE_NAME: &str = "ffprobe";

#[cfg(windows)]
const COMMON_LOCATIONS: &[&str] = &[
    "C:\\ffmpeg\\bin\\ffprobe.exe",
    "C:\\Program Files\\ffmpeg\\bin\\ffprobe.exe",
];
#[cfg(not(windows))]
const COMMON_LOCATIONS: &[&str] = &[
    "/usr/bin/ffprobe",
    "/usr/local/bin/ffprobe",
    "/opt/homebrew/bin/ffprobe",
];

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("FFprobe not found ({0})")]
    NotFound(String),

    #[error("Failed to start FFprobe: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("FFprobe did not answer within {} seconds", PROBE_TIMEOUT.as_secs())]
    Timeout,

    #[error("FFprobe failed on {}: {detail}", path.display())]
    Failed { path: PathBuf, detail: String },

    #[error("Unreadable FFprobe output: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Subtitle,
}

/// One selectable stream of a source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Track {
    pub kind: TrackKind,
    /// Absolute stream index in the container
    pub index: u32,
    /// Position among streams of the same kind, from 0
    pub position: u32,
    pub codec: String,
    pub codec_long_name: Option<String>,
    pub language: String,
    pub title: String,
    pub channels: Option<u32>,
    pub sample_rate: Option<u32>,
    pub bitrate_kbps: Option<u64>,
}

/// What ffprobe reports about a source
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MediaInfo {
    pub duration_secs: Option<f64>,
    pub bitrate_kbps: Option<u64>,
    pub size_bytes: Option<u64>,
    pub audio_tracks: Vec<Track>,
    pub subtitle_tracks: Vec<Track>,
}

impl MediaInfo {
    /// Parse `ffprobe -print_format json -show_format -show_streams` output
    pub fn from_json(json: &str) -> Result<Self, ProbeError> {
        let raw: RawOutput = serde_json::from_str(json)?;
        let format = raw.format.unwrap_or_default();

        let mut info = MediaInfo {
            duration_secs: format.duration.as_deref().and_then(|d| d.parse().ok()),
            bitrate_kbps: kbps(format.bit_rate.as_deref()),
            size_bytes: format.size.as_deref().and_then(|s| s.parse().ok()),
            ..MediaInfo::default()
        };

        for stream in raw.streams {
            let kind = match stream.codec_type.as_deref() {
                Some("audio") => TrackKind::Audio,
                Some("subtitle") => TrackKind::Subtitle,
                _ => continue,
            };
            let list = match kind {
                TrackKind::Audio => &mut info.audio_tracks,
                TrackKind::Subtitle => &mut info.subtitle_tracks,
            };
            let position = list.len() as u32;
            list.push(stream.into_track(kind, position));
        }
        Ok(info)
    }

    /// The stream a job converts when it picks no audio track
    pub fn primary_audio(&self) -> Option<&Track> {
        self.audio_tracks.first()
    }
}

/// bit/s string to kbit/s
fn kbps(value: Option<&str>) -> Option<u64> {
    value
        .and_then(|v| v.parse::<u64>().ok())
        .map(|bits| bits / 1000)
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    #[serde(default)]
    streams: Vec<RawStream>,
    format: Option<RawFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStream {
    index: u32,
    codec_type: Option<String>,
    codec_name: Option<String>,
    codec_long_name: Option<String>,
    channels: Option<u32>,
    sample_rate: Option<String>,
    bit_rate: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

impl RawStream {
    fn into_track(mut self, kind: TrackKind, position: u32) -> Track {
        let codec = self.codec_name.unwrap_or_else(|| "unknown".to_string());
        let language = self
            .tags
            .remove("language")
            .unwrap_or_else(|| "unknown".to_string());
        let title = match self.tags.remove("title").filter(|t| !t.is_empty()) {
            Some(title) => title,
            None => {
                let label = match kind {
                    TrackKind::Audio => "Audio",
                    TrackKind::Subtitle => "Subtitle",
                };
                format!("{} {} ({})", label, position + 1, codec)
            }
        };
        Track {
            kind,
            index: self.index,
            position,
            codec,
            codec_long_name: self.codec_long_name.filter(|n| !n.is_empty()),
            language,
            title,
            channels: self.channels.filter(|&c| c > 0),
            sample_rate: self.sample_rate.as_deref().and_then(|r| r.parse().ok()),
            bitrate_kbps: kbps(self.bit_rate.as_deref()),
        }
    }
}

/// Runs ffprobe on sources
#[derive(Debug, Clone)]
pub struct Prober {
    program: PathBuf,
}

impl Prober {
    /// Locate ffprobe: next to `ffmpeg`, then PATH, then common install locations.
    pub fn locate(ffmpeg: Option<&Path>) -> Result<Self, ProbeError> {
        if let Some(sibling) = ffmpeg.map(|p| p.with_file_name(FFPROBE_NAME)) {
            if sibling.is_file() {
                return Ok(Self::with_program(sibling));
            }
        }

        if let Ok(found) = which::which("ffprobe") {
            return Ok(Self::with_program(found));
        }

        COMMON_LOCATIONS
            .iter()
            .map(Path::new)
            .find(|p| p.is_file())
            .map(Self::with_program)
            .ok_or_else(|| {
                ProbeError::NotFound(format!("searched PATH and {}", COMMON_LOCATIONS.join(", ")))
            })
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Inspect `source`
    pub async fn inspect(&self, source: &Path) -> Result<MediaInfo, ProbeError> {
        debug!(program = %self.program.display(), source = %source.display(), "Probing");

        let run = Command::new(&self.program)
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(source)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(PROBE_TIMEOUT, run)
            .await
            .map_err(|_| ProbeError::Timeout)??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let detail = if stderr.is_empty() {
                match output.status.code() {
                    Some(code) => format!("exit code {}", code),
                    None => "terminated by a signal".to_string(),
                }
            } else {
                stderr
            };
            return Err(ProbeError::Failed {
                path: source.to_path_buf(),
                detail,
            });
        }

        MediaInfo::from_json(&String::from_utf8_lossy(&output.stdout))
    }
}
