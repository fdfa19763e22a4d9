//! FFmpeg command builder
//!
//! Turns a [`Job`] plus a resolved output path into the argument vector for one
//! ffmpeg invocation. The builder first fills a [`CommandPlan`] (inputs, stream
//! selection, video and audio sections, metadata, trailing options) and serializes
//! it once, so every flag has exactly one slot and input-bound options stay with
//! their input.

use crate::job::{EncodeMode, Job};
use crate::media::{self, MediaKind};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Places checked when ffmpeg is neither configured nor on PATH
#[cfg(windows)]
const COMMON_LOCATIONS: &[&str] = &[
    "C:\\ffmpeg\\bin\\ffmpeg.exe",
    "C:\\Program Files\\ffmpeg\\bin\\ffmpeg.exe",
];
#[cfg(not(windows))]
const COMMON_LOCATIONS: &[&str] = &[
    "/usr/bin/ffmpeg",
    "/usr/local/bin/ffmpeg",
    "/opt/homebrew/bin/ffmpeg",
];

/// Suffix appended to the destination to form the two-pass log prefix
const PASS_LOG_SUFFIX: &str = ".ffmpeg2pass";

/// Formats whose audio encoders take a target bitrate
const LOSSY_AUDIO_FORMATS: &[&str] = &[
    "mp3", "aac", "m4a", "opus", "ogg", "wma", "ac3", "eac3", "mp2",
];

/// Error type for command construction
#[derive(Debug, Error)]
pub enum EncodeError {
    /// No usable ffmpeg binary was found
    #[error("FFmpeg not found. Install FFmpeg and make sure it is on PATH ({0})")]
    EncoderNotFound(String),

    /// The job's custom arguments could not be split into words
    #[error("Invalid custom arguments: {0}")]
    InvalidCustomArgs(String),
}

/// One pass of a two-pass encode
#[derive(Debug, Clone, PartialEq)]
pub struct PassSpec {
    /// 1 or 2
    pub number: u8,
    /// Value for `-passlogfile`
    pub log_prefix: PathBuf,
}

impl PassSpec {
    /// Pass-log prefix derived from the real destination (never the null sink)
    pub fn log_prefix_for(destination: &Path) -> PathBuf {
        let mut prefix = destination.as_os_str().to_owned();
        prefix.push(PASS_LOG_SUFFIX);
        PathBuf::from(prefix)
    }

    pub fn new(number: u8, destination: &Path) -> Self {
        Self {
            number,
            log_prefix: Self::log_prefix_for(destination),
        }
    }
}

#[derive(Debug)]
struct Input {
    options: Vec<String>,
    path: String,
}

impl Input {
    fn new(path: &Path) -> Self {
        Self {
            options: Vec::new(),
            path: path.to_string_lossy().into_owned(),
        }
    }
}

#[derive(Debug, Default)]
struct VideoSection {
    codec: Option<String>,
    subtitle_codec: Option<&'static str>,
    preset: Option<String>,
    crf: Option<String>,
    bitrate: Option<String>,
    pass: Option<PassSpec>,
    filters: Vec<String>,
    fps: Option<String>,
    disposition: Option<&'static str>,
}

impl VideoSection {
    fn write(self, args: &mut Vec<String>) {
        push_opt(args, "-c:v", self.codec);
        push_opt(args, "-c:s", self.subtitle_codec.map(String::from));
        push_opt(args, "-preset", self.preset);
        push_opt(args, "-crf", self.crf);
        push_opt(args, "-b:v", self.bitrate);
        if let Some(pass) = self.pass {
            push(args, "-pass", pass.number.to_string());
            push(args, "-passlogfile", pass.log_prefix.to_string_lossy().into_owned());
        }
        if !self.filters.is_empty() {
            push(args, "-vf", self.filters.join(","));
        }
        push_opt(args, "-r", self.fps);
        push_opt(args, "-disposition:v", self.disposition.map(String::from));
    }
}

#[derive(Debug, Default)]
struct AudioSection {
    codec: Option<String>,
    bitrate: Option<String>,
    quality: Vec<String>,
    sample_rate: Option<String>,
    channels: Option<String>,
    trim: Vec<String>,
    filters: Vec<String>,
}

impl AudioSection {
    fn write(self, args: &mut Vec<String>) {
        push_opt(args, "-c:a", self.codec);
        push_opt(args, "-b:a", self.bitrate);
        args.extend(self.quality);
        push_opt(args, "-ar", self.sample_rate);
        push_opt(args, "-ac", self.channels);
        args.extend(self.trim);
        if !self.filters.is_empty() {
            push(args, "-af", self.filters.join(","));
        }
    }
}

/// Structured form of one ffmpeg invocation
#[derive(Debug)]
struct CommandPlan {
    inputs: Vec<Input>,
    duration: Option<String>,
    drop_video: bool,
    maps: Vec<String>,
    video: VideoSection,
    audio: AudioSection,
    metadata: Vec<(String, String)>,
    copy_metadata: bool,
    threads: Option<u32>,
    extra: Vec<String>,
    muxer: Option<String>,
    output: String,
}

impl CommandPlan {
    fn new(output: &Path) -> Self {
        Self {
            inputs: Vec::new(),
            duration: None,
            drop_video: false,
            maps: Vec::new(),
            video: VideoSection::default(),
            audio: AudioSection::default(),
            metadata: Vec::new(),
            copy_metadata: false,
            threads: None,
            extra: Vec::new(),
            muxer: None,
            output: output.to_string_lossy().into_owned(),
        }
    }

    fn into_args(self) -> Vec<String> {
        let mut args = Vec::new();

        for input in self.inputs {
            args.extend(input.options);
            push(&mut args, "-i", input.path);
        }

        push_opt(&mut args, "-t", self.duration);
        if self.drop_video {
            args.push("-vn".to_string());
        }
        for map in self.maps {
            push(&mut args, "-map", map);
        }

        self.video.write(&mut args);
        self.audio.write(&mut args);

        if self.copy_metadata {
            push(&mut args, "-map_metadata", "0".to_string());
        }
        for (key, value) in self.metadata {
            push(&mut args, "-metadata", format!("{}={}", key, value));
        }

        if let Some(threads) = self.threads {
            push(&mut args, "-threads", threads.to_string());
        }
        args.extend(self.extra);
        push_opt(&mut args, "-f", self.muxer);

        args.push("-y".to_string());
        args.push(self.output);
        args
    }
}

fn push(args: &mut Vec<String>, flag: &str, value: String) {
    args.push(flag.to_string());
    args.push(value);
}

fn push_opt(args: &mut Vec<String>, flag: &str, value: Option<String>) {
    if let Some(value) = value {
        push(args, flag, value);
    }
}

/// Seconds rendered without float noise ("12.5", "90")
fn seconds(value: f64) -> String {
    let rounded = (value * 1000.0).round() / 1000.0 + 0.0;
    format!("{}", rounded)
}

/// Bitrate with a `k` suffix unless the user already gave a unit
fn kbps(value: &str) -> String {
    let value = value.trim();
    if value.ends_with(|c: char| c.is_ascii_alphabetic()) {
        value.to_string()
    } else {
        format!("{}k", value)
    }
}

fn audio_codec(format: &str) -> &'static str {
    match format {
        "mp3" => "libmp3lame",
        "aac" | "m4a" => "aac",
        "opus" => "libopus",
        "ogg" => "libvorbis",
        "flac" => "flac",
        "wav" => "pcm_s16le",
        "aiff" | "caf" | "au" => "pcm_s16be",
        "wma" => "wmav2",
        "ac3" => "ac3",
        "eac3" => "eac3",
        "ape" => "ape",
        "tta" => "tta",
        "wv" => "wavpack",
        "mp2" => "mp2",
        "amr" => "amr_nb",
        _ => "copy",
    }
}

fn video_codec(format: &str) -> &'static str {
    match format {
        "webm" => "libvpx-vp9",
        "wmv" => "wmv2",
        "ogv" => "libtheora",
        _ => "libx264",
    }
}

fn video_audio_codec(format: &str) -> &'static str {
    match format {
        "webm" => "libopus",
        "wmv" => "wmav2",
        "ogv" => "libvorbis",
        _ => "aac",
    }
}

/// CRF for size reduction, by target reduction factor
fn size_reduction_crf(factor: Option<f64>) -> &'static str {
    match factor {
        Some(f) if f >= 8.0 => "30",
        Some(f) if f >= 5.0 => "28",
        Some(_) => "26",
        None => "28",
    }
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| *v > 0.0)
}

fn has_video_trim(job: &Job) -> bool {
    job.video_trim_start.is_some() || job.video_trim_end.is_some()
}

/// Clip length when the trims pin it down
fn clip_length(job: &Job) -> Option<f64> {
    let length = if has_video_trim(job) {
        job.video_trim_end
            .map(|end| end - job.video_trim_start.unwrap_or(0.0))
    } else {
        job.trim_end.map(|end| end - job.trim_start.unwrap_or(0.0))
    };
    positive(length)
}

/// Builds ffmpeg argument vectors for jobs
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: PathBuf,
}

impl CommandBuilder {
    /// Locate ffmpeg: configured path, then PATH, then common install locations.
    pub fn locate(configured: Option<&Path>) -> Result<Self, EncodeError> {
        if let Some(path) = configured {
            if path.is_file() {
                return Ok(Self::with_program(path));
            }
            warn!(
                path = %path.display(),
                "Configured ffmpeg path does not exist, searching PATH"
            );
        }

        if let Ok(found) = which::which("ffmpeg") {
            return Ok(Self::with_program(found));
        }

        COMMON_LOCATIONS
            .iter()
            .map(Path::new)
            .find(|p| p.is_file())
            .map(Self::with_program)
            .ok_or_else(|| {
                EncodeError::EncoderNotFound(format!(
                    "searched PATH and {}",
                    COMMON_LOCATIONS.join(", ")
                ))
            })
    }

    /// Use a known program path without probing it
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Path of the ffmpeg executable
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments for a single-pass encode of `job` into `output`.
    pub fn build(&self, job: &Job, output: &Path) -> Result<Vec<String>, EncodeError> {
        self.build_with(job, output, None)
    }

    /// Arguments for one pass of a two-pass encode.
    ///
    /// Pass 1 writes to the null sink; pass 2 writes to `destination`. Both share
    /// the pass-log prefix derived from `destination`.
    pub fn build_pass(
        &self,
        job: &Job,
        destination: &Path,
        number: u8,
    ) -> Result<Vec<String>, EncodeError> {
        let pass = PassSpec::new(number, destination);
        if number == 1 {
            self.build_with(job, Path::new(media::NULL_SINK), Some(&pass))
        } else {
            self.build_with(job, destination, Some(&pass))
        }
    }

    fn build_with(
        &self,
        job: &Job,
        output: &Path,
        pass: Option<&PassSpec>,
    ) -> Result<Vec<String>, EncodeError> {
        let format = job.format.to_lowercase();
        let source_kind = media::classify(&job.source);
        let output_kind = media::classify_output(&job.source, output);

        let mut plan = CommandPlan::new(output);

        // Fast seek: the start trim binds to the primary input
        let mut primary = Input::new(&job.source);
        if let Some(start) = job.video_trim_start {
            push(&mut primary.options, "-ss", seconds(start));
        }
        plan.inputs.push(primary);
        plan.duration = match (job.video_trim_start, job.video_trim_end) {
            (Some(start), Some(end)) => Some(seconds(end - start)),
            (None, Some(end)) => Some(seconds(end)),
            _ => None,
        };

        let cover = if output_kind == MediaKind::Audio && job.prefer_external_cover {
            media::find_external_cover(&job.source)
        } else {
            None
        };

        if job.extract_audio_only
            || (source_kind == MediaKind::Video && output_kind == MediaKind::Audio)
        {
            plan.drop_video = cover.is_none();
            apply_audio(job, &format, &mut plan);
        } else if output_kind == MediaKind::Video {
            apply_video(job, &format, pass, &mut plan);
        } else {
            apply_audio(job, &format, &mut plan);
        }

        if !job.strip_metadata {
            plan.copy_metadata = job.copy_metadata;
            plan.metadata = job
                .tags
                .entries()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
        }

        if let Some(cover) = cover {
            plan.inputs.push(Input::new(&cover));
            plan.maps = vec!["0:a".to_string(), "1:v".to_string()];
            plan.video.codec = Some("copy".to_string());
            plan.video.disposition = Some("attached_pic");
        }

        if job.threads > 1 {
            plan.threads = Some(job.threads);
        }

        if let Some(custom) = job.custom_args.as_deref().filter(|s| !s.trim().is_empty()) {
            plan.extra = shlex::split(custom)
                .ok_or_else(|| EncodeError::InvalidCustomArgs(custom.to_string()))?;
        }

        if media::is_null_sink(output) {
            plan.muxer = Some(media::null_sink_muxer(&format));
        }

        let args = plan.into_args();
        debug!(source = %job.source.display(), ?args, "Built ffmpeg arguments");
        Ok(args)
    }
}

/// Audio-only output: extraction from video or audio-to-audio conversion
fn apply_audio(job: &Job, format: &str, plan: &mut CommandPlan) {
    let audio = &mut plan.audio;
    audio.codec = Some(audio_codec(format).to_string());

    match job.mode {
        EncodeMode::Cbr => {
            if LOSSY_AUDIO_FORMATS.contains(&format) {
                audio.bitrate = job.bitrate.as_deref().map(kbps);
            }
        }
        EncodeMode::Vbr => {
            if let Some(q) = job.vbr_quality.as_deref() {
                audio.quality = match format {
                    "mp3" | "aac" | "m4a" | "ogg" => vec!["-q:a".into(), q.into()],
                    "opus" => vec![
                        "-b:a".into(),
                        "0".into(),
                        "-vbr".into(),
                        "on".into(),
                        "-compression_level".into(),
                        q.into(),
                    ],
                    _ => Vec::new(),
                };
            }
        }
        EncodeMode::Lossless => {
            if format == "flac" {
                audio.quality = vec!["-compression_level".into(), "12".into()];
            }
        }
    }

    audio.sample_rate = job.sample_rate.clone();
    audio.channels = job.channels.clone();

    if !has_video_trim(job) && (job.trim_start.is_some() || job.trim_end.is_some()) {
        let start = job.trim_start.unwrap_or(0.0);
        push(&mut audio.trim, "-ss", seconds(start));
        if let Some(end) = job.trim_end {
            push(&mut audio.trim, "-t", seconds(end - start));
        }
    }

    if let Some(d) = positive(job.fade_in) {
        audio.filters.push(format!("afade=t=in:ss=0:d={}", seconds(d)));
    }
    if let Some(d) = positive(job.fade_out) {
        match clip_length(job) {
            Some(length) => audio.filters.push(format!(
                "afade=t=out:st={}:d={}",
                seconds((length - d).max(0.0)),
                seconds(d)
            )),
            None => audio.filters.push(format!(
                "areverse,afade=t=in:d={},areverse",
                seconds(d)
            )),
        }
    }
    if job.normalize {
        audio
            .filters
            .push(format!("loudnorm=I={:.1}:TP=-1.5:LRA=11", job.target_lufs));
    }
}

/// Video output
fn apply_video(job: &Job, format: &str, pass: Option<&PassSpec>, plan: &mut CommandPlan) {
    let codec = if job.reduce_size && job.use_hevc {
        if matches!(format, "mp4" | "mkv" | "m4v") {
            "libx265".to_string()
        } else {
            "libx264".to_string()
        }
    } else if let Some(explicit) = job.video_codec.as_deref().filter(|c| !c.is_empty()) {
        explicit.to_string()
    } else {
        video_codec(format).to_string()
    };
    let is_x26x = codec == "libx264" || codec == "libx265";
    let is_vp9 = codec == "libvpx-vp9";

    plan.maps.push("0:v:0".to_string());
    plan.maps.push(format!("0:a:{}", job.audio_track.unwrap_or(0)));
    if let Some(index) = job.subtitle_stream {
        plan.maps.push(format!("0:{}", index));
        plan.video.subtitle_codec = Some(if format == "mkv" { "copy" } else { "mov_text" });
    }

    let video = &mut plan.video;
    if job.reduce_size {
        let crf = size_reduction_crf(job.size_reduction_factor);
        if is_x26x {
            video.preset = Some("slow".to_string());
            if pass.is_none() {
                video.crf = Some(crf.to_string());
            }
        } else if is_vp9 {
            video.crf = Some(crf.to_string());
            video.bitrate = Some("0".to_string());
        }
    } else {
        if let Some(bitrate) = job.video_bitrate.as_deref() {
            video.bitrate = Some(kbps(bitrate));
        } else if let Some(q) = job.video_quality.as_deref() {
            if is_x26x {
                video.crf = Some(q.to_string());
            } else if is_vp9 {
                video.crf = Some(q.to_string());
                video.bitrate = Some("0".to_string());
            }
        }

        if let Some(preset) = job.quality_preset {
            if is_x26x {
                video.crf = Some(preset.crf().to_string());
                video.preset = Some(preset.speed().to_string());
            } else if is_vp9 {
                video.crf = Some(preset.crf().to_string());
                video.bitrate = Some("0".to_string());
            }
        }
    }
    video.pass = pass.cloned();

    if let Some(crop) = job.crop {
        video.filters.push(crop.filter());
    }
    if let Some(resolution) = job.resolution.as_deref().filter(|r| !r.is_empty()) {
        video.filters.push(format!("scale={}", resolution.replace('x', ":")));
    }
    video.fps = job.fps.clone();

    if is_x26x && video.preset.is_none() {
        video.preset = Some("medium".to_string());
    }
    video.codec = Some(codec);

    let audio = &mut plan.audio;
    let acodec = video_audio_codec(format);
    audio.codec = Some(acodec.to_string());
    audio.bitrate = match job.bitrate.as_deref() {
        Some(bitrate) => Some(kbps(bitrate)),
        None if acodec == "aac" => Some("192k".to_string()),
        None => None,
    };
    audio.sample_rate = job.sample_rate.clone();
    audio.channels = job.channels.clone();
}
