//! Media classification and naming tables
//!
//! Everything here is decided by file extension or target format name: whether a
//! path is audio or video, what extension a target format gets, which muxer ffmpeg
//! needs when writing to the null sink, and where to look for external cover art.

use std::path::{Path, PathBuf};

/// Video file extensions (lowercase, with leading dot).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    ".mp4", ".mkv", ".avi", ".mov", ".wmv", ".flv", ".webm", ".m4v", ".3gp", ".3g2", ".asf",
    ".rm", ".rmvb", ".vob", ".ogv", ".mts", ".m2ts", ".ts", ".divx", ".f4v", ".mxf", ".mpg",
    ".mpeg", ".m2v",
];

/// Audio file extensions (lowercase, with leading dot).
pub const AUDIO_EXTENSIONS: &[&str] = &[
    ".mp3", ".aac", ".m4a", ".flac", ".wav", ".ogg", ".opus", ".wma", ".ac3", ".eac3", ".ape",
    ".tta", ".wv", ".mp2", ".amr", ".caf", ".au", ".mka", ".aiff",
];

/// Cover image names probed beside an audio source, in priority order.
pub const COVER_NAMES: &[&str] = &[
    "cover.jpg",
    "folder.jpg",
    "cover.png",
    "folder.png",
    "cover.jpeg",
    "folder.jpeg",
];

/// Platform null sink used as the first-pass output of two-pass encodes.
#[cfg(windows)]
pub const NULL_SINK: &str = "NUL";
#[cfg(not(windows))]
pub const NULL_SINK: &str = "/dev/null";

/// Coarse media classification used by the command builder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

fn dotted_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
}

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    dotted_extension(path)
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Checks if a file has an audio extension (case-insensitive).
pub fn is_audio_file(path: &Path) -> bool {
    dotted_extension(path)
        .map(|ext| AUDIO_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Checks if a file is something the converter can take as input.
pub fn is_media_file(path: &Path) -> bool {
    is_video_file(path) || is_audio_file(path)
}

/// Returns true when `path` is the platform null sink.
pub fn is_null_sink(path: &Path) -> bool {
    path == Path::new(NULL_SINK)
}

/// Classify a path by extension. Anything that is not a known video
/// extension is treated as audio.
pub fn classify(path: &Path) -> MediaKind {
    if is_video_file(path) {
        MediaKind::Video
    } else {
        MediaKind::Audio
    }
}

/// Classify an output path. The null sink has no extension of its own, so it
/// inherits the classification of the source.
pub fn classify_output(source: &Path, output: &Path) -> MediaKind {
    if is_null_sink(output) {
        classify(source)
    } else {
        classify(output)
    }
}

/// Returns true when a target format name produces a video container.
pub fn is_video_format(format: &str) -> bool {
    let ext = output_extension(format);
    VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str())
}

/// Output file extension for a target format; unknown formats map to `.` + format.
pub fn output_extension(format: &str) -> String {
    let known = match format.to_lowercase().as_str() {
        "mp3" => ".mp3",
        "aac" => ".aac",
        "m4a" => ".m4a",
        "opus" => ".opus",
        "ogg" => ".ogg",
        "flac" => ".flac",
        "wav" => ".wav",
        "aiff" => ".aiff",
        "wma" => ".wma",
        "ac3" => ".ac3",
        "eac3" => ".eac3",
        "ape" => ".ape",
        "tta" => ".tta",
        "wv" => ".wv",
        "mp2" => ".mp2",
        "amr" => ".amr",
        "caf" => ".caf",
        "au" => ".au",
        "mka" => ".mka",
        "mp4" => ".mp4",
        "mkv" => ".mkv",
        "avi" => ".avi",
        "mov" => ".mov",
        "wmv" => ".wmv",
        "flv" => ".flv",
        "webm" => ".webm",
        "m4v" => ".m4v",
        "3gp" => ".3gp",
        "ogv" => ".ogv",
        _ => return format!(".{}", format),
    };
    known.to_string()
}

/// Muxer name passed with `-f` when the output is the null sink.
pub fn null_sink_muxer(format: &str) -> String {
    let lower = format.to_lowercase();
    let muxer = match lower.as_str() {
        "mp4" | "m4v" | "m4a" => "mp4",
        "mkv" => "matroska",
        "webm" => "webm",
        "avi" => "avi",
        "mov" => "mov",
        "wmv" => "asf",
        "flv" => "flv",
        "3gp" => "3gp",
        "ogv" | "ogg" | "opus" => "ogg",
        "mp3" => "mp3",
        "aac" => "adts",
        "flac" => "flac",
        "wav" => "wav",
        _ => return lower,
    };
    muxer.to_string()
}

/// Expand a leading `~` in a user-supplied directory.
pub fn expand_dir(dir: &Path) -> PathBuf {
    let raw = dir.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).into_owned())
}

/// Destination path for a conversion: `dir/stem(source) + extension(format)`.
///
/// Does not touch the filesystem; the worker creates the directory.
pub fn output_path(output_dir: &Path, source: &Path, format: &str) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    expand_dir(output_dir).join(format!("{}{}", stem, output_extension(format)))
}

/// Look for an external cover image next to `source`.
pub fn find_external_cover(source: &Path) -> Option<PathBuf> {
    let dir = source.parent()?;
    COVER_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
}
