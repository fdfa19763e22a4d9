//! Startup checks module
//!
//! Preflight before any job is admitted:
//! - Locate the ffmpeg executable (configured path, PATH, common locations)
//! - Verify that `ffmpeg -version` runs and report the version it prints

use crate::encode::{CommandBuilder, EncodeError};
use handforge_config::Config;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Oldest major release whose filters and options the command builder relies on
const MIN_RECOMMENDED_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    EncoderNotFound(#[from] EncodeError),

    #[error("FFmpeg is not usable: {0}")]
    FfmpegUnusable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the version probe found
#[derive(Debug, Clone, PartialEq)]
pub struct FfmpegInfo {
    pub program: PathBuf,
    /// Version token as printed, e.g. `6.1.1` or `n7.0-12-gabc`
    pub version: Option<String>,
    /// Major release, when the version is a release number
    pub major: Option<u32>,
}

/// Extract the version token from `ffmpeg -version` output
///
/// Returns the word after "ffmpeg version" on the first line that has it.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<String> {
    let line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let start = line.to_lowercase().find("ffmpeg version")? + "ffmpeg version".len();
    line.get(start..)?
        .split_whitespace()
        .next()
        .map(str::to_string)
}

/// Parse the major release from a version token
///
/// Handles plain (`6.1.1`) and n-prefixed (`n7.0-...`) versions. Git snapshot
/// builds (`N-113245-g...`) carry no release number and yield `None`.
pub fn parse_major_version(version: &str) -> Option<u32> {
    let trimmed = version.strip_prefix('n').unwrap_or(version);
    trimmed
        .split(|c| c == '.' || c == '-')
        .next()
        .filter(|s| !s.is_empty())?
        .parse()
        .ok()
}

/// Run `program -version` and parse what it prints
pub fn check_ffmpeg(program: &Path) -> Result<FfmpegInfo, StartupError> {
    let output = Command::new(program).arg("-version").output().map_err(|e| {
        StartupError::FfmpegUnusable(format!(
            "failed to run {} -version: {}",
            program.display(),
            e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegUnusable(format!(
            "{} -version exited with {}",
            program.display(),
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = parse_ffmpeg_version(&stdout);
    let major = version.as_deref().and_then(parse_major_version);

    Ok(FfmpegInfo {
        program: program.to_path_buf(),
        version,
        major,
    })
}

/// Run all startup checks in order
///
/// 1. Locate ffmpeg
/// 2. Probe its version
///
/// Returns the command builder bound to the located executable.
pub fn run_startup_checks(cfg: &Config) -> Result<CommandBuilder, StartupError> {
    let builder = CommandBuilder::locate(cfg.encoder.ffmpeg_path.as_deref())?;
    let info = check_ffmpeg(builder.program())?;

    match (info.version.as_deref(), info.major) {
        (Some(version), Some(major)) if major < MIN_RECOMMENDED_MAJOR => {
            warn!(version, "FFmpeg is older than {}.0, some options may be rejected", MIN_RECOMMENDED_MAJOR);
        }
        (Some(version), _) => {
            info!(program = %info.program.display(), version, "Found FFmpeg");
        }
        (None, _) => {
            warn!(program = %info.program.display(), "Could not parse FFmpeg version");
        }
    }

    Ok(builder)
}
