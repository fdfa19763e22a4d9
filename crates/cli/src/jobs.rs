//! Building jobs from command-line flags and job files

use anyhow::{Context, Result};
use handforge::{EncodeMode, Job};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Job file layout: a list of `[[job]]` tables (TOML) or a `"job"` array (JSON)
#[derive(Debug, Deserialize)]
struct JobFile {
    #[serde(default, rename = "job")]
    jobs: Vec<Job>,
}

/// Load jobs from a `.toml` or `.json` file
pub fn load_job_file(path: &Path) -> Result<Vec<Job>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file {}", path.display()))?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let file: JobFile = if is_json {
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON job file {}", path.display()))?
    } else {
        toml::from_str(&content)
            .with_context(|| format!("Invalid TOML job file {}", path.display()))?
    };
    Ok(file.jobs)
}

/// Settings applied to every source given on the command line
#[derive(Debug, Clone)]
pub struct JobTemplate {
    pub format: String,
    /// `None` writes next to each source
    pub output_dir: Option<PathBuf>,
    pub mode: EncodeMode,
    pub bitrate: Option<String>,
    pub vbr_quality: Option<String>,
    pub two_pass: bool,
    pub reduce_size: bool,
    pub use_hevc: bool,
    pub extract_audio_only: bool,
    pub normalize: bool,
    pub delete_original: bool,
}

impl JobTemplate {
    pub fn job_for(&self, source: PathBuf) -> Job {
        let output_dir = self.output_dir.clone().unwrap_or_else(|| {
            source
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        });

        let mut job = Job::new(source, output_dir, &self.format);
        job.mode = self.mode;
        job.bitrate = self.bitrate.clone();
        job.vbr_quality = self.vbr_quality.clone();
        // Two-pass only makes sense as part of a size reduction
        job.reduce_size = self.reduce_size || self.two_pass;
        job.two_pass = self.two_pass;
        job.use_hevc = self.use_hevc;
        job.extract_audio_only = self.extract_audio_only;
        job.normalize = self.normalize;
        job.delete_original = self.delete_original;
        job
    }
}
