//! CLI entry point for HandForge
//!
//! Collects sources from arguments and job files, runs them through the
//! orchestrator and reports each result as it completes.

mod jobs;

use anyhow::{bail, Context, Result};
use clap::Parser;
use handforge::config::{AutoRetryConfig, DuplicatePolicy};
use handforge::{
    collect_sources, new_shared_metrics, run_metrics_server, run_startup_checks, track,
    CommandBuilder, CompletionStatus, Config, EncodeMode, JobEvent, Orchestrator,
    MediaInfo, OrchestratorSettings, Prober, WorkerId,
};
use jobs::{load_job_file, JobTemplate};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, trace, warn};

/// HandForge - batch audio and video conversion with ffmpeg
#[derive(Parser, Debug)]
#[command(name = "handforge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Files or directories to convert
    inputs: Vec<PathBuf>,

    /// Path to the configuration file
    #[arg(short, long, default_value = "handforge.toml")]
    config: PathBuf,

    /// TOML or JSON file with `job` entries, converted in addition to INPUTS
    #[arg(long)]
    jobs: Option<PathBuf>,

    /// Target format for INPUTS (mp3, flac, opus, mkv, ...)
    #[arg(short, long, default_value = "mp3")]
    format: String,

    /// Destination directory; defaults to each source's directory
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Audio encoding mode: cbr, vbr or lossless
    #[arg(long, default_value = "cbr")]
    mode: EncodeMode,

    /// Audio bitrate in kbit/s for CBR
    #[arg(long)]
    bitrate: Option<String>,

    /// Codec-specific VBR quality
    #[arg(long)]
    vbr_quality: Option<String>,

    /// What to do when the destination exists: overwrite, skip or rename
    #[arg(long)]
    on_exists: Option<DuplicatePolicy>,

    /// Maximum simultaneous conversions (0 derives from the core count)
    #[arg(short = 'j', long)]
    parallel: Option<u32>,

    /// Two-pass size-reducing video encode
    #[arg(long)]
    two_pass: bool,

    /// Re-encode video at a lower bitrate
    #[arg(long)]
    reduce_size: bool,

    /// Use HEVC when reducing size
    #[arg(long)]
    hevc: bool,

    /// Keep only the audio of video sources
    #[arg(long)]
    extract_audio: bool,

    /// EBU R128 loudness normalization
    #[arg(long)]
    normalize: bool,

    /// Delete each source after a verified conversion
    #[arg(long)]
    delete_original: bool,

    /// Print the audio and subtitle tracks of INPUTS instead of converting
    #[arg(long)]
    list_tracks: bool,

    /// Skip the ffmpeg version probe. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Serve JSON metrics on this address, e.g. 127.0.0.1:7878
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Debug logging for HandForge crates
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn template(&self) -> JobTemplate {
        JobTemplate {
            format: self.format.clone(),
            output_dir: self.output_dir.clone(),
            mode: self.mode,
            bitrate: self.bitrate.clone(),
            vbr_quality: self.vbr_quality.clone(),
            two_pass: self.two_pass,
            reduce_size: self.reduce_size,
            use_hevc: self.hevc,
            extract_audio_only: self.extract_audio,
            normalize: self.normalize,
            delete_original: self.delete_original,
        }
    }
}

/// Completion counts for the final report
#[derive(Debug, Default)]
struct Summary {
    converted: usize,
    skipped: usize,
    failed: usize,
    stopped: usize,
}

impl Summary {
    fn is_success(&self) -> bool {
        self.failed == 0 && self.stopped == 0
    }
}

/// Prints job results as events arrive
struct Reporter<'a> {
    auto_retry: &'a AutoRetryConfig,
    sources: HashMap<WorkerId, PathBuf>,
    summary: Summary,
}

impl<'a> Reporter<'a> {
    fn new(auto_retry: &'a AutoRetryConfig) -> Self {
        Self {
            auto_retry,
            sources: HashMap::new(),
            summary: Summary::default(),
        }
    }

    fn handle(&mut self, event: &JobEvent) {
        match event {
            JobEvent::Started { id, source } => {
                info!(worker = id, "Converting {}", source.display());
                self.sources.insert(*id, source.clone());
            }
            JobEvent::Progress(p) => {
                debug!(
                    worker = p.id,
                    percent = p.percent,
                    eta_secs = p.eta_secs.round() as u64,
                    speed = %p.speed,
                    "Progress"
                );
            }
            JobEvent::Log { id, line } => trace!(worker = id, "{}", line),
            JobEvent::Finished(c) => {
                let source = self
                    .sources
                    .remove(&c.id)
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| format!("job {}", c.id));
                let first_line = c.message.lines().next().unwrap_or_default();

                match c.status {
                    CompletionStatus::Converted => {
                        self.summary.converted += 1;
                        match &c.output {
                            Some(output) => println!("[done] {} -> {}", source, output.display()),
                            None => println!("[done] {}", source),
                        }
                        if first_line.contains("failed to delete") {
                            println!("       {}", first_line);
                        }
                    }
                    CompletionStatus::Skipped => {
                        self.summary.skipped += 1;
                        println!("[skip] {} ({})", source, first_line);
                    }
                    CompletionStatus::Stopped => {
                        self.summary.stopped += 1;
                        println!("[stop] {}", source);
                    }
                    CompletionStatus::Failed => {
                        self.summary.failed += 1;
                        println!("[FAIL] {}: {}", source, c.message);
                        if let Some(pattern) = self.auto_retry.matching_pattern(&c.message) {
                            println!(
                                "       matches retryable pattern '{}', rerun to retry",
                                pattern
                            );
                        }
                    }
                }
            }
        }
    }
}

fn init_logging(verbose: bool) {
    // Respect RUST_LOG if set, otherwise pick defaults from the verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if verbose {
            "handforge=debug".to_string()
        } else {
            "handforge=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Track listing for one source, with the numbers jobs select tracks by
fn describe_tracks(info: &MediaInfo) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(duration) = info.duration_secs {
        let bitrate = info
            .bitrate_kbps
            .map(|kbps| format!(", {} kb/s", kbps))
            .unwrap_or_default();
        lines.push(format!("  duration {:.1}s{}", duration, bitrate));
    }
    for track in &info.audio_tracks {
        let mut detail = format!("{}, {}", track.codec, track.language);
        if let Some(channels) = track.channels {
            detail.push_str(&format!(", {} ch", channels));
        }
        if let Some(rate) = track.sample_rate {
            detail.push_str(&format!(", {} Hz", rate));
        }
        if let Some(kbps) = track.bitrate_kbps {
            detail.push_str(&format!(", {} kb/s", kbps));
        }
        lines.push(format!(
            "  audio_track = {}  {} [{}]",
            track.position, track.title, detail
        ));
    }
    for track in &info.subtitle_tracks {
        lines.push(format!(
            "  subtitle_stream = {}  {} [{}, {}]",
            track.index, track.title, track.codec, track.language
        ));
    }
    if info.audio_tracks.is_empty() && info.subtitle_tracks.is_empty() {
        lines.push("  no audio or subtitle tracks".to_string());
    }
    lines
}

/// `--list-tracks`: inspect every input and print its selectable tracks
async fn list_tracks(args: &Args) -> Result<Summary> {
    let config = Config::load_or_default(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    let prober = Prober::locate(config.encoder.ffmpeg_path.as_deref())?;

    let sources = collect_sources(&args.inputs);
    if sources.is_empty() {
        bail!("Nothing to inspect: pass files or directories");
    }

    let mut summary = Summary::default();
    for source in sources {
        println!("{}", source.display());
        match prober.inspect(&source).await {
            Ok(info) => {
                for line in describe_tracks(&info) {
                    println!("{}", line);
                }
            }
            Err(e) => {
                summary.failed += 1;
                println!("  [FAIL] {}", e);
            }
        }
    }
    Ok(summary)
}

async fn run(args: Args) -> Result<Summary> {
    if args.list_tracks {
        return list_tracks(&args).await;
    }

    let mut config = Config::load_or_default(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    if let Some(parallel) = args.parallel {
        config.queue.max_parallel = parallel;
    }
    if let Some(policy) = args.on_exists {
        config.queue.on_exists = policy;
    }

    let builder = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        CommandBuilder::with_program(
            config
                .encoder
                .ffmpeg_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("ffmpeg")),
        )
    } else {
        run_startup_checks(&config)?
    };

    let mut jobs = match &args.jobs {
        Some(path) => load_job_file(path)?,
        None => Vec::new(),
    };
    let template = args.template();
    jobs.extend(
        collect_sources(&args.inputs)
            .into_iter()
            .map(|source| template.job_for(source)),
    );
    if jobs.is_empty() {
        bail!("Nothing to convert: pass files, directories or --jobs");
    }

    let settings = OrchestratorSettings::from_config(&config);
    info!(
        jobs = jobs.len(),
        max_parallel = settings.max_parallel,
        on_exists = %settings.worker.on_exists,
        "Starting batch"
    );
    let orchestrator = Orchestrator::spawn(settings, builder);

    let tracker = args.metrics_addr.map(|addr| {
        let metrics = new_shared_metrics();
        let server_metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(server_metrics, addr).await {
                error!(%addr, "Metrics server error: {}", e);
            }
        });
        track(orchestrator.clone(), metrics)
    });

    let mut events = orchestrator.subscribe();
    orchestrator.submit(jobs)?;

    let mut reporter = Reporter::new(&config.auto_retry);
    let idle = orchestrator.wait_idle();
    tokio::pin!(idle);
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => reporter.handle(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream lagged, some progress was not shown");
                }
                Err(RecvError::Closed) => break,
            },
            result = &mut idle => {
                result?;
                break;
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                warn!("Interrupted, stopping all conversions");
                orchestrator.stop_all().await?;
            }
        }
    }

    // Events broadcast before the queue went idle
    while let Ok(event) = events.try_recv() {
        reporter.handle(&event);
    }

    if let Some(tracker) = tracker {
        tracker.abort();
    }

    let summary = reporter.summary;
    println!(
        "Converted: {}, Skipped: {}, Failed: {}, Stopped: {}",
        summary.converted, summary.skipped, summary.failed, summary.stopped
    );
    Ok(summary)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args).await {
        Ok(summary) if summary.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
