//! Worker module
//!
//! A worker runs one job to completion: it resolves the destination, drives one or
//! two ffmpeg processes, verifies the output and reports exactly one terminal
//! [`Completion`]. Every failure is folded into that completion; nothing is retried.

pub mod control;
pub mod destination;
pub mod diagnostics;
mod process;

pub use control::{ControlState, WorkerControl};
pub use destination::{Claim, DestinationRegistry, Reservation};
pub use diagnostics::{summarize_failure, truncate_chars, DiagnosticTail};

use crate::encode::{CommandBuilder, EncodeError, PassSpec};
use crate::events::{Completion, CompletionStatus, JobEvent, ProgressUpdate, WorkerId};
use crate::job::Job;
use crate::output_gate::{check_output, OutputGateResult};
use crate::progress::{ProgressBand, ProgressTracker};
use diagnostics::{LiveProgress, ReaderContext};
use handforge_config::{Config, DuplicatePolicy, EncoderConfig};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Delay before checking whether the encoder died on startup
const STARTUP_PROBE: Duration = Duration::from_millis(100);

/// Lowest percentage a heartbeat reports, so a live job never shows 0
const HEARTBEAT_FLOOR: f64 = 0.1;

/// How long the stderr reader may lag behind process exit
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Error type for a single job run
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Stopped by user")]
    Stopped,

    #[error("Source file not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    /// Another live worker holds this destination
    #[error("Destination is in use by another conversion: {}", .0.display())]
    DestinationBusy(PathBuf),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("Failed to start FFmpeg: {0}")]
    Spawn(std::io::Error),

    /// The encoder failed before the first poll
    #[error("{0}")]
    ExitedImmediately(String),

    #[error("Conversion timed out after {}", describe_duration(*.0))]
    Timeout(Duration),

    #[error("{detail}")]
    NonZeroExit { code: Option<i32>, detail: String },

    #[error("Output file was not created: {}", .0.display())]
    OutputMissing(PathBuf),

    #[error("Output file is too small ({bytes} bytes) - conversion may have failed")]
    OutputTooSmall { path: PathBuf, bytes: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// "1 hour", "90 seconds", "2 minutes"
fn describe_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (n, unit) = if secs >= 3600 && secs % 3600 == 0 {
        (secs / 3600, "hour")
    } else if secs >= 60 && secs % 60 == 0 {
        (secs / 60, "minute")
    } else {
        (secs, "second")
    };
    if n == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", n, unit)
    }
}

/// Settings shared by every worker of one orchestrator
#[derive(Debug, Clone, Default)]
pub struct WorkerSettings {
    pub on_exists: DuplicatePolicy,
    pub encoder: EncoderConfig,
}

impl WorkerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            on_exists: cfg.queue.on_exists,
            encoder: cfg.encoder.clone(),
        }
    }
}

/// Successful end of a job
struct Outcome {
    status: CompletionStatus,
    message: String,
    output: PathBuf,
}

/// How an encoder process ended
struct Exit {
    status: ExitStatus,
    /// Exited before the startup probe
    immediate: bool,
}

/// Removes two-pass log files on drop, whatever the outcome
struct PassLogCleanup {
    prefix: PathBuf,
}

impl Drop for PassLogCleanup {
    fn drop(&mut self) {
        remove_pass_logs(&self.prefix);
    }
}

/// Remove every file next to `prefix` whose name starts with the prefix's name
fn remove_pass_logs(prefix: &Path) {
    let (Some(dir), Some(name)) = (prefix.parent(), prefix.file_name()) else {
        return;
    };
    let name = name.to_string_lossy();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(name.as_ref()) {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                debug!(path = %entry.path().display(), error = %e, "Failed to remove pass log");
            }
        }
    }
}

/// Delete the source unless it is the output itself.
///
/// Returns `Ok(false)` when nothing was deleted.
async fn delete_source(source: &Path, output: &Path) -> std::io::Result<bool> {
    let (Ok(source), Ok(output)) = (
        tokio::fs::canonicalize(source).await,
        tokio::fs::canonicalize(output).await,
    ) else {
        return Ok(false);
    };
    if source == output {
        return Ok(false);
    }
    tokio::fs::remove_file(&source).await.map(|_| true)
}

/// One job run
pub struct Worker {
    id: WorkerId,
    job: Job,
    builder: Arc<CommandBuilder>,
    settings: Arc<WorkerSettings>,
    registry: DestinationRegistry,
    control: watch::Receiver<ControlState>,
    events: mpsc::UnboundedSender<JobEvent>,
    started: Instant,
    /// Encoder running time so far, excluding pauses
    active: Duration,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        job: Job,
        builder: Arc<CommandBuilder>,
        settings: Arc<WorkerSettings>,
        registry: DestinationRegistry,
        control: watch::Receiver<ControlState>,
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> Self {
        Self {
            id,
            job,
            builder,
            settings,
            registry,
            control,
            events,
            started: Instant::now(),
            active: Duration::ZERO,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Run the job and emit its completion as the final event
    pub async fn run(mut self) -> Completion {
        self.started = Instant::now();
        let result = self.execute().await;

        let completion = match result {
            Ok(outcome) => Completion {
                id: self.id,
                success: true,
                status: outcome.status,
                message: outcome.message,
                output: Some(outcome.output),
            },
            Err(WorkerError::Stopped) => Completion {
                id: self.id,
                success: false,
                status: CompletionStatus::Stopped,
                message: WorkerError::Stopped.to_string(),
                output: None,
            },
            Err(e) => Completion {
                id: self.id,
                success: false,
                status: CompletionStatus::Failed,
                message: truncate_chars(&e.to_string(), self.settings.encoder.message_limit),
                output: None,
            },
        };

        info!(
            worker = self.id,
            source = %self.job.source.display(),
            status = ?completion.status,
            elapsed_secs = self.started.elapsed().as_secs(),
            "Job finished"
        );
        let _ = self.events.send(JobEvent::Finished(completion.clone()));
        completion
    }

    fn log(&self, line: impl Into<String>) {
        let _ = self.events.send(JobEvent::Log {
            id: self.id,
            line: line.into(),
        });
    }

    async fn execute(&mut self) -> Result<Outcome, WorkerError> {
        self.wait_while_paused().await?;

        if !self.job.source.exists() {
            return Err(WorkerError::SourceNotFound(self.job.source.clone()));
        }

        let destination = self.job.destination();
        if let Some(dir) = destination.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let reservation = match self.registry.claim(destination, self.settings.on_exists)? {
            Claim::Skip(path) => {
                self.log(format!("Skipped, output exists: {}", path.display()));
                return Ok(Outcome {
                    status: CompletionStatus::Skipped,
                    message: "Skipped (file exists)".to_string(),
                    output: path,
                });
            }
            Claim::Reserved(reservation) => reservation,
        };
        let output = reservation.path().to_path_buf();

        self.log(format!("Starting conversion: {}", self.job.source.display()));
        self.log(format!(
            "Format: {}, Mode: {}",
            self.job.format.to_uppercase(),
            self.job.mode
        ));
        self.log(format!("Output: {}", output.display()));

        if self.job.is_two_pass() {
            let _cleanup = PassLogCleanup {
                prefix: PassSpec::log_prefix_for(&output),
            };
            for number in 1..=2u8 {
                self.log(format!("Pass {}/2", number));
                let args = self.builder.build_pass(&self.job, &output, number)?;
                self.run_encoder(args, ProgressBand::for_pass(number)).await?;
            }
        } else {
            let args = self.builder.build(&self.job, &output)?;
            self.run_encoder(args, ProgressBand::FULL).await?;
        }

        match check_output(&output, self.settings.encoder.min_output_bytes) {
            OutputGateResult::Accept { .. } => {}
            OutputGateResult::Missing => return Err(WorkerError::OutputMissing(output)),
            OutputGateResult::TooSmall { bytes, .. } => {
                return Err(WorkerError::OutputTooSmall {
                    path: output,
                    bytes,
                })
            }
        }

        let _ = self.events.send(JobEvent::Progress(ProgressUpdate {
            id: self.id,
            percent: 100.0,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            eta_secs: 0.0,
            speed: String::new(),
        }));

        let saved = format!("Saved to: {}", output.display());
        let message = if self.job.delete_original {
            match delete_source(&self.job.source, &output).await {
                Ok(true) => format!("Conversion completed, original file deleted\n{}", saved),
                Ok(false) => format!("Conversion completed successfully\n{}", saved),
                Err(e) => {
                    warn!(
                        source = %self.job.source.display(),
                        error = %e,
                        "Failed to delete original"
                    );
                    format!(
                        "Conversion completed, but failed to delete original: {}\n{}",
                        e, saved
                    )
                }
            }
        } else {
            format!("Conversion completed successfully\n{}", saved)
        };

        Ok(Outcome {
            status: CompletionStatus::Converted,
            message,
            output,
        })
    }

    /// Block while paused; a stop while waiting ends the job before any spawn
    async fn wait_while_paused(&mut self) -> Result<(), WorkerError> {
        let waited = self
            .control
            .wait_for(|s| !s.paused || s.stopped)
            .await
            .map(|s| *s);
        let state = match waited {
            Ok(state) => state,
            Err(_) => *self.control.borrow(),
        };
        if state.stopped {
            Err(WorkerError::Stopped)
        } else {
            Ok(())
        }
    }

    async fn run_encoder(
        &mut self,
        args: Vec<String>,
        band: ProgressBand,
    ) -> Result<(), WorkerError> {
        debug!(
            worker = self.id,
            program = %self.builder.program().display(),
            args = ?args,
            "Spawning ffmpeg"
        );

        let mut child = Command::new(self.builder.program())
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::Spawn)?;

        let Some(stderr) = child.stderr.take() else {
            process::kill(&mut child).await;
            return Err(WorkerError::Spawn(std::io::Error::other(
                "stderr was not captured",
            )));
        };

        let tail = DiagnosticTail::default();
        let live = Arc::new(Mutex::new(LiveProgress::new(band.start)));
        let mut reader = tokio::spawn(diagnostics::pump(
            stderr,
            ReaderContext {
                id: self.id,
                events: self.events.clone(),
                tail: tail.clone(),
                tracker: ProgressTracker::new(band),
                live: live.clone(),
                started: self.started,
                idle_warning: Duration::from_secs(self.settings.encoder.idle_warning_secs.max(1)),
                control: self.control.clone(),
            },
        ));

        let exit = self.supervise(&mut child, &live).await;

        // Diagnostics must be fully relayed before the terminal event
        if tokio::time::timeout(READER_JOIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            reader.abort();
        }

        let exit = exit?;
        if exit.status.success() {
            return Ok(());
        }

        let detail = summarize_failure(&tail.snapshot(), self.settings.encoder.message_limit)
            .unwrap_or_else(|| match exit.status.code() {
                Some(code) => format!("FFmpeg exited with code {}", code),
                None => "FFmpeg was terminated by a signal".to_string(),
            });
        if exit.immediate {
            Err(WorkerError::ExitedImmediately(detail))
        } else {
            Err(WorkerError::NonZeroExit {
                code: exit.status.code(),
                detail,
            })
        }
    }

    /// Poll the encoder until it exits, honoring pause, stop and the hard timeout.
    ///
    /// An exit before the startup probe is flagged `immediate`. Only a failing
    /// immediate exit becomes [`WorkerError::ExitedImmediately`]; a successful one
    /// (short inputs finish that fast) still goes through output verification.
    async fn supervise(
        &mut self,
        child: &mut Child,
        live: &Mutex<LiveProgress>,
    ) -> Result<Exit, WorkerError> {
        let mut running_since = Instant::now();

        tokio::time::sleep(STARTUP_PROBE).await;
        if let Some(status) = child.try_wait()? {
            self.active += running_since.elapsed();
            return Ok(Exit {
                status,
                immediate: true,
            });
        }

        let encoder = &self.settings.encoder;
        let poll = Duration::from_millis(encoder.poll_interval_ms.max(10));
        let heartbeat = Duration::from_secs(encoder.heartbeat_secs.max(1));
        let timeout = Duration::from_secs(encoder.timeout_secs);
        let mut last_heartbeat = Instant::now();
        let mut control_open = true;

        loop {
            let state = *self.control.borrow_and_update();
            if state.stopped {
                process::terminate(child).await;
                return Err(WorkerError::Stopped);
            }

            if state.paused && control_open {
                self.active += running_since.elapsed();
                process::suspend(child);
                self.log("Paused");
                let resumed = self
                    .control
                    .wait_for(|s| !s.paused || s.stopped)
                    .await
                    .map(|s| *s);
                process::resume(child);
                match resumed {
                    Ok(s) if s.stopped => {
                        process::terminate(child).await;
                        return Err(WorkerError::Stopped);
                    }
                    Ok(_) => self.log("Resumed"),
                    Err(_) => control_open = false,
                }
                running_since = Instant::now();
                last_heartbeat = Instant::now();
                continue;
            }

            tokio::select! {
                status = child.wait() => {
                    self.active += running_since.elapsed();
                    return Ok(Exit { status: status?, immediate: false });
                }
                _ = tokio::time::sleep(poll) => {}
                changed = self.control.changed(), if control_open => {
                    if changed.is_err() {
                        control_open = false;
                    }
                }
            }

            if self.active + running_since.elapsed() >= timeout {
                warn!(worker = self.id, timeout_secs = timeout.as_secs(), "Encoder timed out, killing");
                process::kill(child).await;
                return Err(WorkerError::Timeout(timeout));
            }

            let now = Instant::now();
            if now.duration_since(last_heartbeat) >= heartbeat {
                last_heartbeat = now;
                let mut live = live.lock();
                let fresh = live
                    .last_sample_at
                    .is_some_and(|at| now.duration_since(at) < heartbeat);
                if !fresh {
                    // The floor is recorded so later samples cannot report less
                    let percent = live.advance(HEARTBEAT_FLOOR);
                    let _ = self.events.send(JobEvent::Progress(ProgressUpdate {
                        id: self.id,
                        percent,
                        elapsed_secs: self.started.elapsed().as_secs_f64(),
                        eta_secs: 0.0,
                        speed: "?".to_string(),
                    }));
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// How the fake encoder ends
    enum Ending {
        /// Exit with this status after a short delay
        Exit(i32),
        /// Exit with this status right away
        ExitNow(i32),
        /// Exit successfully after a 1.5 second encode
        Slow,
        /// Replace the shell with a long sleep
        Hang,
    }

    struct Fixture {
        dir: TempDir,
        program: PathBuf,
        invocations: PathBuf,
    }

    /// Duration header plus one status line at 50 %
    const DIAGNOSTICS: &str = r#"echo "  Duration: 00:00:10.00, start: 0.000000, bitrate: 320 kb/s" >&2
printf 'size=     100kB time=00:00:05.00 bitrate= 163.8kbits/s speed=10.0x\r' >&2"#;

    impl Fixture {
        fn new(bytes: usize, message: &str, ending: Ending) -> Self {
            Self::with_diagnostics(bytes, DIAGNOSTICS, message, ending)
        }

        /// Writes a fake ffmpeg that logs its arguments, runs `diagnostics`,
        /// touches any requested pass logs and writes `bytes` to its last argument.
        fn with_diagnostics(bytes: usize, diagnostics: &str, message: &str, ending: Ending) -> Self {
            let dir = TempDir::new().unwrap();
            let program = dir.path().join("ffmpeg");
            let invocations = dir.path().join("invocations.log");
            let ending = match ending {
                Ending::Exit(code) => format!("sleep 0.3\nexit {}", code),
                Ending::ExitNow(code) => format!("exit {}", code),
                Ending::Slow => "sleep 1.5\nexit 0".to_string(),
                Ending::Hang => "exec sleep 30".to_string(),
            };
            let script = format!(
                r#"#!/bin/sh
echo "$@" >> "{invocations}"
prev=""
last=""
for arg in "$@"; do
  if [ "$prev" = "-passlogfile" ]; then
    touch "$arg-0.log" "$arg-0.log.mbtree"
  fi
  prev="$arg"
  last="$arg"
done
{diagnostics}
if [ "$last" != "/dev/null" ]; then
  head -c {bytes} /dev/zero > "$last"
fi
echo "{message}" >&2
{ending}
"#,
                invocations = invocations.display(),
                bytes = bytes,
                diagnostics = diagnostics,
                message = message,
                ending = ending,
            );
            fs::write(&program, script).unwrap();
            fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();
            fs::write(dir.path().join("in.flac"), b"fake flac").unwrap();
            fs::write(dir.path().join("in.mp4"), b"fake mp4").unwrap();
            Self {
                dir,
                program,
                invocations,
            }
        }

        fn out_dir(&self) -> PathBuf {
            self.dir.path().join("out")
        }

        fn job(&self, source: &str, format: &str) -> Job {
            Job::new(self.dir.path().join(source), self.out_dir(), format)
        }

        fn invocations(&self) -> Vec<String> {
            fs::read_to_string(&self.invocations)
                .map(|s| s.lines().map(str::to_string).collect())
                .unwrap_or_default()
        }

        fn worker(
            &self,
            job: Job,
            on_exists: DuplicatePolicy,
            encoder: EncoderConfig,
        ) -> (Worker, WorkerControl, mpsc::UnboundedReceiver<JobEvent>) {
            let control = WorkerControl::new();
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = Worker::new(
                1,
                job,
                Arc::new(CommandBuilder::with_program(&self.program)),
                Arc::new(WorkerSettings { on_exists, encoder }),
                DestinationRegistry::new(),
                control.subscribe(),
                tx,
            );
            (worker, control, rx)
        }
    }

    fn fast_encoder() -> EncoderConfig {
        EncoderConfig {
            poll_interval_ms: 20,
            heartbeat_secs: 1,
            timeout_secs: 30,
            ..EncoderConfig::default()
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn percents(events: &[JobEvent]) -> Vec<f64> {
        events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Progress(p) => Some(p.percent),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_successful_conversion() {
        let fx = Fixture::new(4096, "video:0kB audio:4kB", Ending::Exit(0));
        let (worker, _control, mut rx) =
            fx.worker(fx.job("in.flac", "mp3"), DuplicatePolicy::Overwrite, fast_encoder());

        let completion = worker.run().await;
        assert!(completion.success, "{}", completion.message);
        assert_eq!(completion.status, CompletionStatus::Converted);
        let expected = fx.out_dir().join("in.mp3");
        assert_eq!(completion.output.as_deref(), Some(expected.as_path()));
        assert!(completion.message.starts_with("Conversion completed successfully"));
        assert_eq!(fs::metadata(&expected).unwrap().len(), 4096);

        let events = drain(&mut rx);
        assert!(events.last().unwrap().is_terminal());
        let percents = percents(&events);
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
        assert!(percents.contains(&50.0));
        assert_eq!(percents.last(), Some(&100.0));
        assert!(events.iter().any(
            |e| matches!(e, JobEvent::Log { line, .. } if line == "Format: MP3, Mode: CBR")
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_before_first_sample_keeps_progress_monotonic() {
        // A long input probed past the heartbeat interval, then a tiny first sample
        let diagnostics = r#"echo "  Duration: 01:00:00.00, start: 0.000000, bitrate: 320 kb/s" >&2
sleep 1.6
printf 'size=       1kB time=00:00:01.00 bitrate= 8.2kbits/s speed=1.0x\r' >&2"#;
        let fx = Fixture::with_diagnostics(4096, diagnostics, "done", Ending::ExitNow(0));
        let (worker, _control, mut rx) =
            fx.worker(fx.job("in.flac", "mp3"), DuplicatePolicy::Overwrite, fast_encoder());

        let completion = worker.run().await;
        assert!(completion.success, "{}", completion.message);

        let percents = percents(&drain(&mut rx));
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
        assert_eq!(percents.first(), Some(&HEARTBEAT_FLOOR));
        assert_eq!(percents.last(), Some(&100.0));
    }

    #[tokio::test]
    async fn test_decode_error_becomes_message() {
        let fx = Fixture::new(0, "Error while decoding stream #0:0", Ending::ExitNow(1));
        let (worker, _control, _rx) =
            fx.worker(fx.job("in.flac", "mp3"), DuplicatePolicy::Overwrite, fast_encoder());

        let completion = worker.run().await;
        assert!(!completion.success);
        assert_eq!(completion.status, CompletionStatus::Failed);
        assert!(completion.message.ends_with("Error while decoding stream #0:0"));
        assert_eq!(completion.output, None);
    }

    #[tokio::test]
    async fn test_late_failure_uses_error_line() {
        let fx = Fixture::new(0, "Conversion failed!", Ending::Exit(1));
        let (worker, _control, _rx) =
            fx.worker(fx.job("in.flac", "mp3"), DuplicatePolicy::Overwrite, fast_encoder());

        let completion = worker.run().await;
        assert!(!completion.success);
        assert_eq!(completion.message, "Conversion failed!");
    }

    #[tokio::test]
    async fn test_small_output_is_rejected() {
        let fx = Fixture::new(512, "done", Ending::Exit(0));
        let (worker, _control, mut rx) =
            fx.worker(fx.job("in.flac", "mp3"), DuplicatePolicy::Overwrite, fast_encoder());

        let completion = worker.run().await;
        assert!(!completion.success);
        assert!(completion.message.contains("too small"), "{}", completion.message);
        assert!(!percents(&drain(&mut rx)).contains(&100.0));
    }

    #[tokio::test]
    async fn test_skip_existing_destination() {
        let fx = Fixture::new(4096, "done", Ending::Exit(0));
        fs::create_dir_all(fx.out_dir()).unwrap();
        fs::write(fx.out_dir().join("in.mp3"), b"old").unwrap();

        let (worker, _control, _rx) =
            fx.worker(fx.job("in.flac", "mp3"), DuplicatePolicy::Skip, fast_encoder());
        let completion = worker.run().await;

        assert!(completion.success);
        assert_eq!(completion.status, CompletionStatus::Skipped);
        assert_eq!(completion.message, "Skipped (file exists)");
        assert!(fx.invocations().is_empty());
        assert_eq!(fs::read(fx.out_dir().join("in.mp3")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_rename_existing_destination() {
        let fx = Fixture::new(4096, "done", Ending::ExitNow(0));
        fs::create_dir_all(fx.out_dir()).unwrap();
        fs::write(fx.out_dir().join("in.mp3"), b"old").unwrap();

        let (worker, _control, _rx) =
            fx.worker(fx.job("in.flac", "mp3"), DuplicatePolicy::Rename, fast_encoder());
        let completion = worker.run().await;

        assert!(completion.success, "{}", completion.message);
        let renamed = fx.out_dir().join("in (1).mp3");
        assert_eq!(completion.output.as_deref(), Some(renamed.as_path()));
        assert_eq!(fs::metadata(renamed).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_two_pass_runs_twice_and_cleans_logs() {
        let fx = Fixture::new(8192, "done", Ending::ExitNow(0));
        let mut job = fx.job("in.mp4", "mkv");
        job.reduce_size = true;
        job.two_pass = true;

        let (worker, _control, mut rx) =
            fx.worker(job, DuplicatePolicy::Overwrite, fast_encoder());
        let completion = worker.run().await;
        assert!(completion.success, "{}", completion.message);

        let calls = fx.invocations();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].ends_with("/dev/null"));
        assert!(calls[0].contains("-pass 1"));
        assert!(calls[1].ends_with("in.mkv"));
        assert!(calls[1].contains("-pass 2"));

        let leftovers: Vec<_> = fs::read_dir(fx.out_dir())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains("ffmpeg2pass"))
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);

        let percents = percents(&drain(&mut rx));
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
        assert!(percents.contains(&25.0));
        assert!(percents.contains(&75.0));
    }

    #[tokio::test]
    async fn test_stop_while_paused() {
        let fx = Fixture::new(4096, "encoding", Ending::Hang);
        let (worker, control, mut rx) =
            fx.worker(fx.job("in.flac", "mp3"), DuplicatePolicy::Overwrite, fast_encoder());
        let handle = tokio::spawn(worker.run());

        // Wait until the encoder reported progress
        loop {
            match rx.recv().await.unwrap() {
                JobEvent::Progress(_) => break,
                JobEvent::Finished(c) => panic!("finished early: {}", c.message),
                _ => {}
            }
        }

        control.pause();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        control.stop();

        let completion = handle.await.unwrap();
        assert_eq!(completion.status, CompletionStatus::Stopped);
        assert_eq!(completion.message, "Stopped by user");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    /// Spawn `worker` and wait for its first progress event
    async fn run_until_progress(
        worker: Worker,
        rx: &mut mpsc::UnboundedReceiver<JobEvent>,
    ) -> tokio::task::JoinHandle<Completion> {
        let handle = tokio::spawn(worker.run());
        loop {
            match rx.recv().await.unwrap() {
                JobEvent::Progress(_) => return handle,
                JobEvent::Finished(c) => panic!("finished early: {}", c.message),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_pause_resume_completes() {
        let fx = Fixture::new(4096, "encoding", Ending::Slow);
        let (worker, control, mut rx) =
            fx.worker(fx.job("in.flac", "mp3"), DuplicatePolicy::Overwrite, fast_encoder());
        let handle = run_until_progress(worker, &mut rx).await;

        control.pause();
        tokio::time::sleep(Duration::from_secs(2)).await;
        // The encode itself would be done by now; a paused worker must not finish
        assert!(!handle.is_finished());
        let while_paused = drain(&mut rx);
        assert!(!while_paused.iter().any(JobEvent::is_terminal));
        assert!(while_paused
            .iter()
            .any(|e| matches!(e, JobEvent::Log { line, .. } if line == "Paused")));

        control.resume();
        let completion = handle.await.unwrap();
        assert!(completion.success, "{}", completion.message);
        assert_eq!(completion.status, CompletionStatus::Converted);

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, JobEvent::Log { line, .. } if line == "Resumed")));
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_paused_time_not_counted_toward_timeout() {
        let fx = Fixture::new(4096, "encoding", Ending::Slow);
        let encoder = EncoderConfig {
            timeout_secs: 1,
            ..fast_encoder()
        };
        let (worker, control, mut rx) =
            fx.worker(fx.job("in.flac", "mp3"), DuplicatePolicy::Overwrite, encoder);
        let handle = run_until_progress(worker, &mut rx).await;

        control.pause();
        tokio::time::sleep(Duration::from_secs(2)).await;
        control.resume();

        let completion = handle.await.unwrap();
        assert!(completion.success, "{}", completion.message);
        assert_eq!(completion.status, CompletionStatus::Converted);
    }

    #[tokio::test]
    async fn test_stop_before_start_spawns_nothing() {
        let fx = Fixture::new(4096, "done", Ending::Exit(0));
        let (worker, control, _rx) =
            fx.worker(fx.job("in.flac", "mp3"), DuplicatePolicy::Overwrite, fast_encoder());
        control.pause();
        control.stop();

        let completion = worker.run().await;
        assert_eq!(completion.status, CompletionStatus::Stopped);
        assert!(fx.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_missing_source() {
        let fx = Fixture::new(4096, "done", Ending::Exit(0));
        let (worker, _control, _rx) =
            fx.worker(fx.job("missing.flac", "mp3"), DuplicatePolicy::Overwrite, fast_encoder());

        let completion = worker.run().await;
        assert!(!completion.success);
        assert!(completion.message.starts_with("Source file not found"));
        assert!(fx.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_kills_encoder() {
        let fx = Fixture::new(4096, "encoding", Ending::Hang);
        let encoder = EncoderConfig {
            timeout_secs: 1,
            ..fast_encoder()
        };
        let (worker, _control, _rx) =
            fx.worker(fx.job("in.flac", "mp3"), DuplicatePolicy::Overwrite, encoder);

        let completion = worker.run().await;
        assert!(!completion.success);
        assert_eq!(completion.message, "Conversion timed out after 1 second");
    }

    #[tokio::test]
    async fn test_delete_original_after_success() {
        let fx = Fixture::new(4096, "done", Ending::ExitNow(0));
        let mut job = fx.job("in.flac", "mp3");
        job.delete_original = true;
        let source = job.source.clone();

        let (worker, _control, _rx) =
            fx.worker(job, DuplicatePolicy::Overwrite, fast_encoder());
        let completion = worker.run().await;

        assert!(completion.success);
        assert!(completion
            .message
            .starts_with("Conversion completed, original file deleted"));
        assert!(!source.exists());
    }

    #[test]
    fn test_describe_duration() {
        assert_eq!(describe_duration(Duration::from_secs(3600)), "1 hour");
        assert_eq!(describe_duration(Duration::from_secs(7200)), "2 hours");
        assert_eq!(describe_duration(Duration::from_secs(120)), "2 minutes");
        assert_eq!(describe_duration(Duration::from_secs(90)), "90 seconds");
    }
}
