//! Encoder stderr consumption
//!
//! The reader task turns ffmpeg's diagnostic stream into log and progress events,
//! keeps a bounded tail for failure messages, and warns when the stream goes quiet.

use super::control::ControlState;
use crate::events::{JobEvent, ProgressUpdate, WorkerId};
use crate::progress::{LineSplitter, ProgressTracker};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Lines kept for failure classification
const TAIL_LINES: usize = 64;

/// Consecutive read failures tolerated before giving up on the stream
const MAX_READ_RETRIES: u32 = 5;

const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bounded tail of the diagnostic stream
#[derive(Debug, Clone, Default)]
pub struct DiagnosticTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl DiagnosticTail {
    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

fn looks_like_error(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("error") || lower.contains("failed") || lower.contains("invalid")
}

/// First `limit` characters of `text`
pub fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Short failure message from the diagnostic tail.
///
/// Prefers the last line mentioning an error, otherwise the last three lines.
pub fn summarize_failure(lines: &[String], limit: usize) -> Option<String> {
    if let Some(line) = lines.iter().rev().find(|l| looks_like_error(l)) {
        return Some(truncate_chars(line, limit));
    }
    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(3);
    Some(truncate_chars(&lines[start..].join("\n"), limit))
}

/// Progress state shared between the reader and the run loop
#[derive(Debug)]
pub(crate) struct LiveProgress {
    pub percent: f64,
    pub speed: String,
    pub last_sample_at: Option<Instant>,
}

impl LiveProgress {
    pub fn new(percent: f64) -> Self {
        Self {
            percent,
            speed: "?".to_string(),
            last_sample_at: None,
        }
    }

    /// Raise the reported percentage to `percent` unless a higher one was already
    /// reported, and return the value to report.
    pub fn advance(&mut self, percent: f64) -> f64 {
        self.percent = self.percent.max(percent);
        self.percent
    }
}

pub(crate) struct ReaderContext {
    pub id: WorkerId,
    pub events: mpsc::UnboundedSender<JobEvent>,
    pub tail: DiagnosticTail,
    pub tracker: ProgressTracker,
    pub live: Arc<Mutex<LiveProgress>>,
    pub started: Instant,
    pub idle_warning: Duration,
    pub control: watch::Receiver<ControlState>,
}

impl ReaderContext {
    fn handle_line(&mut self, line: String) {
        self.tail.push(line.clone());
        let sample = self.tracker.feed(&line);
        let _ = self.events.send(JobEvent::Log { id: self.id, line });

        if let Some(sample) = sample {
            // Sent under the lock so heartbeats and samples stay ordered
            let mut live = self.live.lock();
            let percent = live.advance(sample.percent);
            live.speed = sample.speed.clone();
            live.last_sample_at = Some(Instant::now());
            let _ = self.events.send(JobEvent::Progress(ProgressUpdate {
                id: self.id,
                percent,
                elapsed_secs: self.started.elapsed().as_secs_f64(),
                eta_secs: sample.eta_secs,
                speed: sample.speed,
            }));
        }
    }
}

/// Read `stream` to EOF, emitting log and progress events
pub(crate) async fn pump<R>(mut stream: R, mut ctx: ReaderContext)
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new();
    let mut buf = vec![0u8; 8192];
    let mut failures = 0u32;

    loop {
        match tokio::time::timeout(ctx.idle_warning, stream.read(&mut buf)).await {
            Err(_) => {
                if ctx.control.borrow().paused {
                    continue;
                }
                let secs = ctx.idle_warning.as_secs();
                warn!(worker = ctx.id, "No output from ffmpeg for {}s, process may be stuck", secs);
                let _ = ctx.events.send(JobEvent::Log {
                    id: ctx.id,
                    line: format!(
                        "Warning: no output from FFmpeg for {}s. Process may be stuck.",
                        secs
                    ),
                });
            }
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                failures = 0;
                for line in splitter.push(&buf[..n]) {
                    ctx.handle_line(line);
                }
            }
            Ok(Err(e)) => {
                failures += 1;
                if failures > MAX_READ_RETRIES {
                    let _ = ctx.events.send(JobEvent::Log {
                        id: ctx.id,
                        line: format!("Read error: {}", e),
                    });
                    break;
                }
                debug!(worker = ctx.id, error = %e, "Transient stderr read error, retrying");
                tokio::time::sleep(READ_RETRY_DELAY).await;
            }
        }
    }

    if let Some(line) = splitter.finish() {
        ctx.handle_line(line);
    }
}
