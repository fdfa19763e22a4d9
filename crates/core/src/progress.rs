//! FFmpeg diagnostic stream parsing
//!
//! ffmpeg reports the input duration once (`Duration: 00:03:12.48`) and then keeps
//! rewriting a status line (`... time=00:01:02.10 ... speed=2.5x`) terminated by a
//! carriage return. [`LineSplitter`] turns raw stderr bytes into lines and
//! [`ProgressTracker`] turns lines into progress samples.

use once_cell::sync::Lazy;
use regex::Regex;

static DURATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("duration pattern is valid")
});

static TIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"time=\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("time pattern is valid")
});

static SPEED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"speed=\s*([\d.]+)x").expect("speed pattern is valid"));

/// Highest percentage a pass may report before the job is verified
const PASS_CEILING: f64 = 99.0;

/// Reported when a status line carries no speed
const DEFAULT_SPEED: &str = "1.0x";

fn parse_clock(caps: &regex::Captures<'_>) -> Option<f64> {
    let hours: f64 = caps.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
    let secs: f64 = caps.get(3)?.as_str().parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + secs)
}

/// Parse the `Duration:` header, in seconds
pub fn parse_duration(line: &str) -> Option<f64> {
    DURATION_RE.captures(line).and_then(|c| parse_clock(&c))
}

/// Parse the `time=` position of a status line, in seconds
pub fn parse_position(line: &str) -> Option<f64> {
    TIME_RE.captures(line).and_then(|c| parse_clock(&c))
}

/// Parse the `speed=` multiplier of a status line
pub fn parse_speed(line: &str) -> Option<f64> {
    SPEED_RE
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// One parsed progress sample
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSample {
    /// Job-level percentage, always below 100
    pub percent: f64,
    /// Encoded position in seconds
    pub position_secs: f64,
    /// Estimated seconds left in this pass
    pub eta_secs: f64,
    /// Speed as printed by ffmpeg, e.g. `2.5x`
    pub speed: String,
}

/// Percentage range a pass maps onto
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressBand {
    pub start: f64,
    pub end: f64,
}

impl ProgressBand {
    /// The whole job in one pass
    pub const FULL: ProgressBand = ProgressBand {
        start: 0.0,
        end: 100.0,
    };

    /// Band for pass `number` (1 or 2) of a two-pass job
    pub fn for_pass(number: u8) -> Self {
        if number <= 1 {
            ProgressBand {
                start: 0.0,
                end: 50.0,
            }
        } else {
            ProgressBand {
                start: 50.0,
                end: 100.0,
            }
        }
    }

    fn map(&self, pass_percent: f64) -> f64 {
        self.start + pass_percent * (self.end - self.start) / 100.0
    }
}

/// Tracks the progress of one encoder process
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    band: ProgressBand,
    duration: Option<f64>,
    last_percent: f64,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(ProgressBand::FULL)
    }
}

impl ProgressTracker {
    pub fn new(band: ProgressBand) -> Self {
        Self {
            band,
            duration: None,
            last_percent: band.start,
        }
    }

    /// Total duration, once the header was seen
    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    /// Last reported percentage
    pub fn last_percent(&self) -> f64 {
        self.last_percent
    }

    /// Consume one diagnostic line.
    ///
    /// The first `Duration:` wins. Status lines produce a sample once the duration
    /// is known; percentages never decrease within a pass.
    pub fn feed(&mut self, line: &str) -> Option<ProgressSample> {
        if self.duration.is_none() {
            if let Some(duration) = parse_duration(line) {
                self.duration = Some(duration);
                return None;
            }
        }

        let duration = self.duration.filter(|d| *d > 0.0)?;
        let position = parse_position(line)?;

        let pass_percent = (position / duration * 100.0).min(PASS_CEILING);
        let percent = self.band.map(pass_percent).max(self.last_percent);
        self.last_percent = percent;

        let speed = parse_speed(line);
        let remaining = (duration - position).max(0.0);
        let eta_secs = match speed {
            Some(s) if s > 0.0 => remaining / s,
            _ => remaining,
        };

        Some(ProgressSample {
            percent,
            position_secs: position,
            eta_secs,
            speed: speed
                .map(|s| format!("{}x", s))
                .unwrap_or_else(|| DEFAULT_SPEED.to_string()),
        })
    }
}

/// Splits a byte stream into trimmed, non-empty lines on `\n` and `\r`
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                self.flush_into(&mut lines);
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Return the trailing partial line, if any
    pub fn finish(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        self.flush_into(&mut lines);
        lines.pop()
    }

    fn flush_into(&mut self, lines: &mut Vec<String>) {
        if self.pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        if !line.is_empty() {
            lines.push(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn clock(secs: f64) -> String {
        let total_cs = (secs * 100.0).round() as u64;
        let h = total_cs / 360_000;
        let m = (total_cs / 6000) % 60;
        let s = (total_cs / 100) % 60;
        let cs = total_cs % 100;
        format!("{:02}:{:02}:{:02}.{:02}", h, m, s, cs)
    }

    fn status_line(position: f64, speed: f64) -> String {
        format!(
            "frame=  123 fps= 25 q=28.0 size=    1024kB time={} bitrate=1677.7kbits/s speed={:.2}x",
            clock(position),
            speed
        )
    }

    // **Feature: handforge, Property 2: Progress is monotonic and below 100**
    //
    // *For any* duration and any sequence of status positions (including ones past
    // the end and ones that jump backwards), percentages never decrease and never
    // reach 100.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_progress_monotonic_below_100(
            duration in 1.0f64..20_000.0,
            positions in prop::collection::vec(0.0f64..25_000.0, 1..40),
            pass in 0u8..3,
        ) {
            let band = if pass == 0 { ProgressBand::FULL } else { ProgressBand::for_pass(pass) };
            let mut tracker = ProgressTracker::new(band);
            let header = format!("  Duration: {}, start: 0.000000, bitrate: 320 kb/s", clock(duration));
            prop_assert!(tracker.feed(&header).is_none());

            let mut last = band.start;
            for position in positions {
                let sample = tracker.feed(&status_line(position, 1.5)).expect("status line parses");
                prop_assert!(sample.percent >= last, "{} < {}", sample.percent, last);
                prop_assert!(sample.percent < 100.0);
                prop_assert!(sample.percent <= band.end);
                prop_assert!(sample.eta_secs >= 0.0);
                last = sample.percent;
            }
        }

        #[test]
        fn prop_splitter_matches_lines(
            lines in prop::collection::vec("[a-z=0-9 .:]{1,30}", 1..20),
            use_cr in proptest::bool::ANY,
            chunk in 1usize..16,
        ) {
            let sep = if use_cr { "\r" } else { "\r\n" };
            let stream = lines.join(sep) + sep;

            let mut splitter = LineSplitter::new();
            let mut out = Vec::new();
            for piece in stream.as_bytes().chunks(chunk) {
                out.extend(splitter.push(piece));
            }
            out.extend(splitter.finish());

            let expected: Vec<String> = lines
                .iter()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect();
            prop_assert_eq!(out, expected);
        }
    }

    #[test]
    fn test_first_duration_wins() {
        let mut tracker = ProgressTracker::default();
        tracker.feed("  Duration: 00:01:40.00, start: 0.000000, bitrate: 1411 kb/s");
        tracker.feed("  Duration: 00:10:00.00, start: 0.000000");
        assert_eq!(tracker.duration(), Some(100.0));

        let sample = tracker
            .feed("size=     512kB time=00:00:25.00 bitrate= 167.8kbits/s speed=5.00x")
            .unwrap();
        assert_eq!(sample.percent, 25.0);
        assert_eq!(sample.position_secs, 25.0);
        assert_eq!(sample.eta_secs, 15.0);
        assert_eq!(sample.speed, "5x");
    }

    #[test]
    fn test_status_before_duration_is_ignored() {
        let mut tracker = ProgressTracker::default();
        assert!(tracker.feed("frame=   10 fps=0.0 time=00:00:01.00 speed=1x").is_none());
        assert!(tracker.feed("time=N/A bitrate=N/A speed=N/A").is_none());
    }

    #[test]
    fn test_missing_speed_defaults() {
        let mut tracker = ProgressTracker::default();
        tracker.feed("Duration: 00:00:10.00");
        let sample = tracker.feed("time=00:00:04.00").unwrap();
        assert_eq!(sample.speed, "1.0x");
        assert_eq!(sample.eta_secs, 6.0);
    }

    #[test]
    fn test_two_pass_bands() {
        let mut first = ProgressTracker::new(ProgressBand::for_pass(1));
        first.feed("Duration: 00:00:10.00");
        assert_eq!(first.feed("time=00:00:05.00").unwrap().percent, 25.0);
        assert_eq!(first.feed("time=00:00:10.00").unwrap().percent, 49.5);

        let mut second = ProgressTracker::new(ProgressBand::for_pass(2));
        second.feed("Duration: 00:00:10.00");
        assert_eq!(second.feed("time=00:00:00.00").unwrap().percent, 50.0);
        assert_eq!(second.feed("time=00:00:20.00").unwrap().percent, 99.5);
    }

    #[test]
    fn test_long_hours() {
        assert_eq!(parse_duration("Duration: 123:00:00.50"), Some(442_800.5));
        assert_eq!(parse_speed("speed=0.987x"), Some(0.987));
        assert_eq!(parse_position("time=N/A"), None);
    }
}
