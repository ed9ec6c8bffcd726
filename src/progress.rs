// src/progress.rs

//! Progress reporting for the pipeline
//!
//! The pipeline owns a single [`Progress`] value on a 0 to 100 scale that
//! never moves backwards. Each stage is given a [`ProgressRange`] and maps its
//! own fractional progress into that range. Every change is forwarded to a
//! [`ProgressSink`], which decides how to present it:
//!
//! - `CliProgress`: an indicatif progress bar for interactive use
//! - `LogProgress`: tracing events at coarse intervals
//! - `JsonProgress`: one JSON object per line for a supervising process
//! - `MemoryProgress`: keeps every event, for embedding and tests
//! - `SilentProgress`: no output

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;
use tracing::{error, info, warn};

/// A sub-range of the 0 to 100 scale assigned to one stage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressRange {
    pub start: f64,
    pub end: f64,
}

impl ProgressRange {
    pub const fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Map a fraction of this stage onto the overall scale
    pub fn at(&self, fraction: f64) -> f64 {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        self.start + (self.end - self.start) * fraction
    }

    /// Map `done` out of `total`; an unknown or zero total maps to the start
    pub fn ratio(&self, done: u64, total: Option<u64>) -> f64 {
        match total {
            Some(total) if total > 0 => self.at(done as f64 / total as f64),
            _ => self.start,
        }
    }
}

/// Monotonic overall progress, clamped to [0, 100]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Progress {
    value: f64,
}

impl Progress {
    pub const MAX: f64 = 100.0;

    pub fn new() -> Self {
        Self::default()
    }

    /// Move forward to `value`; returns false if that would not advance
    pub fn advance(&mut self, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        let value = value.clamp(0.0, Self::MAX);
        if value > self.value {
            self.value = value;
            true
        } else {
            false
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Whole percent, rounded down
    pub fn percent(&self) -> u8 {
        self.value.floor() as u8
    }
}

/// Receives overall progress updates
///
/// Implementations must be thread-safe (Send + Sync).
pub trait ProgressSink: Send + Sync {
    /// Overall progress moved to `percent` while doing `message`
    fn report(&self, percent: f64, message: &str);

    /// The run completed successfully
    fn finish(&self, message: &str);

    /// The run aborted
    fn fail(&self, message: &str);
}

/// Silent progress sink (no-op)
///
/// Use this for quiet mode or scripted usage.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn report(&self, _percent: f64, _message: &str) {}
    fn finish(&self, _message: &str) {}
    fn fail(&self, _message: &str) {}
}

/// Logging progress sink
///
/// Logs at info level whenever the message changes or the percentage
/// crosses another `step`.
#[derive(Debug)]
pub struct LogProgress {
    step: u8,
    last: Mutex<(u8, String)>,
}

impl Default for LogProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl LogProgress {
    pub fn new() -> Self {
        Self {
            step: 5,
            last: Mutex::new((0, String::new())),
        }
    }

    /// Set the logging step in percent
    pub fn with_step(mut self, step: u8) -> Self {
        self.step = step.max(1);
        self
    }
}

impl ProgressSink for LogProgress {
    fn report(&self, percent: f64, message: &str) {
        let whole = percent.floor() as u8;
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let crossed = whole / self.step > last.0 / self.step;
        if crossed || last.1 != message {
            info!("[{:>3}%] {}", whole, message);
            *last = (whole, message.to_string());
        }
    }

    fn finish(&self, message: &str) {
        info!("[100%] {}", message);
    }

    fn fail(&self, message: &str) {
        error!("Aborted: {}", message);
    }
}

/// Interactive progress bar
pub struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .map(|style| style.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self { bar }
    }
}

impl Default for CliProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for CliProgress {
    fn report(&self, percent: f64, message: &str) {
        self.bar.set_position(percent.floor() as u64);
        self.bar.set_message(message.to_string());
    }

    fn finish(&self, message: &str) {
        self.bar.set_position(100);
        self.bar.finish_with_message(message.to_string());
    }

    fn fail(&self, message: &str) {
        self.bar.abandon_with_message(format!("FAILED: {}", message));
    }
}

/// One line of machine-readable progress output
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressEvent {
    pub event: &'static str,
    pub percent: f64,
    pub message: String,
}

/// Writes each event as a JSON line
///
/// Meant for a supervising installer reading our stdout.
pub struct JsonProgress {
    out: Mutex<Box<dyn Write + Send>>,
    last_percent: Mutex<f64>,
}

impl JsonProgress {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            last_percent: Mutex::new(0.0),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    fn emit(&self, event: ProgressEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode progress event: {}", e);
                return;
            }
        };
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(out, "{}", line).and_then(|()| out.flush()) {
            warn!("Failed to write progress event: {}", e);
        }
    }
}

impl ProgressSink for JsonProgress {
    fn report(&self, percent: f64, message: &str) {
        *self.last_percent.lock().unwrap_or_else(|e| e.into_inner()) = percent;
        self.emit(ProgressEvent {
            event: "progress",
            percent,
            message: message.to_string(),
        });
    }

    fn finish(&self, message: &str) {
        self.emit(ProgressEvent {
            event: "finished",
            percent: Progress::MAX,
            message: message.to_string(),
        });
    }

    fn fail(&self, message: &str) {
        let percent = *self.last_percent.lock().unwrap_or_else(|e| e.into_inner());
        self.emit(ProgressEvent {
            event: "failed",
            percent,
            message: message.to_string(),
        });
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl MemoryProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events so far
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Reported percentages, in order
    pub fn percents(&self) -> Vec<f64> {
        self.events().iter().map(|e| e.percent).collect()
    }

    fn push(&self, event: &'static str, percent: f64, message: &str) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ProgressEvent {
                event,
                percent,
                message: message.to_string(),
            });
    }
}

impl ProgressSink for MemoryProgress {
    fn report(&self, percent: f64, message: &str) {
        self.push("progress", percent, message);
    }

    fn finish(&self, message: &str) {
        self.push("finished", Progress::MAX, message);
    }

    fn fail(&self, message: &str) {
        let last = self.percents().last().copied().unwrap_or(0.0);
        self.push("failed", last, message);
    }
}
