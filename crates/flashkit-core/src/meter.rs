//! Throughput and ETA measurement
//!
//! [`RateMeter`] is a pass-through stage. The data path only bumps an atomic
//! byte counter; a timer thread samples that counter on a fixed interval,
//! keeps its own rolling speed window and hands [`ProgressSample`]s to the
//! registered callback.

use crate::block::Block;
use crate::error::Result;
use crate::stage::Stage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// ============================================================================
// Constants
// ============================================================================

/// Span of history used for the current speed estimate
pub const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// ETA reported when no finite estimate exists
pub const ETA_UNBOUNDED: u64 = u64::MAX;

/// Callback invoked from the timer thread with each sample
pub type ProgressCallback = Arc<dyn Fn(&ProgressSample) + Send + Sync>;

// ============================================================================
// Progress Sample
// ============================================================================

/// Which pass a sample belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    /// Writing the source to the target
    Write,
    /// Reading the target back
    Verify,
}

impl std::fmt::Display for ProgressKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressKind::Write => write!(f, "write"),
            ProgressKind::Verify => write!(f, "verify"),
        }
    }
}

/// Snapshot of transfer progress
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSample {
    /// Pass being measured
    pub kind: ProgressKind,

    /// `transferred / length * 100`; can exceed 100 when the length was an estimate
    pub percentage: f64,

    /// Bytes seen so far
    pub transferred: u64,

    /// Expected total bytes
    pub length: u64,

    /// `length - transferred`; negative once an estimate is overrun
    pub remaining: i64,

    /// Current speed over the rolling window, bytes per second
    pub speed: f64,

    /// Average speed since the meter started, bytes per second
    pub avg_speed: f64,

    /// Change in `speed` since the previous sample
    pub delta: f64,

    /// Seconds until done, or [`ETA_UNBOUNDED`]
    pub eta_seconds: u64,

    /// Time since the meter started
    pub runtime: Duration,
}

impl ProgressSample {
    /// Build a sample from raw counters
    pub fn compute(
        kind: ProgressKind,
        transferred: u64,
        length: u64,
        speed: f64,
        previous_speed: f64,
        runtime: Duration,
    ) -> Self {
        let speed = if speed.is_finite() { speed.max(0.0) } else { 0.0 };

        let percentage = if length == 0 {
            100.0
        } else {
            transferred as f64 / length as f64 * 100.0
        };

        let remaining = length as i64 - transferred as i64;

        let eta_seconds = if remaining <= 0 {
            0
        } else if speed <= 0.0 {
            ETA_UNBOUNDED
        } else {
            let eta = (remaining as f64 / speed).ceil();
            if eta.is_finite() && eta < u64::MAX as f64 {
                eta as u64
            } else {
                ETA_UNBOUNDED
            }
        };

        let elapsed = runtime.as_secs_f64();
        let avg_speed = if elapsed > 0.0 {
            transferred as f64 / elapsed
        } else {
            0.0
        };

        Self {
            kind,
            percentage,
            transferred,
            length,
            remaining,
            speed,
            avg_speed,
            delta: speed - previous_speed,
            eta_seconds,
            runtime,
        }
    }

    /// Whether the ETA is a real estimate
    pub fn has_eta(&self) -> bool {
        self.eta_seconds != ETA_UNBOUNDED
    }

    /// Current speed rendered for display
    pub fn speed_display(&self) -> String {
        format_speed(self.speed as u64)
    }

    /// ETA rendered for display
    pub fn eta_display(&self) -> String {
        if self.has_eta() {
            format_duration(self.eta_seconds)
        } else {
            "calculating...".to_string()
        }
    }
}

// ============================================================================
// Speed Window
// ============================================================================

/// Rolling window of `(instant, total bytes)` samples
#[derive(Debug)]
pub struct SpeedWindow {
    span: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedWindow {
    /// Create a window covering `span`
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            samples: VecDeque::new(),
        }
    }

    /// Record the running total at `now`
    pub fn update(&mut self, now: Instant, total: u64) {
        self.samples.push_back((now, total));
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > self.span && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second between the oldest and newest sample
    pub fn speed(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };

        let elapsed = last.0.duration_since(first.0).as_secs_f64();
        if elapsed > 0.0 {
            last.1.saturating_sub(first.1) as f64 / elapsed
        } else {
            0.0
        }
    }
}

// ============================================================================
// Rate Meter
// ============================================================================

struct Timer {
    /// `true` asks for one final sample before exiting
    stop: mpsc::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Pass-through stage that reports throughput on a timer
pub struct RateMeter {
    kind: ProgressKind,
    length: u64,
    interval: Duration,
    callback: Option<ProgressCallback>,
    transferred: Arc<AtomicU64>,
    timer: Option<Timer>,
    finished: bool,
}

impl RateMeter {
    /// Create a meter measuring against `length` bytes
    pub fn new(kind: ProgressKind, length: u64, interval: Duration) -> Self {
        Self {
            kind,
            length,
            interval,
            callback: None,
            transferred: Arc::new(AtomicU64::new(0)),
            timer: None,
            finished: false,
        }
    }

    /// Set the sample callback
    pub fn on_sample(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Bytes observed so far
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    /// Count `bytes` as transferred, starting the timer on first use
    pub fn observe(&mut self, bytes: u64) {
        if self.finished {
            return;
        }
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
        if self.timer.is_none() {
            self.start();
        }
    }

    /// Stop the timer after one final sample
    pub fn finish(&mut self) {
        self.finished = true;
        self.stop(true);
    }

    fn start(&mut self) {
        let Some(callback) = self.callback.clone() else {
            return;
        };

        let (stop, stop_rx) = mpsc::channel::<bool>();
        let kind = self.kind;
        let length = self.length;
        let interval = self.interval;
        let transferred = Arc::clone(&self.transferred);

        let handle = std::thread::spawn(move || {
            let started = Instant::now();
            let mut window = SpeedWindow::new(SPEED_WINDOW);
            let mut previous_speed = 0.0;

            let mut emit = |window: &mut SpeedWindow| {
                let now = Instant::now();
                let total = transferred.load(Ordering::Relaxed);
                window.update(now, total);
                let speed = window.speed();
                let sample = ProgressSample::compute(
                    kind,
                    total,
                    length,
                    speed,
                    previous_speed,
                    now.duration_since(started),
                );
                previous_speed = sample.speed;
                callback(&sample);
            };

            emit(&mut window);
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => emit(&mut window),
                    Ok(true) => {
                        emit(&mut window);
                        break;
                    }
                    Ok(false) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        tracing::debug!("{} rate meter started ({} bytes expected)", kind, length);
        self.timer = Some(Timer { stop, handle });
    }

    fn stop(&mut self, final_sample: bool) {
        if let Some(timer) = self.timer.take() {
            let _ = timer.stop.send(final_sample);
            if timer.handle.join().is_err() {
                tracing::warn!("{} rate meter timer panicked", self.kind);
            }
        }
    }
}

impl Stage for RateMeter {
    fn name(&self) -> &'static str {
        "rate-meter"
    }

    fn consume(&mut self, block: Block, out: &mut Vec<Block>) -> Result<()> {
        self.observe(block.len() as u64);
        out.push(block);
        Ok(())
    }

    fn flush(&mut self, _out: &mut Vec<Block>) -> Result<()> {
        self.finish();
        Ok(())
    }
}

impl Drop for RateMeter {
    fn drop(&mut self) {
        self.stop(false);
    }
}

// ============================================================================
// Formatting
// ============================================================================

/// Format speed for display
pub fn format_speed(bytes_per_second: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match bytes_per_second {
        b if b >= GB => format!("{:.1} GB/s", b as f64 / GB as f64),
        b if b >= MB => format!("{:.1} MB/s", b as f64 / MB as f64),
        b if b >= KB => format!("{:.1} KB/s", b as f64 / KB as f64),
        b => format!("{} B/s", b),
    }
}

/// Format a number of seconds for display
pub fn format_duration(seconds: u64) -> String {
    match seconds {
        s if s >= 3600 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        s if s >= 60 => format!("{}m {}s", s / 60, s % 60),
        s => format!("{}s", s),
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
