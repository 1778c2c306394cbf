//! Cooperative progress line and scaled-unit helpers.
//!
//! [`Progress::tick`] is called by the engine between blocks; it prints at
//! most once per interval and never interrupts a transfer.

use std::io::Write;
use std::time::{Duration, Instant};

use crate::state::ScanState;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

pub struct Progress {
    mode:     &'static str,
    started:  Instant,
    last:     Instant,
    interval: Duration,
    quiet:    bool,
    printed:  bool,
}

impl Progress {
    pub fn new(mode: &'static str, quiet: bool) -> Self {
        Self::with_interval(mode, quiet, DEFAULT_INTERVAL)
    }

    pub fn with_interval(mode: &'static str, quiet: bool, interval: Duration) -> Self {
        let now = Instant::now();
        Self { mode, started: now, last: now, interval, quiet, printed: false }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Render the progress line if the interval has passed.
    pub fn tick(&mut self, state: &ScanState) {
        if self.quiet || self.last.elapsed() < self.interval {
            return;
        }
        self.last = Instant::now();
        let line = self.line(state);
        let mut err = std::io::stderr().lock();
        // Progress output is best effort.
        let _ = write!(err, "{line}\r");
        let _ = err.flush();
        self.printed = true;
    }

    /// Terminate the progress line so later output starts on a fresh line.
    pub fn finish(&mut self) {
        if self.printed {
            eprintln!();
            self.printed = false;
        }
    }

    /// `m:ss mode sector MiB errors`.
    pub fn line(&self, state: &ScanState) -> String {
        let secs = self.elapsed().as_secs();
        format!(
            "{}:{:02} {} {} {}MB {}",
            secs / 60,
            secs % 60,
            self.mode,
            state.sector_number,
            state.byte_position >> 20,
            state.error_count,
        )
    }
}

// ── Units ────────────────────────────────────────────────────────────────────

const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// `1536` → `"1.50 KiB"`.
pub fn format_scaled(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Parse a byte count with an optional `B K M G T` suffix (binary units).
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    if num.is_empty() {
        return Err(format!("missing number in '{s}'"));
    }
    let n: u64 = num.parse().map_err(|_| format!("invalid number '{num}'"))?;
    let shift = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B"           => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        "T" | "TB" | "TIB" => 40,
        other => return Err(format!("unknown size suffix '{other}'")),
    };
    n.checked_mul(1u64 << shift).ok_or_else(|| format!("size '{s}' overflows"))
}
