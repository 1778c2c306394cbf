//! Run outcome: failure-category bitmask, fatal error taxonomy, run summary.
//!
//! # Categories
//!
//! | Flag | Bit | Raised by | Fatal |
//! |------|-----|-----------|-------|
//! | `PARAMETER` | 0 | bad arguments, open failure | yes |
//! | `SEEK` | 1 | positioning failure | yes |
//! | `READ` | 2 | device read error (after backoff, or close) | only without retry |
//! | `WRITE` | 3 | device write error | yes |
//! | `MISMATCH` | 4 | any per-sector verification error | no |
//! | `SHORT` | 5 | transfer not a multiple of the sector size | yes |
//! | `TIMESTAMP` | 6 | signature timestamp older than the run's | no |
//!
//! The union of all raised flags is the process exit code.  An internal
//! consistency failure is not a device outcome and exits with
//! [`INTERNAL_EXIT_CODE`] instead.

use std::io;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::ScanState;

/// Exit code of a run aborted by a bookkeeping bug.
pub const INTERNAL_EXIT_CODE: u8 = 128;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ResultFlags: u8 {
        const PARAMETER = 1 << 0;
        const SEEK      = 1 << 1;
        const READ      = 1 << 2;
        const WRITE     = 1 << 3;
        const MISMATCH  = 1 << 4;
        const SHORT     = 1 << 5;
        const TIMESTAMP = 1 << 6;
    }
}

// ── Fatal errors ─────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid parameter: {0}")]
    Parameter(String),
    #[error("cannot open {path}: {source}")]
    Open { path: String, #[source] source: io::Error },
    #[error("cannot seek to {position}: {source}")]
    Seek { position: u64, #[source] source: io::Error },
    #[error("read error at sector {sector} (pos={position}): {source}")]
    Read { sector: u64, position: u64, #[source] source: io::Error },
    #[error("write error at sector {sector} (pos={position}): {source}")]
    Write { sector: u64, position: u64, #[source] source: io::Error },
    /// A transfer that is not a whole number of sectors.
    #[error("partial sector transfer of {len} bytes at sector {sector} (pos={position})")]
    ShortTransfer { sector: u64, position: u64, len: usize },
    /// Worker counters out of step with the bytes it was handed.
    #[error(
        "internal consistency failure: expected pos={expected_position} sector={expected_sector}, \
         found pos={actual_position} sector={actual_sector}"
    )]
    Bookkeeping {
        expected_position: u64,
        expected_sector:   u64,
        actual_position:   u64,
        actual_sector:     u64,
    },
    #[error("cannot write output: {0}")]
    Output(#[from] io::Error),
}

impl EngineError {
    /// The failure category this error contributes to the run outcome.
    pub fn flag(&self) -> ResultFlags {
        match self {
            EngineError::Parameter(_) | EngineError::Open { .. } => ResultFlags::PARAMETER,
            EngineError::Seek { .. }          => ResultFlags::SEEK,
            EngineError::Read { .. }          => ResultFlags::READ,
            EngineError::Write { .. }         => ResultFlags::WRITE,
            EngineError::ShortTransfer { .. } => ResultFlags::SHORT,
            EngineError::Bookkeeping { .. } | EngineError::Output(_) => ResultFlags::empty(),
        }
    }

    /// `true` for failures that indicate a bug or a broken output sink
    /// rather than a device problem.
    pub fn is_internal(&self) -> bool {
        matches!(self, EngineError::Bookkeeping { .. } | EngineError::Output(_))
    }
}

// ── Run report ───────────────────────────────────────────────────────────────

/// Final state of one engine pass.
#[derive(Debug)]
pub struct RunReport {
    pub state: ScanState,
    /// The fatal error that ended the run, if any.
    pub error: Option<EngineError>,
}

impl RunReport {
    pub fn flags(&self) -> ResultFlags {
        let fatal = self.error.as_ref().map(EngineError::flag).unwrap_or_default();
        self.state.result_flags | fatal
    }

    pub fn exit_code(&self) -> u8 {
        match &self.error {
            Some(e) if e.is_internal() => INTERNAL_EXIT_CODE,
            _ => self.flags().bits(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.error.is_none() && self.flags().is_empty()
    }
}

/// Human- and machine-readable digest of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub mode:            String,
    pub device:          String,
    pub elapsed_secs:    f64,
    pub start_position:  u64,
    pub end_position:    u64,
    pub sectors:         u64,
    pub bytes:           u64,
    pub skipped_bytes:   u64,
    pub errors:          u64,
    pub flags:           ResultFlags,
    pub fatal:           Option<String>,
    pub exit_code:       u8,
}

impl RunSummary {
    pub fn new(mode: &str, device: &str, start: u64, report: &RunReport, elapsed_secs: f64) -> Self {
        let st    = &report.state;
        let bytes = st.byte_position.saturating_sub(start).saturating_sub(st.skipped_bytes);
        Self {
            mode:           mode.to_owned(),
            device:         device.to_owned(),
            elapsed_secs,
            start_position: start,
            end_position:   st.byte_position,
            sectors:        bytes / crate::sector::SECTOR_SIZE as u64,
            bytes,
            skipped_bytes:  st.skipped_bytes,
            errors:         st.error_count,
            flags:          report.flags(),
            fatal:          report.error.as_ref().map(ToString::to_string),
            exit_code:      report.exit_code(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Multi-line text form for terminals.
    pub fn to_text(&self) -> String {
        let secs = self.elapsed_secs.max(0.0) as u64;
        let rate = if self.elapsed_secs > 0.0 {
            self.bytes as f64 / self.elapsed_secs
        } else {
            0.0
        };
        let mut s = format!(
            "{} {}: {} sectors ({}) in {}:{:02} ({}/s), {} error(s)",
            self.mode,
            self.device,
            self.sectors,
            crate::progress::format_scaled(self.bytes),
            secs / 60,
            secs % 60,
            crate::progress::format_scaled(rate as u64),
            self.errors,
        );
        if self.skipped_bytes > 0 {
            s.push_str(&format!(
                "\n  skipped {} after read errors",
                crate::progress::format_scaled(self.skipped_bytes),
            ));
        }
        if !self.flags.is_empty() {
            s.push_str(&format!("\n  outcome: {}", flag_names(self.flags)));
        }
        if let Some(fatal) = &self.fatal {
            s.push_str(&format!("\n  aborted: {fatal}"));
        }
        s
    }
}

fn flag_names(flags: ResultFlags) -> String {
    flags
        .iter_names()
        .map(|(name, _)| name.to_lowercase())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors_map_to_one_flag() {
        let io = || io::Error::new(io::ErrorKind::Other, "boom");
        assert_eq!(EngineError::Parameter("x".into()).flag(), ResultFlags::PARAMETER);
        assert_eq!(EngineError::Seek { position: 0, source: io() }.flag(), ResultFlags::SEEK);
        assert_eq!(
            EngineError::Read { sector: 1, position: 512, source: io() }.flag(),
            ResultFlags::READ,
        );
        assert_eq!(
            EngineError::ShortTransfer { sector: 3, position: 1536, len: 256 }.flag(),
            ResultFlags::SHORT,
        );
        assert!(EngineError::Output(io()).is_internal());
    }

    #[test]
    fn exit_code_is_flag_union_unless_internal() {
        let mut state = ScanState::new(0, None);
        state.result_flags = ResultFlags::MISMATCH | ResultFlags::TIMESTAMP;
        let report = RunReport {
            state,
            error: Some(EngineError::Write {
                sector: 0,
                position: 0,
                source: io::Error::new(io::ErrorKind::Other, "eio"),
            }),
        };
        assert_eq!(report.exit_code(), 0b101_1000);

        let internal = RunReport {
            state: ScanState::new(0, None),
            error: Some(EngineError::Bookkeeping {
                expected_position: 512,
                expected_sector: 1,
                actual_position: 0,
                actual_sector: 0,
            }),
        };
        assert_eq!(internal.exit_code(), INTERNAL_EXIT_CODE);
    }

    #[test]
    fn summary_counts_exclude_skipped_bytes() {
        let mut state = ScanState::new(1024, None);
        state.byte_position = 1024 + 8192;
        state.skipped_bytes = 4096;
        state.result_flags = ResultFlags::READ;
        let report = RunReport { state, error: None };
        let summary = RunSummary::new("check", "/dev/null", 1024, &report, 2.0);
        assert_eq!(summary.bytes, 4096);
        assert_eq!(summary.sectors, 8);
        assert_eq!(summary.exit_code, ResultFlags::READ.bits());
        let text = summary.to_text();
        assert!(text.contains("outcome: read"));
        assert!(text.contains("skipped 4.00 KiB"));
        assert!(summary.to_json().unwrap().contains("\"skipped_bytes\": 4096"));
    }
}
