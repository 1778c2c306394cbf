//! Run configuration: the validated form of the command line.
//!
//! [`RunConfig::validate`] enforces the limits below and normalizes offsets.
//! Values it had to adjust come back as warnings rather than errors.
//!
//! | Setting | Rule |
//! |---------|------|
//! | block size | multiple of 512, 512 ..= 16 MiB |
//! | start / end | rounded down to a sector (warning) |
//! | end | must lie beyond start |
//! | jump | 0 ..= 5 |
//! | gen / null / freshen | need `--write` |

use std::path::PathBuf;

use thiserror::Error;

use crate::backoff::JumpMode;
use crate::io_stream::device::OpenFlags;
use crate::io_stream::{EngineConfig, Session, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE};
use crate::progress::parse_size;
use crate::sector::SECTOR_SIZE;
use crate::worker::{Mode, WorkerOptions};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown mode '{0}' (expected dump, check, gen, null, read or freshen)")]
    UnknownMode(String),
    #[error("conflicting modes: {0} and {1}")]
    ConflictingModes(&'static str, &'static str),
    #[error("invalid {option} '{value}': {reason}")]
    Size { option: &'static str, value: String, reason: String },
    #[error("block size {0} must be a multiple of 512 between 512 and 16 MiB")]
    BlockSize(u64),
    #[error("jump mode {0} out of range 0-5")]
    JumpMode(u8),
    #[error("end {end} must lie beyond start {start}")]
    EmptyRange { start: u64, end: u64 },
    #[error("{0} mode overwrites the device; pass --write to confirm")]
    WriteNotConfirmed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub device:      PathBuf,
    pub mode:        Mode,
    pub block_size:  u64,
    pub start:       u64,
    pub end:         Option<u64>,
    /// Confirms a destructive mode.
    pub write:       bool,
    pub expand:      bool,
    pub jump:        u8,
    pub quiet:       bool,
    pub dump_errors: bool,
    /// Neither direct I/O nor synchronous writes.
    pub async_io:    bool,
    pub json:        bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            device:      PathBuf::new(),
            mode:        Mode::Dump,
            block_size:  DEFAULT_BLOCK_SIZE as u64,
            start:       0,
            end:         None,
            write:       false,
            expand:      false,
            jump:        0,
            quiet:       false,
            dump_errors: false,
            async_io:    false,
            json:        false,
        }
    }
}

impl RunConfig {
    /// Enforce limits and round offsets down to sectors.
    ///
    /// Returns one warning per adjusted value.
    pub fn validate(&mut self) -> Result<Vec<String>, ConfigError> {
        let mut warnings = Vec::new();
        let sector = SECTOR_SIZE as u64;

        let bs = self.block_size;
        if bs < sector || bs > MAX_BLOCK_SIZE as u64 || bs % sector != 0 {
            return Err(ConfigError::BlockSize(bs));
        }
        if JumpMode::from_selector(self.jump).is_none() {
            return Err(ConfigError::JumpMode(self.jump));
        }

        if self.start % sector != 0 {
            let rounded = self.start / sector * sector;
            warnings.push(format!("start {} rounded down to sector boundary {rounded}", self.start));
            self.start = rounded;
        }
        if let Some(end) = self.end {
            if end % sector != 0 {
                let rounded = end / sector * sector;
                warnings.push(format!("end {end} rounded down to sector boundary {rounded}"));
                self.end = Some(rounded);
            }
        }
        if let Some(end) = self.end {
            if end <= self.start {
                return Err(ConfigError::EmptyRange { start: self.start, end });
            }
        }

        if self.mode.is_destructive() && !self.write {
            return Err(ConfigError::WriteNotConfirmed(self.mode.name()));
        }
        Ok(warnings)
    }

    pub fn jump_mode(&self) -> JumpMode {
        JumpMode::from_selector(self.jump).unwrap_or_default()
    }

    /// Build the engine session; `run_timestamp` is stamped by gen only.
    pub fn session(&self, run_timestamp: u64) -> Session {
        let block_size = self.block_size as usize;
        Session {
            path:    self.device.clone(),
            mode:    self.mode,
            engine:  EngineConfig {
                block_size,
                start:         self.start,
                end:           self.end,
                jump:          self.jump_mode(),
                run_timestamp: (self.mode == Mode::Generate).then_some(run_timestamp),
            },
            options: WorkerOptions { expand: self.expand, dump_errors: self.dump_errors, block_size },
            flags:   OpenFlags { direct: !self.async_io, sync: !self.async_io },
        }
    }
}

/// Pick the mode from `--mode` and the shorthand flags; naming two
/// different modes is an error, repeating one is not.
pub fn resolve_mode(name: Option<&str>, shorthands: &[(bool, Mode)]) -> Result<Mode, ConfigError> {
    let mut chosen = match name {
        Some(n) => Some(Mode::from_name(n).ok_or_else(|| ConfigError::UnknownMode(n.to_owned()))?),
        None => None,
    };
    for &(set, mode) in shorthands {
        if !set {
            continue;
        }
        match chosen {
            Some(prev) if prev != mode => {
                return Err(ConfigError::ConflictingModes(prev.name(), mode.name()));
            }
            _ => chosen = Some(mode),
        }
    }
    Ok(chosen.unwrap_or(Mode::Dump))
}

/// Parse a size option such as `--bs 64k`.
pub fn parse_option_size(option: &'static str, value: &str) -> Result<u64, ConfigError> {
    parse_size(value).map_err(|reason| ConfigError::Size { option, value: value.to_owned(), reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: Mode) -> RunConfig {
        RunConfig { device: "/dev/sdx".into(), mode, ..RunConfig::default() }
    }

    #[test]
    fn offsets_round_down_with_warning() {
        let mut c = config(Mode::Check);
        c.start = 1000;
        c.end   = Some(4097);
        let warnings = c.validate().unwrap();
        assert_eq!(warnings.len(), 2);
        assert_eq!((c.start, c.end), (512, Some(4096)));
    }

    #[test]
    fn empty_range_is_rejected() {
        let mut c = config(Mode::Read);
        c.start = 4096;
        c.end   = Some(4100);
        assert_eq!(c.validate(), Err(ConfigError::EmptyRange { start: 4096, end: 4096 }));
    }

    #[test]
    fn block_size_limits() {
        for bs in [0, 511, 1000, 32 << 20] {
            let mut c = config(Mode::Read);
            c.block_size = bs;
            assert_eq!(c.validate(), Err(ConfigError::BlockSize(bs)));
        }
        let mut c = config(Mode::Read);
        c.block_size = 16 << 20;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn destructive_modes_need_confirmation() {
        for mode in [Mode::Generate, Mode::Null, Mode::Freshen] {
            let mut c = config(mode);
            assert_eq!(c.validate(), Err(ConfigError::WriteNotConfirmed(mode.name())));
            c.write = true;
            assert!(c.validate().is_ok());
        }
    }

    #[test]
    fn jump_selector_range() {
        let mut c = config(Mode::Check);
        c.jump = 6;
        assert_eq!(c.validate(), Err(ConfigError::JumpMode(6)));
        c.jump = 4;
        assert!(c.validate().is_ok());
        assert_eq!(c.jump_mode(), JumpMode::Doubling);
    }

    #[test]
    fn mode_resolution() {
        assert_eq!(resolve_mode(None, &[]), Ok(Mode::Dump));
        assert_eq!(resolve_mode(Some("generate"), &[(true, Mode::Generate)]), Ok(Mode::Generate));
        assert_eq!(
            resolve_mode(Some("check"), &[(true, Mode::Read)]),
            Err(ConfigError::ConflictingModes("check", "read"))
        );
        assert!(matches!(resolve_mode(Some("wipe"), &[]), Err(ConfigError::UnknownMode(_))));
    }

    #[test]
    fn session_stamps_gen_only() {
        let mut c = config(Mode::Generate);
        c.write = true;
        c.async_io = true;
        let s = c.session(42);
        assert_eq!(s.engine.run_timestamp, Some(42));
        assert!(!s.flags.direct && !s.flags.sync);
        assert_eq!(config(Mode::Check).session(42).engine.run_timestamp, None);
    }

    #[test]
    fn size_option_errors_name_the_option() {
        let err = parse_option_size("--bs", "12Q").unwrap_err();
        assert!(err.to_string().starts_with("invalid --bs '12Q'"));
    }
}
