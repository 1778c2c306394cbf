//! Rolling scan cursor and per-run counters.

use serde::Serialize;

use crate::outcome::ResultFlags;
use crate::sector::SECTOR_SIZE;

/// Verification error classes; consecutive sectors with the same class are
/// reported once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum VerifyKind {
    MissingSignature,
    MalformedNumber,
    MalformedTimestamp,
    /// Claimed number differs and the data does not match it either.
    NumberMismatch,
    /// A valid sector for another number (misplaced or stale data).
    MisplacedSector,
    DataMismatch,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanState {
    pub sector_number:   u64,
    pub byte_position:   u64,
    pub end_position:    Option<u64>,
    pub error_count:     u64,
    pub last_error_kind: Option<VerifyKind>,
    pub result_flags:    ResultFlags,
    /// Write passes: the run's timestamp.  Check passes: the last consistent
    /// timestamp seen on the device.
    pub run_timestamp:   Option<u64>,
    /// Bytes jumped over by read-error backoff.
    pub skipped_bytes:   u64,
}

impl ScanState {
    /// `start` must be sector aligned.
    pub fn new(start: u64, end_position: Option<u64>) -> Self {
        Self {
            sector_number: start / SECTOR_SIZE as u64,
            byte_position: start,
            end_position,
            ..Self::default()
        }
    }

    /// Move the cursor forward over `bytes` processed bytes.
    #[inline]
    pub fn advance(&mut self, bytes: usize) {
        self.byte_position += bytes as u64;
        self.sector_number += (bytes / SECTOR_SIZE) as u64;
    }

    /// Undo `bytes` that were counted but never reached the device.
    pub fn rewind(&mut self, bytes: usize) {
        self.byte_position -= bytes as u64;
        self.sector_number -= (bytes / SECTOR_SIZE) as u64;
    }

    /// Skip `bytes` without processing them.
    pub fn jump(&mut self, bytes: u64) {
        self.byte_position += bytes;
        self.sector_number += bytes / SECTOR_SIZE as u64;
        self.skipped_bytes += bytes;
    }

    /// Length of the next transfer: one block, clamped to the end bound.
    pub fn next_len(&self, block_size: usize) -> usize {
        match self.end_position {
            Some(end) if end <= self.byte_position => 0,
            Some(end) => (end - self.byte_position).min(block_size as u64) as usize,
            None => block_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_arithmetic() {
        let mut st = ScanState::new(4096, Some(4096 + 3 * 512));
        assert_eq!(st.sector_number, 8);
        assert_eq!(st.next_len(1024), 1024);
        st.advance(1024);
        assert_eq!((st.byte_position, st.sector_number), (5120, 10));
        assert_eq!(st.next_len(1024), 512);
        st.rewind(512);
        assert_eq!((st.byte_position, st.sector_number), (4608, 9));
        st.jump(2048);
        assert_eq!(st.next_len(1024), 0);
        assert_eq!(st.skipped_bytes, 2048);
    }
}
