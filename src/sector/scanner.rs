//! Signature scanner: locate the embedded [`Signature`](super::Signature)
//! inside an opaque sector.
//!
//! The scanner does not assume the signature sits where the codec would have
//! put it: the expected offset depends on the *claimed* sector number, which
//! is only known after the signature has been found and parsed.  Instead it
//! probes every start offset at which a minimal signature still fits, looking
//! for the 8-byte magic.
//!
//! Scanning starts at a rotating hint and wraps around the window.  Because
//! the codec moves the signature one byte per sector, the hint is advanced to
//! `hit + 1` after every match, which makes the common case a single probe.

use super::{MAGIC, MIN_SIGNATURE_LEN, SECTOR_SIZE};

/// Number of candidate start offsets in a full sector.
pub const SCAN_WINDOW: usize = SECTOR_SIZE - MIN_SIGNATURE_LEN + 1;

#[derive(Debug, Clone, Default)]
pub struct SignatureScanner {
    hint: usize,
}

impl SignatureScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start scanning at `hint` (taken modulo the window).
    pub fn with_hint(hint: usize) -> Self {
        Self { hint: hint % SCAN_WINDOW }
    }

    pub fn hint(&self) -> usize {
        self.hint
    }

    /// Offset of the first magic found, probing from the hint and wrapping.
    pub fn find(&mut self, sector: &[u8]) -> Option<usize> {
        if sector.len() < MIN_SIGNATURE_LEN {
            return None;
        }
        let window = (sector.len() - MIN_SIGNATURE_LEN + 1).min(SCAN_WINDOW);
        let mut pos = self.hint % window;
        for _ in 0..window {
            if sector[pos..].starts_with(MAGIC) {
                self.hint = (pos + 1) % SCAN_WINDOW;
                return Some(pos);
            }
            pos = (pos + 1) % window;
        }
        None
    }
}
