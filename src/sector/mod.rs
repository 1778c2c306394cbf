//! Sector content codec: deterministic, self-describing sector patterns.
//!
//! # Layout
//!
//! Every 512-byte sector written by `gen` mode is a pure function of its
//! sector number and the run timestamp:
//!
//! 1. The textual [`Signature`] `[DISKUS <nr:016x> <ts>]` is hashed with MD5.
//! 2. The 16-byte digest is tiled across the whole sector.
//! 3. A position sweep XORs `i` into byte `i` and into byte `511 - i` for
//!    `i in 0..256`, so no two 16-byte lines of a sector are identical.
//! 4. The signature itself is copied verbatim to
//!    `nr mod (512 - signature_len + 1)`.
//!
//! The rotating offset keeps the signature from sitting in a fixed byte
//! column, so a device that shifts or duplicates data cannot produce a sector
//! that looks right by accident.
//!
//! # Wire format
//! The signature is plain ASCII and bit-exact across versions:
//! `"[DISKUS "` (8 bytes) + 16 lowercase hex digits + `" "` + decimal
//! timestamp + `"]"`.  It is between [`MIN_SIGNATURE_LEN`] and
//! [`MAX_SIGNATURE_LEN`] bytes long.

pub mod scanner;

use md5::{Digest, Md5};
use thiserror::Error;

pub use scanner::SignatureScanner;

/// Size of the addressing and verification unit.
pub const SECTOR_SIZE: usize = 512;
/// Fixed prefix of every signature.
pub const MAGIC: &[u8; 8] = b"[DISKUS ";
/// `"[DISKUS "` + 16 hex + `" "` + one digit + `"]"`.
pub const MIN_SIGNATURE_LEN: usize = MAGIC.len() + 16 + 1 + 1 + 1;
/// Longest possible signature: the timestamp is a `u64` (20 digits).
pub const MAX_SIGNATURE_LEN: usize = MAGIC.len() + 16 + 1 + 20 + 1;

const DIGEST_LEN: usize = 16;
const HEX_DIGITS: usize = 16;
const MAX_DECIMAL_DIGITS: usize = 20;

/// One sector's worth of bytes.
pub type Sector = [u8; SECTOR_SIZE];

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature magic not present")]
    MissingMagic,
    /// Field 1: the hexadecimal sector number.
    #[error("malformed sector number field")]
    MalformedNumber,
    /// Field 2: the decimal run timestamp and the closing bracket.
    #[error("malformed timestamp field")]
    MalformedTimestamp,
}

// ── Signature ────────────────────────────────────────────────────────────────

/// Identity record embedded in every generated sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature {
    pub sector_number: u64,
    pub timestamp:     u64,
}

impl Signature {
    pub fn new(sector_number: u64, timestamp: u64) -> Self {
        Self { sector_number, timestamp }
    }

    /// Serialize to the on-disk ASCII form.
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("[DISKUS {:016x} {}]", self.sector_number, self.timestamp).into_bytes()
    }

    /// Parse a signature that starts at `bytes[0]`.
    ///
    /// Returns the signature and the number of bytes it occupies (up to and
    /// including the closing `]`).  Trailing bytes are ignored, so the caller
    /// may pass the remainder of a sector.
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), SignatureError> {
        if !bytes.starts_with(MAGIC) {
            return Err(SignatureError::MissingMagic);
        }
        let mut pos = MAGIC.len();

        // Field 1: hex sector number terminated by a single space.
        let digits = count_while(&bytes[pos..], |b| b.is_ascii_hexdigit());
        if digits == 0 || digits > HEX_DIGITS || bytes.get(pos + digits) != Some(&b' ') {
            return Err(SignatureError::MalformedNumber);
        }
        let sector_number = parse_ascii(&bytes[pos..pos + digits], 16)
            .ok_or(SignatureError::MalformedNumber)?;
        pos += digits + 1;

        // Field 2: decimal timestamp terminated by `]`.
        let digits = count_while(&bytes[pos..], |b| b.is_ascii_digit());
        if digits == 0 || digits > MAX_DECIMAL_DIGITS || bytes.get(pos + digits) != Some(&b']') {
            return Err(SignatureError::MalformedTimestamp);
        }
        let timestamp = parse_ascii(&bytes[pos..pos + digits], 10)
            .ok_or(SignatureError::MalformedTimestamp)?;
        pos += digits + 1;

        Ok((Self { sector_number, timestamp }, pos))
    }
}

fn count_while(bytes: &[u8], pred: impl Fn(u8) -> bool) -> usize {
    bytes.iter().take_while(|&&b| pred(b)).count()
}

fn parse_ascii(digits: &[u8], radix: u32) -> Option<u64> {
    let s = std::str::from_utf8(digits).ok()?;
    u64::from_str_radix(s, radix).ok()
}

// ── Codec ────────────────────────────────────────────────────────────────────

/// Byte offset at which a signature of `signature_len` bytes is embedded in
/// sector `sector_number`.
#[inline]
pub fn signature_offset(sector_number: u64, signature_len: usize) -> usize {
    let slots = (SECTOR_SIZE - signature_len.min(SECTOR_SIZE) + 1) as u64;
    (sector_number % slots) as usize
}

/// Derive the expected contents of sector `sector_number` for `identity`.
pub fn generate(sector_number: u64, identity: &[u8]) -> Sector {
    let mut sector = [0u8; SECTOR_SIZE];
    generate_into(sector_number, identity, &mut sector);
    sector
}

/// Like [`generate`], writing into the first [`SECTOR_SIZE`] bytes of `out`.
///
/// # Panics
/// If `out` is shorter than one sector.
pub fn generate_into(sector_number: u64, identity: &[u8], out: &mut [u8]) {
    let out = &mut out[..SECTOR_SIZE];
    let identity = &identity[..identity.len().min(SECTOR_SIZE)];

    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&Md5::digest(identity));
    for line in out.chunks_exact_mut(DIGEST_LEN) {
        line.copy_from_slice(&digest);
    }
    for i in 0..SECTOR_SIZE / 2 {
        out[i]                   ^= i as u8;
        out[SECTOR_SIZE - 1 - i] ^= i as u8;
    }

    let off = signature_offset(sector_number, identity.len());
    out[off..off + identity.len()].copy_from_slice(identity);
}

/// `true` if `sector` is exactly what [`generate`] yields for the inputs.
pub fn verify(sector_number: u64, identity: &[u8], sector: &[u8]) -> bool {
    sector.len() == SECTOR_SIZE && generate(sector_number, identity)[..] == *sector
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_ID: &[u8] = b"[DISKUS 0000000000000010 1700000000]";

    #[test]
    fn signature_wire_format() {
        let sig = Signature::new(0x10, 1_700_000_000);
        assert_eq!(sig.to_bytes(), SAMPLE_ID);
        assert_eq!(Signature::new(0, 0).to_bytes().len(), MIN_SIGNATURE_LEN);
        assert_eq!(Signature::new(u64::MAX, u64::MAX).to_bytes().len(), MAX_SIGNATURE_LEN);
    }

    #[test]
    fn parse_reads_both_fields_and_length() {
        let mut buf = SAMPLE_ID.to_vec();
        buf.extend_from_slice(b"trailing garbage");
        let (sig, len) = Signature::parse(&buf).unwrap();
        assert_eq!(sig, Signature::new(0x10, 1_700_000_000));
        assert_eq!(len, SAMPLE_ID.len());
    }

    #[test]
    fn parse_classifies_malformed_fields() {
        assert_eq!(Signature::parse(b"[DISKUZ 00 1]"), Err(SignatureError::MissingMagic));
        assert_eq!(Signature::parse(b"[DISKUS zz 1]"), Err(SignatureError::MalformedNumber));
        assert_eq!(Signature::parse(b"[DISKUS 0010_1]"), Err(SignatureError::MalformedNumber));
        assert_eq!(
            Signature::parse(b"[DISKUS 00000000000000000010 1]"),
            Err(SignatureError::MalformedNumber),
        );
        assert_eq!(Signature::parse(b"[DISKUS 10 ]"), Err(SignatureError::MalformedTimestamp));
        assert_eq!(Signature::parse(b"[DISKUS 10 17x"), Err(SignatureError::MalformedTimestamp));
        assert_eq!(
            Signature::parse(b"[DISKUS 10 99999999999999999999]"),
            Err(SignatureError::MalformedTimestamp),
        );
    }

    #[test]
    fn generate_is_deterministic_and_embeds_identity() {
        let a = generate(0x10, SAMPLE_ID);
        let b = generate(0x10, SAMPLE_ID);
        assert_eq!(a, b);

        let off = signature_offset(0x10, SAMPLE_ID.len());
        assert_eq!(off, 0x10);
        assert_eq!(&a[off..off + SAMPLE_ID.len()], SAMPLE_ID);
        assert!(verify(0x10, SAMPLE_ID, &a));
    }

    #[test]
    fn rotating_offset_wraps_at_last_slot() {
        let len = SAMPLE_ID.len();
        let slots = (SECTOR_SIZE - len + 1) as u64;
        assert_eq!(signature_offset(slots - 1, len), SECTOR_SIZE - len);
        assert_eq!(signature_offset(slots, len), 0);

        // Signature flush against the end of the sector.
        let s = generate(slots - 1, SAMPLE_ID);
        assert_eq!(&s[SECTOR_SIZE - len..], SAMPLE_ID);
    }

    #[test]
    fn sweep_breaks_up_tiled_digest() {
        let s = generate(400, SAMPLE_ID);
        let lines: Vec<&[u8]> = s.chunks(16).collect();
        for pair in lines.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[test]
    fn single_byte_change_fails_verification() {
        let mut s = generate(0x10, SAMPLE_ID);
        s[300] ^= 0x01;
        assert!(!verify(0x10, SAMPLE_ID, &s));
        assert!(!verify(0x10, SAMPLE_ID, &s[..511]));
    }
}
