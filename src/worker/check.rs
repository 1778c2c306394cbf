//! Sector verification.
//!
//! [`classify_sector`] is the pure decision for one sector; [`CheckWorker`]
//! wraps it with error-run suppression, timestamp tracking and reporting.

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::ops::Range;

use crate::hexdump;
use crate::outcome::{EngineError, ResultFlags};
use crate::sector::{generate, verify, Signature, SignatureError, SignatureScanner, SECTOR_SIZE};
use crate::state::VerifyKind;

use super::{Begin, BlockWorker, Step, WorkerCtx};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectorVerdict {
    Valid(Signature),
    MissingSignature,
    MalformedNumber,
    MalformedTimestamp,
    /// The signature names another sector.  `data_valid` is whether the
    /// payload matches the claimed sector, or matches the expected sector
    /// everywhere outside the signature.
    NumberMismatch { claimed: u64, data_valid: bool },
    /// Signature is right, payload is not.
    DataMismatch(Signature),
}

impl SectorVerdict {
    pub fn kind(&self) -> Option<VerifyKind> {
        match self {
            SectorVerdict::Valid(_)            => None,
            SectorVerdict::MissingSignature    => Some(VerifyKind::MissingSignature),
            SectorVerdict::MalformedNumber     => Some(VerifyKind::MalformedNumber),
            SectorVerdict::MalformedTimestamp  => Some(VerifyKind::MalformedTimestamp),
            SectorVerdict::NumberMismatch { data_valid: false, .. } => Some(VerifyKind::NumberMismatch),
            SectorVerdict::NumberMismatch { data_valid: true, .. }  => Some(VerifyKind::MisplacedSector),
            SectorVerdict::DataMismatch(_)     => Some(VerifyKind::DataMismatch),
        }
    }

    /// One-line diagnostic for sector `nr`, `None` when it verified.
    pub fn describe(&self, nr: u64) -> Option<String> {
        let line = match self {
            SectorVerdict::Valid(_) => return None,
            SectorVerdict::MissingSignature => format!("cannot find signature in sector {nr}"),
            SectorVerdict::MalformedNumber => {
                format!("malformed sector number in signature of sector {nr}")
            }
            SectorVerdict::MalformedTimestamp => {
                format!("malformed timestamp in signature of sector {nr}")
            }
            SectorVerdict::NumberMismatch { claimed, data_valid: false } => {
                format!("sector {nr} claims to be sector {claimed}, data invalid")
            }
            SectorVerdict::NumberMismatch { claimed, data_valid: true } => {
                format!("sector {nr} holds valid data of sector {claimed}")
            }
            SectorVerdict::DataMismatch(_) => format!("data mismatch in sector {nr}"),
        };
        Some(line)
    }
}

/// Verify one sector that is expected to be `sector_number`.
pub fn classify_sector(
    sector_number: u64,
    sector:        &[u8],
    scanner:       &mut SignatureScanner,
) -> SectorVerdict {
    let Some(offset) = scanner.find(sector) else {
        return SectorVerdict::MissingSignature;
    };
    let (sig, len) = match Signature::parse(&sector[offset..]) {
        Ok(parsed) => parsed,
        Err(SignatureError::MalformedTimestamp) => return SectorVerdict::MalformedTimestamp,
        Err(_) => return SectorVerdict::MalformedNumber,
    };
    let identity = &sector[offset..offset + len];

    if sig.sector_number != sector_number {
        let expected   = generate(sector_number, &Signature::new(sector_number, sig.timestamp).to_bytes());
        let data_valid = verify(sig.sector_number, identity, sector)
            || same_outside(sector, &expected, offset..offset + len);
        return SectorVerdict::NumberMismatch { claimed: sig.sector_number, data_valid };
    }
    if verify(sector_number, identity, sector) {
        SectorVerdict::Valid(sig)
    } else {
        SectorVerdict::DataMismatch(sig)
    }
}

/// `sector` equals `expected` at every byte outside `skip`.
fn same_outside(sector: &[u8], expected: &[u8], skip: Range<usize>) -> bool {
    sector.len() == expected.len()
        && sector[..skip.start] == expected[..skip.start]
        && sector[skip.end..] == expected[skip.end..]
}

// ── Worker ───────────────────────────────────────────────────────────────────

pub struct CheckWorker {
    scanner:     SignatureScanner,
    expand:      bool,
    dump_errors: bool,
    /// Repeats of the current error kind not printed yet.
    suppressed:  u64,
    /// Regressed timestamps already reported.
    regressions: BTreeSet<u64>,
    /// Newer timestamps already announced.
    changes:     BTreeSet<u64>,
}

impl CheckWorker {
    pub fn new(expand: bool, dump_errors: bool) -> Self {
        Self {
            scanner: SignatureScanner::new(),
            expand,
            dump_errors,
            suppressed: 0,
            regressions: BTreeSet::new(),
            changes: BTreeSet::new(),
        }
    }

    fn flush_suppressed(&mut self, out: &mut dyn Write) -> io::Result<()> {
        if self.suppressed > 0 {
            writeln!(out, "  ... {} more sector(s) with the same error", self.suppressed)?;
            self.suppressed = 0;
        }
        Ok(())
    }

    fn track_timestamp(
        &mut self,
        ctx:        &mut WorkerCtx<'_>,
        nr:         u64,
        timestamp:  u64,
        consistent: bool,
    ) -> io::Result<ResultFlags> {
        match ctx.state.run_timestamp {
            None => {
                if consistent {
                    ctx.state.run_timestamp = Some(timestamp);
                }
            }
            Some(last) if timestamp == last => {}
            Some(last) if timestamp < last => {
                if self.regressions.insert(timestamp) {
                    writeln!(
                        ctx.out,
                        "warning: sector {nr} has timestamp {timestamp}, older than {last}"
                    )?;
                }
                return Ok(ResultFlags::TIMESTAMP);
            }
            Some(last) => {
                if self.changes.insert(timestamp) {
                    writeln!(ctx.out, "note: timestamp changes from {last} to {timestamp} at sector {nr}")?;
                }
                if consistent {
                    ctx.state.run_timestamp = Some(timestamp);
                }
            }
        }
        Ok(ResultFlags::empty())
    }

    fn report(
        &mut self,
        ctx:     &mut WorkerCtx<'_>,
        kind:    VerifyKind,
        verdict: &SectorVerdict,
        sector:  &[u8],
    ) -> io::Result<()> {
        ctx.state.error_count += 1;
        let repeat = ctx.state.last_error_kind == Some(kind);
        ctx.state.last_error_kind = Some(kind);
        if repeat && !self.expand {
            self.suppressed += 1;
            return Ok(());
        }

        self.flush_suppressed(ctx.out)?;
        if let Some(line) = verdict.describe(ctx.state.sector_number) {
            writeln!(ctx.out, "{line}")?;
        }
        if self.dump_errors {
            hexdump::dump(ctx.state.byte_position, sector, self.expand, ctx.out)?;
        }
        Ok(())
    }
}

impl BlockWorker for CheckWorker {
    fn begin(&mut self, ctx: &mut WorkerCtx<'_>, kind: Begin) -> Result<(), EngineError> {
        if kind == Begin::Continue {
            self.flush_suppressed(ctx.out)?;
        }
        ctx.state.last_error_kind = None;
        Ok(())
    }

    fn process(&mut self, ctx: &mut WorkerCtx<'_>, block: &mut [u8]) -> Result<Step, EngineError> {
        let mut flags = ResultFlags::empty();

        for sector in block.chunks_exact(SECTOR_SIZE) {
            let nr      = ctx.state.sector_number;
            let verdict = classify_sector(nr, sector, &mut self.scanner);

            match &verdict {
                SectorVerdict::Valid(sig) => {
                    flags |= self.track_timestamp(ctx, nr, sig.timestamp, true)?;
                }
                SectorVerdict::DataMismatch(sig) => {
                    flags |= self.track_timestamp(ctx, nr, sig.timestamp, false)?;
                }
                _ => {}
            }

            match verdict.kind() {
                None => {
                    self.flush_suppressed(ctx.out)?;
                    ctx.state.last_error_kind = None;
                }
                Some(kind) => {
                    flags |= ResultFlags::MISMATCH;
                    self.report(ctx, kind, &verdict, sector)?;
                }
            }
            ctx.state.advance(SECTOR_SIZE);
        }

        let mut step = Step::consumed(block.len());
        step.flags = flags;
        Ok(step)
    }

    fn end(&mut self, ctx: &mut WorkerCtx<'_>) -> Result<(), EngineError> {
        self.flush_suppressed(ctx.out)?;
        Ok(())
    }
}
