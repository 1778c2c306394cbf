//! Block workers: the per-block processing step of each mode.
//!
//! The engine moves bytes; a worker decides what they mean.  Every worker
//! implements [`BlockWorker`]:
//!
//! - `begin(Open)` once before the first block, `begin(Continue)` after the
//!   engine jumped over unreadable bytes;
//! - `process` once per transferred block, returning a [`Step`];
//! - `end` once after the last block (flush pending output).
//!
//! # Bookkeeping contract
//! A step that reports `consumed = n` must have advanced
//! `ScanState::byte_position` by exactly `n` and `sector_number` by exactly
//! `n / 512`.  `n` equals the block length unless the step asks for
//! [`Control::Reposition`].  The engine checks this after every call and
//! aborts the run on violation.
//!
//! # Modes
//!
//! | Mode | Direction | Access | Worker |
//! |------|-----------|--------|--------|
//! | `dump` | read | read | [`DumpWorker`] |
//! | `check` | read | read | [`CheckWorker`] |
//! | `read` | read | read | [`ReadWorker`] |
//! | `freshen` | read | read-write | [`FreshenWorker`] |
//! | `gen` | write | write | [`GenerateWorker`] |
//! | `null` | write | write | [`NullWorker`] |

pub mod check;

use std::io::Write;

use crate::hexdump::DiffHexEncoder;
use crate::io_stream::device::{Access, BlockDevice};
use crate::outcome::{EngineError, ResultFlags};
use crate::sector::{generate_into, Signature, SECTOR_SIZE};
use crate::state::ScanState;

pub use check::{classify_sector, CheckWorker, SectorVerdict};

// ── Mode ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Dump,
    Check,
    Generate,
    Null,
    Read,
    Freshen,
}

/// Whether the engine reads blocks from the device or writes them to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Mode {
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "dump"              => Some(Mode::Dump),
            "check"             => Some(Mode::Check),
            "gen" | "generate"  => Some(Mode::Generate),
            "null"              => Some(Mode::Null),
            "read"              => Some(Mode::Read),
            "freshen"           => Some(Mode::Freshen),
            _                   => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Mode::Dump     => "dump",
            Mode::Check    => "check",
            Mode::Generate => "gen",
            Mode::Null     => "null",
            Mode::Read     => "read",
            Mode::Freshen  => "freshen",
        }
    }

    pub fn access(self) -> Access {
        match self {
            Mode::Dump | Mode::Check | Mode::Read => Access::Read,
            Mode::Freshen                         => Access::ReadWrite,
            Mode::Generate | Mode::Null           => Access::Write,
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            Mode::Generate | Mode::Null => Direction::Write,
            _                           => Direction::Read,
        }
    }

    /// Modes that overwrite device contents and need explicit confirmation.
    pub fn is_destructive(self) -> bool {
        self.access().writes()
    }
}

// ── Worker interface ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Begin {
    /// First block of the run follows.
    Open,
    /// The stream resumes at a new position after a skipped range.
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    /// Seek to `ScanState::byte_position` before the next transfer.
    Reposition,
}

/// Result of one `process` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub consumed: usize,
    pub control:  Control,
    pub flags:    ResultFlags,
}

impl Step {
    pub fn consumed(n: usize) -> Self {
        Self { consumed: n, control: Control::Continue, flags: ResultFlags::empty() }
    }
}

/// Everything a worker may touch during one call.
pub struct WorkerCtx<'a> {
    pub state:  &'a mut ScanState,
    pub device: &'a mut dyn BlockDevice,
    pub out:    &'a mut dyn Write,
}

pub trait BlockWorker {
    fn begin(&mut self, _ctx: &mut WorkerCtx<'_>, _kind: Begin) -> Result<(), EngineError> {
        Ok(())
    }

    fn process(&mut self, ctx: &mut WorkerCtx<'_>, block: &mut [u8]) -> Result<Step, EngineError>;

    fn end(&mut self, _ctx: &mut WorkerCtx<'_>) -> Result<(), EngineError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerOptions {
    /// Disable run suppression in the checker and the hex encoder.
    pub expand:      bool,
    /// Hex dump every reported sector.
    pub dump_errors: bool,
    pub block_size:  usize,
}

// ── Worker sum type ──────────────────────────────────────────────────────────

pub enum Worker {
    Dump(DumpWorker),
    Check(CheckWorker),
    Generate(GenerateWorker),
    Null(NullWorker),
    Read(ReadWorker),
    Freshen(FreshenWorker),
}

impl Worker {
    pub fn for_mode(mode: Mode, opts: WorkerOptions) -> Self {
        match mode {
            Mode::Dump     => Worker::Dump(DumpWorker::new(opts.expand)),
            Mode::Check    => Worker::Check(CheckWorker::new(opts.expand, opts.dump_errors)),
            Mode::Generate => Worker::Generate(GenerateWorker::default()),
            Mode::Null     => Worker::Null(NullWorker::default()),
            Mode::Read     => Worker::Read(ReadWorker),
            Mode::Freshen  => Worker::Freshen(FreshenWorker::new(opts.block_size)),
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            Worker::Dump(_)     => Mode::Dump,
            Worker::Check(_)    => Mode::Check,
            Worker::Generate(_) => Mode::Generate,
            Worker::Null(_)     => Mode::Null,
            Worker::Read(_)     => Mode::Read,
            Worker::Freshen(_)  => Mode::Freshen,
        }
    }

    fn inner(&mut self) -> &mut dyn BlockWorker {
        match self {
            Worker::Dump(w)     => w,
            Worker::Check(w)    => w,
            Worker::Generate(w) => w,
            Worker::Null(w)     => w,
            Worker::Read(w)     => w,
            Worker::Freshen(w)  => w,
        }
    }
}

impl BlockWorker for Worker {
    fn begin(&mut self, ctx: &mut WorkerCtx<'_>, kind: Begin) -> Result<(), EngineError> {
        self.inner().begin(ctx, kind)
    }

    fn process(&mut self, ctx: &mut WorkerCtx<'_>, block: &mut [u8]) -> Result<Step, EngineError> {
        self.inner().process(ctx, block)
    }

    fn end(&mut self, ctx: &mut WorkerCtx<'_>) -> Result<(), EngineError> {
        self.inner().end(ctx)
    }
}

// ── read ─────────────────────────────────────────────────────────────────────

/// Discards data; measures raw read throughput.
#[derive(Debug, Default)]
pub struct ReadWorker;

impl BlockWorker for ReadWorker {
    fn process(&mut self, ctx: &mut WorkerCtx<'_>, block: &mut [u8]) -> Result<Step, EngineError> {
        ctx.state.advance(block.len());
        Ok(Step::consumed(block.len()))
    }
}

// ── gen ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct GenerateWorker {
    timestamp: u64,
}

impl BlockWorker for GenerateWorker {
    fn begin(&mut self, ctx: &mut WorkerCtx<'_>, _kind: Begin) -> Result<(), EngineError> {
        self.timestamp = ctx
            .state
            .run_timestamp
            .ok_or_else(|| EngineError::Parameter("gen mode needs a run timestamp".into()))?;
        Ok(())
    }

    fn process(&mut self, ctx: &mut WorkerCtx<'_>, block: &mut [u8]) -> Result<Step, EngineError> {
        for sector in block.chunks_exact_mut(SECTOR_SIZE) {
            let nr = ctx.state.sector_number;
            let id = Signature::new(nr, self.timestamp).to_bytes();
            generate_into(nr, &id, sector);
            ctx.state.advance(SECTOR_SIZE);
        }
        Ok(Step::consumed(block.len()))
    }
}

// ── null ─────────────────────────────────────────────────────────────────────

/// Writes zeros.  The buffer is cleared only when its length changes.
#[derive(Debug, Default)]
pub struct NullWorker {
    zeroed_len: usize,
}

impl BlockWorker for NullWorker {
    fn begin(&mut self, _ctx: &mut WorkerCtx<'_>, _kind: Begin) -> Result<(), EngineError> {
        self.zeroed_len = 0;
        Ok(())
    }

    fn process(&mut self, ctx: &mut WorkerCtx<'_>, block: &mut [u8]) -> Result<Step, EngineError> {
        if self.zeroed_len != block.len() {
            block.fill(0);
            self.zeroed_len = block.len();
        }
        ctx.state.advance(block.len());
        Ok(Step::consumed(block.len()))
    }
}

// ── dump ─────────────────────────────────────────────────────────────────────

pub struct DumpWorker {
    encoder: DiffHexEncoder,
    expand:  bool,
}

impl DumpWorker {
    pub fn new(expand: bool) -> Self {
        Self { encoder: DiffHexEncoder::new(0, expand), expand }
    }
}

impl BlockWorker for DumpWorker {
    fn begin(&mut self, ctx: &mut WorkerCtx<'_>, kind: Begin) -> Result<(), EngineError> {
        let pos = ctx.state.byte_position;
        match kind {
            Begin::Open     => self.encoder = DiffHexEncoder::new(pos, self.expand),
            Begin::Continue => self.encoder.restart(pos, ctx.out)?,
        }
        Ok(())
    }

    fn process(&mut self, ctx: &mut WorkerCtx<'_>, block: &mut [u8]) -> Result<Step, EngineError> {
        self.encoder.encode(block, ctx.out)?;
        ctx.state.advance(block.len());
        Ok(Step::consumed(block.len()))
    }

    fn end(&mut self, ctx: &mut WorkerCtx<'_>) -> Result<(), EngineError> {
        self.encoder.finish(ctx.out)?;
        Ok(())
    }
}

// ── freshen ──────────────────────────────────────────────────────────────────

/// Rewrites every block in place right after reading it.
///
/// Large transfers advance by only half their length, so every byte is read
/// and rewritten twice, once in each half of a block.
pub struct FreshenWorker {
    block_size: usize,
}

impl FreshenWorker {
    pub fn new(block_size: usize) -> Self {
        Self { block_size }
    }
}

/// Bytes to advance after rewriting `len` bytes: half of `len` rounded down
/// to a sector when the transfer is over one sector and over half a block,
/// the full length otherwise.
pub fn freshen_stride(len: usize, block_size: usize) -> usize {
    if len > SECTOR_SIZE && len > block_size / 2 {
        (len / 2 / SECTOR_SIZE * SECTOR_SIZE).max(SECTOR_SIZE)
    } else {
        len
    }
}

impl BlockWorker for FreshenWorker {
    fn process(&mut self, ctx: &mut WorkerCtx<'_>, block: &mut [u8]) -> Result<Step, EngineError> {
        let position = ctx.state.byte_position;
        let sector   = ctx.state.sector_number;

        // The read left the cursor behind the block.
        ctx.device
            .seek_to(position)
            .map_err(|source| EngineError::Seek { position, source })?;
        let put = ctx
            .device
            .write_block(block)
            .map_err(|source| EngineError::Write { sector, position, source })?;
        if put != block.len() {
            return Err(EngineError::ShortTransfer {
                sector:   sector + (put / SECTOR_SIZE) as u64,
                position: position + put as u64,
                len:      put,
            });
        }

        let stride = freshen_stride(block.len(), self.block_size);
        ctx.state.advance(stride);
        Ok(Step { consumed: stride, control: Control::Reposition, flags: ResultFlags::empty() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_stream::device::MemoryDevice;

    #[test]
    fn mode_names_and_access() {
        assert_eq!(Mode::from_name("GEN"), Some(Mode::Generate));
        assert_eq!(Mode::from_name("generate"), Some(Mode::Generate));
        assert_eq!(Mode::from_name("scrub"), None);
        assert!(Mode::Freshen.is_destructive());
        assert!(Mode::Null.is_destructive());
        assert!(!Mode::Check.is_destructive());
        assert_eq!(Mode::Freshen.direction(), Direction::Read);
        assert_eq!(Mode::Null.direction(), Direction::Write);
    }

    #[test]
    fn freshen_stride_rule() {
        assert_eq!(freshen_stride(4096, 4096), 2048);
        assert_eq!(freshen_stride(2048, 4096), 2048);
        assert_eq!(freshen_stride(512, 512), 512);
        assert_eq!(freshen_stride(1536, 1536), 512);
        assert_eq!(freshen_stride(102_400, 102_400), 51_200);
    }

    #[test]
    fn generate_fills_each_sector() {
        let mut state = ScanState::new(1024, None);
        state.run_timestamp = Some(1_700_000_000);
        let mut dev = MemoryDevice::new(0);
        let mut out = Vec::new();
        let mut ctx = WorkerCtx { state: &mut state, device: &mut dev, out: &mut out };

        let mut w = Worker::for_mode(Mode::Generate, WorkerOptions::default());
        w.begin(&mut ctx, Begin::Open).unwrap();
        let mut block = vec![0u8; 2 * SECTOR_SIZE];
        let step = w.process(&mut ctx, &mut block).unwrap();
        assert_eq!(step, Step::consumed(1024));
        assert_eq!(state.sector_number, 4);

        let id = Signature::new(3, 1_700_000_000).to_bytes();
        assert_eq!(block[SECTOR_SIZE..], crate::sector::generate(3, &id)[..]);
    }

    #[test]
    fn generate_without_timestamp_is_rejected() {
        let mut state = ScanState::new(0, None);
        let mut dev = MemoryDevice::new(0);
        let mut out = Vec::new();
        let mut ctx = WorkerCtx { state: &mut state, device: &mut dev, out: &mut out };
        let err = GenerateWorker::default().begin(&mut ctx, Begin::Open).unwrap_err();
        assert!(matches!(err, EngineError::Parameter(_)));
    }

    #[test]
    fn null_zeroes_on_length_change_only() {
        let mut state = ScanState::new(0, None);
        let mut dev = MemoryDevice::new(0);
        let mut out = Vec::new();
        let mut ctx = WorkerCtx { state: &mut state, device: &mut dev, out: &mut out };

        let mut w = NullWorker::default();
        let mut block = vec![0xffu8; 1024];
        w.process(&mut ctx, &mut block).unwrap();
        assert!(block.iter().all(|&b| b == 0));
        block[0] = 9;
        w.process(&mut ctx, &mut block).unwrap();
        assert_eq!(block[0], 9);
        w.process(&mut ctx, &mut block[..512]).unwrap();
        assert_eq!(block[0], 0);
        assert_eq!(state.byte_position, 2560);
    }

    #[test]
    fn freshen_rewrites_and_requests_reposition() {
        let mut dev = MemoryDevice::from_bytes(vec![0x11u8; 8192]);
        let mut state = ScanState::new(2048, None);
        let mut out = Vec::new();
        let mut ctx = WorkerCtx { state: &mut state, device: &mut dev, out: &mut out };

        let mut block = vec![0x22u8; 4096];
        let step = FreshenWorker::new(4096).process(&mut ctx, &mut block).unwrap();
        assert_eq!(step.consumed, 2048);
        assert_eq!(step.control, Control::Reposition);
        assert_eq!(state.byte_position, 4096);
        assert!(dev.data()[2048..6144].iter().all(|&b| b == 0x22));
        assert!(dev.data()[..2048].iter().all(|&b| b == 0x11));
    }
}
