//! Sequential I/O engine: drives one worker across a byte range of a device.
//!
//! # States
//! `Opening → Positioned → Streaming → (Retrying ↔ Streaming) → Closing → Done`
//!
//! - **Opening**: [`execute`] opens the device for the worker's access mode
//!   (see [`device::FileDevice`] for the direct-I/O probe).
//! - **Positioned**: an explicit seek precedes every (re-)entry into the
//!   stream and every step that asks for [`Control::Reposition`].
//! - **Streaming**: one block per iteration, clamped to the end bound.  The
//!   worker's counters are checked against the bytes it was handed after
//!   every step.
//! - **Retrying**: read paths only.  A failed read consults the
//!   [`BackoffPolicy`]; the engine either gives up or jumps forward and
//!   resumes the worker with [`Begin::Continue`].
//! - **Closing**: worker `end`, then device `close`.
//!
//! # Write path end of device
//! A short write means the device is full.  If the shortfall is a whole
//! number of sectors the counters are rewound to the last written sector and
//! the run ends cleanly; a partial sector is fatal.

pub mod device;

use std::io::Write;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::backoff::{BackoffPolicy, JumpMode};
use crate::outcome::{EngineError, ResultFlags, RunReport};
use crate::sector::SECTOR_SIZE;
use crate::state::ScanState;
use crate::worker::{Begin, BlockWorker, Control, Direction, Mode, Worker, WorkerCtx, WorkerOptions};

use device::{AlignedBuffer, BlockDevice, FileDevice, OpenFlags};

/// Default transfer size: 100 KiB.
pub const DEFAULT_BLOCK_SIZE: usize = 100 * 1024;
/// Largest accepted transfer size: 16 MiB.
pub const MAX_BLOCK_SIZE:     usize = 16 * 1024 * 1024;

// ── Engine ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub block_size:    usize,
    /// First byte to process; sector aligned.
    pub start:         u64,
    /// One past the last byte to process; sector aligned.
    pub end:           Option<u64>,
    pub jump:          JumpMode,
    /// Write passes stamp this into every signature.  Check passes may seed
    /// the expected timestamp with it.
    pub run_timestamp: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size:    DEFAULT_BLOCK_SIZE,
            start:         0,
            end:           None,
            jump:          JumpMode::default(),
            run_timestamp: None,
        }
    }
}

pub struct SequentialEngine {
    config: EngineConfig,
}

impl SequentialEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let bs = config.block_size;
        if bs == 0 || bs % SECTOR_SIZE != 0 || bs > MAX_BLOCK_SIZE {
            return Err(EngineError::Parameter(format!(
                "block size {bs} must be a non-zero multiple of {SECTOR_SIZE} up to {MAX_BLOCK_SIZE}"
            )));
        }
        if config.start % SECTOR_SIZE as u64 != 0 {
            return Err(EngineError::Parameter(format!("start {} is not sector aligned", config.start)));
        }
        if let Some(end) = config.end {
            if end % SECTOR_SIZE as u64 != 0 {
                return Err(EngineError::Parameter(format!("end {end} is not sector aligned")));
            }
            if end <= config.start {
                return Err(EngineError::Parameter(format!(
                    "end {end} must lie beyond start {}",
                    config.start
                )));
            }
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one of the built-in workers in its natural direction.
    pub fn run_worker(
        &self,
        worker:   &mut Worker,
        device:   &mut dyn BlockDevice,
        out:      &mut dyn Write,
        progress: &mut dyn FnMut(&ScanState),
    ) -> RunReport {
        let direction = worker.mode().direction();
        self.run(worker, direction, device, out, progress)
    }

    /// Stream the configured range through `worker`.
    ///
    /// Never fails outright: a fatal error ends the pass and is carried in
    /// the returned report next to the counters reached so far.
    pub fn run(
        &self,
        worker:    &mut dyn BlockWorker,
        direction: Direction,
        device:    &mut dyn BlockDevice,
        out:       &mut dyn Write,
        progress:  &mut dyn FnMut(&ScanState),
    ) -> RunReport {
        let mut state = ScanState::new(self.config.start, self.config.end);
        state.run_timestamp = self.config.run_timestamp;

        let mut ctx = WorkerCtx { state: &mut state, device: &mut *device, out: &mut *out };
        let mut result = match direction {
            Direction::Read  => self.read_pass(worker, &mut ctx, progress),
            Direction::Write => self.write_pass(worker, &mut ctx, progress),
        };

        // Closing: flush the worker even after a failure, keep the first error.
        let ended = worker.end(&mut ctx);
        if result.is_ok() {
            result = ended;
        }
        let _ = ctx.out.flush();

        let position = ctx.state.byte_position;
        let sector   = ctx.state.sector_number;
        if let Err(source) = ctx.device.close() {
            if result.is_ok() {
                result = Err(match direction {
                    Direction::Read  => EngineError::Read { sector, position, source },
                    Direction::Write => EngineError::Write { sector, position, source },
                });
            } else {
                debug!(%source, "device close failed after an earlier error");
            }
        }

        RunReport { state, error: result.err() }
    }

    fn read_pass(
        &self,
        worker:   &mut dyn BlockWorker,
        ctx:      &mut WorkerCtx<'_>,
        progress: &mut dyn FnMut(&ScanState),
    ) -> Result<(), EngineError> {
        let bs          = self.config.block_size;
        let mut backoff = BackoffPolicy::new(self.config.jump, bs);
        let mut buf     = AlignedBuffer::new(bs);

        position_at(ctx.device, ctx.state.byte_position)?;
        worker.begin(ctx, Begin::Open)?;

        loop {
            let want = ctx.state.next_len(bs);
            if want == 0 {
                break;
            }
            let position = ctx.state.byte_position;
            let sector   = ctx.state.sector_number;

            let got = match ctx.device.read_block(&mut buf.as_mut_slice()[..want]) {
                Ok(n) => n,
                Err(source) => {
                    let Some(skip) = backoff.on_failure(position) else {
                        return Err(EngineError::Read { sector, position, source });
                    };
                    warn!(
                        sector,
                        position,
                        skip,
                        resume = position + skip,
                        error = %source,
                        "read error, skipping ahead"
                    );
                    ctx.state.result_flags |= ResultFlags::READ;
                    ctx.state.jump(skip);
                    if ctx.state.next_len(bs) == 0 {
                        break;
                    }
                    position_at(ctx.device, ctx.state.byte_position)?;
                    worker.begin(ctx, Begin::Continue)?;
                    continue;
                }
            };
            if got == 0 {
                debug!(position, "end of device");
                break;
            }
            if got % SECTOR_SIZE != 0 {
                return Err(EngineError::ShortTransfer {
                    sector:   sector + (got / SECTOR_SIZE) as u64,
                    position: position + got as u64,
                    len:      got,
                });
            }

            let step = worker.process(ctx, &mut buf.as_mut_slice()[..got])?;
            check_bookkeeping(ctx.state, position, sector, got, step.consumed, step.control)?;
            ctx.state.result_flags |= step.flags;
            if step.control == Control::Reposition {
                position_at(ctx.device, ctx.state.byte_position)?;
            }
            progress(&*ctx.state);
        }
        Ok(())
    }

    fn write_pass(
        &self,
        worker:   &mut dyn BlockWorker,
        ctx:      &mut WorkerCtx<'_>,
        progress: &mut dyn FnMut(&ScanState),
    ) -> Result<(), EngineError> {
        let bs      = self.config.block_size;
        let mut buf = AlignedBuffer::new(bs);

        position_at(ctx.device, ctx.state.byte_position)?;
        worker.begin(ctx, Begin::Open)?;

        loop {
            let want = ctx.state.next_len(bs);
            if want == 0 {
                break;
            }
            let position = ctx.state.byte_position;
            let sector   = ctx.state.sector_number;

            let step = worker.process(ctx, &mut buf.as_mut_slice()[..want])?;
            check_bookkeeping(ctx.state, position, sector, want, step.consumed, step.control)?;
            ctx.state.result_flags |= step.flags;

            let put = ctx
                .device
                .write_block(&buf.as_slice()[..want])
                .map_err(|source| EngineError::Write { sector, position, source })?;
            if put < want {
                if put % SECTOR_SIZE != 0 {
                    return Err(EngineError::ShortTransfer {
                        sector:   sector + (put / SECTOR_SIZE) as u64,
                        position: position + put as u64,
                        len:      put,
                    });
                }
                ctx.state.rewind(want - put);
                info!(
                    position = ctx.state.byte_position,
                    sector = ctx.state.sector_number,
                    "device full"
                );
                break;
            }
            if step.control == Control::Reposition {
                position_at(ctx.device, ctx.state.byte_position)?;
            }
            progress(&*ctx.state);
        }
        Ok(())
    }
}

fn position_at(device: &mut dyn BlockDevice, position: u64) -> Result<(), EngineError> {
    device
        .seek_to(position)
        .map(|_| ())
        .map_err(|source| EngineError::Seek { position, source })
}

/// A step handed `len` bytes at `position`/`sector` must have moved the
/// counters by exactly what it reports consuming; without a reposition
/// request it must consume everything, with one it must consume `1..=len`.
fn check_bookkeeping(
    state:    &ScanState,
    position: u64,
    sector:   u64,
    len:      usize,
    consumed: usize,
    control:  Control,
) -> Result<(), EngineError> {
    let expected = match control {
        Control::Continue => len,
        Control::Reposition if (1..=len).contains(&consumed) => consumed,
        Control::Reposition => len,
    };
    let expected_position = position + expected as u64;
    let expected_sector   = sector + (expected / SECTOR_SIZE) as u64;
    if consumed != expected
        || state.byte_position != expected_position
        || state.sector_number != expected_sector
    {
        return Err(EngineError::Bookkeeping {
            expected_position,
            expected_sector,
            actual_position: state.byte_position,
            actual_sector:   state.sector_number,
        });
    }
    Ok(())
}

// ── Session ──────────────────────────────────────────────────────────────────

/// Everything needed to run one mode against one device path.
#[derive(Debug, Clone)]
pub struct Session {
    pub path:    PathBuf,
    pub mode:    Mode,
    pub engine:  EngineConfig,
    pub options: WorkerOptions,
    pub flags:   OpenFlags,
}

/// Open the device, run the mode's worker over it and close it.
pub fn execute(
    session:  &Session,
    out:      &mut dyn Write,
    progress: &mut dyn FnMut(&ScanState),
) -> RunReport {
    let failed = |error: EngineError| {
        let mut state = ScanState::new(session.engine.start, session.engine.end);
        state.run_timestamp = session.engine.run_timestamp;
        RunReport { state, error: Some(error) }
    };

    let engine = match SequentialEngine::new(session.engine) {
        Ok(engine) => engine,
        Err(e) => return failed(e),
    };

    let access = session.mode.access();
    let mut device = match FileDevice::open(&session.path, access, session.flags, session.engine.block_size) {
        Ok(device) => device,
        Err(source) => {
            return failed(EngineError::Open { path: session.path.display().to_string(), source });
        }
    };
    info!(
        path = %session.path.display(),
        mode = session.mode.name(),
        ?access,
        direct = device.is_direct(),
        block_size = session.engine.block_size,
        "device opened"
    );

    let mut options = session.options;
    options.block_size = session.engine.block_size;
    let mut worker = Worker::for_mode(session.mode, options);
    engine.run_worker(&mut worker, &mut device, out, progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_stream::device::MemoryDevice;
    use crate::outcome::INTERNAL_EXIT_CODE;
    use crate::worker::Step;

    fn config(bs: usize) -> EngineConfig {
        EngineConfig { block_size: bs, run_timestamp: Some(1_700_000_000), ..EngineConfig::default() }
    }

    fn run_mode(
        mode:   Mode,
        cfg:    EngineConfig,
        device: &mut MemoryDevice,
    ) -> (RunReport, String) {
        let engine = SequentialEngine::new(cfg).unwrap();
        let mut worker = Worker::for_mode(mode, WorkerOptions { block_size: cfg.block_size, ..Default::default() });
        let mut out = Vec::new();
        let report = engine.run_worker(&mut worker, device, &mut out, &mut |_: &ScanState| {});
        (report, String::from_utf8(out).unwrap())
    }

    #[test]
    fn rejects_bad_geometry() {
        assert!(SequentialEngine::new(config(1000)).is_err());
        assert!(SequentialEngine::new(config(0)).is_err());
        assert!(SequentialEngine::new(EngineConfig { start: 100, ..config(512) }).is_err());
        assert!(SequentialEngine::new(EngineConfig { start: 1024, end: Some(1024), ..config(512) }).is_err());
    }

    #[test]
    fn gen_then_check_is_clean() {
        let mut dev = MemoryDevice::new(64 * 1024);
        let (gen, _) = run_mode(Mode::Generate, config(4096), &mut dev);
        assert!(gen.is_clean(), "{:?}", gen.error);
        assert_eq!(gen.state.sector_number, 128);
        assert!(dev.is_closed());

        let (check, text) = run_mode(Mode::Check, config(3072), &mut dev);
        assert!(check.is_clean(), "{text}");
        assert_eq!(check.state.byte_position, 64 * 1024);
        assert_eq!(check.state.error_count, 0);
    }

    #[test]
    fn short_write_on_sector_boundary_ends_cleanly() {
        let mut dev = MemoryDevice::new(3 * SECTOR_SIZE);
        let (report, _) = run_mode(Mode::Generate, config(4 * SECTOR_SIZE), &mut dev);
        assert!(report.error.is_none());
        assert_eq!(report.state.sector_number, 3);
        assert_eq!(report.state.byte_position, 1536);
    }

    #[test]
    fn short_write_inside_sector_is_fatal() {
        let mut dev = MemoryDevice::new(3 * SECTOR_SIZE + SECTOR_SIZE / 2);
        let (report, _) = run_mode(Mode::Generate, config(4 * SECTOR_SIZE), &mut dev);
        assert!(matches!(
            report.error,
            Some(EngineError::ShortTransfer { sector: 3, position: 1792, len: 1792 })
        ));
        assert_eq!(report.exit_code(), ResultFlags::SHORT.bits());
    }

    #[test]
    fn partial_sector_read_is_fatal() {
        let mut dev = MemoryDevice::new(1000);
        let (report, _) = run_mode(Mode::Read, config(512), &mut dev);
        assert!(matches!(report.error, Some(EngineError::ShortTransfer { len: 488, .. })));
    }

    #[test]
    fn read_error_without_jump_is_fatal() {
        let mut dev = MemoryDevice::new(32 * 1024).fail_reads(9000..9001);
        let (report, _) = run_mode(Mode::Read, config(4096), &mut dev);
        assert!(matches!(report.error, Some(EngineError::Read { position: 8192, sector: 16, .. })));
        assert_eq!(report.exit_code(), ResultFlags::READ.bits());
    }

    #[test]
    fn read_error_with_jump_skips_ahead() {
        let mut dev = MemoryDevice::new(32 * 1024).fail_reads(9000..9001);
        let cfg = EngineConfig { jump: JumpMode::Fixed, ..config(4096) };
        let (report, _) = run_mode(Mode::Read, cfg, &mut dev);
        assert!(report.error.is_none());
        assert_eq!(report.state.skipped_bytes, 4096);
        assert_eq!(report.state.byte_position, 32 * 1024);
        assert_eq!(report.flags(), ResultFlags::READ);
    }

    /// Asks for a reposition without consuming anything.
    struct StalledWorker;

    impl BlockWorker for StalledWorker {
        fn process(&mut self, _ctx: &mut WorkerCtx<'_>, _block: &mut [u8]) -> Result<Step, EngineError> {
            Ok(Step { consumed: 0, control: Control::Reposition, flags: ResultFlags::empty() })
        }
    }

    #[test]
    fn reposition_without_progress_is_rejected() {
        let mut dev = MemoryDevice::new(16 * 1024);
        let engine = SequentialEngine::new(config(4096)).unwrap();
        let report = engine.run(
            &mut StalledWorker,
            Direction::Read,
            &mut dev,
            &mut std::io::sink(),
            &mut |_: &ScanState| {},
        );
        assert!(matches!(
            report.error,
            Some(EngineError::Bookkeeping { expected_position: 4096, actual_position: 0, .. })
        ));
        assert_eq!(report.exit_code(), INTERNAL_EXIT_CODE);
    }

    #[test]
    fn end_bound_clamps_last_block() {
        let mut dev = MemoryDevice::new(64 * 1024);
        let cfg = EngineConfig { start: 1024, end: Some(1024 + 5 * 512), ..config(2048) };
        let (report, _) = run_mode(Mode::Null, cfg, &mut dev);
        assert!(report.is_clean());
        assert_eq!(dev.bytes_written(), 5 * 512);
        assert_eq!(report.state.sector_number, 2 + 5);
    }
}
