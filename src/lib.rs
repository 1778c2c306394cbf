pub mod sector;
pub mod hexdump;
pub mod backoff;
pub mod outcome;
pub mod state;
pub mod progress;
pub mod worker;
pub mod io_stream;
pub mod config;

pub use sector::{Signature, SignatureScanner, SECTOR_SIZE};
pub use hexdump::DiffHexEncoder;
pub use backoff::{BackoffPolicy, JumpMode};
pub use outcome::{EngineError, ResultFlags, RunReport, RunSummary};
pub use state::ScanState;
pub use worker::{BlockWorker, Mode, Worker};
pub use io_stream::{execute, EngineConfig, SequentialEngine, Session};
pub use io_stream::device::{BlockDevice, FileDevice, MemoryDevice};
pub use config::{ConfigError, RunConfig};
