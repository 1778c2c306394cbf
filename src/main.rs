use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use chrono::Utc;
use clap::error::ErrorKind;
use clap::Parser;
use diskus::config::{parse_option_size, resolve_mode, ConfigError, RunConfig};
use diskus::io_stream::DEFAULT_BLOCK_SIZE;
use diskus::progress::Progress;
use diskus::{execute, Mode, ResultFlags, RunSummary, ScanState};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "diskus", version, about = "Write, verify and dump raw block devices sector by sector")]
struct Cli {
    /// Block device or file to operate on
    device: PathBuf,
    /// Mode: dump (default), check, gen, null, read, freshen
    #[arg(short, long)]
    mode: Option<String>,
    /// Shorthand for --mode check
    #[arg(long)]
    check: bool,
    /// Shorthand for --mode dump
    #[arg(long)]
    dump: bool,
    /// Shorthand for --mode gen
    #[arg(long)]
    gen: bool,
    /// Shorthand for --mode null
    #[arg(long)]
    null: bool,
    /// Shorthand for --mode read
    #[arg(long)]
    read: bool,
    /// Shorthand for --mode freshen
    #[arg(long)]
    freshen: bool,
    /// Transfer size (suffixes B K M G T), multiple of 512
    #[arg(short, long, default_value_t = DEFAULT_BLOCK_SIZE.to_string())]
    bs: String,
    /// First byte offset to process
    #[arg(short, long)]
    start: Option<String>,
    /// Byte offset to stop at (exclusive)
    #[arg(short, long)]
    end: Option<String>,
    /// Allow gen, null and freshen to overwrite the device
    #[arg(short, long)]
    write: bool,
    /// Report every error and dump every line instead of collapsing repeats
    #[arg(short = 'x', long)]
    expand: bool,
    /// Read-error backoff: 0 off, 1 fixed, 2 contiguous, 3 stalled, 4 doubling, 5 doubling-reset
    #[arg(short, long, default_value = "0")]
    jump: u8,
    /// No progress line and no summary
    #[arg(short, long)]
    quiet: bool,
    /// Hex dump each sector that fails verification
    #[arg(long)]
    dump_errors: bool,
    /// Use neither direct I/O nor synchronous writes
    #[arg(long = "async")]
    async_io: bool,
    /// Print the final summary as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn into_config(self) -> Result<RunConfig, ConfigError> {
        let mode = resolve_mode(
            self.mode.as_deref(),
            &[
                (self.check,   Mode::Check),
                (self.dump,    Mode::Dump),
                (self.gen,     Mode::Generate),
                (self.null,    Mode::Null),
                (self.read,    Mode::Read),
                (self.freshen, Mode::Freshen),
            ],
        )?;
        Ok(RunConfig {
            device:      self.device,
            mode,
            block_size:  parse_option_size("--bs", &self.bs)?,
            start:       self.start.as_deref().map(|s| parse_option_size("--start", s)).transpose()?.unwrap_or(0),
            end:         self.end.as_deref().map(|s| parse_option_size("--end", s)).transpose()?,
            write:       self.write,
            expand:      self.expand,
            jump:        self.jump,
            quiet:       self.quiet,
            dump_errors: self.dump_errors,
            async_io:    self.async_io,
            json:        self.json,
        })
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    match run() {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e}");
            ExitCode::from(ResultFlags::PARAMETER.bits())
        }
    }
}

fn run() -> Result<u8, Box<dyn std::error::Error>> {
    // Usage errors exit with the PARAMETER flag.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            e.print()?;
            return Ok(ResultFlags::PARAMETER.bits());
        }
    };
    let mut config = cli.into_config()?;
    for warning in config.validate()? {
        warn!("{warning}");
    }

    let run_timestamp = Utc::now().timestamp().max(0) as u64;
    let session       = config.session(run_timestamp);
    info!(
        mode = config.mode.name(),
        device = %config.device.display(),
        block_size = config.block_size,
        start = config.start,
        end = ?config.end,
        jump = session.engine.jump.name(),
        "starting run"
    );

    let mut progress = Progress::new(config.mode.name(), config.quiet);
    let report = {
        let mut out = BufWriter::new(io::stdout().lock());
        execute(&session, &mut out, &mut |st: &ScanState| progress.tick(st))
    };
    progress.finish();

    if let Some(e) = &report.error {
        error!("{e}");
    }

    let summary = RunSummary::new(
        config.mode.name(),
        &config.device.display().to_string(),
        config.start,
        &report,
        progress.elapsed().as_secs_f64(),
    );
    if config.json {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", summary.to_json()?)?;
    } else if !config.quiet {
        eprintln!("{}", summary.to_text());
    }

    Ok(summary.exit_code)
}
