use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser};
use log::{warn, LevelFilter};

use iform_coverage::config::{CoverageConfig, DecoderKind, InputSource, ModeArg};
use iform_coverage::corpus::execute;

/// Aggregate SDE instruction-format and branch coverage into CSV reports.
#[derive(Parser)]
#[command(version, about)]
#[command(group(ArgGroup::new("input").required(true).args(["dir", "trace"])))]
struct Args {
    /// XED IFORM list (enables iform mode)
    #[arg(short, long)]
    spec: Option<PathBuf>,

    /// Directory of `*.exe` files with their `-mix-out.txt` traces
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// A single profiler output file
    #[arg(short, long)]
    trace: Option<PathBuf>,

    /// Report path for a single trace
    #[arg(short, long, requires = "trace")]
    report: Option<PathBuf>,

    /// Corpus-wide report path
    #[arg(short, long)]
    global_report: Option<PathBuf>,

    /// Trace layout
    #[arg(long, value_enum, default_value_t = ModeArg::Auto)]
    mode: ModeArg,

    /// Decoder for disassembly reports
    #[arg(long, value_enum, default_value_t = DecoderKind::Xed)]
    decoder: DecoderKind,

    /// Path to the xed binary
    #[arg(long, default_value = "xed")]
    xed: PathBuf,

    /// Seconds before a single decode is abandoned
    #[arg(long, default_value_t = 5)]
    decode_timeout: u64,

    /// Write a JSON coverage summary here
    #[arg(long)]
    summary: Option<PathBuf>,

    /// More diagnostics
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info })
        .parse_default_env()
        .init();

    let input = match (args.dir, args.trace) {
        (Some(dir), _) => InputSource::Directory(dir),
        (None, Some(trace)) => InputSource::Trace(trace),
        (None, None) => bail!("either --dir or --trace is required"),
    };

    let mut config = CoverageConfig::new(input);
    config.mode = args.mode;
    config.spec = args.spec;
    config.report = args.report;
    config.global_report = args.global_report;
    config.decoder = args.decoder;
    config.xed_program = args.xed;
    config.decode_timeout = Duration::from_secs(args.decode_timeout);

    let outcome = execute(&config).context("coverage run failed")?;

    if let Some(path) = args.summary {
        let json = serde_json::to_string_pretty(&outcome)?;
        fs::write(&path, json).with_context(|| format!("failed to write summary {}", path.display()))?;
    }

    let attempted = outcome.runs.len() + outcome.skipped.len() + outcome.report_failed.len();
    if !outcome.skipped.is_empty() {
        warn!("{} of {} runs skipped", outcome.skipped.len(), attempted);
    }
    if !outcome.report_failed.is_empty() {
        warn!("{} of {} run reports not written", outcome.report_failed.len(), attempted);
    }
    Ok(())
}
