//! Run configuration shared by the library driver and the CLI.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use log::{debug, info};

use crate::binary::architecture_of;
use crate::corpus::{discover_runs, RunInput, GLOBAL_REPORT_NAME};
use crate::decoder::{CapstoneDecoder, InstructionDecoder, XedDecoder, DEFAULT_DECODE_TIMEOUT};
use crate::trace::TraceMode;
use crate::{Architecture, CoverageError};

/// Requested trace layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// IFORM mode when a spec file is given, otherwise sniff the traces
    Auto,
    /// `-mix -iform` statistics against an IFORM list
    Iform,
    /// Block-structured disassembly listing
    Disasm,
}

impl fmt::Display for ModeArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModeArg::Auto => write!(f, "auto"),
            ModeArg::Iform => write!(f, "iform"),
            ModeArg::Disasm => write!(f, "disasm"),
        }
    }
}

/// Decoder used to annotate disassembly reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecoderKind {
    /// External `xed` process
    Xed,
    /// In-process Capstone
    Capstone,
}

impl fmt::Display for DecoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecoderKind::Xed => write!(f, "xed"),
            DecoderKind::Capstone => write!(f, "capstone"),
        }
    }
}

/// What to process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// Every `*.exe` in a directory, each with its `-mix-out.txt` trace
    Directory(PathBuf),
    /// A single trace file
    Trace(PathBuf),
}

#[derive(Debug, Clone)]
pub struct CoverageConfig {
    pub mode: ModeArg,
    /// XED IFORM list
    pub spec: Option<PathBuf>,
    pub input: InputSource,
    /// Per-run report override (single-trace input only)
    pub report: Option<PathBuf>,
    /// Global report override (directory input only)
    pub global_report: Option<PathBuf>,
    pub decoder: DecoderKind,
    pub xed_program: PathBuf,
    pub xed_args: Vec<String>,
    pub decode_timeout: Duration,
}

impl CoverageConfig {
    /// Defaults: auto mode, xed decoder, no spec.
    pub fn new(input: InputSource) -> Self {
        Self {
            mode: ModeArg::Auto,
            spec: None,
            input,
            report: None,
            global_report: None,
            decoder: DecoderKind::Xed,
            xed_program: PathBuf::from("xed"),
            xed_args: vec!["-64".to_string(), "-d".to_string()],
            decode_timeout: DEFAULT_DECODE_TIMEOUT,
        }
    }

    /// The runs the input describes.
    pub fn runs(&self) -> Result<Vec<RunInput>, CoverageError> {
        match &self.input {
            InputSource::Directory(dir) => {
                if self.report.is_some() {
                    return Err(CoverageError::Config(
                        "a report override needs a single trace, not a directory".to_string(),
                    ));
                }
                discover_runs(dir)
            }
            InputSource::Trace(trace) => Ok(vec![RunInput::for_trace(trace, self.report.as_deref())]),
        }
    }

    /// Global report destination; none for single-trace input without override.
    pub fn global_report_path(&self) -> Option<PathBuf> {
        match (&self.global_report, &self.input) {
            (Some(path), _) => Some(path.clone()),
            (None, InputSource::Directory(dir)) => Some(dir.join(GLOBAL_REPORT_NAME)),
            (None, InputSource::Trace(_)) => None,
        }
    }

    /// Settle the trace layout for this corpus.
    pub fn resolve_mode(&self, runs: &[RunInput]) -> Result<TraceMode, CoverageError> {
        match self.mode {
            ModeArg::Iform => {
                if self.spec.is_none() {
                    return Err(CoverageError::Config("iform mode requires a spec file".to_string()));
                }
                Ok(TraceMode::Mix)
            }
            ModeArg::Disasm => Ok(TraceMode::Disassembly),
            ModeArg::Auto if self.spec.is_some() => Ok(TraceMode::Mix),
            ModeArg::Auto => {
                for run in runs {
                    match TraceMode::detect(&run.trace) {
                        Ok(Some(TraceMode::Mix)) => {
                            return Err(CoverageError::Config(format!(
                                "{} is a mix trace; pass the IFORM list with --spec",
                                run.trace.display()
                            )))
                        }
                        Ok(Some(mode)) => {
                            info!("Detected {:?} traces from {}", mode, run.trace.display());
                            return Ok(mode);
                        }
                        Ok(None) => debug!("No known layout in {}", run.trace.display()),
                        Err(e) => debug!("Cannot sniff {}: {}", run.trace.display(), e),
                    }
                }
                Ok(TraceMode::Disassembly)
            }
        }
    }

    /// Build the report decoder.
    ///
    /// Capstone decodes for the first executable whose architecture is known,
    /// falling back to x86-64.
    pub fn build_decoder(&self, runs: &[RunInput]) -> Result<Box<dyn InstructionDecoder>, CoverageError> {
        match self.decoder {
            DecoderKind::Xed => Ok(Box::new(
                XedDecoder::new()
                    .with_program(&self.xed_program)
                    .with_args(self.xed_args.iter().cloned())
                    .with_timeout(self.decode_timeout),
            )),
            DecoderKind::Capstone => {
                let arch = runs
                    .iter()
                    .filter_map(|run| run.executable.as_deref())
                    .map(architecture_of)
                    .find(|arch| *arch != Architecture::Unknown)
                    .unwrap_or(Architecture::X86_64);
                info!("Decoding with Capstone for {arch}");
                let decoder = CapstoneDecoder::for_architecture(arch)
                    .map_err(|e| CoverageError::Config(format!("cannot build Capstone decoder: {e}")))?;
                Ok(Box::new(decoder))
            }
        }
    }
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self::new(InputSource::Directory(Path::new(".").to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_global_report_defaults() {
        let config = CoverageConfig::new(InputSource::Directory(PathBuf::from("/bench")));
        assert_eq!(config.global_report_path(), Some(PathBuf::from("/bench/global_result.csv")));

        let config = CoverageConfig::new(InputSource::Trace(PathBuf::from("t.txt")));
        assert_eq!(config.global_report_path(), None);
    }

    #[test]
    fn test_iform_mode_needs_spec() {
        let mut config = CoverageConfig::new(InputSource::Trace(PathBuf::from("t.txt")));
        config.mode = ModeArg::Iform;
        assert!(matches!(config.resolve_mode(&[]), Err(CoverageError::Config(_))));

        config.spec = Some(PathBuf::from("iforms.txt"));
        assert_eq!(config.resolve_mode(&[]).unwrap(), TraceMode::Mix);
    }

    #[test]
    fn test_auto_mode_sniffs_traces() {
        let dir = tempfile::tempdir().unwrap();
        let trace = dir.path().join("t.txt");
        fs::write(&trace, "BLOCK: 1 EXECUTIONS: 2\n").unwrap();

        let config = CoverageConfig::new(InputSource::Trace(trace.clone()));
        let runs = config.runs().unwrap();
        assert_eq!(config.resolve_mode(&runs).unwrap(), TraceMode::Disassembly);

        fs::write(&trace, "# EMIT_GLOBAL_DYNAMIC_STATS\nNOP 1\n").unwrap();
        assert!(matches!(config.resolve_mode(&runs), Err(CoverageError::Config(_))));
    }

    #[test]
    fn test_report_override_rejected_for_directory() {
        let mut config = CoverageConfig::new(InputSource::Directory(PathBuf::from(".")));
        config.report = Some(PathBuf::from("r.csv"));
        assert!(matches!(config.runs(), Err(CoverageError::Config(_))));
    }

    #[test]
    fn test_capstone_decoder_defaults_to_x86_64() {
        let mut config = CoverageConfig::default();
        config.decoder = DecoderKind::Capstone;
        let decoder = config.build_decoder(&[]).unwrap();
        assert_eq!(decoder.decode("90").unwrap(), "nop");
    }
}
