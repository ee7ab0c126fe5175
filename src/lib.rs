//! Instruction-format and branch coverage aggregation for SDE traces.
//!
//! This library folds the dynamic execution statistics written by an
//! instruction-trace emulator into per-run and corpus-wide counters, and
//! renders them as CSV coverage reports. Two trace flavours are supported:
//!
//! * the flat `-mix -iform` table, cross-referenced against the XED IFORM
//!   list loaded into a [`table::FormatTable`] (closed key universe), and
//! * the block-structured disassembly listing, where every `XDIS` record
//!   inherits the execution count of its enclosing `BLOCK` (open key universe).
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use std::path::Path;
//! use iform_coverage::{
//!     corpus::{CoverageSession, IformSession, RunInput},
//!     table::FormatTable,
//! };
//!
//! // Load the IFORM reference table
//! let table = FormatTable::load(Path::new("all-iforms.txt")).unwrap();
//!
//! // One session owns the corpus-wide counters
//! let mut session = IformSession::new(&table);
//!
//! // Fold one trace into its own report and into the global counters
//! let run = RunInput::for_executable(Path::new("bench/hello.exe"));
//! let outcome = session.process(&run).unwrap();
//! println!("{} observations, {} unknown keys", outcome.observations, outcome.misses);
//!
//! // Render the corpus-wide report
//! session.finish(Path::new("bench/global_result.csv")).unwrap();
//! ```

pub mod binary;
pub mod config;
pub mod corpus;
pub mod decoder;
pub mod report;
pub mod store;
pub mod table;
pub mod trace;

use std::fmt;
use std::path::PathBuf;

/// What a counter key identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservationKind {
    /// An IFORM name from the `-mix` statistics table
    Iform,
    /// Raw instruction bytes from an `XDIS` record
    Instruction,
    /// Raw instruction bytes of a branch, call, return or loop
    Branch,
}

impl fmt::Display for ObservationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservationKind::Iform => write!(f, "IFORM"),
            ObservationKind::Instruction => write!(f, "INSTRUCTION"),
            ObservationKind::Branch => write!(f, "BRANCH"),
        }
    }
}

/// One `(key, count)` pair produced by a trace parser.
///
/// Several observations for the same key within a run accumulate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Counter the observation belongs to
    pub kind: ObservationKind,
    /// IFORM name or uppercase instruction hex
    pub key: String,
    /// Execution count to add
    pub count: u64,
    /// Free text seen alongside the key (disassembly text for `XDIS` records)
    pub context: Option<String>,
}

impl Observation {
    /// Observation without context
    pub fn new(kind: ObservationKind, key: impl Into<String>, count: u64) -> Self {
        Self {
            kind,
            key: key.into(),
            count,
            context: None,
        }
    }

    /// Attach the free-text context
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Supported decode architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Architecture {
    /// 32-bit x86
    X86_32,
    /// 64-bit x86
    X86_64,
    /// Anything else
    Unknown,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86_32 => write!(f, "x86-32"),
            Architecture::X86_64 => write!(f, "x86-64"),
            Architecture::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Error type for coverage operations
#[derive(Debug, thiserror::Error)]
pub enum CoverageError {
    /// The IFORM reference table could not be loaded
    #[error(transparent)]
    SpecLoad(#[from] table::SpecLoadError),

    /// A trace file could not be opened or read
    #[error("Failed to read trace {path}: {source}")]
    TraceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A report file could not be opened
    #[error("Failed to open report {path}: {source}")]
    ReportOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// CSV serialization error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Inconsistent run configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}
