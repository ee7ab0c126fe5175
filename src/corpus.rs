//! Corpus driver: one trace at a time, parse, merge, render.
//!
//! A session owns the corpus-wide counters. Each [`CoverageSession::process`]
//! call builds a fresh run store, folds the trace into it, merges it into the
//! global store exactly once and writes the run's report. A run that cannot
//! be processed is logged and skipped by [`run_corpus`]; one whose report
//! cannot be written stays merged and is listed separately.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Serialize;

use crate::config::CoverageConfig;
use crate::decoder::{decode_or_sentinel, CachingDecoder, InstructionDecoder};
use crate::report::{DisasmReport, IformReport, ReportWriter};
use crate::store::{Applied, CounterStore, CoverageSummary};
use crate::table::FormatTable;
use crate::trace::{read_trace, BlockParser, MixParser, TraceMode};
use crate::{CoverageError, ObservationKind};

/// File name of the corpus-wide report in directory mode
pub const GLOBAL_REPORT_NAME: &str = "global_result.csv";

/// Suffix SDE mix output is stored under, next to its executable
pub const TRACE_SUFFIX: &str = "-mix-out.txt";

/// Extension of the executables a corpus directory is scanned for
pub const EXECUTABLE_EXTENSION: &str = "exe";

/// Length of the most-executed listings in a [`RunOutcome`]
pub const TOP_N: usize = 10;

/// Where one run reads its trace and writes its report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInput {
    /// Display name (executable or trace file name)
    pub name: String,
    /// The profiled executable, when known
    pub executable: Option<PathBuf>,
    /// Profiler output to parse
    pub trace: PathBuf,
    /// Per-run report destination
    pub report: PathBuf,
}

impl RunInput {
    /// Run for `dir/name.exe`: trace `dir/name-mix-out.txt`, report `dir/name.csv`.
    pub fn for_executable(exe: &Path) -> Self {
        let stem = exe.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        Self {
            name: file_name(exe),
            executable: Some(exe.to_path_buf()),
            trace: exe.with_file_name(format!("{stem}{TRACE_SUFFIX}")),
            report: exe.with_extension("csv"),
        }
    }

    /// Run for a trace file, reporting next to it unless `report` is given.
    pub fn for_trace(trace: &Path, report: Option<&Path>) -> Self {
        Self {
            name: file_name(trace),
            executable: None,
            trace: trace.to_path_buf(),
            report: report.map_or_else(|| trace.with_extension("csv"), Path::to_path_buf),
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Every `*.exe` in `dir`, sorted by name.
pub fn discover_runs(dir: &Path) -> Result<Vec<RunInput>, CoverageError> {
    let mut executables = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == EXECUTABLE_EXTENSION) {
            executables.push(path);
        }
    }
    executables.sort();
    info!("Found {} executables in {}", executables.len(), dir.display());
    Ok(executables.iter().map(|exe| RunInput::for_executable(exe)).collect())
}

/// What one run (or the final global render) produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub name: String,
    pub report: PathBuf,
    /// Observations the parser emitted
    pub observations: usize,
    /// Observations dropped for unknown keys
    pub misses: usize,
    /// Rows written to the report
    pub rows: usize,
    /// Coverage per counter ("iform", "instruction", "branch")
    pub coverage: BTreeMap<&'static str, CoverageSummary>,
    /// Most executed keys per counter, at most [`TOP_N`] each
    pub top: BTreeMap<&'static str, Vec<TopEntry>>,
}

/// One line of a most-executed listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopEntry {
    pub key: String,
    pub count: u64,
    /// Decoder output, for instruction listings only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded: Option<String>,
}

/// Rank `store` and log the listing under `label`.
fn top_entries(
    name: &str,
    label: &str,
    store: &CounterStore,
    decoder: Option<&dyn InstructionDecoder>,
) -> Vec<TopEntry> {
    let entries: Vec<TopEntry> = store
        .most_common(TOP_N)
        .into_iter()
        .map(|(key, count)| TopEntry {
            key: key.to_string(),
            count,
            decoded: decoder.map(|d| decode_or_sentinel(d, key)),
        })
        .collect();

    if !entries.is_empty() {
        info!("{name}: most executed {label}s");
    }
    for entry in &entries {
        match &entry.decoded {
            Some(text) => info!("  {} executed {} times: {}", entry.key, entry.count, text),
            None => info!("  {} executed {} times", entry.key, entry.count),
        }
    }
    entries
}

/// A run that was logged and skipped.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedRun {
    pub name: String,
    pub reason: String,
}

/// Result of a whole corpus run.
#[derive(Debug, Clone, Serialize)]
pub struct CorpusOutcome {
    pub runs: Vec<RunOutcome>,
    /// Runs whose trace could not be read; nothing of them was merged
    pub skipped: Vec<SkippedRun>,
    /// Runs merged into the global counters whose own report failed
    pub report_failed: Vec<SkippedRun>,
    pub global: Option<RunOutcome>,
}

/// Session trait: the per-mode part of a corpus run.
pub trait CoverageSession {
    /// Parse one trace, merge it into the global counters and write its report.
    fn process(&mut self, run: &RunInput) -> Result<RunOutcome, CoverageError>;

    /// Render the global counters to `report`.
    fn finish(&mut self, report: &Path) -> Result<RunOutcome, CoverageError>;
}

/// Spec-driven session over a closed IFORM universe.
pub struct IformSession<'t> {
    table: &'t FormatTable,
    global: CounterStore,
    observations: usize,
    misses: usize,
}

impl<'t> IformSession<'t> {
    pub fn new(table: &'t FormatTable) -> Self {
        Self {
            table,
            global: CounterStore::seeded(table),
            observations: 0,
            misses: 0,
        }
    }

    /// Corpus-wide counters so far
    pub fn global(&self) -> &CounterStore {
        &self.global
    }

    /// Parse `trace` into a fresh run store and merge it.
    pub fn collect(&mut self, trace: &Path) -> Result<(CounterStore, usize, usize), CoverageError> {
        let mut run = CounterStore::seeded(self.table);
        let mut misses = 0;
        let observations = read_trace(trace, &mut MixParser::new(), |obs| {
            if run.apply(&obs) == Applied::Unknown {
                misses += 1;
            }
        })?;

        self.global.merge(&run);
        self.observations += observations;
        self.misses += misses;
        Ok((run, observations, misses))
    }
}

impl CoverageSession for IformSession<'_> {
    fn process(&mut self, input: &RunInput) -> Result<RunOutcome, CoverageError> {
        info!("Processing {} ({})", input.name, input.trace.display());
        let (run, observations, misses) = self.collect(&input.trace)?;

        let mut out = ReportWriter::open(&input.report)?;
        let rows = IformReport::render(self.table, &run, &mut out)?;

        let summary = run.summary();
        info!(
            "{}: {}/{} iforms covered ({:.1}%), {} unknown keys",
            input.name, summary.covered, summary.total, summary.percent, misses
        );
        Ok(RunOutcome {
            name: input.name.clone(),
            report: input.report.clone(),
            observations,
            misses,
            rows,
            coverage: BTreeMap::from([("iform", summary)]),
            top: BTreeMap::from([("iform", top_entries(&input.name, "iform", &run, None))]),
        })
    }

    fn finish(&mut self, report: &Path) -> Result<RunOutcome, CoverageError> {
        let mut out = ReportWriter::open(report)?;
        let rows = IformReport::render(self.table, &self.global, &mut out)?;
        Ok(RunOutcome {
            name: "global".to_string(),
            report: report.to_path_buf(),
            observations: self.observations,
            misses: self.misses,
            rows,
            coverage: BTreeMap::from([("iform", self.global.summary())]),
            top: BTreeMap::from([("iform", top_entries("global", "iform", &self.global, None))]),
        })
    }
}

/// Disassembly-driven session over open instruction and branch universes.
pub struct DisasmSession<D> {
    decoder: D,
    instructions: CounterStore,
    branches: CounterStore,
    observations: usize,
}

impl<D: InstructionDecoder> DisasmSession<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            instructions: CounterStore::open(),
            branches: CounterStore::open(),
            observations: 0,
        }
    }

    /// Corpus-wide instruction counters
    pub fn instructions(&self) -> &CounterStore {
        &self.instructions
    }

    /// Corpus-wide branch counters
    pub fn branches(&self) -> &CounterStore {
        &self.branches
    }

    /// Parse `trace` into fresh instruction and branch stores and merge them.
    pub fn collect(&mut self, trace: &Path) -> Result<(CounterStore, CounterStore, usize), CoverageError> {
        let mut instructions = CounterStore::open();
        let mut branches = CounterStore::open();
        let observations = read_trace(trace, &mut BlockParser::new(), |obs| {
            let store = match obs.kind {
                ObservationKind::Branch => &mut branches,
                _ => &mut instructions,
            };
            store.apply(&obs);
        })?;

        self.instructions.merge(&instructions);
        self.branches.merge(&branches);
        self.observations += observations;
        Ok((instructions, branches, observations))
    }

    fn coverage(instructions: &CounterStore, branches: &CounterStore) -> BTreeMap<&'static str, CoverageSummary> {
        BTreeMap::from([
            ("instruction", instructions.summary()),
            ("branch", branches.summary()),
        ])
    }

    fn top(
        &self,
        name: &str,
        instructions: &CounterStore,
        branches: &CounterStore,
    ) -> BTreeMap<&'static str, Vec<TopEntry>> {
        let decoder: &dyn InstructionDecoder = &self.decoder;
        BTreeMap::from([
            ("instruction", top_entries(name, "instruction", instructions, Some(decoder))),
            ("branch", top_entries(name, "branch", branches, None)),
        ])
    }
}

impl<D: InstructionDecoder> CoverageSession for DisasmSession<D> {
    fn process(&mut self, input: &RunInput) -> Result<RunOutcome, CoverageError> {
        info!("Processing {} ({})", input.name, input.trace.display());
        let (instructions, branches, observations) = self.collect(&input.trace)?;

        let mut out = ReportWriter::open(&input.report)?;
        let rows = DisasmReport::render(&instructions, &branches, &self.decoder, &mut out)?;

        info!(
            "{}: {} distinct instructions, {} distinct branches",
            input.name,
            instructions.len(),
            branches.len()
        );
        Ok(RunOutcome {
            name: input.name.clone(),
            report: input.report.clone(),
            observations,
            misses: 0,
            rows,
            coverage: Self::coverage(&instructions, &branches),
            top: self.top(&input.name, &instructions, &branches),
        })
    }

    fn finish(&mut self, report: &Path) -> Result<RunOutcome, CoverageError> {
        let mut out = ReportWriter::open(report)?;
        let rows = DisasmReport::render(&self.instructions, &self.branches, &self.decoder, &mut out)?;
        Ok(RunOutcome {
            name: "global".to_string(),
            report: report.to_path_buf(),
            observations: self.observations,
            misses: 0,
            rows,
            coverage: Self::coverage(&self.instructions, &self.branches),
            top: self.top("global", &self.instructions, &self.branches),
        })
    }
}

/// Process `runs` in order, skipping failed runs, then render the global report.
///
/// A trace read failure leaves the global counters untouched. Any later
/// failure happens after the merge and is recorded in `report_failed`.
pub fn run_corpus(
    session: &mut dyn CoverageSession,
    runs: &[RunInput],
    global_report: Option<&Path>,
) -> Result<CorpusOutcome, CoverageError> {
    let mut outcome = CorpusOutcome {
        runs: Vec::new(),
        skipped: Vec::new(),
        report_failed: Vec::new(),
        global: None,
    };

    for run in runs {
        match session.process(run) {
            Ok(done) => outcome.runs.push(done),
            Err(e @ CoverageError::TraceRead { .. }) => {
                warn!("Skipping {}: {}", run.name, e);
                outcome.skipped.push(SkippedRun {
                    name: run.name.clone(),
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                warn!("Report for {} failed, counts kept in the global report: {}", run.name, e);
                outcome.report_failed.push(SkippedRun {
                    name: run.name.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    if let Some(path) = global_report {
        let global = session.finish(path)?;
        info!("Wrote global report {}", path.display());
        outcome.global = Some(global);
    }

    info!(
        "Processed {} runs, skipped {}, {} report failures",
        outcome.runs.len(),
        outcome.skipped.len(),
        outcome.report_failed.len()
    );
    Ok(outcome)
}

/// Run a whole corpus as described by `config`.
pub fn execute(config: &CoverageConfig) -> Result<CorpusOutcome, CoverageError> {
    let runs = config.runs()?;
    if runs.is_empty() {
        warn!("Nothing to process");
    }
    let global_report = config.global_report_path();

    match config.resolve_mode(&runs)? {
        TraceMode::Mix => {
            let spec = config
                .spec
                .as_deref()
                .ok_or_else(|| CoverageError::Config("iform mode requires a spec file".to_string()))?;
            let table = FormatTable::load(spec)?;
            let mut session = IformSession::new(&table);
            run_corpus(&mut session, &runs, global_report.as_deref())
        }
        TraceMode::Disassembly => {
            let decoder = config.build_decoder(&runs)?;
            let mut session = DisasmSession::new(CachingDecoder::new(decoder));
            run_corpus(&mut session, &runs, global_report.as_deref())
        }
    }
}
