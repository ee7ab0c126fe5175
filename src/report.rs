//! CSV coverage reports.
//!
//! Reports are opened in append mode; the header row is written only when the
//! destination is new or empty, so re-rendering into an existing report never
//! duplicates it. Rows are flushed one at a time, which keeps an interrupted
//! report a valid prefix.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::Local;
use log::{debug, info};
use serde::Serialize;

use crate::decoder::{decode_or_sentinel, InstructionDecoder};
use crate::store::CounterStore;
use crate::table::FormatTable;
use crate::{CoverageError, ObservationKind};

/// Column holding the execution count in IFORM reports
pub const COUNT_COLUMN: &str = "count";

/// Derived column
pub const COVERED_COLUMN: &str = "covered";

/// Header of disassembly reports
pub const DISASM_HEADER: [&str; 7] = ["Timestamp", "Type", "Hex", "Count", "Decoded", "Context", COVERED_COLUMN];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// `Yes` iff the key was executed at least once
pub fn covered(count: u64) -> &'static str {
    if count > 0 {
        "Yes"
    } else {
        "No"
    }
}

/// Create-or-append CSV destination.
pub struct ReportWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
    needs_header: bool,
    rows: usize,
}

impl ReportWriter {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> Result<Self, CoverageError> {
        let open_error = |source| CoverageError::ReportOpen {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(open_error)?;
        let needs_header = file.metadata().map_err(open_error)?.len() == 0;
        debug!(
            "Opened report {} ({})",
            path.display(),
            if needs_header { "new" } else { "appending" }
        );

        Ok(Self {
            path: path.to_path_buf(),
            writer: csv::WriterBuilder::new().has_headers(false).from_writer(file),
            needs_header,
            rows: 0,
        })
    }

    /// Write the header unless the destination already has content.
    pub fn write_header<I, T>(&mut self, header: I) -> Result<(), CoverageError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        if self.needs_header {
            self.writer.write_record(header)?;
            self.writer.flush()?;
            self.needs_header = false;
        }
        Ok(())
    }

    /// Write one record and flush it.
    pub fn write_row<I, T>(&mut self, row: I) -> Result<(), CoverageError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.writer.write_record(row)?;
        self.finish_row()
    }

    /// Serialize one record and flush it.
    pub fn serialize_row<S: Serialize>(&mut self, row: &S) -> Result<(), CoverageError> {
        self.writer.serialize(row)?;
        self.finish_row()
    }

    fn finish_row(&mut self) -> Result<(), CoverageError> {
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    /// Data rows written through this writer
    pub fn rows_written(&self) -> usize {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// IFORM report: every table column, then `count` and `covered`.
pub struct IformReport;

impl IformReport {
    /// Header for `table`
    pub fn header(table: &FormatTable) -> Vec<String> {
        let mut header = table.columns().to_vec();
        header.push(COUNT_COLUMN.to_string());
        header.push(COVERED_COLUMN.to_string());
        header
    }

    /// Render a closed store, one row per IFORM in name order.
    pub fn render(table: &FormatTable, store: &CounterStore, out: &mut ReportWriter) -> Result<usize, CoverageError> {
        out.write_header(Self::header(table))?;

        let mut rows = 0;
        for (iform, count) in store.iter() {
            let mut row: Vec<String> = match table.get(iform) {
                Some(entry) => entry.attributes.iter().map(|(_, v)| v.clone()).collect(),
                None => table.columns().iter().map(|_| String::new()).collect(),
            };
            row.push(count.to_string());
            row.push(covered(count).to_string());
            out.write_row(&row)?;
            rows += 1;
        }

        info!("Wrote {} iform rows to {}", rows, out.path().display());
        Ok(rows)
    }
}

#[derive(Serialize)]
struct DisasmRow<'a> {
    timestamp: &'a str,
    kind: String,
    hex: &'a str,
    count: u64,
    decoded: String,
    context: &'a str,
    covered: &'static str,
}

/// Disassembly report: instruction rows, then branch rows.
pub struct DisasmReport;

impl DisasmReport {
    /// Render both open stores, decoding every key through `decoder`.
    pub fn render(
        instructions: &CounterStore,
        branches: &CounterStore,
        decoder: &dyn InstructionDecoder,
        out: &mut ReportWriter,
    ) -> Result<usize, CoverageError> {
        out.write_header(DISASM_HEADER)?;

        let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        let mut rows = 0;

        for (kind, store) in [
            (ObservationKind::Instruction, instructions),
            (ObservationKind::Branch, branches),
        ] {
            for (hex, count) in store.iter() {
                out.serialize_row(&DisasmRow {
                    timestamp: &timestamp,
                    kind: kind.to_string(),
                    hex,
                    count,
                    decoded: decode_or_sentinel(decoder, hex),
                    context: store.context(hex).unwrap_or(""),
                    covered: covered(count),
                })?;
                rows += 1;
            }
        }

        info!(
            "Wrote {} instruction and {} branch rows to {}",
            instructions.len(),
            branches.len(),
            out.path().display()
        );
        Ok(rows)
    }
}
