//! XED IFORM reference table.
//!
//! The table is an ASCII listing: `#` lines are comments, the `#iclass` line
//! names the columns, and every other non-blank line is one whitespace
//! separated row whose fourth token is the IFORM name.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::{debug, info};

/// Prefix of the header line that names the columns
pub const HEADER_PREFIX: &str = "#iclass";

/// Token position of the IFORM name in a data row
pub const IFORM_COLUMN: usize = 3;

/// Errors that can occur while loading the table
#[derive(Debug, thiserror::Error)]
pub enum SpecLoadError {
    /// Spec file could not be opened
    #[error("Failed to open spec file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Read error mid-file
    #[error("I/O error reading spec file: {0}")]
    Io(#[from] std::io::Error),

    /// A data row appeared before the `#iclass` header
    #[error("Line {line}: data row before any `#iclass` header")]
    MissingHeader { line: usize },

    /// A data row does not fit the header
    #[error("Line {line}: {reason}")]
    MalformedRow { line: usize, reason: String },

    /// The same IFORM appears twice
    #[error("Line {line}: duplicate iform `{iform}`")]
    DuplicateIform { line: usize, iform: String },
}

/// One row of the reference table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatEntry {
    /// IFORM name (primary key)
    pub iform: String,
    /// Column values in header order
    pub attributes: Vec<(String, String)>,
    /// Seed execution count
    pub count: u64,
}

impl FormatEntry {
    /// Value of a named column
    pub fn attribute(&self, column: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }
}

/// The loaded IFORM list, keyed by IFORM name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatTable {
    columns: Vec<String>,
    entries: BTreeMap<String, FormatEntry>,
}

impl FormatTable {
    /// Load the table from a file.
    pub fn load(path: &Path) -> Result<Self, SpecLoadError> {
        let file = File::open(path).map_err(|source| SpecLoadError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let table = Self::parse(BufReader::new(file))?;
        info!(
            "Loaded {} iforms ({} columns) from {}",
            table.len(),
            table.columns.len(),
            path.display()
        );
        Ok(table)
    }

    /// Parse the table from any buffered reader.
    pub fn parse<R: BufRead>(reader: R) -> Result<Self, SpecLoadError> {
        let mut table = FormatTable::default();

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let lineno = idx + 1;

            if line.starts_with('#') {
                if line.starts_with(HEADER_PREFIX) {
                    table.columns = line.replace('#', " ").split_whitespace().map(String::from).collect();
                    debug!("Headers are: {}", table.columns.join(", "));
                }
                continue;
            }

            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.is_empty() {
                continue;
            }
            if table.columns.is_empty() {
                return Err(SpecLoadError::MissingHeader { line: lineno });
            }
            if tokens.len() <= IFORM_COLUMN {
                return Err(SpecLoadError::MalformedRow {
                    line: lineno,
                    reason: format!("expected at least {} tokens, found {}", IFORM_COLUMN + 1, tokens.len()),
                });
            }
            if tokens.len() > table.columns.len() {
                return Err(SpecLoadError::MalformedRow {
                    line: lineno,
                    reason: format!("{} tokens for {} columns", tokens.len(), table.columns.len()),
                });
            }

            let iform = tokens[IFORM_COLUMN].to_string();
            if table.entries.contains_key(&iform) {
                return Err(SpecLoadError::DuplicateIform { line: lineno, iform });
            }

            // Short rows are padded so every entry carries every column
            let attributes = table
                .columns
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), tokens.get(i).copied().unwrap_or("").to_string()))
                .collect();

            table.entries.insert(
                iform.clone(),
                FormatEntry {
                    iform,
                    attributes,
                    count: 0,
                },
            );
        }

        Ok(table)
    }

    /// Column names from the header line
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Look up an entry by IFORM name
    pub fn get(&self, iform: &str) -> Option<&FormatEntry> {
        self.entries.get(iform)
    }

    /// Whether the IFORM is known
    pub fn contains(&self, iform: &str) -> bool {
        self.entries.contains_key(iform)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted by IFORM name
    pub fn iter(&self) -> impl Iterator<Item = &FormatEntry> {
        self.entries.values()
    }
}
