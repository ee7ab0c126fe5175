//! Line-oriented parsers for SDE profiler output.
//!
//! Both parsers are single pass and permissive: a line that matches nothing
//! is ignored, never an error.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::OnceLock;

use log::debug;
use regex::Regex;

use crate::{CoverageError, Observation, ObservationKind};

/// Line that opens the global statistics region of a `-mix` report
pub const GLOBAL_STATS_MARKER: &str = "# EMIT_GLOBAL_DYNAMIC_STATS";

/// Instruction prefixes that may precede the mnemonic in disassembly text
const PREFIXES: &[&str] = &[
    "lock", "rep", "repe", "repz", "repne", "repnz", "bnd", "notrack", "data16", "addr32",
];

static BLOCK_PATTERN: OnceLock<Regex> = OnceLock::new();
static XDIS_PATTERN: OnceLock<Regex> = OnceLock::new();
static BRANCH_PATTERN: OnceLock<Regex> = OnceLock::new();

fn block_pattern() -> &'static Regex {
    BLOCK_PATTERN.get_or_init(|| Regex::new(r"^\s*BLOCK:\s*(\d+)\b.*\bEXECUTIONS:\s*(\d+)").unwrap())
}

fn xdis_pattern() -> &'static Regex {
    XDIS_PATTERN.get_or_init(|| {
        Regex::new(r"^\s*XDIS\s+([0-9A-Fa-f]+):\s+(\S+)\s+([0-9A-Fa-f]+)(?:\s+(.*?))?\s*$").unwrap()
    })
}

fn branch_pattern() -> &'static Regex {
    BRANCH_PATTERN.get_or_init(|| Regex::new(r"(?i)^(j[a-z]*|call[a-z]*|ret[a-z]*|loop[a-z]*)$").unwrap())
}

/// Returns true if the disassembly text starts with a jump, call, return or loop.
pub fn is_branch(disasm: &str) -> bool {
    disasm
        .split_whitespace()
        .find(|token| !PREFIXES.contains(&token.to_ascii_lowercase().as_str()))
        .is_some_and(|mnemonic| branch_pattern().is_match(mnemonic))
}

/// Which trace layout a file uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    /// Flat `<iform> <count>` table after the global stats marker
    Mix,
    /// `BLOCK:` / `XDIS` listing
    Disassembly,
}

impl TraceMode {
    /// Sniff a trace file; `None` when neither layout is recognized.
    pub fn detect(path: &Path) -> Result<Option<TraceMode>, CoverageError> {
        let mut mode = None;
        for_each_line(path, |line| {
            if line.starts_with(GLOBAL_STATS_MARKER) {
                mode = Some(TraceMode::Mix);
            } else if block_pattern().is_match(line) || xdis_pattern().is_match(line) {
                mode = Some(TraceMode::Disassembly);
            }
            if mode.is_some() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
        Ok(mode)
    }
}

/// A stateful line parser producing observations.
pub trait TraceParser {
    /// Feed one line (without its terminator), pushing any observations to `out`.
    fn parse_line(&mut self, line: &str, out: &mut Vec<Observation>);
}

/// Parser for the `-mix -iform` statistics table.
#[derive(Debug, Default)]
pub struct MixParser {
    in_stats: bool,
}

impl MixParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the global stats marker has been seen
    pub fn in_stats(&self) -> bool {
        self.in_stats
    }
}

impl TraceParser for MixParser {
    fn parse_line(&mut self, line: &str, out: &mut Vec<Observation>) {
        if !self.in_stats {
            if line.starts_with(GLOBAL_STATS_MARKER) {
                self.in_stats = true;
            }
            return;
        }
        if line.starts_with('#') || line.starts_with('*') {
            return;
        }

        let mut tokens = line.split_whitespace();
        let (Some(key), Some(count)) = (tokens.next(), tokens.next()) else {
            return;
        };
        match count.parse::<u64>() {
            Ok(count) => out.push(Observation::new(ObservationKind::Iform, key, count)),
            Err(_) => debug!("Ignoring stats line with non-numeric count: {line}"),
        }
    }
}

/// Parser for the block-structured disassembly listing.
///
/// Every `XDIS` record is counted with the execution count of the most
/// recent `BLOCK:` line. Records before the first block are counted with 0.
#[derive(Debug, Default)]
pub struct BlockParser {
    current_block_count: u64,
    blocks_seen: usize,
}

impl BlockParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execution count of the active block
    pub fn current_block_count(&self) -> u64 {
        self.current_block_count
    }

    /// Number of block markers seen so far
    pub fn blocks_seen(&self) -> usize {
        self.blocks_seen
    }
}

impl TraceParser for BlockParser {
    fn parse_line(&mut self, line: &str, out: &mut Vec<Observation>) {
        if let Some(caps) = block_pattern().captures(line) {
            match caps[2].parse::<u64>() {
                Ok(count) => {
                    self.current_block_count = count;
                    self.blocks_seen += 1;
                }
                Err(_) => debug!("Ignoring block with unparsable execution count: {line}"),
            }
            return;
        }

        let Some(caps) = xdis_pattern().captures(line) else {
            return;
        };
        let hex = caps[3].to_ascii_uppercase();
        let disasm = caps.get(4).map_or("", |m| m.as_str());

        if self.blocks_seen == 0 {
            debug!("XDIS record {hex} before any block, counting 0");
        }

        let instruction = Observation::new(ObservationKind::Instruction, hex, self.current_block_count)
            .with_context(disasm);
        if is_branch(disasm) {
            out.push(Observation {
                kind: ObservationKind::Branch,
                ..instruction.clone()
            });
        }
        out.push(instruction);
    }
}

/// Stream `path` line by line, decoding invalid UTF-8 lossily.
/// Visit each line of `path` until the visitor breaks.
///
/// Returns the number of lines visited.
fn for_each_line<F>(path: &Path, mut f: F) -> Result<usize, CoverageError>
where
    F: FnMut(&str) -> ControlFlow<()>,
{
    let read_error = |source| CoverageError::TraceRead {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(read_error)?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut visited = 0;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).map_err(read_error)? == 0 {
            break;
        }
        visited += 1;
        let line = String::from_utf8_lossy(&buf);
        if f(line.trim_end_matches(['\n', '\r'])).is_break() {
            break;
        }
    }
    Ok(visited)
}

/// Parse a trace file, handing every observation to `sink`.
///
/// Returns the number of observations produced.
pub fn read_trace<P, F>(path: &Path, parser: &mut P, mut sink: F) -> Result<usize, CoverageError>
where
    P: TraceParser + ?Sized,
    F: FnMut(Observation),
{
    let mut pending = Vec::new();
    let mut produced = 0;

    for_each_line(path, |line| {
        parser.parse_line(line, &mut pending);
        produced += pending.len();
        pending.drain(..).for_each(&mut sink);
        ControlFlow::Continue(())
    })?;

    Ok(produced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    fn parse_all<P: TraceParser>(parser: &mut P, text: &str) -> Vec<Observation> {
        let mut out = Vec::new();
        for line in text.lines() {
            parser.parse_line(line, &mut out);
        }
        out
    }

    #[test]
    fn test_mix_ignores_lines_before_marker() {
        let text = "NOP 100\n# EMIT_GLOBAL_DYNAMIC_STATS EMIT# 1\nNOP 5\nADD 3 extra\n";
        let obs = parse_all(&mut MixParser::new(), text);

        assert_eq!(obs.len(), 2);
        assert_eq!(obs[0], Observation::new(ObservationKind::Iform, "NOP", 5));
        assert_eq!(obs[1], Observation::new(ObservationKind::Iform, "ADD", 3));
    }

    #[test]
    fn test_mix_skips_comments_and_separators() {
        let text = "\
# EMIT_GLOBAL_DYNAMIC_STATS
# iform count
*total 8
NOP 5

LONELY
MOV lots
ADD 3
";
        let obs = parse_all(&mut MixParser::new(), text);
        let keys: Vec<_> = obs.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["NOP", "ADD"]);
    }

    #[test]
    fn test_mix_without_marker_yields_nothing() {
        let mut parser = MixParser::new();
        assert!(parse_all(&mut parser, "NOP 5\nADD 3\n").is_empty());
        assert!(!parser.in_stats());
    }

    #[test]
    fn test_block_count_applies_to_records() {
        let text = "\
BLOCK: 1 PC: 00401000 ICOUNT: 1 EXECUTIONS: 10 #BYTES: 1
XDIS 00401000: BASE 90 nop
BLOCK: 2 PC: 00401001 ICOUNT: 1 EXECUTIONS: 3 #BYTES: 5
XDIS 00401001: BASE e8fa000000 call 0x401100
";
        let mut parser = BlockParser::new();
        let obs = parse_all(&mut parser, text);

        assert_eq!(parser.blocks_seen(), 2);
        assert_eq!(parser.current_block_count(), 3);

        let instructions: Vec<_> = obs
            .iter()
            .filter(|o| o.kind == ObservationKind::Instruction)
            .map(|o| (o.key.as_str(), o.count))
            .collect();
        assert_eq!(instructions, vec![("90", 10), ("E8FA000000", 3)]);

        let branches: Vec<_> = obs.iter().filter(|o| o.kind == ObservationKind::Branch).collect();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].key, "E8FA000000");
        assert_eq!(branches[0].context.as_deref(), Some("call 0x401100"));
    }

    #[test]
    fn test_block_count_overwrites() {
        let text = "BLOCK: 1 EXECUTIONS: 10\nBLOCK: 2 EXECUTIONS: 4\nXDIS 0: BASE 90 nop\n";
        let obs = parse_all(&mut BlockParser::new(), text);
        assert_eq!(obs[0].count, 4);
    }

    #[test]
    fn test_records_before_first_block_count_zero() {
        let obs = parse_all(&mut BlockParser::new(), "XDIS 0: BASE c3 ret\n");

        assert_eq!(obs.len(), 2);
        assert!(obs.iter().all(|o| o.key == "C3" && o.count == 0));
    }

    #[test]
    fn test_unmatched_lines_ignored() {
        let text = "garbage\nXDIS zz: BASE 90 nop\nBLOCK: x EXECUTIONS: 1\n";
        let mut parser = BlockParser::new();
        assert!(parse_all(&mut parser, text).is_empty());
        assert_eq!(parser.blocks_seen(), 0);
    }

    #[rstest]
    #[case("jmp 0x401000", true)]
    #[case("JNZ 0x10", true)]
    #[case("call qword ptr [rip+0x10]", true)]
    #[case("ret", true)]
    #[case("loopne 0x20", true)]
    #[case("bnd jmp rax", true)]
    #[case("notrack call rax", true)]
    #[case("mov eax, 1", false)]
    #[case("nop", false)]
    #[case("rep stosb", false)]
    #[case("", false)]
    fn test_branch_classification(#[case] disasm: &str, #[case] expected: bool) {
        assert_eq!(is_branch(disasm), expected);
    }

    #[test]
    fn test_read_trace_streams_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"# EMIT_GLOBAL_DYNAMIC_STATS\r\nNOP 5\r\nADD \xff 3\r\nADD 3\r\n").unwrap();

        let mut seen = Vec::new();
        let produced = read_trace(file.path(), &mut MixParser::new(), |obs| seen.push(obs)).unwrap();

        assert_eq!(produced, 2);
        assert_eq!(seen[1].key, "ADD");
        assert_eq!(seen[1].count, 3);
    }

    #[test]
    fn test_read_trace_missing_file() {
        let err = read_trace(Path::new("/nonexistent/mix-out.txt"), &mut MixParser::new(), |_| {})
            .unwrap_err();
        assert!(matches!(err, CoverageError::TraceRead { .. }));
    }

    #[test]
    fn test_detect_mode() {
        let mut mix = tempfile::NamedTempFile::new().unwrap();
        writeln!(mix, "# header\n# EMIT_GLOBAL_DYNAMIC_STATS\nNOP 1").unwrap();
        let mut disasm = tempfile::NamedTempFile::new().unwrap();
        writeln!(disasm, "BLOCK: 1 EXECUTIONS: 2\nXDIS 0: BASE 90 nop").unwrap();
        let mut neither = tempfile::NamedTempFile::new().unwrap();
        writeln!(neither, "hello").unwrap();

        assert_eq!(TraceMode::detect(mix.path()).unwrap(), Some(TraceMode::Mix));
        assert_eq!(TraceMode::detect(disasm.path()).unwrap(), Some(TraceMode::Disassembly));
        assert_eq!(TraceMode::detect(neither.path()).unwrap(), None);
    }

    #[test]
    fn test_line_visitor_stops_at_break() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "BLOCK: 1 EXECUTIONS: 2").unwrap();
        for i in 0..1000 {
            writeln!(file, "XDIS {i:x}: BASE 90 nop").unwrap();
        }

        let mut calls = 0;
        let visited = for_each_line(file.path(), |line| {
            calls += 1;
            if block_pattern().is_match(line) {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap();
        assert_eq!((visited, calls), (1, 1));

        let visited = for_each_line(file.path(), |_| ControlFlow::Continue(())).unwrap();
        assert_eq!(visited, 1001);
        assert_eq!(TraceMode::detect(file.path()).unwrap(), Some(TraceMode::Disassembly));
    }
}
