//! Decoder gateway: raw instruction hex to human-readable disassembly.
//!
//! Decoding never fails past [`decode_or_sentinel`]; reports carry
//! [`DECODE_SENTINEL`] for any key that could not be decoded.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use capstone::arch::x86::ArchMode as X86Mode;
use capstone::{prelude::BuildsCapstone, Capstone};
use log::{debug, warn};

use crate::Architecture;

/// Decoded value written for keys whose decode failed
pub const DECODE_SENTINEL: &str = "DECODE_ERROR";

/// Default bound on one external decoder invocation
pub const DEFAULT_DECODE_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Errors that can occur during decoding
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Input is not an even-length hex string
    #[error("Invalid instruction hex `{0}`")]
    InvalidHex(String),

    /// The decoder process could not be started
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// I/O error talking to the decoder process
    #[error("I/O error from decoder: {0}")]
    Io(#[from] std::io::Error),

    /// The decoder process did not finish in time
    #[error("Decoder timed out after {0:?}")]
    Timeout(Duration),

    /// The decoder process exited unsuccessfully
    #[error("Decoder exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    /// The decoder produced no output
    #[error("Decoder produced no output")]
    EmptyOutput,

    /// Capstone error
    #[error("Capstone error: {0}")]
    CapstoneError(#[from] capstone::Error),

    /// Bytes do not start with a valid instruction
    #[error("No instruction decoded from `{0}`")]
    NoInstruction(String),

    /// Unsupported architecture
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(Architecture),

    /// A previous attempt for the same key failed
    #[error("{0} (cached)")]
    Cached(String),
}

/// Decoder trait: instruction hex to disassembly text.
pub trait InstructionDecoder {
    /// Decode the instruction whose bytes are `hex` (uppercase, no separators).
    fn decode(&self, hex: &str) -> Result<String, DecodeError>;
}

impl<D: InstructionDecoder + ?Sized> InstructionDecoder for Box<D> {
    fn decode(&self, hex: &str) -> Result<String, DecodeError> {
        (**self).decode(hex)
    }
}

impl<D: InstructionDecoder + ?Sized> InstructionDecoder for &D {
    fn decode(&self, hex: &str) -> Result<String, DecodeError> {
        (**self).decode(hex)
    }
}

/// Decode `hex`, substituting [`DECODE_SENTINEL`] on failure.
pub fn decode_or_sentinel(decoder: &dyn InstructionDecoder, hex: &str) -> String {
    match decoder.decode(hex) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to decode {hex}: {e}");
            DECODE_SENTINEL.to_string()
        }
    }
}

/// Convert a hex string into bytes.
pub fn parse_hex(hex: &str) -> Result<Vec<u8>, DecodeError> {
    if hex.is_empty() || hex.len() % 2 != 0 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DecodeError::InvalidHex(hex.to_string()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| DecodeError::InvalidHex(hex.to_string())))
        .collect()
}

/// Decoder backed by the external `xed` command-line tool.
#[derive(Debug, Clone)]
pub struct XedDecoder {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl Default for XedDecoder {
    fn default() -> Self {
        Self {
            program: PathBuf::from("xed"),
            args: vec!["-64".to_string(), "-d".to_string()],
            timeout: DEFAULT_DECODE_TIMEOUT,
        }
    }
}

impl XedDecoder {
    /// `xed -64 -d <HEX>` with the default timeout
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a different program
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Arguments placed before the hex operand
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pick the useful line out of xed's output.
    ///
    /// `xed -d` prints the encoding, an ICLASS/IFORM summary and a `SHORT:`
    /// line; other builds print only the disassembly.
    fn extract(stdout: &str) -> Option<String> {
        let lines: Vec<&str> = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if let Some(short) = lines.iter().find_map(|l| l.strip_prefix("SHORT:")) {
            return Some(short.trim().to_string());
        }
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("; "))
        }
    }
}

impl fmt::Display for XedDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "XedDecoder({})", self.program.display())
    }
}

impl InstructionDecoder for XedDecoder {
    fn decode(&self, hex: &str) -> Result<String, DecodeError> {
        parse_hex(hex)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(hex)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| DecodeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Pipes drain concurrently with the poll loop
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                // Reap the child so no zombie is left behind
                let _ = child.kill();
                let _ = child.wait();
                return Err(DecodeError::Timeout(self.timeout));
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = collect(stdout)?;
        let stderr = collect(stderr)?;

        if !status.success() {
            return Err(DecodeError::Exit {
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        Self::extract(&stdout).ok_or(DecodeError::EmptyOutput)
    }
}

type Drained = thread::JoinHandle<io::Result<String>>;

fn drain<R: Read + Send + 'static>(mut pipe: R) -> Drained {
    thread::spawn(move || {
        let mut text = String::new();
        pipe.read_to_string(&mut text).map(|_| text)
    })
}

fn collect(reader: Option<Drained>) -> Result<String, DecodeError> {
    match reader {
        Some(handle) => handle
            .join()
            .map_err(|_| DecodeError::Io(io::Error::other("pipe reader panicked")))?
            .map_err(DecodeError::Io),
        None => Ok(String::new()),
    }
}

/// In-process decoder built on Capstone.
pub struct CapstoneDecoder {
    arch: Architecture,
    cs: Capstone,
}

impl CapstoneDecoder {
    /// Create a decoder for a specific architecture
    pub fn for_architecture(arch: Architecture) -> Result<Self, DecodeError> {
        let mode = match arch {
            Architecture::X86_32 => X86Mode::Mode32,
            Architecture::X86_64 => X86Mode::Mode64,
            Architecture::Unknown => return Err(DecodeError::UnsupportedArchitecture(arch)),
        };
        let cs = Capstone::new().x86().mode(mode).detail(false).build()?;
        Ok(Self { arch, cs })
    }

    /// Get the architecture of this decoder
    pub fn architecture(&self) -> Architecture {
        self.arch
    }
}

impl fmt::Debug for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapstoneDecoder").field("arch", &self.arch).finish()
    }
}

impl fmt::Display for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapstoneDecoder::{}", self.arch)
    }
}

impl InstructionDecoder for CapstoneDecoder {
    fn decode(&self, hex: &str) -> Result<String, DecodeError> {
        let bytes = parse_hex(hex)?;
        let insns = self.cs.disasm_count(&bytes, 0, 1)?;
        let insn = insns
            .iter()
            .next()
            .ok_or_else(|| DecodeError::NoInstruction(hex.to_string()))?;

        let mnemonic = insn.mnemonic().unwrap_or("");
        let text = match insn.op_str() {
            Some(ops) if !ops.is_empty() => format!("{mnemonic} {ops}"),
            _ => mnemonic.to_string(),
        };
        Ok(text)
    }
}

/// Memoizes another decoder by key, failures included.
pub struct CachingDecoder<D> {
    inner: D,
    cache: RefCell<HashMap<String, Result<String, String>>>,
}

impl<D: InstructionDecoder> CachingDecoder<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Number of distinct keys decoded so far
    pub fn cached(&self) -> usize {
        self.cache.borrow().len()
    }
}

impl<D: InstructionDecoder> InstructionDecoder for CachingDecoder<D> {
    fn decode(&self, hex: &str) -> Result<String, DecodeError> {
        if let Some(hit) = self.cache.borrow().get(hex) {
            debug!("Decode cache hit for {hex}");
            return hit.clone().map_err(DecodeError::Cached);
        }
        let result = self.inner.decode(hex);
        let entry = match &result {
            Ok(text) => Ok(text.clone()),
            Err(e) => Err(e.to_string()),
        };
        self.cache.borrow_mut().insert(hex.to_string(), entry);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Fails for one key, echoes everything else
    struct FlakyDecoder {
        bad: &'static str,
        calls: Cell<usize>,
    }

    impl InstructionDecoder for FlakyDecoder {
        fn decode(&self, hex: &str) -> Result<String, DecodeError> {
            self.calls.set(self.calls.get() + 1);
            if hex == self.bad {
                Err(DecodeError::EmptyOutput)
            } else {
                Ok(format!("insn {hex}"))
            }
        }
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("4883EC28").unwrap(), vec![0x48, 0x83, 0xec, 0x28]);
        assert!(matches!(parse_hex("ABC"), Err(DecodeError::InvalidHex(_))));
        assert!(matches!(parse_hex("ZZ"), Err(DecodeError::InvalidHex(_))));
        assert!(matches!(parse_hex(""), Err(DecodeError::InvalidHex(_))));
    }

    #[test]
    fn test_sentinel_on_failure() {
        let decoder = FlakyDecoder { bad: "FF", calls: Cell::new(0) };
        assert_eq!(decode_or_sentinel(&decoder, "FF"), DECODE_SENTINEL);
        assert_eq!(decode_or_sentinel(&decoder, "90"), "insn 90");
    }

    #[test]
    fn test_cache_memoizes_success_and_failure() {
        let decoder = CachingDecoder::new(FlakyDecoder { bad: "FF", calls: Cell::new(0) });

        assert!(decoder.decode("90").is_ok());
        assert!(decoder.decode("90").is_ok());
        assert!(decoder.decode("FF").is_err());
        assert!(matches!(decoder.decode("FF"), Err(DecodeError::Cached(_))));

        assert_eq!(decoder.inner.calls.get(), 2);
        assert_eq!(decoder.cached(), 2);
    }

    #[test]
    fn test_capstone_decode() {
        let decoder = CapstoneDecoder::for_architecture(Architecture::X86_64).unwrap();
        assert_eq!(decoder.decode("90").unwrap(), "nop");
        assert_eq!(decoder.decode("C3").unwrap(), "ret");
        assert_eq!(decoder.decode("4883EC28").unwrap(), "sub rsp, 0x28");
    }

    #[test]
    fn test_capstone_rejects_garbage() {
        let decoder = CapstoneDecoder::for_architecture(Architecture::X86_64).unwrap();
        assert!(decoder.decode("0F").is_err());
        assert!(CapstoneDecoder::for_architecture(Architecture::Unknown).is_err());
    }

    #[test]
    fn test_xed_missing_program() {
        let decoder = XedDecoder::new().with_program("/nonexistent/xed");
        assert!(matches!(decoder.decode("90"), Err(DecodeError::Spawn { .. })));
        assert_eq!(decode_or_sentinel(&decoder, "90"), DECODE_SENTINEL);
    }

    #[cfg(unix)]
    #[test]
    fn test_xed_nonzero_exit() {
        let decoder = XedDecoder::new().with_program("false").with_args(Vec::<String>::new());
        assert!(matches!(decoder.decode("90"), Err(DecodeError::Exit { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_external_output_is_used() {
        let decoder = XedDecoder::new().with_program("echo").with_args(["SHORT: nop"]);
        // echo prints "SHORT: nop 90"
        assert_eq!(decoder.decode("90").unwrap(), "nop 90");
    }

    #[cfg(unix)]
    #[test]
    fn test_xed_timeout() {
        let decoder = XedDecoder::new()
            .with_program("sleep")
            .with_args(Vec::<String>::new())
            .with_timeout(Duration::from_millis(50));
        // `sleep 90` runs for 90 seconds
        let start = Instant::now();
        assert!(matches!(decoder.decode("90"), Err(DecodeError::Timeout(_))));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn test_output_larger_than_pipe_buffer() {
        let script = "head -c 200000 /dev/zero | tr '\\0' a; echo; echo SHORT: nop";
        let decoder = XedDecoder::new()
            .with_program("sh")
            .with_args(["-c", script, "sh"])
            .with_timeout(Duration::from_secs(2));
        assert_eq!(decoder.decode("90").unwrap(), "nop");
    }

    #[test]
    fn test_extract_short_line() {
        let out = "4883EC28\nICLASS: SUB   CATEGORY: BINARY\nSHORT: sub rsp, 0x28\n";
        assert_eq!(XedDecoder::extract(out).as_deref(), Some("sub rsp, 0x28"));
        assert_eq!(XedDecoder::extract("  \n").as_deref(), None);
        assert_eq!(XedDecoder::extract("nop\n").as_deref(), Some("nop"));
    }
}
