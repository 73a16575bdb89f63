//! Ingestion progress reporting and timing.
//!
//! Progress is emitted on **stderr** so stdout stays parseable for scripts.
//! Human mode prints one line per step; JSON mode prints one object per line.

use std::io::Write;
use std::str::FromStr;
use std::time::Instant;

/// A single step of the document pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum IngestEvent {
    Parsing { file: String },
    Parsed { file: String, blocks: usize },
    /// Tables and equations sent to the LLM for a description.
    Describing { file: String, n: u64, total: u64 },
    Chunked { file: String, chunks: usize },
    Embedding { file: String, n: u64, total: u64 },
    Done { file: String, chunks: usize, elapsed_ms: u128 },
    Failed { file: String, error: String },
}

/// Reports ingestion progress. Implementations write to stderr.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &IngestEvent);
}

/// Human-friendly progress: `ingest paper.pdf  embedding  64 / 128 chunks`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &IngestEvent) {
        let line = match event {
            IngestEvent::Parsing { file } => format!("ingest {}  parsing...", file),
            IngestEvent::Parsed { file, blocks } => {
                format!("ingest {}  parsed {} blocks", file, format_number(*blocks as u64))
            }
            IngestEvent::Describing { file, n, total } => format!(
                "ingest {}  describing  {} / {} blocks",
                file,
                format_number(*n),
                format_number(*total)
            ),
            IngestEvent::Chunked { file, chunks } => {
                format!("ingest {}  {} chunks", file, format_number(*chunks as u64))
            }
            IngestEvent::Embedding { file, n, total } => format!(
                "ingest {}  embedding  {} / {} chunks",
                file,
                format_number(*n),
                format_number(*total)
            ),
            IngestEvent::Done {
                file, elapsed_ms, ..
            } => format!("ingest {}  done ({})", file, format_ms(*elapsed_ms)),
            IngestEvent::Failed { file, error } => format!("ingest {}  failed: {}", file, error),
        };
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", line);
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &IngestEvent) {
        let obj = match event {
            IngestEvent::Parsing { file } => serde_json::json!({
                "event": "progress", "file": file, "phase": "parsing"
            }),
            IngestEvent::Parsed { file, blocks } => serde_json::json!({
                "event": "progress", "file": file, "phase": "parsed", "blocks": blocks
            }),
            IngestEvent::Describing { file, n, total } => serde_json::json!({
                "event": "progress", "file": file, "phase": "describing", "n": n, "total": total
            }),
            IngestEvent::Chunked { file, chunks } => serde_json::json!({
                "event": "progress", "file": file, "phase": "chunked", "chunks": chunks
            }),
            IngestEvent::Embedding { file, n, total } => serde_json::json!({
                "event": "progress", "file": file, "phase": "embedding", "n": n, "total": total
            }),
            IngestEvent::Done {
                file,
                chunks,
                elapsed_ms,
            } => serde_json::json!({
                "event": "done", "file": file, "chunks": chunks, "elapsed_ms": *elapsed_ms as u64
            }),
            IngestEvent::Failed { file, error } => serde_json::json!({
                "event": "failed", "file": file, "error": error
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &IngestEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

impl FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "none" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => Err(format!("unknown progress mode '{}': use off, human or json", other)),
        }
    }
}

/// Wall-clock timer for the timing prints.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    start: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start.elapsed().as_millis()
    }

    /// Elapsed time formatted like `1,234 ms`.
    pub fn elapsed(&self) -> String {
        format_ms(self.elapsed_ms())
    }
}

pub fn format_ms(ms: u128) -> String {
    format!("{} ms", format_number(ms as u64))
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}
