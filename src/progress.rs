//! Ingestion progress reporting.
//!
//! Reports what the ingestion pipeline is doing so users see which files are
//! being read and how much work is left. Progress is emitted on **stderr** so
//! stdout keeps only the final summary line.

use std::io::Write;
use std::path::Path;

/// A single progress event emitted by the ingestion pipeline.
#[derive(Clone, Debug)]
pub enum IngestProgressEvent {
    /// Walking the docs directory and fingerprinting files. Total unknown.
    Discovering { docs_dir: String },
    /// Loading file `n` of `total` that needs ingestion.
    Loading { path: String, n: u64, total: u64 },
    /// Files whose fingerprint matched the manifest.
    Skipped { unchanged: u64 },
    /// A file could not be loaded; ingestion continues without it.
    Failed { path: String, error: String },
    /// Splitting loaded documents into fragments.
    Splitting { documents: u64 },
    /// Embedding and indexing fragments.
    Embedding { chunks: u64 },
}

impl IngestProgressEvent {
    pub fn discovering(docs_dir: &Path) -> Self {
        IngestProgressEvent::Discovering {
            docs_dir: docs_dir.display().to_string(),
        }
    }
}

/// Receives progress events. Implementations write to stderr (human or JSON).
pub trait IngestProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

/// Human-friendly progress on stderr: "ingest  loading  3 / 12  docs/guide.md".
pub struct StderrProgress;

impl IngestProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let line = match &event {
            IngestProgressEvent::Discovering { docs_dir } => {
                format!("ingest  checking {} for new or modified documents...\n", docs_dir)
            }
            IngestProgressEvent::Loading { path, n, total } => format!(
                "ingest  loading  {} / {}  {}\n",
                format_number(*n),
                format_number(*total),
                path
            ),
            IngestProgressEvent::Skipped { unchanged } => {
                format!("ingest  {} unchanged files skipped\n", format_number(*unchanged))
            }
            IngestProgressEvent::Failed { path, error } => {
                format!("ingest  FAILED  {}: {}\n", path, error)
            }
            IngestProgressEvent::Splitting { documents } => {
                format!("ingest  splitting {} documents...\n", format_number(*documents))
            }
            IngestProgressEvent::Embedding { chunks } => {
                format!("ingest  embedding {} chunks...\n", format_number(*chunks))
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IngestProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::Discovering { docs_dir } => serde_json::json!({
                "event": "progress",
                "phase": "discovering",
                "docs_dir": docs_dir,
            }),
            IngestProgressEvent::Loading { path, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "loading",
                "path": path,
                "n": n,
                "total": total,
            }),
            IngestProgressEvent::Skipped { unchanged } => serde_json::json!({
                "event": "progress",
                "phase": "skipped",
                "unchanged": unchanged,
            }),
            IngestProgressEvent::Failed { path, error } => serde_json::json!({
                "event": "error",
                "phase": "loading",
                "path": path,
                "error": error,
            }),
            IngestProgressEvent::Splitting { documents } => serde_json::json!({
                "event": "progress",
                "phase": "splitting",
                "documents": documents,
            }),
            IngestProgressEvent::Embedding { chunks } => serde_json::json!({
                "event": "progress",
                "phase": "embedding",
                "chunks": chunks,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IngestProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
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

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
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

    pub fn reporter(&self) -> Box<dyn IngestProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn discovering_event_carries_dir() {
        match IngestProgressEvent::discovering(Path::new("docs")) {
            IngestProgressEvent::Discovering { docs_dir } => assert_eq!(docs_dir, "docs"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
