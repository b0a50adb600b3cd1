//! Ingestion pipeline orchestration.
//!
//! Coordinates the on-demand ingestion flow: change tracking → loading →
//! chunking → embedding → indexing. Files run one at a time in path order.
//!
//! A file that fails to load is reported and skipped; its manifest entry is
//! left alone so the next run retries it. The manifest is committed only
//! after the index accepted every new fragment, and every file about to be
//! indexed first has its stored fragments removed, so rerunning after a
//! failed run does not duplicate anything.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::chunk::Chunker;
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{DocletError, Result};
use crate::index::{index_exists, IndexGateway, SqliteIndex};
use crate::loader::{self, relative_path};
use crate::manifest::{ChangeTracker, FileRecord};
use crate::models::RawDocument;
use crate::progress::{IngestProgressEvent, IngestProgressReporter};

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOptions {
    /// Evict fragments and manifest entries of files that no longer exist.
    pub prune: bool,
}

/// How an ingestion run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The docs directory did not exist and was created empty.
    CreatedDocsDir(PathBuf),
    /// Every file matched its recorded fingerprint (or failed to load).
    NothingToIngest,
    Ingested { documents: usize, chunks: usize },
}

/// Summary of one ingestion run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub outcome: IngestOutcome,
    /// Files that could not be read, with the reason.
    pub failures: Vec<(PathBuf, String)>,
    /// Unchanged files that were skipped.
    pub unchanged: usize,
    /// Files evicted with [`IngestOptions::prune`].
    pub pruned: Vec<String>,
}

impl IngestReport {
    fn new(outcome: IngestOutcome) -> Self {
        Self {
            outcome,
            failures: Vec::new(),
            unchanged: 0,
            pruned: Vec::new(),
        }
    }
}

impl fmt::Display for IngestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            IngestOutcome::CreatedDocsDir(dir) => {
                write!(f, "Created {}. Please upload documents.", dir.display())
            }
            IngestOutcome::NothingToIngest => write!(f, "No new or changed documents to ingest."),
            IngestOutcome::Ingested { documents, chunks } => write!(
                f,
                "Success! Ingested {} documents ({} chunks).",
                documents, chunks
            ),
        }
    }
}

/// A file that loaded successfully and is waiting to be indexed.
struct LoadedFile {
    path: PathBuf,
    record: FileRecord,
}

/// Run the ingestion pipeline against the configured docs directory, index
/// and manifest.
pub async fn run_ingest(
    config: &Config,
    embedder: Arc<dyn Embedder>,
    reporter: &dyn IngestProgressReporter,
    options: IngestOptions,
) -> Result<IngestReport> {
    let docs_dir = &config.paths.docs_dir;
    if !docs_dir.exists() {
        std::fs::create_dir_all(docs_dir)?;
        tracing::info!(dir = %docs_dir.display(), "created docs directory");
        return Ok(IngestReport::new(IngestOutcome::CreatedDocsDir(docs_dir.clone())));
    }

    reporter.report(IngestProgressEvent::discovering(docs_dir));
    let mut tracker = ChangeTracker::load(&config.paths.manifest)?;
    let files = loader::discover(docs_dir).map_err(|e| DocletError::load(docs_dir, format!("{:#}", e)))?;

    let mut report = IngestReport::new(IngestOutcome::NothingToIngest);
    let mut pending = Vec::new();
    for path in files {
        match tracker.inspect(&path) {
            Ok(record) if tracker.is_changed(&record) => pending.push((path, record)),
            Ok(_) => report.unchanged += 1,
            Err(e) => record_failure(&mut report, reporter, &path, e),
        }
    }
    reporter.report(IngestProgressEvent::Skipped {
        unchanged: report.unchanged as u64,
    });

    let mut documents: Vec<RawDocument> = Vec::new();
    let mut loaded: Vec<LoadedFile> = Vec::new();
    let total = pending.len() as u64;
    for (n, (path, record)) in pending.into_iter().enumerate() {
        reporter.report(IngestProgressEvent::Loading {
            path: path.display().to_string(),
            n: n as u64 + 1,
            total,
        });
        match loader::load_file(&path, docs_dir) {
            Ok(docs) => {
                tracing::debug!(path = %path.display(), documents = docs.len(), "loaded file");
                documents.extend(docs);
                loaded.push(LoadedFile { path, record });
            }
            Err(e) => record_failure(&mut report, reporter, &path, e),
        }
    }

    let removed: Vec<String> = if options.prune {
        tracker
            .known_paths()
            .filter(|key| !Path::new(key).exists())
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    if documents.is_empty() {
        if !removed.is_empty() {
            let gateway = if index_exists(&config.paths.index_dir) {
                let index = SqliteIndex::open_or_create(&config.paths.index_dir)
                    .await
                    .map_err(|e| DocletError::Index(format!("{:#}", e)))?;
                Some(IndexGateway::new(embedder, Arc::new(index)))
            } else {
                None
            };
            prune_removed(gateway.as_ref(), &mut tracker, docs_dir, &removed, &mut report).await?;
            tracker.commit()?;
        }
        return Ok(report);
    }

    reporter.report(IngestProgressEvent::Splitting {
        documents: documents.len() as u64,
    });
    let fragments = Chunker::from_config(&config.chunking).split(&documents);
    tracing::info!(
        documents = documents.len(),
        fragments = fragments.len(),
        "split documents"
    );

    let index = SqliteIndex::open_or_create(&config.paths.index_dir)
        .await
        .map_err(|e| DocletError::Index(format!("{:#}", e)))?;
    let gateway = IndexGateway::new(embedder, Arc::new(index))
        .with_batch_size(config.embedding.batch_size);

    // Also clears fragments left by a run that failed before its commit.
    for file in &loaded {
        let relative = relative_path(&file.path, docs_dir);
        let deleted = gateway.remove_path(&relative).await?;
        if deleted > 0 {
            tracing::info!(path = %relative, deleted, "replacing previously indexed fragments");
        }
    }
    prune_removed(Some(&gateway), &mut tracker, docs_dir, &removed, &mut report).await?;

    reporter.report(IngestProgressEvent::Embedding {
        chunks: fragments.len() as u64,
    });
    let chunks = gateway.add(&fragments).await?;

    for file in &loaded {
        tracker.record_ingested(&file.path, file.record.fingerprint.clone());
    }
    tracker.commit()?;

    report.outcome = IngestOutcome::Ingested {
        documents: documents.len(),
        chunks,
    };
    Ok(report)
}

/// Forget removed files in the manifest and drop their fragments when an
/// index exists.
async fn prune_removed(
    gateway: Option<&IndexGateway>,
    tracker: &mut ChangeTracker,
    docs_dir: &Path,
    removed: &[String],
    report: &mut IngestReport,
) -> Result<()> {
    for key in removed {
        let deleted = match gateway {
            Some(gateway) => {
                let relative = relative_path(Path::new(key), docs_dir);
                gateway.remove_path(&relative).await?
            }
            None => 0,
        };
        tracing::info!(path = %key, deleted, "pruned removed file");
        tracker.forget(key);
        report.pruned.push(key.clone());
    }
    Ok(())
}

fn record_failure(
    report: &mut IngestReport,
    reporter: &dyn IngestProgressReporter,
    path: &Path,
    error: DocletError,
) {
    let reason = match &error {
        DocletError::Load { reason, .. } => reason.clone(),
        other => other.to_string(),
    };
    tracing::warn!(path = %path.display(), error = %reason, "skipping file that failed to load");
    reporter.report(IngestProgressEvent::Failed {
        path: path.display().to_string(),
        error: reason.clone(),
    });
    report.failures.push((path.to_path_buf(), reason));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_strings() {
        let mut report = IngestReport::new(IngestOutcome::CreatedDocsDir(PathBuf::from("docs")));
        assert_eq!(report.to_string(), "Created docs. Please upload documents.");

        report.outcome = IngestOutcome::NothingToIngest;
        assert_eq!(report.to_string(), "No new or changed documents to ingest.");

        report.outcome = IngestOutcome::Ingested {
            documents: 3,
            chunks: 17,
        };
        assert_eq!(report.to_string(), "Success! Ingested 3 documents (17 chunks).");
    }
}
