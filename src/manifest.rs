//! Content-fingerprint change tracking.
//!
//! The ingestion manifest maps each ingested file path to the SHA-256 digest
//! of its bytes. [`ChangeTracker`] loads it at the start of a run, stages
//! updates as files are processed, and rewrites it atomically on
//! [`commit`](ChangeTracker::commit). Nothing is written before commit, so an
//! interrupted run simply reprocesses the same files next time.
//!
//! Fingerprints depend only on content: moving the docs directory or copying
//! files elsewhere does not mark them as changed.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::{DocletError, Result};

/// Block size used when streaming file content into the hasher.
const HASH_BLOCK_SIZE: usize = 8192;

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub fingerprint: String,
}

/// Compute the lowercase hex SHA-256 digest of a file's content.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| DocletError::load(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut block = [0u8; HASH_BLOCK_SIZE];
    loop {
        let n = reader
            .read(&mut block)
            .map_err(|e| DocletError::load(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Loads, queries and atomically persists the ingestion manifest.
#[derive(Debug)]
pub struct ChangeTracker {
    manifest_path: PathBuf,
    committed: BTreeMap<String, String>,
    staged: BTreeMap<String, String>,
    forgotten: Vec<String>,
}

impl ChangeTracker {
    /// Load the manifest at `manifest_path`. A missing file is an empty manifest.
    pub fn load(manifest_path: impl Into<PathBuf>) -> Result<Self> {
        let manifest_path = manifest_path.into();
        let committed = if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)
                .map_err(|e| DocletError::manifest(&manifest_path, e))?;
            serde_json::from_str(&content).map_err(|e| DocletError::manifest(&manifest_path, e))?
        } else {
            BTreeMap::new()
        };

        tracing::debug!(
            manifest = %manifest_path.display(),
            entries = committed.len(),
            "loaded ingestion manifest"
        );

        Ok(Self {
            manifest_path,
            committed,
            staged: BTreeMap::new(),
            forgotten: Vec::new(),
        })
    }

    /// Fingerprint the file at `path` and pair it with the manifest key.
    pub fn inspect(&self, path: &Path) -> Result<FileRecord> {
        Ok(FileRecord {
            path: manifest_key(path),
            fingerprint: fingerprint_file(path)?,
        })
    }

    /// Whether `record` differs from what the manifest has on file.
    pub fn is_changed(&self, record: &FileRecord) -> bool {
        self.committed.get(&record.path) != Some(&record.fingerprint)
    }

    /// True if the file at `path` is new or its content differs from the
    /// recorded fingerprint.
    pub fn needs_ingestion(&self, path: &Path) -> Result<bool> {
        let record = self.inspect(path)?;
        Ok(self.is_changed(&record))
    }

    /// Stage an entry. Not durable until [`commit`](Self::commit).
    pub fn record_ingested(&mut self, path: &Path, fingerprint: impl Into<String>) {
        self.staged.insert(manifest_key(path), fingerprint.into());
    }

    /// Stage the removal of an entry. Not durable until [`commit`](Self::commit).
    pub fn forget(&mut self, path: &str) {
        self.staged.remove(path);
        self.forgotten.push(path.to_string());
    }

    /// Paths recorded in the committed manifest.
    pub fn known_paths(&self) -> impl Iterator<Item = &str> {
        self.committed.keys().map(String::as_str)
    }

    pub fn has_pending(&self) -> bool {
        !self.staged.is_empty() || !self.forgotten.is_empty()
    }

    /// The manifest content that [`commit`](Self::commit) would write.
    pub fn merged(&self) -> BTreeMap<String, String> {
        let mut merged = self.committed.clone();
        for path in &self.forgotten {
            merged.remove(path);
        }
        for (path, fp) in &self.staged {
            merged.insert(path.clone(), fp.clone());
        }
        merged
    }

    /// Atomically write committed entries plus staged updates.
    ///
    /// The new content goes to a temporary file in the manifest's directory
    /// which is then renamed over the old manifest.
    pub fn commit(&mut self) -> Result<()> {
        let merged = self.merged();
        let body = render(&merged).map_err(|e| DocletError::manifest(&self.manifest_path, e))?;

        let dir = match self.manifest_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(body.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.manifest_path)
            .map_err(|e| DocletError::manifest(&self.manifest_path, e.error))?;

        tracing::debug!(
            manifest = %self.manifest_path.display(),
            entries = merged.len(),
            "committed ingestion manifest"
        );

        self.committed = merged;
        self.staged.clear();
        self.forgotten.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }
}

/// Version string for the manifest file on disk.
///
/// Changes whenever an ingestion commits a different set of fingerprints.
/// Used by the session to decide when a cached index handle is stale.
pub fn manifest_version(manifest_path: &Path) -> String {
    match std::fs::read(manifest_path) {
        Ok(bytes) => hex::encode(Sha256::digest(&bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => "empty".to_string(),
        Err(e) => {
            tracing::warn!(manifest = %manifest_path.display(), error = %e, "cannot read manifest");
            "error".to_string()
        }
    }
}

fn manifest_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn render(entries: &BTreeMap<String, String>) -> serde_json::Result<String> {
    let mut body = serde_json::to_string_pretty(entries)?;
    body.push('\n');
    Ok(body)
}
