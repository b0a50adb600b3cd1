//! Vector index abstraction and the gateway the pipelines talk to.
//!
//! The [`VectorIndex`] trait is the narrow contract of the external similarity
//! store: add items, query the `k` nearest vectors restricted to a set of
//! allowed sources, list stored metadata. Two implementations ship here:
//!
//! - [`SqliteIndex`]: persisted in a directory as a SQLite file; vectors are
//!   little-endian `f32` BLOBs ranked by brute-force squared-L2 distance.
//! - [`InMemoryIndex`]: same semantics behind a `RwLock`, for tests.
//!
//! [`IndexGateway`] pairs an index with an [`Embedder`] so callers deal in
//! fragments and query strings rather than vectors.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::db;
use crate::embedding::{blob_to_vec, embed_query, squared_l2, vec_to_blob, Embedder};
use crate::error::DocletError;
use crate::migrate;
use crate::models::{Fragment, RetrievedFragment, META_PATH, META_SOURCE};

/// An item handed to the index: text, its vector and flat string metadata.
#[derive(Debug, Clone)]
pub struct IndexItem {
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: BTreeMap<String, String>,
}

/// A stored item returned from a similarity query.
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub text: String,
    pub metadata: BTreeMap<String, String>,
    pub distance: f32,
}

/// Restricts a query to fragments whose `source` is in the allowed set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceFilter {
    allowed: BTreeSet<String>,
}

impl SourceFilter {
    pub fn new<S: Into<String>>(sources: impl IntoIterator<Item = S>) -> Self {
        Self {
            allowed: sources.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, source: &str) -> bool {
        self.allowed.contains(source)
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }
}

/// Abstract similarity store.
///
/// Re-adding an item that is already present stores a second copy; callers
/// that need replacement semantics delete by path first.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Store items with their vectors and metadata.
    async fn add(&self, items: &[IndexItem]) -> Result<()>;

    /// The `k` nearest items whose `source` passes `filter`, ascending by
    /// distance. Ties keep insertion order.
    async fn query(&self, embedding: &[f32], k: usize, filter: &SourceFilter)
        -> Result<Vec<IndexHit>>;

    /// Metadata of every stored item, in insertion order.
    async fn list_all(&self) -> Result<Vec<BTreeMap<String, String>>>;

    /// Delete every item whose `path` metadata equals `path`. Returns the count.
    async fn delete_by_path(&self, path: &str) -> Result<u64>;
}

/// Distinct `source` values across every stored item.
pub async fn indexed_sources(index: &dyn VectorIndex) -> Result<BTreeSet<String>> {
    Ok(index
        .list_all()
        .await?
        .into_iter()
        .filter_map(|mut meta| meta.remove(META_SOURCE))
        .collect())
}

/// Whether an index has been created in `index_dir`.
pub fn index_exists(index_dir: &Path) -> bool {
    index_dir.is_dir()
}

// ============ SQLite index ============

/// Directory-backed index stored in a single SQLite file.
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    /// Open the index in `index_dir`, creating the directory and schema if
    /// this is the first batch.
    pub async fn open_or_create(index_dir: &Path) -> Result<Self> {
        let created = !index_exists(index_dir);
        let pool = db::connect(index_dir).await?;
        migrate::run_migrations(&pool).await?;
        if created {
            tracing::info!(dir = %index_dir.display(), "created new vector index");
        } else {
            tracing::debug!(dir = %index_dir.display(), "opened vector index");
        }
        Ok(Self { pool })
    }

    /// Open an existing index. Returns `None` when no index has been created yet.
    pub async fn open_existing(index_dir: &Path) -> Result<Option<Self>> {
        if !index_exists(index_dir) {
            return Ok(None);
        }
        Ok(Some(Self::open_or_create(index_dir).await?))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn add(&self, items: &[IndexItem]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for item in items {
            let source = item.metadata.get(META_SOURCE).cloned().unwrap_or_default();
            let path = item.metadata.get(META_PATH).cloned();
            sqlx::query(
                "INSERT INTO fragments (id, source, path, text, metadata_json, embedding, dims, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&source)
            .bind(&path)
            .bind(&item.text)
            .bind(serde_json::to_string(&item.metadata)?)
            .bind(vec_to_blob(&item.embedding))
            .bind(item.embedding.len() as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &SourceFilter,
    ) -> Result<Vec<IndexHit>> {
        if filter.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT text, metadata_json, embedding FROM fragments WHERE source IN (");
        let mut separated = qb.separated(", ");
        for source in filter.sources() {
            separated.push_bind(source);
        }
        separated.push_unseparated(") ORDER BY rowid");

        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let metadata_json: String = row.get("metadata_json");
            hits.push(IndexHit {
                text: row.get("text"),
                metadata: serde_json::from_str(&metadata_json)?,
                distance: squared_l2(embedding, &blob_to_vec(&blob)),
            });
        }

        Ok(nearest(hits, k))
    }

    async fn list_all(&self) -> Result<Vec<BTreeMap<String, String>>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT metadata_json FROM fragments ORDER BY rowid")
                .fetch_all(&self.pool)
                .await?;
        let mut metadatas = Vec::with_capacity(rows.len());
        for json in &rows {
            metadatas.push(serde_json::from_str(json)?);
        }
        Ok(metadatas)
    }

    async fn delete_by_path(&self, path: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM fragments WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ============ In-memory index ============

/// In-memory index for tests. Brute-force squared-L2 over all stored vectors.
#[derive(Default)]
pub struct InMemoryIndex {
    items: RwLock<Vec<IndexItem>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("in-memory index lock poisoned")
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn add(&self, items: &[IndexItem]) -> Result<()> {
        let mut stored = self.items.write().map_err(poisoned)?;
        stored.extend(items.iter().cloned());
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &SourceFilter,
    ) -> Result<Vec<IndexHit>> {
        let stored = self.items.read().map_err(poisoned)?;
        let hits = stored
            .iter()
            .filter(|item| {
                item.metadata
                    .get(META_SOURCE)
                    .is_some_and(|s| filter.allows(s))
            })
            .map(|item| IndexHit {
                text: item.text.clone(),
                metadata: item.metadata.clone(),
                distance: squared_l2(embedding, &item.embedding),
            })
            .collect();
        Ok(nearest(hits, k))
    }

    async fn list_all(&self) -> Result<Vec<BTreeMap<String, String>>> {
        let stored = self.items.read().map_err(poisoned)?;
        Ok(stored.iter().map(|item| item.metadata.clone()).collect())
    }

    async fn delete_by_path(&self, path: &str) -> Result<u64> {
        let mut stored = self.items.write().map_err(poisoned)?;
        let before = stored.len();
        stored.retain(|item| item.metadata.get(META_PATH).map(String::as_str) != Some(path));
        Ok((before - stored.len()) as u64)
    }
}

/// Stable ascending sort by distance, truncated to `k`.
fn nearest(mut hits: Vec<IndexHit>, k: usize) -> Vec<IndexHit> {
    hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    hits.truncate(k);
    hits
}

// ============ Gateway ============

/// Fragment-level access to the index: embeds on the way in and on query.
#[derive(Clone)]
pub struct IndexGateway {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    batch_size: usize,
}

impl IndexGateway {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            embedder,
            index,
            batch_size: 64,
        }
    }

    /// Number of fragments sent to the embedder per call.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Embed and store fragments. Returns the number stored.
    ///
    /// Each batch is stored as soon as it is embedded, so a failure part way
    /// through leaves the earlier batches in the index.
    pub async fn add(&self, fragments: &[Fragment]) -> Result<usize, DocletError> {
        let dims = self.embedder.dims();
        tracing::info!(
            model = self.embedder.model_name(),
            dims,
            fragments = fragments.len(),
            "embedding fragments"
        );
        for batch in fragments.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|f| f.text.clone()).collect();
            let vectors = self
                .embedder
                .embed(&texts)
                .await
                .map_err(|e| DocletError::Embedding(format!("{:#}", e)))?;
            if vectors.len() != batch.len() {
                return Err(DocletError::Embedding(format!(
                    "expected {} vectors, got {}",
                    batch.len(),
                    vectors.len()
                )));
            }
            if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
                return Err(DocletError::Embedding(format!(
                    "expected {}-dimensional vectors, got {}",
                    dims,
                    bad.len()
                )));
            }

            let items: Vec<IndexItem> = batch
                .iter()
                .zip(vectors)
                .map(|(fragment, embedding)| IndexItem {
                    text: fragment.text.clone(),
                    embedding,
                    metadata: fragment.index_metadata(),
                })
                .collect();
            self.index
                .add(&items)
                .await
                .map_err(|e| DocletError::Index(format!("{:#}", e)))?;
            tracing::debug!(count = items.len(), "indexed fragment batch");
        }
        Ok(fragments.len())
    }

    /// The `k` fragments nearest to `text` among allowed sources, ascending
    /// by distance.
    pub async fn query(
        &self,
        text: &str,
        k: usize,
        filter: &SourceFilter,
    ) -> Result<Vec<RetrievedFragment>, DocletError> {
        let vector = embed_query(self.embedder.as_ref(), text)
            .await
            .map_err(|e| DocletError::Retrieval(format!("{:#}", e)))?;
        let hits = self
            .index
            .query(&vector, k, filter)
            .await
            .map_err(|e| DocletError::Retrieval(format!("{:#}", e)))?;

        Ok(hits.into_iter().map(hit_to_retrieved).collect())
    }

    /// Distinct `source` values across all stored fragments.
    pub async fn list_sources(&self) -> Result<BTreeSet<String>, DocletError> {
        indexed_sources(self.index.as_ref())
            .await
            .map_err(|e| DocletError::Retrieval(format!("{:#}", e)))
    }

    /// Drop every fragment that came from `path` (relative to the docs dir).
    pub async fn remove_path(&self, path: &str) -> Result<u64, DocletError> {
        self.index
            .delete_by_path(path)
            .await
            .map_err(|e| DocletError::Index(format!("{:#}", e)))
    }
}

fn hit_to_retrieved(hit: IndexHit) -> RetrievedFragment {
    let mut metadata = hit.metadata;
    let source_name = metadata
        .remove(META_SOURCE)
        .unwrap_or_else(|| "Unknown".to_string());
    RetrievedFragment {
        fragment: Fragment {
            text: hit.text,
            source_name,
            metadata,
        },
        distance: hit.distance,
    }
}
