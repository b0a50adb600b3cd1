//! Question-answering session.
//!
//! A [`Session`] owns the collaborators a conversation needs (embedder,
//! generator, index handle), the user's source selection and the chat
//! transcript. The index handle is cached and keyed by the manifest version,
//! so an ingestion that changes the manifest forces a fresh handle on the
//! next question. [`Session::invalidate`] drops it explicitly.
//!
//! One question runs at a time: retrieve, assemble the prompt, make one
//! generation call, sanitize.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::{Config, PathsConfig};
use crate::embedding::Embedder;
use crate::error::{DocletError, Result};
use crate::generate::Generator;
use crate::index::{IndexGateway, SqliteIndex};
use crate::manifest::manifest_version;
use crate::models::{ChatTurn, RetrievedFragment, SourceSummary};
use crate::prompt::{truncate_chars, PromptAssembler};
use crate::retrieval::retrieve;
use crate::sanitize::{clean, FALLBACK_ANSWER};

pub const NO_INDEX_MESSAGE: &str = "No vector database found. Please ingest documents.";
pub const NO_SELECTION_MESSAGE: &str = "No documents selected.";
pub const NO_RELEVANT_INFO: &str =
    "I don't have relevant information about that in the provided documents.";

/// Characters of each source shown under an answer.
const REFERENCE_PREVIEW_CHARS: usize = 300;

/// The assistant's reply to one question.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub text: String,
    /// Every fragment that passed the relevance threshold, nearest first.
    pub sources: Vec<SourceSummary>,
    /// Set when retrieval failed and the answer fell back to "no relevant
    /// information".
    pub notice: Option<String>,
}

struct CachedIndex {
    version: String,
    gateway: Option<IndexGateway>,
}

pub struct Session {
    config: Config,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    assembler: PromptAssembler,
    cached: Option<CachedIndex>,
    /// `None` selects every indexed source.
    selected: Option<BTreeSet<String>>,
    history: Vec<ChatTurn>,
}

impl Session {
    pub fn new(config: Config, embedder: Arc<dyn Embedder>, generator: Arc<dyn Generator>) -> Self {
        let assembler = PromptAssembler::new(
            config.retrieval.max_context_chunks,
            config.retrieval.snippet_chars,
        );
        Self {
            config,
            embedder,
            generator,
            assembler,
            cached: None,
            selected: None,
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Drop the cached index handle; the next access reopens it.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// Delete the vector index and the ingestion manifest.
    pub fn reset(&mut self) -> Result<()> {
        self.invalidate();
        self.selected = None;
        reset_knowledge_base(&self.config.paths)
    }

    async fn gateway(&mut self) -> Result<Option<IndexGateway>> {
        let version = manifest_version(&self.config.paths.manifest);
        if let Some(cached) = &self.cached {
            if cached.version == version {
                return Ok(cached.gateway.clone());
            }
        }

        let index_dir = &self.config.paths.index_dir;
        let gateway = SqliteIndex::open_existing(index_dir)
            .await
            .map_err(|e| {
                DocletError::Config(format!(
                    "cannot open vector index at {}: {:#}",
                    index_dir.display(),
                    e
                ))
            })?
            .map(|index| {
                IndexGateway::new(self.embedder.clone(), Arc::new(index))
                    .with_batch_size(self.config.embedding.batch_size)
            });

        tracing::debug!(%version, present = gateway.is_some(), "refreshed index handle");
        self.cached = Some(CachedIndex {
            version,
            gateway: gateway.clone(),
        });
        Ok(gateway)
    }

    /// Every source present in the index. Empty when nothing has been ingested.
    pub async fn indexed_sources(&mut self) -> Result<BTreeSet<String>> {
        match self.gateway().await? {
            Some(gateway) => gateway.list_sources().await,
            None => Ok(BTreeSet::new()),
        }
    }

    /// Sources questions are answered from. Defaults to all indexed sources.
    pub async fn selected_sources(&mut self) -> Result<BTreeSet<String>> {
        match &self.selected {
            Some(selected) => Ok(selected.clone()),
            None => self.indexed_sources().await,
        }
    }

    /// Restrict answers to `sources`. Every name must be an indexed source.
    pub async fn select<S: Into<String>>(
        &mut self,
        sources: impl IntoIterator<Item = S>,
    ) -> Result<()> {
        let indexed = self.indexed_sources().await?;
        let selection: BTreeSet<String> = sources.into_iter().map(Into::into).collect();
        if let Some(unknown) = selection.iter().find(|s| !indexed.contains(*s)) {
            return Err(DocletError::Config(format!("unknown source: {}", unknown)));
        }
        self.selected = Some(selection);
        Ok(())
    }

    /// Go back to answering from every indexed source.
    pub fn select_all(&mut self) {
        self.selected = None;
    }

    /// Answer `question` from the selected sources.
    ///
    /// The question is recorded in the transcript before anything can fail;
    /// a failed generation leaves the transcript otherwise untouched.
    pub async fn ask(&mut self, question: &str) -> Result<Answer> {
        self.history.push(ChatTurn::user(question));

        let Some(gateway) = self.gateway().await? else {
            return Err(DocletError::Config(NO_INDEX_MESSAGE.to_string()));
        };
        let allowed = self.selected_sources().await?;
        if allowed.is_empty() {
            return Err(DocletError::Config(NO_SELECTION_MESSAGE.to_string()));
        }

        let retrieval = &self.config.retrieval;
        let (relevant, notice) = match retrieve(
            Some(&gateway),
            question,
            &allowed,
            retrieval.k,
            retrieval.relevance_threshold,
        )
        .await
        {
            Ok(relevant) => (relevant, None),
            Err(e) => {
                tracing::error!(error = %e, "retrieval failed");
                (Vec::new(), Some(e.to_string()))
            }
        };

        if relevant.is_empty() {
            return Ok(self.reply(NO_RELEVANT_INFO.to_string(), &[], notice));
        }

        let prompt = self.assembler.build(question, &relevant);
        let raw = self
            .generator
            .complete(&prompt, self.config.generation.max_tokens)
            .await?;
        let text = clean(&raw, question).unwrap_or_else(|| FALLBACK_ANSWER.to_string());

        Ok(self.reply(text, &relevant, None))
    }

    fn reply(
        &mut self,
        text: String,
        relevant: &[RetrievedFragment],
        notice: Option<String>,
    ) -> Answer {
        let sources: Vec<SourceSummary> = relevant.iter().map(SourceSummary::from).collect();
        self.history
            .push(ChatTurn::assistant(text.clone(), sources.clone()));
        Answer {
            text,
            sources,
            notice,
        }
    }
}

/// Delete the index directory and the manifest. Missing ones are fine.
pub fn reset_knowledge_base(paths: &PathsConfig) -> Result<()> {
    if paths.index_dir.exists() {
        std::fs::remove_dir_all(&paths.index_dir)?;
    }
    if paths.manifest.exists() {
        std::fs::remove_file(&paths.manifest)?;
    }
    tracing::info!(index = %paths.index_dir.display(), "knowledge base cleared");
    Ok(())
}

/// Render answer references: `N. source (Distance: 0.123)` and a preview.
pub fn format_sources(sources: &[SourceSummary]) -> String {
    sources
        .iter()
        .enumerate()
        .map(|(i, s)| {
            format!(
                "{}. {} (Distance: {:.3})\n   {}",
                i + 1,
                s.source,
                s.distance,
                truncate_chars(&s.content, REFERENCE_PREVIEW_CHARS).replace('\n', " ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
