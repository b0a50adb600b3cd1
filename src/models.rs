//! Core data models used throughout Doclet.
//!
//! These types represent the documents, fragments, retrieval results and chat
//! turns that flow through the ingestion and question-answering pipelines.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Metadata key holding the file base name a fragment came from.
pub const META_SOURCE: &str = "source";
/// Metadata key holding the path of the file relative to the docs directory.
pub const META_PATH: &str = "path";
/// Metadata key holding the zero-based PDF page number.
pub const META_PAGE: &str = "page";

/// Text read from one source file. A file may yield several (one per PDF page).
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub text: String,
    pub source_name: String,
    pub extra_metadata: BTreeMap<String, String>,
}

/// The atomic retrievable unit stored in the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub text: String,
    pub source_name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Fragment {
    /// Full metadata as stored in the index, including the `source` key.
    pub fn index_metadata(&self) -> BTreeMap<String, String> {
        let mut meta = self.metadata.clone();
        meta.insert(META_SOURCE.to_string(), self.source_name.clone());
        meta
    }

    pub fn path(&self) -> Option<&str> {
        self.metadata.get(META_PATH).map(String::as_str)
    }
}

/// A fragment together with its distance to the query. Lower is closer.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedFragment {
    pub fragment: Fragment,
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// What the chat transcript keeps about a fragment used to answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSummary {
    pub source: String,
    pub content: String,
    pub distance: f32,
}

impl From<&RetrievedFragment> for SourceSummary {
    fn from(r: &RetrievedFragment) -> Self {
        SourceSummary {
            source: r.fragment.source_name.clone(),
            content: r.fragment.text.clone(),
            distance: r.distance,
        }
    }
}

/// One entry of the session transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
    pub sources: Vec<SourceSummary>,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            sources: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>, sources: Vec<SourceSummary>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            sources,
        }
    }
}
