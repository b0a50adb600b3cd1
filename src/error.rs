//! Typed failures surfaced by the ingestion and question-answering pipelines.
//!
//! Every variant maps to one user-visible class of problem. Callers match on
//! the variant to decide whether the failure aborts a single file, a single
//! query, or the operation that depended on a missing resource.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, DocletError>;

#[derive(Debug, thiserror::Error)]
pub enum DocletError {
    /// A required resource (model server, index directory, config value) is
    /// missing or unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// A source file could not be read or parsed.
    #[error("failed to load {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },

    /// The vector index could not answer a query.
    #[error("retrieval error: {0}")]
    Retrieval(String),

    /// The generative model call failed.
    #[error("generation error: {0}")]
    Generation(String),

    /// The embedding collaborator failed while indexing fragments.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// The ingestion manifest could not be read or written.
    #[error("manifest error at {}: {reason}", path.display())]
    Manifest { path: PathBuf, reason: String },

    /// The vector index could not be opened or written.
    #[error("index error: {0}")]
    Index(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DocletError {
    pub fn load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        DocletError::Load {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn manifest(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        DocletError::Manifest {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_error_names_the_path() {
        let err = DocletError::load("docs/broken.pdf", "unexpected EOF");
        let msg = err.to_string();
        assert!(msg.contains("docs/broken.pdf"));
        assert!(msg.contains("unexpected EOF"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: DocletError = io.into();
        assert!(matches!(err, DocletError::Io(_)));
    }
}
