//! Recursive separator-based text chunker.
//!
//! Splits document text into [`Fragment`]s no longer than `chunk_size`
//! characters. The text is cut on the first separator from a prioritized list
//! (`"\n\n"`, `"\n"`, `" "`, `""`) that occurs in it; pieces that are still too
//! long are split again with the remaining separators. Adjacent pieces are then
//! merged greedily up to `chunk_size`, carrying up to `chunk_overlap`
//! characters of trailing context into the next fragment.
//!
//! Separators stay attached to the start of the piece that follows them, so
//! every fragment is a contiguous slice of the source text (modulo trimmed
//! whitespace at its ends). Lengths are counted in characters, not bytes.

use std::collections::VecDeque;

use crate::config::ChunkingConfig;
use crate::models::{Fragment, RawDocument};

/// Default separator priority: paragraph, line, word, character.
pub const DEFAULT_SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];

#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl Chunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    /// Replace the separator list. Without a trailing `""` fallback, a piece
    /// that contains none of the separators and exceeds `chunk_size` is kept
    /// whole.
    pub fn with_separators<S: Into<String>>(mut self, separators: impl IntoIterator<Item = S>) -> Self {
        self.separators = separators.into_iter().map(Into::into).collect();
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Split documents into fragments, preserving document and fragment order.
    /// Each fragment inherits its document's source name and metadata.
    pub fn split(&self, documents: &[RawDocument]) -> Vec<Fragment> {
        let mut fragments = Vec::new();
        for doc in documents {
            for text in self.split_text(&doc.text) {
                fragments.push(Fragment {
                    text,
                    source_name: doc.source_name.clone(),
                    metadata: doc.extra_metadata.clone(),
                });
            }
        }
        fragments
    }

    /// Split a single text. Empty or whitespace-only text yields no pieces.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &self.separators)
    }

    fn split_recursive(&self, text: &str, separators: &[String]) -> Vec<String> {
        let mut final_chunks = Vec::new();

        // Pick the first separator that actually occurs; "" always matches.
        let mut separator = separators.last().map(String::as_str).unwrap_or("");
        let mut remaining: &[String] = &[];
        for (i, sep) in separators.iter().enumerate() {
            if sep.is_empty() {
                separator = "";
                break;
            }
            if text.contains(sep.as_str()) {
                separator = sep;
                remaining = &separators[i + 1..];
                break;
            }
        }

        let splits = split_keep_separator(text, separator);
        let mut good: Vec<String> = Vec::new();
        for piece in splits {
            if char_len(&piece) < self.chunk_size {
                good.push(piece);
                continue;
            }
            if !good.is_empty() {
                final_chunks.extend(self.merge_splits(&good, ""));
                good.clear();
            }
            if remaining.is_empty() {
                let trimmed = piece.trim();
                if !trimmed.is_empty() {
                    final_chunks.push(trimmed.to_string());
                }
            } else {
                final_chunks.extend(self.split_recursive(&piece, remaining));
            }
        }
        if !good.is_empty() {
            final_chunks.extend(self.merge_splits(&good, ""));
        }

        final_chunks
    }

    /// Greedily combine small pieces into fragments of at most `chunk_size`,
    /// keeping up to `chunk_overlap` characters of the previous fragment.
    fn merge_splits(&self, splits: &[String], separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut docs = Vec::new();
        let mut current: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for piece in splits {
            let len = char_len(piece);
            let joiner = if current.is_empty() { 0 } else { sep_len };

            if total + len + joiner > self.chunk_size {
                if total > self.chunk_size {
                    tracing::warn!(
                        total,
                        chunk_size = self.chunk_size,
                        "created a fragment longer than the configured chunk size"
                    );
                }
                if !current.is_empty() {
                    if let Some(doc) = join_pieces(&current, separator) {
                        docs.push(doc);
                    }
                    // Drop leading pieces until what is left fits as overlap.
                    loop {
                        let joiner = if current.is_empty() { 0 } else { sep_len };
                        let must_shrink = total > self.chunk_overlap
                            || (total + len + joiner > self.chunk_size && total > 0);
                        if !must_shrink {
                            break;
                        }
                        let had_more = current.len() > 1;
                        let Some(first) = current.pop_front() else {
                            break;
                        };
                        let removed = char_len(first) + if had_more { sep_len } else { 0 };
                        total = total.saturating_sub(removed);
                    }
                }
            }

            current.push_back(piece);
            total += len + if current.len() > 1 { sep_len } else { 0 };
        }

        if let Some(doc) = join_pieces(&current, separator) {
            docs.push(doc);
        }
        docs
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::from_config(&ChunkingConfig::default())
    }
}

/// Split on `separator`, re-attaching it to the start of each following piece.
/// Empty pieces are dropped; the empty separator splits into characters.
fn split_keep_separator(text: &str, separator: &str) -> Vec<String> {
    if separator.is_empty() {
        return text.chars().map(String::from).collect();
    }
    let mut parts = text.split(separator);
    let mut out = Vec::new();
    if let Some(first) = parts.next() {
        out.push(first.to_string());
    }
    for part in parts {
        out.push(format!("{}{}", separator, part));
    }
    out.retain(|s| !s.is_empty());
    out
}

fn join_pieces(pieces: &VecDeque<&str>, separator: &str) -> Option<String> {
    let joined = pieces
        .iter()
        .copied()
        .collect::<Vec<_>>()
        .join(separator);
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
