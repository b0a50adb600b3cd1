//! Source file discovery and format-specific loading.
//!
//! Walks the docs directory recursively for `.md`, `.txt` and `.pdf` files
//! and turns each one into [`RawDocument`]s. Every document is tagged with the
//! file's base name as its `source`; two files with the same name in different
//! folders therefore share a source name.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use once_cell::sync::Lazy;
use regex::Regex;
use walkdir::WalkDir;

use crate::error::DocletError;
use crate::models::{RawDocument, META_PAGE, META_PATH};

/// Formats the loader knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    PlainText,
    Markdown,
    Pdf,
}

impl DocumentFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "txt" => Some(DocumentFormat::PlainText),
            "md" => Some(DocumentFormat::Markdown),
            "pdf" => Some(DocumentFormat::Pdf),
            _ => None,
        }
    }
}

const INCLUDE_GLOBS: &[&str] = &["**/*.md", "**/*.txt", "**/*.pdf"];

/// List every supported file under `root`, sorted for deterministic ordering.
pub fn discover(root: &Path) -> Result<Vec<PathBuf>> {
    let include_set = build_globset(INCLUDE_GLOBS)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if !include_set.is_match(relative) {
            continue;
        }
        files.push(path.to_path_buf());
    }

    files.sort();
    Ok(files)
}

/// Read one file into raw documents.
///
/// `root` is the docs directory; the path relative to it is recorded in the
/// document metadata so that a changed file's fragments can be replaced.
pub fn load_file(path: &Path, root: &Path) -> Result<Vec<RawDocument>, DocletError> {
    let format = DocumentFormat::from_path(path)
        .ok_or_else(|| DocletError::load(path, "unsupported file extension"))?;

    let source_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| DocletError::load(path, "path has no file name"))?;
    let relative = relative_path(path, root);

    let bytes = std::fs::read(path).map_err(|e| DocletError::load(path, e))?;

    let texts: Vec<(String, Option<usize>)> = match format {
        DocumentFormat::PlainText => vec![(decode_utf8(path, bytes)?, None)],
        DocumentFormat::Markdown => vec![(markdown_to_text(&decode_utf8(path, bytes)?), None)],
        DocumentFormat::Pdf => pdf_pages(path, &bytes)?
            .into_iter()
            .enumerate()
            .map(|(i, page)| (page, Some(i)))
            .collect(),
    };

    Ok(texts
        .into_iter()
        .map(|(text, page)| {
            let mut extra_metadata = BTreeMap::new();
            extra_metadata.insert(META_PATH.to_string(), relative.clone());
            if let Some(page) = page {
                extra_metadata.insert(META_PAGE.to_string(), page.to_string());
            }
            RawDocument {
                text,
                source_name: source_name.clone(),
                extra_metadata,
            }
        })
        .collect())
}

/// `path` relative to `root` as stored in fragment metadata. Paths outside
/// `root` are kept as given.
pub fn relative_path(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}

fn decode_utf8(path: &Path, bytes: Vec<u8>) -> Result<String, DocletError> {
    String::from_utf8(bytes).map_err(|e| DocletError::load(path, format!("not valid UTF-8: {}", e)))
}

fn pdf_pages(path: &Path, bytes: &[u8]) -> Result<Vec<String>, DocletError> {
    pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| DocletError::load(path, format!("PDF extraction failed: {}", e)))
}

static FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]*(```|~~~).*$\n?").unwrap());
static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]{0,3}#{1,6}[ \t]+").unwrap());
static RULE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]{0,3}([-*_])([ \t]*[-*_]){2,}[ \t]*$\n?").unwrap());
static QUOTE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]{0,3}>[ \t]?").unwrap());
static LIST_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^([ \t]*)([-*+]|\d+[.)])[ \t]+").unwrap());
static IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\([^)]*\)").unwrap());
static LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]\([^)]*\)").unwrap());
static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"</?[A-Za-z][^>]*>").unwrap());
static EMPHASIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\*\*|__|`)").unwrap());
static BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Reduce markdown to readable text: markup is dropped, content is kept,
/// and block structure survives as blank-line separated paragraphs.
pub fn markdown_to_text(markdown: &str) -> String {
    let text = markdown.replace("\r\n", "\n");
    let text = FENCE.replace_all(&text, "");
    let text = RULE.replace_all(&text, "");
    let text = HEADING.replace_all(&text, "");
    let text = QUOTE.replace_all(&text, "");
    let text = LIST_MARKER.replace_all(&text, "$1");
    let text = IMAGE.replace_all(&text, "$1");
    let text = LINK.replace_all(&text, "$1");
    let text = HTML_TAG.replace_all(&text, "");
    let text = EMPHASIS.replace_all(&text, "");
    let text = BLANK_RUNS.replace_all(&text, "\n\n");
    text.trim().to_string()
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
