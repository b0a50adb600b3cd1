//! # Doclet
//!
//! Private question answering over a folder of local documents.
//!
//! Doclet ingests Markdown, plain-text and PDF files into a local vector
//! index and answers questions with a local language model, grounding each
//! answer in the passages most similar to the question.
//!
//! ## Architecture
//!
//! ```text
//!  ingestion (on demand)
//! ┌───────────────┐   ┌──────────┐   ┌─────────┐   ┌──────────────┐
//! │ ChangeTracker │──▶│  Loader  │──▶│ Chunker │──▶│ IndexGateway │
//! │  (manifest)   │   │md/txt/pdf│   │         │   │ embed + store│
//! └───────────────┘   └──────────┘   └─────────┘   └──────┬───────┘
//!                                                         │
//!  query (per question)                                   ▼
//! ┌───────────┐   ┌────────────────┐   ┌───────────┐   ┌──────────┐
//! │ retrieval │──▶│ PromptAssembler│──▶│ Generator │──▶│ sanitize │
//! └───────────┘   └────────────────┘   └───────────┘   └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed pipeline failures |
//! | [`models`] | Core data types |
//! | [`manifest`] | Content fingerprints and the ingestion manifest |
//! | [`loader`] | File discovery and format-specific loading |
//! | [`chunk`] | Recursive character splitting |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`db`] | SQLite connection for the vector index |
//! | [`migrate`] | Index schema |
//! | [`index`] | Vector index trait, SQLite and in-memory indexes, gateway |
//! | [`retrieval`] | Source-restricted, threshold-filtered retrieval |
//! | [`prompt`] | Prompt template |
//! | [`generate`] | Generative model client |
//! | [`sanitize`] | Model output cleanup |
//! | [`progress`] | Ingestion progress reporting |
//! | [`ingest`] | Ingestion pipeline |
//! | [`session`] | Question-answering session and chat transcript |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generate;
pub mod index;
pub mod ingest;
pub mod loader;
pub mod manifest;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod prompt;
pub mod retrieval;
pub mod sanitize;
pub mod session;
