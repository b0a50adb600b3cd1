//! End-to-end ingestion and question answering against a temporary docs
//! directory, a real SQLite index and deterministic test collaborators.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use doclet::config::Config;
use doclet::embedding::Embedder;
use doclet::error::DocletError;
use doclet::generate::Generator;
use doclet::index::{SqliteIndex, VectorIndex};
use doclet::ingest::{run_ingest, IngestOptions, IngestOutcome, IngestReport};
use doclet::models::Role;
use doclet::progress::NoProgress;
use doclet::sanitize::FALLBACK_ANSWER;
use doclet::session::{Session, NO_INDEX_MESSAGE, NO_RELEVANT_INFO, NO_SELECTION_MESSAGE};

const VOCABULARY: &[&str] = &[
    "retry", "backoff", "timeout", "cache", "manifest", "chunk", "pdf", "index",
];

/// Counts vocabulary words; text without any gets a unit vector on its own
/// axis, so it sits at squared distance 2 from every topical text.
struct KeywordEmbedder;

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword-test"
    }

    fn dims(&self) -> usize {
        VOCABULARY.len() + 1
    }

    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| keyword_vector(t)).collect())
    }
}

fn keyword_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; VOCABULARY.len() + 1];
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        let word = word.to_lowercase();
        if let Some(i) = VOCABULARY.iter().position(|w| *w == word) {
            v[i] += 1.0;
        }
    }
    if v.iter().all(|x| *x == 0.0) {
        v[VOCABULARY.len()] = 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter().map(|x| x / norm).collect()
}

/// Behaves like [`KeywordEmbedder`] except that one call, counted from 1,
/// fails.
struct FlakyEmbedder {
    failing_call: usize,
    calls: AtomicUsize,
}

impl FlakyEmbedder {
    fn failing_on(call: usize) -> Arc<Self> {
        Arc::new(Self {
            failing_call: call,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    fn model_name(&self) -> &str {
        "flaky-test"
    }

    fn dims(&self) -> usize {
        VOCABULARY.len() + 1
    }

    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.failing_call {
            anyhow::bail!("embedding service unavailable");
        }
        Ok(texts.iter().map(|t| keyword_vector(t)).collect())
    }
}

/// Replies with a fixed completion and remembers every prompt.
struct ScriptedGenerator {
    reply: Result<String, String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    fn replying(text: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(text.to_string()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn failing(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(reason.to_string()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn complete(&self, prompt: &str, _max_tokens: usize) -> doclet::error::Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.reply.clone().map_err(DocletError::Generation)
    }
}

const RETRY_DOC: &str = "# Retry policy\n\n\
The client uses retry with exponential backoff when a request fails. \
Each retry waits twice as long as the previous one, starting at one second. \
After five attempts the retry loop gives up and reports the error.\n\n\
A timeout counts as a failure and triggers a retry with the same backoff. \
Rate limited responses also trigger a retry. \
Client errors other than rate limiting never retry.\n";

fn setup() -> (TempDir, Config) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join("docs")).unwrap();

    let mut config = Config::default();
    config.paths.docs_dir = root.join("docs");
    config.paths.index_dir = root.join("index");
    config.paths.manifest = root.join("ingested_files.json");
    (tmp, config)
}

async fn ingest(config: &Config) -> IngestReport {
    run_ingest(config, Arc::new(KeywordEmbedder), &NoProgress, IngestOptions::default())
        .await
        .unwrap()
}

async fn ingest_pruning(config: &Config) -> IngestReport {
    run_ingest(
        config,
        Arc::new(KeywordEmbedder),
        &NoProgress,
        IngestOptions { prune: true },
    )
    .await
    .unwrap()
}

fn manifest(config: &Config) -> BTreeMap<String, String> {
    let content = fs::read_to_string(&config.paths.manifest).unwrap();
    serde_json::from_str(&content).unwrap()
}

async fn stored_paths(config: &Config) -> Vec<String> {
    let index = SqliteIndex::open_existing(&config.paths.index_dir)
        .await
        .unwrap()
        .expect("index exists");
    let paths = index
        .list_all()
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.get("path").cloned().unwrap_or_default())
        .collect();
    index.close().await;
    paths
}

fn docs(config: &Config) -> &Path {
    &config.paths.docs_dir
}

// ============ Ingestion ============

#[tokio::test]
async fn missing_docs_dir_is_created() {
    let (_tmp, config) = setup();
    fs::remove_dir_all(docs(&config)).unwrap();

    let report = ingest(&config).await;
    assert_eq!(
        report.to_string(),
        format!("Created {}. Please upload documents.", docs(&config).display())
    );
    assert!(docs(&config).is_dir());
    assert!(!config.paths.index_dir.exists());
}

#[tokio::test]
async fn first_ingest_indexes_file_and_records_manifest() {
    let (_tmp, config) = setup();
    let body = format!("{}{}", RETRY_DOC, "x".repeat(500usize.saturating_sub(RETRY_DOC.len())));
    fs::write(docs(&config).join("a.md"), &body).unwrap();

    let report = ingest(&config).await;
    let IngestOutcome::Ingested { documents, chunks } = report.outcome.clone() else {
        panic!("unexpected outcome: {report}");
    };
    assert_eq!(documents, 1);
    assert!(chunks >= 1);
    assert_eq!(
        report.to_string(),
        format!("Success! Ingested 1 documents ({} chunks).", chunks)
    );

    let manifest = manifest(&config);
    assert_eq!(manifest.len(), 1);
    let key = docs(&config).join("a.md").to_string_lossy().to_string();
    assert!(manifest.contains_key(&key));
    assert_eq!(stored_paths(&config).await.len(), chunks);
}

#[tokio::test]
async fn unchanged_files_are_not_reingested() {
    let (_tmp, config) = setup();
    fs::write(docs(&config).join("a.md"), RETRY_DOC).unwrap();
    fs::write(docs(&config).join("notes.txt"), "The cache is keyed by the manifest.").unwrap();

    ingest(&config).await;
    let before = fs::read(&config.paths.manifest).unwrap();
    let fragments_before = stored_paths(&config).await.len();

    let report = ingest(&config).await;
    assert_eq!(report.to_string(), "No new or changed documents to ingest.");
    assert_eq!(report.unchanged, 2);
    assert_eq!(fs::read(&config.paths.manifest).unwrap(), before);
    assert_eq!(stored_paths(&config).await.len(), fragments_before);
}

#[tokio::test]
async fn changed_file_replaces_its_fragments() {
    let (_tmp, config) = setup();
    fs::write(docs(&config).join("a.md"), RETRY_DOC).unwrap();
    fs::write(docs(&config).join("b.txt"), "The index stores one vector per chunk.").unwrap();
    ingest(&config).await;

    let old_fp = manifest(&config)
        .get(&docs(&config).join("a.md").to_string_lossy().to_string())
        .cloned();

    fs::write(docs(&config).join("a.md"), "Short replacement about the cache.").unwrap();
    let report = ingest(&config).await;
    assert_eq!(
        report.outcome,
        IngestOutcome::Ingested {
            documents: 1,
            chunks: 1
        }
    );

    let new_fp = manifest(&config)
        .get(&docs(&config).join("a.md").to_string_lossy().to_string())
        .cloned();
    assert_ne!(old_fp, new_fp);

    let paths = stored_paths(&config).await;
    assert_eq!(paths.iter().filter(|p| *p == "a.md").count(), 1);
    assert_eq!(paths.iter().filter(|p| *p == "b.txt").count(), 1);
}

#[tokio::test]
async fn unreadable_file_is_reported_and_retried() {
    let (_tmp, config) = setup();
    fs::write(docs(&config).join("a.md"), RETRY_DOC).unwrap();
    fs::write(docs(&config).join("broken.pdf"), b"definitely not a pdf").unwrap();

    let report = ingest(&config).await;
    assert!(matches!(report.outcome, IngestOutcome::Ingested { documents: 1, .. }));
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].0.ends_with("broken.pdf"));

    let manifest = manifest(&config);
    assert_eq!(manifest.len(), 1);
    assert!(manifest.keys().all(|k| !k.ends_with("broken.pdf")));

    let again = ingest(&config).await;
    assert_eq!(again.to_string(), "No new or changed documents to ingest.");
    assert_eq!(again.failures.len(), 1);
}

#[tokio::test]
async fn removed_files_stay_unless_pruned() {
    let (_tmp, config) = setup();
    fs::write(docs(&config).join("a.md"), RETRY_DOC).unwrap();
    fs::write(docs(&config).join("gone.txt"), "This note about the index will be deleted.").unwrap();
    ingest(&config).await;

    fs::remove_file(docs(&config).join("gone.txt")).unwrap();
    let report = ingest(&config).await;
    assert!(report.pruned.is_empty());
    assert_eq!(manifest(&config).len(), 2);
    assert!(stored_paths(&config).await.iter().any(|p| p == "gone.txt"));

    let report = ingest_pruning(&config).await;
    assert_eq!(report.to_string(), "No new or changed documents to ingest.");
    assert_eq!(report.pruned.len(), 1);
    assert_eq!(manifest(&config).len(), 1);
    assert!(stored_paths(&config).await.iter().all(|p| p != "gone.txt"));
}

#[tokio::test]
async fn rerun_after_failed_ingest_does_not_duplicate_fragments() {
    let (_tmp, mut config) = setup();
    config.chunking.chunk_size = 40;
    config.chunking.chunk_overlap = 5;
    config.embedding.batch_size = 2;
    fs::write(docs(&config).join("a.md"), RETRY_DOC).unwrap();

    let err = run_ingest(
        &config,
        FlakyEmbedder::failing_on(2),
        &NoProgress,
        IngestOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, DocletError::Embedding(_)), "{err}");
    assert!(!config.paths.manifest.exists());
    // The first batch was stored before the failure.
    assert_eq!(stored_paths(&config).await.len(), 2);

    let report = ingest(&config).await;
    let IngestOutcome::Ingested { chunks, .. } = report.outcome else {
        panic!("unexpected outcome: {report}");
    };
    assert!(chunks > 2);
    assert_eq!(stored_paths(&config).await.len(), chunks);
    assert_eq!(manifest(&config).len(), 1);
}

#[tokio::test]
async fn pruning_without_an_index_still_forgets_removed_files() {
    let (_tmp, config) = setup();
    fs::write(docs(&config).join("a.md"), RETRY_DOC).unwrap();
    fs::write(docs(&config).join("gone.txt"), "This note about the index will be deleted.").unwrap();
    ingest(&config).await;

    fs::remove_dir_all(&config.paths.index_dir).unwrap();
    fs::remove_file(docs(&config).join("gone.txt")).unwrap();

    let report = ingest_pruning(&config).await;
    assert_eq!(report.to_string(), "No new or changed documents to ingest.");
    assert_eq!(report.pruned.len(), 1);
    assert!(report.pruned[0].ends_with("gone.txt"));
    let manifest = manifest(&config);
    assert_eq!(manifest.len(), 1);
    assert!(manifest.keys().all(|k| !k.ends_with("gone.txt")));
    assert!(!config.paths.index_dir.exists());
}

// ============ Question answering ============

#[tokio::test]
async fn ask_without_index_is_a_configuration_error() {
    let (_tmp, config) = setup();
    let mut session = Session::new(
        config,
        Arc::new(KeywordEmbedder),
        ScriptedGenerator::replying("unused"),
    );
    let err = session.ask("How does retry work?").await.unwrap_err();
    match err {
        DocletError::Config(msg) => assert_eq!(msg, NO_INDEX_MESSAGE),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(session.history().len(), 1);
    assert_eq!(session.history()[0].role, Role::User);
}

#[tokio::test]
async fn relevant_question_is_answered_with_sources() {
    let (_tmp, config) = setup();
    fs::write(docs(&config).join("a.md"), RETRY_DOC).unwrap();

    let generator = ScriptedGenerator::replying(
        "Based on the documents, retries use exponential backoff. Retries use exponential backoff.",
    );
    let mut session = Session::new(config.clone(), Arc::new(KeywordEmbedder), generator.clone());

    // The session is created before ingestion; the new manifest refreshes its index handle.
    assert!(session.indexed_sources().await.unwrap().is_empty());
    ingest(&config).await;

    let answer = session.ask("How does retry backoff work?").await.unwrap();
    assert_eq!(answer.text, "retries use exponential backoff.");
    assert!(!answer.sources.is_empty());
    assert!(answer.sources.iter().all(|s| s.source == "a.md"));
    assert!(answer.sources.iter().all(|s| s.distance <= 1.3));
    assert!(answer.notice.is_none());

    let prompts = generator.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("[Source 1]\n"));
    assert!(prompts[0].contains("How does retry backoff work?<|eot_id|>"));

    let history = session.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].sources, answer.sources);
}

#[tokio::test]
async fn unrelated_question_gets_no_relevant_information() {
    let (_tmp, config) = setup();
    fs::write(docs(&config).join("a.md"), RETRY_DOC).unwrap();
    ingest(&config).await;

    let generator = ScriptedGenerator::replying("should not be called");
    let mut session = Session::new(config, Arc::new(KeywordEmbedder), generator.clone());

    let answer = session.ask("What is the capital of France?").await.unwrap();
    assert_eq!(answer.text, NO_RELEVANT_INFO);
    assert!(answer.sources.is_empty());
    assert!(generator.prompts().is_empty());
}

#[tokio::test]
async fn retrieval_failure_is_reported_as_no_relevant_information() {
    let (_tmp, config) = setup();
    fs::write(docs(&config).join("a.md"), RETRY_DOC).unwrap();
    ingest(&config).await;

    let generator = ScriptedGenerator::replying("should not be called");
    let mut session = Session::new(config, FlakyEmbedder::failing_on(1), generator.clone());

    let answer = session.ask("How does retry backoff work?").await.unwrap();
    assert_eq!(answer.text, NO_RELEVANT_INFO);
    assert!(answer.sources.is_empty());
    let notice = answer.notice.expect("retrieval failure is reported");
    assert!(notice.contains("embedding service unavailable"), "{notice}");
    assert!(generator.prompts().is_empty());
    assert_eq!(session.history().len(), 2);
}

#[tokio::test]
async fn degenerate_answer_falls_back() {
    let (_tmp, config) = setup();
    fs::write(docs(&config).join("a.md"), RETRY_DOC).unwrap();
    ingest(&config).await;

    let question = "How does retry backoff work?";
    let mut session = Session::new(
        config,
        Arc::new(KeywordEmbedder),
        ScriptedGenerator::replying(question),
    );
    let answer = session.ask(question).await.unwrap();
    assert_eq!(answer.text, FALLBACK_ANSWER);
    assert!(!answer.sources.is_empty());
}

#[tokio::test]
async fn generation_failure_keeps_history_intact() {
    let (_tmp, config) = setup();
    fs::write(docs(&config).join("a.md"), RETRY_DOC).unwrap();
    ingest(&config).await;

    let mut session = Session::new(
        config,
        Arc::new(KeywordEmbedder),
        ScriptedGenerator::failing("context window exceeded"),
    );
    let err = session.ask("How does retry backoff work?").await.unwrap_err();
    assert!(matches!(err, DocletError::Generation(_)));
    assert_eq!(session.history().len(), 1);
}

#[tokio::test]
async fn selection_restricts_sources() {
    let (_tmp, config) = setup();
    fs::write(docs(&config).join("a.md"), RETRY_DOC).unwrap();
    fs::write(docs(&config).join("b.txt"), "The retry budget is documented here too.").unwrap();
    ingest(&config).await;

    let mut session = Session::new(
        config,
        Arc::new(KeywordEmbedder),
        ScriptedGenerator::replying("The retry budget is documented in b.txt."),
    );
    let indexed = session.indexed_sources().await.unwrap();
    assert_eq!(indexed.into_iter().collect::<Vec<_>>(), vec!["a.md", "b.txt"]);

    assert!(session.select(["missing.md"]).await.is_err());

    session.select(["b.txt"]).await.unwrap();
    let answer = session.ask("Where is the retry budget?").await.unwrap();
    assert!(answer.sources.iter().all(|s| s.source == "b.txt"));

    session.select(Vec::<String>::new()).await.unwrap();
    match session.ask("Where is the retry budget?").await.unwrap_err() {
        DocletError::Config(msg) => assert_eq!(msg, NO_SELECTION_MESSAGE),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn reset_clears_index_and_manifest() {
    let (_tmp, config) = setup();
    fs::write(docs(&config).join("a.md"), RETRY_DOC).unwrap();
    ingest(&config).await;

    let mut session = Session::new(
        config.clone(),
        Arc::new(KeywordEmbedder),
        ScriptedGenerator::replying("Retries back off exponentially."),
    );
    session.ask("How does retry backoff work?").await.unwrap();
    session.clear_history();
    assert!(session.history().is_empty());

    session.reset().unwrap();
    assert!(!config.paths.index_dir.exists());
    assert!(!config.paths.manifest.exists());
    assert!(matches!(
        session.ask("How does retry backoff work?").await,
        Err(DocletError::Config(_))
    ));

    // Everything is ingested again after a reset.
    let report = ingest(&config).await;
    assert!(matches!(report.outcome, IngestOutcome::Ingested { documents: 1, .. }));
}

#[tokio::test]
async fn failed_reset_leaves_session_usable() {
    let (_tmp, config) = setup();
    fs::write(docs(&config).join("a.md"), RETRY_DOC).unwrap();
    ingest(&config).await;

    // A directory where the manifest file should be cannot be removed as a file.
    fs::remove_file(&config.paths.manifest).unwrap();
    fs::create_dir_all(config.paths.manifest.join("blocker")).unwrap();

    let mut session = Session::new(
        config.clone(),
        Arc::new(KeywordEmbedder),
        ScriptedGenerator::replying("Retries back off exponentially."),
    );
    session.ask("How does retry backoff work?").await.unwrap();

    assert!(matches!(session.reset(), Err(DocletError::Io(_))));
    assert_eq!(session.history().len(), 2);
    assert!(!config.paths.index_dir.exists());
    match session.ask("How does retry backoff work?").await.unwrap_err() {
        DocletError::Config(msg) => assert_eq!(msg, NO_INDEX_MESSAGE),
        other => panic!("unexpected error: {other}"),
    }
}
