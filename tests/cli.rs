//! CLI tests that run the built `doclet` binary. None of them reach a model:
//! the embedder is an Ollama client pointed at a closed port, and the
//! commands exercised never embed anything.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn doclet_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("doclet");
    path
}

fn setup_test_env(create_docs: bool) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    if create_docs {
        fs::create_dir_all(root.join("docs")).unwrap();
    }

    let config_content = format!(
        r#"[paths]
docs_dir = "{root}/docs"
index_dir = "{root}/index"
manifest = "{root}/ingested_files.json"

[embedding]
provider = "ollama"
model = "nomic-embed-text"
dims = 768
url = "http://127.0.0.1:1"
max_retries = 0

[generation]
url = "http://127.0.0.1:1"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("doclet.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_doclet(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = doclet_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run doclet binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_ingest_creates_missing_docs_dir() {
    let (tmp, config) = setup_test_env(false);
    let (stdout, stderr, success) = run_doclet(&config, &["ingest", "--progress", "off"]);
    assert!(success, "ingest failed: {}", stderr);

    let docs = tmp.path().join("docs");
    assert_eq!(
        stdout.trim(),
        format!("Created {}. Please upload documents.", docs.display())
    );
    assert!(docs.is_dir());
}

#[test]
fn test_ingest_empty_docs_dir() {
    let (tmp, config) = setup_test_env(true);
    let (stdout, stderr, success) = run_doclet(&config, &["ingest"]);
    assert!(success, "ingest failed: {}", stderr);
    assert_eq!(stdout.trim(), "No new or changed documents to ingest.");
    assert!(!tmp.path().join("index").exists());
    assert!(!tmp.path().join("ingested_files.json").exists());
}

#[test]
fn test_ingest_reports_unreadable_files() {
    let (tmp, config) = setup_test_env(true);
    fs::write(tmp.path().join("docs/broken.pdf"), b"not a pdf at all").unwrap();
    fs::write(tmp.path().join("docs/ignored.docx"), b"unsupported").unwrap();

    let (stdout, stderr, success) = run_doclet(&config, &["ingest", "--progress", "json"]);
    assert!(success, "ingest failed: {}", stderr);
    assert_eq!(stdout.trim(), "No new or changed documents to ingest.");
    assert!(stderr.contains("broken.pdf"));
    assert!(!stderr.contains("ignored.docx"));
    assert!(stderr.contains("\"phase\":\"discovering\""));
}

#[test]
fn test_sources_without_index() {
    let (_tmp, config) = setup_test_env(true);
    let (stdout, stderr, success) = run_doclet(&config, &["sources"]);
    assert!(success, "sources failed: {}", stderr);
    assert_eq!(stdout.trim(), "Knowledge base is empty.");
}

#[test]
fn test_reset_removes_index_and_manifest() {
    let (tmp, config) = setup_test_env(true);
    let index_dir = tmp.path().join("index");
    fs::create_dir_all(&index_dir).unwrap();
    fs::write(index_dir.join("index.sqlite"), b"").unwrap();
    fs::write(tmp.path().join("ingested_files.json"), "{}\n").unwrap();

    let (stdout, stderr, success) = run_doclet(&config, &["reset"]);
    assert!(success, "reset failed: {}", stderr);
    assert_eq!(stdout.trim(), "Knowledge base cleared.");
    assert!(!index_dir.exists());
    assert!(!tmp.path().join("ingested_files.json").exists());

    // Resetting an empty knowledge base is fine.
    let (_, _, success) = run_doclet(&config, &["reset"]);
    assert!(success);
}

#[test]
fn test_ask_without_model_server_fails() {
    let (_tmp, config) = setup_test_env(true);
    let (_stdout, stderr, success) = run_doclet(&config, &["ask", "What is X?"]);
    assert!(!success);
    assert!(stderr.contains("configuration error"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_config_is_rejected() {
    let (tmp, _) = setup_test_env(true);
    let config_path = tmp.path().join("config/bad.toml");
    fs::write(
        &config_path,
        "[chunking]\nchunk_size = 100\nchunk_overlap = 100\n",
    )
    .unwrap();

    let (_stdout, stderr, success) = run_doclet(&config_path, &["sources"]);
    assert!(!success);
    assert!(stderr.contains("chunk_overlap"), "stderr: {}", stderr);
}
