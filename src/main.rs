//! # Doclet CLI (`doclet`)
//!
//! Ask questions about a folder of local documents, answered by a local
//! language model from the passages most similar to the question.
//!
//! ## Usage
//!
//! ```bash
//! doclet --config ./config/doclet.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `doclet ingest` | Index new or changed files from the docs directory |
//! | `doclet ask "<question>"` | Answer one question and print its references |
//! | `doclet chat` | Interactive question-answering session |
//! | `doclet sources` | List indexed source files |
//! | `doclet reset` | Delete the vector index and the ingestion manifest |

use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use doclet::config::{self, Config};
use doclet::embedding::create_embedder;
use doclet::generate::LlamaServerGenerator;
use doclet::ingest::{run_ingest, IngestOptions, IngestReport};
use doclet::index::{indexed_sources, SqliteIndex};
use doclet::progress::{IngestProgressReporter, ProgressMode, StderrProgress};
use doclet::session::{format_sources, reset_knowledge_base, Answer, Session};

/// Doclet: private question answering over local documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means built-in defaults.
#[derive(Parser)]
#[command(name = "doclet", version, about = "Private question answering over local documents")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/doclet.toml")]
    config: PathBuf,

    /// More log output (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index new or changed documents.
    ///
    /// Walks the docs directory for `.md`, `.txt` and `.pdf` files, skips
    /// files whose content fingerprint matches the manifest, and embeds the
    /// rest into the vector index.
    Ingest {
        /// Also evict files that were ingested before but no longer exist.
        #[arg(long)]
        prune: bool,

        /// Progress output on stderr. Defaults to `human` on a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Answer a single question.
    Ask {
        question: String,

        /// Restrict retrieval to these sources (repeatable). Defaults to all.
        #[arg(long = "source")]
        sources: Vec<String>,
    },

    /// Start an interactive session. Type `/help` for commands.
    Chat,

    /// List indexed source files.
    Sources,

    /// Delete the vector index and the ingestion manifest.
    Reset,
}

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("DOCLET_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Ingest { prune, progress } => {
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            let report = ingest(&cfg, mode.reporter().as_ref(), prune).await?;
            print_ingest_report(&report);
        }
        Commands::Ask { question, sources } => {
            let mut session = open_session(&cfg).await?;
            if !sources.is_empty() {
                session.select(sources).await?;
            }
            let answer = session.ask(&question).await?;
            print_answer(&answer);
        }
        Commands::Chat => {
            let session = open_session(&cfg).await?;
            run_chat(&cfg, session).await?;
        }
        Commands::Sources => {
            let sources = match SqliteIndex::open_existing(&cfg.paths.index_dir).await? {
                Some(index) => {
                    let sources = indexed_sources(&index).await?;
                    index.close().await;
                    sources
                }
                None => BTreeSet::new(),
            };
            print_sources(&sources);
        }
        Commands::Reset => {
            reset_knowledge_base(&cfg.paths)?;
            println!("Knowledge base cleared.");
        }
    }

    Ok(())
}

async fn ingest(
    cfg: &Config,
    reporter: &dyn IngestProgressReporter,
    prune: bool,
) -> anyhow::Result<IngestReport> {
    let embedder = create_embedder(&cfg.embedding).context("failed to create embedder")?;
    Ok(run_ingest(cfg, embedder, reporter, IngestOptions { prune }).await?)
}

async fn open_session(cfg: &Config) -> anyhow::Result<Session> {
    let embedder = create_embedder(&cfg.embedding).context("failed to create embedder")?;
    let generator = Arc::new(LlamaServerGenerator::connect(&cfg.generation).await?);
    Ok(Session::new(cfg.clone(), embedder, generator))
}

fn print_ingest_report(report: &IngestReport) {
    for (path, reason) in &report.failures {
        eprintln!("failed to load {}: {}", path.display(), reason);
    }
    for path in &report.pruned {
        eprintln!("pruned {}", path);
    }
    println!("{}", report);
}

fn print_answer(answer: &Answer) {
    if let Some(notice) = &answer.notice {
        eprintln!("warning: {}", notice);
    }
    println!("{}", answer.text);
    if !answer.sources.is_empty() {
        println!();
        println!("References ({} relevant chunks):", answer.sources.len());
        println!("{}", format_sources(&answer.sources));
    }
}

fn print_sources(sources: &BTreeSet<String>) {
    if sources.is_empty() {
        println!("Knowledge base is empty.");
        return;
    }
    for source in sources {
        println!("{}", source);
    }
    println!("Indexed documents: {}", sources.len());
}

const CHAT_HELP: &str = "\
/sources            list indexed sources and the current selection
/select [NAME...]   answer only from these sources (no names: all)
/clear              clear the chat history
/ingest             index new or changed documents
/reset              delete the index and the manifest
/quit               leave the session";

async fn run_chat(cfg: &Config, mut session: Session) -> anyhow::Result<()> {
    println!("Doclet: ask a question about your documents. Type /help for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut words = line.split_whitespace();
        match words.next() {
            Some("/quit") | Some("/exit") => break,
            Some("/help") => println!("{}", CHAT_HELP),
            Some("/sources") => {
                let indexed = session.indexed_sources().await?;
                let selected = session.selected_sources().await?;
                if indexed.is_empty() {
                    println!("Knowledge base is empty.");
                }
                for source in &indexed {
                    let mark = if selected.contains(source) { "*" } else { " " };
                    println!("{} {}", mark, source);
                }
            }
            Some("/select") => {
                let names: Vec<String> = words.map(str::to_string).collect();
                if names.is_empty() {
                    session.select_all();
                    println!("Answering from all sources.");
                } else if let Err(e) = session.select(names).await {
                    eprintln!("{}", e);
                }
            }
            Some("/clear") => {
                session.clear_history();
                println!("Chat history cleared.");
            }
            Some("/ingest") => {
                match ingest(cfg, &StderrProgress, false).await {
                    Ok(report) => print_ingest_report(&report),
                    Err(e) => eprintln!("ingestion failed: {:#}", e),
                }
                session.invalidate();
            }
            Some("/reset") => match session.reset() {
                Ok(()) => println!("Knowledge base cleared."),
                Err(e) => eprintln!("reset failed: {}", e),
            },
            Some(cmd) if cmd.starts_with('/') => {
                eprintln!("unknown command {}; type /help", cmd);
            }
            _ => match session.ask(line).await {
                Ok(answer) => print_answer(&answer),
                Err(e) => eprintln!("{}", e),
            },
        }
    }

    Ok(())
}
