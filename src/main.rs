//! # Docent CLI (`docent`)
//!
//! The `docent` binary initializes the database, ingests local files,
//! searches them, chats with them, evaluates retrieval, and starts the
//! HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! docent --config ./config/docent.toml --owner alice <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docent init` | Create the SQLite database and run schema migrations |
//! | `docent upload <paths…>` | Upload and process files or directories |
//! | `docent list` | List the owner's documents |
//! | `docent search "<query>"` | Hybrid search over completed documents |
//! | `docent ask "<message>"` | Run one chat turn, streaming the answer |
//! | `docent eval` | Measure retrieval quality |
//! | `docent serve` | Start the HTTP server |

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use docent::agent::{self, events::EventSink, events::StreamEvent, TurnRequest};
use docent::error::IngestError;
use docent::retrieval::{self, eval};
use docent::services::Services;
use docent::{config, extract, ingest, logging, migrate, server};

/// Docent: document retrieval and chat over your own files.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docent.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "docent", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docent.toml")]
    config: PathBuf,

    /// Owner id that uploaded documents and chat threads belong to.
    #[arg(long, global = true, default_value = "local")]
    owner: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run more than once.
    Init,

    /// Upload files, processing each one before moving on.
    ///
    /// Directories are walked recursively; files with an unrecognized
    /// extension are skipped.
    Upload {
        /// Files or directories.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// List documents with their processing status.
    List,

    /// Search completed documents.
    Search {
        query: String,

        /// Number of results.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Ask a question. The answer streams to stdout.
    Ask {
        message: String,

        /// Thread to continue. A new one is started when omitted.
        #[arg(long)]
        thread: Option<String>,
    },

    /// Evaluate retrieval against a JSON file of cases, or generated ones.
    Eval {
        /// JSON array of `{question, expected_keywords, expected_document?}`.
        #[arg(long, conflicts_with = "generate")]
        cases: Option<PathBuf>,

        /// Generate this many cases from the owner's documents.
        #[arg(long)]
        generate: Option<usize>,

        #[arg(long, default_value_t = 10)]
        top_k: usize,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let services = Services::open(cfg).await?;
    let owner = cli.owner;

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Upload { paths } => run_upload(&services, &owner, &paths).await?,
        Commands::List => {
            let docs = services.store.list_documents(&owner).await?;
            if docs.is_empty() {
                println!("No documents.");
            }
            for doc in docs {
                println!(
                    "{}  {:<10}  {:>4} chunks  {}",
                    doc.id,
                    doc.status.as_str(),
                    doc.chunk_count,
                    doc.filename
                );
                if let Some(err) = doc.error_message {
                    println!("    error: {}", err);
                }
            }
        }
        Commands::Search { query, top_k } => {
            let session = services.session()?;
            let top_k = top_k.unwrap_or(services.config.retrieval.default_top_k);
            let top_k = retrieval::check_top_k(top_k).map_err(anyhow::Error::msg)?;
            let rows = retrieval::search(&session, &owner, &query, top_k, None).await?;
            if rows.is_empty() {
                println!("No results.");
            }
            for (i, row) in rows.iter().enumerate() {
                println!("{}. [{:.4}] {}", i + 1, row.score, row.filename());
                println!("    document: {}", row.document_id);
                let preview: String = row.content.chars().take(200).collect();
                println!("    {}", preview.replace('\n', " "));
                println!();
            }
        }
        Commands::Ask { message, thread } => {
            let thread_id = thread.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            run_ask(&services, &owner, thread_id, message).await?;
        }
        Commands::Eval {
            cases,
            generate,
            top_k,
        } => {
            let top_k = retrieval::check_top_k(top_k).map_err(anyhow::Error::msg)?;
            let session = services.session()?;
            let cases = match (cases, generate) {
                (Some(path), _) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    serde_json::from_str::<Vec<eval::EvalCase>>(&raw)
                        .with_context(|| format!("Failed to parse {}", path.display()))?
                }
                (None, n) => eval::generate_cases(&session, &owner, n.unwrap_or(10)).await?,
            };
            if cases.is_empty() {
                bail!("No eval cases: pass --cases or upload documents first");
            }
            let summary = eval::run_eval(&session, &owner, &cases, top_k).await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Serve => server::run_server(services).await?,
    }

    Ok(())
}

fn collect_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        for entry in WalkDir::new(path).follow_links(true).sort_by_file_name() {
            match entry {
                Ok(e) if e.file_type().is_file() => files.push(e.into_path()),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "skipping unreadable path"),
            }
        }
    }
    files
}

async fn run_upload(services: &Services, owner: &str, paths: &[PathBuf]) -> anyhow::Result<()> {
    let session = services.session()?;
    let (mut ok, mut failed, mut skipped) = (0usize, 0usize, 0usize);

    for path in collect_files(paths) {
        let filename = file_name(&path);
        if extract::content_type_for(&filename).is_none() {
            skipped += 1;
            continue;
        }
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let request = ingest::UploadRequest {
            owner_id: owner.to_string(),
            filename: filename.clone(),
            content_type: None,
            bytes,
        };
        let doc = match ingest::upload(&session, request).await {
            Ok(doc) => doc,
            Err(e @ IngestError::DuplicateContent { .. }) => {
                println!("skip    {}  ({})", filename, e);
                skipped += 1;
                continue;
            }
            Err(e) => {
                println!("error   {}  ({})", filename, e);
                failed += 1;
                continue;
            }
        };
        match ingest::process_document(&session, owner, &doc.id).await {
            Ok(done) => {
                println!("ok      {}  ({} chunks)", filename, done.chunk_count);
                ok += 1;
            }
            Err(e) => {
                println!("failed  {}  ({})", filename, e);
                failed += 1;
            }
        }
    }

    println!(
        "Uploaded {} file(s), {} failed, {} skipped.",
        ok, failed, skipped
    );
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn run_ask(
    services: &Services,
    owner: &str,
    thread_id: String,
    content: String,
) -> anyhow::Result<()> {
    use std::io::Write;

    let session = services.session()?;
    let (sink, mut rx) = EventSink::channel(64);
    let request = TurnRequest {
        owner_id: owner.to_string(),
        thread_id: thread_id.clone(),
        content,
    };
    let turn = tokio::spawn(async move { agent::run_turn(&session, request, sink).await });

    let mut stdout = std::io::stdout();
    let mut failure = None;
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::TextDelta { content } => {
                print!("{}", content);
                stdout.flush()?;
            }
            StreamEvent::SubAgentStart { document_id, query } => {
                eprintln!("[analyzing {}: {}]", document_id, query);
            }
            StreamEvent::SubAgentThinking { content } => eprintln!("[{}]", content),
            StreamEvent::SubAgentResult { .. } => eprintln!("[analysis done]"),
            StreamEvent::Error { error } => failure = Some(error),
            StreamEvent::Done => {}
        }
    }
    println!();
    turn.await?;

    if let Some(error) = failure {
        bail!("Chat turn failed: {}", error);
    }
    eprintln!("thread: {}", thread_id);
    Ok(())
}
