//! # docquery CLI (`dq`)
//!
//! ## Usage
//!
//! ```bash
//! dq --config ./config/docquery.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dq init` | Write a default config if missing and create the store |
//! | `dq status` | List tracked documents and their processing state |
//! | `dq ingest <path>` | Ingest a file or a directory unless already processed |
//! | `dq query "<question>"` | Answer a question from the indexed documents |
//! | `dq show <doc-id>` | Print a document's record and chunks |
//! | `dq demo` | Ingest the configured document and run two sample queries |

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use std::path::PathBuf;

use docquery::config::{self, Config};
use docquery::db;
use docquery::demo;
use docquery::ensure::{self, EnsureOptions, MatchPolicy};
use docquery::ingest::{self, IngestOptions};
use docquery::inspect;
use docquery::migrate;
use docquery::models::{DocStatus, QueryMode};
use docquery::parser::ParseMethod;
use docquery::progress::ProgressMode;
use docquery::query::{self, QueryParams};
use docquery::rag::Rag;

/// docquery: ingest a document once, then ask it text and multimodal questions.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docquery.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "dq",
    about = "Ingest a document once, then ask text and multimodal questions about it",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docquery.toml")]
    config: PathBuf,

    /// Ingestion progress on stderr: `off`, `human` or `json`.
    /// Defaults to `human` when stderr is a terminal.
    #[arg(long, global = true)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the example config (if the file is missing) and create the store.
    ///
    /// Idempotent: an existing config is left untouched.
    Init,

    /// List tracked documents.
    Status {
        /// Only documents in this state (pending, processing, processed, failed).
        #[arg(long)]
        state: Option<DocStatus>,

        /// Print records as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Ingest a file, or every matching file under a directory.
    ///
    /// A file whose name matches an already processed document is skipped.
    Ingest {
        path: PathBuf,

        /// Ingest even if a processed document matches.
        #[arg(long)]
        force: bool,

        /// Match processed documents by absolute path instead of file name.
        #[arg(long)]
        match_path: bool,

        /// Override `[parser] method` (auto, txt, ocr).
        #[arg(long)]
        method: Option<ParseMethod>,

        /// Override `[parser] device` (cpu, mps, cuda, cuda:<n>).
        #[arg(long)]
        device: Option<String>,
    },

    /// Answer a question from the indexed documents.
    Query {
        question: String,

        /// Retrieval mode: `keyword`, `semantic` (alias `naive`) or `hybrid`.
        #[arg(long, default_value = "hybrid")]
        mode: QueryMode,

        /// Number of chunks passed as context. Defaults to `[retrieval] top_k`.
        #[arg(long)]
        top_k: Option<i64>,

        /// Multimodal items as JSON, e.g.
        /// `[{"type":"equation","latex":"E=mc^2","equation_caption":"Energy"}]`.
        #[arg(long)]
        multimodal: Option<String>,

        /// Print the retrieved context instead of asking the model.
        #[arg(long)]
        context_only: bool,
    },

    /// Print a document's status record and chunks.
    Show {
        /// Document id (`doc-<sha256>`).
        id: String,
    },

    /// Ingest the demo document if needed, then run a text and a multimodal query.
    Demo {
        /// Document to use instead of `[demo] document`.
        #[arg(long)]
        document: Option<PathBuf>,
    },
}

/// Storage only, for commands that never call a provider.
async fn open_store(cfg: &Config) -> anyhow::Result<SqlitePool> {
    let pool = db::connect(cfg).await?;
    migrate::run_migrations(&pool).await?;
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    if let Commands::Init = cli.command {
        if !cli.config.exists() {
            if let Some(parent) = cli.config.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&cli.config, config::EXAMPLE_CONFIG)
                .with_context(|| format!("Failed to write config: {}", cli.config.display()))?;
            println!("Wrote {}", cli.config.display());
        }
    }

    let cfg: Config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = open_store(&cfg).await?;
            println!("Store initialized at {}", cfg.storage.db_path().display());
            pool.close().await;
        }
        Commands::Status { state, json } => {
            let pool = open_store(&cfg).await?;
            inspect::run_status(&pool, state, json).await?;
            pool.close().await;
        }
        Commands::Ingest {
            path,
            force,
            match_path,
            method,
            device,
        } => {
            let rag = Rag::open(cfg).await?.with_progress(progress.reporter());
            let opts = EnsureOptions {
                policy: if match_path {
                    MatchPolicy::AbsolutePath
                } else {
                    MatchPolicy::FileName
                },
                force,
                ingest: IngestOptions { method, device },
            };
            if path.is_dir() {
                let report = ingest::process_folder_complete(&rag, &path, &opts).await?;
                println!(
                    "ingested {} file(s), skipped {}",
                    report.ingested.len(),
                    report.skipped.len()
                );
            } else {
                ensure::ensure_document(&rag, &path, &opts).await?;
            }
            rag.close().await;
        }
        Commands::Query {
            question,
            mode,
            top_k,
            multimodal,
            context_only,
        } => {
            let rag = Rag::open(cfg).await?;
            let params = QueryParams {
                mode,
                top_k: top_k.unwrap_or(rag.config().retrieval.top_k),
                context_only,
            };
            let answer = match multimodal {
                Some(json) => {
                    let content = query::parse_multimodal(&json)?;
                    query::aquery_with_multimodal(&rag, &question, &content, &params).await?
                }
                None => query::aquery(&rag, &question, &params).await?,
            };
            println!("{}", answer);
            rag.close().await;
        }
        Commands::Show { id } => {
            let pool = open_store(&cfg).await?;
            inspect::run_show(&pool, &id).await?;
            pool.close().await;
        }
        Commands::Demo { document } => {
            let document = document.unwrap_or_else(|| cfg.demo.document.clone());
            demo::run_demo(cfg, &document, progress).await?;
        }
    }

    Ok(())
}
