//! # Building Code Harness CLI (`bch`)
//!
//! Ingest OCR'd building code documents, search them, and ask questions
//! answered from the indexed text with section-level citations.
//!
//! ## Usage
//!
//! ```bash
//! bch --config ./config/bch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `bch init` | Create the SQLite database and run schema migrations |
//! | `bch ingest <path>` | Chunk, embed, and index pages from a file or directory |
//! | `bch remove <id>` | Remove a document from the index |
//! | `bch search "<query>"` | Print ranked, cited excerpts |
//! | `bch ask "<question>"` | Stream an answer with its sources |
//! | `bch chat` | Multi-turn question answering on stdin |
//! | `bch stats` | Document, chunk, and vector counts |
//! | `bch serve` | Start the HTTP API and the MCP endpoint |
//!
//! ## Examples
//!
//! ```bash
//! bch init
//! bch ingest ./ocr/ibc-2021.jsonl --document-id IBC-2021
//! bch search "minimum stair width" --k 3
//! bch ask "What is the maximum riser height for residential stairs?"
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use buildcode_harness::{ask, config, ingest, logging, migrate, search, server, stats};

/// Building Code Harness: cited question answering over building code documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/bch.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "bch",
    about = "Building Code Harness: cited question answering over building code documents",
    version,
    long_about = "Building Code Harness chunks OCR'd building code pages with page, section, \
    and paragraph provenance, indexes them with a local or remote embedding model, and \
    answers questions from the retrieved excerpts with exact citations, via a CLI and an \
    HTTP API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/bch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Safe to
    /// run more than once.
    Init,

    /// Ingest pages from a file or directory.
    ///
    /// Accepts `.json`, `.jsonl`, `.txt` (form-feed separated pages), and
    /// `.pdf` (text layer only). Re-ingesting a document replaces it.
    Ingest {
        /// File or directory to ingest.
        path: PathBuf,

        /// Document id for a single file. Defaults to the file stem.
        #[arg(long)]
        document_id: Option<String>,

        /// Show page and chunk counts without embedding or writing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove a document and all of its chunks and vectors.
    Remove {
        document_id: String,
    },

    /// Search the index without generating an answer.
    Search {
        query: String,

        /// Number of hits to return (default: `[retrieval].top_k`).
        #[arg(long)]
        k: Option<usize>,

        /// Print hits as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Ask a question and stream a cited answer.
    Ask {
        query: String,

        /// Number of excerpts to retrieve (default: `[retrieval].top_k`).
        #[arg(long)]
        k: Option<usize>,
    },

    /// Interactive multi-turn session.
    Chat {
        /// Number of excerpts to retrieve per question.
        #[arg(long)]
        k: Option<usize>,
    },

    /// Show index statistics.
    Stats,

    /// Start the HTTP API on `[server].bind`.
    ///
    /// MCP clients connect to `/mcp` on the same address.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            path,
            document_id,
            dry_run,
        } => {
            ingest::run_ingest(&cfg, &path, document_id.as_deref(), dry_run).await?;
        }
        Commands::Remove { document_id } => {
            ingest::run_remove(&cfg, &document_id).await?;
        }
        Commands::Search { query, k, json } => {
            search::run_search(&cfg, &query, k, json).await?;
        }
        Commands::Ask { query, k } => {
            ask::run_ask(&cfg, &query, k).await?;
        }
        Commands::Chat { k } => {
            ask::run_chat(&cfg, k).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
