//! # Extraction Guard CLI (`exg`)
//!
//! ## Usage
//!
//! ```bash
//! exg --config ./config/exg.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `exg init` | Create the SQLite database and run schema migrations |
//! | `exg ingest <file>` | Insert a PENDING record from a JSON file |
//! | `exg show <id>` | Print the authoritative record |
//! | `exg claim <id>` | Claim a PENDING record for extraction |
//! | `exg transition <id> --from A,B --to C` | Guarded state transition |
//! | `exg process <id> --analysis <file>` | Run the extraction pipeline |
//! | `exg patch <id> --expected-version N --fields <json>` | Versioned reviewer edit |
//! | `exg check <id>` | Aggregation consistency report |
//! | `exg serve` | Start the review HTTP API |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `warn`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use extraction_guard::{config, migrate, records, server};

/// Extraction Guard: race-free extraction records with a rate-limit-aware
/// completion fallback.
#[derive(Parser)]
#[command(name = "exg", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/exg.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Insert a new PENDING record at version 0.
    ///
    /// The file holds `{document_fingerprint, fields, line_items}`; the new
    /// record id is printed on stdout.
    Ingest {
        /// Path to the record JSON file.
        file: PathBuf,

        /// Source document; its SHA-256 becomes the fingerprint.
        #[arg(long)]
        document: Option<PathBuf>,
    },

    /// Print a record as JSON.
    Show { id: String },

    /// Claim a PENDING record (PENDING → PROCESSING).
    Claim { id: String },

    /// Move a record between states if it is in one of the `--from` states.
    Transition {
        id: String,

        /// Comma-separated accepted source states.
        #[arg(long)]
        from: String,

        /// Target state.
        #[arg(long)]
        to: String,
    },

    /// Claim a record and run analysis, fallback and consistency checks.
    ///
    /// The fallback cache lives for this one invocation, so every group is
    /// a fresh call. Long-running callers share a `FallbackOrchestrator`
    /// across records to get cache hits.
    Process {
        id: String,

        /// Saved document-analysis output (JSON).
        #[arg(long)]
        analysis: PathBuf,
    },

    /// Apply a reviewer edit guarded by the version last seen.
    Patch {
        id: String,

        #[arg(long)]
        expected_version: u64,

        /// JSON object of `{field_name: value}`; `null` clears a field.
        #[arg(long)]
        fields: String,
    },

    /// Run the aggregation consistency checker.
    Check { id: String },

    /// Start the review HTTP API on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { file, document } => {
            records::run_ingest(&cfg, &file, document.as_deref()).await?;
        }
        Commands::Show { id } => {
            records::run_show(&cfg, &id).await?;
        }
        Commands::Claim { id } => {
            records::run_claim(&cfg, &id).await?;
        }
        Commands::Transition { id, from, to } => {
            records::run_transition(&cfg, &id, &from, &to).await?;
        }
        Commands::Process { id, analysis } => {
            records::run_process(&cfg, &id, &analysis).await?;
        }
        Commands::Patch {
            id,
            expected_version,
            fields,
        } => {
            records::run_patch(&cfg, &id, expected_version, &fields).await?;
        }
        Commands::Check { id } => {
            records::run_check(&cfg, &id).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
