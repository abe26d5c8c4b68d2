//! # Harvest Ledger CLI (`hl`)
//!
//! ## Usage
//!
//! ```bash
//! hl --config ./config/hl.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `hl init` | Create the SQLite database and run schema migrations |
//! | `hl harvest [KEYS..]` | Fetch candidate keys and record their snapshots |
//! | `hl checkpoint status` | Per-status checkpoint counts |
//! | `hl checkpoint reset` | Forget outcomes so keys are processed again |
//! | `hl history <key>` | Every version of one key |
//! | `hl as-of <key> <time>` | The version valid at a point in time |
//! | `hl vocab list` | All interned terms |
//! | `hl vocab intern <terms..>` | Intern terms and print their ids |
//! | `hl import <file>` | Backfill history from a JSON Lines file |
//!
//! ## Exit codes
//!
//! `hl harvest` exits 0 when every candidate key reached a terminal state
//! and 2 when some keys are left for a later run. Any error exits 1.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use harvest_ledger::progress::ProgressMode;
use harvest_ledger::{config, harvest_cmd, import, inspect, logging, migrate};

/// Harvest Ledger: resumable catalog harvesting into an SCD Type-2 history.
#[derive(Parser)]
#[command(name = "hl", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/hl.toml")]
    config: PathBuf,

    /// Emit diagnostic logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the entity_versions,
    /// vocabulary_terms and harvest_checkpoints tables. Safe to run again.
    Init,

    /// Harvest candidate keys.
    ///
    /// Keys already recorded as success or permanent_skip are skipped.
    /// Ctrl-C stops accepting new keys; the checkpoint is flushed first.
    Harvest {
        /// Candidate keys.
        keys: Vec<String>,

        /// File with more candidate keys (one per line, or a JSON array).
        #[arg(long)]
        keys_file: Option<PathBuf>,

        /// Override `[harvest].flush_every`.
        #[arg(long)]
        flush_every: Option<usize>,

        /// Override `[harvest].chunk_size`.
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Progress on stderr: `off`, `human` or `json`. Defaults to human on a TTY.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Inspect or reset harvest checkpoints.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Show the full version history of a key.
    History {
        key: String,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Show the version of a key valid at a point in time.
    AsOf {
        key: String,

        /// RFC 3339, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD` (UTC).
        time: String,

        #[arg(long)]
        json: bool,
    },

    /// Inspect or extend the term vocabulary.
    Vocab {
        #[command(subcommand)]
        action: VocabAction,
    },

    /// Backfill version history from a JSON Lines file of observations.
    Import { file: PathBuf },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Per-status counts for the configured job.
    Status {
        /// Also list keys in transient_failure.
        #[arg(long)]
        pending: bool,
    },
    /// Remove entries so the keys are processed again.
    Reset {
        keys: Vec<String>,

        /// Remove every entry of the job.
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
enum VocabAction {
    /// List every term with its id.
    List,
    /// Intern terms and print their ids.
    Intern {
        #[arg(required = true)]
        terms: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.log_json) {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(1);
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Harvest {
            keys,
            keys_file,
            flush_every,
            chunk_size,
            progress,
        } => {
            let keys = harvest_cmd::load_keys(&keys, keys_file.as_deref())?;
            let mode = match progress.as_deref() {
                None => ProgressMode::default_for_tty(),
                Some(s) => ProgressMode::parse(s).ok_or_else(|| {
                    anyhow::anyhow!("Unknown progress mode '{}'. Use off, human or json.", s)
                })?,
            };
            let overrides = harvest_cmd::HarvestOverrides {
                flush_every,
                chunk_size,
            };

            let stop = Arc::new(AtomicBool::new(false));
            let on_signal = stop.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received; finishing the current key");
                    on_signal.store(true, Ordering::SeqCst);
                }
            });

            let reporter = mode.reporter();
            let report =
                harvest_cmd::run_harvest(&cfg, &keys, &overrides, reporter.as_ref(), stop).await?;
            harvest_cmd::print_report(&cfg.harvest.job, &report);
            if !report.is_complete() {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Checkpoint { action } => match action {
            CheckpointAction::Status { pending } => {
                inspect::run_checkpoint_status(&cfg, pending).await?;
            }
            CheckpointAction::Reset { keys, all } => {
                inspect::run_checkpoint_reset(&cfg, &keys, all).await?;
            }
        },
        Commands::History { key, json } => {
            inspect::run_history(&cfg, &key, json).await?;
        }
        Commands::AsOf { key, time, json } => {
            let at = import::parse_instant(&time)?;
            inspect::run_as_of(&cfg, &key, at, json).await?;
        }
        Commands::Vocab { action } => match action {
            VocabAction::List => inspect::run_vocab_list(&cfg).await?,
            VocabAction::Intern { terms } => inspect::run_vocab_intern(&cfg, &terms).await?,
        },
        Commands::Import { file } => {
            let stats = import::run_import(&cfg, &file).await?;
            import::print_stats(&file, &stats);
        }
    }

    Ok(ExitCode::SUCCESS)
}
