//! CLI entry point for reelq
//!
//! `reelqd run` starts the daemon. The other subcommands work directly on the
//! record store; tasks they create stay `queued` until a daemon picks them up
//! through recovery.

use clap::{Parser, Subcommand};
use reelq::{
    Config, Counter, Daemon, DaemonError, ListQuery, RecordStore, StoreError, TaskKind, TaskStatus,
    DEFAULT_PAGE_LIMIT,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// reelq - durable analysis queue with a single-flight media cache
#[derive(Parser, Debug)]
#[command(name = "reelqd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (missing file means defaults)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon until Ctrl-C
    Run,

    /// Create a batch and print it
    BatchCreate {
        #[arg(long)]
        title: String,
    },

    /// List all batches
    Batches,

    /// Queue a task in an existing batch
    Submit {
        #[arg(long)]
        batch: String,

        /// Source URL to analyze
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        url: Option<String>,

        /// Local file to copy into the batch's uploads
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// List a page of tasks in a batch
    List {
        #[arg(long)]
        batch: String,

        #[arg(long)]
        status: Option<TaskStatus>,

        #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
        limit: usize,

        #[arg(long)]
        cursor: Option<String>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    Config(#[from] reelq::config::ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to read {path}: {source}")]
    ReadUpload {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("One of --url or --file is required")]
    MissingSource,

    #[error("Upload path {0} has no usable file name")]
    UploadName(PathBuf),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("reelq=info,reelqd=info"));

    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .init();
    }
}

fn render_json<T: Serialize>(value: &T) -> Result<String, CliError> {
    Ok(serde_json::to_string_pretty(value)?)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", render_json(value)?);
    Ok(())
}

fn open_store(config_path: &Path) -> Result<RecordStore, CliError> {
    let config = Config::load_or_default(config_path)?;
    Ok(RecordStore::new(config.store.data_dir))
}

/// Create a queued task without a running pool.
fn submit_offline(
    store: &RecordStore,
    batch: &str,
    url: Option<String>,
    file: Option<PathBuf>,
) -> Result<(), CliError> {
    let (kind, payload) = match (url, file) {
        (Some(url), _) => (TaskKind::Url, url),
        (None, Some(path)) => {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or_else(|| CliError::UploadName(path.clone()))?;
            let contents = std::fs::read(&path).map_err(|source| CliError::ReadUpload {
                path: path.clone(),
                source,
            })?;
            store.save_upload(batch, &name, &contents)?;
            (TaskKind::File, name)
        }
        (None, None) => return Err(CliError::MissingSource),
    };

    let task = store.create_task(batch, kind, &payload)?;
    if let Err(e) = store.bump_batch_counter(batch, Counter::Queued) {
        warn!(batch_id = %batch, error = %e, "Failed to bump queued counter");
    }
    info!(batch_id = %batch, task_id = %task.id, "Task queued for the next daemon run");
    print_json(&task)
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Run => {
            let daemon = Daemon::from_config_file(&cli.config)?;
            info!(
                config = %cli.config.display(),
                budget = daemon.concurrency_plan.budget(),
                bind_addr = %daemon.config.server.bind_addr,
                "reelqd initialized"
            );
            daemon.run_with_server().await?;
        }
        Command::BatchCreate { title } => {
            let batch = open_store(&cli.config)?.create_batch(&title)?;
            print_json(&batch)?;
        }
        Command::Batches => {
            let batches = open_store(&cli.config)?.list_batches()?;
            print_json(&batches)?;
        }
        Command::Submit { batch, url, file } => {
            let store = open_store(&cli.config)?;
            submit_offline(&store, &batch, url, file)?;
        }
        Command::List {
            batch,
            status,
            limit,
            cursor,
        } => {
            let query = ListQuery {
                status,
                limit,
                cursor,
            };
            let page = open_store(&cli.config)?.list_tasks(&batch, &query)?;
            print_json(&page)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "reelqd failed");
            ExitCode::FAILURE
        }
    }
}
