//! `repovault` operator CLI.
//!
//! # Responsibility
//! - Apply migrations, run worker pools and inspect task status for a
//!   database described by a config file.
//! - Keep output line-oriented and deterministic for scripts.

use clap::{Parser, Subcommand};
use log::error;
use repovault_core::{
    default_registry, init_logging_from_config, open_db, CoreConfig, SqliteTaskQueue, TaskQueue,
    WorkerPool,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use uuid::Uuid;

/// Repository version control backend.
#[derive(Parser, Debug)]
#[command(name = "repovault")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the core library is linked
    Ping,
    /// Open the database and apply pending schema migrations
    Migrate {
        /// Path to the TOML config file
        config: PathBuf,
    },
    /// Run a worker pool executing queued repository tasks
    Worker {
        /// Path to the TOML config file
        config: PathBuf,
        /// Exit once no waiting task remains
        #[arg(long)]
        burst: bool,
    },
    /// Print one task record as JSON
    Status {
        /// Path to the TOML config file
        config: PathBuf,
        /// Task id returned at enqueue time
        task_id: Uuid,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("event=cli_exit module=cli status=error error={}", message);
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<(), String> {
    match command {
        Command::Ping => {
            println!("repovault_core ping={}", repovault_core::ping());
            println!("repovault_core version={}", repovault_core::core_version());
            Ok(())
        }
        Command::Migrate { config } => {
            let config = load_config(&config)?;
            open_db(&config.db_path).map_err(|err| err.to_string())?;
            println!("migrated {}", config.db_path.display());
            Ok(())
        }
        Command::Worker { config, burst } => {
            let config = load_config(&config)?;
            let registry = default_registry().map_err(|err| err.to_string())?;
            let mut workers = config.worker_config();
            workers.burst = burst;

            let pool = WorkerPool::start(&config.db_path, Arc::new(registry), &workers)
                .map_err(|err| err.to_string())?;
            println!("started {}", pool.worker_names().join(","));
            // Without --burst workers poll until the process is killed.
            pool.wait();
            Ok(())
        }
        Command::Status { config, task_id } => {
            let config = load_config(&config)?;
            let conn = open_db(&config.db_path).map_err(|err| err.to_string())?;
            let record = SqliteTaskQueue::new(&conn)
                .task_status(task_id)
                .map_err(|err| err.to_string())?
                .ok_or_else(|| format!("task not found: {task_id}"))?;
            let json = serde_json::to_string_pretty(&record).map_err(|err| err.to_string())?;
            println!("{json}");
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<CoreConfig, String> {
    let config = CoreConfig::load(path).map_err(|err| err.to_string())?;
    init_logging_from_config(&config)?;
    Ok(config)
}
