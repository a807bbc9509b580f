//! vtpatch - apply and roll back unified diffs inside a repository

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

#[derive(Parser, Debug)]
#[command(name = "vtpatch")]
#[command(about = "Validated, lock-guarded unified-diff application with rollback")]
#[command(version)]
pub struct Cli {
    /// Repository root the diff paths are relative to
    #[arg(long, global = true, default_value = ".")]
    pub repo: PathBuf,

    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply a unified diff read from FILE or stdin
    Apply {
        /// Identifier for backups and the patch log
        #[arg(long)]
        id: String,
        /// Diff file; stdin when omitted
        file: Option<PathBuf>,
    },
    /// Undo a previously applied patch
    Rollback {
        id: String,
    },
    /// Regex search across the repository
    Search {
        pattern: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Print a diff moving a file to a new path
    MoveModule {
        from: String,
        to: String,
    },
    /// Print a diff replacing an import string across the repository
    UpdateImport {
        old: String,
        new: String,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Cli::parse();
    init_tracing(args.verbose);

    let success = cli::run(args).await?;
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
