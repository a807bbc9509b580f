use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing::debug;
use vtpatch_core::{ApplyOutcome, PatchEngine};

use crate::{Cli, Commands};

/// Run one subcommand. `Ok(false)` means the operation itself failed and
/// has already been reported.
pub async fn run(cli: Cli) -> Result<bool> {
    let engine = PatchEngine::new(&cli.repo)
        .with_context(|| format!("failed to open repository {}", cli.repo.display()))?;
    debug!(
        repo = %engine.repo_root().display(),
        external_tool = engine.has_external_tool(),
        "Opened repository"
    );

    match cli.command {
        Commands::Apply { id, file } => {
            let diff = read_diff(file.as_deref()).await?;
            let outcome = engine.apply(&diff, &id).await;
            Ok(report(&outcome, cli.json))
        }
        Commands::Rollback { id } => {
            let outcome = engine.rollback(&id).await;
            Ok(report(&outcome, cli.json))
        }
        Commands::Search { pattern, limit } => {
            let matches = engine.search_code(&pattern, limit)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&matches)?);
            } else {
                for m in &matches {
                    println!("{}:{}:{}", m.path, m.line_number, m.line);
                }
            }
            Ok(true)
        }
        Commands::MoveModule { from, to } => {
            print_diff(&engine.module_move_diff(&from, &to)?, cli.json);
            Ok(true)
        }
        Commands::UpdateImport { old, new } => {
            print_diff(&engine.import_update_diff(&old, &new)?, cli.json);
            Ok(true)
        }
    }
}

async fn read_diff(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read diff from {}", path.display())),
        None => {
            let mut diff = String::new();
            tokio::io::stdin()
                .read_to_string(&mut diff)
                .await
                .context("failed to read diff from stdin")?;
            Ok(diff)
        }
    }
}

fn report(outcome: &ApplyOutcome, as_json: bool) -> bool {
    if as_json {
        println!("{}", json!({ "success": outcome.success, "message": outcome.message }));
    } else if outcome.success {
        println!("{}", outcome.message);
    } else {
        eprintln!("{}", outcome.message);
    }
    outcome.success
}

fn print_diff(diff: &str, as_json: bool) {
    if as_json {
        println!("{}", json!({ "diff": diff }));
    } else {
        print!("{diff}");
    }
}
