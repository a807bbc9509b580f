use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use std::path::Path;
use tokio::fs;
use tracing::debug;

use super::{ApplyContext, ApplyStrategy, StrategyKind};
use crate::atomic::write_atomic;
use crate::diff::{FileDiff, ParsedDiff, PatchLevel};

/// Tier C: literal replacement of the removed block with the added block,
/// for single-file diffs with one contiguous change group.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleBlockReplaceStrategy;

#[async_trait]
impl ApplyStrategy for SimpleBlockReplaceStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SimpleBlockReplace
    }

    async fn attempt(&self, ctx: &ApplyContext<'_>, diff: &ParsedDiff) -> Result<()> {
        let [file] = diff.files.as_slice() else {
            bail!(
                "only single-file diffs are supported, got {} files",
                diff.files.len()
            );
        };
        replace_in_file(ctx.repo_root, file, diff.level).await
    }
}

/// Apply one shard by block replacement.
pub(crate) async fn replace_in_file(
    repo_root: &Path,
    file: &FileDiff,
    level: PatchLevel,
) -> Result<()> {
    if file.header.is_addition() || file.header.is_deletion() {
        bail!("cannot create or delete {}", file.display_path());
    }
    let relative = file
        .header
        .target(level)
        .ok_or_else(|| anyhow!("no target path in diff header"))?;
    let (old_block, new_block) = file.change_blocks().map_err(|reason| anyhow!(reason))?;

    let path = repo_root.join(relative);
    let content = fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read {relative}"))?;

    let updated = replace_block(&content, &old_block, &new_block)
        .ok_or_else(|| anyhow!("old block not found verbatim in {relative}"))?;

    write_atomic(&path, updated.as_bytes())
        .await
        .with_context(|| format!("failed to write {relative}"))?;
    debug!(path = relative, "Replaced block");
    Ok(())
}

/// Replace the first occurrence of `old` in `content`, preferring a match
/// that includes the line terminator. `None` when `old` is empty or absent.
pub(crate) fn replace_block(content: &str, old: &str, new: &str) -> Option<String> {
    if old.is_empty() {
        return None;
    }

    let old_line = format!("{old}\n");
    if content.contains(&old_line) {
        let new_line = if new.is_empty() {
            String::new()
        } else {
            format!("{new}\n")
        };
        return Some(content.replacen(&old_line, &new_line, 1));
    }

    content
        .contains(old)
        .then(|| content.replacen(old, new, 1))
}
