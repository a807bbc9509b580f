use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::io::ErrorKind;
use tokio::fs;
use tracing::debug;

use super::block::replace_in_file;
use super::{ApplyContext, ApplyStrategy, StrategyKind};
use crate::atomic::write_atomic;
use crate::diff::{FileDiff, ParsedDiff, PatchLevel};

/// Tier B: apply the diff one file section at a time. The first section
/// that fails stops the tier; sections already applied stay applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerFileShardStrategy;

#[async_trait]
impl ApplyStrategy for PerFileShardStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PerFileShard
    }

    async fn attempt(&self, ctx: &ApplyContext<'_>, diff: &ParsedDiff) -> Result<()> {
        for file in &diff.files {
            apply_shard(ctx, file, diff.level)
                .await
                .with_context(|| file.display_path().to_string())?;
        }
        Ok(())
    }
}

async fn apply_shard(ctx: &ApplyContext<'_>, file: &FileDiff, level: PatchLevel) -> Result<()> {
    let header = &file.header;

    if header.is_addition() {
        let relative = header
            .new_target(level)
            .ok_or_else(|| anyhow!("new file has no path"))?;
        write_atomic(&ctx.repo_root.join(relative), file.added_content().as_bytes())
            .await
            .with_context(|| format!("failed to create {relative}"))?;
        debug!(path = relative, "Created file");
        return Ok(());
    }

    if header.is_deletion() {
        let relative = header
            .old_target(level)
            .ok_or_else(|| anyhow!("deleted file has no path"))?;
        match fs::remove_file(ctx.repo_root.join(relative)).await {
            Ok(()) => debug!(path = relative, "Deleted file"),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = relative, "File to delete is already gone");
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to delete {relative}"));
            }
        }
        return Ok(());
    }

    let Some(tool) = ctx.patch_tool() else {
        return replace_in_file(ctx.repo_root, file, level).await;
    };

    let shard_text = file.to_p0_text(level);
    match tool.check_and_apply(&shard_text, PatchLevel::P0).await {
        Ok(()) => Ok(()),
        Err(tool_err) => {
            debug!(path = file.display_path(), error = %tool_err, "Shard rejected by external tool");
            replace_in_file(ctx.repo_root, file, level)
                .await
                .map_err(|block_err| anyhow!("{tool_err:#}; block replace: {block_err:#}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExternalToolConfig;
    use crate::strategy::testing::ScriptedRunner;
    use std::fs as std_fs;
    use tempfile::tempdir;

    const MIXED: &str = "\
--- /dev/null
+++ b/pkg/new.py
@@ -0,0 +1,2 @@
+x = 1
+y = 2
--- a/old.py
+++ /dev/null
@@ -1 +0,0 @@
-gone
--- a/keep.py
+++ b/keep.py
@@ -1 +1 @@
-a = 1
+a = 2
";

    #[tokio::test]
    async fn creates_deletes_and_edits_without_tool() {
        let dir = tempdir().unwrap();
        std_fs::write(dir.path().join("old.py"), "gone\n").unwrap();
        std_fs::write(dir.path().join("keep.py"), "a = 1\n").unwrap();

        let config = ExternalToolConfig::default();
        let ctx = ApplyContext {
            repo_root: dir.path(),
            runner: None,
            program: "patch",
            tool: &config,
        };
        PerFileShardStrategy
            .attempt(&ctx, &ParsedDiff::parse(MIXED))
            .await
            .unwrap();

        assert_eq!(
            std_fs::read_to_string(dir.path().join("pkg/new.py")).unwrap(),
            "x = 1\ny = 2\n"
        );
        assert!(!dir.path().join("old.py").exists());
        assert_eq!(
            std_fs::read_to_string(dir.path().join("keep.py")).unwrap(),
            "a = 2\n"
        );
    }

    #[tokio::test]
    async fn edits_go_through_tool_at_level_zero() {
        let dir = tempdir().unwrap();
        std_fs::write(dir.path().join("old.py"), "gone\n").unwrap();

        let runner = ScriptedRunner::new(|args, stdin| {
            assert!(args.contains(&"-p0".to_string()));
            assert!(stdin.unwrap_or_default().starts_with("--- keep.py\n+++ keep.py\n"));
            Ok(ScriptedRunner::exit(0))
        });
        let config = ExternalToolConfig::default();
        let ctx = ApplyContext {
            repo_root: dir.path(),
            runner: Some(&runner),
            program: "patch",
            tool: &config,
        };
        PerFileShardStrategy
            .attempt(&ctx, &ParsedDiff::parse(MIXED))
            .await
            .unwrap();

        // Dry run and real apply for keep.py only.
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn tool_failure_falls_back_to_block_replace() {
        let dir = tempdir().unwrap();
        std_fs::write(dir.path().join("keep.py"), "a = 1\n").unwrap();

        let runner = ScriptedRunner::new(|_, _| Ok(ScriptedRunner::exit(1)));
        let config = ExternalToolConfig::default();
        let ctx = ApplyContext {
            repo_root: dir.path(),
            runner: Some(&runner),
            program: "patch",
            tool: &config,
        };
        let diff = "--- a/keep.py\n+++ b/keep.py\n@@ -1 +1 @@\n-a = 1\n+a = 2\n";
        PerFileShardStrategy
            .attempt(&ctx, &ParsedDiff::parse(diff))
            .await
            .unwrap();
        assert_eq!(
            std_fs::read_to_string(dir.path().join("keep.py")).unwrap(),
            "a = 2\n"
        );
    }

    #[tokio::test]
    async fn failing_shard_names_its_file() {
        let dir = tempdir().unwrap();
        std_fs::write(dir.path().join("keep.py"), "unrelated\n").unwrap();

        let config = ExternalToolConfig::default();
        let ctx = ApplyContext {
            repo_root: dir.path(),
            runner: None,
            program: "patch",
            tool: &config,
        };
        let diff = "--- a/keep.py\n+++ b/keep.py\n@@ -1 +1 @@\n-a = 1\n+a = 2\n";
        let err = PerFileShardStrategy
            .attempt(&ctx, &ParsedDiff::parse(diff))
            .await
            .unwrap_err();
        let text = format!("{err:#}");
        assert!(text.starts_with("b/keep.py: "), "{text}");
        assert!(text.contains("not found verbatim"));
    }
}
