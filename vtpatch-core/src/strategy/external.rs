use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

use super::{ApplyContext, ApplyStrategy, StrategyKind};
use crate::config::ExternalToolConfig;
use crate::diff::{ParsedDiff, PatchLevel};
use crate::runner::{CommandRequest, CommandRunner};

/// Thin wrapper over the `patch` utility.
pub(crate) struct PatchTool<'a> {
    pub(crate) runner: &'a dyn CommandRunner,
    pub(crate) program: &'a str,
    pub(crate) cwd: &'a Path,
    pub(crate) config: &'a ExternalToolConfig,
}

impl PatchTool<'_> {
    /// Dry run: succeeds only if every hunk would apply cleanly.
    pub(crate) async fn check(&self, diff_text: &str, level: PatchLevel) -> Result<()> {
        self.invoke(diff_text, level, true).await
    }

    pub(crate) async fn apply(&self, diff_text: &str, level: PatchLevel) -> Result<()> {
        self.invoke(diff_text, level, false).await
    }

    /// Dry run, then the real apply at the same level.
    pub(crate) async fn check_and_apply(&self, diff_text: &str, level: PatchLevel) -> Result<()> {
        self.check(diff_text, level).await?;
        self.apply(diff_text, level).await
    }

    async fn invoke(&self, diff_text: &str, level: PatchLevel, dry_run: bool) -> Result<()> {
        let mut args = vec![
            "--batch".to_string(),
            "--forward".to_string(),
            "--no-backup-if-mismatch".to_string(),
            level.flag().to_string(),
        ];
        if dry_run {
            args.push("--dry-run".to_string());
        }

        let timeout = if dry_run {
            self.config.dry_run_timeout()
        } else {
            self.config.apply_timeout()
        };

        let output = self
            .runner
            .run(CommandRequest {
                program: self.program,
                args,
                cwd: self.cwd,
                stdin: Some(diff_text),
                timeout,
            })
            .await?;

        if !output.success() {
            let mode = if dry_run { "dry run" } else { "apply" };
            bail!(
                "{} {level} {mode} exited with {}: {}",
                self.program,
                output
                    .exit_code
                    .map_or_else(|| "signal".to_string(), |code| code.to_string()),
                output.diagnostics()
            );
        }
        Ok(())
    }
}

/// Tier A: hand the whole diff to the external tool, at the detected level
/// or, if its dry run fails, at the opposite one.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalPatchStrategy;

#[async_trait]
impl ApplyStrategy for ExternalPatchStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ExternalPatch
    }

    async fn attempt(&self, ctx: &ApplyContext<'_>, diff: &ParsedDiff) -> Result<()> {
        let tool = ctx
            .patch_tool()
            .ok_or_else(|| anyhow!("external patch tool is not available"))?;

        let detected = diff.level;
        let level = match tool.check(&diff.text, detected).await {
            Ok(()) => detected,
            Err(first) => {
                let alternate = detected.opposite();
                debug!(level = %detected, error = %first, "Dry run failed, trying {alternate}");
                tool.check(&diff.text, alternate).await.map_err(|second| {
                    anyhow!(
                        "dry run failed at {detected} ({first:#}) and at {alternate} ({second:#})"
                    )
                })?;
                alternate
            }
        };

        tool.apply(&diff.text, level).await
    }
}
