//! Apply state machine.
//!
//! `Idle → Validating → Locking → BackingUp → Applying(tier)… → Logging → Done`,
//! with `Failed` reachable from every state. Nothing is written before
//! `BackingUp`, and the repository lock is held from `Locking` to the end.

use std::fmt;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backup::BackupManager;
use crate::config::{CONFIG_FILE_NAME, EngineConfig};
use crate::diff::{ParsedDiff, PatchLevel};
use crate::error::{PatchError, TierFailure};
use crate::lock::LockGuard;
use crate::runner::CommandRunner;
use crate::store::StateLayout;
use crate::strategy::{ApplyContext, ApplyStrategy, StrategyKind};
use crate::validate::{DiffValidator, validate_patch_id};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyPhase {
    Idle,
    Validating,
    Locking,
    BackingUp,
    Applying(StrategyKind),
    Logging,
    Done,
    Failed(String),
}

impl fmt::Display for ApplyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Validating => f.write_str("validating"),
            Self::Locking => f.write_str("locking"),
            Self::BackingUp => f.write_str("backing up"),
            Self::Applying(kind) => write!(f, "applying ({kind})"),
            Self::Logging => f.write_str("logging"),
            Self::Done => f.write_str("done"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Result of a successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub patch_id: String,
    pub strategy: StrategyKind,
    pub level: PatchLevel,
    /// Repo-relative paths the diff touched.
    pub files: Vec<String>,
    /// Files that changed without a backup being taken first.
    pub missing_backups: Vec<String>,
}

impl ApplyReport {
    pub fn message(&self) -> String {
        if self.missing_backups.is_empty() {
            "Applied".to_string()
        } else {
            format!("Applied (no backup for: {})", self.missing_backups.join(", "))
        }
    }
}

pub(crate) struct ApplyCoordinator<'a> {
    repo_root: &'a Path,
    config: &'a EngineConfig,
    layout: &'a StateLayout,
    strategies: &'a [Box<dyn ApplyStrategy>],
    runner: Option<&'a dyn CommandRunner>,
    program: &'a str,
    phase: ApplyPhase,
}

impl<'a> ApplyCoordinator<'a> {
    pub(crate) fn new(
        repo_root: &'a Path,
        config: &'a EngineConfig,
        layout: &'a StateLayout,
        strategies: &'a [Box<dyn ApplyStrategy>],
        runner: Option<&'a dyn CommandRunner>,
        program: &'a str,
    ) -> Self {
        Self {
            repo_root,
            config,
            layout,
            strategies,
            runner,
            program,
            phase: ApplyPhase::Idle,
        }
    }

    pub(crate) fn phase(&self) -> &ApplyPhase {
        &self.phase
    }

    fn transition(&mut self, patch_id: &str, next: ApplyPhase) {
        debug!(patch_id, from = %self.phase, to = %next, "Apply phase change");
        self.phase = next;
    }

    pub(crate) async fn run(
        &mut self,
        diff_text: &str,
        patch_id: &str,
    ) -> Result<ApplyReport, PatchError> {
        match self.drive(diff_text, patch_id).await {
            Ok(report) => {
                self.transition(patch_id, ApplyPhase::Done);
                info!(patch_id, strategy = %report.strategy, "Patch applied");
                Ok(report)
            }
            Err(err) => {
                self.transition(patch_id, ApplyPhase::Failed(err.to_string()));
                warn!(patch_id, error = %err, "Patch apply failed");
                Err(err)
            }
        }
    }

    async fn drive(&mut self, diff_text: &str, patch_id: &str) -> Result<ApplyReport, PatchError> {
        let (repo_root, config, layout) = (self.repo_root, self.config, self.layout);

        self.transition(patch_id, ApplyPhase::Validating);
        validate_patch_id(patch_id)?;
        DiffValidator::new(repo_root)?
            .protect(config.state_dir.clone())
            .protect_file(CONFIG_FILE_NAME)
            .validate(diff_text)?;
        let diff = ParsedDiff::parse(diff_text);
        if diff.files.is_empty() {
            return Err(PatchError::EmptyDiff);
        }

        self.transition(patch_id, ApplyPhase::Locking);
        let _guard = LockGuard::acquire(layout)?;

        self.transition(patch_id, ApplyPhase::BackingUp);
        let manifest = BackupManager::new(repo_root, layout, config.backup.fail_on_error)
            .snapshot(&diff, patch_id)
            .await?;

        let ctx = ApplyContext {
            repo_root,
            runner: self.runner,
            program: self.program,
            tool: &config.external,
        };
        let mut failures = Vec::new();
        let mut applied_with = None;
        let strategies = self.strategies;
        for strategy in strategies {
            let kind = strategy.kind();
            self.transition(patch_id, ApplyPhase::Applying(kind));
            match strategy.attempt(&ctx, &diff).await {
                Ok(()) => {
                    applied_with = Some(kind);
                    break;
                }
                Err(err) => {
                    debug!(patch_id, strategy = %kind, error = %format!("{err:#}"), "Strategy failed");
                    failures.push(TierFailure {
                        strategy: kind,
                        reason: format!("{err:#}"),
                    });
                }
            }
        }
        let Some(strategy) = applied_with else {
            return Err(PatchError::AllStrategiesFailed(failures));
        };

        self.transition(patch_id, ApplyPhase::Logging);
        layout
            .write_log(patch_id, diff_text)
            .await
            .map_err(|source| PatchError::Io {
                action: "write patch log",
                path: layout.log_path(patch_id),
                source,
            })?;

        Ok(ApplyReport {
            patch_id: patch_id.to_string(),
            strategy,
            level: diff.level,
            files: diff.touched_paths().into_iter().map(str::to_string).collect(),
            missing_backups: manifest.missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::default_strategies;
    use std::fs as std_fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn ends_in_done_and_logs_the_diff() {
        let dir = tempdir().unwrap();
        std_fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        let root = dir.path().canonicalize().unwrap();
        let config = EngineConfig::default();
        let layout = StateLayout::new(&root, &config.state_dir);
        let strategies = default_strategies(false);

        let diff = "--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-one\n+two\n";
        let mut coordinator =
            ApplyCoordinator::new(&root, &config, &layout, &strategies, None, "patch");
        let report = coordinator.run(diff, "c1").await.unwrap();

        assert_eq!(coordinator.phase(), &ApplyPhase::Done);
        assert_eq!(report.strategy, StrategyKind::PerFileShard);
        assert_eq!(report.message(), "Applied");
        assert_eq!(layout.read_log("c1").await.unwrap().as_deref(), Some(diff));
    }

    #[tokio::test]
    async fn rejected_diff_fails_before_locking() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let config = EngineConfig::default();
        let layout = StateLayout::new(&root, &config.state_dir);
        let strategies = default_strategies(false);

        let diff = "--- a/../x\n+++ b/../x\n@@ -1 +1 @@\n-a\n+b\n";
        let mut coordinator =
            ApplyCoordinator::new(&root, &config, &layout, &strategies, None, "patch");
        let err = coordinator.run(diff, "c2").await.unwrap_err();

        assert!(matches!(err, PatchError::Security(_)));
        assert!(matches!(coordinator.phase(), ApplyPhase::Failed(_)));
        assert!(!layout.dir().exists());
    }

    #[test]
    fn report_lists_missing_backups() {
        let report = ApplyReport {
            patch_id: "p".to_string(),
            strategy: StrategyKind::ExternalPatch,
            level: PatchLevel::P1,
            files: vec!["a".to_string(), "b".to_string()],
            missing_backups: vec!["b".to_string()],
        };
        assert_eq!(report.message(), "Applied (no backup for: b)");
    }
}
