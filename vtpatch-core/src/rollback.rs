//! Undo a previously applied patch.
//!
//! The backup namespace is authoritative. Only when it is gone is the
//! logged diff reversed and applied instead.

use std::path::Path;

use serde::Serialize;
use tokio::fs;
use tracing::{debug, info};

use crate::backup::{BackupManager, BackupManifest};
use crate::config::EngineConfig;
use crate::diff::{ParsedDiff, PatchLevel, reverse_diff};
use crate::error::RollbackError;
use crate::lock::LockGuard;
use crate::runner::CommandRunner;
use crate::store::StateLayout;
use crate::strategy::{ApplyContext, ApplyStrategy, PerFileShardStrategy};
use crate::validate::validate_patch_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackMethod {
    Backup,
    ReverseDiff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub patch_id: String,
    pub method: RollbackMethod,
    pub restored: Vec<String>,
    pub removed: Vec<String>,
}

impl RollbackReport {
    pub fn message(&self) -> String {
        match self.method {
            RollbackMethod::Backup => format!(
                "Rolled back '{}' from backup ({} restored, {} removed)",
                self.patch_id,
                self.restored.len(),
                self.removed.len()
            ),
            RollbackMethod::ReverseDiff => {
                format!("Rolled back '{}' by reverse diff", self.patch_id)
            }
        }
    }
}

pub(crate) struct RollbackEngine<'a> {
    pub(crate) repo_root: &'a Path,
    pub(crate) config: &'a EngineConfig,
    pub(crate) layout: &'a StateLayout,
    pub(crate) runner: Option<&'a dyn CommandRunner>,
    pub(crate) program: &'a str,
}

impl RollbackEngine<'_> {
    pub(crate) async fn run(&self, patch_id: &str) -> Result<RollbackReport, RollbackError> {
        validate_patch_id(patch_id)?;
        let _guard = LockGuard::acquire(self.layout)?;

        let backups = BackupManager::new(self.repo_root, self.layout, false);
        if let Some(manifest) = BackupManifest::load(&self.layout.manifest_path(patch_id)).await? {
            let summary = backups.restore(&manifest).await?;
            if !manifest.missing.is_empty() {
                return Err(RollbackError::Incomplete {
                    patch_id: patch_id.to_string(),
                    missing: manifest.missing,
                });
            }
            info!(patch_id, restored = summary.restored.len(), "Rolled back from backup");
            return Ok(RollbackReport {
                patch_id: patch_id.to_string(),
                method: RollbackMethod::Backup,
                restored: summary.restored,
                removed: summary.removed,
            });
        }

        if is_dir(&self.layout.backup_dir(patch_id)).await {
            debug!(patch_id, "No manifest, restoring the backup tree as found");
            let summary = backups.restore_tree(patch_id).await?;
            return Ok(RollbackReport {
                patch_id: patch_id.to_string(),
                method: RollbackMethod::Backup,
                restored: summary.restored,
                removed: summary.removed,
            });
        }

        let log_path = self.layout.log_path(patch_id);
        let Some(logged) = self
            .layout
            .read_log(patch_id)
            .await
            .map_err(|source| RollbackError::Io {
                action: "read patch log",
                path: log_path,
                source,
            })?
        else {
            return Err(RollbackError::NotFound {
                patch_id: patch_id.to_string(),
            });
        };

        self.apply_reversed(patch_id, &logged).await?;
        info!(patch_id, "Rolled back by reverse diff");
        Ok(RollbackReport {
            patch_id: patch_id.to_string(),
            method: RollbackMethod::ReverseDiff,
            restored: Vec::new(),
            removed: Vec::new(),
        })
    }

    async fn apply_reversed(&self, patch_id: &str, logged: &str) -> Result<(), RollbackError> {
        let reversed = ParsedDiff::parse(&reverse_diff(logged));
        let normalized = ParsedDiff::parse(&reversed.to_p0_text());

        let ctx = ApplyContext {
            repo_root: self.repo_root,
            runner: self.runner,
            program: self.program,
            tool: &self.config.external,
        };
        let outcome = match ctx.patch_tool() {
            Some(tool) => tool.check_and_apply(&normalized.text, PatchLevel::P0).await,
            None => PerFileShardStrategy.attempt(&ctx, &normalized).await,
        };
        outcome.map_err(|err| RollbackError::ReverseApply {
            patch_id: patch_id.to_string(),
            reason: format!("{err:#}"),
        })
    }
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .is_ok_and(|metadata| metadata.is_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as std_fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn unknown_patch_id_is_not_found() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::default();
        let layout = StateLayout::new(dir.path(), &config.state_dir);
        let engine = RollbackEngine {
            repo_root: dir.path(),
            config: &config,
            layout: &layout,
            runner: None,
            program: "patch",
        };

        assert!(matches!(
            engine.run("nope").await,
            Err(RollbackError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn reverse_diff_without_tool() {
        let dir = tempdir().unwrap();
        std_fs::write(dir.path().join("a.txt"), "new\n").unwrap();
        std_fs::write(dir.path().join("added.txt"), "hello\n").unwrap();

        let config = EngineConfig::default();
        let layout = StateLayout::new(dir.path(), &config.state_dir);
        layout
            .write_log(
                "r1",
                "--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-old\n+new\n\
                 --- /dev/null\n+++ b/added.txt\n@@ -0,0 +1 @@\n+hello\n",
            )
            .await
            .unwrap();

        let engine = RollbackEngine {
            repo_root: dir.path(),
            config: &config,
            layout: &layout,
            runner: None,
            program: "patch",
        };
        let report = engine.run("r1").await.unwrap();

        assert_eq!(report.method, RollbackMethod::ReverseDiff);
        assert_eq!(
            std_fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "old\n"
        );
        assert!(!dir.path().join("added.txt").exists());
    }

    #[tokio::test]
    async fn missing_backups_make_rollback_incomplete() {
        let dir = tempdir().unwrap();
        std_fs::write(dir.path().join("a.txt"), "changed\n").unwrap();

        let config = EngineConfig::default();
        let layout = StateLayout::new(dir.path(), &config.state_dir);
        std_fs::create_dir_all(layout.backup_dir("r2")).unwrap();
        std_fs::write(layout.backup_dir("r2").join("a.txt"), "original\n").unwrap();
        let manifest = BackupManifest {
            patch_id: "r2".to_string(),
            backed_up: vec!["a.txt".to_string()],
            created: Vec::new(),
            missing: vec!["b.txt".to_string()],
        };
        std_fs::write(
            layout.manifest_path("r2"),
            serde_json::to_string(&manifest).unwrap(),
        )
        .unwrap();

        let engine = RollbackEngine {
            repo_root: dir.path(),
            config: &config,
            layout: &layout,
            runner: None,
            program: "patch",
        };
        let err = engine.run("r2").await.unwrap_err();

        assert!(matches!(err, RollbackError::Incomplete { ref missing, .. } if missing == &["b.txt"]));
        assert_eq!(
            std_fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "original\n"
        );
    }
}
