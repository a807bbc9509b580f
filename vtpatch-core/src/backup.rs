//! Backup and restore of the files a patch touches.

use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::atomic::write_atomic;
use crate::diff::ParsedDiff;
use crate::error::{PatchError, RollbackError};
use crate::store::StateLayout;

/// What a snapshot recorded for one patch id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub patch_id: String,
    /// Existing files copied into the backup tree.
    pub backed_up: Vec<String>,
    /// Paths the diff names that did not exist before the apply.
    pub created: Vec<String>,
    /// Existing files whose backup failed.
    #[serde(default)]
    pub missing: Vec<String>,
}

impl BackupManifest {
    pub async fn load(path: &Path) -> Result<Option<Self>, RollbackError> {
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(RollbackError::Io {
                    action: "read",
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| RollbackError::Manifest {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })
    }
}

/// Files put back by a restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: Vec<String>,
    pub removed: Vec<String>,
}

pub struct BackupManager<'a> {
    repo_root: &'a Path,
    layout: &'a StateLayout,
    fail_on_error: bool,
}

impl<'a> BackupManager<'a> {
    pub fn new(repo_root: &'a Path, layout: &'a StateLayout, fail_on_error: bool) -> Self {
        Self {
            repo_root,
            layout,
            fail_on_error,
        }
    }

    /// Snapshot every existing file the diff references into
    /// `<state>/<patch_id>/`, replacing any earlier snapshot for the id.
    ///
    /// Must be called with the repository lock held and before any strategy
    /// runs.
    pub async fn snapshot(
        &self,
        diff: &ParsedDiff,
        patch_id: &str,
    ) -> Result<BackupManifest, PatchError> {
        let backup_dir = self.layout.backup_dir(patch_id);
        self.clear_previous(&backup_dir, patch_id).await?;

        let mut manifest = BackupManifest {
            patch_id: patch_id.to_string(),
            ..Default::default()
        };

        for relative in diff.touched_paths() {
            let source = self.repo_root.join(relative);
            match fs::metadata(&source).await {
                Ok(metadata) if metadata.is_file() => {}
                Ok(_) => {
                    debug!(path = relative, "Skipping backup of non-file path");
                    continue;
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    manifest.created.push(relative.to_string());
                    continue;
                }
                Err(err) => {
                    self.record_failure(&mut manifest, relative, &err.to_string())?;
                    continue;
                }
            }

            match copy_file(&source, &backup_dir.join(relative)).await {
                Ok(()) => manifest.backed_up.push(relative.to_string()),
                Err(err) => self.record_failure(&mut manifest, relative, &err.to_string())?,
            }
        }

        let manifest_path = self.layout.manifest_path(patch_id);
        let encoded = serde_json::to_vec_pretty(&manifest).map_err(|err| PatchError::Backup {
            path: manifest_path.display().to_string(),
            reason: err.to_string(),
        })?;
        write_atomic(&manifest_path, &encoded)
            .await
            .map_err(|source| PatchError::Io {
                action: "write backup manifest",
                path: manifest_path,
                source,
            })?;

        info!(
            patch_id,
            backed_up = manifest.backed_up.len(),
            created = manifest.created.len(),
            missing = manifest.missing.len(),
            "Snapshot complete"
        );
        Ok(manifest)
    }

    /// Put every backed-up file back and remove files the patch created.
    pub async fn restore(&self, manifest: &BackupManifest) -> Result<RestoreSummary, RollbackError> {
        let backup_dir = self.layout.backup_dir(&manifest.patch_id);
        let mut summary = RestoreSummary::default();

        for relative in &manifest.backed_up {
            let target = self.repo_root.join(relative);
            copy_file(&backup_dir.join(relative), &target)
                .await
                .map_err(|source| RollbackError::Io {
                    action: "restore",
                    path: target,
                    source,
                })?;
            summary.restored.push(relative.clone());
        }

        for relative in &manifest.created {
            let target = self.repo_root.join(relative);
            match fs::remove_file(&target).await {
                Ok(()) => summary.removed.push(relative.clone()),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(RollbackError::Io {
                        action: "remove created file",
                        path: target,
                        source,
                    });
                }
            }
        }

        Ok(summary)
    }

    /// Restore every file found under the backup tree when no manifest
    /// survived.
    pub async fn restore_tree(&self, patch_id: &str) -> Result<RestoreSummary, RollbackError> {
        let backup_dir = self.layout.backup_dir(patch_id);
        let mut summary = RestoreSummary::default();

        for entry in WalkDir::new(&backup_dir).sort_by_file_name() {
            let entry = entry.map_err(|err| RollbackError::Io {
                action: "walk",
                path: backup_dir.clone(),
                source: err.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&backup_dir) else {
                continue;
            };
            let target = self.repo_root.join(relative);
            copy_file(entry.path(), &target)
                .await
                .map_err(|source| RollbackError::Io {
                    action: "restore",
                    path: target,
                    source,
                })?;
            summary.restored.push(relative.to_string_lossy().replace('\\', "/"));
        }

        Ok(summary)
    }

    async fn clear_previous(&self, backup_dir: &Path, patch_id: &str) -> Result<(), PatchError> {
        match fs::remove_dir_all(backup_dir).await {
            Ok(()) => debug!(patch_id, "Replaced earlier backup for reused patch id"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(PatchError::Io {
                    action: "clear previous backup",
                    path: backup_dir.to_path_buf(),
                    source,
                });
            }
        }
        let manifest_path = self.layout.manifest_path(patch_id);
        match fs::remove_file(&manifest_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PatchError::Io {
                action: "clear previous manifest",
                path: manifest_path,
                source,
            }),
        }
    }

    fn record_failure(
        &self,
        manifest: &mut BackupManifest,
        relative: &str,
        reason: &str,
    ) -> Result<(), PatchError> {
        warn!(path = relative, reason, "Backup failed");
        if self.fail_on_error {
            return Err(PatchError::Backup {
                path: relative.to_string(),
                reason: reason.to_string(),
            });
        }
        manifest.missing.push(relative.to_string());
        Ok(())
    }
}

async fn copy_file(from: &Path, to: &Path) -> std::io::Result<()> {
    let content = fs::read(from).await?;
    write_atomic(to, &content).await
}
