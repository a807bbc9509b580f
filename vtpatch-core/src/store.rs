//! On-disk layout of the hidden state directory at the repository root.
//!
//! ```text
//! <repo>/.vtpatch/
//!     apply.lock          advisory lock file
//!     <patch_id>/         backup tree mirroring repo-relative paths
//!     <patch_id>.json     backup manifest
//!     <patch_id>.diff     raw diff logged after a successful apply
//! ```

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::atomic::write_atomic;

/// Filename for the repository lock
pub const LOCK_FILE_NAME: &str = "apply.lock";
/// File extension for logged diffs
pub const LOG_EXTENSION: &str = "diff";
/// File extension for backup manifests
pub const MANIFEST_EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct StateLayout {
    dir: PathBuf,
}

impl StateLayout {
    pub fn new(repo_root: &Path, state_dir: &str) -> Self {
        Self {
            dir: repo_root.join(state_dir),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE_NAME)
    }

    pub fn backup_dir(&self, patch_id: &str) -> PathBuf {
        self.dir.join(patch_id)
    }

    pub fn manifest_path(&self, patch_id: &str) -> PathBuf {
        self.dir.join(format!("{patch_id}.{MANIFEST_EXTENSION}"))
    }

    pub fn log_path(&self, patch_id: &str) -> PathBuf {
        self.dir.join(format!("{patch_id}.{LOG_EXTENSION}"))
    }

    /// Persist the raw diff of a successful apply, replacing any earlier
    /// entry for the same id.
    pub async fn write_log(&self, patch_id: &str, diff_text: &str) -> io::Result<()> {
        let path = self.log_path(patch_id);
        write_atomic(&path, diff_text.as_bytes()).await?;
        debug!(patch_id, path = %path.display(), "Logged applied diff");
        Ok(())
    }

    pub async fn read_log(&self, patch_id: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.log_path(patch_id)).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}
