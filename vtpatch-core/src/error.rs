//! Error types for apply and rollback operations

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::strategy::StrategyKind;

/// Path or identifier rejected before anything is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    #[error("empty path in diff header")]
    EmptyPath,
    #[error("path contains control characters: {path:?}")]
    ControlCharacters { path: String },
    #[error("absolute path not allowed: {path}")]
    AbsolutePath { path: String },
    #[error("path traversal not allowed: {path}")]
    PathTraversal { path: String },
    #[error("path resolves outside the repository: {path}")]
    OutsideRepository { path: String },
    #[error("path points into the patch state directory: {path}")]
    ProtectedPath { path: String },
    #[error("invalid patch id {id:?}: {reason}")]
    InvalidPatchId { id: String, reason: &'static str },
    #[error("repository root {} is not accessible: {reason}", .path.display())]
    RepoRoot { path: PathBuf, reason: String },
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Busy: another patch operation holds {}", .path.display())]
    Busy { path: PathBuf },
    #[error("failed to {action} lock file {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Why one apply strategy gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierFailure {
    pub strategy: StrategyKind,
    pub reason: String,
}

impl fmt::Display for TierFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.strategy, self.reason)
    }
}

fn join_failures(failures: &[TierFailure]) -> String {
    if failures.is_empty() {
        return "no apply strategy is registered".to_string();
    }
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Security: {0}")]
    Security(#[from] SecurityError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("diff contains no file sections")]
    EmptyDiff,
    #[error("backup failed for '{path}': {reason}")]
    Backup { path: String, reason: String },
    #[error("Failed to apply patch: {}", join_failures(.0))]
    AllStrategiesFailed(Vec<TierFailure>),
    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("Security: {0}")]
    Security(#[from] SecurityError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("no backup or patch log found for '{patch_id}'")]
    NotFound { patch_id: String },
    #[error("rollback of '{patch_id}' is incomplete, no backup for: {}", .missing.join(", "))]
    Incomplete {
        patch_id: String,
        missing: Vec<String>,
    },
    #[error("corrupt backup manifest {}: {reason}", .path.display())]
    Manifest { path: PathBuf, reason: String },
    #[error("reverse diff for '{patch_id}' could not be applied: {reason}")]
    ReverseApply { patch_id: String, reason: String },
    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("repository root {} is not accessible: {source}", .path.display())]
    RepoRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
