//! Security validation of diff paths and patch ids.
//!
//! Runs before the repository lock is taken and never touches the
//! filesystem beyond canonicalising existing ancestors.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::diff::{DEV_NULL, git_move_paths, header_paths, strip_git_prefix};
use crate::error::SecurityError;
use crate::store::{LOCK_FILE_NAME, LOG_EXTENSION, MANIFEST_EXTENSION};

const MAX_PATCH_ID_LEN: usize = 128;

/// Validates every path a diff names against one repository root.
#[derive(Debug, Clone)]
pub struct DiffValidator {
    root: PathBuf,
    protected_dirs: Vec<String>,
    protected_files: Vec<String>,
}

impl DiffValidator {
    pub fn new(repo_root: &Path) -> Result<Self, SecurityError> {
        let root = repo_root
            .canonicalize()
            .map_err(|err| SecurityError::RepoRoot {
                path: repo_root.to_path_buf(),
                reason: err.to_string(),
            })?;
        Ok(Self {
            root,
            protected_dirs: Vec::new(),
            protected_files: Vec::new(),
        })
    }

    /// Refuse any path whose first component is `name`.
    pub fn protect(mut self, name: impl Into<String>) -> Self {
        self.protected_dirs.push(name.into());
        self
    }

    /// Refuse exactly the repo-relative file `path`.
    pub fn protect_file(mut self, path: impl Into<String>) -> Self {
        self.protected_files.push(path.into());
        self
    }

    /// Check every header path of `diff_text`; the first violation wins.
    ///
    /// Covers paired `---`/`+++` lines wherever they appear, plus the git
    /// `diff --git` and `rename`/`copy` extended headers.
    pub fn validate(&self, diff_text: &str) -> Result<(), SecurityError> {
        let git_headers = diff_text.lines().flat_map(git_header_candidates);
        for raw in header_paths(diff_text).chain(git_headers) {
            if raw == DEV_NULL {
                continue;
            }
            if let Err(err) = self.check_path(raw) {
                warn!(path = raw, error = %err, "Rejected diff path");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Check a single header path, with or without an `a/`/`b/` prefix.
    pub fn check_path(&self, raw: &str) -> Result<(), SecurityError> {
        if raw.is_empty() {
            return Err(SecurityError::EmptyPath);
        }

        if raw.chars().any(char::is_control) {
            return Err(SecurityError::ControlCharacters {
                path: raw.to_string(),
            });
        }

        if is_absolute(raw) {
            return Err(SecurityError::AbsolutePath {
                path: raw.to_string(),
            });
        }

        if raw.split(['/', '\\']).any(|segment| segment == "..") {
            return Err(SecurityError::PathTraversal {
                path: raw.to_string(),
            });
        }

        let stripped = strip_git_prefix(raw);
        for candidate in [raw, stripped] {
            let segments: Vec<&str> = candidate
                .split(['/', '\\'])
                .filter(|s| !s.is_empty() && *s != ".")
                .collect();
            let first_protected = segments
                .first()
                .is_some_and(|first| self.protected_dirs.iter().any(|p| p == first));
            let normalized = segments.join("/");
            if first_protected || self.protected_files.iter().any(|p| *p == normalized) {
                return Err(SecurityError::ProtectedPath {
                    path: raw.to_string(),
                });
            }

            if !resolve_within(&self.root, Path::new(candidate)).starts_with(&self.root) {
                return Err(SecurityError::OutsideRepository {
                    path: raw.to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Validate the diff paths of `diff_text` against `repo_root`.
pub fn validate_diff(diff_text: &str, repo_root: &Path) -> Result<(), SecurityError> {
    DiffValidator::new(repo_root)?.validate(diff_text)
}

/// Patch ids name directories and files in the state directory, so they must
/// be a single safe path segment.
pub fn validate_patch_id(id: &str) -> Result<(), SecurityError> {
    let reject = |reason| {
        Err(SecurityError::InvalidPatchId {
            id: id.to_string(),
            reason,
        })
    };

    if id.is_empty() {
        return reject("patch id is empty");
    }
    if id.len() > MAX_PATCH_ID_LEN {
        return reject("patch id is longer than 128 bytes");
    }
    if id.starts_with('.') {
        return reject("patch id cannot start with '.'");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return reject("patch id may only contain ASCII letters, digits, '-', '_' and '.'");
    }
    // `<id>/`, `<id>.json` and `<id>.diff` must never name another id's
    // entries or the lock file.
    if id == LOCK_FILE_NAME {
        return reject("patch id names the lock file");
    }
    if [MANIFEST_EXTENSION, LOG_EXTENSION]
        .iter()
        .any(|ext| id.rsplit_once('.').is_some_and(|(_, suffix)| suffix == *ext))
    {
        return reject("patch id cannot end in '.json' or '.diff'");
    }
    Ok(())
}

fn git_header_candidates(line: &str) -> Vec<&str> {
    let line = line.strip_suffix('\r').unwrap_or(line);

    if let Some(rest) = line.strip_prefix("diff --git ") {
        // `a/old b/new`; split on the last " b/" so spaces in names survive.
        return match rest.rfind(" b/") {
            Some(split) => vec![rest[..split].trim(), rest[split + 1..].trim()],
            None => rest.split_whitespace().collect(),
        };
    }

    git_move_paths(line).collect()
}

fn is_absolute(raw: &str) -> bool {
    if raw.starts_with('/') || raw.starts_with('\\') || Path::new(raw).is_absolute() {
        return true;
    }
    let bytes = raw.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Join `relative` onto `root` and canonicalise the deepest existing
/// ancestor, so symlinks pointing out of the repository are caught even
/// when the final file does not exist yet.
fn resolve_within(root: &Path, relative: &Path) -> PathBuf {
    let joined = root.join(relative);
    let mut existing = joined.as_path();
    let mut tail: Vec<OsString> = Vec::new();

    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut resolved = canonical;
            for component in tail.iter().rev() {
                resolved.push(component);
            }
            return resolved;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return joined,
        }
    }
}
