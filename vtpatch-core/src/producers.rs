//! Helpers that produce diffs for the engine to apply, plus a plain code
//! search over the repository.
//!
//! Every diff produced here uses `a/`/`b/` headers and is accepted by
//! `PatchEngine::apply` as is.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use ignore::WalkBuilder;
use regex::Regex;
use serde::Serialize;
use similar::TextDiff;
use tracing::debug;

use crate::diff::DEV_NULL;
use crate::validate::DiffValidator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeMatch {
    /// Repo-relative path with `/` separators.
    pub path: String,
    /// 1-based.
    pub line_number: usize,
    pub line: String,
}

/// Regex search over text files, honouring ignore files and skipping hidden
/// entries. Stops after `limit` matches.
pub fn search_code(repo_root: &Path, pattern: &str, limit: usize) -> Result<Vec<CodeMatch>> {
    let regex = Regex::new(pattern).with_context(|| format!("invalid search pattern {pattern:?}"))?;
    let mut matches = Vec::new();
    if limit == 0 {
        return Ok(matches);
    }

    for (relative, content) in text_files(repo_root) {
        for (idx, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                matches.push(CodeMatch {
                    path: relative.clone(),
                    line_number: idx + 1,
                    line: line.to_string(),
                });
                if matches.len() >= limit {
                    return Ok(matches);
                }
            }
        }
    }
    Ok(matches)
}

/// Diff that deletes `from` and recreates its content at `to`.
pub fn module_move_diff(repo_root: &Path, from: &str, to: &str) -> Result<String> {
    let validator = DiffValidator::new(repo_root)?;
    validator.check_path(from)?;
    validator.check_path(to)?;

    let source = repo_root.join(from);
    let content =
        fs::read_to_string(&source).with_context(|| format!("failed to read {from}"))?;
    if repo_root.join(to).exists() {
        bail!("destination {to} already exists");
    }

    let mut diff = file_diff(&content, "", &format!("a/{from}"), DEV_NULL);
    diff.push_str(&file_diff("", &content, DEV_NULL, &format!("b/{to}")));
    Ok(diff)
}

/// Diff replacing every occurrence of `old` with `new` across the
/// repository's text files. Empty when nothing matches.
pub fn import_update_diff(repo_root: &Path, old: &str, new: &str) -> Result<String> {
    if old.is_empty() {
        bail!("import to replace cannot be empty");
    }

    let mut diff = String::new();
    for (relative, content) in text_files(repo_root) {
        if !content.contains(old) {
            continue;
        }
        let updated = content.replace(old, new);
        diff.push_str(&file_diff(
            &content,
            &updated,
            &format!("a/{relative}"),
            &format!("b/{relative}"),
        ));
    }
    Ok(diff)
}

fn file_diff(old: &str, new: &str, old_header: &str, new_header: &str) -> String {
    if old.is_empty() && new.is_empty() {
        // No hunks, so `similar` would omit the headers as well.
        return format!("--- {old_header}\n+++ {new_header}\n");
    }
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(old_header, new_header)
        .to_string()
}

/// UTF-8 files under `repo_root` as `(relative path, content)`, in a stable
/// order.
fn text_files(repo_root: &Path) -> impl Iterator<Item = (String, String)> + '_ {
    WalkBuilder::new(repo_root)
        .hidden(true)
        .git_ignore(true)
        .require_git(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
        .filter_map(move |entry| {
            let path: PathBuf = entry.into_path();
            let relative = path
                .strip_prefix(repo_root)
                .ok()?
                .to_string_lossy()
                .replace('\\', "/");
            match fs::read_to_string(&path) {
                Ok(content) => Some((relative, content)),
                Err(err) => {
                    debug!(path = %relative, error = %err, "Skipping unreadable file");
                    None
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ParsedDiff;
    use tempfile::tempdir;

    fn repo() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("pkg")).unwrap();
        fs::create_dir_all(dir.path().join(".vtpatch")).unwrap();
        fs::write(dir.path().join("pkg/a.py"), "import util\nx = util.go()\n").unwrap();
        fs::write(dir.path().join("pkg/b.py"), "import util\n").unwrap();
        fs::write(dir.path().join(".vtpatch/log.diff"), "import util\n").unwrap();
        dir
    }

    #[test]
    fn search_skips_hidden_state_and_respects_limit() {
        let dir = repo();
        let all = search_code(dir.path(), r"^import util", 10).unwrap();
        assert_eq!(
            all.iter().map(|m| m.path.as_str()).collect::<Vec<_>>(),
            vec!["pkg/a.py", "pkg/b.py"]
        );
        assert_eq!(all[0].line_number, 1);

        let one = search_code(dir.path(), "util", 1).unwrap();
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        let dir = repo();
        assert!(search_code(dir.path(), "(", 5).is_err());
    }

    #[test]
    fn module_move_produces_delete_and_add() {
        let dir = repo();
        let diff = module_move_diff(dir.path(), "pkg/b.py", "lib/b.py").unwrap();
        let parsed = ParsedDiff::parse(&diff);

        assert_eq!(parsed.files.len(), 2);
        assert!(parsed.files[0].header.is_deletion());
        assert!(parsed.files[1].header.is_addition());
        assert_eq!(parsed.files[1].added_content(), "import util\n");
        assert_eq!(parsed.touched_paths(), vec!["pkg/b.py", "lib/b.py"]);
    }

    #[test]
    fn module_move_refuses_existing_destination() {
        let dir = repo();
        assert!(module_move_diff(dir.path(), "pkg/a.py", "pkg/b.py").is_err());
    }

    #[test]
    fn module_move_refuses_paths_outside_the_repository() {
        let dir = repo();
        let outside = tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), "token\n").unwrap();
        let escape = format!("../{}/secret.txt", outside.path().file_name().unwrap().to_string_lossy());

        assert!(module_move_diff(dir.path(), &escape, "pkg/secret.txt").is_err());
        assert!(module_move_diff(dir.path(), "pkg/a.py", "/tmp/a.py").is_err());
        assert!(module_move_diff(dir.path(), "/etc/hostname", "pkg/h.txt").is_err());
    }

    #[test]
    fn import_update_touches_only_matching_files() {
        let dir = repo();
        fs::write(dir.path().join("pkg/c.py"), "print(1)\n").unwrap();

        let diff = import_update_diff(dir.path(), "import util", "import helpers").unwrap();
        let parsed = ParsedDiff::parse(&diff);
        assert_eq!(parsed.touched_paths(), vec!["pkg/a.py", "pkg/b.py"]);
        assert!(diff.contains("-import util\n+import helpers\n"));

        assert_eq!(import_update_diff(dir.path(), "nothing", "x").unwrap(), "");
    }
}
