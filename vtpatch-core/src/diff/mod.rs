//! Unified diff model shared by the validator, the apply strategies and the
//! rollback engine.
//!
//! Parsing is deliberately lenient: hunk line counts are read but never
//! enforced, since diffs written by language models routinely miscount them.
//! A file section starts at a `--- ` line immediately followed by a `+++ `
//! line, and any preamble (`diff --git`, `index`, mode lines) belongs to the
//! section that follows it.

pub mod level;
pub mod reverse;

use once_cell::sync::Lazy;
use regex::Regex;

pub use level::{PatchLevel, detect_level};
pub use reverse::reverse_diff;

/// Sentinel path for "file did not exist" / "file no longer exists".
pub const DEV_NULL: &str = "/dev/null";

static HUNK_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@")
        .unwrap_or_else(|err| panic!("invalid hunk header regex: {err}"))
});

/// Split a line produced by `split_inclusive('\n')` into body and line ending.
pub(crate) fn split_eol(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, &line[body.len()..])
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, &line[body.len()..])
    } else {
        (line, "")
    }
}

/// Extract the path from the remainder of a `---`/`+++` header line.
///
/// Drops the tab-separated timestamp, trailing whitespace and git-style
/// quoting: `"a/foo bar.py"\t2024-01-01` becomes `a/foo bar.py`.
pub fn header_path(rest: &str) -> &str {
    let path = rest.split('\t').next().unwrap_or(rest).trim_end();
    path.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(path)
}

/// Strip one leading `a/` or `b/` component.
pub fn strip_git_prefix(path: &str) -> &str {
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}

/// Paths named by every `--- `/`+++ ` header line, in order.
///
/// A line counts as a header when it sits next to its partner (`--- `
/// beside `+++ `). The shard parser pairs them the same way, and the
/// reverse order is accepted too. A removed `-- comment` line inside a hunk
/// body has no partner and is skipped.
pub fn header_paths(diff_text: &str) -> impl Iterator<Item = &str> {
    let lines: Vec<&str> = diff_text
        .lines()
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .collect();
    let paired = |idx: usize, partner: &str| {
        let before = idx.checked_sub(1).and_then(|prev| lines.get(prev));
        let after = lines.get(idx + 1);
        [before, after]
            .into_iter()
            .flatten()
            .any(|line| line.starts_with(partner))
    };

    let mut paths = Vec::new();
    for (idx, &line) in lines.iter().enumerate() {
        if let Some(rest) = line.strip_prefix("--- ") {
            if paired(idx, "+++ ") {
                paths.push(header_path(rest));
            }
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            if paired(idx, "--- ") {
                paths.push(header_path(rest));
            }
        }
    }
    paths.into_iter()
}

/// Source and destination paths of git `rename`/`copy` extended headers.
///
/// These are always repo-relative, with no `a/`/`b/` prefix, and can
/// describe a whole section on their own when the content is unchanged.
pub fn git_move_paths(diff_text: &str) -> impl Iterator<Item = &str> {
    diff_text.lines().filter_map(|line| {
        let line = line.strip_suffix('\r').unwrap_or(line);
        ["rename from ", "rename to ", "copy from ", "copy to "]
            .into_iter()
            .find_map(|prefix| line.strip_prefix(prefix))
            .map(header_path)
    })
}

/// Old and new path of one file section, as written in the diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffHeader {
    pub old_path: String,
    pub new_path: String,
}

impl DiffHeader {
    pub fn is_addition(&self) -> bool {
        self.old_path == DEV_NULL
    }

    pub fn is_deletion(&self) -> bool {
        self.new_path == DEV_NULL
    }

    /// Repo-relative old path at `level`, `None` for `/dev/null`.
    pub fn old_target(&self, level: PatchLevel) -> Option<&str> {
        resolve(&self.old_path, level)
    }

    /// Repo-relative new path at `level`, `None` for `/dev/null`.
    pub fn new_target(&self, level: PatchLevel) -> Option<&str> {
        resolve(&self.new_path, level)
    }

    /// The file the section mutates: the new path, or the old one for deletions.
    pub fn target(&self, level: PatchLevel) -> Option<&str> {
        self.new_target(level).or_else(|| self.old_target(level))
    }
}

fn resolve(path: &str, level: PatchLevel) -> Option<&str> {
    if path == DEV_NULL {
        return None;
    }
    Some(match level {
        PatchLevel::P0 => path,
        PatchLevel::P1 => strip_git_prefix(path),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Removed(String),
    Added(String),
    /// `\ No newline at end of file`, applies to the preceding line.
    NoNewline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    fn from_header(line: &str) -> Option<Self> {
        let caps = HUNK_HEADER.captures(line)?;
        let number = |idx: usize, default: usize| {
            caps.get(idx)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(default)
        };
        Some(Self {
            old_start: number(1, 0),
            old_count: number(2, 1),
            new_start: number(3, 0),
            new_count: number(4, 1),
            lines: Vec::new(),
        })
    }
}

/// One shard: the contiguous part of a diff that belongs to a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub header: DiffHeader,
    pub hunks: Vec<Hunk>,
    /// Exact text of the shard, preamble and line endings included.
    pub text: String,
}

impl FileDiff {
    pub fn display_path(&self) -> &str {
        if self.header.is_deletion() {
            &self.header.old_path
        } else {
            &self.header.new_path
        }
    }

    /// Content of a new file built from every added line.
    pub fn added_content(&self) -> String {
        let mut content = String::new();
        let mut lines = self.hunks.iter().flat_map(|hunk| hunk.lines.iter()).peekable();
        while let Some(line) = lines.next() {
            if let HunkLine::Added(text) = line {
                content.push_str(text);
                if !matches!(lines.peek(), Some(HunkLine::NoNewline)) {
                    content.push('\n');
                }
            }
        }
        content
    }

    /// Removed and added lines as two blocks, provided the changes form a
    /// single contiguous group.
    pub fn change_blocks(&self) -> Result<(String, String), &'static str> {
        let mut removed = Vec::new();
        let mut added = Vec::new();
        let mut seen_change = false;
        let mut group_closed = false;

        for hunk in &self.hunks {
            if seen_change {
                group_closed = true;
            }
            for line in &hunk.lines {
                match line {
                    HunkLine::Removed(text) | HunkLine::Added(text) => {
                        if group_closed {
                            return Err("changes are spread over several blocks");
                        }
                        seen_change = true;
                        if matches!(line, HunkLine::Removed(_)) {
                            removed.push(text.as_str());
                        } else {
                            added.push(text.as_str());
                        }
                    }
                    HunkLine::Context(_) if seen_change => group_closed = true,
                    HunkLine::Context(_) | HunkLine::NoNewline => {}
                }
            }
        }

        if !seen_change {
            return Err("diff section has no changed lines");
        }
        Ok((removed.join("\n"), added.join("\n")))
    }

    /// Shard text with bare repo-relative header paths and no preamble, so it
    /// applies at level 0.
    pub fn to_p0_text(&self, level: PatchLevel) -> String {
        let old = self.header.old_target(level).unwrap_or(DEV_NULL);
        let new = self.header.new_target(level).unwrap_or(DEV_NULL);
        let mut out = format!("--- {old}\n+++ {new}\n");
        let mut in_body = false;
        for line in self.text.split_inclusive('\n') {
            let (body, _) = split_eol(line);
            if !in_body {
                in_body = body.starts_with("@@");
                if !in_body {
                    continue;
                }
            }
            out.push_str(line);
        }
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out
    }
}

/// A whole diff split into shards, with its detected patch level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDiff {
    pub text: String,
    pub level: PatchLevel,
    pub files: Vec<FileDiff>,
}

impl ParsedDiff {
    pub fn parse(diff_text: &str) -> Self {
        Self {
            text: diff_text.to_string(),
            level: detect_level(diff_text),
            files: parse_files(diff_text),
        }
    }

    /// Every repo-relative path the diff touches, deduplicated, in order.
    /// Includes both ends of git renames and copies, which may carry no
    /// `---`/`+++` section at all.
    pub fn touched_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = Vec::new();
        let sections = self.files.iter().flat_map(|file| {
            [
                file.header.old_target(self.level),
                file.header.new_target(self.level),
            ]
            .into_iter()
            .flatten()
        });
        for path in sections.chain(git_move_paths(&self.text)) {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths
    }

    pub fn to_p0_text(&self) -> String {
        self.files
            .iter()
            .map(|file| file.to_p0_text(self.level))
            .collect()
    }
}

struct ShardBuilder {
    start: usize,
    header: DiffHeader,
    hunks: Vec<Hunk>,
}

fn parse_files(diff_text: &str) -> Vec<FileDiff> {
    let lines: Vec<&str> = diff_text.split_inclusive('\n').collect();
    let mut files = Vec::new();
    let mut current: Option<ShardBuilder> = None;
    // First line of text not yet owned by a finished shard.
    let mut next_start = 0usize;
    // Set once a preamble line (e.g. `diff --git`) follows the current shard.
    let mut preamble_at: Option<usize> = None;

    let finish = |builder: ShardBuilder, end: usize, files: &mut Vec<FileDiff>| {
        files.push(FileDiff {
            header: builder.header,
            hunks: builder.hunks,
            text: lines[builder.start..end].concat(),
        });
    };

    let mut idx = 0;
    while idx < lines.len() {
        let (body, _) = split_eol(lines[idx]);

        if let Some(old) = body.strip_prefix("--- ") {
            let next = lines.get(idx + 1).map(|line| split_eol(line).0);
            if let Some(new) = next.and_then(|line| line.strip_prefix("+++ ")) {
                let start = match current.take() {
                    Some(builder) => {
                        let end = preamble_at.take().unwrap_or(idx);
                        finish(builder, end, &mut files);
                        end
                    }
                    None => next_start,
                };
                current = Some(ShardBuilder {
                    start,
                    header: DiffHeader {
                        old_path: header_path(old).to_string(),
                        new_path: header_path(new).to_string(),
                    },
                    hunks: Vec::new(),
                });
                next_start = start;
                idx += 2;
                continue;
            }
        }

        if let Some(builder) = current.as_mut() {
            if body.starts_with("diff ") {
                preamble_at.get_or_insert(idx);
            } else if body.starts_with("@@") {
                if let Some(hunk) = Hunk::from_header(body) {
                    builder.hunks.push(hunk);
                }
                preamble_at = None;
            } else if preamble_at.is_none() {
                if let Some(hunk) = builder.hunks.last_mut() {
                    if let Some(line) = parse_hunk_line(body) {
                        hunk.lines.push(line);
                    }
                }
            }
        }
        idx += 1;
    }

    if let Some(builder) = current {
        finish(builder, lines.len(), &mut files);
    }
    files
}

fn parse_hunk_line(body: &str) -> Option<HunkLine> {
    match body.chars().next() {
        None => Some(HunkLine::Context(String::new())),
        Some(' ') => Some(HunkLine::Context(body[1..].to_string())),
        Some('-') => Some(HunkLine::Removed(body[1..].to_string())),
        Some('+') => Some(HunkLine::Added(body[1..].to_string())),
        Some('\\') => Some(HunkLine::NoNewline),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_FILES: &str = "\
diff --git a/src/lib.rs b/src/lib.rs
index 1111111..2222222 100644
--- a/src/lib.rs\t2024-01-01 00:00:00
+++ b/src/lib.rs\t2024-01-02 00:00:00
@@ -1,3 +1,3 @@
 fn main() {
-    old();
+    new();
 }
diff --git a/notes.txt b/notes.txt
new file mode 100644
--- /dev/null
+++ b/notes.txt
@@ -0,0 +1,2 @@
+first
+second
";

    #[test]
    fn splits_diff_into_non_overlapping_shards() {
        let parsed = ParsedDiff::parse(TWO_FILES);
        assert_eq!(parsed.files.len(), 2);
        assert_eq!(parsed.level, PatchLevel::P1);

        let joined: String = parsed.files.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(joined, TWO_FILES);
        assert!(parsed.files[1].text.starts_with("diff --git a/notes.txt"));
    }

    #[test]
    fn strips_timestamps_from_headers() {
        let parsed = ParsedDiff::parse(TWO_FILES);
        let header = &parsed.files[0].header;
        assert_eq!(header.old_path, "a/src/lib.rs");
        assert_eq!(header.new_target(PatchLevel::P1), Some("src/lib.rs"));
    }

    #[test]
    fn parses_hunk_ranges_and_lines() {
        let parsed = ParsedDiff::parse(TWO_FILES);
        let hunk = &parsed.files[0].hunks[0];
        assert_eq!((hunk.old_start, hunk.old_count), (1, 3));
        assert_eq!(hunk.lines[1], HunkLine::Removed("    old();".to_string()));
        assert_eq!(hunk.lines[2], HunkLine::Added("    new();".to_string()));
    }

    #[test]
    fn added_content_respects_missing_newline_marker() {
        let diff = "--- /dev/null\n+++ b/x.txt\n@@ -0,0 +1,2 @@\n+one\n+two\n\\ No newline at end of file\n";
        let parsed = ParsedDiff::parse(diff);
        assert!(parsed.files[0].header.is_addition());
        assert_eq!(parsed.files[0].added_content(), "one\ntwo");
    }

    #[test]
    fn change_blocks_rejects_scattered_changes() {
        let diff = "--- a/x\n+++ b/x\n@@ -1,3 +1,3 @@\n-a\n+b\n c\n-d\n+e\n";
        let parsed = ParsedDiff::parse(diff);
        assert!(parsed.files[0].change_blocks().is_err());

        let contiguous = "--- a/x\n+++ b/x\n@@ -1,3 +1,3 @@\n c\n-a\n-b\n+z\n c\n";
        let parsed = ParsedDiff::parse(contiguous);
        assert_eq!(
            parsed.files[0].change_blocks(),
            Ok(("a\nb".to_string(), "z".to_string()))
        );
    }

    #[test]
    fn removed_line_looking_like_header_stays_in_hunk() {
        let diff = "--- a/x\n+++ b/x\n@@ -1,2 +1,1 @@\n--- not a header\n keep\n";
        let parsed = ParsedDiff::parse(diff);
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(
            parsed.files[0].hunks[0].lines[0],
            HunkLine::Removed("-- not a header".to_string())
        );
    }

    #[test]
    fn p0_text_drops_prefixes_and_preamble() {
        let parsed = ParsedDiff::parse(TWO_FILES);
        let text = parsed.files[0].to_p0_text(parsed.level);
        assert!(text.starts_with("--- src/lib.rs\n+++ src/lib.rs\n@@ -1,3 +1,3 @@\n"));
        assert!(!text.contains("diff --git"));
    }

    #[test]
    fn header_paths_skip_unpaired_body_lines() {
        let diff = "--- a/q.sql\n+++ b/q.sql\n@@ -1,2 +1 @@\n-- /var/lib/data is the mount\n select 1;\n";
        assert_eq!(header_paths(diff).collect::<Vec<_>>(), vec!["a/q.sql", "b/q.sql"]);
    }

    #[test]
    fn touched_paths_include_pure_renames() {
        let diff = "\
diff --git a/a.py b/a.py
--- a/a.py
+++ b/a.py
@@ -1 +1 @@
-x
+y
diff --git a/x.py b/y.py
similarity index 100%
rename from x.py
rename to y.py
";
        let parsed = ParsedDiff::parse(diff);
        assert_eq!(parsed.touched_paths(), vec!["a.py", "x.py", "y.py"]);
    }

    #[test]
    fn touched_paths_excludes_dev_null() {
        let parsed = ParsedDiff::parse(TWO_FILES);
        assert_eq!(parsed.touched_paths(), vec!["src/lib.rs", "notes.txt"]);
    }
}
