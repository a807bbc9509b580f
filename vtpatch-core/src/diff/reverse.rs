//! Mechanical inversion of a unified diff, used when a rollback has no
//! backup to restore from.

use once_cell::sync::Lazy;
use regex::Regex;

use super::split_eol;

static HUNK_RANGES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^@@ -(\S+) \+(\S+) @@(.*)$")
        .unwrap_or_else(|err| panic!("invalid hunk range regex: {err}"))
});

/// Invert `diff_text` so that applying it undoes the original.
///
/// File headers swap roles, `-`/`+` prefixes swap, and so do git's
/// `new file mode`/`deleted file mode` and `rename from`/`rename to` lines.
/// Hunk ranges are swapped to keep the line counts consistent; context lines
/// are left as they are. Within each run of changed lines the removed lines
/// are emitted before the added ones.
pub fn reverse_diff(diff_text: &str) -> String {
    let lines: Vec<&str> = diff_text.split_inclusive('\n').collect();
    let mut out = String::with_capacity(diff_text.len());
    let mut run = ChangeRun::default();
    let mut idx = 0;

    while idx < lines.len() {
        let (body, eol) = split_eol(lines[idx]);

        if let Some(old) = body.strip_prefix("--- ") {
            let next = lines.get(idx + 1).map(|line| split_eol(line));
            if let Some((new_line, new_eol)) = next {
                if let Some(new) = new_line.strip_prefix("+++ ") {
                    run.flush_into(&mut out);
                    out.push_str("--- ");
                    out.push_str(new);
                    out.push_str(eol);
                    out.push_str("+++ ");
                    out.push_str(old);
                    out.push_str(new_eol);
                    idx += 2;
                    continue;
                }
            }
        }

        if !run.push(body, eol) {
            run.flush_into(&mut out);
            out.push_str(&invert_line(body));
            out.push_str(eol);
        }
        idx += 1;
    }

    run.flush_into(&mut out);
    out
}

/// Consecutive changed lines of one hunk, already inverted.
#[derive(Default)]
struct ChangeRun {
    removed: String,
    added: String,
    /// Which buffer received the last line, for `\ No newline` markers.
    last_added: Option<bool>,
}

impl ChangeRun {
    /// Buffer `body` if it belongs to a change run.
    fn push(&mut self, body: &str, eol: &str) -> bool {
        let (buffer, line, added) = if let Some(rest) = body.strip_prefix('-') {
            (&mut self.added, format!("+{rest}"), true)
        } else if let Some(rest) = body.strip_prefix('+') {
            (&mut self.removed, format!("-{rest}"), false)
        } else if body.starts_with('\\') {
            match self.last_added {
                Some(true) => (&mut self.added, body.to_string(), true),
                Some(false) => (&mut self.removed, body.to_string(), false),
                None => return false,
            }
        } else {
            return false;
        };
        buffer.push_str(&line);
        buffer.push_str(eol);
        self.last_added = Some(added);
        true
    }

    fn flush_into(&mut self, out: &mut String) {
        out.push_str(&self.removed);
        out.push_str(&self.added);
        self.removed.clear();
        self.added.clear();
        self.last_added = None;
    }
}

fn invert_line(body: &str) -> String {
    if body.starts_with("@@") {
        return HUNK_RANGES
            .captures(body)
            .map(|caps| format!("@@ -{} +{} @@{}", &caps[2], &caps[1], &caps[3]))
            .unwrap_or_else(|| body.to_string());
    }

    let swaps = [
        ("new file mode ", "deleted file mode "),
        ("deleted file mode ", "new file mode "),
        ("rename from ", "rename to "),
        ("rename to ", "rename from "),
        ("copy from ", "copy to "),
        ("copy to ", "copy from "),
    ];
    for (from, to) in swaps {
        if let Some(rest) = body.strip_prefix(from) {
            return format!("{to}{rest}");
        }
    }
    body.to_string()
}
