use std::fmt;

use serde::Serialize;

use super::{DEV_NULL, header_paths};

/// How many leading path components the external tool strips (`-p0`/`-p1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PatchLevel {
    P0,
    P1,
}

impl PatchLevel {
    pub fn opposite(self) -> Self {
        match self {
            Self::P0 => Self::P1,
            Self::P1 => Self::P0,
        }
    }

    /// Command-line flag understood by `patch`.
    pub fn flag(self) -> &'static str {
        match self {
            Self::P0 => "-p0",
            Self::P1 => "-p1",
        }
    }
}

impl fmt::Display for PatchLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flag())
    }
}

/// Infer the patch level from the first informative header path.
///
/// Git-style `a/`/`b/` prefixes mean level 1, bare paths level 0. A diff
/// without any usable header falls back to the git convention.
pub fn detect_level(diff_text: &str) -> PatchLevel {
    header_paths(diff_text)
        .find(|path| *path != DEV_NULL)
        .map(|path| {
            if path.starts_with("a/") || path.starts_with("b/") {
                PatchLevel::P1
            } else {
                PatchLevel::P0
            }
        })
        .unwrap_or(PatchLevel::P1)
}
