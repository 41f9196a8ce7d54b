//! Path normalization and filtering
//!
//! Every path observed in a trace goes through [`normalize`] so that one
//! physical file always maps to one canonical path, whichever directory was
//! current when it was touched. [`PathFilter`] then decides which canonical
//! paths are worth fingerprinting.

use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::trace;

/// Pseudo-filesystems whose "files" have no stable content.
pub const DEFAULT_IGNORED: &[&str] = &["/proc", "/sys", "/dev"];

/// Resolve `raw` against the directory current at access time.
///
/// Symlinks are resolved when the path still exists. Paths that are gone by
/// the time the trace is processed (renamed temporaries, deleted scratch
/// files) get their parent directory resolved instead, and fall back to a
/// purely lexical cleanup when even that is gone.
pub fn normalize(raw: &Path, cwd: &Path) -> PathBuf {
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        cwd.join(raw)
    };

    if let Ok(canonical) = fs::canonicalize(&joined) {
        return canonical;
    }

    let lexical = lexical_clean(&joined);
    match (lexical.parent(), lexical.file_name()) {
        (Some(parent), Some(name)) => match fs::canonicalize(parent) {
            Ok(parent) => parent.join(name),
            Err(_) => lexical,
        },
        _ => lexical,
    }
}

/// Collapse `.` and `..` without touching the filesystem.
pub fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` at the root stays at the root
                let stacked = matches!(out.components().next_back(), Some(Component::ParentDir));
                if stacked || (!out.pop() && !path.is_absolute()) {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Whether `path` lies under any of the ignored prefixes.
///
/// Prefixes match whole components: `/scratch` ignores `/scratch/a` but not
/// `/scratchpad/a`.
pub fn keep(path: &Path, ignore_list: &[PathBuf]) -> bool {
    !ignore_list.iter().any(|prefix| path.starts_with(prefix))
}

/// Ignore list plus optional watch list, both stored as canonical prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathFilter {
    ignore: Vec<PathBuf>,
    watch: Vec<PathBuf>,
}

impl PathFilter {
    /// Build a filter, canonicalizing every prefix against `cwd`.
    pub fn new<I, W>(ignore: I, watch: W, cwd: &Path) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
        W: IntoIterator<Item = PathBuf>,
    {
        let mut ignore: Vec<PathBuf> = ignore
            .into_iter()
            .map(|p| normalize(&p, cwd))
            .collect();
        ignore.sort();
        ignore.dedup();

        let mut watch: Vec<PathBuf> = watch.into_iter().map(|p| normalize(&p, cwd)).collect();
        watch.sort();
        watch.dedup();

        Self { ignore, watch }
    }

    /// Decide whether a canonical path should be fingerprinted.
    pub fn keep(&self, path: &Path) -> bool {
        if !keep(path, &self.ignore) {
            trace!("Ignoring {}", path.display());
            return false;
        }
        if self.watch.is_empty() {
            return true;
        }
        let watched = self.watch.iter().any(|prefix| path.starts_with(prefix));
        if !watched {
            trace!("Outside watched directories: {}", path.display());
        }
        watched
    }
}
