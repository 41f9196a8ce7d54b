//! Per-path access tracking with rename merging
//!
//! Writers that publish atomically (write `out.tmp`, then rename it over
//! `out`) would otherwise leave a fingerprint keyed on a path that never
//! exists again. Each path therefore carries an explicit state, and a rename
//! moves the source's state onto the destination:
//!
//! ```text
//! (untracked) -> Opened -> WrittenTo -> RenamedTo(final)
//!                  \__________________/
//!                   carried to `final`
//! ```
//!
//! Paths in `RenamedTo` or `Removed` never reach the fingerprint stage.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::trace;

/// How a command used a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRole {
    Read,
    Write,
}

impl fmt::Display for FileRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Lifecycle of one path during a monitored run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathState {
    /// Opened read-only, stat'd or executed
    Read,
    /// Opened with write access, contents not replaced
    Opened,
    /// Created or truncated, or received another path's contents by rename
    WrittenTo,
    /// Moved away; its state now lives on the target path
    RenamedTo(PathBuf),
    /// Unlinked by the command
    Removed,
}

impl PathState {
    /// Role for paths that still exist at the end of the run
    pub fn role(&self) -> Option<FileRole> {
        match self {
            Self::Read => Some(FileRole::Read),
            Self::Opened | Self::WrittenTo => Some(FileRole::Write),
            Self::RenamedTo(_) | Self::Removed => None,
        }
    }

    fn is_live(&self) -> bool {
        self.role().is_some()
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    state: PathState,
    first_seen: u64,
}

/// A path the monitored command touched, with its final role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessedPath {
    pub path: PathBuf,
    pub role: FileRole,
}

/// Merged set of canonical paths touched by a process tree
#[derive(Debug, Clone, Default)]
pub struct AccessSet {
    entries: HashMap<PathBuf, Tracked>,
    seq: u64,
}

impl AccessSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Current state of a path, if it was touched at all
    pub fn state(&self, path: &Path) -> Option<&PathState> {
        self.entries.get(path).map(|t| &t.state)
    }

    /// Opened read-only, stat'd, or executed
    pub fn record_read(&mut self, path: PathBuf) {
        match self.entries.get(&path) {
            Some(t) if t.state.is_live() => {}
            _ => {
                let first_seen = self.next_seq();
                self.entries.insert(
                    path,
                    Tracked {
                        state: PathState::Read,
                        first_seen,
                    },
                );
            }
        }
    }

    /// Opened with write access. `replaced` is set for O_CREAT/O_TRUNC opens
    /// and `truncate(2)`.
    pub fn record_write(&mut self, path: PathBuf, replaced: bool) {
        let seq = self.next_seq();
        let tracked = self.entries.entry(path).or_insert(Tracked {
            state: PathState::Opened,
            first_seen: seq,
        });

        if !tracked.state.is_live() {
            tracked.first_seen = seq;
            tracked.state = PathState::Opened;
        }
        if replaced {
            tracked.state = PathState::WrittenTo;
        } else if tracked.state == PathState::Read {
            tracked.state = PathState::Opened;
        }
    }

    /// `rename(from, to)`: carry the source's state to the target.
    pub fn record_rename(&mut self, from: PathBuf, to: PathBuf) {
        if from == to {
            return;
        }

        let carried = self.entries.remove(&from).filter(|t| t.state.is_live());
        let seq = self.next_seq();
        let target_seen = self.entries.get(&to).map(|t| t.first_seen);

        let (state, first_seen) = match carried {
            Some(t) => (t.state, t.first_seen),
            // Source predates the run; the target now holds contents the command put there
            None => (PathState::WrittenTo, seq),
        };
        let first_seen = target_seen.map_or(first_seen, |seen| seen.min(first_seen));

        trace!(
            "Rename {} -> {} carries {:?}",
            from.display(),
            to.display(),
            state
        );

        self.entries.insert(
            to.clone(),
            Tracked { state, first_seen },
        );
        self.entries.insert(
            from,
            Tracked {
                state: PathState::RenamedTo(to),
                first_seen: seq,
            },
        );
    }

    /// `renameat2(.., RENAME_EXCHANGE)`: both paths swap states.
    pub fn record_exchange(&mut self, a: PathBuf, b: PathBuf) {
        if a == b {
            return;
        }
        let seq = self.next_seq();
        let fresh = || Tracked {
            state: PathState::WrittenTo,
            first_seen: seq,
        };
        let from_a = self
            .entries
            .remove(&a)
            .filter(|t| t.state.is_live())
            .unwrap_or_else(fresh);
        let from_b = self
            .entries
            .remove(&b)
            .filter(|t| t.state.is_live())
            .unwrap_or_else(fresh);
        self.entries.insert(a, from_b);
        self.entries.insert(b, from_a);
    }

    /// `unlink(path)`
    pub fn record_remove(&mut self, path: PathBuf) {
        let seq = self.next_seq();
        self.entries.insert(
            path,
            Tracked {
                state: PathState::Removed,
                first_seen: seq,
            },
        );
    }

    /// Paths that survive the run, in first-access order.
    pub fn into_accessed(self) -> Vec<AccessedPath> {
        let mut live: Vec<(u64, AccessedPath)> = self
            .entries
            .into_iter()
            .filter_map(|(path, t)| {
                t.state
                    .role()
                    .map(|role| (t.first_seen, AccessedPath { path, role }))
            })
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.path.cmp(&b.1.path)));
        live.into_iter().map(|(_, accessed)| accessed).collect()
    }

    /// Number of paths still live
    pub fn len(&self) -> usize {
        self.entries.values().filter(|t| t.state.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
