//! strace output parsing
//!
//! Turns `strace -f -y` output into an [`AccessSet`]. Each traced process has
//! its own working directory (shared between `CLONE_FS` siblings), so
//! relative paths are resolved against the directory in effect when the call
//! was made rather than the directory the run started in.
//!
//! With `vfork`/`posix_spawn` the child's first lines are printed before the
//! parent's `clone` returns, so a pid seen for the first time while a parent
//! has a spawn in flight inherits that parent's directory.

use crate::monitor::access::AccessSet;
use crate::paths::normalize;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::trace;

fn line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)\s+(.*)$").expect("valid regex"))
}

fn resumed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^<\.\.\. ([a-z0-9_]+) resumed>(.*)$").expect("valid regex"))
}

fn result_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*=\s*(-?\d+|\?|0x[0-9a-fA-F]+)(?:<(.*)>)?").expect("valid regex")
    })
}

const UNFINISHED: &str = " <unfinished ...>";

const SPAWN_CALLS: &[&str] = &["clone", "clone3", "fork", "vfork"];

/// One completed system call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Syscall {
    pub pid: u32,
    pub name: String,
    pub args: Vec<String>,
    /// `None` when strace printed `= ?`
    pub ret: Option<i64>,
    /// Path decoration on the return value (`= 3</abs/path>`)
    pub ret_path: Option<PathBuf>,
}

impl Syscall {
    pub fn succeeded(&self) -> bool {
        matches!(self.ret, Some(r) if r >= 0)
    }

    fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

#[derive(Debug)]
struct Pending {
    head: String,
    seq: u64,
}

impl Pending {
    fn is_spawn(&self) -> bool {
        self.head
            .split_once('(')
            .is_some_and(|(name, _)| SPAWN_CALLS.contains(&name))
    }
}

/// Stitches `<unfinished ...>` / `<... resumed>` pairs back together.
#[derive(Debug, Default)]
pub struct TraceReader {
    pending: HashMap<u32, Pending>,
    seq: u64,
}

impl TraceReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one output line; returns a syscall once it is complete.
    pub fn feed(&mut self, line: &str) -> Option<Syscall> {
        let caps = line_re().captures(line.trim_end())?;
        let pid: u32 = caps[1].parse().ok()?;
        let body = caps.get(2)?.as_str();

        if body.starts_with("+++") || body.starts_with("---") {
            return None;
        }

        if let Some(head) = body.strip_suffix(UNFINISHED) {
            self.seq += 1;
            let pending = Pending {
                head: head.to_string(),
                seq: self.seq,
            };
            self.pending.insert(pid, pending);
            return None;
        }

        if let Some(resumed) = resumed_re().captures(body) {
            let pending = self.pending.remove(&pid)?;
            let tail = resumed.get(2).map_or("", |m| m.as_str());
            return parse_call(pid, &format!("{}{}", pending.head, tail));
        }

        parse_call(pid, body)
    }

    /// The most recent process-creating call still waiting for its return
    /// value, as `(parent pid, shares CLONE_FS)`.
    pub fn spawning_parent(&self) -> Option<(u32, bool)> {
        self.pending
            .iter()
            .filter(|(_, pending)| pending.is_spawn())
            .max_by_key(|(_, pending)| pending.seq)
            .map(|(pid, pending)| (*pid, pending.head.contains("CLONE_FS")))
    }
}

/// Parse `name(arg, arg, ...) = ret` into a [`Syscall`].
pub fn parse_call(pid: u32, text: &str) -> Option<Syscall> {
    let open = text.find('(')?;
    let name = &text[..open];
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }

    let (args, rest) = split_args(&text[open + 1..])?;
    let caps = result_re().captures(rest)?;
    let ret = match &caps[1] {
        "?" => None,
        hex if hex.starts_with("0x") => i64::from_str_radix(&hex[2..], 16).ok(),
        num => num.parse().ok(),
    };
    let ret_path = caps.get(2).map(|m| bytes_to_path(unescape(m.as_str())));

    Some(Syscall {
        pid,
        name: name.to_string(),
        args,
        ret,
        ret_path,
    })
}

/// Split the argument list at top-level commas. Returns the arguments and
/// whatever follows the closing parenthesis.
fn split_args(text: &str) -> Option<(Vec<String>, &str)> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut in_decoration = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if in_decoration {
            current.push(c);
            if c == '>' {
                in_decoration = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                current.push(c);
            }
            '<' => {
                in_decoration = true;
                current.push(c);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ')' if depth == 0 => {
                let last = current.trim();
                if !last.is_empty() {
                    args.push(last.to_string());
                }
                return Some((args, &text[i + 1..]));
            }
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }

    None
}

/// Decode a quoted strace string argument (`"a\tb"...`) into raw bytes.
pub fn decode_string(arg: &str) -> Option<Vec<u8>> {
    let arg = arg.trim();
    let arg = arg.strip_suffix("...").unwrap_or(arg);
    let inner = arg.strip_prefix('"')?.strip_suffix('"')?;
    Some(unescape(inner))
}

/// Undo C-style escaping as printed by strace.
fn unescape(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 == bytes.len() {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        i += 1;
        match bytes[i] {
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'v' => out.push(0x0b),
            b'f' => out.push(0x0c),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'x' => {
                let digits: Vec<u8> = bytes[i + 1..]
                    .iter()
                    .take(2)
                    .take_while(|b| b.is_ascii_hexdigit())
                    .copied()
                    .collect();
                if let Some(value) = std::str::from_utf8(&digits)
                    .ok()
                    .and_then(|s| u8::from_str_radix(s, 16).ok())
                {
                    out.push(value);
                    i += digits.len();
                } else {
                    out.push(b'x');
                }
            }
            b'0'..=b'7' => {
                let digits: Vec<u8> = bytes[i..]
                    .iter()
                    .take(3)
                    .take_while(|b| (b'0'..=b'7').contains(*b))
                    .copied()
                    .collect();
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                out.push(value as u8);
                i += digits.len() - 1;
            }
            other => out.push(other),
        }
        i += 1;
    }

    out
}

#[cfg(unix)]
fn bytes_to_path(bytes: Vec<u8>) -> PathBuf {
    use std::os::unix::ffi::OsStringExt;
    PathBuf::from(std::ffi::OsString::from_vec(bytes))
}

#[cfg(not(unix))]
fn bytes_to_path(bytes: Vec<u8>) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(&bytes).into_owned())
}

/// Path decoration on an fd argument: `3</abs/dir>`
fn fd_path(arg: &str) -> Option<PathBuf> {
    let start = arg.find('<')?;
    let inner = arg[start + 1..].strip_suffix('>')?;
    Some(bytes_to_path(unescape(inner)))
}

fn opens_for_write(flags: &str) -> bool {
    flags.contains("O_WRONLY") || flags.contains("O_RDWR")
}

fn replaces_contents(flags: &str) -> bool {
    flags.contains("O_TRUNC") || (flags.contains("O_CREAT") && flags.contains("O_EXCL"))
}

/// Replays parsed syscalls into an access set, tracking per-process cwd.
#[derive(Debug)]
pub struct Replay {
    initial_cwd: PathBuf,
    /// pid -> index into `cwds`; `CLONE_FS` children share an index
    groups: HashMap<u32, usize>,
    cwds: Vec<PathBuf>,
    /// Children placed before their parent's clone returned
    adopted: HashSet<u32>,
    accesses: AccessSet,
}

impl Replay {
    pub fn new(initial_cwd: &Path) -> Self {
        Self {
            initial_cwd: initial_cwd.to_path_buf(),
            groups: HashMap::new(),
            cwds: Vec::new(),
            adopted: HashSet::new(),
            accesses: AccessSet::new(),
        }
    }

    pub fn knows(&self, pid: u32) -> bool {
        self.groups.contains_key(&pid)
    }

    /// Attach `child` to `parent` ahead of the parent's clone return line.
    pub fn adopt(&mut self, child: u32, parent: u32, share_fs: bool) {
        trace!("pid {} adopted by in-flight spawn in {}", child, parent);
        self.fork(parent, child, share_fs);
        self.adopted.insert(child);
    }

    fn group(&mut self, pid: u32) -> usize {
        if let Some(group) = self.groups.get(&pid) {
            return *group;
        }
        self.cwds.push(self.initial_cwd.clone());
        let group = self.cwds.len() - 1;
        self.groups.insert(pid, group);
        group
    }

    /// Working directory currently in effect for `pid`
    pub fn cwd(&mut self, pid: u32) -> PathBuf {
        let group = self.group(pid);
        self.cwds[group].clone()
    }

    fn resolve(&mut self, pid: u32, dirfd: Option<&str>, raw: &str) -> Option<PathBuf> {
        let raw = bytes_to_path(decode_string(raw)?);
        if raw.as_os_str().is_empty() {
            return None;
        }
        if raw.is_absolute() {
            return Some(normalize(&raw, Path::new("/")));
        }
        let base = match dirfd {
            None => self.cwd(pid),
            Some(fd) if fd.starts_with("AT_FDCWD") => self.cwd(pid),
            Some(fd) => match fd_path(fd) {
                Some(dir) => dir,
                None => {
                    trace!("Undecorated dirfd {}, assuming cwd", fd);
                    self.cwd(pid)
                }
            },
        };
        Some(normalize(&raw, &base))
    }

    /// Path a successful open refers to. The `-y` decoration on the returned
    /// fd is the kernel's view and wins over re-resolving the argument.
    fn opened(
        &mut self,
        call: &Syscall,
        dirfd: Option<&str>,
        path: Option<&str>,
    ) -> Option<PathBuf> {
        match &call.ret_path {
            Some(opened) if opened.is_absolute() => Some(normalize(opened, Path::new("/"))),
            _ => path.and_then(|p| self.resolve(call.pid, dirfd, p)),
        }
    }

    fn open(&mut self, call: &Syscall, dirfd: Option<&str>, path: Option<&str>, flags: &str) {
        let Some(path) = self.opened(call, dirfd, path) else {
            return;
        };
        if opens_for_write(flags) {
            self.accesses.record_write(path, replaces_contents(flags));
        } else {
            self.accesses.record_read(path);
        }
    }

    fn read(&mut self, pid: u32, dirfd: Option<&str>, path: Option<&str>) {
        if let Some(path) = path.and_then(|p| self.resolve(pid, dirfd, p)) {
            self.accesses.record_read(path);
        }
    }

    fn fork(&mut self, parent: u32, child: u32, share_fs: bool) {
        let parent_group = self.group(parent);
        let group = if share_fs {
            parent_group
        } else {
            self.cwds.push(self.cwds[parent_group].clone());
            self.cwds.len() - 1
        };
        self.groups.insert(child, group);
    }

    fn chdir(&mut self, pid: u32, dir: PathBuf) {
        let group = self.group(pid);
        trace!("pid {} chdir {}", pid, dir.display());
        self.cwds[group] = dir;
    }

    fn rename(
        &mut self,
        pid: u32,
        from: (Option<&str>, Option<&str>),
        to: (Option<&str>, Option<&str>),
        flags: Option<&str>,
    ) {
        let from = from.1.and_then(|p| self.resolve(pid, from.0, p));
        let to = to.1.and_then(|p| self.resolve(pid, to.0, p));
        let (Some(from), Some(to)) = (from, to) else {
            return;
        };
        if flags.is_some_and(|f| f.contains("RENAME_EXCHANGE")) {
            self.accesses.record_exchange(from, to);
        } else {
            self.accesses.record_rename(from, to);
        }
    }

    /// Apply one syscall. Failed calls leave no trace on the access set.
    pub fn apply(&mut self, call: &Syscall) {
        let pid = call.pid;

        match call.name.as_str() {
            "clone" | "clone3" | "fork" | "vfork" => {
                if let Some(child) = call.ret.filter(|r| *r > 0) {
                    let child = child as u32;
                    if !self.adopted.remove(&child) {
                        let share_fs = call.args.iter().any(|a| a.contains("CLONE_FS"));
                        self.fork(pid, child, share_fs);
                    }
                }
                return;
            }
            _ => {}
        }

        if !call.succeeded() {
            return;
        }

        match call.name.as_str() {
            "open" => self.open(call, None, call.arg(0), call.arg(1).unwrap_or("")),
            "openat" | "openat2" => {
                self.open(call, call.arg(0), call.arg(1), call.arg(2).unwrap_or(""))
            }
            "creat" => {
                if let Some(path) = self.opened(call, None, call.arg(0)) {
                    self.accesses.record_write(path, true);
                }
            }
            "truncate" | "truncate64" => {
                if let Some(path) = call.arg(0).and_then(|p| self.resolve(pid, None, p)) {
                    self.accesses.record_write(path, true);
                }
            }
            "execve" | "stat" | "lstat" | "stat64" | "lstat64" | "access" | "readlink" => {
                self.read(pid, None, call.arg(0))
            }
            "execveat" | "newfstatat" | "fstatat64" | "statx" | "faccessat" | "faccessat2"
            | "readlinkat" => self.read(pid, call.arg(0), call.arg(1)),
            "rename" => self.rename(pid, (None, call.arg(0)), (None, call.arg(1)), None),
            "renameat" => self.rename(
                pid,
                (call.arg(0), call.arg(1)),
                (call.arg(2), call.arg(3)),
                None,
            ),
            "renameat2" => self.rename(
                pid,
                (call.arg(0), call.arg(1)),
                (call.arg(2), call.arg(3)),
                call.arg(4),
            ),
            "unlink" => {
                if let Some(path) = call.arg(0).and_then(|p| self.resolve(pid, None, p)) {
                    self.accesses.record_remove(path);
                }
            }
            "unlinkat" => {
                if call.arg(2).is_some_and(|f| f.contains("AT_REMOVEDIR")) {
                    return;
                }
                if let Some(path) = call.arg(1).and_then(|p| self.resolve(pid, call.arg(0), p)) {
                    self.accesses.record_remove(path);
                }
            }
            "chdir" => {
                if let Some(dir) = call.arg(0).and_then(|p| self.resolve(pid, None, p)) {
                    self.chdir(pid, dir);
                }
            }
            "fchdir" => {
                if let Some(dir) = call.arg(0).and_then(fd_path) {
                    self.chdir(pid, dir);
                }
            }
            _ => {}
        }
    }

    pub fn finish(self) -> AccessSet {
        self.accesses
    }
}

/// Outcome of replaying one strace log
#[derive(Debug)]
pub struct ReplayedTrace {
    pub accesses: AccessSet,
    /// Complete syscalls seen; zero means the log carried nothing usable
    pub calls: usize,
}

/// Replay a strace log one line at a time.
pub fn replay_trace<R: BufRead>(mut input: R, initial_cwd: &Path) -> io::Result<ReplayedTrace> {
    let mut reader = TraceReader::new();
    let mut replay = Replay::new(initial_cwd);
    let mut calls = 0;
    let mut line = Vec::new();

    loop {
        line.clear();
        if input.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        let Some(call) = reader.feed(&String::from_utf8_lossy(&line)) else {
            continue;
        };
        calls += 1;
        if !replay.knows(call.pid) {
            if let Some((parent, share_fs)) = reader.spawning_parent() {
                replay.adopt(call.pid, parent, share_fs);
            }
        }
        replay.apply(&call);
    }

    Ok(ReplayedTrace {
        accesses: replay.finish(),
        calls,
    })
}
