//! Decision engine
//!
//! Drives one invocation through
//! `START -> CHECK -> {HIT, MISS} -> EXECUTE -> RECORD -> DONE`.
//! The per-key lock is held from CHECK until DONE so identical invocations
//! never run or record concurrently.

use crate::config::{EmptyEntryPolicy, Settings};
use crate::error::{MemoizeError, MemoizeResult};
use crate::fingerprint;
use crate::invocation::{Invocation, SignatureKey};
use crate::monitor::{self, spawn, AccessedPath, TracedRun, Tracer};
use crate::store::{CacheEntry, CapturedOutput, FileRecord, FingerprintStore};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Why a cached entry could not be reused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissReason {
    NoEntry,
    Corrupt(String),
    NoTrackedFiles,
    Changed(PathBuf),
    Vanished(PathBuf),
    Unreadable(PathBuf),
    /// No tracer available; nothing is ever cached
    Untracked,
}

impl fmt::Display for MissReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEntry => write!(f, "no cache entry"),
            Self::Corrupt(reason) => write!(f, "cache entry unusable ({reason})"),
            Self::NoTrackedFiles => write!(f, "entry tracks no files"),
            Self::Changed(path) => write!(f, "{} changed", path.display()),
            Self::Vanished(path) => write!(f, "{} no longer exists", path.display()),
            Self::Unreadable(path) => write!(f, "{} is unreadable", path.display()),
            Self::Untracked => write!(f, "file access tracing unavailable"),
        }
    }
}

/// Result of CHECK
#[derive(Debug)]
pub enum Verdict {
    Hit(CacheEntry),
    Miss(MissReason),
}

/// How the invocation was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// Skipped; recorded results reported
    Hit,
    /// Ran under the tracer
    Executed,
    /// Ran without tracing
    Untracked,
}

/// Final result of one invocation
#[derive(Debug)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub exit_code: i32,
    /// Recorded output to replay (hits only; executed runs streamed live)
    pub replay: Option<CapturedOutput>,
    pub miss: Option<MissReason>,
}

enum State {
    Start,
    Check,
    Hit(CacheEntry),
    Miss(MissReason),
    Execute(MissReason),
    Record(TracedRun, MissReason),
    Done(Outcome),
}

/// Skip/execute decision maker for single invocations
pub struct Engine {
    settings: Settings,
    store: FingerprintStore,
    tracer: Option<Box<dyn Tracer>>,
}

impl Engine {
    /// Open the store and pick a tracer according to `settings`.
    ///
    /// A missing tracer is only an error with `require_tracing`.
    pub async fn new(settings: Settings) -> MemoizeResult<Self> {
        let store = FingerprintStore::open(&settings.cache_dir).await?;
        let tracer = select_tracer(&settings).await?;
        Ok(Self::with_parts(settings, store, tracer))
    }

    pub fn with_parts(
        settings: Settings,
        store: FingerprintStore,
        tracer: Option<Box<dyn Tracer>>,
    ) -> Self {
        Self {
            settings,
            store,
            tracer,
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.tracer.is_some()
    }

    /// Run `invocation`, skipping it when its recorded files are unchanged.
    pub async fn run(&self, invocation: &Invocation) -> MemoizeResult<Outcome> {
        let Some(tracer) = self.tracer.as_deref() else {
            return self.run_untracked(invocation).await;
        };

        let key = invocation.signature();
        let _lock = self.store.lock(&key, self.settings.lock_policy).await?;

        let mut state = State::Start;
        loop {
            state = match state {
                State::Start => {
                    debug!("Signature {} for {}", key.short(), invocation.display_command());
                    State::Check
                }
                State::Check => match self.check(&key).await? {
                    Verdict::Hit(entry) => State::Hit(entry),
                    Verdict::Miss(reason) => State::Miss(reason),
                },
                State::Hit(entry) => {
                    info!("Cache hit, skipping: {}", invocation.display_command());
                    State::Done(Outcome {
                        kind: OutcomeKind::Hit,
                        exit_code: entry.exit_code,
                        replay: entry.output,
                        miss: None,
                    })
                }
                State::Miss(reason) => {
                    info!("Cache miss ({}): {}", reason, invocation.display_command());
                    State::Execute(reason)
                }
                State::Execute(reason) => {
                    let run = tracer.run(invocation, self.settings.capture).await?;
                    State::Record(run, reason)
                }
                State::Record(run, reason) => {
                    let exit_code = run.exit_code;
                    self.record(invocation, &key, run).await;
                    State::Done(Outcome {
                        kind: OutcomeKind::Executed,
                        exit_code,
                        replay: None,
                        miss: Some(reason),
                    })
                }
                State::Done(outcome) => return Ok(outcome),
            };
        }
    }

    /// CHECK only, without executing anything
    pub async fn explain(&self, invocation: &Invocation) -> MemoizeResult<Verdict> {
        self.check(&invocation.signature()).await
    }

    /// Drop the entry for `invocation`; returns whether one existed
    pub async fn forget(&self, invocation: &Invocation) -> MemoizeResult<bool> {
        let key = invocation.signature();
        let _lock = self.store.lock(&key, self.settings.lock_policy).await?;
        self.store.remove(&key).await
    }

    async fn run_untracked(&self, invocation: &Invocation) -> MemoizeResult<Outcome> {
        debug!("Running untracked: {}", invocation.display_command());
        let outcome = spawn::run_direct(invocation, self.settings.capture).await?;
        Ok(Outcome {
            kind: OutcomeKind::Untracked,
            exit_code: outcome.exit_code,
            replay: None,
            miss: Some(MissReason::Untracked),
        })
    }

    async fn check(&self, key: &SignatureKey) -> MemoizeResult<Verdict> {
        let entry = match self.store.lookup(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(Verdict::Miss(MissReason::NoEntry)),
            Err(MemoizeError::CacheCorruption { path, reason }) => {
                warn!("Ignoring corrupted cache entry {}: {}", path.display(), reason);
                return Ok(Verdict::Miss(MissReason::Corrupt(reason)));
            }
            Err(e) => return Err(e),
        };

        if entry.is_empty() {
            return Ok(match self.settings.empty_entries {
                EmptyEntryPolicy::AlwaysRun => Verdict::Miss(MissReason::NoTrackedFiles),
                EmptyEntryPolicy::CacheForever => Verdict::Hit(entry),
            });
        }

        match verify(&entry.files).await {
            Some(reason) => Ok(Verdict::Miss(reason)),
            None => Ok(Verdict::Hit(entry)),
        }
    }

    /// Digest the surviving files and commit the entry.
    ///
    /// Failures here never change the outcome of a command that already ran.
    async fn record(&self, invocation: &Invocation, key: &SignatureKey, run: TracedRun) {
        if !run.complete {
            return;
        }

        if run.exit_code != 0 && !self.settings.record_failures {
            debug!("Not recording failed run (exit {})", run.exit_code);
            if let Err(e) = self.store.remove(key).await {
                warn!("Failed to remove cache entry: {}", e);
            }
            return;
        }

        let files = self.fingerprint_files(&run.accesses).await;
        let entry = CacheEntry::new(invocation, files, run.exit_code, run.output);
        match self.store.commit(&entry).await {
            Ok(()) => info!(
                "Recorded {} files for {}",
                entry.files.len(),
                invocation.display_command()
            ),
            Err(e) => warn!("Failed to record cache entry: {}", e),
        }
    }

    async fn fingerprint_files(&self, accesses: &[AccessedPath]) -> Vec<FileRecord> {
        let mut files = Vec::with_capacity(accesses.len());
        for accessed in accesses {
            if !self.settings.filter.keep(&accessed.path) {
                continue;
            }
            let Ok(meta) = fs::metadata(&accessed.path).await else {
                debug!("Gone before recording: {}", accessed.path.display());
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            match fingerprint::digest(&accessed.path).await {
                Ok(digest) => files.push(FileRecord {
                    path: accessed.path.clone(),
                    digest,
                    role: accessed.role,
                    size: meta.len(),
                    modified: modified_time(&meta),
                }),
                Err(e) => warn!("Not tracking file: {}", e),
            }
        }
        files
    }
}

async fn ready_tracer(settings: &Settings) -> MemoizeResult<Box<dyn Tracer>> {
    let tracer = monitor::create_tracer(settings.backend, settings.strace_path.clone())?;
    tracer.ensure_ready().await?;
    Ok(tracer)
}

async fn select_tracer(settings: &Settings) -> MemoizeResult<Option<Box<dyn Tracer>>> {
    match ready_tracer(settings).await {
        Ok(tracer) => {
            debug!("Tracing with {}", tracer.backend_name());
            Ok(Some(tracer))
        }
        Err(e) if settings.require_tracing => Err(e),
        Err(e) => {
            warn!("{}; running without caching", e);
            Ok(None)
        }
    }
}

fn modified_time(meta: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}

/// Recompute digests for `files`, stopping at the first difference.
///
/// Size and mtime only decide the order: files whose metadata moved are
/// hashed first, then smaller files before larger ones.
async fn verify(files: &[FileRecord]) -> Option<MissReason> {
    let mut queue = Vec::with_capacity(files.len());
    for record in files {
        let meta = match fs::metadata(&record.path).await {
            Ok(meta) if meta.is_file() => meta,
            _ => return Some(MissReason::Vanished(record.path.clone())),
        };
        let moved = meta.len() != record.size || modified_time(&meta) != record.modified;
        queue.push((!moved, meta.len(), record));
    }
    queue.sort_by_key(|(unmoved, size, _)| (*unmoved, *size));

    for (_, _, record) in queue {
        match fingerprint::digest(&record.path).await {
            Ok(digest) if digest == record.digest => {}
            Ok(_) => return Some(MissReason::Changed(record.path.clone())),
            Err(e) => {
                debug!("{}", e);
                return Some(unreadable(&record.path));
            }
        }
    }
    None
}

fn unreadable(path: &Path) -> MissReason {
    if path.exists() {
        MissReason::Unreadable(path.to_path_buf())
    } else {
        MissReason::Vanished(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Overrides};
    use crate::fingerprint::Fingerprint;
    use crate::monitor::{AccessSet, CaptureSettings, FileRole};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    type Script = dyn Fn(&Path) -> (i32, AccessSet) + Send + Sync;

    /// Runs a closure in place of the command and reports what it touched
    struct FakeTracer {
        runs: Arc<AtomicUsize>,
        delay: Duration,
        script: Arc<Script>,
    }

    #[async_trait]
    impl Tracer for FakeTracer {
        async fn ensure_ready(&self) -> MemoizeResult<()> {
            Ok(())
        }

        async fn run(
            &self,
            invocation: &Invocation,
            _capture: CaptureSettings,
        ) -> MemoizeResult<TracedRun> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let (exit_code, accesses) = (self.script)(invocation.cwd());
            Ok(TracedRun {
                exit_code,
                accesses: accesses.into_accessed(),
                output: Some(CapturedOutput {
                    stdout: format!("run {}\n", self.runs.load(Ordering::SeqCst)).into_bytes(),
                    stderr: Vec::new(),
                }),
                complete: true,
            })
        }

        fn backend_name(&self) -> &'static str {
            "fake"
        }
    }

    /// Stands in for a run cut short by Ctrl-C
    struct InterruptedTracer {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tracer for InterruptedTracer {
        async fn ensure_ready(&self) -> MemoizeResult<()> {
            Ok(())
        }

        async fn run(
            &self,
            invocation: &Invocation,
            _capture: CaptureSettings,
        ) -> MemoizeResult<TracedRun> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            std::fs::write(invocation.cwd().join("partial.out"), "half").unwrap();
            Err(MemoizeError::Interrupted)
        }

        fn backend_name(&self) -> &'static str {
            "interrupted"
        }
    }

    struct Fixture {
        temp: TempDir,
        work: PathBuf,
        runs: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let work = temp.path().join("work");
            std::fs::create_dir(&work).unwrap();
            let work = work.canonicalize().unwrap();
            Self {
                temp,
                work,
                runs: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn write(&self, name: &str, content: &str) {
            std::fs::write(self.work.join(name), content).unwrap();
        }

        fn invocation(&self) -> Invocation {
            Invocation::new(vec!["build".to_string()], &self.work, BTreeMap::new()).unwrap()
        }

        async fn engine_with(
            &self,
            overrides: Overrides,
            delay: Duration,
            script: impl Fn(&Path) -> (i32, AccessSet) + Send + Sync + 'static,
        ) -> Engine {
            let tracer = FakeTracer {
                runs: self.runs.clone(),
                delay,
                script: Arc::new(script),
            };
            self.engine_for(overrides, Box::new(tracer)).await
        }

        async fn engine_for(&self, overrides: Overrides, tracer: Box<dyn Tracer>) -> Engine {
            let overrides = Overrides {
                cache_dir: Some(self.temp.path().join("cache")),
                ..overrides
            };
            let settings = Settings::resolve(&Config::default(), overrides, &self.work)
                .await
                .unwrap();
            let store = FingerprintStore::open(&settings.cache_dir).await.unwrap();
            Engine::with_parts(settings, store, Some(tracer))
        }

        async fn engine(
            &self,
            script: impl Fn(&Path) -> (i32, AccessSet) + Send + Sync + 'static,
        ) -> Engine {
            self.engine_with(Overrides::default(), Duration::ZERO, script)
                .await
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    /// Reads input.txt
    fn read_input(cwd: &Path) -> (i32, AccessSet) {
        let mut set = AccessSet::new();
        set.record_read(cwd.join("input.txt"));
        (0, set)
    }

    #[tokio::test]
    async fn second_run_is_a_hit() {
        let fx = Fixture::new();
        fx.write("input.txt", "hello");
        let engine = fx.engine(read_input).await;

        let first = engine.run(&fx.invocation()).await.unwrap();
        assert_eq!(first.kind, OutcomeKind::Executed);
        assert_eq!(first.miss, Some(MissReason::NoEntry));

        let second = engine.run(&fx.invocation()).await.unwrap();
        assert_eq!(second.kind, OutcomeKind::Hit);
        assert_eq!(second.exit_code, first.exit_code);
        assert_eq!(second.replay.unwrap().stdout, b"run 1\n");
        assert_eq!(fx.runs(), 1);
    }

    #[tokio::test]
    async fn modified_input_forces_rerun() {
        let fx = Fixture::new();
        fx.write("input.txt", "hello");
        let engine = fx.engine(read_input).await;
        engine.run(&fx.invocation()).await.unwrap();

        fx.write("input.txt", "world");
        let outcome = engine.run(&fx.invocation()).await.unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Executed);
        assert_eq!(outcome.miss, Some(MissReason::Changed(fx.work.join("input.txt"))));
        assert_eq!(fx.runs(), 2);

        // New digest stored
        assert_eq!(engine.run(&fx.invocation()).await.unwrap().kind, OutcomeKind::Hit);
    }

    #[tokio::test]
    async fn same_size_rewrite_is_still_detected() {
        let fx = Fixture::new();
        fx.write("input.txt", "aaaa");
        let engine = fx.engine(read_input).await;
        engine.run(&fx.invocation()).await.unwrap();

        // Same length; mtime may not even move at coarse resolution
        fx.write("input.txt", "bbbb");
        let outcome = engine.run(&fx.invocation()).await.unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Executed);
    }

    #[tokio::test]
    async fn renamed_output_is_tracked_under_final_name() {
        let fx = Fixture::new();
        fx.write("input.txt", "hello");
        let engine = fx
            .engine(|cwd: &Path| {
                let tmp = cwd.join("out.txt.tmp");
                let out = cwd.join("out.txt");
                std::fs::write(&tmp, "result").unwrap();
                std::fs::rename(&tmp, &out).unwrap();

                let mut set = AccessSet::new();
                set.record_read(cwd.join("input.txt"));
                set.record_write(tmp.clone(), true);
                set.record_rename(tmp, out);
                (0, set)
            })
            .await;

        engine.run(&fx.invocation()).await.unwrap();
        let entry = engine
            .store
            .lookup(&fx.invocation().signature())
            .await
            .unwrap()
            .unwrap();
        let tracked: Vec<_> = entry.files.iter().map(|f| (f.path.clone(), f.role)).collect();
        assert_eq!(
            tracked,
            vec![
                (fx.work.join("input.txt"), FileRole::Read),
                (fx.work.join("out.txt"), FileRole::Write),
            ]
        );

        let second = engine.run(&fx.invocation()).await.unwrap();
        assert_eq!(second.kind, OutcomeKind::Hit);
        assert_eq!(fx.runs(), 1);
    }

    #[tokio::test]
    async fn ignored_directory_changes_do_not_matter() {
        let fx = Fixture::new();
        fx.write("input.txt", "hello");
        let scratch = fx.work.join("scratch");
        std::fs::create_dir(&scratch).unwrap();
        std::fs::write(scratch.join("log"), "one").unwrap();

        let overrides = Overrides {
            ignore_dirs: vec![scratch.clone()],
            ..Default::default()
        };
        let engine = fx
            .engine_with(overrides, Duration::ZERO, |cwd: &Path| {
                let mut set = AccessSet::new();
                set.record_read(cwd.join("input.txt"));
                set.record_read(cwd.join("scratch").join("log"));
                (0, set)
            })
            .await;

        engine.run(&fx.invocation()).await.unwrap();
        std::fs::write(scratch.join("log"), "two, longer").unwrap();

        assert_eq!(engine.run(&fx.invocation()).await.unwrap().kind, OutcomeKind::Hit);
        assert_eq!(fx.runs(), 1);
    }

    #[tokio::test]
    async fn watch_dirs_limit_tracking() {
        let fx = Fixture::new();
        fx.write("input.txt", "hello");
        let other = fx.temp.path().join("elsewhere.txt");
        std::fs::write(&other, "x").unwrap();
        let other = other.canonicalize().unwrap();

        let overrides = Overrides {
            watch_dirs: vec![fx.work.clone()],
            ..Default::default()
        };
        let other_path = other.clone();
        let engine = fx
            .engine_with(overrides, Duration::ZERO, move |cwd: &Path| {
                let mut set = AccessSet::new();
                set.record_read(cwd.join("input.txt"));
                set.record_read(other_path.clone());
                (0, set)
            })
            .await;

        engine.run(&fx.invocation()).await.unwrap();
        std::fs::write(&other, "changed").unwrap();
        assert_eq!(engine.run(&fx.invocation()).await.unwrap().kind, OutcomeKind::Hit);
    }

    #[tokio::test]
    async fn vanished_file_is_a_miss() {
        let fx = Fixture::new();
        fx.write("input.txt", "hello");
        let engine = fx.engine(read_input).await;
        engine.run(&fx.invocation()).await.unwrap();

        std::fs::remove_file(fx.work.join("input.txt")).unwrap();
        let verdict = engine.explain(&fx.invocation()).await.unwrap();
        assert!(matches!(verdict, Verdict::Miss(MissReason::Vanished(_))));
    }

    fn unreadable_record(path: PathBuf) -> FileRecord {
        FileRecord {
            path,
            digest: Fingerprint::from_hex("00"),
            role: FileRole::Read,
            size: 0,
            modified: None,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_file_is_a_miss() {
        use std::os::unix::fs::PermissionsExt;

        let fx = Fixture::new();
        fx.write("input.txt", "hello");
        let engine = fx.engine(read_input).await;
        engine.run(&fx.invocation()).await.unwrap();

        let input = fx.work.join("input.txt");
        std::fs::set_permissions(&input, std::fs::Permissions::from_mode(0o000)).unwrap();
        if std::fs::read(&input).is_ok() {
            eprintln!("permissions not enforced (running as root?), skipping");
            return;
        }

        let verdict = engine.explain(&fx.invocation()).await.unwrap();
        assert!(matches!(verdict, Verdict::Miss(MissReason::Unreadable(path)) if path == input));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn read_error_mid_digest_is_a_miss() {
        // Regular file that opens fine but fails to read from offset 0
        let path = PathBuf::from("/proc/self/mem");
        let reason = verify(&[unreadable_record(path.clone())]).await;
        assert_eq!(reason, Some(MissReason::Unreadable(path)));
    }

    #[tokio::test]
    async fn interrupted_run_commits_nothing() {
        let fx = Fixture::new();
        fx.write("input.txt", "hello");
        let tracer = InterruptedTracer {
            runs: fx.runs.clone(),
        };
        let engine = fx.engine_for(Overrides::default(), Box::new(tracer)).await;

        let err = engine.run(&fx.invocation()).await.unwrap_err();
        assert!(matches!(err, MemoizeError::Interrupted));
        assert_eq!(err.exit_code(), 130);
        assert!(engine
            .store
            .lookup(&fx.invocation().signature())
            .await
            .unwrap()
            .is_none());

        // Lock released; the next run executes from scratch
        let engine = fx.engine(read_input).await;
        let outcome = engine.run(&fx.invocation()).await.unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Executed);
        assert_eq!(outcome.miss, Some(MissReason::NoEntry));
        assert_eq!(fx.runs(), 2);
    }

    #[tokio::test]
    async fn interrupted_rerun_keeps_previous_entry() {
        let fx = Fixture::new();
        fx.write("input.txt", "hello");
        let engine = fx.engine(read_input).await;
        engine.run(&fx.invocation()).await.unwrap();
        let before = engine.store.lookup(&fx.invocation().signature()).await.unwrap();

        fx.write("input.txt", "world");
        let tracer = InterruptedTracer {
            runs: fx.runs.clone(),
        };
        let interrupted = fx.engine_for(Overrides::default(), Box::new(tracer)).await;
        assert!(interrupted.run(&fx.invocation()).await.is_err());

        let after = engine.store.lookup(&fx.invocation().signature()).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn concurrent_runs_with_entry_never_execute() {
        let fx = Fixture::new();
        fx.write("input.txt", "hello");
        let engine = fx.engine(read_input).await;
        engine.run(&fx.invocation()).await.unwrap();

        let inv = fx.invocation();
        let (a, b) = tokio::join!(engine.run(&inv), engine.run(&inv));
        assert_eq!(a.unwrap().kind, OutcomeKind::Hit);
        assert_eq!(b.unwrap().kind, OutcomeKind::Hit);
        assert_eq!(fx.runs(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_runs_execute_once() {
        let fx = Fixture::new();
        fx.write("input.txt", "hello");
        let engine = fx
            .engine_with(Overrides::default(), Duration::from_millis(200), read_input)
            .await;

        let inv = fx.invocation();
        let (a, b) = tokio::join!(engine.run(&inv), engine.run(&inv));
        let mut kinds = vec![a.unwrap().kind, b.unwrap().kind];
        kinds.sort_by_key(|k| *k == OutcomeKind::Hit);
        assert_eq!(kinds, vec![OutcomeKind::Executed, OutcomeKind::Hit]);
        assert_eq!(fx.runs(), 1);
    }

    #[tokio::test]
    async fn contended_lock_fails_fast_when_configured() {
        let fx = Fixture::new();
        fx.write("input.txt", "hello");
        let engine = fx
            .engine_with(
                Overrides {
                    lock: Some(crate::store::LockPolicy::Fail),
                    ..Default::default()
                },
                Duration::from_millis(200),
                read_input,
            )
            .await;

        let inv = fx.invocation();
        let (a, b) = tokio::join!(engine.run(&inv), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            engine.run(&inv).await
        });
        assert!(a.is_ok());
        assert!(matches!(b, Err(MemoizeError::LockContention(_))));
    }

    #[tokio::test]
    async fn corrupted_entry_is_a_miss_and_gets_replaced() {
        let fx = Fixture::new();
        fx.write("input.txt", "hello");
        let engine = fx.engine(read_input).await;
        engine.run(&fx.invocation()).await.unwrap();

        let key = fx.invocation().signature();
        let path = fx
            .temp
            .path()
            .join("cache")
            .join("entries")
            .join(format!("{key}.json"));
        std::fs::write(&path, "{ truncated").unwrap();

        let outcome = engine.run(&fx.invocation()).await.unwrap();
        assert!(matches!(outcome.miss, Some(MissReason::Corrupt(_))));
        assert_eq!(engine.run(&fx.invocation()).await.unwrap().kind, OutcomeKind::Hit);
        assert_eq!(fx.runs(), 2);
    }

    #[tokio::test]
    async fn empty_entries_always_run_by_default() {
        let fx = Fixture::new();
        let engine = fx.engine(|_: &Path| (0, AccessSet::new())).await;

        engine.run(&fx.invocation()).await.unwrap();
        let second = engine.run(&fx.invocation()).await.unwrap();
        assert_eq!(second.miss, Some(MissReason::NoTrackedFiles));
        assert_eq!(fx.runs(), 2);
    }

    #[tokio::test]
    async fn empty_entries_can_cache_forever() {
        let fx = Fixture::new();
        let overrides = Overrides {
            cache_empty: true,
            ..Default::default()
        };
        let engine = fx
            .engine_with(overrides, Duration::ZERO, |_: &Path| (0, AccessSet::new()))
            .await;

        engine.run(&fx.invocation()).await.unwrap();
        assert_eq!(engine.run(&fx.invocation()).await.unwrap().kind, OutcomeKind::Hit);
        assert_eq!(fx.runs(), 1);
    }

    #[tokio::test]
    async fn failures_are_cached_by_default() {
        let fx = Fixture::new();
        fx.write("input.txt", "hello");
        let engine = fx
            .engine(|cwd: &Path| {
                let (_, set) = read_input(cwd);
                (2, set)
            })
            .await;

        assert_eq!(engine.run(&fx.invocation()).await.unwrap().exit_code, 2);
        let second = engine.run(&fx.invocation()).await.unwrap();
        assert_eq!(second.kind, OutcomeKind::Hit);
        assert_eq!(second.exit_code, 2);
    }

    #[tokio::test]
    async fn skip_failed_drops_entry() {
        let fx = Fixture::new();
        fx.write("input.txt", "hello");
        let fail = Arc::new(AtomicUsize::new(0));
        let flag = fail.clone();
        let overrides = Overrides {
            skip_failed: true,
            ..Default::default()
        };
        let engine = fx
            .engine_with(overrides, Duration::ZERO, move |cwd: &Path| {
                let (_, set) = read_input(cwd);
                (flag.load(Ordering::SeqCst) as i32, set)
            })
            .await;

        engine.run(&fx.invocation()).await.unwrap();
        assert_eq!(engine.run(&fx.invocation()).await.unwrap().kind, OutcomeKind::Hit);

        // A later failure removes the good entry instead of keeping it
        fx.write("input.txt", "broken");
        fail.store(1, Ordering::SeqCst);
        assert_eq!(engine.run(&fx.invocation()).await.unwrap().exit_code, 1);
        let verdict = engine.explain(&fx.invocation()).await.unwrap();
        assert!(matches!(verdict, Verdict::Miss(MissReason::NoEntry)));
    }

    #[tokio::test]
    async fn forget_removes_entry() {
        let fx = Fixture::new();
        fx.write("input.txt", "hello");
        let engine = fx.engine(read_input).await;
        engine.run(&fx.invocation()).await.unwrap();

        assert!(matches!(
            engine.explain(&fx.invocation()).await.unwrap(),
            Verdict::Hit(_)
        ));
        assert!(engine.forget(&fx.invocation()).await.unwrap());
        assert!(!engine.forget(&fx.invocation()).await.unwrap());
        assert_eq!(engine.run(&fx.invocation()).await.unwrap().kind, OutcomeKind::Executed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn untracked_runs_directly() {
        let fx = Fixture::new();
        let settings = Settings::resolve(
            &Config::default(),
            Overrides {
                cache_dir: Some(fx.temp.path().join("cache")),
                ..Default::default()
            },
            &fx.work,
        )
        .await
        .unwrap();
        let store = FingerprintStore::open(&settings.cache_dir).await.unwrap();
        let engine = Engine::with_parts(settings, store, None);
        assert!(!engine.is_tracking());

        let inv = Invocation::new(
            vec!["sh".into(), "-c".into(), "exit 3".into()],
            &fx.work,
            BTreeMap::new(),
        )
        .unwrap();
        let outcome = engine.run(&inv).await.unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Untracked);
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.miss, Some(MissReason::Untracked));
    }

    #[test]
    fn miss_reasons_read_well() {
        assert_eq!(MissReason::NoEntry.to_string(), "no cache entry");
        assert_eq!(
            MissReason::Changed(PathBuf::from("/w/a.c")).to_string(),
            "/w/a.c changed"
        );
    }
}
