//! Integration tests for memoize

use assert_cmd::{cargo::cargo_bin_cmd, Command};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Isolated cache and config for one test
struct Sandbox {
    temp: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("work")).unwrap();
        std::fs::create_dir(temp.path().join("scratch")).unwrap();
        Self { temp }
    }

    fn work(&self) -> PathBuf {
        self.temp.path().join("work")
    }

    fn scratch(&self) -> PathBuf {
        self.temp.path().join("scratch")
    }

    fn memoize(&self) -> Command {
        let mut cmd = cargo_bin_cmd!("memoize");
        cmd.current_dir(self.work())
            .env("MEMOIZE_CONFIG", self.temp.path().join("config.toml"))
            .env("MEMOIZE_CACHE_DIR", self.temp.path().join("cache"))
            .env_remove("RUST_LOG");
        cmd
    }

    /// memoize with the scratch dir ignored, wrapping `sh -c script`
    fn wrapped(&self, script: &str) -> Command {
        let mut cmd = self.memoize();
        cmd.arg("--ignore-dir")
            .arg(self.scratch())
            .args(["--", "sh", "-c", script]);
        cmd
    }

    /// Number of times a script that appends to scratch/runs executed
    fn runs(&self) -> usize {
        std::fs::read_to_string(self.scratch().join("runs"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn write(&self, name: &str, content: &str) {
        std::fs::write(self.work().join(name), content).unwrap();
    }
}

fn tracing_available() -> bool {
    std::process::Command::new("strace")
        .args(["-f", "-qq", "-o", "/dev/null", "--", "true"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn exists(path: &Path) -> bool {
    path.try_exists().unwrap_or(false)
}

mod cli_tests {
    use super::*;
    use predicates::prelude::*;

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("memoize")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains(
                "Skip re-running a command when nothing it read or wrote has changed",
            ));
    }

    #[test]
    fn usage_error_uses_reserved_code() {
        let sandbox = Sandbox::new();
        sandbox
            .memoize()
            .args(["--no-such-flag", "--", "true"])
            .assert()
            .code(125)
            .stderr(predicate::str::contains("--no-such-flag"));
    }

    #[test]
    fn conflicting_modes_use_reserved_code() {
        let sandbox = Sandbox::new();
        sandbox
            .memoize()
            .args(["--explain", "--forget", "--", "true"])
            .assert()
            .code(125);
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("memoize")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("memoize"));
    }

    #[test]
    fn missing_command_is_an_error() {
        let sandbox = Sandbox::new();
        sandbox
            .memoize()
            .assert()
            .code(125)
            .stderr(predicate::str::contains("No command given"));
    }

    #[test]
    fn unknown_command_exits_127() {
        let sandbox = Sandbox::new();
        sandbox
            .memoize()
            .args(["--", "definitely-not-a-real-command-xyz"])
            .assert()
            .code(127)
            .stderr(predicate::str::contains("Command not found"));
    }

    #[test]
    fn untracked_run_propagates_exit_code() {
        let sandbox = Sandbox::new();
        sandbox
            .memoize()
            .args(["--backend", "none", "--", "sh", "-c", "echo hi; exit 7"])
            .assert()
            .code(7)
            .stdout("hi\n");
    }

    #[test]
    fn required_tracing_fails_without_backend() {
        let sandbox = Sandbox::new();
        sandbox
            .memoize()
            .args(["--backend", "none", "--require-tracing", "--", "true"])
            .assert()
            .code(125)
            .stderr(predicate::str::contains("tracing unavailable"));
    }

    #[test]
    fn explain_without_entry_reports_miss() {
        let sandbox = Sandbox::new();
        sandbox
            .memoize()
            .args(["--backend", "none", "--explain", "--", "true"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("[MISS]"));
    }

    #[test]
    fn forget_without_entry_succeeds() {
        let sandbox = Sandbox::new();
        sandbox
            .memoize()
            .args(["--backend", "none", "--forget", "--", "true"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No entry"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let sandbox = Sandbox::new();
        std::fs::write(sandbox.temp.path().join("config.toml"), "[cache]\nlock = 3\n").unwrap();
        sandbox
            .memoize()
            .args(["--", "true"])
            .assert()
            .code(125)
            .stderr(predicate::str::contains("Invalid configuration"));
    }
}

mod caching_tests {
    use super::*;
    use predicates::prelude::*;

    const READ_INPUT: &str = "echo run >> ../scratch/runs; cat input.txt";

    #[test]
    fn unchanged_input_is_a_hit() {
        if !tracing_available() {
            eprintln!("strace unavailable, skipping");
            return;
        }
        let sandbox = Sandbox::new();
        sandbox.write("input.txt", "hello");

        sandbox.wrapped(READ_INPUT).assert().success().stdout("hello");
        sandbox.wrapped(READ_INPUT).assert().success().stdout("hello");
        assert_eq!(sandbox.runs(), 1);
    }

    #[test]
    fn modified_input_is_a_miss() {
        if !tracing_available() {
            eprintln!("strace unavailable, skipping");
            return;
        }
        let sandbox = Sandbox::new();
        sandbox.write("input.txt", "hello");
        sandbox.wrapped(READ_INPUT).assert().success();

        sandbox.write("input.txt", "world");
        sandbox.wrapped(READ_INPUT).assert().success().stdout("world");
        assert_eq!(sandbox.runs(), 2);
    }

    #[test]
    fn renamed_output_is_tracked_by_final_name() {
        if !tracing_available() {
            eprintln!("strace unavailable, skipping");
            return;
        }
        let sandbox = Sandbox::new();
        let script = "echo run >> ../scratch/runs; echo result > out.tmp && mv out.tmp out.txt";

        sandbox.wrapped(script).assert().success();
        assert!(exists(&sandbox.work().join("out.txt")));
        assert!(!exists(&sandbox.work().join("out.tmp")));

        sandbox.wrapped(script).assert().success();
        assert_eq!(sandbox.runs(), 1);

        let mut explain = sandbox.memoize();
        explain
            .arg("--ignore-dir")
            .arg(sandbox.scratch())
            .args(["--explain", "--", "sh", "-c", script])
            .assert()
            .success()
            .stdout(predicate::str::contains("out.txt"))
            .stdout(predicate::str::contains("out.tmp").not());
    }

    #[test]
    fn ignored_directory_changes_keep_the_hit() {
        if !tracing_available() {
            eprintln!("strace unavailable, skipping");
            return;
        }
        let sandbox = Sandbox::new();
        sandbox.write("input.txt", "hello");
        std::fs::write(sandbox.scratch().join("notes"), "one").unwrap();
        let script = "echo run >> ../scratch/runs; cat input.txt ../scratch/notes";

        sandbox.wrapped(script).assert().success();
        std::fs::write(sandbox.scratch().join("notes"), "two").unwrap();
        sandbox.wrapped(script).assert().success().stdout("helloone");
        assert_eq!(sandbox.runs(), 1);
    }

    #[test]
    fn recorded_exit_code_is_replayed() {
        if !tracing_available() {
            eprintln!("strace unavailable, skipping");
            return;
        }
        let sandbox = Sandbox::new();
        sandbox.write("input.txt", "hello");
        let script = "echo run >> ../scratch/runs; cat input.txt; exit 3";

        sandbox.wrapped(script).assert().code(3);
        sandbox.wrapped(script).assert().code(3).stdout("hello");
        assert_eq!(sandbox.runs(), 1);
    }

    #[test]
    fn forget_forces_rerun() {
        if !tracing_available() {
            eprintln!("strace unavailable, skipping");
            return;
        }
        let sandbox = Sandbox::new();
        sandbox.write("input.txt", "hello");
        sandbox.wrapped(READ_INPUT).assert().success();

        let mut forget = sandbox.memoize();
        forget
            .arg("--ignore-dir")
            .arg(sandbox.scratch())
            .args(["--forget", "--", "sh", "-c", READ_INPUT])
            .assert()
            .success()
            .stdout(predicate::str::contains("Forgot"));

        sandbox.wrapped(READ_INPUT).assert().success();
        assert_eq!(sandbox.runs(), 2);
    }
}
