//! Explain command - report hit or miss without running anything

use crate::engine::{Engine, Verdict};
use crate::error::MemoizeResult;
use crate::invocation::Invocation;
use console::style;

/// Exit code when the command would be skipped
pub const EXIT_WOULD_HIT: i32 = 0;

/// Exit code when the command would run
pub const EXIT_WOULD_RUN: i32 = 1;

/// Execute the explain command
pub async fn execute(engine: &Engine, invocation: &Invocation) -> MemoizeResult<i32> {
    let key = invocation.signature();
    println!("{}: {}", style("Command").bold(), invocation.display_command());
    println!("{}: {}", style("Directory").bold(), invocation.cwd().display());
    println!("{}: {}", style("Signature").bold(), key);

    match engine.explain(invocation).await? {
        Verdict::Hit(entry) => {
            println!(
                "{} would skip; {} files unchanged since {} (exit {})",
                style("[HIT]").green(),
                entry.files.len(),
                entry.recorded_at.format("%Y-%m-%d %H:%M:%S UTC"),
                entry.exit_code
            );
            for file in &entry.files {
                println!(
                    "  {} {} {}",
                    style(file.role).dim(),
                    file.digest.short(),
                    file.path.display()
                );
            }
            Ok(EXIT_WOULD_HIT)
        }
        Verdict::Miss(reason) => {
            println!("{} would run: {}", style("[MISS]").yellow(), reason);
            if !engine.is_tracking() {
                println!("  (tracing is unavailable; runs are never cached)");
            }
            Ok(EXIT_WOULD_RUN)
        }
    }
}
