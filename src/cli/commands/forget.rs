//! Forget command - drop the recorded entry

use crate::engine::Engine;
use crate::error::MemoizeResult;
use crate::invocation::Invocation;
use console::style;

/// Execute the forget command
pub async fn execute(engine: &Engine, invocation: &Invocation) -> MemoizeResult<i32> {
    if engine.forget(invocation).await? {
        println!(
            "{} Forgot {}",
            style("[OK]").green(),
            invocation.display_command()
        );
    } else {
        println!("No entry for {}", invocation.display_command());
    }
    Ok(0)
}
