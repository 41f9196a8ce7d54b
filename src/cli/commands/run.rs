//! Run command - execute or skip the wrapped command

use crate::engine::{Engine, OutcomeKind};
use crate::error::{MemoizeError, MemoizeResult};
use crate::invocation::Invocation;
use crate::store::CapturedOutput;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Execute the run command, returning the exit code to report
pub async fn execute(engine: &Engine, invocation: &Invocation) -> MemoizeResult<i32> {
    let outcome = engine.run(invocation).await?;

    if outcome.kind == OutcomeKind::Hit {
        match outcome.replay {
            Some(output) => replay(&output).await?,
            None => debug!("No recorded output to replay"),
        }
    }

    Ok(outcome.exit_code)
}

/// Write recorded output back to our own stdout/stderr
async fn replay(output: &CapturedOutput) -> MemoizeResult<()> {
    write_all(tokio::io::stdout(), &output.stdout, "stdout").await?;
    write_all(tokio::io::stderr(), &output.stderr, "stderr").await
}

async fn write_all<W: AsyncWrite + Unpin>(
    mut writer: W,
    bytes: &[u8],
    name: &str,
) -> MemoizeResult<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    writer
        .write_all(bytes)
        .await
        .and(writer.flush().await)
        .map_err(|e| MemoizeError::io(format!("replaying {name}"), e))
}
