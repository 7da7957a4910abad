//! Shared plumbing for driving external tools.
//!
//! All pipeline subprocesses go through here: piped output, a wall-clock
//! limit with forced kill, and exit-status mapping. A zero exit code is
//! necessary but never sufficient; callers validate artifacts themselves.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, error};

use crate::error::{PipelineError, Result};

/// Output of a completed subprocess run.
#[derive(Debug)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `cmd` to completion, enforcing `limit`. The child is killed if the
/// limit expires. Non-zero exit maps to [`PipelineError::ProcessFailed`] with
/// a stderr tail for operators.
pub async fn run_with_timeout(
    mut cmd: Command,
    tool: &str,
    limit: Duration,
) -> Result<ProcessOutput> {
    debug!(tool, ?limit, "spawning {:?}", cmd.as_std());

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PipelineError::MissingBinary(tool.to_string()),
            _ => PipelineError::Io(e),
        })?;

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    // Drain both pipes concurrently with the wait; a child blocked writing a
    // full stderr pipe must not stall the stdout reader.
    let waited = tokio::time::timeout(limit, async {
        let (stdout, stderr, status) = tokio::join!(
            drain_pipe(stdout_pipe),
            drain_pipe(stderr_pipe),
            child.wait()
        );
        (status, stdout, stderr)
    })
    .await;

    let (status, stdout, stderr) = match waited {
        Ok((status, stdout, stderr)) => (status?, stdout, stderr),
        Err(_) => {
            error!(tool, ?limit, "wall-clock limit expired, killing process");
            let _ = child.kill().await;
            return Err(PipelineError::ProcessTimeout {
                tool: tool.to_string(),
                timeout: limit,
            });
        }
    };

    if !status.success() {
        let exit_code = status.code().unwrap_or(-1);
        return Err(PipelineError::ProcessFailed {
            tool: tool.to_string(),
            status: exit_code,
            detail: tail(&stderr, 10),
        });
    }

    Ok(ProcessOutput { stdout, stderr })
}

async fn drain_pipe<R>(pipe: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buf).await;
    }
    buf
}

/// Last `n` lines of a process stream, for error messages.
pub fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Verify an external binary exists and runs. Called once at startup;
/// a missing binary is fatal before any work begins.
pub async fn ensure_binary(path: &str) -> Result<()> {
    let mut cmd = Command::new(path);
    cmd.arg("-version");
    match run_with_timeout(cmd, path, Duration::from_secs(15)).await {
        Ok(_) => Ok(()),
        // Tools disagree on the version flag; a clean exit with either
        // spelling proves the binary is present and executable.
        Err(PipelineError::ProcessFailed { .. }) => {
            let mut cmd = Command::new(path);
            cmd.arg("--version");
            run_with_timeout(cmd, path, Duration::from_secs(15))
                .await
                .map(|_| ())
                .map_err(|_| PipelineError::MissingBinary(path.to_string()))
        }
        Err(_) => Err(PipelineError::MissingBinary(path.to_string())),
    }
}
