//! Bounded-deadline external command execution.
//!
//! Every system driver call goes through [`run_command`]: the child gets
//! piped stdio (never the daemon's descriptors), a hard deadline, and its
//! stderr captured into the error on failure.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{DriverError, Result};

/// Captured output of a completed command.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `program` with `args`, failing if it does not complete within
/// `deadline` or exits non-zero.
pub async fn run_command(program: &str, args: &[&str], deadline: Duration) -> Result<CommandOutput> {
    let rendered = format!("{} {}", program, args.join(" "));
    debug!(command = %rendered, deadline_secs = deadline.as_secs(), "Running command");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match timeout(deadline, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(DriverError::Unreachable(format!(
                "failed to spawn {}: {}",
                rendered, e
            )))
        }
        Err(_) => return Err(DriverError::Timeout(rendered)),
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if output.status.success() {
        Ok(CommandOutput { stdout, stderr })
    } else {
        Err(DriverError::CommandFailed {
            command: rendered,
            status: output.status.code().unwrap_or(-1),
            stderr: stderr.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_successful_command_captures_stdout() {
        let out = run_command("echo", &["hello"], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_failing_command_captures_stderr() {
        let err = run_command("ls", &["/definitely/not/a/path"], Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            DriverError::CommandFailed { status, stderr, .. } => {
                assert_ne!(status, 0);
                assert!(!stderr.is_empty());
            }
            other => panic!("expected CommandFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deadline_enforced() {
        let err = run_command("sleep", &["5"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unreachable() {
        let err = run_command("pvc-no-such-binary", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Unreachable(_)));
    }
}
