//! Shell command execution for CLI-driven backends.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{InfraError, InfraResult};

/// Run a shell command and return its combined stdout.
///
/// Fails with the captured output when the command exits non-zero.
pub async fn shell_output(cmd: &str) -> InfraResult<String> {
    debug!(%cmd, "running command");
    let output = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| InfraError::Command {
            cmd: cmd.to_string(),
            output: e.to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(InfraError::Command {
            cmd: cmd.to_string(),
            output: format!("{stdout}{stderr}"),
        });
    }
    Ok(stdout)
}

/// Run a shell command feeding `input` to its stdin, returning stdout.
pub async fn shell_output_with_stdin(cmd: &str, input: &str) -> InfraResult<String> {
    debug!(%cmd, "running command with stdin");
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| InfraError::Command {
            cmd: cmd.to_string(),
            output: e.to_string(),
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| InfraError::Command {
                cmd: cmd.to_string(),
                output: format!("writing stdin: {e}"),
            })?;
        // Close stdin so the child sees EOF.
        drop(stdin);
    }

    let output = child.wait_with_output().await.map_err(|e| InfraError::Command {
        cmd: cmd.to_string(),
        output: e.to_string(),
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(InfraError::Command {
            cmd: cmd.to_string(),
            output: format!("{stdout}{stderr}"),
        });
    }
    Ok(stdout)
}
