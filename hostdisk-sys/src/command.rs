// SPDX-License-Identifier: GPL-3.0-only

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use hostdisk_contracts::{CommandOutput, CommandRunner, DiskError, render_command};

/// Runs host tools as child processes
#[derive(Debug, Default, Clone, Copy)]
pub struct HostCommandRunner;

impl HostCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

/// Whether `program` can be found on `PATH` (or is an existing path)
pub fn tool_available(program: &str) -> bool {
    which::which(program).is_ok()
}

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, DiskError> {
        let rendered = render_command(program, args);
        let binary = which::which(program)
            .map_err(|_| DiskError::unavailable(format!("{program} not found in PATH")))?;

        debug!(command = %rendered, "running host command");
        let output = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|error| DiskError::command_failed(&rendered, error.to_string()))?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostdisk_contracts::DiskErrorKind;

    #[tokio::test]
    async fn captures_exit_status_and_output() {
        let runner = HostCommandRunner::new();
        let output = runner.run("sh", &["-c", "echo out; echo err >&2; exit 3"]).await.unwrap();

        assert_eq!(output.status, Some(3));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn missing_tool_is_unavailable() {
        let runner = HostCommandRunner::new();
        let error = runner.run("hostdisk-no-such-tool", &[]).await.unwrap_err();
        assert_eq!(error.kind, DiskErrorKind::Unavailable);
    }
}
