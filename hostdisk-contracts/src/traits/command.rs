// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;

use crate::DiskError;

/// Captured result of one host tool invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

pub fn render_command(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Seam through which every host command-line tool is invoked
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion; a non-zero exit is reported in the output, not as an error
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, DiskError>;

    /// Run and require success, returning stdout
    async fn run_checked(&self, program: &str, args: &[&str]) -> Result<String, DiskError> {
        let output = self.run(program, args).await?;
        if !output.success() {
            let detail = if output.stderr.trim().is_empty() {
                format!("exit status {:?}", output.status)
            } else {
                output.stderr
            };
            return Err(DiskError::command_failed(
                &render_command(program, args),
                detail,
            ));
        }
        Ok(output.stdout)
    }
}
