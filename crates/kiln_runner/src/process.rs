//! Process-based command runner.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::command::{CommandOutput, CommandSpec};
use crate::error::{RunnerError, RunnerResult};
use crate::runner::CommandRunner;

/// Runs commands as local child processes.
///
/// Calls block the current deploy step until the child exits; there is no
/// timeout.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    /// Environment applied to every command before the spec's own variables
    env: BTreeMap<String, String>,
}

impl ProcessRunner {
    /// Create a runner that inherits the current process environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an environment variable passed to every command.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn build_command(&self, spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.envs(&self.env);
        cmd.envs(&spec.env);

        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        if spec.input.is_some() {
            cmd.stdin(Stdio::piped());
        } else if spec.capture_output {
            cmd.stdin(Stdio::null());
        } else {
            cmd.stdin(Stdio::inherit());
        }

        if spec.capture_output {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }

        cmd
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> RunnerResult<CommandOutput> {
        let command_line = spec.display();
        info!("Running: {}", command_line);

        let started_at = Utc::now();
        let start = Instant::now();

        let mut child = self
            .build_command(spec)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                command: command_line.clone(),
                source,
            })?;

        if let Some(input) = &spec.input {
            // stdin is closed when the handle drops, before we wait
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
            }
        }

        let output = child.wait_with_output().await?;
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            started_at,
            finished_at: Utc::now(),
            duration_ms,
        };

        if result.success() {
            debug!("`{}` finished in {}ms", command_line, duration_ms);
        } else {
            warn!("`{}` exited with code {}", command_line, result.exit_code);
        }

        result.checked(spec)
    }
}
