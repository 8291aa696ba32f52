use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::command::TofuCommand;
use super::output_parser;
use crate::error::BrokerError;
use crate::storage::recovery::FAILED_MESSAGE;

/// Everything needed to run one tofu subcommand.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub binary: PathBuf,
    pub dir: PathBuf,
    pub command: TofuCommand,
    /// Complete environment of the child; nothing is inherited.
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

/// Result of a tofu command execution.
#[derive(Debug, Default, Clone)]
pub struct ExecutionOutput {
    pub exit_code: i32,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

const MESSAGE_TAIL_LINES: usize = 10;

impl ExecutionOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Extract a human-readable error message from the result.
    pub fn error_message(&self) -> String {
        let json_errors = output_parser::extract_errors(&self.stdout_lines);
        if !json_errors.is_empty() {
            return json_errors.join("; ");
        }

        let stderr = tail(&self.stderr_lines, MESSAGE_TAIL_LINES);
        if !stderr.is_empty() {
            return stderr;
        }

        let stdout = tail(&self.stdout_lines, MESSAGE_TAIL_LINES);
        if !stdout.is_empty() {
            return stdout;
        }

        format!("exit code {}", self.exit_code)
    }

    pub fn stdout(&self) -> String {
        self.stdout_lines.join("\n")
    }
}

fn tail(lines: &[String], n: usize) -> String {
    let meaningful: Vec<&str> = lines
        .iter()
        .map(|l| l.trim_end())
        .filter(|l| !l.trim().is_empty())
        .collect();
    let start = meaningful.len().saturating_sub(n);
    meaningful[start..].join("\n")
}

/// Runs tofu subprocesses. Replaced by a scripted fake in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation, cancel: &CancellationToken) -> Result<ExecutionOutput>;
}

/// Spawns real processes.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation, cancel: &CancellationToken) -> Result<ExecutionOutput> {
        let args = invocation.command.args();
        tracing::info!(
            binary = %invocation.binary.display(),
            args = ?args,
            dir = %invocation.dir.display(),
            "running tofu"
        );

        let mut cmd = Command::new(&invocation.binary);
        cmd.args(&args)
            .current_dir(&invocation.dir)
            .env_clear()
            .envs(&invocation.env)
            .envs(invocation.command.env())
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn {} in {}",
                invocation.binary.display(),
                invocation.dir.display()
            )
        })?;
        let pid = child.id();

        let stdout = child.stdout.take().context("child stdout not captured")?;
        let stderr = child.stderr.take().context("child stderr not captured")?;

        let mut stdout_stream = BufReader::new(stdout).lines();
        let mut stderr_stream = BufReader::new(stderr).lines();

        let stdout_handle = tokio::spawn(async move {
            let mut lines = Vec::new();
            while let Ok(Some(line)) = stdout_stream.next_line().await {
                tracing::debug!(stream = "stdout", "{}", line);
                lines.push(line);
            }
            lines
        });
        let stderr_handle = tokio::spawn(async move {
            let mut lines = Vec::new();
            while let Ok(Some(line)) = stderr_stream.next_line().await {
                tracing::debug!(stream = "stderr", "{}", line);
                lines.push(line);
            }
            lines
        });

        let timeout = async {
            match invocation.timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                kill_process_group(pid);
                let _ = child.kill().await;
                tracing::warn!(command = invocation.command.name(), "tofu cancelled by shutdown");
                return Err(BrokerError::RecoveredFromCrash(FAILED_MESSAGE.to_string()).into());
            }
            _ = timeout => {
                kill_process_group(pid);
                let _ = child.kill().await;
                return Err(BrokerError::ExternalTool(format!(
                    "tofu {} timed out after {:?}",
                    invocation.command.name(),
                    invocation.timeout.unwrap_or_default()
                ))
                .into());
            }
        };

        let (stdout_lines, stderr_lines) = futures::try_join!(stdout_handle, stderr_handle)?;
        let exit_code = status.code().unwrap_or(-1);

        tracing::info!(exit_code = exit_code, command = invocation.command.name(), "tofu command completed");

        Ok(ExecutionOutput {
            exit_code,
            stdout_lines,
            stderr_lines,
        })
    }
}

/// SIGKILL the whole group so providers started by tofu die with it.
fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: kill() is safe to call with any pid; the child leads its own group.
        let ret = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
        if ret != 0 {
            tracing::debug!(pid, error = %std::io::Error::last_os_error(), "failed to kill process group");
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}
