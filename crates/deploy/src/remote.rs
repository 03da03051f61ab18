//! Command execution on fleet hosts.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use backon::{ConstantBuilder, Retryable};

use crate::error::DeployError;
use crate::inventory::VirtualMachine;

/// Exit status and captured output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the command was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a non-zero exit into an error naming the binary.
    pub fn check(self, binary: &str) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(anyhow::Error::new(DeployError::ExternalCommandFailed {
            binary: binary.to_string(),
            exit_code: self.exit_code,
        })
        .context(self.stderr.trim().to_string()))
    }
}

/// Runs commands on a fleet host.
///
/// Implementations return `Err` only when the command could not be run at all. A command
/// that ran and exited non-zero is reported through [`CommandOutput::exit_code`].
pub trait RemoteExecutor: Send + Sync {
    fn run(
        &self,
        host: &VirtualMachine,
        user: &str,
        args: &[String],
    ) -> impl Future<Output = Result<CommandOutput>> + Send;
}

/// Executes commands over `ssh`.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    private_key_path: PathBuf,
    connect_timeout: Duration,
}

impl SshExecutor {
    pub fn new(private_key_path: impl Into<PathBuf>) -> Self {
        Self {
            private_key_path: private_key_path.into(),
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn ssh_args(&self, host: &VirtualMachine, user: &str, args: &[String]) -> Vec<String> {
        let mut ssh = vec![
            "-i".to_string(),
            self.private_key_path.display().to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
            format!("{user}@{}", host.public_ip),
        ];
        // The node manager needs root to manage system services.
        if user != "root" {
            ssh.push("sudo".to_string());
        }
        ssh.extend(args.iter().cloned());
        ssh
    }
}

impl RemoteExecutor for SshExecutor {
    async fn run(&self, host: &VirtualMachine, user: &str, args: &[String]) -> Result<CommandOutput> {
        tracing::debug!(host = %host.public_ip, command = %args.join(" "), "Running remote command");

        let output = tokio::process::Command::new("ssh")
            .args(self.ssh_args(host, user, args))
            .output()
            .await
            .with_context(|| format!("Failed to spawn ssh to {}", host.public_ip))?;

        let output = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        // ssh itself exits with 255 when the connection fails.
        if output.exit_code == Some(255) {
            anyhow::bail!(
                "Could not connect to {}: {}",
                host.public_ip,
                output.stderr.trim()
            );
        }

        Ok(output)
    }
}

/// Fixed-delay retry for idempotent remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            attempts: 0,
            delay: Duration::ZERO,
        }
    }

    /// Run `op` until it succeeds or the attempts are exhausted.
    pub async fn retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let backoff = ConstantBuilder::default()
            .with_delay(self.delay)
            .with_max_times(self.attempts);

        op.retry(backoff)
            .notify(|err, delay| {
                tracing::warn!(what, error = %err, delay = ?delay, "Retrying...");
            })
            .await
    }

    /// Run a remote command, retrying while it cannot be run or exits non-zero.
    pub async fn run_checked<R: RemoteExecutor>(
        &self,
        executor: &R,
        host: &VirtualMachine,
        user: &str,
        args: &[String],
    ) -> Result<CommandOutput> {
        let binary = args.first().map(String::as_str).unwrap_or_default();
        self.retry(binary, || async {
            executor.run(host, user, args).await?.check(binary)
        })
        .await
    }
}
