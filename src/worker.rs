//! Launching worker processes.
//!
//! The relay never touches `tokio::process` directly; it asks a
//! [`WorkerLauncher`] for a [`WorkerIo`] bundle. The production launcher spawns
//! the configured executable, tests hand back in-memory pipes.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::debug;

/// Everything needed to start one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub channel_id: String,
    pub program: String,
    pub workdir: PathBuf,
    pub model: String,
    pub resume_token: Option<String>,
}

impl LaunchSpec {
    /// Command line arguments: non-interactive, streaming JSON both ways.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-p",
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
            "--dangerously-skip-permissions",
            "--model",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(self.model.clone());
        if let Some(token) = &self.resume_token {
            args.push("--resume".to_string());
            args.push(token.clone());
        }
        args
    }
}

/// Exit observation and termination of a running worker.
#[async_trait]
pub trait WorkerControl: Send {
    /// Wait for the worker to exit on its own. Returns the exit code if any.
    async fn wait(&mut self) -> Option<i32>;

    /// Kill the worker and reap it.
    async fn kill(&mut self) -> Option<i32>;
}

/// Standard streams plus control handle of a freshly started worker.
pub struct WorkerIo {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub control: Box<dyn WorkerControl>,
}

pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<WorkerIo>;
}

/// Spawns the worker executable as a child process.
#[derive(Debug, Clone, Default)]
pub struct CommandLauncher;

impl WorkerLauncher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<WorkerIo> {
        let args = spec.args();
        debug!(channel = %spec.channel_id, program = %spec.program, ?args, "spawning worker");

        let mut child = Command::new(&spec.program)
            .args(&args)
            .current_dir(&spec.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("could not run `{}`", spec.program))?;

        let stdin = child.stdin.take().ok_or_else(|| anyhow!("stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout unavailable"))?;
        let stderr = child.stderr.take();

        Ok(WorkerIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
            control: Box::new(ChildControl(child)),
        })
    }
}

struct ChildControl(Child);

#[async_trait]
impl WorkerControl for ChildControl {
    async fn wait(&mut self) -> Option<i32> {
        self.0.wait().await.ok().and_then(|status| status.code())
    }

    async fn kill(&mut self) -> Option<i32> {
        if let Err(err) = self.0.kill().await {
            debug!(error = %err, "kill failed, worker probably gone already");
        }
        self.0.try_wait().ok().flatten().and_then(|status| status.code())
    }
}
