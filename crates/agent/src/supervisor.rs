// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child-process supervision for the external media pipelines.
//!
//! Spawns a process with a fixed argument vector and a restricted
//! environment, forwards line-oriented stdout/stderr, and reports the exit
//! reason exactly once through a watch channel.

use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// How an exited child finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// What to do with the child's stdout.
pub enum StdoutMode {
    /// Discard.
    Ignore,
    /// Deliver newline-chunked lines to the sender.
    Lines(mpsc::Sender<String>),
    /// Hand the raw pipe to the caller (frame streams).
    Raw,
}

/// Spawn parameters for one supervised child.
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment on top of the restricted base (PATH only).
    pub env: Vec<(String, String)>,
    pub stdout: StdoutMode,
    /// Newline-chunked stderr lines, if wanted.
    pub stderr: Option<mpsc::Sender<String>>,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            stdout: StdoutMode::Ignore,
            stderr: None,
        }
    }

    pub fn with_stdout(mut self, mode: StdoutMode) -> Self {
        self.stdout = mode;
        self
    }

    pub fn with_stderr(mut self, tx: mpsc::Sender<String>) -> Self {
        self.stderr = Some(tx);
        self
    }
}

/// Handle to a spawned child.
///
/// The exit status is published exactly once; `wait` can be called any
/// number of times and always resolves to that same status.
pub struct ChildHandle {
    pid: u32,
    stdout: Option<ChildStdout>,
    exit: watch::Receiver<Option<ExitStatus>>,
}

/// Spawn a child per `spec`.
pub fn spawn(spec: SpawnSpec) -> anyhow::Result<ChildHandle> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);

    // Media children get a minimal environment: inherited PATH plus
    // whatever the spec adds.
    cmd.env_clear();
    if let Ok(path) = std::env::var("PATH") {
        cmd.env("PATH", path);
    }
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(match spec.stdout {
        StdoutMode::Ignore => Stdio::null(),
        StdoutMode::Lines(_) | StdoutMode::Raw => Stdio::piped(),
    });
    cmd.stderr(if spec.stderr.is_some() { Stdio::piped() } else { Stdio::null() });
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning {} {:?}", spec.program, spec.args))?;
    let pid = child.id().context("child has no pid")?;
    debug!(program = %spec.program, pid, "spawned child");

    let mut raw_stdout = None;
    match spec.stdout {
        StdoutMode::Lines(tx) => {
            if let Some(pipe) = child.stdout.take() {
                tokio::spawn(forward_lines(pipe, tx));
            }
        }
        StdoutMode::Raw => raw_stdout = child.stdout.take(),
        StdoutMode::Ignore => {}
    }
    if let Some(tx) = spec.stderr {
        if let Some(pipe) = child.stderr.take() {
            tokio::spawn(forward_lines(pipe, tx));
        }
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(async move {
        let status = match child.wait().await {
            Ok(status) => ExitStatus {
                code: status.code(),
                signal: std::os::unix::process::ExitStatusExt::signal(&status),
            },
            Err(_) => ExitStatus { code: None, signal: None },
        };
        debug!(pid, code = ?status.code, signal = ?status.signal, "child exited");
        let _ = exit_tx.send(Some(status));
    });

    Ok(ChildHandle { pid, stdout: raw_stdout, exit: exit_rx })
}

async fn forward_lines<R>(pipe: R, tx: mpsc::Sender<String>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

impl ChildHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The raw stdout pipe, when spawned with [`StdoutMode::Raw`].
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Wait until the child has exited.
    pub async fn wait(&self) -> ExitStatus {
        let mut exit = self.exit.clone();
        loop {
            if let Some(status) = *exit.borrow() {
                return status;
            }
            if exit.changed().await.is_err() {
                let fallback = exit.borrow().unwrap_or(ExitStatus { code: None, signal: None });
                return fallback;
            }
        }
    }

    /// Exit status, if the child has already been reaped.
    pub fn try_exit(&self) -> Option<ExitStatus> {
        *self.exit.borrow()
    }

    /// Deliver a signal. A no-op once the child has exited.
    pub fn signal(&self, sig: Signal) {
        if self.try_exit().is_some() {
            return;
        }
        if let Ok(pid) = i32::try_from(self.pid) {
            let _ = kill(Pid::from_raw(pid), sig);
        }
    }

    /// Graceful stop: SIGINT, wait up to `grace`, then SIGKILL.
    pub async fn stop(&self, grace: Duration) -> ExitStatus {
        self.signal(Signal::SIGINT);
        if let Ok(status) = tokio::time::timeout(grace, self.wait()).await {
            return status;
        }
        self.signal(Signal::SIGKILL);
        self.wait().await
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
