//! Process supervision for language-server subprocesses
//!
//! Spawns the server with piped stdio, hands its stdin/stdout to the RPC
//! session, and keeps draining stderr on a background task so a chatty
//! server can never stall on a full pipe. Termination is cooperative first
//! (SIGTERM), forced after the grace period (SIGKILL), and always returns.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Lines of stderr retained for error context.
const STDERR_TAIL_LINES: usize = 50;

/// Hard ceiling on waiting for a SIGKILLed process to be reaped.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Everything needed to launch one language server.
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: PathBuf,
}

impl ProcessCommand {
    /// One-line rendering for logs and error messages.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Subprocess lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Degraded,
    Stopped,
    Crashed,
}

/// Result of a non-blocking health poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessHealth {
    Alive,
    Exited(Option<i32>),
}

/// One running language-server subprocess. Owned by the facade; its
/// stdin/stdout are taken exactly once by the RPC session.
pub struct ServerProcessHandle {
    name: String,
    child: Child,
    pid: Option<u32>,
    state: ProcessState,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl ServerProcessHandle {
    /// Spawn a language server. Fails with [`Error::Launch`] when the
    /// executable cannot be found or started.
    pub fn spawn(name: &str, command: &ProcessCommand) -> Result<Self> {
        tracing::info!("spawning language server '{}': {}", name, command.display());

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| Error::Launch {
            command: command.display(),
            source: e,
        })?;

        let pid = child.id();
        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));

        // Keep the pipe drained regardless of what else the session is
        // doing; stderr is diagnostic output, never parsed for correctness.
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("[{} stderr] {}", name, line);
                    let mut tail = match tail.lock() {
                        Ok(tail) => tail,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tracing::debug!("[{}] stderr drain ended", name);
            });
        }

        Ok(Self {
            name: name.to_string(),
            child,
            pid,
            state: ProcessState::Starting,
            stderr_tail,
        })
    }

    /// Take the communication streams. Valid exactly once, right after
    /// spawn.
    pub fn take_streams(&mut self) -> Option<(ChildStdin, ChildStdout)> {
        let stdin = self.child.stdin.take()?;
        let stdout = self.child.stdout.take()?;
        Some((stdin, stdout))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    /// The last lines the server wrote to stderr, oldest first.
    pub fn stderr_tail(&self) -> Vec<String> {
        match self.stderr_tail.lock() {
            Ok(tail) => tail.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Non-blocking poll of the subprocess. Flips the lifecycle state to
    /// Crashed when a running process turns out to have exited.
    pub fn health_check(&mut self) -> ProcessHealth {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                if matches!(
                    self.state,
                    ProcessState::Starting | ProcessState::Running | ProcessState::Degraded
                ) {
                    tracing::warn!(
                        "language server '{}' exited unexpectedly with {:?}",
                        self.name,
                        status.code()
                    );
                    self.state = ProcessState::Crashed;
                }
                ProcessHealth::Exited(status.code())
            }
            Ok(None) => ProcessHealth::Alive,
            Err(e) => {
                tracing::warn!("health check for '{}' failed: {}", self.name, e);
                ProcessHealth::Exited(None)
            }
        }
    }

    /// Terminate the subprocess: SIGTERM, wait out the grace period, then
    /// SIGKILL. Never raises; a forced kill is logged, not an error. Control
    /// returns once the process is confirmed dead or after a hard ceiling.
    pub async fn terminate(&mut self, grace: Duration) {
        if let Ok(Some(status)) = self.child.try_wait() {
            tracing::debug!(
                "language server '{}' already exited with {:?}",
                self.name,
                status.code()
            );
            if self.state != ProcessState::Crashed {
                self.state = ProcessState::Stopped;
            }
            return;
        }

        if let Some(pid) = self.pid {
            // Cooperative shutdown request at the OS level; the protocol
            // level shutdown/exit sequence has already run by now.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(
                    "language server '{}' exited after SIGTERM with {:?}",
                    self.name,
                    status.code()
                );
                self.state = ProcessState::Stopped;
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!("waiting for '{}' failed: {}", self.name, e);
            }
            Err(_) => {
                tracing::warn!(
                    "language server '{}' ignored SIGTERM for {:?}, killing",
                    self.name,
                    grace
                );
            }
        }

        match timeout(KILL_WAIT, self.child.kill()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("failed to kill '{}': {}", self.name, e),
            Err(_) => tracing::warn!("kill of '{}' did not complete within {:?}", self.name, KILL_WAIT),
        }
        self.state = ProcessState::Stopped;
    }
}

impl std::fmt::Debug for ServerProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerProcessHandle")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .finish()
    }
}
