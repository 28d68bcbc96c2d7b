//! Supervised codec child process.
//!
//! Each feed owns at most one live decoder and one live encoder. The handle
//! lives behind a feed-local async mutex; stdin writes go through the handle
//! so they can verify the process is still present and its stdin open.
//! Teardown is staged: close stdin, wait 2 s, SIGTERM, wait 1 s, kill.

use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to spawn {role}: {source}")]
    Spawn {
        role: &'static str,
        source: std::io::Error,
    },

    #[error("{role} has no stdin pipe")]
    StdinUnavailable { role: &'static str },

    #[error("{role} has no stdout pipe")]
    StdoutUnavailable { role: &'static str },

    #[error("write to {role} stdin failed: {source}")]
    StdinWrite {
        role: &'static str,
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct SupervisedChild {
    role: &'static str,
    child: Child,
    stdin: Option<ChildStdin>,
}

impl SupervisedChild {
    /// Spawn `program` with the given arguments and piped stdio. Stderr is
    /// discarded; the codec engine's own log noise is not ours to relay.
    pub fn spawn(
        role: &'static str,
        program: &str,
        args: &[String],
        capture_stdout: bool,
    ) -> Result<Self, ProcessError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(if capture_stdout { Stdio::piped() } else { Stdio::null() })
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|source| ProcessError::Spawn { role, source })?;

        let stdin = child.stdin.take();
        info!(role, pid = ?child.id(), "Codec child started");

        Ok(SupervisedChild { role, child, stdin })
    }

    pub fn role(&self) -> &'static str {
        self.role
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Take ownership of the stdout pipe for a dedicated reader task
    pub fn take_stdout(&mut self) -> Result<ChildStdout, ProcessError> {
        self.child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutUnavailable { role: self.role })
    }

    /// Write a full buffer to the child's stdin. The caller must hold the
    /// feed mutex guarding this handle; the check-then-write here is what the
    /// mutex makes atomic with respect to teardown.
    pub async fn write_stdin(&mut self, buf: &[u8]) -> Result<(), ProcessError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or(ProcessError::StdinUnavailable { role: self.role })?;
        stdin
            .write_all(buf)
            .await
            .map_err(|source| ProcessError::StdinWrite { role: self.role, source })
    }

    /// Close stdin, signalling EOF to the child
    pub fn close_stdin(&mut self) {
        if self.stdin.take().is_some() {
            debug!(role = self.role, "Closed child stdin");
        }
    }

    /// True if the process has not yet exited
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Staged teardown: stdin-close, 2 s grace, SIGTERM, 1 s, then kill.
    pub async fn stop(mut self) {
        let role = self.role;
        let pid = self.child.id();
        self.close_stdin();

        if tokio::time::timeout(Duration::from_secs(2), self.child.wait())
            .await
            .is_ok()
        {
            debug!(role, ?pid, "Codec child exited after stdin close");
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        if tokio::time::timeout(Duration::from_secs(1), self.child.wait())
            .await
            .is_ok()
        {
            debug!(role, ?pid, "Codec child exited after SIGTERM");
            return;
        }

        warn!(role, ?pid, "Codec child unresponsive, killing");
        let _ = self.child.kill().await;
    }
}
