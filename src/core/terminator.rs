//! Tree terminator - kill a process and everything it spawned
//!
//! Two strategies, picked once per platform and handed to every spawned
//! process:
//! - Unix: the child leads a fresh process group; `SIGKILL` goes to the group.
//! - Windows: `taskkill /f /t` walks the tree from the leader PID.
//!
//! Termination is best effort and never blocks the caller. "No such process"
//! means the work is already done.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;

/// How a child was placed relative to its descendants at spawn time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMode {
    /// Child leads its own process group
    Grouped,
    /// Child is killed through the OS tree-kill facility
    Tree,
}

impl fmt::Display for SpawnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grouped => write!(f, "grouped"),
            Self::Tree => write!(f, "tree"),
        }
    }
}

/// Result of a kill request that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Kill signal delivered
    Signalled,
    /// Kill handed off to an external facility; completion is not observed
    Requested,
    /// Nothing left to kill
    AlreadyGone,
}

#[derive(Error, Debug)]
pub enum TerminateError {
    #[error("pid {0} does not fit a process group id")]
    InvalidPid(u32),
    #[cfg(unix)]
    #[error("failed to signal process group {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },
    #[error("failed to launch tree kill for pid {pid}: {source}")]
    Launch {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Capability to kill a whole process tree
pub trait Terminator: Send + Sync + fmt::Debug {
    /// Spawn mode this terminator relies on
    fn mode(&self) -> SpawnMode;

    /// Configure a command before spawn so that `terminate` can reach its tree
    fn prepare(&self, cmd: &mut Command);

    /// Kill the tree rooted at `pid`
    fn terminate(&self, pid: u32) -> Result<Termination, TerminateError>;
}

/// Kill the whole process group led by the child
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct ProcessGroupTerminator;

#[cfg(unix)]
impl Terminator for ProcessGroupTerminator {
    fn mode(&self) -> SpawnMode {
        SpawnMode::Grouped
    }

    fn prepare(&self, cmd: &mut Command) {
        cmd.process_group(0);
    }

    fn terminate(&self, pid: u32) -> Result<Termination, TerminateError> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid).map_err(|_| TerminateError::InvalidPid(pid))?;
        if raw <= 0 {
            return Err(TerminateError::InvalidPid(pid));
        }

        match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) => Ok(Termination::Signalled),
            Err(Errno::ESRCH) => Ok(Termination::AlreadyGone),
            Err(source) => Err(TerminateError::Signal { pid, source }),
        }
    }
}

/// Exit status taskkill uses when the target does not exist
const TASKKILL_NOT_FOUND: i32 = 128;

/// Delegate to `taskkill /pid <pid> /f /t`
#[derive(Debug, Default)]
pub struct TaskkillTerminator;

impl Terminator for TaskkillTerminator {
    fn mode(&self) -> SpawnMode {
        SpawnMode::Tree
    }

    fn prepare(&self, _cmd: &mut Command) {}

    fn terminate(&self, pid: u32) -> Result<Termination, TerminateError> {
        let child = Command::new("taskkill")
            .args(["/pid", &pid.to_string(), "/f", "/t"])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|source| TerminateError::Launch { pid, source })?;

        tokio::spawn(async move {
            match child.wait_with_output().await {
                Ok(output) if output.status.success() => {
                    log::debug!("taskkill finished for pid {}", pid);
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    if output.status.code() == Some(TASKKILL_NOT_FOUND)
                        || stderr.contains("not found")
                    {
                        log::debug!("taskkill: pid {} already gone", pid);
                    } else {
                        log::error!("taskkill failed for pid {}: {}", pid, stderr.trim());
                    }
                }
                Err(e) => log::error!("taskkill for pid {} did not complete: {}", pid, e),
            }
        });

        Ok(Termination::Requested)
    }
}

/// The strongest terminator available on this platform
pub fn platform_terminator() -> Arc<dyn Terminator> {
    #[cfg(unix)]
    {
        Arc::new(ProcessGroupTerminator)
    }
    #[cfg(not(unix))]
    {
        Arc::new(TaskkillTerminator)
    }
}
