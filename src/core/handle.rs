//! Process handle - spawn one child, forward its output, report its exit
//!
//! Output readers and the exit waiter run as tokio tasks. The handle itself
//! only keeps identity plus the termination capability, so dropping it never
//! affects the child.

use super::key::TaskKey;
use super::terminator::{SpawnMode, Termination, Terminator};
use crate::events::{Event, EventSink};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

const READ_CHUNK: usize = 8 * 1024;

/// Forced on every script so runners keep emitting ANSI colors into pipes
pub const COLOR_ENV: (&str, &str) = ("FORCE_COLOR", "1");

/// What to launch for a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: HashMap::new(),
        }
    }

    /// `<runner> run <script>` in the project directory, with [`COLOR_ENV`] set.
    /// A later [`SpawnSpec::envs`] overlay may change its value.
    pub fn for_script(runner: &str, script: &str, project_path: &Path) -> Self {
        let program = if cfg!(windows) {
            format!("{}.cmd", runner)
        } else {
            runner.to_string()
        };
        Self::new(program, project_path)
            .arg("run")
            .arg(script)
            .env(COLOR_ENV.0, COLOR_ENV.1)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &HashMap<String, String>) -> Self {
        self.env.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Human-readable command line
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Code(i32),
    Signal(i32),
    Unknown,
}

impl From<ExitStatus> for ExitReason {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitReason::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitReason::Signal(signal);
            }
        }
        ExitReason::Unknown
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exited with code {}", code),
            Self::Signal(signal) => write!(f, "terminated by signal {}", signal),
            Self::Unknown => write!(f, "exited"),
        }
    }
}

/// Exit notification for one spawn generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExit {
    pub key: TaskKey,
    pub generation: u64,
    pub reason: ExitReason,
}

/// A live child process owned by the registry
#[derive(Debug)]
pub struct ProcessHandle {
    pub generation: u64,
    pub pid: u32,
    pub cwd: PathBuf,
    pub command: String,
    pub created_at: DateTime<Utc>,
    terminator: Arc<dyn Terminator>,
}

impl ProcessHandle {
    /// Spawn the process and wire its output and exit to the given channels
    pub fn spawn(
        key: &TaskKey,
        generation: u64,
        spec: &SpawnSpec,
        terminator: Arc<dyn Terminator>,
        sink: Arc<dyn EventSink>,
        exits: mpsc::UnboundedSender<TaskExit>,
    ) -> io::Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        terminator.prepare(&mut cmd);

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("spawned process has no pid"))?;

        log::info!(
            "Spawned {} (pid {}, {}): {}",
            key,
            pid,
            terminator.mode(),
            spec.command_line()
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let project = key.project.clone();
        let key_owned = key.clone();

        tokio::spawn(async move {
            let (status, _, _) = tokio::join!(
                child.wait(),
                forward_output(stdout, &project, sink.as_ref()),
                forward_output(stderr, &project, sink.as_ref()),
            );

            let reason = match status {
                Ok(status) => ExitReason::from(status),
                Err(e) => {
                    log::warn!("Waiting on {} failed: {}", key_owned, e);
                    ExitReason::Unknown
                }
            };

            log::debug!("{} (pid {}) {}", key_owned, pid, reason);
            let _ = exits.send(TaskExit {
                key: key_owned,
                generation,
                reason,
            });
        });

        Ok(Self {
            generation,
            pid,
            cwd: spec.cwd.clone(),
            command: spec.command_line(),
            created_at: Utc::now(),
            terminator,
        })
    }

    pub fn mode(&self) -> SpawnMode {
        self.terminator.mode()
    }

    /// Ask the OS to kill this process tree. Returns immediately.
    pub fn terminate(&self) {
        match self.terminator.terminate(self.pid) {
            Ok(Termination::AlreadyGone) => {
                log::debug!("pid {} already exited", self.pid);
            }
            Ok(outcome) => {
                log::info!("Kill issued for pid {} ({:?})", self.pid, outcome);
            }
            Err(e) => log::error!("Kill failed for pid {}: {}", self.pid, e),
        }
    }
}

/// Forward a pipe chunk by chunk as log events until EOF
async fn forward_output<R>(reader: Option<R>, project: &str, sink: &dyn EventSink)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                sink.emit(Event::log(project, data));
            }
            Err(e) => {
                log::warn!("Output stream for {} closed with error: {}", project, e);
                break;
            }
        }
    }
}
