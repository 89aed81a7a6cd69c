//! Orchestrator - the single event loop that owns all task state
//!
//! Commands, exit notifications, scan results and monitor ticks are handled
//! one at a time on this loop, so the registry needs no locking. Anything
//! slow (process I/O, directory walks, usage sampling) runs elsewhere and
//! reports back through a channel.

use super::handle::SpawnSpec;
use super::key::TaskKey;
use super::monitor::{MonitorLoop, ResourceMonitor};
use super::registry::{StartError, TaskRegistry};
use super::TaskExit;
use crate::config::Config;
use crate::control::Command;
use crate::events::{Event, EventSink};
use crate::workspace::{ProjectDescriptor, Scanner};
use anyhow::Result;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

pub struct Orchestrator {
    config: Config,
    registry: TaskRegistry,
    exits: mpsc::UnboundedReceiver<TaskExit>,
    monitor: MonitorLoop,
    scanner: Arc<Scanner>,
    scans_tx: mpsc::UnboundedSender<Vec<ProjectDescriptor>>,
    scans_rx: mpsc::UnboundedReceiver<Vec<ProjectDescriptor>>,
    pending_scans: usize,
    sink: Arc<dyn EventSink>,
}

impl Orchestrator {
    pub fn new(config: Config, sink: Arc<dyn EventSink>) -> Self {
        Self::with_monitor(config, sink, ResourceMonitor::default())
    }

    pub fn with_monitor(
        config: Config,
        sink: Arc<dyn EventSink>,
        monitor: ResourceMonitor,
    ) -> Self {
        let (registry, exits) = TaskRegistry::new(sink.clone());
        let (scans_tx, scans_rx) = mpsc::unbounded_channel();
        Self {
            scanner: Arc::new(config.scanner()),
            config,
            registry,
            exits,
            monitor: MonitorLoop::new(monitor),
            scans_tx,
            scans_rx,
            pending_scans: 0,
            sink,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Run until `shutdown` resolves, or until the command channel closes and
    /// in-flight scans have reported. Then kill every live task.
    pub async fn run<F>(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.monitor.start(self.sink.clone());

        let mut ticker = tokio::time::interval(self.config.monitor_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut accepting = true;
        loop {
            if !accepting && self.pending_scans == 0 {
                break;
            }
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested");
                    break;
                }
                command = commands.recv(), if accepting => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        log::info!("Control channel closed");
                        accepting = false;
                    }
                },
                Some(exit) = self.exits.recv() => self.registry.handle_exit(exit),
                Some(projects) = self.scans_rx.recv() => self.finish_scan(projects),
                _ = ticker.tick() => self.monitor.tick(self.registry.targets()),
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Dispatch one inbound command
    pub fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartTask {
                project_name,
                script,
                project_path,
                runner,
            } => {
                let runner = runner.unwrap_or_else(|| self.config.default_runner.clone());
                let spec =
                    SpawnSpec::for_script(&runner, &script, &project_path).envs(&self.config.env);
                match self.registry.start(TaskKey::new(project_name, script), spec) {
                    Ok(_) => {}
                    Err(StartError::AlreadyRunning(key)) => {
                        log::debug!("Ignoring duplicate start of {}", key);
                    }
                    // Already surfaced as a log event by the registry.
                    Err(e @ StartError::Spawn { .. }) => log::debug!("{}", e),
                }
            }
            Command::StopTask(project) => {
                self.registry.stop(&project);
            }
            Command::ScanDir(path) => self.spawn_scan(path),
        }
    }

    fn spawn_scan(&mut self, path: PathBuf) {
        self.pending_scans += 1;
        let scanner = self.scanner.clone();
        let tx = self.scans_tx.clone();
        tokio::spawn(async move {
            let projects = match tokio::task::spawn_blocking(move || scanner.scan(&path)).await {
                Ok(projects) => projects,
                Err(e) => {
                    log::error!("Scan task failed: {}", e);
                    Vec::new()
                }
            };
            let _ = tx.send(projects);
        });
    }

    fn finish_scan(&mut self, projects: Vec<ProjectDescriptor>) {
        self.pending_scans = self.pending_scans.saturating_sub(1);
        let statuses = self.registry.reconcile(projects);
        self.sink.emit(Event::ProjectsLoaded(statuses));
    }

    async fn shutdown(&mut self) {
        let killed = self.registry.shutdown();
        if killed > 0 {
            log::info!("Terminated {} running tasks", killed);
            tokio::time::sleep(self.config.shutdown_grace()).await;
        }
    }
}
