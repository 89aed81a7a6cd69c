//! Task registry - which `project:script` runs are live right now
//!
//! The registry is the source of truth for "is it running". `stop` drops a
//! task from the maps before the kill is even issued, and a late exit
//! notification for a run that is no longer registered is ignored.

use super::handle::{ProcessHandle, SpawnSpec, TaskExit};
use super::key::TaskKey;
use super::monitor::MonitorTargets;
use super::terminator::{platform_terminator, Terminator};
use crate::events::{Event, EventSink};
use crate::workspace::{ProjectDescriptor, ProjectStatus};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum StartError {
    #[error("task {0} is already running")]
    AlreadyRunning(TaskKey),
    #[error("failed to start {key}: {source}")]
    Spawn {
        key: TaskKey,
        #[source]
        source: std::io::Error,
    },
}

/// Live tasks and their monitor targets
pub struct TaskRegistry {
    tasks: HashMap<TaskKey, ProcessHandle>,
    targets: MonitorTargets,
    terminator: Arc<dyn Terminator>,
    sink: Arc<dyn EventSink>,
    exit_tx: mpsc::UnboundedSender<TaskExit>,
    next_generation: u64,
}

impl TaskRegistry {
    /// Create a registry using the platform terminator
    pub fn new(sink: Arc<dyn EventSink>) -> (Self, mpsc::UnboundedReceiver<TaskExit>) {
        Self::with_terminator(sink, platform_terminator())
    }

    pub fn with_terminator(
        sink: Arc<dyn EventSink>,
        terminator: Arc<dyn Terminator>,
    ) -> (Self, mpsc::UnboundedReceiver<TaskExit>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        (
            Self {
                tasks: HashMap::new(),
                targets: MonitorTargets::default(),
                terminator,
                sink,
                exit_tx,
                next_generation: 1,
            },
            exit_rx,
        )
    }

    /// Spawn and register a task. Returns the root PID.
    pub fn start(&mut self, key: TaskKey, spec: SpawnSpec) -> Result<u32, StartError> {
        if self.tasks.contains_key(&key) {
            return Err(StartError::AlreadyRunning(key));
        }

        log::info!("Starting {}", key);
        let generation = self.next_generation;
        let spawned = ProcessHandle::spawn(
            &key,
            generation,
            &spec,
            self.terminator.clone(),
            self.sink.clone(),
            self.exit_tx.clone(),
        );

        let handle = match spawned {
            Ok(handle) => handle,
            Err(source) => {
                log::warn!("Failed to start {}: {}", key, source);
                self.sink.emit(Event::log(
                    &key.project,
                    format!("failed to start {}: {}", key.script, source),
                ));
                return Err(StartError::Spawn { key, source });
            }
        };

        self.next_generation += 1;
        let pid = handle.pid;
        self.targets.add(key.clone(), pid);
        self.tasks.insert(key.clone(), handle);
        self.sink.emit(Event::status(&key.project, &key.script, true));
        Ok(pid)
    }

    /// Kill every live task of a project. Returns how many were stopped.
    pub fn stop(&mut self, project: &str) -> usize {
        log::info!("Stopping all tasks of {}", project);

        let matched: Vec<TaskKey> = self
            .tasks
            .keys()
            .filter(|key| key.belongs_to(project))
            .cloned()
            .collect();

        if matched.is_empty() {
            log::warn!("Stop requested for {} but nothing is running", project);
            return 0;
        }

        for key in &matched {
            // Unregister first: observers see "stopped" even while the kill is in flight.
            let Some(handle) = self.remove(key) else {
                continue;
            };
            self.sink.emit(Event::status(&key.project, &key.script, false));
            self.sink.emit(Event::log(
                &key.project,
                format!("\r\n\x1b[31m[{} killed]\x1b[0m\r\n", key.script),
            ));
            handle.terminate();
        }
        matched.len()
    }

    /// Apply an exit notification
    pub fn handle_exit(&mut self, exit: TaskExit) {
        let current = self
            .tasks
            .get(&exit.key)
            .map(|handle| handle.generation == exit.generation)
            .unwrap_or(false);
        if !current {
            log::debug!("Ignoring exit of {} (no longer registered)", exit.key);
            return;
        }

        self.remove(&exit.key);
        log::info!("{} {}", exit.key, exit.reason);
        self.sink
            .emit(Event::status(&exit.key.project, &exit.key.script, false));
        self.sink.emit(Event::log(
            &exit.key.project,
            format!("\r\n[{} {}]\r\n", exit.key.script, exit.reason),
        ));
    }

    /// Annotate scanned projects with the scripts that are live
    pub fn reconcile(&self, projects: Vec<ProjectDescriptor>) -> Vec<ProjectStatus> {
        projects
            .into_iter()
            .map(|project| {
                let running_scripts = self
                    .tasks
                    .keys()
                    .filter(|key| key.belongs_to(&project.name))
                    .map(|key| (key.script.clone(), true))
                    .collect();
                ProjectStatus {
                    project,
                    running_scripts,
                }
            })
            .collect()
    }

    /// Kill everything. Used on process shutdown.
    pub fn shutdown(&mut self) -> usize {
        let keys: Vec<TaskKey> = self.tasks.keys().cloned().collect();
        for key in &keys {
            if let Some(handle) = self.remove(key) {
                log::info!("Terminating {} (pid {})", key, handle.pid);
                handle.terminate();
            }
        }
        keys.len()
    }

    pub fn is_running(&self, key: &TaskKey) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn get(&self, key: &TaskKey) -> Option<&ProcessHandle> {
        self.tasks.get(key)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Live keys, sorted
    pub fn running_keys(&self) -> Vec<TaskKey> {
        let mut keys: Vec<TaskKey> = self.tasks.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn targets(&self) -> &MonitorTargets {
        &self.targets
    }

    fn remove(&mut self, key: &TaskKey) -> Option<ProcessHandle> {
        self.targets.remove(key);
        self.tasks.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn registry() -> (
        TaskRegistry,
        mpsc::UnboundedReceiver<TaskExit>,
        mpsc::UnboundedReceiver<Event>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel::<Event>();
        let (registry, exits) = TaskRegistry::new(Arc::new(tx));
        (registry, exits, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn project(name: &str, scripts: &[&str]) -> ProjectDescriptor {
        ProjectDescriptor {
            name: name.to_string(),
            path: PathBuf::from(format!("/w/{}", name)),
            runner: "npm".to_string(),
            scripts: scripts
                .iter()
                .map(|s| (s.to_string(), format!("run {}", s)))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported_and_not_registered() {
        let (mut registry, _exits, mut events) = registry();
        let key = TaskKey::new("shop", "dev");

        let spec = SpawnSpec::new("devmaster-missing-runner", ".");
        let result = registry.start(key.clone(), spec);
        assert!(matches!(result, Err(StartError::Spawn { .. })));
        assert!(!registry.is_running(&key));
        assert!(registry.targets().is_empty());

        let events = drain(&mut events);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Log { name, data } => {
                assert_eq!(name, "shop");
                assert!(data.contains("failed to start dev"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_unknown_project_emits_nothing() {
        let (mut registry, _exits, mut events) = registry();
        assert_eq!(registry.stop("ghost"), 0);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_marks_only_live_scripts() {
        let (registry, _exits, _events) = registry();
        let statuses = registry.reconcile(vec![project("shop", &["dev", "build"])]);
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].running_scripts.is_empty());
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use crate::core::ExitReason;

        fn sleeper() -> SpawnSpec {
            SpawnSpec::new("sleep", ".").arg("30")
        }

        #[tokio::test]
        async fn test_duplicate_start_is_rejected_without_spawning() {
            let (mut registry, _exits, mut events) = registry();
            let key = TaskKey::new("shop", "dev");

            let pid = registry.start(key.clone(), sleeper()).unwrap();
            let second = registry.start(key.clone(), sleeper());

            assert!(matches!(second, Err(StartError::AlreadyRunning(_))));
            assert_eq!(registry.len(), 1);
            assert_eq!(registry.get(&key).unwrap().pid, pid);
            assert_eq!(drain(&mut events), vec![Event::status("shop", "dev", true)]);

            registry.shutdown();
        }

        #[tokio::test]
        async fn test_stop_unregisters_before_process_dies() {
            let (mut registry, mut exits, mut events) = registry();
            let dev = TaskKey::new("shop", "dev");
            let build = TaskKey::new("shop", "build");
            let other = TaskKey::new("blog", "dev");

            registry.start(dev.clone(), sleeper()).unwrap();
            registry.start(build.clone(), sleeper()).unwrap();
            registry.start(other.clone(), sleeper()).unwrap();
            drain(&mut events);

            assert_eq!(registry.stop("shop"), 2);

            assert!(!registry.is_running(&dev));
            assert!(!registry.is_running(&build));
            assert!(registry.is_running(&other));
            assert!(!registry.targets().contains(&dev));
            assert!(!registry.targets().contains(&build));
            assert_eq!(registry.targets().len(), 1);

            let stopped: Vec<_> = drain(&mut events)
                .into_iter()
                .filter(|e| matches!(e, Event::StatusChange { running: false, .. }))
                .collect();
            assert_eq!(stopped.len(), 2);

            // Exits of the killed runs arrive later and change nothing.
            for _ in 0..2 {
                let exit = exits.recv().await.unwrap();
                registry.handle_exit(exit);
            }
            assert!(drain(&mut events)
                .iter()
                .all(|e| !matches!(e, Event::StatusChange { .. })));
            assert_eq!(registry.len(), 1);

            registry.shutdown();
        }

        #[tokio::test]
        async fn test_stale_exit_does_not_remove_restarted_task() {
            let (mut registry, mut exits, mut events) = registry();
            let key = TaskKey::new("shop", "dev");

            registry.start(key.clone(), sleeper()).unwrap();
            registry.stop("shop");
            let restarted = registry.start(key.clone(), sleeper()).unwrap();
            drain(&mut events);

            let stale = exits.recv().await.unwrap();
            registry.handle_exit(stale);

            assert!(registry.is_running(&key));
            assert_eq!(registry.get(&key).unwrap().pid, restarted);
            assert!(drain(&mut events).is_empty());

            registry.shutdown();
        }

        #[tokio::test]
        async fn test_reconcile_reports_running_scripts() {
            let (mut registry, _exits, _events) = registry();
            registry
                .start(TaskKey::new("shop", "build:prod"), sleeper())
                .unwrap();

            let statuses = registry.reconcile(vec![
                project("shop", &["dev", "build:prod"]),
                project("blog", &["dev"]),
            ]);

            assert_eq!(statuses[0].running_scripts.len(), 1);
            assert_eq!(statuses[0].running_scripts.get("build:prod"), Some(&true));
            assert!(statuses[1].running_scripts.is_empty());

            registry.shutdown();
        }

        #[tokio::test]
        async fn test_environment_overlay_reaches_child() {
            let (mut registry, mut exits, mut events) = registry();
            let spec = SpawnSpec::new("sh", ".")
                .arg("-c")
                .arg("printf \"color=$FORCE_COLOR\"")
                .env("FORCE_COLOR", "1");

            registry.start(TaskKey::new("shop", "env"), spec).unwrap();
            let exit = exits.recv().await.unwrap();
            registry.handle_exit(exit);

            let output: String = drain(&mut events)
                .into_iter()
                .filter_map(|e| match e {
                    Event::Log { data, .. } => Some(data),
                    _ => None,
                })
                .collect();
            assert!(output.contains("color=1"));
        }

        #[tokio::test]
        async fn test_shutdown_kills_everything() {
            let (mut registry, mut exits, _events) = registry();
            registry.start(TaskKey::new("a", "dev"), sleeper()).unwrap();
            registry.start(TaskKey::new("b", "dev"), sleeper()).unwrap();

            assert_eq!(registry.shutdown(), 2);
            assert!(registry.is_empty());
            assert!(registry.targets().is_empty());

            for _ in 0..2 {
                let exit = exits.recv().await.unwrap();
                assert!(matches!(exit.reason, ExitReason::Signal(_)));
            }
        }
    }
}
