//! Resource monitor - aggregated CPU/memory per task tree
//!
//! One sampler for all tasks. Each tick the orchestrator hands it a snapshot
//! of [`MonitorTargets`]; the sampler refreshes a persistent process table,
//! walks every root's descendants, sums their usage and emits a single
//! `monitor:update` batch. A target whose root vanished is skipped for that
//! tick without affecting the others.

use super::key::TaskKey;
use crate::events::{Event, EventSink};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use thiserror::Error;
use tokio::sync::mpsc;

/// Default sampling interval
pub const DEFAULT_INTERVAL_MS: u64 = 2000;

/// Usage of one process at the last refresh
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessUsage {
    pub cpu: f64,
    pub memory: u64,
}

/// Usage summed over a whole task tree
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskUsage {
    /// Percent of one core, rounded to one decimal
    pub cpu: f64,
    /// Resident memory in bytes
    pub memory: u64,
}

impl TaskUsage {
    fn add(&mut self, usage: ProcessUsage) {
        self.cpu += usage.cpu;
        self.memory += usage.memory;
    }

    fn rounded(self) -> Self {
        Self {
            cpu: (self.cpu * 10.0).round() / 10.0,
            memory: self.memory,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    #[error("process {0} not found")]
    NotFound(u32),
}

/// Source of process tree and usage information
pub trait UsageProbe: Send {
    /// Refresh the process table. Called once per tick before any lookup.
    fn refresh(&mut self);

    /// All transitive descendants of `root`
    fn descendants(&self, root: u32) -> Result<Vec<u32>, SampleError>;

    /// Usage of a single process, `None` if it is gone
    fn usage(&self, pid: u32) -> Option<ProcessUsage>;
}

/// `sysinfo`-backed probe. Kept alive across ticks so CPU usage is measured
/// between consecutive refreshes.
pub struct SysinfoProbe {
    system: System,
    children: HashMap<u32, Vec<u32>>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            children: HashMap::new(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageProbe for SysinfoProbe {
    fn refresh(&mut self) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );

        self.children.clear();
        for (pid, process) in self.system.processes() {
            // Threads show up as processes on Linux; they share the parent's usage.
            if process.thread_kind().is_some() {
                continue;
            }
            if let Some(parent) = process.parent() {
                self.children
                    .entry(parent.as_u32())
                    .or_default()
                    .push(pid.as_u32());
            }
        }
    }

    fn descendants(&self, root: u32) -> Result<Vec<u32>, SampleError> {
        if self.system.process(Pid::from_u32(root)).is_none() {
            return Err(SampleError::NotFound(root));
        }
        Ok(walk_descendants(root, &self.children))
    }

    fn usage(&self, pid: u32) -> Option<ProcessUsage> {
        self.system
            .process(Pid::from_u32(pid))
            .map(|process| ProcessUsage {
                cpu: process.cpu_usage() as f64,
                memory: process.memory(),
            })
    }
}

/// Breadth-first walk over a parent → children map, root excluded
pub fn walk_descendants(root: u32, children: &HashMap<u32, Vec<u32>>) -> Vec<u32> {
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    let mut found = Vec::new();

    while let Some(pid) = queue.pop_front() {
        for &child in children.get(&pid).into_iter().flatten() {
            if seen.insert(child) {
                found.push(child);
                queue.push_back(child);
            }
        }
    }
    found
}

/// Live roots to sample, keyed by task
#[derive(Debug, Default)]
pub struct MonitorTargets {
    roots: HashMap<TaskKey, u32>,
}

impl MonitorTargets {
    pub fn add(&mut self, key: TaskKey, pid: u32) {
        self.roots.insert(key, pid);
    }

    pub fn remove(&mut self, key: &TaskKey) -> Option<u32> {
        self.roots.remove(key)
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.roots.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn snapshot(&self) -> Vec<(TaskKey, u32)> {
        self.roots
            .iter()
            .map(|(key, pid)| (key.clone(), *pid))
            .collect()
    }
}

/// Aggregates usage per task tree
pub struct ResourceMonitor {
    probe: Box<dyn UsageProbe>,
}

impl ResourceMonitor {
    pub fn new(probe: Box<dyn UsageProbe>) -> Self {
        Self { probe }
    }

    /// One tick's worth of sampling; failed targets are left out
    pub fn sample(&mut self, targets: &[(TaskKey, u32)]) -> BTreeMap<String, TaskUsage> {
        let mut batch = BTreeMap::new();
        if targets.is_empty() {
            return batch;
        }

        self.probe.refresh();
        for (key, root) in targets {
            match self.sample_tree(*root) {
                Ok(usage) => {
                    batch.insert(key.to_string(), usage.rounded());
                }
                Err(e) => log::debug!("Skipping {} this tick: {}", key, e),
            }
        }
        batch
    }

    fn sample_tree(&self, root: u32) -> Result<TaskUsage, SampleError> {
        let descendants = self.probe.descendants(root)?;
        let mut total = TaskUsage::default();

        total.add(self.probe.usage(root).ok_or(SampleError::NotFound(root))?);
        // A descendant may exit between the walk and the lookup.
        for pid in descendants {
            if let Some(usage) = self.probe.usage(pid) {
                total.add(usage);
            }
        }
        Ok(total)
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new(Box::new(SysinfoProbe::new()))
    }
}

/// Handle to the background sampler worker
pub struct Sampler {
    tx: mpsc::Sender<Vec<(TaskKey, u32)>>,
}

impl Sampler {
    /// Run the monitor on a worker task, publishing non-empty batches
    pub fn spawn(monitor: ResourceMonitor, sink: Arc<dyn EventSink>) -> Self {
        // At most one snapshot waits behind a running sample; later ticks are dropped.
        let (tx, mut rx) = mpsc::channel::<Vec<(TaskKey, u32)>>(1);

        tokio::spawn(async move {
            let mut monitor = monitor;
            while let Some(targets) = rx.recv().await {
                let joined = tokio::task::spawn_blocking(move || {
                    let batch = monitor.sample(&targets);
                    (monitor, batch)
                })
                .await;

                match joined {
                    Ok((returned, batch)) => {
                        monitor = returned;
                        if !batch.is_empty() {
                            sink.emit(Event::MonitorUpdate(batch));
                        }
                    }
                    Err(e) => {
                        log::error!("Resource sampler stopped: {}", e);
                        return;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Queue a snapshot; false if the worker is busy or gone
    pub fn submit(&self, targets: Vec<(TaskKey, u32)>) -> bool {
        self.tx.try_send(targets).is_ok()
    }
}

/// Start-once wrapper around the sampler
pub struct MonitorLoop {
    pending: Option<ResourceMonitor>,
    sampler: Option<Sampler>,
}

impl MonitorLoop {
    pub fn new(monitor: ResourceMonitor) -> Self {
        Self {
            pending: Some(monitor),
            sampler: None,
        }
    }

    /// Start the worker. Returns false if it was already running.
    pub fn start(&mut self, sink: Arc<dyn EventSink>) -> bool {
        match self.pending.take() {
            Some(monitor) => {
                self.sampler = Some(Sampler::spawn(monitor, sink));
                log::info!("Resource monitor started");
                true
            }
            None => false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.sampler.is_some()
    }

    /// Hand one tick to the worker. No-op when there is nothing to sample.
    pub fn tick(&self, targets: &MonitorTargets) {
        if targets.is_empty() {
            return;
        }
        match &self.sampler {
            Some(sampler) => {
                if !sampler.submit(targets.snapshot()) {
                    log::debug!("Previous sample still running, skipping tick");
                }
            }
            None => log::warn!("Monitor tick before the sampler was started"),
        }
    }
}
