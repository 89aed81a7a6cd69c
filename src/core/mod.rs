//! Core engine - task registry, process handles, tree termination, monitoring

mod handle;
mod key;
pub mod monitor;
mod orchestrator;
mod registry;
pub mod terminator;

pub use handle::{ExitReason, ProcessHandle, SpawnSpec, TaskExit, COLOR_ENV};
pub use key::TaskKey;
pub use monitor::{
    MonitorTargets, ResourceMonitor, SampleError, SysinfoProbe, TaskUsage, UsageProbe,
    DEFAULT_INTERVAL_MS,
};
pub use orchestrator::Orchestrator;
pub use registry::{StartError, TaskRegistry};
pub use terminator::{platform_terminator, SpawnMode, Terminator};
