//! DevMaster - supervise script-based dev projects
//!
//! Discovers `package.json` projects, launches their scripts, streams their
//! output, samples CPU/memory across each process tree and kills whole trees
//! on request. Everything is driven by [`control::Command`]s and reported as
//! [`events::Event`]s.

pub mod config;
pub mod control;
pub mod core;
pub mod events;
pub mod workspace;

// Re-exports
pub use config::Config;
pub use control::Command;
pub use core::{Orchestrator, SpawnSpec, StartError, TaskKey, TaskRegistry, TaskUsage};
pub use events::{write_events, Event, EventSink};
pub use workspace::{ProjectDescriptor, ProjectStatus, Scanner};

/// Result type alias
pub type Result<T> = anyhow::Result<T>;
