//! Event streaming - outbound notifications for control channel observers
//!
//! The core never talks to a transport directly. Everything it has to say
//! goes through an [`EventSink`], one JSON-serializable [`Event`] at a time.

use crate::core::TaskUsage;
use crate::workspace::ProjectStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Events emitted by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum Event {
    /// A task entered or left the running state
    StatusChange {
        name: String,
        script: String,
        running: bool,
    },
    /// Output (or a lifecycle notice) for a project
    Log { name: String, data: String },
    /// Aggregated resource usage keyed by `project:script`
    #[serde(rename = "monitor:update")]
    MonitorUpdate(BTreeMap<String, TaskUsage>),
    /// Scan result annotated with live scripts
    ProjectsLoaded(Vec<ProjectStatus>),
}

impl Event {
    pub fn status(name: &str, script: &str, running: bool) -> Self {
        Event::StatusChange {
            name: name.to_string(),
            script: script.to_string(),
            running,
        }
    }

    pub fn log(name: &str, data: impl Into<String>) -> Self {
        Event::Log {
            name: name.to_string(),
            data: data.into(),
        }
    }

    /// Serialize to JSON line
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Anything that can receive outbound events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

impl EventSink for mpsc::UnboundedSender<Event> {
    fn emit(&self, event: Event) {
        let _ = self.send(event);
    }
}

/// Write events as JSON lines, in emission order, until every sink is gone.
///
/// The channel is unbounded so a slow reader never costs a lifecycle event.
pub async fn write_events<W>(mut rx: mpsc::UnboundedReceiver<Event>, mut out: W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = rx.recv().await {
        let mut line = match event.to_json_line() {
            Ok(line) => line,
            Err(e) => {
                log::error!("Dropping unserializable event {:?}: {}", event, e);
                continue;
            }
        };
        line.push('\n');
        out.write_all(line.as_bytes()).await?;
        out.flush().await?;
    }
    Ok(())
}
