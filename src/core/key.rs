//! Task identity - `project:script`

use serde::{Deserialize, Serialize};
use std::fmt;

/// Delimiter used when a key is rendered for the wire
pub const KEY_DELIMITER: char = ':';

/// Identity of one supervised script run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub project: String,
    pub script: String,
}

impl TaskKey {
    pub fn new(project: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            script: script.into(),
        }
    }

    /// Whether this key belongs to the given project
    pub fn belongs_to(&self, project: &str) -> bool {
        self.project == project
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.project, KEY_DELIMITER, self.script)
    }
}
