//! Control commands - inbound requests from a control channel client

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Command that a control channel client can send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum Command {
    /// Launch `<runner> run <script>` in the project directory
    #[serde(rename_all = "camelCase")]
    StartTask {
        project_name: String,
        script: String,
        project_path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        runner: Option<String>,
    },
    /// Kill every running script of a project
    StopTask(String),
    /// Scan a directory for projects
    ScanDir(PathBuf),
}

impl Command {
    /// Parse one line of the control channel
    pub fn from_json_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }

    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_task() {
        let line = r#"{"event":"start-task","payload":{"projectName":"shop","script":"dev","projectPath":"/w/shop","runner":"pnpm"}}"#;
        let cmd = Command::from_json_line(line).unwrap();
        assert_eq!(
            cmd,
            Command::StartTask {
                project_name: "shop".to_string(),
                script: "dev".to_string(),
                project_path: PathBuf::from("/w/shop"),
                runner: Some("pnpm".to_string()),
            }
        );
    }

    #[test]
    fn test_runner_is_optional() {
        let line = r#"{"event":"start-task","payload":{"projectName":"shop","script":"dev","projectPath":"/w/shop"}}"#;
        match Command::from_json_line(line).unwrap() {
            Command::StartTask { runner, .. } => assert!(runner.is_none()),
            other => panic!("wrong variant {:?}", other),
        }
    }

    #[test]
    fn test_parse_stop_and_scan() {
        let stop = Command::from_json_line(r#"{"event":"stop-task","payload":"shop"}"#).unwrap();
        assert_eq!(stop, Command::StopTask("shop".to_string()));

        let scan = Command::from_json_line(r#"  {"event":"scan-dir","payload":"/w"}  "#).unwrap();
        assert_eq!(scan, Command::ScanDir(PathBuf::from("/w")));
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        assert!(Command::from_json_line(r#"{"event":"open-file","payload":"x"}"#).is_err());
        assert!(Command::from_json_line("not json").is_err());
    }

    #[test]
    fn test_serialization_matches_parser() {
        let cmd = Command::StopTask("blog".to_string());
        let json = cmd.to_json_line().unwrap();
        assert!(json.contains("stop-task"));
        assert_eq!(Command::from_json_line(&json).unwrap(), cmd);
    }
}
