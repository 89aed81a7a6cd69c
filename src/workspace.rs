//! Project discovery - find `package.json` projects under a directory

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Default recursion limit below the scan root
pub const DEFAULT_MAX_DEPTH: usize = 4;

/// Directories never descended into
pub const DEFAULT_IGNORED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    ".idea",
    ".vscode",
    "public",
    "uni_modules",
    "static",
];

/// Lockfile → runner, checked in order
const RUNNER_LOCKFILES: &[(&str, &str)] = &[
    ("pnpm-lock.yaml", "pnpm"),
    ("yarn.lock", "yarn"),
    ("bun.lockb", "bun"),
];

const FALLBACK_RUNNER: &str = "npm";

/// A discovered project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDescriptor {
    pub name: String,
    pub path: PathBuf,
    pub runner: String,
    pub scripts: BTreeMap<String, String>,
}

/// A project annotated with its currently running scripts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    #[serde(flatten)]
    pub project: ProjectDescriptor,
    pub running_scripts: BTreeMap<String, bool>,
}

#[derive(Debug, Deserialize)]
struct PackageManifest {
    #[serde(default)]
    scripts: BTreeMap<String, serde_json::Value>,
}

/// Bounded-depth project scanner
#[derive(Debug, Clone)]
pub struct Scanner {
    max_depth: usize,
    ignored: HashSet<String>,
}

impl Scanner {
    pub fn new(max_depth: usize, ignored: impl IntoIterator<Item = String>) -> Self {
        Self {
            max_depth,
            ignored: ignored.into_iter().collect(),
        }
    }

    /// Discover all projects under `root`. Unreadable subtrees yield nothing.
    pub fn scan(&self, root: &Path) -> Vec<ProjectDescriptor> {
        log::info!("Scanning {}", root.display());
        if !root.exists() {
            log::warn!("Scan root {} does not exist", root.display());
            return Vec::new();
        }

        let mut found = Vec::new();
        self.visit(root, 0, &mut found);
        log::info!("Scan of {} found {} projects", root.display(), found.len());
        found
    }

    fn visit(&self, dir: &Path, depth: usize, found: &mut Vec<ProjectDescriptor>) {
        if depth > self.max_depth {
            return;
        }
        if depth > 0 && self.is_ignored(dir) {
            return;
        }

        let manifest = dir.join("package.json");
        if manifest.is_file() {
            if let Some(project) = load_project(dir, &manifest) {
                found.push(project);
            }
            return;
        }

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("Skipping unreadable {}: {}", dir.display(), e);
                return;
            }
        };

        let mut subdirs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|entry| entry.path())
            .collect();
        subdirs.sort();

        for subdir in subdirs {
            self.visit(&subdir, depth + 1, found);
        }
    }

    fn is_ignored(&self, dir: &Path) -> bool {
        dir.file_name()
            .and_then(|n| n.to_str())
            .map(|name| self.ignored.contains(name))
            .unwrap_or(false)
    }
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_DEPTH,
            DEFAULT_IGNORED_DIRS.iter().map(|s| s.to_string()),
        )
    }
}

fn load_project(dir: &Path, manifest: &Path) -> Option<ProjectDescriptor> {
    let content = match fs::read_to_string(manifest) {
        Ok(content) => content,
        Err(e) => {
            log::debug!("Cannot read {}: {}", manifest.display(), e);
            return None;
        }
    };
    let parsed: PackageManifest = match serde_json::from_str(&content) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::warn!("Ignoring malformed {}: {}", manifest.display(), e);
            return None;
        }
    };

    let scripts = parsed
        .scripts
        .into_iter()
        .filter_map(|(name, command)| command.as_str().map(|c| (name, c.to_string())))
        .collect();

    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    Some(ProjectDescriptor {
        name,
        path: dir.to_path_buf(),
        runner: detect_runner(dir).to_string(),
        scripts,
    })
}

/// Pick the package runner from the lockfile present in `dir`
pub fn detect_runner(dir: &Path) -> &'static str {
    RUNNER_LOCKFILES
        .iter()
        .find(|(lockfile, _)| dir.join(lockfile).exists())
        .map(|(_, runner)| *runner)
        .unwrap_or(FALLBACK_RUNNER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_project(dir: &Path, scripts: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(
            dir.join("package.json"),
            format!(r#"{{"name":"x","scripts":{}}}"#, scripts),
        )
        .unwrap();
    }

    #[test]
    fn test_discovers_nested_projects_with_runner() {
        let temp = TempDir::new().unwrap();
        write_project(&temp.path().join("shop"), r#"{"dev":"vite","build":"vite build"}"#);
        write_project(&temp.path().join("apps/admin"), r#"{"dev":"next dev"}"#);
        fs::write(temp.path().join("apps/admin/pnpm-lock.yaml"), "").unwrap();

        let projects = Scanner::default().scan(temp.path());
        assert_eq!(projects.len(), 2);

        let admin = projects.iter().find(|p| p.name == "admin").unwrap();
        assert_eq!(admin.runner, "pnpm");
        assert_eq!(admin.scripts["dev"], "next dev");

        let shop = projects.iter().find(|p| p.name == "shop").unwrap();
        assert_eq!(shop.runner, "npm");
        assert_eq!(shop.scripts.len(), 2);
    }

    #[test]
    fn test_project_root_stops_descent() {
        let temp = TempDir::new().unwrap();
        write_project(&temp.path().join("mono"), r#"{}"#);
        write_project(&temp.path().join("mono/packages/inner"), r#"{}"#);

        let projects = Scanner::default().scan(temp.path());
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name, "mono");
    }

    #[test]
    fn test_ignored_dirs_and_depth_limit() {
        let temp = TempDir::new().unwrap();
        write_project(&temp.path().join("node_modules/lib"), r#"{}"#);
        write_project(&temp.path().join("a/b/c/d/e/deep"), r#"{}"#);
        write_project(&temp.path().join("a/b/c/shallow"), r#"{}"#);

        let projects = Scanner::default().scan(temp.path());
        let names: Vec<_> = projects.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["shallow"]);
    }

    #[test]
    fn test_malformed_manifest_does_not_hide_siblings() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("broken")).unwrap();
        fs::write(temp.path().join("broken/package.json"), "{ not json").unwrap();
        write_project(&temp.path().join("fine"), r#"{"dev":"node ."}"#);

        let projects = Scanner::default().scan(temp.path());
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name, "fine");
    }

    #[test]
    fn test_non_string_scripts_are_dropped() {
        let temp = TempDir::new().unwrap();
        write_project(&temp.path().join("odd"), r#"{"dev":"vite","weird":42}"#);

        let projects = Scanner::default().scan(temp.path());
        assert_eq!(projects[0].scripts.len(), 1);
    }

    #[test]
    fn test_missing_root_yields_nothing() {
        let temp = TempDir::new().unwrap();
        assert!(Scanner::default().scan(&temp.path().join("nope")).is_empty());
    }

    #[test]
    fn test_runner_precedence() {
        let temp = TempDir::new().unwrap();
        assert_eq!(detect_runner(temp.path()), "npm");
        fs::write(temp.path().join("yarn.lock"), "").unwrap();
        assert_eq!(detect_runner(temp.path()), "yarn");
        fs::write(temp.path().join("pnpm-lock.yaml"), "").unwrap();
        assert_eq!(detect_runner(temp.path()), "pnpm");
    }

    #[test]
    fn test_status_wire_shape() {
        let mut running = BTreeMap::new();
        running.insert("dev".to_string(), true);
        let status = ProjectStatus {
            project: ProjectDescriptor {
                name: "shop".to_string(),
                path: PathBuf::from("/w/shop"),
                runner: "npm".to_string(),
                scripts: BTreeMap::new(),
            },
            running_scripts: running,
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["name"], "shop");
        assert_eq!(value["runningScripts"]["dev"], true);
    }
}
