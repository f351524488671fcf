//! Workflow registry — parsed definitions keyed by name.
//!
//! Loads `*.yaml` / `*.yml` files from the configured directory, validates
//! each at load, and publishes an immutable snapshot.  A failed rebuild
//! (parse or validation error in any file) leaves the previous snapshot
//! intact.  Hot reload is an mtime-polling task; a change triggers a
//! rebuild and pushes the refreshed `workflow:<name>` tool set into the
//! tool registry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use tracing::{error, info};

use errors::AelError;
use tools::{ToolDescriptor, ToolRegistry, ToolSource};

use crate::models::Workflow;
use crate::parser::parse_workflow_yaml;
use crate::validate::validate_workflow;

type Snapshot = Arc<BTreeMap<String, Arc<Workflow>>>;

/// Fingerprint of the workflow directory: path, mtime, and size per file.
type Fingerprint = Vec<(PathBuf, Option<SystemTime>, u64)>;

pub struct WorkflowRegistry {
    directory: PathBuf,
    snapshot: RwLock<Snapshot>,
    fingerprint: RwLock<Fingerprint>,
}

impl WorkflowRegistry {
    /// An empty registry (tests, configuration mode).
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            directory: PathBuf::new(),
            snapshot: RwLock::new(Arc::new(BTreeMap::new())),
            fingerprint: RwLock::new(Vec::new()),
        })
    }

    /// Load all workflows from `directory`.  A missing directory is an
    /// empty registry, not an error.
    pub fn load(directory: impl Into<PathBuf>) -> Result<Arc<Self>, AelError> {
        let registry = Arc::new(Self {
            directory: directory.into(),
            snapshot: RwLock::new(Arc::new(BTreeMap::new())),
            fingerprint: RwLock::new(Vec::new()),
        });
        registry.reload()?;
        Ok(registry)
    }

    /// Rebuild the snapshot from disk.  All-or-nothing: any bad file
    /// keeps the previous snapshot and returns the error.
    pub fn reload(&self) -> Result<usize, AelError> {
        if !self.directory.exists() {
            info!(directory = %self.directory.display(), "workflow directory absent; registry empty");
            return Ok(0);
        }

        let files = workflow_files(&self.directory)?;
        let mut next: BTreeMap<String, Arc<Workflow>> = BTreeMap::new();

        for path in &files {
            let content = std::fs::read_to_string(path).map_err(|e| {
                AelError::input_invalid(format!("cannot read {}: {e}", path.display()))
            })?;
            let workflow = parse_workflow_yaml(&content)
                .and_then(|wf| validate_workflow(&wf).map(|_| wf))
                .map_err(|e| {
                    let detail = match &e.detail {
                        Some(d) => format!("{d} (in {})", path.display()),
                        None => format!("in {}", path.display()),
                    };
                    e.with_detail(detail)
                })?;

            if next.contains_key(&workflow.name) {
                return Err(AelError::input_invalid(format!(
                    "duplicate workflow name '{}' ({})",
                    workflow.name,
                    path.display()
                )));
            }
            next.insert(workflow.name.clone(), Arc::new(workflow));
        }

        let count = next.len();
        *self.snapshot.write().expect("workflow snapshot lock") = Arc::new(next);
        *self.fingerprint.write().expect("fingerprint lock") = fingerprint(&files);
        info!(count, directory = %self.directory.display(), "workflow registry loaded");
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Workflow>> {
        self.snapshot
            .read()
            .expect("workflow snapshot lock")
            .get(name)
            .cloned()
    }

    pub fn get_or_err(&self, name: &str) -> Result<Arc<Workflow>, AelError> {
        self.get(name)
            .ok_or_else(|| AelError::workflow_not_found(name))
    }

    /// All workflows, name-sorted.
    pub fn list(&self) -> Vec<Arc<Workflow>> {
        self.snapshot
            .read()
            .expect("workflow snapshot lock")
            .values()
            .cloned()
            .collect()
    }

    /// The `workflow:<name>` tool descriptors for the tool registry.
    pub fn tool_descriptors(&self) -> Vec<ToolDescriptor> {
        self.list()
            .iter()
            .map(|wf| ToolDescriptor {
                name: format!("workflow:{}", wf.name),
                description: wf
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("Workflow '{}' v{}", wf.name, wf.version)),
                source: ToolSource::Workflow,
                input_schema: wf.input_schema(),
            })
            .collect()
    }

    /// Push the current workflow tool set into the tool registry.
    pub fn sync_tools(&self, tools: &ToolRegistry) {
        tools.set_workflow_tools(self.tool_descriptors());
    }

    /// Poll for filesystem changes and rebuild when the directory's
    /// fingerprint moves.  Runs until the process exits.
    pub fn spawn_hot_reload(
        self: &Arc<Self>,
        interval: std::time::Duration,
        tools: Arc<ToolRegistry>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let current = match workflow_files(&registry.directory) {
                    Ok(files) => fingerprint(&files),
                    Err(_) => continue,
                };
                let changed = {
                    let last = registry.fingerprint.read().expect("fingerprint lock");
                    *last != current
                };
                if !changed {
                    continue;
                }
                match registry.reload() {
                    Ok(count) => {
                        info!(count, "workflows hot-reloaded");
                        registry.sync_tools(&tools);
                    }
                    // Previous snapshot stays in place.
                    Err(e) => error!(error = %e, "workflow hot reload failed"),
                }
            }
        })
    }
}

fn workflow_files(directory: &Path) -> Result<Vec<PathBuf>, AelError> {
    let mut files: Vec<PathBuf> = Vec::new();
    let entries = std::fs::read_dir(directory).map_err(|e| {
        AelError::input_invalid(format!("cannot read {}: {e}", directory.display()))
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if path.is_file() && is_yaml {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn fingerprint(files: &[PathBuf]) -> Fingerprint {
    files
        .iter()
        .map(|path| {
            let meta = std::fs::metadata(path).ok();
            (
                path.clone(),
                meta.as_ref().and_then(|m| m.modified().ok()),
                meta.map(|m| m.len()).unwrap_or(0),
            )
        })
        .collect()
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "name: good\nversion: 1.0.0\nsteps:\n  - id: a\n    code: \"return 1\"\n";
    const ALSO_GOOD: &str =
        "name: other\nversion: 1.0.0\nsteps:\n  - id: a\n    code: \"return 2\"\n";
    const BAD: &str = "name: bad\nversion: 1.0.0\nsteps: []\n";

    #[test]
    fn loads_and_sorts_workflows_from_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("z.yaml"), GOOD).unwrap();
        std::fs::write(dir.path().join("a.yml"), ALSO_GOOD).unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "not yaml").unwrap();

        let registry = WorkflowRegistry::load(dir.path()).unwrap();
        let names: Vec<String> = registry.list().iter().map(|w| w.name.clone()).collect();
        assert_eq!(names, vec!["good", "other"]);
        assert!(registry.get("good").is_some());
        assert!(registry.get_or_err("ghost").is_err());
    }

    #[test]
    fn failed_rebuild_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("wf.yaml");
        std::fs::write(&file, GOOD).unwrap();

        let registry = WorkflowRegistry::load(dir.path()).unwrap();
        assert_eq!(registry.list().len(), 1);

        // Break the file: reload errors, old snapshot survives.
        std::fs::write(&file, BAD).unwrap();
        assert!(registry.reload().is_err());
        assert!(registry.get("good").is_some());
    }

    #[test]
    fn missing_directory_is_an_empty_registry() {
        let registry = WorkflowRegistry::load("/definitely/not/here").unwrap();
        assert!(registry.list().is_empty());
    }

    #[test]
    fn tool_descriptors_carry_workflow_prefix_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("wf.yaml"),
            "name: report\nversion: 1.0.0\ninputs:\n  - url\nsteps:\n  - id: a\n    code: x\n",
        )
        .unwrap();

        let registry = WorkflowRegistry::load(dir.path()).unwrap();
        let tools = registry.tool_descriptors();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "workflow:report");
        assert_eq!(tools[0].input_schema["required"], serde_json::json!(["url"]));
    }

    #[test]
    fn duplicate_workflow_names_across_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.yaml"), GOOD).unwrap();
        std::fs::write(dir.path().join("two.yaml"), GOOD).unwrap();
        assert!(WorkflowRegistry::load(dir.path()).is_err());
    }
}
