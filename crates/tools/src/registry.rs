//! Tool registry — the merged snapshot of every available tool.
//!
//! The snapshot is an immutable map replaced atomically on refresh, so
//! concurrent executions always read a consistent view.  Name conflicts
//! are resolved by source precedence: built-ins > workflows > MCP
//! backends in configuration order; a later source never shadows an
//! earlier one and the conflict is surfaced in the refresh report.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use config::Mode;

use crate::traits::ToolBackend;

/// Tool names visible while in configuration mode.
pub const CONFIG_TOOLS: &[&str] = &[
    "config_get",
    "config_set",
    "config_validate",
    "config_done",
    "config_location",
];

/// Where a tool lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolSource {
    Builtin,
    Workflow,
    Mcp { backend_id: String },
}

/// One entry in the registry snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub source: ToolSource,
    /// JSON schema describing the tool's parameters.
    pub input_schema: Value,
}

impl ToolDescriptor {
    /// Shape used in MCP `tools/list` responses.
    pub fn to_mcp_tool(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        })
    }
}

/// Outcome of one refresh pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RefreshReport {
    pub total: usize,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Names a later source tried to register over an earlier one.
    pub conflicts: Vec<String>,
    /// Backend id → discovery error.
    pub errors: Vec<(String, String)>,
}

type Snapshot = Arc<BTreeMap<String, ToolDescriptor>>;

/// Central catalog of all available tools.
pub struct ToolRegistry {
    backends: Vec<Arc<dyn ToolBackend>>,
    builtins: Vec<ToolDescriptor>,
    workflow_tools: RwLock<Vec<ToolDescriptor>>,
    /// Last successful per-backend discovery, reused when only the
    /// workflow set changes.
    mcp_tools: RwLock<Vec<ToolDescriptor>>,
    snapshot: RwLock<Snapshot>,
    mode: RwLock<Mode>,
}

impl ToolRegistry {
    /// Create a registry over the given built-ins and backends.
    ///
    /// The initial snapshot contains the built-ins only; call
    /// [`ToolRegistry::refresh`] to discover backend tools.
    pub fn new(builtins: Vec<ToolDescriptor>, backends: Vec<Arc<dyn ToolBackend>>, mode: Mode) -> Self {
        let registry = Self {
            backends,
            builtins,
            workflow_tools: RwLock::new(Vec::new()),
            mcp_tools: RwLock::new(Vec::new()),
            snapshot: RwLock::new(Arc::new(BTreeMap::new())),
            mode: RwLock::new(mode),
        };
        registry.rebuild();
        registry
    }

    pub fn mode(&self) -> Mode {
        *self.mode.read().expect("mode lock")
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.write().expect("mode lock") = mode;
        info!(?mode, "registry mode changed");
    }

    /// Replace the workflow-derived tool set (called whenever the workflow
    /// registry reloads) and rebuild the snapshot.
    pub fn set_workflow_tools(&self, tools: Vec<ToolDescriptor>) {
        *self.workflow_tools.write().expect("workflow tools lock") = tools;
        self.rebuild();
    }

    /// Re-discover from all backends and replace the snapshot atomically.
    pub async fn refresh(&self) -> RefreshReport {
        let mut discovered = Vec::new();
        let mut errors = Vec::new();

        for backend in &self.backends {
            match backend.list_tools().await {
                Ok(tools) => discovered.extend(tools),
                Err(e) => {
                    error!(backend = backend.id(), error = %e, "tool discovery failed");
                    errors.push((backend.id().to_string(), e.to_string()));
                }
            }
        }

        *self.mcp_tools.write().expect("mcp tools lock") = discovered;
        let mut report = self.rebuild();
        report.errors = errors;
        report
    }

    /// Merge builtins, workflow tools, and the last MCP discovery into a
    /// fresh snapshot, applying source precedence.
    fn rebuild(&self) -> RefreshReport {
        let old: Snapshot = self.snapshot.read().expect("snapshot lock").clone();

        let mut merged: BTreeMap<String, ToolDescriptor> = BTreeMap::new();
        let mut conflicts = Vec::new();

        let workflow_tools = self.workflow_tools.read().expect("workflow tools lock").clone();
        let mcp_tools = self.mcp_tools.read().expect("mcp tools lock").clone();

        for tool in self
            .builtins
            .iter()
            .chain(workflow_tools.iter())
            .chain(mcp_tools.iter())
        {
            if merged.contains_key(&tool.name) {
                error!(tool = %tool.name, "tool name conflict; earlier source wins");
                conflicts.push(tool.name.clone());
                continue;
            }
            merged.insert(tool.name.clone(), tool.clone());
        }

        let added = merged
            .keys()
            .filter(|name| !old.contains_key(*name))
            .cloned()
            .collect();
        let removed = old
            .keys()
            .filter(|name| !merged.contains_key(*name))
            .cloned()
            .collect();

        let total = merged.len();
        *self.snapshot.write().expect("snapshot lock") = Arc::new(merged);

        RefreshReport {
            total,
            added,
            removed,
            conflicts,
            errors: Vec::new(),
        }
    }

    /// Whether `name` is visible under the current mode.
    fn visible(&self, name: &str) -> bool {
        match self.mode() {
            Mode::Running => true,
            Mode::Configuration => CONFIG_TOOLS.contains(&name),
        }
    }

    /// Look up a tool by name, honoring the mode gate.
    pub fn lookup(&self, name: &str) -> Option<ToolDescriptor> {
        if !self.visible(name) {
            return None;
        }
        self.snapshot.read().expect("snapshot lock").get(name).cloned()
    }

    /// Resolve a backend by id (invoker routing).
    pub fn backend(&self, id: &str) -> Option<Arc<dyn ToolBackend>> {
        self.backends.iter().find(|b| b.id() == id).cloned()
    }

    /// List visible tools, name-sorted (deterministic across refreshes).
    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.snapshot
            .read()
            .expect("snapshot lock")
            .values()
            .filter(|t| self.visible(&t.name))
            .cloned()
            .collect()
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::builtin_descriptors;
    use crate::mock::{MockBackend, MockTool};
    use serde_json::json;

    fn workflow_tool(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: String::new(),
            source: ToolSource::Workflow,
            input_schema: json!({"type": "object"}),
        }
    }

    #[tokio::test]
    async fn refresh_merges_all_sources_sorted() {
        let backend = Arc::new(MockBackend::new(
            "srv",
            vec![MockTool::returning("zeta", json!(1)), MockTool::returning("alpha", json!(2))],
        ));
        let registry = ToolRegistry::new(
            builtin_descriptors(&config::model::ToolsConfig::default()),
            vec![backend],
            Mode::Running,
        );
        registry.set_workflow_tools(vec![workflow_tool("workflow:report")]);
        registry.refresh().await;

        let names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"python_exec".to_string()));
        assert!(names.contains(&"workflow:report".to_string()));
        assert!(names.contains(&"alpha".to_string()));
    }

    #[tokio::test]
    async fn refresh_twice_is_idempotent() {
        let backend = Arc::new(MockBackend::new(
            "srv",
            vec![MockTool::returning("t1", json!(null))],
        ));
        let registry = ToolRegistry::new(Vec::new(), vec![backend], Mode::Running);

        registry.refresh().await;
        let first: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
        let report = registry.refresh().await;
        let second: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();

        assert_eq!(first, second);
        assert!(report.added.is_empty());
        assert!(report.removed.is_empty());
    }

    #[tokio::test]
    async fn later_source_cannot_shadow_earlier() {
        // Backend offers a tool named like a built-in.
        let backend = Arc::new(MockBackend::new(
            "srv",
            vec![MockTool::returning("python_exec", json!(null))],
        ));
        let registry = ToolRegistry::new(
            builtin_descriptors(&config::model::ToolsConfig::default()),
            vec![backend],
            Mode::Running,
        );
        let report = registry.refresh().await;

        assert_eq!(report.conflicts, vec!["python_exec".to_string()]);
        let desc = registry.lookup("python_exec").unwrap();
        assert_eq!(desc.source, ToolSource::Builtin);
    }

    #[tokio::test]
    async fn configuration_mode_lists_only_config_tools() {
        let backend = Arc::new(MockBackend::new(
            "srv",
            vec![MockTool::returning("t1", json!(null))],
        ));
        let registry = ToolRegistry::new(
            builtin_descriptors(&config::model::ToolsConfig::default()),
            vec![backend],
            Mode::Configuration,
        );
        registry.refresh().await;

        let names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
        assert!(names.iter().all(|n| CONFIG_TOOLS.contains(&n.as_str())));
        assert!(registry.lookup("t1").is_none());

        registry.set_mode(Mode::Running);
        assert!(registry.lookup("t1").is_some());
    }
}
