//! Typed configuration model.
//!
//! Every section has serde defaults so a partial (or absent) file still
//! yields a complete [`AelConfig`].  Field names follow the YAML surface.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AelConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub workflows: WorkflowsConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub python_exec: PythonExecConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_server_name")]
    pub name: String,
    #[serde(default = "default_server_version")]
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            version: default_server_version(),
        }
    }
}

fn default_server_name() -> String {
    "ploston".to_string()
}

fn default_server_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct McpConfig {
    /// Backend id → spawn spec, in declaration order of the file.
    #[serde(default)]
    pub servers: HashMap<String, McpServerSpec>,
}

/// How to spawn one MCP backend subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct McpServerSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    /// Built-in tools to expose (default: python_exec).
    #[serde(default = "default_builtins")]
    pub builtins: Vec<String>,
    /// Per-backend enable switch; absent means enabled.
    #[serde(default)]
    pub mcp_servers: HashMap<String, bool>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            builtins: default_builtins(),
            mcp_servers: HashMap::new(),
        }
    }
}

fn default_builtins() -> Vec<String> {
    vec!["python_exec".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowsConfig {
    #[serde(default = "default_workflows_dir")]
    pub directory: String,
    #[serde(default)]
    pub hot_reload: bool,
}

impl Default for WorkflowsConfig {
    fn default() -> Self {
        Self {
            directory: default_workflows_dir(),
            hot_reload: false,
        }
    }
}

fn default_workflows_dir() -> String {
    "./workflows".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Concurrent executions admitted before new calls wait.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Fallback per-step timeout in seconds.
    #[serde(default = "default_timeout")]
    pub default_timeout: f64,
    #[serde(default)]
    pub retry: ExecutionRetryConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            default_timeout: default_timeout(),
            retry: ExecutionRetryConfig::default(),
        }
    }
}

fn default_max_concurrent() -> usize {
    10
}

fn default_timeout() -> f64 {
    30.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionRetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for ExecutionRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PythonExecConfig {
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    /// Advisory only: there is no portable way to cap interpreter memory,
    /// so this knob is accepted and reported but not enforced.
    #[serde(default = "default_max_memory")]
    pub max_memory: u64,
    /// Extra imports allowed on top of the workflow's package profile.
    #[serde(default)]
    pub allowed_imports: Vec<String>,
}

impl Default for PythonExecConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            max_memory: default_max_memory(),
            allowed_imports: Vec::new(),
        }
    }
}

fn default_max_memory() -> u64 {
    256 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Per-component level overrides (`engine`, `invoker`, `sandbox`, …).
    #[serde(default)]
    pub components: HashMap<String, String>,
    #[serde(default)]
    pub options: LoggingOptions,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            components: HashMap::new(),
            options: LoggingOptions::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingOptions {
    #[serde(default)]
    pub show_params: bool,
    #[serde(default)]
    pub show_results: bool,
    #[serde(default = "default_truncate_at")]
    pub truncate_at: usize,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            show_params: false,
            show_results: false,
            truncate_at: default_truncate_at(),
        }
    }
}

fn default_truncate_at() -> usize {
    512
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityConfig {
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl AelConfig {
    /// Backend ids that are both declared under `mcp.servers` and not
    /// switched off under `tools.mcp_servers`, in name order so discovery
    /// is deterministic.
    pub fn enabled_mcp_servers(&self) -> Vec<(String, McpServerSpec)> {
        let mut ids: Vec<&String> = self
            .mcp
            .servers
            .keys()
            .filter(|id| *self.tools.mcp_servers.get(*id).unwrap_or(&true))
            .collect();
        ids.sort();
        ids.into_iter()
            .map(|id| (id.clone(), self.mcp.servers[id].clone()))
            .collect()
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_full_defaults() {
        let cfg: AelConfig = serde_yaml::from_str("{}").expect("defaults should apply");
        assert_eq!(cfg.execution.max_concurrent, 10);
        assert_eq!(cfg.execution.default_timeout, 30.0);
        assert_eq!(cfg.execution.retry.max_attempts, 3);
        assert_eq!(cfg.tools.builtins, vec!["python_exec"]);
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.workflows.hot_reload);
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let res: Result<AelConfig, _> = serde_yaml::from_str("surprise: 1\n");
        assert!(res.is_err());
    }

    #[test]
    fn disabled_server_is_filtered_from_enabled_list() {
        let yaml = r#"
mcp:
  servers:
    files:
      command: mcp-files
    web:
      command: mcp-web
tools:
  mcp_servers:
    web: false
"#;
        let cfg: AelConfig = serde_yaml::from_str(yaml).unwrap();
        let enabled = cfg.enabled_mcp_servers();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].0, "files");
    }
}
