//! The backend traits — the contracts every tool source must fulfil.

use async_trait::async_trait;
use serde_json::Value;

use errors::AelError;

use crate::registry::ToolDescriptor;

/// A source of tools the registry can discover and the invoker can call.
///
/// Implemented by the MCP subprocess client and by the in-process mock
/// backend used in tests.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Stable backend id (the `mcp.servers.<id>` key).
    fn id(&self) -> &str;

    /// Discover the tools this backend currently offers.
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, AelError>;

    /// Call one tool with JSON parameters and return its output value.
    async fn call_tool(&self, tool: &str, params: Value) -> Result<Value, AelError>;
}

/// Executes a workflow when a `workflow:<name>` tool is invoked.
///
/// Implemented by the engine; defined here so the invoker can dispatch
/// workflow tools without depending on the engine crate.
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    /// Run the named workflow to completion and return its outputs.
    async fn run_workflow(&self, name: &str, inputs: Value) -> Result<Value, AelError>;
}
