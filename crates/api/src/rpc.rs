//! JSON-RPC message handling for the MCP frontend.
//!
//! Implements `initialize`, `ping`, `tools/list`, and `tools/call`.
//! Notifications (no id) are consumed without a response.  Errors carry
//! the engine's structured error object in `error.data`.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, instrument};

use errors::{AelError, ErrorCode};
use engine::ExecutionStatus;

use crate::AppState;

/// JSON-RPC error codes used by the frontend.
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

/// Handle one incoming message; `None` means no response (notification).
pub async fn handle_message(state: &AppState, message: Value) -> Option<Value> {
    let id = message.get("id").cloned();
    let method = message.get("method").and_then(Value::as_str)?.to_string();
    let params = message
        .get("params")
        .cloned()
        .unwrap_or_else(|| json!({}));

    // Notifications carry no id and get no response.
    let id = id?;

    let result = dispatch(state, &method, params).await;
    Some(match result {
        Ok(value) => json!({"jsonrpc": "2.0", "id": id, "result": value}),
        Err((code, error)) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": code,
                "message": error.message,
                "data": serde_json::to_value(&error).unwrap_or(Value::Null),
            },
        }),
    })
}

async fn dispatch(
    state: &AppState,
    method: &str,
    params: Value,
) -> Result<Value, (i64, AelError)> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "serverInfo": {
                "name": state.server_name,
                "version": state.server_version,
            },
            "capabilities": {"tools": {"listChanged": false}},
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(tools_list(state)),
        "tools/call" => tools_call(state, params).await,
        _ => Err((
            METHOD_NOT_FOUND,
            AelError::internal(format!("unknown method: {method}")),
        )),
    }
}

fn tools_list(state: &AppState) -> Value {
    let tools: Vec<Value> = state
        .registry
        .list()
        .iter()
        .map(|t| t.to_mcp_tool())
        .collect();
    json!({"tools": tools})
}

#[instrument(skip(state, params))]
async fn tools_call(state: &AppState, params: Value) -> Result<Value, (i64, AelError)> {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            (
                INVALID_PARAMS,
                AelError::new(ErrorCode::ParamInvalid).with_detail("'name' is required"),
            )
        })?
        .to_string();
    let arguments = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));

    info!(tool = %name, "tools/call");

    let output = if let Some(workflow_name) = name.strip_prefix("workflow:") {
        run_workflow(state, workflow_name, arguments).await?
    } else {
        state
            .invoker
            .invoke(&name, arguments, Duration::from_secs(300), None)
            .await
            .map_err(|e| (INTERNAL_ERROR, e))?
    };

    // MCP result shape: a text content block plus the structured value.
    let text = match &output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Ok(json!({
        "content": [{"type": "text", "text": text}],
        "structuredContent": output,
        "isError": false,
    }))
}

async fn run_workflow(
    state: &AppState,
    workflow_name: &str,
    arguments: Value,
) -> Result<Value, (i64, AelError)> {
    let result = state
        .engine
        .execute(workflow_name, arguments)
        .await
        .map_err(|e| (INVALID_PARAMS, e))?;

    match result.status {
        ExecutionStatus::Completed => Ok(json!({
            "execution_id": result.execution_id,
            "status": result.status,
            "outputs": result.outputs,
            "duration_ms": result.duration_ms,
            "steps_completed": result.steps_completed,
            "steps_skipped": result.steps_skipped,
        })),
        ExecutionStatus::Failed => {
            let error = result
                .error
                .unwrap_or_else(|| AelError::internal("workflow failed without an error"));
            Err((INTERNAL_ERROR, error))
        }
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    use config::{AelConfig, Mode, StagedConfig};
    use engine::{Engine, WorkflowRegistry};
    use tools::builtin::builtin_descriptors;
    use tools::mock::{MockBackend, MockTool};
    use tools::{ToolInvoker, ToolRegistry};

    async fn state() -> AppState {
        let echo = MockTool::returning("echo", json!({"ack": true}));
        let backend = Arc::new(MockBackend::new("test", vec![echo]));
        let registry = Arc::new(ToolRegistry::new(
            builtin_descriptors(&config::model::ToolsConfig::default()),
            vec![backend],
            Mode::Running,
        ));

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("double.yaml"),
            "name: double\nversion: 1.0.0\ninputs:\n  - n:\n      type: integer\nsteps:\n  - id: a\n    code: \"return context.inputs.n * 2\"\noutput: \"{{ steps.a.output }}\"\n",
        )
        .unwrap();
        let workflows = WorkflowRegistry::load(dir.path()).unwrap();
        workflows.sync_tools(&registry);
        registry.refresh().await;

        let staged = Arc::new(StagedConfig::new(PathBuf::from("/tmp/ploston-rpc-test.yaml")));
        let invoker = ToolInvoker::new(
            registry.clone(),
            staged,
            config::model::PythonExecConfig::default(),
        );
        let engine = Engine::new(workflows, invoker.clone(), &AelConfig::default());
        invoker.set_workflow_runner(engine.clone());

        AppState {
            registry,
            invoker,
            engine,
            server_name: "ploston".to_string(),
            server_version: "0.1.0".to_string(),
        }
    }

    #[tokio::test]
    async fn initialize_reports_server_info() {
        let s = state().await;
        let response = handle_message(
            &s,
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
        )
        .await
        .unwrap();
        assert_eq!(response["result"]["serverInfo"]["name"], json!("ploston"));
    }

    #[tokio::test]
    async fn tools_list_includes_workflows_and_builtins() {
        let s = state().await;
        let response = handle_message(
            &s,
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
        )
        .await
        .unwrap();
        let tools = response["result"]["tools"].as_array().unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert!(names.contains(&"echo"));
        assert!(names.contains(&"python_exec"));
        assert!(names.contains(&"workflow:double"));

        let wf = tools
            .iter()
            .find(|t| t["name"] == "workflow:double")
            .unwrap();
        assert_eq!(wf["inputSchema"]["required"], json!(["n"]));
    }

    #[tokio::test]
    async fn tools_call_dispatches_bare_tools_to_the_invoker() {
        let s = state().await;
        let response = handle_message(
            &s,
            json!({
                "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                "params": {"name": "echo", "arguments": {"x": 1}},
            }),
        )
        .await
        .unwrap();
        assert_eq!(
            response["result"]["structuredContent"],
            json!({"ack": true})
        );
    }

    #[tokio::test]
    async fn tools_call_runs_workflows_by_prefixed_name() {
        let s = state().await;
        let response = handle_message(
            &s,
            json!({
                "jsonrpc": "2.0", "id": 4, "method": "tools/call",
                "params": {"name": "workflow:double", "arguments": {"n": 21}},
            }),
        )
        .await
        .unwrap();
        let result = &response["result"]["structuredContent"];
        assert_eq!(result["outputs"], json!(42));
        assert_eq!(result["status"], json!("COMPLETED"));
    }

    #[tokio::test]
    async fn unknown_method_is_a_jsonrpc_error() {
        let s = state().await;
        let response = handle_message(
            &s,
            json!({"jsonrpc": "2.0", "id": 5, "method": "nope"}),
        )
        .await
        .unwrap();
        assert_eq!(response["error"]["code"], json!(METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let s = state().await;
        let response = handle_message(
            &s,
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )
        .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn failed_workflow_surfaces_the_structured_error() {
        let s = state().await;
        let response = handle_message(
            &s,
            json!({
                "jsonrpc": "2.0", "id": 6, "method": "tools/call",
                "params": {"name": "workflow:double", "arguments": {}},
            }),
        )
        .await
        .unwrap();
        assert_eq!(response["error"]["data"]["code"], json!("INPUT_INVALID"));
        assert_eq!(response["error"]["data"]["retryable"], json!(false));
    }
}
