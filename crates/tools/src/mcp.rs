//! MCP backend client — newline-delimited JSON-RPC 2.0 over a subprocess.
//!
//! One client per configured `mcp.servers.<id>` entry.  A reader task owns
//! the child's stdout and routes responses to pending requests by id;
//! writes go through a mutex-guarded stdin handle.  Connection failures
//! map to `MCP_CONNECTION_FAILED` (retryable); errors the server reports
//! for a call map to `TOOL_FAILED` with cause-driven retryability.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use config::model::McpServerSpec;
use errors::{AelError, ErrorCode};

use crate::registry::{ToolDescriptor, ToolSource};
use crate::traits::ToolBackend;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, AelError>>>>>;

/// A live connection to one MCP server subprocess.
#[derive(Debug)]
pub struct McpClient {
    id: String,
    stdin: Mutex<ChildStdin>,
    pending: Pending,
    next_id: AtomicU64,
    // Held so the subprocess is killed when the client is dropped.
    _child: Mutex<Child>,
}

impl McpClient {
    /// Spawn the server process and perform the `initialize` handshake.
    ///
    /// # Errors
    /// `MCP_CONNECTION_FAILED` if the process cannot be spawned or does
    /// not answer the handshake.
    pub async fn connect(id: &str, spec: &McpServerSpec) -> Result<Arc<Self>, AelError> {
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| connection_failed(id, format!("spawn '{}': {e}", spec.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| connection_failed(id, "no stdin pipe"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| connection_failed(id, "no stdout pipe"))?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        // Reader task: routes responses to their waiting callers.
        let reader_pending = pending.clone();
        let reader_id = id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let message: Value = match serde_json::from_str(&line) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(backend = %reader_id, error = %e, "unparseable MCP frame");
                                continue;
                            }
                        };
                        let Some(request_id) = message.get("id").and_then(Value::as_u64) else {
                            // Server-initiated notification; nothing waits on it.
                            continue;
                        };
                        let Some(tx) = reader_pending.lock().await.remove(&request_id) else {
                            continue;
                        };
                        let result = match message.get("error") {
                            Some(error) => {
                                let text = error
                                    .get("message")
                                    .and_then(Value::as_str)
                                    .unwrap_or("unknown MCP error");
                                Err(AelError::new(ErrorCode::ToolFailed)
                                    .with_message(format!("MCP server error: {text}"))
                                    .with_retryable(errors::retryable_from_message(text)))
                            }
                            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(result);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(backend = %reader_id, error = %e, "MCP stdout closed");
                        break;
                    }
                }
            }
            // Fail anything still waiting when the pipe closes.
            let mut pending = reader_pending.lock().await;
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(connection_failed(&reader_id, "connection closed")));
            }
        });

        let client = Arc::new(Self {
            id: id.to_string(),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            _child: Mutex::new(child),
        });

        client
            .request(
                "initialize",
                json!({
                    "protocolVersion": "2024-11-05",
                    "clientInfo": {"name": "ploston", "version": env!("CARGO_PKG_VERSION")},
                    "capabilities": {},
                }),
            )
            .await?;
        client.notify("notifications/initialized", json!({})).await?;

        info!(backend = %id, command = %spec.command, "MCP backend connected");
        Ok(client)
    }

    async fn write_frame(&self, frame: &Value) -> Result<(), AelError> {
        let mut line = frame.to_string();
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| connection_failed(&self.id, format!("write: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| connection_failed(&self.id, format!("flush: {e}")))
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, AelError> {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": method,
            "params": params,
        });
        if let Err(e) = self.write_frame(&frame).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        debug!(backend = %self.id, method, request_id, "MCP request sent");
        rx.await
            .map_err(|_| connection_failed(&self.id, "reader task gone"))?
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), AelError> {
        self.write_frame(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .await
    }

    /// Pull the output value out of a `tools/call` result: prefer
    /// `structuredContent`, else collapse a text content list (parsing
    /// JSON text where possible).
    fn extract_output(result: Value) -> Value {
        if let Some(structured) = result.get("structuredContent") {
            return structured.clone();
        }
        let Some(content) = result.get("content").and_then(Value::as_array) else {
            return result;
        };
        let texts: Vec<&str> = content
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect();
        match texts.as_slice() {
            [] => result,
            [single] => serde_json::from_str(single)
                .unwrap_or_else(|_| Value::String(single.to_string())),
            many => Value::String(many.join("\n")),
        }
    }
}

#[async_trait]
impl ToolBackend for McpClient {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, AelError> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(tools
            .iter()
            .filter_map(|t| {
                let name = t.get("name")?.as_str()?.to_string();
                Some(ToolDescriptor {
                    name,
                    description: t
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    source: ToolSource::Mcp {
                        backend_id: self.id.clone(),
                    },
                    input_schema: t
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object"})),
                })
            })
            .collect())
    }

    async fn call_tool(&self, tool: &str, params: Value) -> Result<Value, AelError> {
        let result = self
            .request(
                "tools/call",
                json!({"name": tool, "arguments": params}),
            )
            .await?;

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            let text = match Self::extract_output(result) {
                Value::String(s) => s,
                other => other.to_string(),
            };
            return Err(AelError::tool_failed(tool, &text));
        }
        Ok(Self::extract_output(result))
    }
}

fn connection_failed(id: &str, detail: impl Into<String>) -> AelError {
    AelError::new(ErrorCode::McpConnectionFailed)
        .with_message(format!("Failed to connect to MCP server '{id}'"))
        .with_detail(detail)
}
