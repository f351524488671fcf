//! `MockBackend` — a test double for [`ToolBackend`].
//!
//! Useful in unit and integration tests where a real MCP subprocess is
//! either unavailable or irrelevant.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use errors::AelError;

use crate::registry::{ToolDescriptor, ToolSource};
use crate::traits::ToolBackend;

/// Behaviour injected into [`MockTool`] at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Always fail with a retryable `TOOL_TIMEOUT`.
    FailRetryable(String),
    /// Always fail with a non-retryable `TOOL_REJECTED`.
    FailFatal(String),
    /// Fail `failures` times with `TOOL_TIMEOUT`, then return the value.
    FailThenSucceed { failures: u32, value: Value },
}

/// A mock tool that records every call it receives and returns a
/// programmer-specified result.
pub struct MockTool {
    pub name: String,
    pub behaviour: MockBehaviour,
    /// All params seen by this tool (in call order).
    pub calls: Arc<Mutex<Vec<Value>>>,
}

impl MockTool {
    pub fn returning(name: impl Into<String>, value: Value) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            behaviour: MockBehaviour::ReturnValue(value),
            calls: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            behaviour: MockBehaviour::FailRetryable(msg.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            behaviour: MockBehaviour::FailFatal(msg.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn flaky(name: impl Into<String>, failures: u32, value: Value) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            behaviour: MockBehaviour::FailThenSucceed { failures, value },
            calls: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Number of times this tool has been called.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn execute(&self, params: Value) -> Result<Value, AelError> {
        self.calls.lock().unwrap().push(params);
        let attempt = self.call_count() as u32;

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(v.clone()),
            MockBehaviour::FailRetryable(msg) => {
                Err(AelError::tool_timeout(&self.name, 0.0).with_detail(msg.clone()))
            }
            MockBehaviour::FailFatal(msg) => Err(AelError::tool_rejected(&self.name, msg)),
            MockBehaviour::FailThenSucceed { failures, value } => {
                if attempt <= *failures {
                    Err(AelError::tool_timeout(&self.name, 0.0))
                } else {
                    Ok(value.clone())
                }
            }
        }
    }
}

/// A backend serving a fixed set of mock tools.
pub struct MockBackend {
    id: String,
    tools: Vec<Arc<MockTool>>,
}

impl MockBackend {
    pub fn new(id: impl Into<String>, tools: Vec<Arc<MockTool>>) -> Self {
        Self { id: id.into(), tools }
    }

    pub fn tool(&self, name: &str) -> Option<&Arc<MockTool>> {
        self.tools.iter().find(|t| t.name == name)
    }
}

#[async_trait]
impl ToolBackend for MockBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, AelError> {
        Ok(self
            .tools
            .iter()
            .map(|t| ToolDescriptor {
                name: t.name.clone(),
                description: format!("mock tool '{}'", t.name),
                source: ToolSource::Mcp {
                    backend_id: self.id.clone(),
                },
                input_schema: json!({"type": "object"}),
            })
            .collect())
    }

    async fn call_tool(&self, tool: &str, params: Value) -> Result<Value, AelError> {
        let t = self
            .tool(tool)
            .ok_or_else(|| AelError::tool_unavailable(tool))?;
        t.execute(params)
    }
}
