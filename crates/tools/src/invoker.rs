//! Tool invoker — routes a call to its owning source and applies the
//! per-step deadline and retry policy.
//!
//! Retry loop rules:
//! - only retryable errors consume extra attempts,
//! - the back-off delay for attempt *k* is
//!   `min(max_delay, initial_delay * backoff_multiplier^(k-1))`,
//! - sleeps are clamped to the remaining deadline and count against it.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use config::StagedConfig;
use errors::{AelError, ErrorCode};
use sandbox::{PackageProfile, Sandbox, SandboxConfig, SandboxContext, ToolCaller};

use crate::builtin::dispatch_config_tool;
use crate::registry::{ToolDescriptor, ToolRegistry, ToolSource};
use crate::traits::WorkflowRunner;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Back-off schedule shared by workflow definitions and system defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> f64 {
    1.0
}
fn default_max_delay() -> f64 {
    30.0
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Reject nonsensical schedules at workflow load time.
    pub fn validate(&self) -> Result<(), AelError> {
        if self.max_attempts < 1 {
            return Err(AelError::input_invalid("retry.max_attempts must be >= 1"));
        }
        if self.initial_delay < 0.0 {
            return Err(AelError::input_invalid("retry.initial_delay must be >= 0"));
        }
        if self.max_delay < self.initial_delay {
            return Err(AelError::input_invalid(
                "retry.max_delay must be >= retry.initial_delay",
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(AelError::input_invalid(
                "retry.backoff_multiplier must be >= 1.0",
            ));
        }
        Ok(())
    }

    /// Delay before the attempt after failed attempt `k` (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let secs = (self.initial_delay * exp).min(self.max_delay);
        Duration::from_secs_f64(secs.max(0.0))
    }
}

// ---------------------------------------------------------------------------
// ToolInvoker
// ---------------------------------------------------------------------------

/// Unified interface for tool invocation.
///
/// Routes by descriptor source:
/// - built-ins → sandbox (`python_exec`) or the staged-config tools,
/// - `workflow:` names → the wired [`WorkflowRunner`] (the engine),
/// - MCP tools → the owning backend client.
pub struct ToolInvoker {
    registry: Arc<ToolRegistry>,
    staged: Arc<StagedConfig>,
    python_exec: config::model::PythonExecConfig,
    runner: OnceLock<Arc<dyn WorkflowRunner>>,
    self_ref: Weak<ToolInvoker>,
}

impl ToolInvoker {
    pub fn new(
        registry: Arc<ToolRegistry>,
        staged: Arc<StagedConfig>,
        python_exec: config::model::PythonExecConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            registry,
            staged,
            python_exec,
            runner: OnceLock::new(),
            self_ref: weak.clone(),
        })
    }

    /// Wire the workflow runner (the engine).  Done once from `main`;
    /// `workflow:` tools fail with `INTERNAL_ERROR` until then.
    pub fn set_workflow_runner(&self, runner: Arc<dyn WorkflowRunner>) {
        let _ = self.runner.set(runner);
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Invoke a tool with a wall-clock deadline and an optional retry
    /// policy.
    ///
    /// # Errors
    /// `TOOL_UNAVAILABLE` if the name does not resolve in the current
    /// mode; `TOOL_TIMEOUT` when the deadline elapses; otherwise the
    /// error surfaced by the owning source, with retryability and
    /// suggestion carried from the error registry.
    #[instrument(skip(self, params, retry), fields(tool = %tool_name))]
    pub async fn invoke(
        &self,
        tool_name: &str,
        params: Value,
        deadline: Duration,
        retry: Option<&RetryPolicy>,
    ) -> Result<Value, AelError> {
        let descriptor = self
            .registry
            .lookup(tool_name)
            .ok_or_else(|| AelError::tool_unavailable(tool_name))?;

        let started = Instant::now();
        let max_attempts = retry.map(|r| r.max_attempts.max(1)).unwrap_or(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(AelError::tool_timeout(tool_name, deadline.as_secs_f64()));
            }

            let error = match tokio::time::timeout(
                remaining,
                self.dispatch(&descriptor, params.clone(), remaining),
            )
            .await
            {
                Ok(Ok(output)) => {
                    debug!(attempt, "tool call succeeded");
                    return Ok(output);
                }
                Ok(Err(e)) => e,
                Err(_) => AelError::tool_timeout(tool_name, deadline.as_secs_f64()),
            };

            if !error.retryable || attempt >= max_attempts {
                return Err(error);
            }

            let delay = retry.expect("attempts > 1 implies a policy").delay_for(attempt);
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(error);
            }

            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retryable tool error, backing off"
            );
            tokio::time::sleep(delay.min(remaining)).await;
        }
    }

    async fn dispatch(
        &self,
        descriptor: &ToolDescriptor,
        params: Value,
        remaining: Duration,
    ) -> Result<Value, AelError> {
        match &descriptor.source {
            ToolSource::Builtin => self.dispatch_builtin(&descriptor.name, params, remaining).await,
            ToolSource::Workflow => {
                let name = descriptor
                    .name
                    .strip_prefix("workflow:")
                    .unwrap_or(&descriptor.name);
                let runner = self.runner.get().ok_or_else(|| {
                    AelError::internal("no workflow runner wired into the invoker")
                })?;
                runner.run_workflow(name, params).await
            }
            ToolSource::Mcp { backend_id } => {
                let backend = self
                    .registry
                    .backend(backend_id)
                    .ok_or_else(|| AelError::tool_unavailable(&descriptor.name))?;
                backend.call_tool(&descriptor.name, params).await
            }
        }
    }

    async fn dispatch_builtin(
        &self,
        name: &str,
        params: Value,
        remaining: Duration,
    ) -> Result<Value, AelError> {
        if name == "python_exec" {
            return self.run_python_exec(params, remaining).await;
        }
        dispatch_config_tool(name, &params, &self.staged, &self.registry)
    }

    /// Ad-hoc `python_exec` calls arriving through the frontend.  Code
    /// steps inside a workflow go to the sandbox directly via the engine;
    /// this path serves the bare tool with an empty context.
    async fn run_python_exec(&self, params: Value, remaining: Duration) -> Result<Value, AelError> {
        let code = params.get("code").and_then(Value::as_str).ok_or_else(|| {
            AelError::new(ErrorCode::ParamInvalid)
                .with_message("Invalid parameters for tool 'python_exec'")
                .with_detail("'code' is required")
        })?;

        let timeout = Duration::from_secs_f64(self.python_exec.timeout).min(remaining);
        let config = SandboxConfig::for_profile(
            PackageProfile::Standard,
            &self.python_exec.allowed_imports,
            timeout,
            10,
        );

        let me = self.self_ref.upgrade().ok_or_else(|| {
            AelError::internal("invoker dropped while a python_exec call was in flight")
        })?;
        let ctx = SandboxContext {
            inputs: json!({}),
            steps: json!({}),
            config: json!({}),
            execution_id: "ad-hoc".to_string(),
            tools: me,
        };

        Sandbox::new(config).execute(code, ctx).await
    }
}

/// The sandbox's bridge back into the engine (layer 3 of the sandbox).
#[async_trait]
impl ToolCaller for ToolInvoker {
    async fn is_available(&self, name: &str) -> bool {
        self.registry.lookup(name).is_some()
    }

    async fn call(&self, name: &str, params: Value) -> Result<Value, AelError> {
        self.invoke(
            name,
            params,
            Duration::from_secs_f64(self.python_exec.timeout),
            None,
        )
        .await
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
    use config::Mode;
    use std::path::PathBuf;

    fn invoker_with(backend: Arc<MockBackend>) -> Arc<ToolInvoker> {
        let registry = Arc::new(ToolRegistry::new(
            builtin_descriptors(&config::model::ToolsConfig::default()),
            vec![backend],
            Mode::Running,
        ));
        let staged = Arc::new(StagedConfig::new(PathBuf::from(
            "/tmp/ploston-invoker-test.yaml",
        )));
        ToolInvoker::new(registry, staged, config::model::PythonExecConfig::default())
    }

    fn quick_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: 0.01,
            max_delay: 0.1,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn backoff_schedule_matches_the_formula() {
        let policy = quick_retry(5);
        assert_eq!(policy.delay_for(1), Duration::from_secs_f64(0.01));
        assert_eq!(policy.delay_for(2), Duration::from_secs_f64(0.02));
        assert_eq!(policy.delay_for(3), Duration::from_secs_f64(0.04));
        // Capped by max_delay.
        assert_eq!(policy.delay_for(10), Duration::from_secs_f64(0.1));
    }

    #[test]
    fn nonsense_policies_are_rejected() {
        assert!(RetryPolicy { max_attempts: 0, ..Default::default() }.validate().is_err());
        assert!(RetryPolicy { backoff_multiplier: 0.5, ..Default::default() }
            .validate()
            .is_err());
        assert!(RetryPolicy { initial_delay: 2.0, max_delay: 1.0, ..Default::default() }
            .validate()
            .is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn flaky_tool_succeeds_within_retry_budget() {
        let flaky = MockTool::flaky("flaky", 2, serde_json::json!({"ok": true}));
        let backend = Arc::new(MockBackend::new("srv", vec![flaky.clone()]));
        let invoker = invoker_with(backend);
        invoker.registry().refresh().await;

        let out = invoker
            .invoke(
                "flaky",
                serde_json::json!({}),
                Duration::from_secs(30),
                Some(&quick_retry(3)),
            )
            .await
            .unwrap();

        assert_eq!(out, serde_json::json!({"ok": true}));
        assert_eq!(flaky.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhausted_surfaces_the_error() {
        let always = MockTool::failing_retryable("always", "still down");
        let backend = Arc::new(MockBackend::new("srv", vec![always.clone()]));
        let invoker = invoker_with(backend);
        invoker.registry().refresh().await;

        let err = invoker
            .invoke(
                "always",
                serde_json::json!({}),
                Duration::from_secs(30),
                Some(&quick_retry(3)),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::ToolTimeout);
        assert_eq!(always.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_is_not_retried() {
        let fatal = MockTool::failing_fatal("fatal", "bad params");
        let backend = Arc::new(MockBackend::new("srv", vec![fatal.clone()]));
        let invoker = invoker_with(backend);
        invoker.registry().refresh().await;

        let err = invoker
            .invoke(
                "fatal",
                serde_json::json!({}),
                Duration::from_secs(30),
                Some(&quick_retry(3)),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::ToolRejected);
        assert_eq!(fatal.call_count(), 1);
    }

    #[tokio::test]
    async fn zero_deadline_is_immediate_tool_timeout() {
        let tool = MockTool::returning("quick", serde_json::json!(1));
        let backend = Arc::new(MockBackend::new("srv", vec![tool.clone()]));
        let invoker = invoker_with(backend);
        invoker.registry().refresh().await;

        let err = invoker
            .invoke("quick", serde_json::json!({}), Duration::ZERO, None)
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::ToolTimeout);
        assert_eq!(tool.call_count(), 0);
    }

    #[tokio::test]
    async fn unknown_tool_is_unavailable() {
        let invoker = invoker_with(Arc::new(MockBackend::new("srv", vec![])));
        let err = invoker
            .invoke("ghost", serde_json::json!({}), Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ToolUnavailable);
    }

    #[tokio::test]
    async fn max_attempts_one_means_no_retry() {
        let flaky = MockTool::flaky("flaky", 1, serde_json::json!(true));
        let backend = Arc::new(MockBackend::new("srv", vec![flaky.clone()]));
        let invoker = invoker_with(backend);
        invoker.registry().refresh().await;

        let err = invoker
            .invoke(
                "flaky",
                serde_json::json!({}),
                Duration::from_secs(5),
                Some(&quick_retry(1)),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::ToolTimeout);
        assert_eq!(flaky.call_count(), 1);
    }

    #[tokio::test]
    async fn bare_python_exec_runs_in_empty_context() {
        let invoker = invoker_with(Arc::new(MockBackend::new("srv", vec![])));
        let out = invoker
            .invoke(
                "python_exec",
                serde_json::json!({"code": "return 6 * 7"}),
                Duration::from_secs(5),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!(42));
    }
}
