//! Workflow execution engine.
//!
//! `Engine` is the central orchestrator:
//! 1. Resolves the workflow and validates inputs against its specs.
//! 2. Iterates through steps strictly in declaration order.
//! 3. Renders tool params through the template evaluator, dispatches to
//!    the tool invoker or the sandbox, and commits one `StepOutput` per
//!    step to the execution context.
//! 4. Applies the per-step error policy (`fail` / `continue` / `retry`).
//! 5. Renders the declared outputs and returns an `ExecutionResult` with
//!    timings and counters, failed or not.
//!
//! Concurrent executions are admitted through a semaphore sized by
//! `execution.max_concurrent`; each execution owns its context and never
//! observes another's state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

use config::AelConfig;
use errors::{AelError, ErrorCode};
use regex::Regex;
use sandbox::{Sandbox, SandboxConfig, SandboxContext};
use tools::{RetryPolicy, ToolInvoker, WorkflowRunner};

use crate::context::{ExecutionContext, ExecutionResult, ExecutionStatus, StepOutput};
use crate::models::{
    InputSpec, InputType, OnError, OutputSource, OutputsDecl, Step, StepAction, Workflow,
};
use crate::registry::WorkflowRegistry;
use crate::template;

// ---------------------------------------------------------------------------
// Effective step configuration
// ---------------------------------------------------------------------------

/// Hard-coded fallbacks, used when neither step, workflow defaults, nor
/// system config say otherwise.
const DEFAULT_TIMEOUT_SECONDS: f64 = 30.0;

#[derive(Debug, Clone)]
struct StepConfig {
    timeout: Duration,
    on_error: OnError,
    retry: RetryPolicy,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Drives workflow executions.  One engine per process, shared by the
/// frontend and the CLI; construct it with the service container in
/// `main` and wire it into the invoker as the workflow runner.
pub struct Engine {
    workflows: Arc<WorkflowRegistry>,
    invoker: Arc<ToolInvoker>,
    execution: config::model::ExecutionConfig,
    python_exec: config::model::PythonExecConfig,
    admission: Semaphore,
}

impl Engine {
    pub fn new(
        workflows: Arc<WorkflowRegistry>,
        invoker: Arc<ToolInvoker>,
        config: &AelConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            workflows,
            invoker,
            execution: config.execution.clone(),
            python_exec: config.python_exec.clone(),
            admission: Semaphore::new(config.execution.max_concurrent.max(1)),
        })
    }

    pub fn workflows(&self) -> &Arc<WorkflowRegistry> {
        &self.workflows
    }

    /// Execute a workflow by name.
    ///
    /// # Errors
    /// `WORKFLOW_NOT_FOUND` if the name does not resolve.  Execution
    /// failures (bad inputs, failed steps, output errors) are reported
    /// inside the returned `ExecutionResult`, not as `Err`.
    #[instrument(skip(self, inputs), fields(workflow_id = %workflow_id))]
    pub async fn execute(
        &self,
        workflow_id: &str,
        inputs: Value,
    ) -> Result<ExecutionResult, AelError> {
        let workflow = self.workflows.get_or_err(workflow_id)?;

        let _permit = self
            .admission
            .acquire()
            .await
            .map_err(|_| AelError::internal("admission semaphore closed"))?;

        Ok(self.execute_workflow(&workflow, inputs).await)
    }

    /// Execute a workflow definition directly (testing, ad-hoc runs).
    pub async fn execute_workflow(&self, workflow: &Workflow, inputs: Value) -> ExecutionResult {
        let started_at = Utc::now();
        let raw_inputs = match inputs {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => {
                return self.failed_result(
                    workflow,
                    Map::new(),
                    Vec::new(),
                    started_at,
                    AelError::input_invalid("workflow inputs must be an object"),
                )
            }
        };

        // Validate, default, and coerce inputs before anything runs.
        let validated = match validate_inputs(&workflow.inputs, raw_inputs) {
            Ok(v) => v,
            Err(e) => {
                return self.failed_result(workflow, Map::new(), Vec::new(), started_at, e)
            }
        };

        let mut ctx = ExecutionContext::new(validated, Map::new());
        info!(
            execution_id = %ctx.execution_id,
            workflow = %workflow.name,
            "starting workflow execution"
        );

        let mut failure: Option<AelError> = None;
        for step in &workflow.steps {
            let step_config = self.step_config(step, workflow);
            let outcome = self.run_step(workflow, step, &step_config, &ctx).await;

            let stop = outcome.status == crate::context::StepStatus::Failed;
            let step_error = outcome.error.clone();
            ctx.commit_step(outcome);

            if stop {
                error!(step_id = %step.id, "step failed, aborting execution");
                failure = Some(step_error.unwrap_or_else(|| {
                    AelError::internal(format!("step '{}' failed without an error", step.id))
                }));
                break;
            }
        }

        // Outputs render only after a fully successful pass; an undefined
        // path fails the whole execution.
        let mut outputs = Value::Null;
        if failure.is_none() {
            match compute_outputs(workflow, &ctx) {
                Ok(v) => outputs = v,
                Err(e) => failure = Some(e),
            }
        }

        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
        let (steps_completed, steps_failed, steps_skipped) = ctx.counters();
        let status = if failure.is_none() {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };

        info!(
            execution_id = %ctx.execution_id,
            status = ?status,
            duration_ms,
            "workflow execution finished"
        );

        ExecutionResult {
            execution_id: ctx.execution_id.clone(),
            workflow_id: workflow.name.clone(),
            workflow_version: workflow.version.clone(),
            status,
            started_at,
            completed_at,
            duration_ms,
            inputs: ctx.inputs.clone(),
            outputs,
            steps: ctx.into_steps(),
            steps_completed,
            steps_failed,
            steps_skipped,
            error: failure,
        }
    }

    fn failed_result(
        &self,
        workflow: &Workflow,
        inputs: Map<String, Value>,
        steps: Vec<StepOutput>,
        started_at: chrono::DateTime<Utc>,
        error: AelError,
    ) -> ExecutionResult {
        let completed_at = Utc::now();
        ExecutionResult {
            execution_id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow.name.clone(),
            workflow_version: workflow.version.clone(),
            status: ExecutionStatus::Failed,
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds().max(0) as u64,
            inputs,
            outputs: Value::Null,
            steps,
            steps_completed: 0,
            steps_failed: 0,
            steps_skipped: 0,
            error: Some(error),
        }
    }

    // -----------------------------------------------------------------------
    // Single step
    // -----------------------------------------------------------------------

    async fn run_step(
        &self,
        workflow: &Workflow,
        step: &Step,
        step_config: &StepConfig,
        ctx: &ExecutionContext,
    ) -> StepOutput {
        let started = Instant::now();
        let result = match &step.action {
            StepAction::Tool { tool, params } => {
                self.run_tool_step(tool, params, step_config, ctx).await
            }
            StepAction::Code { code } => {
                self.run_code_step(workflow, code, step_config, ctx).await
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => StepOutput::completed(&step.id, output, duration_ms),
            Err(error) => {
                if step_config.on_error == OnError::Continue {
                    warn!(step_id = %step.id, error = %error, "step failed, continuing");
                    StepOutput::skipped(&step.id, error, duration_ms)
                } else {
                    StepOutput::failed(&step.id, error, duration_ms)
                }
            }
        }
    }

    async fn run_tool_step(
        &self,
        tool: &str,
        params: &Value,
        step_config: &StepConfig,
        ctx: &ExecutionContext,
    ) -> Result<Value, AelError> {
        // Template errors fail the step before dispatch.
        let rendered = template::render(params, &ctx.template_context())?;

        let retry = (step_config.on_error == OnError::Retry).then_some(&step_config.retry);
        self.invoker
            .invoke(tool, rendered, step_config.timeout, retry)
            .await
    }

    async fn run_code_step(
        &self,
        workflow: &Workflow,
        code: &str,
        step_config: &StepConfig,
        ctx: &ExecutionContext,
    ) -> Result<Value, AelError> {
        let (profile, mut additional) = workflow.effective_packages();
        additional.extend(self.python_exec.allowed_imports.iter().cloned());

        let sandbox = Sandbox::new(SandboxConfig::for_profile(
            profile,
            &additional,
            step_config.timeout,
            10,
        ));
        let sandbox_ctx = SandboxContext {
            inputs: Value::Object(ctx.inputs.clone()),
            steps: ctx.steps_value(),
            config: Value::Object(ctx.config.clone()),
            execution_id: ctx.execution_id.clone(),
            tools: self.invoker.clone(),
        };

        // The sandbox's own failures are never retryable; a retryable
        // error can still surface from a tool call made inside the
        // fragment, so `on_error: retry` re-runs the fragment for those.
        let retry = (step_config.on_error == OnError::Retry).then_some(&step_config.retry);
        let max_attempts = retry.map(|r| r.max_attempts.max(1)).unwrap_or(1);
        let deadline = Instant::now() + step_config.timeout;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match sandbox.execute(code, sandbox_ctx.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            if !err.retryable || attempt >= max_attempts {
                return Err(err);
            }
            let delay = retry.expect("attempts > 1 implies a policy").delay_for(attempt);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(err);
            }
            tokio::time::sleep(delay.min(remaining)).await;
        }
    }

    /// Effective timeout / on_error / retry for a step via the precedence
    /// step > workflow defaults > system config > hard-coded defaults.
    fn step_config(&self, step: &Step, workflow: &Workflow) -> StepConfig {
        let defaults = workflow.defaults.as_ref();

        let timeout_seconds = step
            .timeout
            .or_else(|| defaults.and_then(|d| d.timeout))
            .unwrap_or(if self.execution.default_timeout > 0.0 {
                self.execution.default_timeout
            } else {
                DEFAULT_TIMEOUT_SECONDS
            });

        let on_error = step
            .on_error
            .or_else(|| defaults.and_then(|d| d.on_error))
            .unwrap_or(OnError::Fail);

        let retry = step
            .retry
            .clone()
            .or_else(|| defaults.and_then(|d| d.retry.clone()))
            .unwrap_or(RetryPolicy {
                max_attempts: self.execution.retry.max_attempts,
                backoff_multiplier: self.execution.retry.backoff_multiplier,
                ..RetryPolicy::default()
            });

        StepConfig {
            timeout: Duration::from_secs_f64(timeout_seconds.max(0.0)),
            on_error,
            retry,
        }
    }
}

/// `workflow:<name>` tools dispatch back here through the invoker.
#[async_trait]
impl WorkflowRunner for Engine {
    async fn run_workflow(&self, name: &str, inputs: Value) -> Result<Value, AelError> {
        let result = self.execute(name, inputs).await?;
        match result.status {
            ExecutionStatus::Completed => Ok(result.outputs),
            ExecutionStatus::Failed => Err(result
                .error
                .unwrap_or_else(|| AelError::internal("workflow failed without an error"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Input validation
// ---------------------------------------------------------------------------

/// Validate provided inputs against the specs: apply defaults, enforce
/// requiredness, types, enum membership, pattern, and bounds.  Coercion
/// is permissive but never lossy (3.0 → 3; 3.2 → error for integers).
fn validate_inputs(
    specs: &[InputSpec],
    mut provided: Map<String, Value>,
) -> Result<Map<String, Value>, AelError> {
    let mut errors: Vec<String> = Vec::new();

    for spec in specs {
        let value = match provided.remove(&spec.name) {
            Some(v) => v,
            None => match (&spec.default, spec.required) {
                (Some(default), _) => default.clone(),
                (None, true) => {
                    errors.push(format!("missing required input: {}", spec.name));
                    continue;
                }
                (None, false) => continue,
            },
        };

        match coerce(&value, spec.ty) {
            Ok(coerced) => {
                if let Err(e) = check_constraints(spec, &coerced) {
                    errors.push(e);
                } else {
                    provided.insert(spec.name.clone(), coerced);
                }
            }
            Err(e) => errors.push(format!("input '{}': {e}", spec.name)),
        }
    }

    if errors.is_empty() {
        Ok(provided)
    } else {
        Err(AelError::new(ErrorCode::InputInvalid)
            .with_message("Invalid workflow input")
            .with_detail(errors.join("; ")))
    }
}

fn coerce(value: &Value, ty: InputType) -> Result<Value, String> {
    match ty {
        InputType::String => match value {
            Value::String(_) => Ok(value.clone()),
            _ => Err("expected a string".to_string()),
        },
        InputType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            _ => Err("expected a boolean".to_string()),
        },
        InputType::Array => match value {
            Value::Array(_) => Ok(value.clone()),
            _ => Err("expected an array".to_string()),
        },
        InputType::Object => match value {
            Value::Object(_) => Ok(value.clone()),
            _ => Err("expected an object".to_string()),
        },
        InputType::Integer => match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(json!(i))
                } else if let Some(f) = n.as_f64() {
                    // Integer-valued numbers coerce; fractional never do.
                    if f.fract() == 0.0 {
                        Ok(json!(f as i64))
                    } else {
                        Err(format!("{f} is not an integer"))
                    }
                } else {
                    Err("expected an integer".to_string())
                }
            }
            _ => Err("expected an integer".to_string()),
        },
        InputType::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            _ => Err("expected a number".to_string()),
        },
    }
}

fn check_constraints(spec: &InputSpec, value: &Value) -> Result<(), String> {
    if let Some(enum_values) = &spec.enum_values {
        if !enum_values.contains(value) {
            return Err(format!(
                "input '{}': value is not one of the allowed values",
                spec.name
            ));
        }
    }

    if let Some(pattern) = &spec.pattern {
        let text = value.as_str().unwrap_or_default();
        let re = Regex::new(pattern).map_err(|e| format!("input '{}': {e}", spec.name))?;
        if !re.is_match(text) {
            return Err(format!(
                "input '{}': value does not match pattern {pattern}",
                spec.name
            ));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = spec.minimum {
            if n < min {
                return Err(format!("input '{}': {n} is below minimum {min}", spec.name));
            }
        }
        if let Some(max) = spec.maximum {
            if n > max {
                return Err(format!("input '{}': {n} exceeds maximum {max}", spec.name));
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

fn compute_outputs(workflow: &Workflow, ctx: &ExecutionContext) -> Result<Value, AelError> {
    let tpl = ctx.template_context();
    match &workflow.outputs {
        OutputsDecl::None => Ok(Value::Null),
        OutputsDecl::Single(expr) => template::render(expr, &tpl),
        OutputsDecl::Named(specs) => {
            let mut out = Map::with_capacity(specs.len());
            for spec in specs {
                let value = match &spec.source {
                    OutputSource::FromPath(path) => template::resolve_path(path, &tpl)?,
                    OutputSource::Value(expr) => template::render(expr, &tpl)?,
                };
                out.insert(spec.name.clone(), value);
            }
            Ok(Value::Object(out))
        }
    }
}
