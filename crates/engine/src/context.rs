//! Per-execution state: inputs, accumulated step outputs, timings.
//!
//! The context is append-only while an execution runs: the engine commits
//! each step's output exactly once, after its final attempt, and nothing
//! else mutates it.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use errors::AelError;

use crate::template::TemplateContext;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Completed,
    Failed,
}

// ---------------------------------------------------------------------------
// Step output
// ---------------------------------------------------------------------------

/// Outcome of one step, committed atomically after its final attempt.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutput {
    pub step_id: String,
    pub status: StepStatus,
    pub output: Value,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AelError>,
}

impl StepOutput {
    pub fn completed(step_id: impl Into<String>, output: Value, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Completed,
            output,
            success: true,
            duration_ms,
            error: None,
        }
    }

    pub fn failed(step_id: impl Into<String>, error: AelError, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed,
            output: Value::Null,
            success: false,
            duration_ms,
            error: Some(error),
        }
    }

    /// `on_error: continue` converts a failure into SKIPPED with a null
    /// output visible to later steps.
    pub fn skipped(step_id: impl Into<String>, error: AelError, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            output: Value::Null,
            success: false,
            duration_ms,
            error: Some(error),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution result
// ---------------------------------------------------------------------------

/// The structured result returned for every execution, failed or not.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub workflow_id: String,
    pub workflow_version: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub inputs: Map<String, Value>,
    pub outputs: Value,
    pub steps: Vec<StepOutput>,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub steps_skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AelError>,
}

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// The per-execution bag visible to templates and code steps.
pub struct ExecutionContext {
    pub execution_id: String,
    pub inputs: Map<String, Value>,
    pub config: Map<String, Value>,
    /// Monotonic start used for timeout accounting.
    pub started: Instant,
    steps: Vec<StepOutput>,
    /// `step_id → serialized StepOutput`, the view templates and code see.
    steps_view: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(inputs: Map<String, Value>, config: Map<String, Value>) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            inputs,
            config,
            started: Instant::now(),
            steps: Vec::new(),
            steps_view: Map::new(),
        }
    }

    /// Commit a step outcome.  Outputs become visible to all later steps
    /// and to output rendering, and are never rewritten.
    pub fn commit_step(&mut self, output: StepOutput) {
        debug_assert!(
            !self.steps_view.contains_key(&output.step_id),
            "step output committed twice"
        );
        let as_value =
            serde_json::to_value(&output).expect("step outputs serialize by construction");
        self.steps_view.insert(output.step_id.clone(), as_value);
        self.steps.push(output);
    }

    pub fn steps(&self) -> &[StepOutput] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<StepOutput> {
        self.steps
    }

    /// (completed, failed, skipped) counters.
    pub fn counters(&self) -> (usize, usize, usize) {
        let mut completed = 0;
        let mut failed = 0;
        let mut skipped = 0;
        for step in &self.steps {
            match step.status {
                StepStatus::Completed => completed += 1,
                StepStatus::Failed => failed += 1,
                StepStatus::Skipped => skipped += 1,
            }
        }
        (completed, failed, skipped)
    }

    /// Read-only view for the template evaluator.
    pub fn template_context(&self) -> TemplateContext<'_> {
        TemplateContext {
            inputs: &self.inputs,
            steps: &self.steps_view,
            config: &self.config,
            execution_id: &self.execution_id,
        }
    }

    /// The `context.steps` value handed to code steps.
    pub fn steps_value(&self) -> Value {
        Value::Object(self.steps_view.clone())
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn committed_outputs_are_visible_in_the_views() {
        let mut ctx = ExecutionContext::new(Map::new(), Map::new());
        ctx.commit_step(StepOutput::completed("a", json!(5), 12));

        let view = ctx.steps_value();
        assert_eq!(view["a"]["output"], json!(5));
        assert_eq!(view["a"]["status"], json!("COMPLETED"));
        assert_eq!(view["a"]["success"], json!(true));

        let tpl = ctx.template_context();
        assert_eq!(tpl.steps["a"]["output"], json!(5));
    }

    #[test]
    fn counters_split_by_status() {
        let mut ctx = ExecutionContext::new(Map::new(), Map::new());
        ctx.commit_step(StepOutput::completed("a", json!(1), 1));
        ctx.commit_step(StepOutput::skipped(
            "b",
            AelError::input_invalid("boom"),
            1,
        ));
        ctx.commit_step(StepOutput::completed("c", json!(2), 1));
        assert_eq!(ctx.counters(), (2, 0, 1));
    }

    #[test]
    fn execution_ids_are_unique() {
        let a = ExecutionContext::new(Map::new(), Map::new());
        let b = ExecutionContext::new(Map::new(), Map::new());
        assert_ne!(a.execution_id, b.execution_id);
    }
}
