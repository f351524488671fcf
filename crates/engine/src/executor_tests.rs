//! Integration tests for the workflow execution engine.
//!
//! These tests drive the real engine, invoker, and sandbox against an
//! in-process `MockBackend`, so no MCP subprocess is required.  Retry
//! timing tests run under tokio's paused clock so back-off sleeps are
//! virtual and deterministic.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};

use config::{AelConfig, Mode, StagedConfig};
use errors::ErrorCode;
use tools::builtin::builtin_descriptors;
use tools::mock::{MockBackend, MockTool};
use tools::{ToolInvoker, ToolRegistry};

use crate::context::{ExecutionStatus, StepStatus};
use crate::executor::Engine;
use crate::parser::parse_workflow_yaml;
use crate::registry::WorkflowRegistry;
use crate::validate::validate_workflow;

struct Harness {
    engine: Arc<Engine>,
}

async fn harness_with(
    tools: Vec<Arc<MockTool>>,
    workflows: Arc<WorkflowRegistry>,
) -> Harness {
    let backend = Arc::new(MockBackend::new("test", tools));
    let registry = Arc::new(ToolRegistry::new(
        builtin_descriptors(&config::model::ToolsConfig::default()),
        vec![backend.clone()],
        Mode::Running,
    ));
    let staged = Arc::new(StagedConfig::new(PathBuf::from(
        "/tmp/ploston-executor-test.yaml",
    )));
    let invoker = ToolInvoker::new(
        registry.clone(),
        staged,
        config::model::PythonExecConfig::default(),
    );
    workflows.sync_tools(&registry);
    registry.refresh().await;

    let engine = Engine::new(workflows, invoker.clone(), &AelConfig::default());
    invoker.set_workflow_runner(engine.clone());
    Harness { engine }
}

async fn harness(tools: Vec<Arc<MockTool>>) -> Harness {
    harness_with(tools, WorkflowRegistry::empty()).await
}

fn workflow(yaml: &str) -> crate::models::Workflow {
    let wf = parse_workflow_yaml(yaml).expect("fixture parses");
    validate_workflow(&wf).expect("fixture validates");
    wf
}

// ============================================================
// Happy path
// ============================================================

#[tokio::test]
async fn two_code_steps_propagate_output() {
    let h = harness(vec![]).await;
    let wf = workflow(
        r#"
name: happy
version: 1.0.0
steps:
  - id: a
    code: "return 2 + 3"
  - id: b
    code: "return context.steps['a'].output * 2"
output: "{{ steps.b.output }}"
"#,
    );

    let result = h.engine.execute_workflow(&wf, json!({})).await;

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.outputs, json!(10));
    assert_eq!(result.steps.len(), 2);
    assert!(result.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(result.steps_completed, 2);
    assert_eq!(result.workflow_id, "happy");
    assert_eq!(result.workflow_version, "1.0.0");
}

#[tokio::test]
async fn identical_inputs_give_identical_outputs_and_ordering() {
    let wf_yaml = r#"
name: det
version: 1.0.0
inputs:
  - n:
      type: integer
steps:
  - id: double
    code: "return context.inputs.n * 2"
  - id: fmt
    code: "return str(context.steps['double'].output)"
outputs:
  doubled:
    from_path: steps.double.output
  text:
    from_path: steps.fmt.output
"#;
    let h = harness(vec![]).await;
    let wf = workflow(wf_yaml);

    let first = h.engine.execute_workflow(&wf, json!({"n": 21})).await;
    let second = h.engine.execute_workflow(&wf, json!({"n": 21})).await;

    assert_eq!(first.outputs, second.outputs);
    assert_eq!(first.outputs, json!({"doubled": 42, "text": "42"}));
    let order1: Vec<&str> = first.steps.iter().map(|s| s.step_id.as_str()).collect();
    let order2: Vec<&str> = second.steps.iter().map(|s| s.step_id.as_str()).collect();
    assert_eq!(order1, order2);
}

// ============================================================
// Retry
// ============================================================

#[tokio::test(start_paused = true)]
async fn flaky_tool_recovers_within_retry_budget() {
    let flaky = MockTool::flaky("flaky", 2, json!({"ok": true}));
    let h = harness(vec![flaky.clone()]).await;
    let wf = workflow(
        r#"
name: retrying
version: 1.0.0
steps:
  - id: call
    tool: flaky
    on_error: retry
    retry:
      max_attempts: 3
      initial_delay: 0.01
      max_delay: 0.1
      backoff_multiplier: 2
output: "{{ steps.call.output.ok }}"
"#,
    );

    let started = tokio::time::Instant::now();
    let result = h.engine.execute_workflow(&wf, json!({})).await;
    let elapsed = started.elapsed();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.outputs, json!(true));
    assert_eq!(flaky.call_count(), 3);
    // Two back-off sleeps: 0.01 s then 0.02 s of virtual time.
    assert!(elapsed >= std::time::Duration::from_millis(30));
    assert!(elapsed < std::time::Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn retry_exhaustion_fails_the_execution() {
    let flaky = MockTool::flaky("flaky", 10, json!(null));
    let h = harness(vec![flaky.clone()]).await;
    let wf = workflow(
        r#"
name: exhausted
version: 1.0.0
steps:
  - id: call
    tool: flaky
    on_error: retry
    retry:
      max_attempts: 3
      initial_delay: 0.01
      max_delay: 0.1
      backoff_multiplier: 2
"#,
    );

    let result = h.engine.execute_workflow(&wf, json!({})).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(flaky.call_count(), 3);
    assert_eq!(result.error.unwrap().code, ErrorCode::ToolTimeout);
}

// ============================================================
// Sandbox security
// ============================================================

#[tokio::test]
async fn forbidden_import_fails_with_code_security() {
    let h = harness(vec![]).await;
    let wf = workflow(
        r#"
name: locked-down
version: 1.0.0
steps:
  - id: naughty
    code: "import os\nreturn os.getcwd()"
  - id: never
    code: "return 1"
"#,
    );

    let result = h.engine.execute_workflow(&wf, json!({})).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error.as_ref().unwrap().code, ErrorCode::CodeSecurity);
    // The failing step is recorded; the later step never ran.
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.steps[0].status, StepStatus::Failed);
}

#[tokio::test]
async fn workflow_packages_extend_the_allowlist() {
    let h = harness(vec![]).await;
    // `hashlib` is not in the minimal profile, but the standard profile
    // admits it.
    let wf = workflow(
        r#"
name: hashing
version: 1.0.0
packages:
  profile: standard
steps:
  - id: digest
    code: "import hashlib\nreturn hashlib.sha256('abc')"
"#,
    );

    let result = h.engine.execute_workflow(&wf, json!({})).await;
    assert_eq!(result.status, ExecutionStatus::Completed);
    let digest = result.steps[0].output.as_str().unwrap();
    assert_eq!(digest.len(), 64);
}

// ============================================================
// Template errors
// ============================================================

#[tokio::test]
async fn template_miss_fails_before_dispatch() {
    let echo = MockTool::returning("echo", json!({}));
    let h = harness(vec![echo.clone()]).await;
    let wf = workflow(
        r#"
name: misses
version: 1.0.0
steps:
  - id: call
    tool: echo
    params:
      url: "{{ inputs.missing }}"
"#,
    );

    let result = h.engine.execute_workflow(&wf, json!({})).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error.as_ref().unwrap().code, ErrorCode::TemplateError);
    assert_eq!(result.steps_completed, 0);
    // The tool was never reached.
    assert_eq!(echo.call_count(), 0);
}

#[tokio::test]
async fn undefined_output_path_fails_the_execution() {
    let h = harness(vec![]).await;
    let wf = workflow(
        r#"
name: bad-output
version: 1.0.0
steps:
  - id: a
    code: "return 1"
outputs:
  value:
    from_path: steps.a.output.not_there
"#,
    );

    let result = h.engine.execute_workflow(&wf, json!({})).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error.unwrap().code, ErrorCode::TemplateError);
    // The step itself completed; only output rendering failed.
    assert_eq!(result.steps_completed, 1);
}

// ============================================================
// on_error: continue
// ============================================================

#[tokio::test]
async fn continue_records_skipped_and_later_steps_see_null() {
    let h = harness(vec![]).await;
    let wf = workflow(
        r#"
name: resilient
version: 1.0.0
steps:
  - id: first
    on_error: continue
    code: "return 1 / 0"
  - id: second
    code: "return context.steps['first'].output"
output: "{{ steps.second.output | default('was-null') }}"
"#,
    );

    let result = h.engine.execute_workflow(&wf, json!({})).await;

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.steps_completed, 1);
    assert_eq!(result.steps_skipped, 1);
    assert_eq!(result.steps_failed, 0);
    assert_eq!(result.steps[0].status, StepStatus::Skipped);
    assert_eq!(result.steps[0].output, Value::Null);
    assert_eq!(result.steps[1].output, Value::Null);
    assert_eq!(result.outputs, json!("was-null"));
}

#[tokio::test]
async fn continue_on_the_last_step_still_completes() {
    let h = harness(vec![]).await;
    let wf = workflow(
        r#"
name: tail-skip
version: 1.0.0
steps:
  - id: ok
    code: "return 'fine'"
  - id: flaky-tail
    on_error: continue
    code: "return missing_name"
"#,
    );

    let result = h.engine.execute_workflow(&wf, json!({})).await;
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.steps[1].status, StepStatus::Skipped);
}

// ============================================================
// Input validation
// ============================================================

#[tokio::test]
async fn out_of_bounds_input_is_rejected_before_any_step() {
    let h = harness(vec![]).await;
    let wf = workflow(
        r#"
name: bounded
version: 1.0.0
inputs:
  - count:
      type: integer
      minimum: 1
      maximum: 100
steps:
  - id: a
    code: "return context.inputs.count"
"#,
    );

    let result = h.engine.execute_workflow(&wf, json!({"count": 0})).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error.unwrap().code, ErrorCode::InputInvalid);
    assert!(result.steps.is_empty());
}

#[tokio::test]
async fn integer_valued_number_coerces_but_fraction_does_not() {
    let h = harness(vec![]).await;
    let wf = workflow(
        r#"
name: coercion
version: 1.0.0
inputs:
  - count:
      type: integer
steps:
  - id: a
    code: "return context.inputs.count + 1"
"#,
    );

    let ok = h.engine.execute_workflow(&wf, json!({"count": 3.0})).await;
    assert_eq!(ok.status, ExecutionStatus::Completed);
    assert_eq!(ok.steps[0].output, json!(4));

    let bad = h.engine.execute_workflow(&wf, json!({"count": 3.5})).await;
    assert_eq!(bad.status, ExecutionStatus::Failed);
    assert_eq!(bad.error.unwrap().code, ErrorCode::InputInvalid);
}

#[tokio::test]
async fn defaults_and_enum_are_applied() {
    let h = harness(vec![]).await;
    let wf = workflow(
        r#"
name: enums
version: 1.0.0
inputs:
  - mode:
      type: string
      enum: [fast, slow]
      default: fast
steps:
  - id: a
    code: "return context.inputs.mode"
"#,
    );

    let defaulted = h.engine.execute_workflow(&wf, json!({})).await;
    assert_eq!(defaulted.steps[0].output, json!("fast"));

    let invalid = h.engine.execute_workflow(&wf, json!({"mode": "medium"})).await;
    assert_eq!(invalid.status, ExecutionStatus::Failed);
}

// ============================================================
// Timeouts
// ============================================================

#[tokio::test]
async fn zero_timeout_tool_step_times_out_immediately() {
    let tool = MockTool::returning("slowish", json!(1));
    let h = harness(vec![tool.clone()]).await;
    let wf = workflow(
        r#"
name: hurried
version: 1.0.0
steps:
  - id: call
    tool: slowish
    timeout: 0
"#,
    );

    let result = h.engine.execute_workflow(&wf, json!({})).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error.unwrap().code, ErrorCode::ToolTimeout);
    assert_eq!(tool.call_count(), 0);
}

#[tokio::test]
async fn zero_timeout_code_step_times_out_immediately() {
    let h = harness(vec![]).await;
    let wf = workflow(
        r#"
name: hurried-code
version: 1.0.0
steps:
  - id: think
    code: "return 1"
    timeout: 0
"#,
    );

    let result = h.engine.execute_workflow(&wf, json!({})).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error.unwrap().code, ErrorCode::CodeTimeout);
}

// ============================================================
// Registry resolution, workflow-as-tool, admission
// ============================================================

#[tokio::test]
async fn unknown_workflow_is_workflow_not_found() {
    let h = harness(vec![]).await;
    let err = h.engine.execute("ghost", json!({})).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::WorkflowNotFound);
}

#[tokio::test]
async fn code_step_can_call_a_nested_workflow_tool() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("inner.yaml"),
        r#"
name: inner
version: 1.0.0
inputs:
  - n:
      type: integer
steps:
  - id: double
    code: "return context.inputs.n * 2"
output: "{{ steps.double.output }}"
"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("outer.yaml"),
        r#"
name: outer
version: 1.0.0
steps:
  - id: delegate
    tool: "workflow:inner"
    params:
      n: 5
output: "{{ steps.delegate.output }}"
"#,
    )
    .unwrap();

    let workflows = WorkflowRegistry::load(dir.path()).unwrap();
    let h = harness_with(vec![], workflows).await;

    let result = h.engine.execute("outer", json!({})).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.outputs, json!(10));
}

#[tokio::test]
async fn concurrent_executions_all_complete_under_admission_bound() {
    let h = Arc::new(harness(vec![]).await);
    let wf = Arc::new(workflow(
        "name: tiny\nversion: 1.0.0\nsteps:\n  - id: a\n    code: \"return 7\"\n",
    ));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let h = h.clone();
        let wf = wf.clone();
        handles.push(tokio::spawn(async move {
            h.engine.execute_workflow(&wf, json!({})).await
        }));
    }
    for handle in handles {
        let result = handle.await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.steps[0].output, json!(7));
    }
}

// ============================================================
// Mock backend sanity (kept close to the engine tests that rely on it)
// ============================================================

#[tokio::test]
async fn mock_tool_records_rendered_params() {
    let echo = MockTool::returning("echo", json!({"ack": true}));
    let h = harness(vec![echo.clone()]).await;
    let wf = workflow(
        r#"
name: params
version: 1.0.0
inputs:
  - url
steps:
  - id: call
    tool: echo
    params:
      url: "{{ inputs.url }}"
      fixed: 1
"#,
    );

    let result = h
        .engine
        .execute_workflow(&wf, json!({"url": "https://example.org"}))
        .await;

    assert_eq!(result.status, ExecutionStatus::Completed);
    let seen = echo.calls.lock().unwrap();
    assert_eq!(seen[0], json!({"url": "https://example.org", "fixed": 1}));
}

#[tokio::test]
async fn backend_not_offering_the_tool_is_unavailable() {
    let h = harness(vec![]).await;
    let wf = workflow(
        "name: nada\nversion: 1.0.0\nsteps:\n  - id: a\n    tool: nonexistent\n",
    );
    let result = h.engine.execute_workflow(&wf, json!({})).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error.unwrap().code, ErrorCode::ToolUnavailable);
}
