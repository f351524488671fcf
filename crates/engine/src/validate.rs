//! Workflow validation — run this before registering a workflow.
//!
//! Rules enforced:
//! 1. Name matches `^[A-Za-z][A-Za-z0-9-]*$` and version is semver-shaped.
//! 2. Steps are non-empty and step IDs are unique.
//! 3. Every `depends_on` references an earlier step (sequential execution
//!    never reorders, so a forward reference can never be satisfied).
//! 4. The dependency graph is acyclic (Kahn's algorithm).
//! 5. Input specs are well formed (enum ⊇ default, pattern compiles and
//!    applies to strings only, bounds apply to numerics and are ordered).
//! 6. Output names are unique.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::OnceLock;

use regex::Regex;

use errors::{AelError, ErrorCode};

use crate::models::{InputType, OutputSource, OutputsDecl, StepAction, Workflow};
use crate::template;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]*$").expect("static pattern"))
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+\.\d+\.\d+([-+][0-9A-Za-z.-]+)?$").expect("static pattern"))
}

fn invalid(detail: impl Into<String>) -> AelError {
    AelError::input_invalid(detail)
}

/// Validate a parsed workflow.
///
/// # Errors
/// - `INPUT_INVALID` for malformed names, specs, or forward references.
/// - `STEP_NOT_FOUND` when `depends_on` names an unknown step.
/// - `CIRCULAR_DEPENDENCY` when the dependency graph has a cycle.
pub fn validate_workflow(workflow: &Workflow) -> Result<(), AelError> {
    if !name_pattern().is_match(&workflow.name) {
        return Err(invalid(format!(
            "workflow name '{}' must match ^[A-Za-z][A-Za-z0-9-]*$",
            workflow.name
        )));
    }
    if !version_pattern().is_match(&workflow.version) {
        return Err(invalid(format!(
            "workflow version '{}' is not semver-shaped",
            workflow.version
        )));
    }

    if workflow.steps.is_empty() {
        return Err(invalid("workflow must have at least one step"));
    }

    // -----------------------------------------------------------------------
    // Step IDs: unique, and depends_on references only earlier steps.
    // -----------------------------------------------------------------------
    let mut seen: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        if !seen.insert(step.id.as_str()) {
            return Err(invalid(format!("duplicate step id: '{}'", step.id)));
        }
        for dep in &step.depends_on {
            if dep == &step.id {
                return Err(AelError::new(ErrorCode::CircularDependency)
                    .with_detail(format!("step '{}' depends on itself", step.id)));
            }
            if workflow.step(dep).is_none() {
                return Err(AelError::new(ErrorCode::StepNotFound)
                    .with_message(format!("Step '{dep}' not found"))
                    .with_detail(format!("referenced from '{}'.depends_on", step.id)));
            }
            if !seen.contains(dep.as_str()) {
                return Err(invalid(format!(
                    "step '{}' depends on '{dep}', which is declared later; \
                     depends_on must reference earlier steps",
                    step.id
                )));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cycle check (Kahn's algorithm).  Earlier-only references already
    // preclude cycles, but the graph check keeps the error precise if the
    // earlier rule ever loosens.
    // -----------------------------------------------------------------------
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    for step in &workflow.steps {
        adjacency.entry(step.id.as_str()).or_default();
        in_degree.entry(step.id.as_str()).or_insert(0);
    }
    for step in &workflow.steps {
        for dep in &step.depends_on {
            adjacency
                .entry(dep.as_str())
                .or_default()
                .push(step.id.as_str());
            *in_degree.entry(step.id.as_str()).or_insert(0) += 1;
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut visited = 0usize;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        if let Some(neighbours) = adjacency.get(id) {
            for &n in neighbours {
                let deg = in_degree.entry(n).or_insert(0);
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(n);
                }
            }
        }
    }
    if visited != workflow.steps.len() {
        return Err(AelError::new(ErrorCode::CircularDependency));
    }

    // -----------------------------------------------------------------------
    // Input specs.
    // -----------------------------------------------------------------------
    let mut input_names: HashSet<&str> = HashSet::new();
    for input in &workflow.inputs {
        if !input_names.insert(input.name.as_str()) {
            return Err(invalid(format!("duplicate input: '{}'", input.name)));
        }
        if let (Some(enum_values), Some(default)) = (&input.enum_values, &input.default) {
            if !enum_values.contains(default) {
                return Err(invalid(format!(
                    "input '{}': default is not a member of enum",
                    input.name
                )));
            }
        }
        if let Some(pattern) = &input.pattern {
            if input.ty != InputType::String {
                return Err(invalid(format!(
                    "input '{}': pattern applies to strings only",
                    input.name
                )));
            }
            Regex::new(pattern).map_err(|e| {
                invalid(format!("input '{}': invalid pattern: {e}", input.name))
            })?;
        }
        if input.minimum.is_some() || input.maximum.is_some() {
            if !matches!(input.ty, InputType::Integer | InputType::Number) {
                return Err(invalid(format!(
                    "input '{}': minimum/maximum apply to numerics only",
                    input.name
                )));
            }
            if let (Some(min), Some(max)) = (input.minimum, input.maximum) {
                if min > max {
                    return Err(invalid(format!(
                        "input '{}': minimum exceeds maximum",
                        input.name
                    )));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Template syntax in params and outputs (variables resolve at run time;
    // only the grammar is checked here).
    // -----------------------------------------------------------------------
    for step in &workflow.steps {
        if let StepAction::Tool { params, .. } = &step.action {
            template::check_document(params).map_err(|e| {
                invalid(format!(
                    "step '{}': {}",
                    step.id,
                    e.detail.unwrap_or(e.message)
                ))
            })?;
        }
    }

    // -----------------------------------------------------------------------
    // Outputs.
    // -----------------------------------------------------------------------
    match &workflow.outputs {
        OutputsDecl::Named(outputs) => {
            let mut names: HashSet<&str> = HashSet::new();
            for output in outputs {
                if !names.insert(output.name.as_str()) {
                    return Err(invalid(format!("duplicate output: '{}'", output.name)));
                }
                if let OutputSource::Value(value) = &output.source {
                    template::check_document(value).map_err(|e| {
                        invalid(format!(
                            "output '{}': {}",
                            output.name,
                            e.detail.unwrap_or(e.message)
                        ))
                    })?;
                }
            }
        }
        OutputsDecl::Single(value) => {
            template::check_document(value)
                .map_err(|e| invalid(e.detail.unwrap_or(e.message)))?;
        }
        OutputsDecl::None => {}
    }

    Ok(())
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_workflow_yaml;

    fn parse(yaml: &str) -> Workflow {
        parse_workflow_yaml(yaml).expect("fixture should parse")
    }

    #[test]
    fn valid_linear_workflow_passes() {
        let wf = parse(
            r#"
name: linear
version: 1.0.0
steps:
  - id: a
    code: "return 1"
  - id: b
    depends_on: [a]
    code: "return 2"
  - id: c
    depends_on: [a, b]
    code: "return 3"
"#,
        );
        validate_workflow(&wf).expect("should be valid");
    }

    #[test]
    fn empty_steps_are_rejected() {
        let wf = parse("name: empty\nsteps: []\n");
        assert!(validate_workflow(&wf).is_err());
    }

    #[test]
    fn duplicate_step_id_is_rejected() {
        let wf = parse(
            "name: dup\nsteps:\n  - id: a\n    code: x\n  - id: a\n    code: y\n",
        );
        let err = validate_workflow(&wf).unwrap_err();
        assert_eq!(err.code, ErrorCode::InputInvalid);
    }

    #[test]
    fn unknown_dependency_is_step_not_found() {
        let wf = parse(
            "name: ghost\nsteps:\n  - id: a\n    depends_on: [phantom]\n    code: x\n",
        );
        let err = validate_workflow(&wf).unwrap_err();
        assert_eq!(err.code, ErrorCode::StepNotFound);
    }

    #[test]
    fn forward_reference_is_rejected() {
        let wf = parse(
            "name: fwd\nsteps:\n  - id: a\n    depends_on: [b]\n    code: x\n  - id: b\n    code: y\n",
        );
        let err = validate_workflow(&wf).unwrap_err();
        assert_eq!(err.code, ErrorCode::InputInvalid);
    }

    #[test]
    fn self_dependency_is_circular() {
        let wf = parse("name: loopy\nsteps:\n  - id: a\n    depends_on: [a]\n    code: x\n");
        let err = validate_workflow(&wf).unwrap_err();
        assert_eq!(err.code, ErrorCode::CircularDependency);
    }

    #[test]
    fn bad_workflow_name_is_rejected() {
        let wf = parse("name: okay\nsteps:\n  - id: a\n    code: x\n");
        let mut wf = wf;
        wf.name = "9starts-with-digit".to_string();
        assert!(validate_workflow(&wf).is_err());
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut wf = parse("name: okay\nsteps:\n  - id: a\n    code: x\n");
        wf.version = "one.two".to_string();
        assert!(validate_workflow(&wf).is_err());
    }

    #[test]
    fn enum_must_contain_default() {
        let wf = parse(
            r#"
name: enums
inputs:
  - mode:
      type: string
      enum: [fast, slow]
      default: medium
steps:
  - id: a
    code: x
"#,
        );
        assert!(validate_workflow(&wf).is_err());
    }

    #[test]
    fn pattern_on_integer_is_rejected() {
        let wf = parse(
            r#"
name: pat
inputs:
  - count:
      type: integer
      pattern: "^[0-9]+$"
steps:
  - id: a
    code: x
"#,
        );
        assert!(validate_workflow(&wf).is_err());
    }
}
