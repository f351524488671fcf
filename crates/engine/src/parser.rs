//! Workflow YAML parsing.
//!
//! Admissible input shapes:
//! - bare string        ⇒ required string input,
//! - `{name: default}`  ⇒ optional input with that default,
//! - `{name: {type: …}}`⇒ full spec.
//!
//! Outputs accept a single `output` expression, a list of named specs, or
//! a `{name: {from_path|value}}` mapping; `output` and `outputs` are
//! mutually exclusive.

use serde_json::Value;
use serde_yaml::Value as Yaml;

use errors::AelError;
use sandbox::PackageProfile;
use tools::RetryPolicy;

use crate::models::{
    Defaults, InputSpec, InputType, OnError, OutputSource, OutputSpec, OutputsDecl, PackagesSpec,
    Step, StepAction, Workflow,
};

fn invalid(detail: impl Into<String>) -> AelError {
    AelError::input_invalid(detail)
}

/// Parse YAML content into a [`Workflow`].
///
/// Structural problems are `INPUT_INVALID`; semantic checks (unique ids,
/// DAG shape, …) live in the validator.
pub fn parse_workflow_yaml(content: &str) -> Result<Workflow, AelError> {
    let doc: Yaml =
        serde_yaml::from_str(content).map_err(|e| invalid(format!("invalid YAML: {e}")))?;
    let Yaml::Mapping(root) = doc else {
        return Err(invalid("workflow document must be a mapping"));
    };

    let name = str_field(&root, "name")?.ok_or_else(|| invalid("workflow name is required"))?;
    let version = str_field(&root, "version")?.unwrap_or_else(|| "1.0.0".to_string());
    let description = str_field(&root, "description")?;

    let packages = match root.get("packages") {
        Some(raw) => Some(parse_packages(raw)?),
        None => None,
    };
    let defaults = match root.get("defaults") {
        Some(raw) => Some(parse_defaults(raw)?),
        None => None,
    };

    let inputs = match root.get("inputs") {
        Some(raw) => parse_inputs(raw)?,
        None => Vec::new(),
    };

    let steps_raw = root
        .get("steps")
        .ok_or_else(|| invalid("workflow must declare steps"))?;
    let Yaml::Sequence(steps_raw) = steps_raw else {
        return Err(invalid("steps must be a list"));
    };
    let steps = steps_raw
        .iter()
        .map(parse_step)
        .collect::<Result<Vec<_>, _>>()?;

    let outputs = parse_outputs(&root)?;

    Ok(Workflow {
        name,
        version,
        description,
        packages,
        defaults,
        inputs,
        steps,
        outputs,
    })
}

fn str_field(map: &serde_yaml::Mapping, key: &str) -> Result<Option<String>, AelError> {
    match map.get(key) {
        None => Ok(None),
        Some(Yaml::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(invalid(format!("'{key}' must be a string"))),
    }
}

fn f64_field(map: &serde_yaml::Mapping, key: &str) -> Result<Option<f64>, AelError> {
    match map.get(key) {
        None => Ok(None),
        Some(Yaml::Number(n)) => Ok(n.as_f64()),
        Some(_) => Err(invalid(format!("'{key}' must be a number"))),
    }
}

fn parse_packages(raw: &Yaml) -> Result<PackagesSpec, AelError> {
    let Yaml::Mapping(map) = raw else {
        return Err(invalid("packages must be a mapping"));
    };
    let profile = match str_field(map, "profile")? {
        None => PackageProfile::Standard,
        Some(name) => match name.as_str() {
            "minimal" => PackageProfile::Minimal,
            "standard" => PackageProfile::Standard,
            "data_science" => PackageProfile::DataScience,
            other => return Err(invalid(format!("unknown package profile '{other}'"))),
        },
    };
    let additional = match map.get("additional") {
        None => Vec::new(),
        Some(Yaml::Sequence(items)) => items
            .iter()
            .map(|i| match i {
                Yaml::String(s) => Ok(s.clone()),
                _ => Err(invalid("packages.additional entries must be strings")),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(invalid("packages.additional must be a list")),
    };
    Ok(PackagesSpec { profile, additional })
}

fn parse_retry(raw: &Yaml) -> Result<RetryPolicy, AelError> {
    let policy: RetryPolicy = serde_yaml::from_value(raw.clone())
        .map_err(|e| invalid(format!("invalid retry spec: {e}")))?;
    policy.validate()?;
    Ok(policy)
}

fn parse_on_error(map: &serde_yaml::Mapping) -> Result<Option<OnError>, AelError> {
    match str_field(map, "on_error")? {
        None => Ok(None),
        Some(s) => OnError::parse(&s)
            .map(Some)
            .ok_or_else(|| invalid(format!("on_error must be fail|continue|retry, got '{s}'"))),
    }
}

fn parse_defaults(raw: &Yaml) -> Result<Defaults, AelError> {
    let Yaml::Mapping(map) = raw else {
        return Err(invalid("defaults must be a mapping"));
    };
    Ok(Defaults {
        timeout: f64_field(map, "timeout")?,
        on_error: parse_on_error(map)?,
        retry: match map.get("retry") {
            Some(raw) => Some(parse_retry(raw)?),
            None => None,
        },
    })
}

fn parse_inputs(raw: &Yaml) -> Result<Vec<InputSpec>, AelError> {
    let Yaml::Sequence(items) = raw else {
        return Err(invalid("inputs must be a list"));
    };

    let mut inputs = Vec::new();
    for item in items {
        match item {
            // Bare string: required string input.
            Yaml::String(name) => inputs.push(InputSpec::required_string(name.clone())),
            Yaml::Mapping(map) => {
                for (key, value) in map {
                    let Yaml::String(name) = key else {
                        return Err(invalid("input names must be strings"));
                    };
                    match value {
                        // Full spec.
                        Yaml::Mapping(spec) => inputs.push(parse_full_input(name, spec)?),
                        // Shorthand default.
                        other => inputs.push(InputSpec {
                            name: name.clone(),
                            ty: InputType::String,
                            required: false,
                            default: Some(yaml_to_json(other)?),
                            enum_values: None,
                            pattern: None,
                            minimum: None,
                            maximum: None,
                            description: None,
                        }),
                    }
                }
            }
            _ => return Err(invalid("inputs entries must be strings or mappings")),
        }
    }
    Ok(inputs)
}

fn parse_full_input(name: &str, spec: &serde_yaml::Mapping) -> Result<InputSpec, AelError> {
    let ty = match str_field(spec, "type")? {
        None => InputType::String,
        Some(s) => InputType::parse(&s)
            .ok_or_else(|| invalid(format!("input '{name}': unknown type '{s}'")))?,
    };
    let default = match spec.get("default") {
        Some(raw) => Some(yaml_to_json(raw)?),
        None => None,
    };
    // Required unless a default is provided or required: false is explicit.
    let required = match spec.get("required") {
        Some(Yaml::Bool(b)) => *b,
        Some(_) => return Err(invalid(format!("input '{name}': required must be a bool"))),
        None => default.is_none(),
    };
    let enum_values = match spec.get("enum") {
        None => None,
        Some(Yaml::Sequence(items)) => Some(
            items
                .iter()
                .map(yaml_to_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Some(_) => return Err(invalid(format!("input '{name}': enum must be a list"))),
    };

    Ok(InputSpec {
        name: name.to_string(),
        ty,
        required,
        default,
        enum_values,
        pattern: str_field(spec, "pattern")?,
        minimum: f64_field(spec, "minimum")?,
        maximum: f64_field(spec, "maximum")?,
        description: str_field(spec, "description")?,
    })
}

fn parse_step(raw: &Yaml) -> Result<Step, AelError> {
    let Yaml::Mapping(map) = raw else {
        return Err(invalid("each step must be a mapping"));
    };
    let id = str_field(map, "id")?.ok_or_else(|| invalid("step id is required"))?;

    let tool = str_field(map, "tool")?;
    let code = str_field(map, "code")?;
    let action = match (tool, code) {
        (Some(tool), None) => {
            let params = match map.get("params") {
                Some(raw) => yaml_to_json(raw)?,
                None => Value::Object(Default::default()),
            };
            if !params.is_object() {
                return Err(invalid(format!("step '{id}': params must be a mapping")));
            }
            StepAction::Tool { tool, params }
        }
        (None, Some(code)) => StepAction::Code { code },
        (Some(_), Some(_)) => {
            return Err(invalid(format!(
                "step '{id}': must have either 'tool' or 'code', not both"
            )))
        }
        (None, None) => {
            return Err(invalid(format!(
                "step '{id}': must have either 'tool' or 'code'"
            )))
        }
    };

    let depends_on = match map.get("depends_on") {
        None => Vec::new(),
        Some(Yaml::Sequence(items)) => items
            .iter()
            .map(|i| match i {
                Yaml::String(s) => Ok(s.clone()),
                _ => Err(invalid(format!("step '{id}': depends_on must list step ids"))),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(invalid(format!("step '{id}': depends_on must be a list"))),
    };

    Ok(Step {
        id,
        depends_on,
        timeout: f64_field(map, "timeout")?,
        on_error: parse_on_error(map)?,
        retry: match map.get("retry") {
            Some(raw) => Some(parse_retry(raw)?),
            None => None,
        },
        action,
    })
}

fn parse_outputs(root: &serde_yaml::Mapping) -> Result<OutputsDecl, AelError> {
    let single = root.get("output");
    let named = root.get("outputs");
    match (single, named) {
        (Some(_), Some(_)) => Err(invalid("'output' and 'outputs' are mutually exclusive")),
        (None, None) => Ok(OutputsDecl::None),
        (Some(raw), None) => Ok(OutputsDecl::Single(yaml_to_json(raw)?)),
        (None, Some(raw)) => parse_named_outputs(raw),
    }
}

fn parse_named_outputs(raw: &Yaml) -> Result<OutputsDecl, AelError> {
    let mut outputs = Vec::new();
    match raw {
        // List form: [{name, from_path|value, description?}]
        Yaml::Sequence(items) => {
            for item in items {
                let Yaml::Mapping(map) = item else {
                    return Err(invalid("outputs entries must be mappings"));
                };
                let name =
                    str_field(map, "name")?.ok_or_else(|| invalid("output name is required"))?;
                outputs.push(OutputSpec {
                    source: output_source(&name, map.get("from_path"), map.get("value"))?,
                    description: str_field(map, "description")?,
                    name,
                });
            }
        }
        // Mapping form: {name: {from_path|value}} or {name: literal-template}
        Yaml::Mapping(map) => {
            for (key, value) in map {
                let Yaml::String(name) = key else {
                    return Err(invalid("output names must be strings"));
                };
                match value {
                    Yaml::Mapping(spec) => outputs.push(OutputSpec {
                        source: output_source(
                            name,
                            spec.get("from_path").or_else(|| spec.get("from")),
                            spec.get("value"),
                        )?,
                        description: str_field(spec, "description")?,
                        name: name.clone(),
                    }),
                    other => outputs.push(OutputSpec {
                        name: name.clone(),
                        source: OutputSource::Value(yaml_to_json(other)?),
                        description: None,
                    }),
                }
            }
        }
        _ => return Err(invalid("outputs must be a list or mapping")),
    }
    Ok(OutputsDecl::Named(outputs))
}

fn output_source(
    name: &str,
    from_path: Option<&Yaml>,
    value: Option<&Yaml>,
) -> Result<OutputSource, AelError> {
    match (from_path, value) {
        (Some(Yaml::String(path)), None) => Ok(OutputSource::FromPath(path.clone())),
        (Some(_), None) => Err(invalid(format!("output '{name}': from_path must be a string"))),
        (None, Some(raw)) => Ok(OutputSource::Value(yaml_to_json(raw)?)),
        (Some(_), Some(_)) => Err(invalid(format!(
            "output '{name}': exactly one of 'from_path' or 'value'"
        ))),
        (None, None) => Err(invalid(format!(
            "output '{name}': exactly one of 'from_path' or 'value'"
        ))),
    }
}

/// Convert a YAML value into JSON.  Mapping keys must be strings.
pub fn yaml_to_json(value: &Yaml) -> Result<Value, AelError> {
    Ok(match value {
        Yaml::Null => Value::Null,
        Yaml::Bool(b) => Value::Bool(*b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_json::json!(i)
            } else if let Some(f) = n.as_f64() {
                serde_json::json!(f)
            } else {
                return Err(invalid("unrepresentable number"));
            }
        }
        Yaml::String(s) => Value::String(s.clone()),
        Yaml::Sequence(items) => {
            Value::Array(items.iter().map(yaml_to_json).collect::<Result<_, _>>()?)
        }
        Yaml::Mapping(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                let Yaml::String(key) = k else {
                    return Err(invalid("mapping keys must be strings"));
                };
                out.insert(key.clone(), yaml_to_json(v)?);
            }
            Value::Object(out)
        }
        Yaml::Tagged(t) => yaml_to_json(&t.value)?,
    })
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_all_three_input_shapes() {
        let yaml = r#"
name: shapes
version: 1.0.0
inputs:
  - url
  - limit: 10
  - count:
      type: integer
      minimum: 1
      maximum: 100
steps:
  - id: only
    code: "return 1"
"#;
        let wf = parse_workflow_yaml(yaml).unwrap();
        assert_eq!(wf.inputs.len(), 3);

        assert_eq!(wf.inputs[0].name, "url");
        assert!(wf.inputs[0].required);

        assert_eq!(wf.inputs[1].name, "limit");
        assert!(!wf.inputs[1].required);
        assert_eq!(wf.inputs[1].default, Some(json!(10)));

        assert_eq!(wf.inputs[2].name, "count");
        assert_eq!(wf.inputs[2].ty, InputType::Integer);
        assert!(wf.inputs[2].required);
        assert_eq!(wf.inputs[2].minimum, Some(1.0));
    }

    #[test]
    fn step_with_both_tool_and_code_is_rejected() {
        let yaml = r#"
name: bad
steps:
  - id: s1
    tool: fetch
    code: "return 1"
"#;
        assert!(parse_workflow_yaml(yaml).is_err());
    }

    #[test]
    fn step_with_neither_tool_nor_code_is_rejected() {
        let yaml = "name: bad\nsteps:\n  - id: s1\n";
        assert!(parse_workflow_yaml(yaml).is_err());
    }

    #[test]
    fn output_and_outputs_are_mutually_exclusive() {
        let yaml = r#"
name: bad
steps:
  - id: s1
    code: "return 1"
output: "{{ steps.s1.output }}"
outputs:
  - name: x
    from_path: steps.s1.output
"#;
        assert!(parse_workflow_yaml(yaml).is_err());
    }

    #[test]
    fn named_outputs_parse_from_both_forms() {
        let yaml = r#"
name: outs
steps:
  - id: s1
    code: "return 1"
outputs:
  first:
    from_path: steps.s1.output
  second:
    value: "{{ steps.s1.output }}"
"#;
        let wf = parse_workflow_yaml(yaml).unwrap();
        let OutputsDecl::Named(outs) = &wf.outputs else {
            panic!("expected named outputs");
        };
        assert_eq!(outs.len(), 2);
        assert!(matches!(outs[0].source, OutputSource::FromPath(_)));
        assert!(matches!(outs[1].source, OutputSource::Value(_)));
    }

    #[test]
    fn defaults_and_retry_parse() {
        let yaml = r#"
name: flow
defaults:
  timeout: 12
  on_error: continue
  retry:
    max_attempts: 5
    initial_delay: 0.5
    max_delay: 4
    backoff_multiplier: 2
steps:
  - id: s1
    tool: fetch
    params:
      url: "{{ inputs.url }}"
    timeout: 3
    on_error: retry
"#;
        let wf = parse_workflow_yaml(yaml).unwrap();
        let defaults = wf.defaults.as_ref().unwrap();
        assert_eq!(defaults.timeout, Some(12.0));
        assert_eq!(defaults.on_error, Some(OnError::Continue));
        assert_eq!(defaults.retry.as_ref().unwrap().max_attempts, 5);
        assert_eq!(wf.steps[0].timeout, Some(3.0));
        assert_eq!(wf.steps[0].on_error, Some(OnError::Retry));
    }

    #[test]
    fn invalid_retry_spec_is_rejected_at_parse() {
        let yaml = r#"
name: flow
steps:
  - id: s1
    tool: fetch
    retry:
      max_attempts: 0
"#;
        assert!(parse_workflow_yaml(yaml).is_err());
    }

    #[test]
    fn missing_name_is_rejected() {
        assert!(parse_workflow_yaml("steps:\n  - id: a\n    code: x\n").is_err());
    }
}
