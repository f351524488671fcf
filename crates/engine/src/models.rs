//! Core domain models for the execution layer.
//!
//! These types are the source of truth for what a workflow looks like in
//! memory.  They are built by the YAML parser, checked by the validator,
//! and never mutated after registration.

use serde::Serialize;
use serde_json::{json, Map, Value};

use sandbox::PackageProfile;
use tools::RetryPolicy;

// ---------------------------------------------------------------------------
// OnError
// ---------------------------------------------------------------------------

/// Step-level failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Record FAILED, stop the execution.
    Fail,
    /// Record SKIPPED (output null) and proceed.
    Continue,
    /// Let the invoker consume the retry budget; still failing means fail.
    Retry,
}

impl OnError {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fail" => Some(OnError::Fail),
            "continue" => Some(OnError::Continue),
            "retry" => Some(OnError::Retry),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Declared type of a workflow input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl InputType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(InputType::String),
            "integer" => Some(InputType::Integer),
            "number" => Some(InputType::Number),
            "boolean" => Some(InputType::Boolean),
            "array" => Some(InputType::Array),
            "object" => Some(InputType::Object),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InputType::String => "string",
            InputType::Integer => "integer",
            InputType::Number => "number",
            InputType::Boolean => "boolean",
            InputType::Array => "array",
            InputType::Object => "object",
        }
    }
}

/// One declared workflow input.
#[derive(Debug, Clone, Serialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: InputType,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl InputSpec {
    /// A required string input (the bare-string YAML shape).
    pub fn required_string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: InputType::String,
            required: true,
            default: None,
            enum_values: None,
            pattern: None,
            minimum: None,
            maximum: None,
            description: None,
        }
    }

    /// JSON-schema property for this input.
    pub fn schema_property(&self) -> Value {
        let mut prop = Map::new();
        prop.insert("type".to_string(), json!(self.ty.as_str()));
        if let Some(d) = &self.description {
            prop.insert("description".to_string(), json!(d));
        }
        if let Some(e) = &self.enum_values {
            prop.insert("enum".to_string(), json!(e));
        }
        if let Some(p) = &self.pattern {
            prop.insert("pattern".to_string(), json!(p));
        }
        if let Some(m) = self.minimum {
            prop.insert("minimum".to_string(), json!(m));
        }
        if let Some(m) = self.maximum {
            prop.insert("maximum".to_string(), json!(m));
        }
        if let Some(d) = &self.default {
            prop.insert("default".to_string(), d.clone());
        }
        Value::Object(prop)
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// What a step does: exactly one of a tool invocation or a code fragment.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Tool { tool: String, params: Value },
    Code { code: String },
}

/// A single unit in a workflow.
#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub id: String,
    /// Asserted (validated) but never used to reorder execution.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(flatten)]
    pub action: StepAction,
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Where a named output's value comes from.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSource {
    /// Dotted path into the context (`steps.x.output.field`).
    FromPath(String),
    /// Template expression (or structural document) to render.
    Value(Value),
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputSpec {
    pub name: String,
    pub source: OutputSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A workflow declares a single anonymous output expression, a list of
/// named outputs, or nothing.
#[derive(Debug, Clone, Default, Serialize)]
pub enum OutputsDecl {
    #[default]
    None,
    Single(Value),
    Named(Vec<OutputSpec>),
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PackagesSpec {
    pub profile: PackageProfile,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional: Vec<String>,
}

/// Workflow-level defaults, overridable per step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Defaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// A complete, immutable workflow definition.
#[derive(Debug, Clone, Serialize)]
pub struct Workflow {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packages: Option<PackagesSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defaults: Option<Defaults>,
    pub inputs: Vec<InputSpec>,
    pub steps: Vec<Step>,
    pub outputs: OutputsDecl,
}

impl Workflow {
    /// Package profile and extra imports for this workflow's code steps.
    pub fn effective_packages(&self) -> (PackageProfile, Vec<String>) {
        match &self.packages {
            Some(p) => (p.profile, p.additional.clone()),
            None => (PackageProfile::Minimal, Vec::new()),
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// JSON schema for this workflow's inputs (its `workflow:<name>`
    /// tool-parameter schema).
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for input in &self.inputs {
            properties.insert(input.name.clone(), input.schema_property());
            if input.required {
                required.push(json!(input.name));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_schema_carries_constraints_and_required() {
        let workflow = Workflow {
            name: "report".into(),
            version: "1.0.0".into(),
            description: None,
            packages: None,
            defaults: None,
            inputs: vec![
                InputSpec::required_string("url"),
                InputSpec {
                    name: "count".into(),
                    ty: InputType::Integer,
                    required: false,
                    default: Some(json!(10)),
                    enum_values: None,
                    pattern: None,
                    minimum: Some(1.0),
                    maximum: Some(100.0),
                    description: Some("how many".into()),
                },
            ],
            steps: vec![],
            outputs: OutputsDecl::None,
        };

        let schema = workflow.input_schema();
        assert_eq!(schema["required"], json!(["url"]));
        assert_eq!(schema["properties"]["count"]["minimum"], json!(1.0));
        assert_eq!(schema["properties"]["count"]["default"], json!(10));
        assert_eq!(schema["properties"]["url"]["type"], json!("string"));
    }

    #[test]
    fn default_packages_are_minimal() {
        let workflow = Workflow {
            name: "x".into(),
            version: "1.0.0".into(),
            description: None,
            packages: None,
            defaults: None,
            inputs: vec![],
            steps: vec![],
            outputs: OutputsDecl::None,
        };
        let (profile, additional) = workflow.effective_packages();
        assert_eq!(profile, sandbox::PackageProfile::Minimal);
        assert!(additional.is_empty());
    }
}
