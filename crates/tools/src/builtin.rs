//! Built-in tools: `python_exec` and the self-configuration surface.

use std::sync::Arc;

use serde_json::{json, Value};

use config::loader::{CONFIG_PATH_ENV, LOCAL_CONFIG_FILE};
use config::{Mode, StagedConfig};
use errors::{AelError, ErrorCode};

use crate::registry::{ToolDescriptor, ToolRegistry, ToolSource, CONFIG_TOOLS};

/// Descriptors for the enabled built-in tools.
///
/// The self-config tools are always registered; `python_exec` honors the
/// `tools.builtins` switch.
pub fn builtin_descriptors(cfg: &config::model::ToolsConfig) -> Vec<ToolDescriptor> {
    let mut out = Vec::new();

    if cfg.builtins.iter().any(|b| b == "python_exec") {
        out.push(ToolDescriptor {
            name: "python_exec".to_string(),
            description: "Execute a code fragment in the restricted sandbox".to_string(),
            source: ToolSource::Builtin,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "code": {"type": "string", "description": "Code to execute"},
                },
                "required": ["code"],
            }),
        });
    }

    for name in CONFIG_TOOLS {
        out.push(ToolDescriptor {
            name: name.to_string(),
            description: config_tool_description(name).to_string(),
            source: ToolSource::Builtin,
            input_schema: config_tool_schema(name),
        });
    }

    out
}

fn config_tool_description(name: &str) -> &'static str {
    match name {
        "config_get" => "Read a value from the staged configuration",
        "config_set" => "Set a value in the staged configuration",
        "config_validate" => "Validate the staged configuration",
        "config_done" => "Validate, write, and activate the staged configuration",
        "config_location" => "Report where the configuration will be written",
        _ => "",
    }
}

fn config_tool_schema(name: &str) -> Value {
    match name {
        "config_get" => json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
        }),
        "config_set" => json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "value": {},
            },
            "required": ["path", "value"],
        }),
        _ => json!({"type": "object", "properties": {}}),
    }
}

/// Dispatch one self-config tool call against the staged document.
pub fn dispatch_config_tool(
    name: &str,
    params: &Value,
    staged: &Arc<StagedConfig>,
    registry: &ToolRegistry,
) -> Result<Value, AelError> {
    match name {
        "config_get" => {
            let path = params.get("path").and_then(Value::as_str).unwrap_or("");
            staged.get(path)
        }
        "config_set" => {
            let path = params
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| param_missing("config_set", "path"))?;
            let value = params
                .get("value")
                .cloned()
                .ok_or_else(|| param_missing("config_set", "value"))?;
            staged.set(path, value)?;
            Ok(json!({"status": "ok", "path": path}))
        }
        "config_validate" => match staged.validate() {
            Ok(_) => Ok(json!({"valid": true, "errors": []})),
            Err(e) => Ok(json!({
                "valid": false,
                "errors": [e.detail.clone().unwrap_or_else(|| e.message.clone())],
            })),
        },
        "config_done" => {
            staged.commit()?;
            registry.set_mode(Mode::Running);
            Ok(json!({
                "status": "ok",
                "path": staged.write_path().display().to_string(),
                "mode": "running",
            }))
        }
        "config_location" => Ok(json!({
            "path": staged.write_path().display().to_string(),
            "discovery_order": [
                "--config flag",
                format!("${CONFIG_PATH_ENV}"),
                format!("./{LOCAL_CONFIG_FILE}"),
                "~/.ploston/config.yaml",
            ],
        })),
        other => Err(AelError::internal(format!("unknown config tool: {other}"))),
    }
}

fn param_missing(tool: &str, param: &str) -> AelError {
    AelError::new(ErrorCode::ParamInvalid)
        .with_message(format!("Invalid parameters for tool '{tool}'"))
        .with_detail(format!("'{param}' is required"))
}
