//! `errors` crate — the canonical error registry.
//!
//! Every failure that crosses a component boundary is an [`AelError`]: a
//! stable code, a category, a human-readable message, and a retryability
//! flag the invoker's retry loop keys off.  Codes and their default
//! metadata are fixed at compile time; constructors fill in the concrete
//! values (tool names, timeouts, paths).

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

/// Coarse grouping used in the wire shape and in CLI output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Tool,
    Execution,
    Validation,
    Workflow,
    System,
}

// ---------------------------------------------------------------------------
// Codes
// ---------------------------------------------------------------------------

/// Canonical error codes.
///
/// The serialized form is the SCREAMING_SNAKE code agents see on the wire
/// (`TOOL_TIMEOUT`, `CODE_SECURITY`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Tool
    ToolUnavailable,
    ToolTimeout,
    ToolRejected,
    ToolFailed,
    // Execution
    CodeSyntax,
    CodeRuntime,
    CodeTimeout,
    CodeSecurity,
    TemplateError,
    // Validation
    InputInvalid,
    ParamInvalid,
    ConfigPathInvalid,
    // Workflow
    WorkflowNotFound,
    StepNotFound,
    CircularDependency,
    WorkflowTimeout,
    // System
    InternalError,
    McpConnectionFailed,
    ConfigInvalid,
    ResourceExhausted,
}

impl ErrorCode {
    /// Category this code belongs to.
    pub fn category(self) -> ErrorCategory {
        use ErrorCode::*;
        match self {
            ToolUnavailable | ToolTimeout | ToolRejected | ToolFailed => ErrorCategory::Tool,
            CodeSyntax | CodeRuntime | CodeTimeout | CodeSecurity | TemplateError => {
                ErrorCategory::Execution
            }
            InputInvalid | ParamInvalid | ConfigPathInvalid => ErrorCategory::Validation,
            WorkflowNotFound | StepNotFound | CircularDependency | WorkflowTimeout => {
                ErrorCategory::Workflow
            }
            InternalError | McpConnectionFailed | ConfigInvalid | ResourceExhausted => {
                ErrorCategory::System
            }
        }
    }

    /// Default retryability.  `ToolFailed` is "sometimes" — the constructor
    /// overrides it from the underlying cause (see [`retryable_from_message`]).
    pub fn default_retryable(self) -> bool {
        use ErrorCode::*;
        matches!(
            self,
            ToolUnavailable | ToolTimeout | McpConnectionFailed | ResourceExhausted
        )
    }

    /// Operator-facing suggestion attached to every instance of this code.
    pub fn suggestion(self) -> &'static str {
        use ErrorCode::*;
        match self {
            ToolUnavailable => "Check that the MCP server is running and the tool is registered",
            ToolTimeout => "Increase the timeout or check if the tool is stuck",
            ToolRejected => "Check the tool parameters and try again",
            ToolFailed => "Check the tool logs for more details",
            CodeSyntax => "Fix the syntax errors and try again",
            CodeRuntime => "Check the code logic and the error message",
            CodeTimeout => "Optimize the code or increase the step timeout",
            CodeSecurity => "Remove forbidden imports or operations",
            TemplateError => "Check template syntax and variable names",
            InputInvalid => "Check the input schema and provide valid data",
            ParamInvalid => "Check the tool schema and provide valid parameters",
            ConfigPathInvalid => "Use dot notation for nested paths (e.g. 'logging.level')",
            WorkflowNotFound => "Check the workflow name and the workflows directory",
            StepNotFound => "Check the step id and the workflow definition",
            CircularDependency => "Remove circular step dependencies from the workflow",
            WorkflowTimeout => "Increase the timeout or split the workflow",
            InternalError => "Check the logs and report this issue",
            McpConnectionFailed => "Check that the MCP server command is installed and runnable",
            ConfigInvalid => "Check the configuration file and fix the reported errors",
            ResourceExhausted => "Free up resources or increase the configured limits",
        }
    }

    fn base_message(self) -> &'static str {
        use ErrorCode::*;
        match self {
            ToolUnavailable => "Tool is unavailable",
            ToolTimeout => "Tool call timed out",
            ToolRejected => "Tool rejected the request",
            ToolFailed => "Tool execution failed",
            CodeSyntax => "Syntax error in code block",
            CodeRuntime => "Runtime error in code block",
            CodeTimeout => "Code execution timed out",
            CodeSecurity => "Security violation in code block",
            TemplateError => "Template rendering failed",
            InputInvalid => "Invalid workflow input",
            ParamInvalid => "Invalid tool parameters",
            ConfigPathInvalid => "Invalid configuration path",
            WorkflowNotFound => "Workflow not found",
            StepNotFound => "Step not found",
            CircularDependency => "Circular dependency detected",
            WorkflowTimeout => "Workflow timed out",
            InternalError => "Internal engine error",
            McpConnectionFailed => "Failed to connect to MCP server",
            ConfigInvalid => "Invalid configuration",
            ResourceExhausted => "Resource exhausted",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Serialize through serde so Display and the wire form never drift.
        let s = serde_json::to_value(self).map_err(|_| std::fmt::Error)?;
        f.write_str(s.as_str().ok_or(std::fmt::Error)?)
    }
}

// ---------------------------------------------------------------------------
// AelError
// ---------------------------------------------------------------------------

/// The user-visible error shape:
/// `{code, category, message, detail?, suggestion, retryable}`.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct AelError {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub suggestion: String,
    pub retryable: bool,
}

impl AelError {
    /// Create an error with the code's default message and metadata.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            category: code.category(),
            message: code.base_message().to_string(),
            detail: None,
            suggestion: code.suggestion().to_string(),
            retryable: code.default_retryable(),
        }
    }

    /// Replace the default message with a concrete one.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Attach supporting detail.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Override retryability (used for `TOOL_FAILED`, whose retryability
    /// is driven by the underlying cause).
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    // ------ Targeted constructors for the common templated messages ------

    pub fn tool_unavailable(tool_name: &str) -> Self {
        Self::new(ErrorCode::ToolUnavailable)
            .with_message(format!("Tool '{tool_name}' is unavailable"))
    }

    pub fn tool_timeout(tool_name: &str, timeout_seconds: f64) -> Self {
        Self::new(ErrorCode::ToolTimeout)
            .with_message(format!("Tool '{tool_name}' timed out after {timeout_seconds}s"))
    }

    pub fn tool_rejected(tool_name: &str, reason: &str) -> Self {
        Self::new(ErrorCode::ToolRejected)
            .with_message(format!("Tool '{tool_name}' rejected the request"))
            .with_detail(reason.to_string())
    }

    pub fn tool_failed(tool_name: &str, cause: &str) -> Self {
        Self::new(ErrorCode::ToolFailed)
            .with_message(format!("Tool '{tool_name}' failed: {cause}"))
            .with_retryable(retryable_from_message(cause))
    }

    pub fn code_timeout(timeout_seconds: f64) -> Self {
        Self::new(ErrorCode::CodeTimeout)
            .with_message(format!("Code execution timed out after {timeout_seconds}s"))
    }

    pub fn template_error(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::TemplateError).with_detail(detail)
    }

    pub fn input_invalid(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::InputInvalid).with_detail(detail)
    }

    pub fn workflow_not_found(workflow_id: &str) -> Self {
        Self::new(ErrorCode::WorkflowNotFound)
            .with_message(format!("Workflow '{workflow_id}' not found"))
    }

    pub fn config_invalid(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigInvalid).with_detail(detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError).with_detail(detail)
    }
}

// ---------------------------------------------------------------------------
// Cause matching
// ---------------------------------------------------------------------------

/// Classify a backend-reported failure message as transient or permanent.
///
/// Drives the "sometimes retryable" behaviour of `TOOL_FAILED`: rate limits,
/// timeouts, and transient unavailability are worth another attempt;
/// validation and authentication failures are not.
pub fn retryable_from_message(message: &str) -> bool {
    const TRANSIENT: &[&str] = &[
        "rate limit",
        "rate-limit",
        "too many requests",
        "timeout",
        "timed out",
        "unavailable",
        "temporarily",
        "connection reset",
        "connection refused",
        "try again",
    ];
    let lower = message.to_lowercase();
    TRANSIENT.iter().any(|needle| lower.contains(needle))
}
