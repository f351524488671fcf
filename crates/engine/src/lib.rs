//! `engine` crate — workflow model, template evaluator, and the
//! execution engine.

pub mod context;
pub mod executor;
pub mod models;
pub mod parser;
pub mod registry;
pub mod template;
pub mod validate;

pub use context::{ExecutionContext, ExecutionResult, ExecutionStatus, StepOutput, StepStatus};
pub use executor::Engine;
pub use models::{InputSpec, OnError, Step, StepAction, Workflow};
pub use parser::parse_workflow_yaml;
pub use registry::WorkflowRegistry;
pub use validate::validate_workflow;

#[cfg(test)]
mod executor_tests;
