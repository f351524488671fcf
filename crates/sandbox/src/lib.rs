//! `sandbox` crate — restricted evaluator for code steps.
//!
//! User code is a small Python-shaped fragment language executed by an
//! explicit AST interpreter; the host language's eval facility is never
//! exposed.  Defense in depth is layered:
//!
//! 1. static import gate (AST walk against the effective allowlist),
//! 2. builtin gate (curated builtins table + rejected identifiers),
//! 3. tool whitelist (`context.tools.call` checks availability),
//! 4. per-execution tool-call budget,
//! 5. parameter validation before forwarding to the invoker,
//! 6. cooperative wall-clock timeout,
//! 7. recursion prevention (`python_exec` is never callable from code).

pub mod ast;
pub mod interp;
pub mod lexer;
pub mod parser;

pub use interp::{Sandbox, SandboxConfig, SandboxContext};

use async_trait::async_trait;
use serde_json::Value;

use errors::AelError;

/// The sandbox's only escape valve back into the engine.
///
/// Implemented by the tool invoker; defined here so the invoker can depend
/// on the sandbox (for `python_exec`) without a crate cycle — the same
/// seam the execution-context trait occupies in the node layer.
#[async_trait]
pub trait ToolCaller: Send + Sync {
    /// Whether `name` resolves to a callable tool in the current execution.
    async fn is_available(&self, name: &str) -> bool;

    /// Call a tool and return its output value.
    async fn call(&self, name: &str, params: Value) -> Result<Value, AelError>;
}

/// Package profile named by a workflow's `packages.profile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageProfile {
    Minimal,
    #[default]
    Standard,
    DataScience,
}

impl PackageProfile {
    /// Importable module names for this profile.
    ///
    /// `data_science` admits numpy/pandas imports only in the sense that
    /// the gate passes; the interpreter has no native surface for them.
    pub fn imports(self) -> &'static [&'static str] {
        const MINIMAL: &[&str] = &["json", "re", "datetime", "math"];
        const STANDARD: &[&str] = &[
            "json",
            "re",
            "datetime",
            "math",
            "random",
            "typing",
            "collections",
            "itertools",
            "functools",
            "hashlib",
            "uuid",
            "base64",
            "urllib.parse",
        ];
        const DATA_SCIENCE: &[&str] = &[
            "json",
            "re",
            "datetime",
            "math",
            "random",
            "typing",
            "collections",
            "itertools",
            "functools",
            "hashlib",
            "uuid",
            "base64",
            "urllib.parse",
            "numpy",
            "pandas",
        ];
        match self {
            PackageProfile::Minimal => MINIMAL,
            PackageProfile::Standard => STANDARD,
            PackageProfile::DataScience => DATA_SCIENCE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_are_supersets() {
        let minimal = PackageProfile::Minimal.imports();
        let standard = PackageProfile::Standard.imports();
        let ds = PackageProfile::DataScience.imports();
        assert!(minimal.iter().all(|m| standard.contains(m)));
        assert!(standard.iter().all(|m| ds.contains(m)));
        assert!(ds.contains(&"numpy"));
        assert!(!standard.contains(&"numpy"));
    }

    #[test]
    fn profile_parses_from_snake_case() {
        let p: PackageProfile = serde_json::from_str("\"data_science\"").unwrap();
        assert_eq!(p, PackageProfile::DataScience);
    }
}
