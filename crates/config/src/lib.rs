//! `config` crate — layered configuration for the execution layer.
//!
//! Responsibilities:
//! - the typed configuration model with serde defaults ([`model`]),
//! - discovery, environment-variable substitution, and validation ([`loader`]),
//! - the staged configuration the self-config tools edit ([`staged`]).
//!
//! Absence of a config file is not an error: the server comes up in
//! [`Mode::Configuration`] and only exposes the self-config tools until a
//! valid file is written with `config_done`.

pub mod loader;
pub mod model;
pub mod staged;

pub use loader::{discover_config_path, load, resolve_env_vars, LoadedConfig};
pub use model::AelConfig;
pub use staged::StagedConfig;

use serde::{Deserialize, Serialize};

/// Whether a valid configuration file backs this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// No valid config file was found; only self-config tools are exposed.
    Configuration,
    /// A valid config file is loaded; the full tool surface is exposed.
    Running,
}
