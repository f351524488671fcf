//! Configuration discovery, environment substitution, and loading.
//!
//! Discovery order:
//! 1. explicit `--config PATH` flag,
//! 2. `PLOSTON_CONFIG_PATH` environment variable,
//! 3. `./ploston-config.yaml`,
//! 4. `~/.ploston/config.yaml`.
//!
//! First existing file wins.  No file at all means the server starts in
//! configuration mode; a file that exists but fails to parse or validate
//! is a hard `CONFIG_INVALID` error.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde_yaml::Value as YamlValue;
use tracing::info;

use errors::AelError;

use crate::{model::AelConfig, Mode};

/// Environment variable consulted during discovery.
pub const CONFIG_PATH_ENV: &str = "PLOSTON_CONFIG_PATH";

/// File name probed in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "ploston-config.yaml";

/// A loaded configuration together with where it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: AelConfig,
    /// Path of the file actually loaded; `None` in configuration mode.
    pub path: Option<PathBuf>,
    pub mode: Mode,
}

/// Walk the discovery order and return the first existing candidate.
pub fn discover_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(from_env) = std::env::var(CONFIG_PATH_ENV) {
        return Some(PathBuf::from(from_env));
    }

    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }

    if let Ok(home) = std::env::var("HOME") {
        let user = PathBuf::from(home).join(".ploston").join("config.yaml");
        if user.exists() {
            return Some(user);
        }
    }

    None
}

/// The path `config_done` writes to when no file exists yet.
pub fn default_write_path() -> PathBuf {
    PathBuf::from(LOCAL_CONFIG_FILE)
}

/// Load configuration following the discovery order.
///
/// # Errors
/// `CONFIG_INVALID` when a discovered file cannot be read, parsed, or
/// fails schema validation.  A missing file is not an error.
pub fn load(explicit: Option<&Path>) -> Result<LoadedConfig, AelError> {
    let Some(path) = discover_config_path(explicit) else {
        info!("no configuration file found, starting in configuration mode");
        return Ok(LoadedConfig {
            config: AelConfig::default(),
            path: None,
            mode: Mode::Configuration,
        });
    };

    // An explicitly named file must exist; silently falling back to
    // defaults would mask operator typos.
    if !path.exists() {
        return Err(AelError::config_invalid(format!(
            "configuration file not found: {}",
            path.display()
        )));
    }

    let raw = std::fs::read_to_string(&path).map_err(|e| {
        AelError::config_invalid(format!("cannot read {}: {e}", path.display()))
    })?;

    let config = parse(&raw)?;
    info!(path = %path.display(), "configuration loaded");

    Ok(LoadedConfig {
        config,
        path: Some(path),
        mode: Mode::Running,
    })
}

/// Parse a YAML document into [`AelConfig`], resolving `${VAR}` references
/// in every string scalar first.
pub fn parse(raw: &str) -> Result<AelConfig, AelError> {
    let doc: YamlValue = serde_yaml::from_str(raw)
        .map_err(|e| AelError::config_invalid(format!("invalid YAML: {e}")))?;

    let doc = resolve_env_recursive(doc)?;

    serde_yaml::from_value(doc)
        .map_err(|e| AelError::config_invalid(format!("configuration schema error: {e}")))
}

fn resolve_env_recursive(value: YamlValue) -> Result<YamlValue, AelError> {
    Ok(match value {
        YamlValue::String(s) => YamlValue::String(resolve_env_vars(&s)?),
        YamlValue::Sequence(items) => YamlValue::Sequence(
            items
                .into_iter()
                .map(resolve_env_recursive)
                .collect::<Result<_, _>>()?,
        ),
        YamlValue::Mapping(map) => {
            let mut out = serde_yaml::Mapping::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k, resolve_env_recursive(v)?);
            }
            YamlValue::Mapping(out)
        }
        other => other,
    })
}

/// Resolve `${VAR}`, `${VAR:-default}`, and `${VAR:?message}` references.
///
/// # Errors
/// `CONFIG_INVALID` when a required variable is unset.
pub fn resolve_env_vars(value: &str) -> Result<String, AelError> {
    // ${VAR}, ${VAR:-default}, ${VAR:?message}
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([?-])([^}]*))?\}")
        .expect("static pattern");

    let mut out = String::with_capacity(value.len());
    let mut last = 0;
    for caps in pattern.captures_iter(value) {
        let whole = caps.get(0).unwrap();
        out.push_str(&value[last..whole.start()]);
        last = whole.end();

        let var = &caps[1];
        let operator = caps.get(2).map(|m| m.as_str());
        let operand = caps.get(3).map(|m| m.as_str()).unwrap_or("");

        match std::env::var(var) {
            Ok(v) => out.push_str(&v),
            Err(_) => match operator {
                Some("-") => out.push_str(operand),
                Some("?") => {
                    let msg = if operand.is_empty() {
                        format!("required environment variable {var} not set")
                    } else {
                        operand.to_string()
                    };
                    return Err(AelError::config_invalid(msg));
                }
                _ => {
                    return Err(AelError::config_invalid(format!(
                        "required environment variable {var} not set"
                    )))
                }
            },
        }
    }
    out.push_str(&value[last..]);
    Ok(out)
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use errors::ErrorCode;

    #[test]
    fn plain_string_passes_through() {
        assert_eq!(resolve_env_vars("no refs here").unwrap(), "no refs here");
    }

    #[test]
    fn default_operand_applies_when_unset() {
        assert_eq!(
            resolve_env_vars("${PLOSTON_TEST_SURELY_UNSET:-fallback}").unwrap(),
            "fallback"
        );
    }

    #[test]
    fn set_variable_is_substituted() {
        std::env::set_var("PLOSTON_TEST_SET_VAR", "hello");
        assert_eq!(
            resolve_env_vars("prefix-${PLOSTON_TEST_SET_VAR}-suffix").unwrap(),
            "prefix-hello-suffix"
        );
    }

    #[test]
    fn required_variable_missing_is_config_invalid() {
        let err = resolve_env_vars("${PLOSTON_TEST_SURELY_UNSET}").unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalid);

        let err = resolve_env_vars("${PLOSTON_TEST_SURELY_UNSET:?custom message}").unwrap_err();
        assert_eq!(err.detail.as_deref(), Some("custom message"));
    }

    #[test]
    fn parse_resolves_env_in_nested_values() {
        std::env::set_var("PLOSTON_TEST_CMD", "mcp-files");
        let cfg = parse(
            "mcp:\n  servers:\n    files:\n      command: ${PLOSTON_TEST_CMD}\n",
        )
        .unwrap();
        assert_eq!(cfg.mcp.servers["files"].command, "mcp-files");
    }

    #[test]
    fn invalid_yaml_is_config_invalid() {
        let err = parse("execution: [unclosed").unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalid);
    }

    #[test]
    fn explicit_missing_path_is_hard_error() {
        let err = load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalid);
    }
}
