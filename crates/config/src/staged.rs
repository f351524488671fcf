//! Staged configuration edited by the self-config tools.
//!
//! In configuration mode the agent builds a config interactively through
//! `config_get` / `config_set` / `config_validate` and commits it with
//! `config_done`.  The staged document is plain JSON until committed; it is
//! only converted to the typed model at validation time.

use std::path::PathBuf;
use std::sync::RwLock;

use serde_json::{json, Value};

use errors::{AelError, ErrorCode};

use crate::loader;
use crate::model::AelConfig;

/// An in-memory configuration document addressed by dotted paths.
#[derive(Debug)]
pub struct StagedConfig {
    doc: RwLock<Value>,
    write_path: PathBuf,
}

impl StagedConfig {
    /// Start from an empty document, committing to `write_path`.
    pub fn new(write_path: PathBuf) -> Self {
        Self {
            doc: RwLock::new(json!({})),
            write_path,
        }
    }

    /// Start from an existing typed config (running mode: `config show`).
    pub fn from_config(config: &AelConfig, write_path: PathBuf) -> Self {
        let doc = serde_json::to_value(config).unwrap_or_else(|_| json!({}));
        Self {
            doc: RwLock::new(doc),
            write_path,
        }
    }

    /// Where `config_done` will write the file.
    pub fn write_path(&self) -> &PathBuf {
        &self.write_path
    }

    /// Read the value at a dotted path, or the whole document for an empty
    /// path.  Missing paths read as null.
    pub fn get(&self, path: &str) -> Result<Value, AelError> {
        let doc = self.doc.read().expect("staged config lock");
        if path.is_empty() {
            return Ok(doc.clone());
        }
        let mut current = &*doc;
        for segment in split_path(path)? {
            match current.get(&segment) {
                Some(next) => current = next,
                None => return Ok(Value::Null),
            }
        }
        Ok(current.clone())
    }

    /// Set the value at a dotted path, creating intermediate objects.
    ///
    /// # Errors
    /// `CONFIG_PATH_INVALID` for empty/malformed paths or when a path
    /// segment traverses a non-object value.
    pub fn set(&self, path: &str, value: Value) -> Result<(), AelError> {
        if path.is_empty() {
            return Err(path_invalid(path, "path must not be empty"));
        }
        let segments = split_path(path)?;

        let mut doc = self.doc.write().expect("staged config lock");
        let mut current = &mut *doc;
        for segment in &segments[..segments.len() - 1] {
            if !current.is_object() {
                return Err(path_invalid(path, "path traverses a non-object value"));
            }
            current = current
                .as_object_mut()
                .expect("checked above")
                .entry(segment.clone())
                .or_insert_with(|| json!({}));
        }
        match current.as_object_mut() {
            Some(map) => {
                map.insert(segments[segments.len() - 1].clone(), value);
                Ok(())
            }
            None => Err(path_invalid(path, "path traverses a non-object value")),
        }
    }

    /// Validate the staged document against the config schema.
    pub fn validate(&self) -> Result<AelConfig, AelError> {
        let doc = self.doc.read().expect("staged config lock").clone();
        let yaml = serde_yaml::to_string(&doc)
            .map_err(|e| AelError::config_invalid(format!("cannot serialize staged config: {e}")))?;
        loader::parse(&yaml)
    }

    /// Validate, then write the staged document to the configured path.
    ///
    /// Returns the typed config that is now in effect.
    pub fn commit(&self) -> Result<AelConfig, AelError> {
        let config = self.validate()?;

        let doc = self.doc.read().expect("staged config lock").clone();
        let yaml = serde_yaml::to_string(&doc)
            .map_err(|e| AelError::config_invalid(format!("cannot serialize staged config: {e}")))?;

        if let Some(parent) = self.write_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AelError::config_invalid(format!(
                        "cannot create {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        std::fs::write(&self.write_path, yaml).map_err(|e| {
            AelError::config_invalid(format!(
                "cannot write {}: {e}",
                self.write_path.display()
            ))
        })?;

        Ok(config)
    }
}

fn split_path(path: &str) -> Result<Vec<String>, AelError> {
    let segments: Vec<String> = path.split('.').map(str::to_string).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(path_invalid(path, "empty path segment"));
    }
    Ok(segments)
}

fn path_invalid(path: &str, reason: &str) -> AelError {
    AelError::new(ErrorCode::ConfigPathInvalid)
        .with_message(format!("Invalid configuration path: {path}"))
        .with_detail(reason.to_string())
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn staged() -> StagedConfig {
        StagedConfig::new(PathBuf::from("/tmp/ploston-test-config.yaml"))
    }

    #[test]
    fn set_then_get_round_trips() {
        let cfg = staged();
        cfg.set("logging.level", json!("debug")).unwrap();
        assert_eq!(cfg.get("logging.level").unwrap(), json!("debug"));
        assert_eq!(cfg.get("logging").unwrap(), json!({"level": "debug"}));
    }

    #[test]
    fn missing_path_reads_as_null() {
        assert_eq!(staged().get("no.such.key").unwrap(), Value::Null);
    }

    #[test]
    fn empty_segment_is_path_invalid() {
        let err = staged().set("logging..level", json!("x")).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigPathInvalid);
    }

    #[test]
    fn traversing_a_scalar_is_path_invalid() {
        let cfg = staged();
        cfg.set("logging.level", json!("info")).unwrap();
        let err = cfg.set("logging.level.deeper", json!(1)).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigPathInvalid);
    }

    #[test]
    fn validate_rejects_unknown_sections() {
        let cfg = staged();
        cfg.set("not_a_section.x", json!(1)).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_a_real_document() {
        let cfg = staged();
        cfg.set("execution.max_concurrent", json!(4)).unwrap();
        cfg.set("workflows.directory", json!("./flows")).unwrap();
        let typed = cfg.validate().unwrap();
        assert_eq!(typed.execution.max_concurrent, 4);
        assert_eq!(typed.workflows.directory, "./flows");
    }

    #[test]
    fn commit_writes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let cfg = StagedConfig::new(path.clone());
        cfg.set("logging.level", json!("warn")).unwrap();
        cfg.commit().unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("warn"));
    }
}
