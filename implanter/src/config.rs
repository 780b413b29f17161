//! Instrumentation configuration
//!
//! Which methods to touch, how to treat failures, and the shape patterns
//! used to read compiler-generated async step functions.

use anyhow::{Context, Result};
use cil_body::ASYNC_STATE_MACHINE_ATTRIBUTE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Configuration for one instrumentation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImplantConfig {
    /// Namespaces to include (empty: all)
    pub namespaces: Vec<String>,
    /// Type names to include (empty: all)
    pub types: Vec<String>,
    /// Method names to include (empty: all)
    pub methods: Vec<String>,
    /// Stop the batch at the first per-method failure
    pub fail_fast: bool,
    /// Patterns of the async step function
    pub step: StepShape,
}

impl ImplantConfig {
    /// Create a configuration with include-lists
    pub fn new(namespaces: Vec<String>, types: Vec<String>, methods: Vec<String>) -> Self {
        Self {
            namespaces,
            types,
            methods,
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON text
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse implanter configuration")
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;
        let config = Self::from_json_str(&json)?;
        tracing::debug!("Loaded configuration from {}: {:?}", path.display(), config);
        Ok(config)
    }
}

impl Default for ImplantConfig {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            types: Vec::new(),
            methods: Vec::new(),
            fail_fast: false,
            step: StepShape::default(),
        }
    }
}

/// Names and windows that identify parts of an async step function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepShape {
    /// Substring of the state field's name
    pub state_field_marker: String,
    /// Name of the routine that reports a fault to the awaiting caller
    pub fault_report_method: String,
    /// How many instructions before a `leave` to search for the fault report
    pub fault_lookback: usize,
    /// Name of the step method on the state type
    pub step_method: String,
    /// Attribute marking async methods
    pub async_attribute: String,
}

impl Default for StepShape {
    fn default() -> Self {
        Self {
            state_field_marker: "__state".to_string(),
            fault_report_method: "SetException".to_string(),
            fault_lookback: 3,
            step_method: "MoveNext".to_string(),
            async_attribute: ASYNC_STATE_MACHINE_ATTRIBUTE.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ImplantConfig::from_json_str(r#"{ "namespaces": ["App.Core"], "fail_fast": true }"#).unwrap();

        assert_eq!(config.namespaces, vec!["App.Core".to_string()]);
        assert!(config.types.is_empty());
        assert!(config.fail_fast);
        assert_eq!(config.step, StepShape::default());
    }

    #[test]
    fn test_step_shape_override() {
        let config = ImplantConfig::from_json_str(r#"{ "step": { "fault_lookback": 5 } }"#).unwrap();
        assert_eq!(config.step.fault_lookback, 5);
        assert_eq!(config.step.step_method, "MoveNext", "unset fields keep their default");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "methods": ["Run", "Stop"] }}"#).unwrap();

        let config = ImplantConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.methods, vec!["Run".to_string(), "Stop".to_string()]);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");

        let err = ImplantConfig::from_json_file(&missing).unwrap_err();
        assert!(err.to_string().contains("absent.json"));
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(ImplantConfig::from_json_str("{ namespaces: ").is_err());
    }
}
