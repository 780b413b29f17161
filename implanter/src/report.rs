//! Batch report
//!
//! Records what happened to every selected method. Serializable so the
//! surrounding tool can store it next to the rewritten module.

use crate::error::MethodError;
use crate::transforms::Instrumented;
use crate::Result;
use serde::{Deserialize, Serialize};

/// What happened to one method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MethodOutcome {
    Instrumented { kind: Instrumented },
    Skipped { reason: String },
    /// Error text including every underlying cause
    Failed { error: String },
}

/// Outcome for one method, by fully qualified name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodReport {
    pub method: String,
    pub outcome: MethodOutcome,
}

/// Outcomes of one instrumentation run over a module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Module name
    pub module: String,
    /// Per-method outcomes in processing order
    pub methods: Vec<MethodReport>,
    /// Failures with their typed causes (not serialized)
    #[serde(skip)]
    pub errors: Vec<MethodError>,
}

impl BatchReport {
    /// Create an empty report for `module`
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            ..Self::default()
        }
    }

    /// Record an instrumented method
    pub fn record_instrumented(&mut self, method: impl Into<String>, kind: Instrumented) {
        self.push(method.into(), MethodOutcome::Instrumented { kind });
    }

    /// Record a method that was deliberately left alone
    pub fn record_skipped(&mut self, method: impl Into<String>, reason: impl Into<String>) {
        self.push(method.into(), MethodOutcome::Skipped { reason: reason.into() });
    }

    /// Record a failed method, keeping the error and its cause
    pub fn record_failure(&mut self, error: MethodError) {
        let outcome = MethodOutcome::Failed {
            error: format!("{:#}", anyhow::Error::new(error.clone())),
        };
        self.push(error.method.clone(), outcome);
        self.errors.push(error);
    }

    fn push(&mut self, method: String, outcome: MethodOutcome) {
        self.methods.push(MethodReport { method, outcome });
    }

    /// Outcome recorded for a method, by fully qualified name
    pub fn outcome_of(&self, method: &str) -> Option<&MethodOutcome> {
        self.methods
            .iter()
            .find(|r| r.method == method)
            .map(|r| &r.outcome)
    }

    /// Number of instrumented methods
    pub fn instrumented_count(&self) -> usize {
        self.count(|o| matches!(o, MethodOutcome::Instrumented { .. }))
    }

    /// Number of skipped methods
    pub fn skipped_count(&self) -> usize {
        self.count(|o| matches!(o, MethodOutcome::Skipped { .. }))
    }

    /// Number of failed methods
    pub fn failure_count(&self) -> usize {
        self.count(|o| matches!(o, MethodOutcome::Failed { .. }))
    }

    fn count(&self, predicate: impl Fn(&MethodOutcome) -> bool) -> usize {
        self.methods.iter().filter(|r| predicate(&r.outcome)).count()
    }

    /// Whether any method failed; drives the exit status of the run
    pub fn has_failures(&self) -> bool {
        self.failure_count() > 0
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON; typed errors are not restored
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
