//! Error types for instrumentation

use cil_body::{BodyError, InstrId};
use thiserror::Error;

/// Structural assumption about one method that did not hold
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("method has no body")]
    MissingBody,

    #[error("method body has no instructions")]
    EmptyBody,

    #[error("no call to a base type constructor found in instance constructor")]
    MissingBaseConstructorCall,

    #[error("no leave instruction found; cannot locate the completion funnel")]
    NoCompletionFunnel,

    #[error("no exit reaches the completion funnel at {0}")]
    NoCompletionExit(InstrId),

    #[error("state field load at {at} is not preceded by ldarg.0")]
    UnrecognizedStepShape { at: InstrId },

    #[error("method is not bound to a state machine")]
    MissingStateMachine,

    #[error("expected exactly one step method `{name}`, found {found}")]
    StepMethodCount { name: String, found: usize },

    #[error("body already calls tracer hook `{0}`")]
    AlreadyInstrumented(String),

    #[error("instrumented body is invalid")]
    InvalidOutput(#[source] BodyError),
}

/// Condition that must hold before any method is touched
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("tracer type {tracer} has no static {hook}")]
    MissingHook { tracer: String, hook: &'static str },

    #[error("async method '{method}' has {found} step methods named `{name}`, expected exactly one")]
    StepMethodCount {
        method: String,
        name: String,
        found: usize,
    },
}

/// Per-method failure, carrying the method's fully qualified name
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to instrument '{method}'")]
pub struct MethodError {
    pub method: String,
    #[source]
    pub cause: TransformError,
}

impl MethodError {
    /// Wrap a transformer failure
    pub fn new(method: impl Into<String>, cause: TransformError) -> Self {
        Self {
            method: method.into(),
            cause,
        }
    }
}
