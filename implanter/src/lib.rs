//! Implanter - Tracing instrumentation for CIL method bodies
//!
//! This crate rewrites method bodies so that every call of an instrumented
//! method is bracketed by tracer calls, without changing what the method
//! returns, throws or mutates.
//!
//! # Overview
//!
//! * Ordinary methods get `Begin(name)` on entry and `End()` in a finally
//!   region around the whole body (after base constructor chaining for
//!   instance constructors)
//! * Async methods get `AsyncBegin(id, name)` on every step of their state
//!   machine and `AsyncEnd(id, name)` only where the operation completes
//! * Generator methods are skipped
//! * Failures are per method and carry the method's full name
//!
//! # Usage
//!
//! ```
//! use cil_body::{MethodBody, MethodDef, Module, OpCode, TypeDef, TypeRef};
//! use implanter::{implant_module, ImplantConfig};
//!
//! let mut tracer = TypeDef::new("Diagnostics", "Tracer");
//! for (name, params) in [
//!     ("Begin", vec![TypeRef::string()]),
//!     ("End", vec![]),
//!     ("AsyncBegin", vec![TypeRef::int32(), TypeRef::string()]),
//!     ("AsyncEnd", vec![TypeRef::int32(), TypeRef::string()]),
//! ] {
//!     let mut hook = MethodDef::new(name, TypeRef::void(), MethodBody::new());
//!     hook.params = params;
//!     hook.is_static = true;
//!     tracer.methods.push(hook);
//! }
//!
//! let mut body = MethodBody::new();
//! body.push(OpCode::Ret);
//! let mut job = TypeDef::new("App", "Job");
//! job.methods.push(MethodDef::new("Run", TypeRef::void(), body));
//! let mut module = Module { name: "App".into(), types: vec![job] };
//!
//! let report = implant_module(&mut module, &tracer, ImplantConfig::default()).unwrap();
//! assert_eq!(report.instrumented_count(), 1);
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod hooks;
pub mod report;
pub mod select;
pub mod transforms;

pub use config::{ImplantConfig, StepShape};
pub use coordinator::{Coordinator, Disposition, MethodKind, GENERATOR_SKIP_REASON};
pub use error::{MethodError, PreconditionError, TransformError};
pub use hooks::resolve_hooks;
pub use report::{BatchReport, MethodOutcome, MethodReport};
pub use select::{MethodSelector, MethodSlot};
pub use transforms::{
    AsyncIdAllocator, AsyncStepTransform, Instrumented, MethodContext, MethodTransform, StepExits,
    SyncMethodTransform,
};

use anyhow::Context;
use cil_body::{Module, TypeDef};

/// Result type for implanter operations
pub type Result<T> = anyhow::Result<T>;

/// High-level API: instrument every selected method of `module`
///
/// Resolves the tracer hooks on `tracer` first; a missing hook or a
/// malformed async method aborts before anything is rewritten.
pub fn implant_module(module: &mut Module, tracer: &TypeDef, config: ImplantConfig) -> Result<BatchReport> {
    let coordinator =
        Coordinator::from_tracer_type(tracer, config).context("Failed to resolve tracer hooks")?;
    let report = coordinator
        .instrument_module(module)
        .with_context(|| format!("Cannot instrument module {}", module.name))?;
    Ok(report)
}

/// Turn a report with failures into an error naming every failed method
pub fn ensure_success(report: &BatchReport) -> Result<()> {
    if !report.has_failures() {
        return Ok(());
    }
    let failed: Vec<&str> = report
        .methods
        .iter()
        .filter(|r| matches!(r.outcome, MethodOutcome::Failed { .. }))
        .map(|r| r.method.as_str())
        .collect();
    anyhow::bail!(
        "{} of {} methods failed to instrument: {}",
        report.failure_count(),
        report.methods.len(),
        failed.join(", ")
    )
}
