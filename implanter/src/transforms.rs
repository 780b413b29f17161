//! Method transformations
//!
//! Each supported method shape implements [`MethodTransform`]. A transform
//! works on a copy of the body and only replaces the original once the
//! instrumented copy validates, so a failed method is left as it was.

use crate::error::TransformError;
use cil_body::{DeclaringType, MethodBody, MethodDef, TracerHooks};
use serde::{Deserialize, Serialize};

pub mod async_step;
pub mod sync_method;

pub use async_step::{AsyncIdAllocator, AsyncStepTransform, StepExits};
pub use sync_method::SyncMethodTransform;

/// What a transformation did to a method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instrumented {
    /// Wrapped in `Begin` / try / finally `End`
    Sync,
    /// Step function instrumented with `AsyncBegin` / `AsyncEnd` under this correlation id
    Async { id: i32 },
}

/// Read-only inputs of one transformation call
#[derive(Debug, Clone, Copy)]
pub struct MethodContext<'a> {
    /// Fully qualified name passed to the tracer
    pub full_name: &'a str,
    /// Type declaring the method
    pub declaring: DeclaringType<'a>,
    /// Tracer entry points
    pub hooks: &'a TracerHooks,
}

/// Trait for method transformations
///
/// Each method shape implements this trait to define how tracing calls are
/// spliced into its body.
pub trait MethodTransform {
    /// Instrument `method` in place
    ///
    /// # Arguments
    /// * `method` - Method to instrument; untouched if an error is returned
    /// * `cx` - Name, declaring type and tracer hooks
    ///
    /// # Returns
    /// What was instrumented, or the structural assumption that failed
    fn transform(&self, method: &mut MethodDef, cx: &MethodContext<'_>) -> Result<Instrumented, TransformError>;
}

/// Reject a body that already calls one of the tracer hooks
pub(crate) fn ensure_uninstrumented(body: &MethodBody, hooks: &TracerHooks) -> Result<(), TransformError> {
    match hooks.all().into_iter().find(|hook| body.calls(hook)) {
        Some(hook) => Err(TransformError::AlreadyInstrumented(hook.name.clone())),
        None => Ok(()),
    }
}

/// Common last step: zero-initialize locals, shrink branches, validate
pub(crate) fn finish(body: &mut MethodBody) -> Result<(), TransformError> {
    body.init_locals = true;
    body.optimize_branches();
    body.validate().map_err(TransformError::InvalidOutput)
}
