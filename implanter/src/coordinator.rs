//! Instrumentation coordinator
//!
//! Classifies each selected method, routes it to the matching transform and
//! records the outcome. A failing method never stops its siblings unless the
//! configuration asks to stop at the first failure.

use crate::config::ImplantConfig;
use crate::error::{MethodError, PreconditionError};
use crate::hooks::resolve_hooks;
use crate::report::BatchReport;
use crate::select::{MethodSelector, MethodSlot};
use crate::transforms::{
    AsyncIdAllocator, AsyncStepTransform, Instrumented, MethodContext, MethodTransform,
    SyncMethodTransform,
};
use cil_body::{DeclaringType, MethodDef, Module, TracerHooks, TypeDef};

/// Reason recorded for skipped generator methods
pub const GENERATOR_SKIP_REASON: &str = "methods that yield are not supported";

/// Shape of a method as far as instrumentation is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Sync,
    Async,
    /// Iterator lowered into a state type; never instrumented
    Generator,
}

/// What happened to a method that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Instrumented(Instrumented),
    Skipped(&'static str),
}

/// Drives instrumentation of whole modules
#[derive(Debug)]
pub struct Coordinator {
    hooks: TracerHooks,
    config: ImplantConfig,
    selector: MethodSelector,
    ids: AsyncIdAllocator,
}

impl Coordinator {
    /// Create a coordinator with already resolved hooks
    pub fn new(hooks: TracerHooks, config: ImplantConfig) -> Self {
        let selector = MethodSelector::new(&config);
        Self {
            hooks,
            config,
            selector,
            ids: AsyncIdAllocator::new(),
        }
    }

    /// Resolve the hooks on `tracer`, then create the coordinator
    pub fn from_tracer_type(tracer: &TypeDef, config: ImplantConfig) -> Result<Self, PreconditionError> {
        Ok(Self::new(resolve_hooks(tracer)?, config))
    }

    /// Tracer entry points inserted calls target
    pub fn hooks(&self) -> &TracerHooks {
        &self.hooks
    }

    /// Configuration in use
    pub fn config(&self) -> &ImplantConfig {
        &self.config
    }

    /// Correlation id the next async method will get
    pub fn next_async_id(&self) -> i32 {
        self.ids.peek()
    }

    /// Classify a method; generators win over the async marker
    pub fn classify(&self, method: &MethodDef, declaring: &DeclaringType<'_>) -> MethodKind {
        if method.is_generator(declaring) {
            MethodKind::Generator
        } else if method.is_async(&self.config.step.async_attribute) {
            MethodKind::Async
        } else {
            MethodKind::Sync
        }
    }

    /// Instrument one method
    ///
    /// # Arguments
    /// * `method` - Method to rewrite; left unchanged on failure
    /// * `declaring` - Its declaring type
    ///
    /// # Returns
    /// * `Ok(Disposition)` - Instrumented, or skipped as unsupported
    /// * `Err(MethodError)` - Failure wrapped with the method's full name
    pub fn instrument_method(
        &self,
        method: &mut MethodDef,
        declaring: &DeclaringType<'_>,
    ) -> Result<Disposition, MethodError> {
        let full_name = method.full_name(declaring);
        tracing::info!("Processing {}", full_name);

        let cx = MethodContext {
            full_name: &full_name,
            declaring: *declaring,
            hooks: &self.hooks,
        };
        let result = match self.classify(method, declaring) {
            MethodKind::Generator => {
                tracing::warn!("Skipping '{}': {}", full_name, GENERATOR_SKIP_REASON);
                return Ok(Disposition::Skipped(GENERATOR_SKIP_REASON));
            }
            MethodKind::Async => AsyncStepTransform::new(&self.config.step, &self.ids).transform(method, &cx),
            MethodKind::Sync => SyncMethodTransform.transform(method, &cx),
        };

        match result {
            Ok(kind) => {
                tracing::debug!("Instrumented '{}' as {:?}", full_name, kind);
                Ok(Disposition::Instrumented(kind))
            }
            Err(cause) => {
                let error = MethodError::new(full_name.as_str(), cause);
                tracing::warn!("{:#}", anyhow::Error::new(error.clone()));
                Err(error)
            }
        }
    }

    /// Every selected async method must have exactly one step method
    ///
    /// Checked over the whole selection before anything is rewritten.
    pub fn check_preconditions(&self, module: &Module, slots: &[MethodSlot]) -> Result<(), PreconditionError> {
        let step_method = &self.config.step.step_method;
        for slot in slots {
            let ty = &module.types[slot.type_index];
            let method = &ty.methods[slot.method_index];
            if self.classify(method, &ty.declaring()) != MethodKind::Async {
                continue;
            }
            let found = method
                .state_machine
                .as_ref()
                .map_or(0, |binding| binding.candidates(step_method).len());
            if found != 1 {
                return Err(PreconditionError::StepMethodCount {
                    method: method.full_name(&ty.declaring()),
                    name: step_method.clone(),
                    found,
                });
            }
        }
        Ok(())
    }

    /// Instrument every selected method of `module`
    ///
    /// Per-method failures are recorded in the report and do not abort the
    /// batch (unless `fail_fast` is set). Precondition failures abort before
    /// any method is touched.
    pub fn instrument_module(&self, module: &mut Module) -> Result<BatchReport, PreconditionError> {
        let slots = self.selector.select(module);
        tracing::info!(
            "Instrumenting module {}: {} candidate methods",
            module.name,
            slots.len()
        );

        self.check_preconditions(module, &slots)?;

        let mut report = BatchReport::new(module.name.clone());
        for slot in slots {
            let (declaring, methods) = module.types[slot.type_index].split();
            let method = &mut methods[slot.method_index];

            match self.instrument_method(method, &declaring) {
                Ok(Disposition::Instrumented(kind)) => {
                    report.record_instrumented(method.full_name(&declaring), kind);
                }
                Ok(Disposition::Skipped(reason)) => {
                    report.record_skipped(method.full_name(&declaring), reason);
                }
                Err(error) => {
                    report.record_failure(error);
                    if self.config.fail_fast {
                        tracing::warn!("Stopping at first failure");
                        break;
                    }
                }
            }
        }

        tracing::info!(
            "Module {}: {} instrumented, {} skipped, {} failed",
            report.module,
            report.instrumented_count(),
            report.skipped_count(),
            report.failure_count()
        );
        Ok(report)
    }
}
