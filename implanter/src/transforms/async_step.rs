//! Async step function transform
//!
//! An async method is compiled into a state type whose step method runs once
//! per resumption. Only some of its `leave` instructions end the whole
//! operation; the rest park it until an awaited value is ready.
//!
//! Classification of the step body's exits:
//!
//! * The instruction right after the last `leave` is the completion funnel,
//!   where the result-publishing code starts.
//! * A `leave` targeting the funnel is a completion exit.
//! * A `leave` shortly after a call reporting a fault is a completion exit.
//! * Every other `leave` suspends and is left alone.
//!
//! `AsyncBegin(id, name)` is inserted on every step; `AsyncEnd(id, name)` only
//! ahead of completion exits.

use super::{ensure_uninstrumented, finish, Instrumented, MethodContext, MethodTransform};
use crate::config::StepShape;
use crate::error::TransformError;
use cil_body::{
    InstrId, Instruction, MethodBody, MethodDef, MethodRef, OpCode, StateMachineBinding,
    TracerHooks,
};
use std::sync::atomic::{AtomicI32, Ordering};

/// Source of correlation ids, one per instrumented async method
///
/// Ids start at zero, strictly increase and are never reused, also when
/// allocation happens from several threads.
#[derive(Debug, Default)]
pub struct AsyncIdAllocator {
    next: AtomicI32,
}

impl AsyncIdAllocator {
    /// Allocator whose first id is 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next id
    pub fn allocate(&self) -> i32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Id the next allocation will return
    pub fn peek(&self) -> i32 {
        self.next.load(Ordering::Relaxed)
    }
}

/// Exit classification of a step body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepExits {
    /// First instruction of the result-publishing code
    pub funnel: InstrId,
    /// Exits that end the operation (success or reported fault)
    pub completions: Vec<InstrId>,
    /// Exits that park the operation until it is resumed
    pub suspensions: Vec<InstrId>,
}

/// AsyncBegin/AsyncEnd instrumentation of async step functions
#[derive(Debug, Clone, Copy)]
pub struct AsyncStepTransform<'a> {
    shape: &'a StepShape,
    ids: &'a AsyncIdAllocator,
}

impl<'a> AsyncStepTransform<'a> {
    /// Create a transform drawing correlation ids from `ids`
    pub fn new(shape: &'a StepShape, ids: &'a AsyncIdAllocator) -> Self {
        Self { shape, ids }
    }
}

impl MethodTransform for AsyncStepTransform<'_> {
    fn transform(&self, method: &mut MethodDef, cx: &MethodContext<'_>) -> Result<Instrumented, TransformError> {
        let binding = method
            .state_machine
            .as_mut()
            .ok_or(TransformError::MissingStateMachine)?;
        let step = locate_step(binding, &self.shape.step_method)?;
        let original = binding.methods[step]
            .body
            .as_mut()
            .ok_or(TransformError::MissingBody)?;

        let id = self.ids.allocate();
        let mut body = original.clone();
        instrument_step(&mut body, id, cx.full_name, cx.hooks, self.shape)?;
        *original = body;

        Ok(Instrumented::Async { id })
    }
}

/// Index of the single step method of a state type
pub fn locate_step(binding: &StateMachineBinding, step_method: &str) -> Result<usize, TransformError> {
    match binding.candidates(step_method).as_slice() {
        [only] => Ok(*only),
        others => Err(TransformError::StepMethodCount {
            name: step_method.to_string(),
            found: others.len(),
        }),
    }
}

/// Instrument one step body under correlation id `id`
///
/// # Arguments
/// * `body` - Step function body to rewrite in place
/// * `id` - Correlation id shared by every step of the operation
/// * `name` - Fully qualified name of the async method
/// * `hooks` - Tracer entry points
/// * `shape` - Name patterns of the step function
///
/// # Returns
/// The exit classification the instrumentation was based on
pub fn instrument_step(
    body: &mut MethodBody,
    id: i32,
    name: &str,
    hooks: &TracerHooks,
    shape: &StepShape,
) -> Result<StepExits, TransformError> {
    if body.is_empty() {
        return Err(TransformError::EmptyBody);
    }
    ensure_uninstrumented(body, hooks)?;

    body.simplify_branches();
    let exits = classify_exits(body, shape)?;
    let entry = entry_point(body, shape)?;

    body.insert_ops(entry, correlated_call(id, name, &hooks.async_begin));
    for &exit in &exits.completions {
        // Branches aimed at the exit now run AsyncEnd before leaving
        body.insert_ahead_of_target(exit, correlated_call(id, name, &hooks.async_end));
    }

    finish(body)?;

    tracing::debug!(
        "Instrumented step of {} (id {}): AsyncBegin at {}, funnel {}, {} completion exits, {} suspensions",
        name,
        id,
        entry,
        exits.funnel,
        exits.completions.len(),
        exits.suspensions.len()
    );
    Ok(exits)
}

/// Split the body's `leave` instructions into completions and suspensions
pub fn classify_exits(body: &MethodBody, shape: &StepShape) -> Result<StepExits, TransformError> {
    let instructions = body.instructions();
    let last_leave = instructions
        .iter()
        .rposition(Instruction::is_branch_to_cleanup)
        .ok_or(TransformError::NoCompletionFunnel)?;
    let funnel = instructions
        .get(last_leave + 1)
        .map(Instruction::id)
        .ok_or(TransformError::NoCompletionFunnel)?;

    let mut completions = Vec::new();
    let mut suspensions = Vec::new();
    for (index, instruction) in instructions.iter().enumerate() {
        if !instruction.is_branch_to_cleanup() {
            continue;
        }
        let reaches_funnel = instruction.op.branch_target() == Some(funnel);
        let reports_fault = instructions[index.saturating_sub(shape.fault_lookback)..index]
            .iter()
            .any(|previous| previous.is_call_named(&shape.fault_report_method));

        if reaches_funnel || reports_fault {
            completions.push(instruction.id());
        } else {
            suspensions.push(instruction.id());
        }
    }

    if completions.is_empty() {
        return Err(TransformError::NoCompletionExit(funnel));
    }
    Ok(StepExits {
        funnel,
        completions,
        suspensions,
    })
}

/// Where `AsyncBegin` goes: ahead of the `ldarg.0; ldfld <state>` that
/// dispatches on the current state, or at the very start when no state field
/// is read
pub fn entry_point(body: &MethodBody, shape: &StepShape) -> Result<usize, TransformError> {
    let instructions = body.instructions();
    let Some(load) = instructions.iter().position(|i| {
        matches!(&i.op, OpCode::Ldfld(field) if field.name.contains(shape.state_field_marker.as_str()))
    }) else {
        return Ok(0);
    };

    match load.checked_sub(1).map(|at| &instructions[at].op) {
        Some(OpCode::Ldarg(0)) => Ok(load - 1),
        _ => Err(TransformError::UnrecognizedStepShape {
            at: instructions[load].id(),
        }),
    }
}

fn correlated_call(id: i32, name: &str, hook: &MethodRef) -> Vec<OpCode> {
    vec![
        OpCode::LdcI4(id),
        OpCode::Ldstr(name.to_string()),
        OpCode::Call(hook.clone()),
    ]
}
