//! CIL Tracer - Execution trace capture for method bodies
//!
//! This crate runs a [`cil_body::MethodBody`] on a small stack machine and
//! records every instruction executed together with every call to the
//! tracer entry points.
//!
//! # Overview
//!
//! * Evaluation stack, locals and arguments hold [`Value`]s
//! * `leave` / `endfinally` / `throw` follow protected-region semantics:
//!   finally handlers run on every exit, inner first
//! * Calls to the [`cil_body::TracerHooks`] become [`TraceEvent`]s
//! * Every other call is handed to a [`Host`]
//! * A [`Heap`] keeps object fields across invocations, so a resumable step
//!   function can be driven through all of its steps
//!
//! # Usage
//!
//! ```
//! use cil_body::{BodyBuilder, OpCode, TracerHooks, TypeRef};
//! use cil_tracer::{trace_method, Heap, Invocation, NullHost, Outcome, Value};
//!
//! let mut b = BodyBuilder::new();
//! b.emit_all([OpCode::LdcI4(40), OpCode::LdcI4(2), OpCode::Add, OpCode::Ret]);
//! let body = b.build().unwrap();
//!
//! let hooks = TracerHooks::on_type(TypeRef::new("Diagnostics", "Tracer"));
//! let mut heap = Heap::new();
//! let run = trace_method(&body, &hooks, Invocation::default(), &mut heap, &mut NullHost).unwrap();
//! assert_eq!(run.outcome, Outcome::Returned(Some(Value::Int(42))));
//! println!("Executed {} instructions", run.trace.instruction_count());
//! ```
//!
//! # Limitations
//!
//! * Catch handlers accept every exception; values carry no type hierarchy.
//! * Only the opcodes of [`cil_body::OpCode`] exist.

pub mod trace;
pub mod vm;

pub use trace::{Execution, ExecutionTrace, InstructionTrace, Outcome, TraceEvent, Value};
pub use vm::{
    trace_method, Heap, Host, HostOutcome, Invocation, NullHost, TraceError,
    DEFAULT_INSTRUCTION_BUDGET,
};

/// Result type for tracer operations
pub type Result<T> = anyhow::Result<T>;
