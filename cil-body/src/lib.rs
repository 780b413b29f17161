//! CIL Body - Mutable method bodies for bytecode instrumentation
//!
//! This crate models the compiled body of a managed method as an ordered,
//! mutable instruction sequence together with its local slots and exception
//! regions, and provides the primitives needed to splice new code into it.
//!
//! # Overview
//!
//! * [`MethodBody`] owns the instructions; operands and region boundaries
//!   refer to instructions by [`InstrId`], so insertion never breaks them
//! * [`OpCode`] is a closed tagged union carrying each operand inline
//! * [`BodyBuilder`] constructs bodies from labels
//! * [`MethodDef`] / [`TypeDef`] / [`Module`] carry the loader's metadata and
//!   the marker predicates (constructor, async, generator)
//! * [`TracerHooks`] are the resolved tracer entry points calls are inserted to
//!
//! # Usage
//!
//! ```
//! use cil_body::{MethodBody, OpCode};
//!
//! let mut body = MethodBody::new();
//! let ret = body.push(OpCode::Ret);
//! body.insert_ops(0, vec![OpCode::Nop]);
//! assert_eq!(body.position(ret), Some(1));
//! body.validate().unwrap();
//! ```

pub mod body;
pub mod builder;
pub mod hooks;
pub mod instruction;
pub mod method;
pub mod types;

pub use body::{BodyError, ExceptionRegion, MethodBody, RegionKind};
pub use builder::{BodyBuilder, Label};
pub use hooks::{HookKind, TracerHooks};
pub use instruction::{InstrId, Instruction, OpCode};
pub use method::{
    DeclaringType, MethodDef, Module, StateMachineBinding, TypeDef, ASYNC_STATE_MACHINE_ATTRIBUTE,
};
pub use types::{FieldRef, Local, LocalId, MethodRef, TypeRef};
