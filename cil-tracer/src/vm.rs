//! Stack machine with execution tracing
//!
//! Executes one invocation of a method body and records every instruction
//! plus every tracer-hook call. Calls to anything else are delegated to a
//! [`Host`], which is how tests model base constructors, async builders and
//! faults.

use crate::trace::*;
use crate::Result;
use anyhow::Context;
use cil_body::{
    FieldRef, HookKind, InstrId, Instruction, LocalId, MethodBody, MethodRef, OpCode, RegionKind,
    TracerHooks, TypeRef,
};
use std::collections::HashMap;
use std::ops::Range;
use thiserror::Error;

/// Default number of instructions one invocation may execute
pub const DEFAULT_INSTRUCTION_BUDGET: u64 = 100_000;

/// Execution faults of the machine itself (not exceptions of the program)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    #[error("evaluation stack underflow at {0}")]
    StackUnderflow(InstrId),

    #[error("{at}: expected {expected}, found {found}")]
    TypeMismatch {
        at: InstrId,
        expected: &'static str,
        found: String,
    },

    #[error("argument {0} was not supplied")]
    MissingArgument(u16),

    #[error("execution ran past the last instruction")]
    FellOffEnd,

    #[error("endfinally at {0} outside a finally handler")]
    StrayEndfinally(InstrId),

    #[error("instruction budget of {0} exhausted")]
    BudgetExhausted(u64),

    #[error("tracer hook {0:?} called with malformed arguments")]
    BadHookArguments(HookKind),
}

/// Object fields, persisting across invocations
#[derive(Debug, Default)]
pub struct Heap {
    next: u32,
    fields: HashMap<(u32, String), Value>,
}

impl Heap {
    /// Create an empty heap
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh object
    pub fn alloc(&mut self) -> Value {
        let id = self.next;
        self.next += 1;
        Value::Object(id)
    }

    /// Read a field, defaulting by the field's declared type
    pub fn get(&self, object: u32, field: &FieldRef) -> Value {
        self.fields
            .get(&(object, field.name.clone()))
            .cloned()
            .unwrap_or_else(|| default_for(&field.field_type))
    }

    /// Write a field
    pub fn set(&mut self, object: u32, field: &FieldRef, value: Value) {
        self.fields.insert((object, field.name.clone()), value);
    }

    /// Read a field by name, if it was ever written
    pub fn field(&self, object: u32, name: &str) -> Option<&Value> {
        self.fields.get(&(object, name.to_string()))
    }

    /// Write a field by name
    pub fn set_field(&mut self, object: u32, name: &str, value: Value) {
        self.fields.insert((object, name.to_string()), value);
    }
}

/// Zero value of a type
fn default_for(ty: &TypeRef) -> Value {
    if *ty == TypeRef::int32() {
        Value::Int(0)
    } else {
        Value::Null
    }
}

/// What a host call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOutcome {
    /// Returned normally, with a value for non-void callees
    Return(Option<Value>),
    /// Raised an exception
    Raise(Value),
}

/// Handler for calls that are not tracer hooks
pub trait Host {
    /// Perform the call; `args` includes `this` first for instance callees
    fn call(&mut self, method: &MethodRef, args: Vec<Value>, heap: &mut Heap) -> HostOutcome;
}

impl<F> Host for F
where
    F: FnMut(&MethodRef, Vec<Value>, &mut Heap) -> HostOutcome,
{
    fn call(&mut self, method: &MethodRef, args: Vec<Value>, heap: &mut Heap) -> HostOutcome {
        self(method, args, heap)
    }
}

/// Host where every call returns the zero value of its return type
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHost;

impl Host for NullHost {
    fn call(&mut self, method: &MethodRef, _args: Vec<Value>, _heap: &mut Heap) -> HostOutcome {
        HostOutcome::Return(method.returns_value().then(|| default_for(&method.return_type)))
    }
}

/// Arguments and limits of one invocation
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Arguments, `this` first for instance methods
    pub args: Vec<Value>,
    /// Maximum number of instructions to execute
    pub budget: u64,
}

impl Invocation {
    /// Invocation with the default instruction budget
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            args,
            budget: DEFAULT_INSTRUCTION_BUDGET,
        }
    }

    /// Override the instruction budget
    pub fn with_budget(mut self, budget: u64) -> Self {
        self.budget = budget;
        self
    }
}

impl Default for Invocation {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Execute one invocation of `body`
///
/// # Arguments
/// * `body` - Method body to run; it is validated first
/// * `hooks` - Tracer entry points whose calls are recorded as events
/// * `invocation` - Arguments and instruction budget
/// * `heap` - Object fields, kept across invocations
/// * `host` - Handler for every other call
///
/// # Returns
/// * `Ok(Execution)` - How the invocation ended, plus its trace
/// * `Err(_)` - If the body is malformed or the machine faults
pub fn trace_method<H: Host + ?Sized>(
    body: &MethodBody,
    hooks: &TracerHooks,
    invocation: Invocation,
    heap: &mut Heap,
    host: &mut H,
) -> Result<Execution> {
    body.validate().context("Invalid method body")?;

    tracing::debug!(
        "Tracing body of {} instructions with {} arguments",
        body.len(),
        invocation.args.len()
    );

    let mut machine = Machine::new(body, hooks, invocation.args, heap, host);
    let outcome = machine.run(invocation.budget)?;

    tracing::debug!(
        "Executed {} instructions, {} events, outcome: {:?}",
        machine.trace.instruction_count(),
        machine.trace.events.len(),
        outcome
    );

    Ok(Execution {
        outcome,
        trace: machine.trace,
    })
}

/// Protected region resolved to positions
struct Region {
    finally: bool,
    protected: Range<usize>,
    handler: Range<usize>,
}

/// Work waiting for the current finally handler to finish
enum Pending {
    /// A `leave` still has these handlers (last runs first) before reaching `target`
    Leave { target: usize, handlers: Vec<usize> },
    /// An exception raised at `origin` resumes its search at `next_region`
    Unwind {
        exception: Value,
        origin: usize,
        next_region: usize,
    },
}

enum Flow {
    Next,
    Jump(usize),
    Finish(Outcome),
}

struct Machine<'a, H: Host + ?Sized> {
    body: &'a MethodBody,
    hooks: &'a TracerHooks,
    heap: &'a mut Heap,
    host: &'a mut H,
    positions: HashMap<InstrId, usize>,
    regions: Vec<Region>,
    args: Vec<Value>,
    locals: Vec<Value>,
    stack: Vec<Value>,
    pending: Vec<Pending>,
    trace: ExecutionTrace,
}

impl<'a, H: Host + ?Sized> Machine<'a, H> {
    fn new(
        body: &'a MethodBody,
        hooks: &'a TracerHooks,
        args: Vec<Value>,
        heap: &'a mut Heap,
        host: &'a mut H,
    ) -> Self {
        let positions: HashMap<InstrId, usize> = body
            .instructions()
            .iter()
            .enumerate()
            .map(|(index, i)| (i.id(), index))
            .collect();
        let regions = body
            .regions
            .iter()
            .map(|r| Region {
                finally: r.kind == RegionKind::Finally,
                protected: positions[&r.try_start]..positions[&r.try_end],
                handler: positions[&r.handler_start]..positions[&r.handler_end],
            })
            .collect();
        let locals = body.locals.iter().map(|l| default_for(&l.ty)).collect();

        Self {
            body,
            hooks,
            heap,
            host,
            positions,
            regions,
            args,
            locals,
            stack: Vec::new(),
            pending: Vec::new(),
            trace: ExecutionTrace::new(),
        }
    }

    fn run(&mut self, budget: u64) -> Result<Outcome> {
        let body = self.body;
        let mut pc = 0;
        let mut executed = 0u64;

        loop {
            if executed >= budget {
                return Err(TraceError::BudgetExhausted(budget).into());
            }
            executed += 1;

            let instruction = body.get(pc).ok_or(TraceError::FellOffEnd)?;
            self.trace.instructions.push(InstructionTrace {
                position: pc,
                id: instruction.id(),
                stack_depth: self.stack.len(),
            });

            match self.step(pc, instruction)? {
                Flow::Next => pc += 1,
                Flow::Jump(target) => pc = target,
                Flow::Finish(outcome) => return Ok(outcome),
            }
        }
    }

    fn step(&mut self, pc: usize, instruction: &Instruction) -> Result<Flow> {
        let at = instruction.id();
        match &instruction.op {
            OpCode::Nop => {}
            OpCode::Ldarg(n) => {
                let value = self
                    .args
                    .get(usize::from(*n))
                    .cloned()
                    .ok_or(TraceError::MissingArgument(*n))?;
                self.stack.push(value);
            }
            OpCode::Ldloc(LocalId(n)) => {
                let value = self.locals[usize::from(*n)].clone();
                self.stack.push(value);
            }
            OpCode::Stloc(LocalId(n)) => {
                let value = self.pop(at)?;
                self.locals[usize::from(*n)] = value;
            }
            OpCode::LdcI4(v) => self.stack.push(Value::Int(*v)),
            OpCode::Ldstr(s) => self.stack.push(Value::Str(s.clone())),
            OpCode::Ldnull => self.stack.push(Value::Null),
            OpCode::Ldfld(field) => match self.pop_object(at)? {
                Some(object) => {
                    let value = self.heap.get(object, field);
                    self.stack.push(value);
                }
                None => return Ok(self.raise(null_reference(), pc, 0)),
            },
            OpCode::Stfld(field) => {
                let value = self.pop(at)?;
                match self.pop_object(at)? {
                    Some(object) => self.heap.set(object, field, value),
                    None => return Ok(self.raise(null_reference(), pc, 0)),
                }
            }
            OpCode::Call(method) | OpCode::Callvirt(method) => return self.call(method, pc, at),
            OpCode::Newobj(ctor) => {
                let mut args = self.pop_n(ctor.params.len(), at)?;
                let object = self.heap.alloc();
                args.insert(0, object.clone());
                self.trace.events.push(TraceEvent::Call {
                    method: callee_name(ctor),
                });
                match self.host.call(ctor, args, &mut *self.heap) {
                    HostOutcome::Return(_) => self.stack.push(object),
                    HostOutcome::Raise(exception) => return Ok(self.raise(exception, pc, 0)),
                }
            }
            OpCode::Ret => return Ok(Flow::Finish(Outcome::Returned(self.stack.pop()))),
            OpCode::Br(target) | OpCode::BrS(target) => {
                return Ok(Flow::Jump(self.positions[target]));
            }
            OpCode::Brtrue(target) | OpCode::BrtrueS(target) => {
                if self.pop(at)?.is_true() {
                    return Ok(Flow::Jump(self.positions[target]));
                }
            }
            OpCode::Brfalse(target) | OpCode::BrfalseS(target) => {
                if !self.pop(at)?.is_true() {
                    return Ok(Flow::Jump(self.positions[target]));
                }
            }
            OpCode::Leave(target) | OpCode::LeaveS(target) => {
                self.stack.clear();
                let target = self.positions[target];
                return Ok(self.leave(pc, target));
            }
            OpCode::Endfinally => return self.end_finally(at),
            OpCode::Throw => {
                let exception = self.pop(at)?;
                return Ok(self.raise(exception, pc, 0));
            }
            OpCode::Pop => {
                self.pop(at)?;
            }
            OpCode::Dup => {
                let top = self.stack.last().cloned().ok_or(TraceError::StackUnderflow(at))?;
                self.stack.push(top);
            }
            OpCode::Ceq => {
                let b = self.pop(at)?;
                let a = self.pop(at)?;
                self.stack.push(Value::Int(i32::from(a == b)));
            }
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Clt | OpCode::Cgt => {
                let b = self.pop_int(at)?;
                let a = self.pop_int(at)?;
                let result = match instruction.op {
                    OpCode::Add => a.wrapping_add(b),
                    OpCode::Sub => a.wrapping_sub(b),
                    OpCode::Mul => a.wrapping_mul(b),
                    OpCode::Clt => i32::from(a < b),
                    _ => i32::from(a > b),
                };
                self.stack.push(Value::Int(result));
            }
        }
        Ok(Flow::Next)
    }

    fn call(&mut self, method: &MethodRef, pc: usize, at: InstrId) -> Result<Flow> {
        let args = self.pop_n(method.stack_args(), at)?;

        if let Some(kind) = self.hooks.kind_of(method) {
            let event = hook_event(kind, &args)?;
            tracing::trace!("Tracer hook at {}: {:?}", at, event);
            self.trace.events.push(event);
            return Ok(Flow::Next);
        }

        self.trace.events.push(TraceEvent::Call {
            method: callee_name(method),
        });
        match self.host.call(method, args, &mut *self.heap) {
            HostOutcome::Return(value) => {
                if method.returns_value() {
                    self.stack.push(value.unwrap_or(Value::Null));
                }
                Ok(Flow::Next)
            }
            HostOutcome::Raise(exception) => Ok(self.raise(exception, pc, 0)),
        }
    }

    /// Run every finally handler between `from` and `target`, innermost first
    fn leave(&mut self, from: usize, target: usize) -> Flow {
        let mut handlers: Vec<usize> = self
            .regions
            .iter()
            .filter(|r| r.finally && r.protected.contains(&from) && !r.protected.contains(&target))
            .map(|r| r.handler.start)
            .collect();
        handlers.reverse();

        match handlers.pop() {
            Some(first) => {
                self.pending.push(Pending::Leave { target, handlers });
                Flow::Jump(first)
            }
            None => Flow::Jump(target),
        }
    }

    fn end_finally(&mut self, at: InstrId) -> Result<Flow> {
        match self.pending.pop() {
            Some(Pending::Leave {
                target,
                mut handlers,
            }) => match handlers.pop() {
                Some(next) => {
                    self.pending.push(Pending::Leave { target, handlers });
                    Ok(Flow::Jump(next))
                }
                None => Ok(Flow::Jump(target)),
            },
            Some(Pending::Unwind {
                exception,
                origin,
                next_region,
            }) => Ok(self.raise(exception, origin, next_region)),
            None => Err(TraceError::StrayEndfinally(at).into()),
        }
    }

    /// Search handlers covering `origin`, starting at region `first_region`
    ///
    /// Catch clauses accept every exception; values carry no type hierarchy.
    fn raise(&mut self, exception: Value, origin: usize, first_region: usize) -> Flow {
        for (index, region) in self.regions.iter().enumerate().skip(first_region) {
            if !region.protected.contains(&origin) {
                continue;
            }
            self.stack.clear();
            if region.finally {
                self.pending.push(Pending::Unwind {
                    exception,
                    origin,
                    next_region: index + 1,
                });
            } else {
                self.stack.push(exception);
            }
            return Flow::Jump(region.handler.start);
        }
        tracing::trace!("Exception {} escaped every handler", exception);
        Flow::Finish(Outcome::Threw(exception))
    }

    fn pop(&mut self, at: InstrId) -> Result<Value> {
        Ok(self.stack.pop().ok_or(TraceError::StackUnderflow(at))?)
    }

    fn pop_n(&mut self, count: usize, at: InstrId) -> Result<Vec<Value>> {
        if self.stack.len() < count {
            return Err(TraceError::StackUnderflow(at).into());
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn pop_int(&mut self, at: InstrId) -> Result<i32> {
        match self.pop(at)? {
            Value::Int(v) => Ok(v),
            other => Err(TraceError::TypeMismatch {
                at,
                expected: "int32",
                found: other.to_string(),
            }
            .into()),
        }
    }

    /// Object reference operand; `None` for null
    fn pop_object(&mut self, at: InstrId) -> Result<Option<u32>> {
        match self.pop(at)? {
            Value::Object(object) => Ok(Some(object)),
            Value::Null => Ok(None),
            other => Err(TraceError::TypeMismatch {
                at,
                expected: "object reference",
                found: other.to_string(),
            }
            .into()),
        }
    }
}

fn null_reference() -> Value {
    Value::Str("System.NullReferenceException".into())
}

fn callee_name(method: &MethodRef) -> String {
    format!("{}::{}", method.declaring_type, method.name)
}

fn hook_event(kind: HookKind, args: &[Value]) -> Result<TraceEvent> {
    let event = match (kind, args) {
        (HookKind::Begin, [Value::Str(name)]) => TraceEvent::Begin { name: name.clone() },
        (HookKind::End, []) => TraceEvent::End,
        (HookKind::AsyncBegin, [Value::Int(id), Value::Str(name)]) => TraceEvent::AsyncBegin {
            id: *id,
            name: name.clone(),
        },
        (HookKind::AsyncEnd, [Value::Int(id), Value::Str(name)]) => TraceEvent::AsyncEnd {
            id: *id,
            name: name.clone(),
        },
        _ => return Err(TraceError::BadHookArguments(kind).into()),
    };
    Ok(event)
}
