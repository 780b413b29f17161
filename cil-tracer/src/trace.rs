//! Data structures for execution traces

use cil_body::{HookKind, InstrId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Runtime value on the evaluation stack, in a local, argument or field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Int(i32),
    Str(String),
    Null,
    /// Reference to a heap object
    Object(u32),
}

impl Value {
    /// Truthiness as seen by `brtrue` / `brfalse`
    pub fn is_true(&self) -> bool {
        match self {
            Value::Int(v) => *v != 0,
            Value::Null => false,
            Value::Str(_) | Value::Object(_) => true,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Null => f.write_str("null"),
            Value::Object(o) => write!(f, "obj#{o}"),
        }
    }
}

/// Something observable that happened during one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceEvent {
    /// `Begin(name)` tracer call
    Begin { name: String },
    /// `End()` tracer call
    End,
    /// `AsyncBegin(id, name)` tracer call
    AsyncBegin { id: i32, name: String },
    /// `AsyncEnd(id, name)` tracer call
    AsyncEnd { id: i32, name: String },
    /// Any other call, delegated to the host
    Call { method: String },
}

impl TraceEvent {
    /// Tracer entry point this event came from, if any
    pub fn hook_kind(&self) -> Option<HookKind> {
        match self {
            TraceEvent::Begin { .. } => Some(HookKind::Begin),
            TraceEvent::End => Some(HookKind::End),
            TraceEvent::AsyncBegin { .. } => Some(HookKind::AsyncBegin),
            TraceEvent::AsyncEnd { .. } => Some(HookKind::AsyncEnd),
            TraceEvent::Call { .. } => None,
        }
    }
}

/// One executed instruction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionTrace {
    /// Position in the body at the time of execution
    pub position: usize,
    /// Identity of the executed instruction
    pub id: InstrId,
    /// Evaluation stack depth before execution
    pub stack_depth: usize,
}

/// How an invocation ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// `ret`, with the returned value for non-void bodies
    Returned(Option<Value>),
    /// An exception escaped every handler
    Threw(Value),
}

/// Complete trace of one invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionTrace {
    /// Instructions in execution order
    pub instructions: Vec<InstructionTrace>,
    /// Observable events in the order they happened
    pub events: Vec<TraceEvent>,
}

impl ExecutionTrace {
    /// Create new empty execution trace
    pub fn new() -> Self {
        Self::default()
    }

    /// Get number of instructions executed
    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    /// Only the tracer-hook events, in order
    pub fn hook_events(&self) -> Vec<&TraceEvent> {
        self.events.iter().filter(|e| e.hook_kind().is_some()).collect()
    }

    /// Number of calls to one tracer entry point
    pub fn count(&self, kind: HookKind) -> usize {
        self.events
            .iter()
            .filter(|e| e.hook_kind() == Some(kind))
            .count()
    }

    /// Index in `events` of the first event matching the predicate
    pub fn position_of(&self, predicate: impl Fn(&TraceEvent) -> bool) -> Option<usize> {
        self.events.iter().position(predicate)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Result of running one invocation
#[derive(Debug, Clone)]
pub struct Execution {
    pub outcome: Outcome,
    pub trace: ExecutionTrace,
}
