//! Instruction representation
//!
//! An instruction is an opcode plus its operand, carried together in one
//! tagged union. Branch operands name their target by [`InstrId`], so
//! inserting or removing other instructions never invalidates them.

use crate::types::{FieldRef, LocalId, MethodRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of an instruction within its owning body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrId(pub u32);

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// Operation kind with its operand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpCode {
    Nop,
    /// Load argument (index 0 is `this` for instance methods)
    Ldarg(u16),
    Ldloc(LocalId),
    Stloc(LocalId),
    LdcI4(i32),
    Ldstr(String),
    Ldnull,
    /// Pop an object reference, push the field value
    Ldfld(FieldRef),
    /// Pop a value and an object reference, store the field
    Stfld(FieldRef),
    Call(MethodRef),
    Callvirt(MethodRef),
    Newobj(MethodRef),
    Ret,
    Br(InstrId),
    BrS(InstrId),
    Brtrue(InstrId),
    BrtrueS(InstrId),
    Brfalse(InstrId),
    BrfalseS(InstrId),
    /// Exit a protected region, running enclosing finally handlers first
    Leave(InstrId),
    LeaveS(InstrId),
    Endfinally,
    Throw,
    Pop,
    Dup,
    Add,
    Sub,
    Mul,
    Ceq,
    Clt,
    Cgt,
}

impl OpCode {
    /// Mnemonic as it appears in disassembly
    pub fn mnemonic(&self) -> &'static str {
        match self {
            OpCode::Nop => "nop",
            OpCode::Ldarg(_) => "ldarg",
            OpCode::Ldloc(_) => "ldloc",
            OpCode::Stloc(_) => "stloc",
            OpCode::LdcI4(_) => "ldc.i4",
            OpCode::Ldstr(_) => "ldstr",
            OpCode::Ldnull => "ldnull",
            OpCode::Ldfld(_) => "ldfld",
            OpCode::Stfld(_) => "stfld",
            OpCode::Call(_) => "call",
            OpCode::Callvirt(_) => "callvirt",
            OpCode::Newobj(_) => "newobj",
            OpCode::Ret => "ret",
            OpCode::Br(_) => "br",
            OpCode::BrS(_) => "br.s",
            OpCode::Brtrue(_) => "brtrue",
            OpCode::BrtrueS(_) => "brtrue.s",
            OpCode::Brfalse(_) => "brfalse",
            OpCode::BrfalseS(_) => "brfalse.s",
            OpCode::Leave(_) => "leave",
            OpCode::LeaveS(_) => "leave.s",
            OpCode::Endfinally => "endfinally",
            OpCode::Throw => "throw",
            OpCode::Pop => "pop",
            OpCode::Dup => "dup",
            OpCode::Add => "add",
            OpCode::Sub => "sub",
            OpCode::Mul => "mul",
            OpCode::Ceq => "ceq",
            OpCode::Clt => "clt",
            OpCode::Cgt => "cgt",
        }
    }

    /// Target of a branch instruction, if this is one
    pub fn branch_target(&self) -> Option<InstrId> {
        match *self {
            OpCode::Br(t)
            | OpCode::BrS(t)
            | OpCode::Brtrue(t)
            | OpCode::BrtrueS(t)
            | OpCode::Brfalse(t)
            | OpCode::BrfalseS(t)
            | OpCode::Leave(t)
            | OpCode::LeaveS(t) => Some(t),
            _ => None,
        }
    }

    /// Whether this is a short-form branch (one byte displacement)
    pub fn is_short_branch(&self) -> bool {
        matches!(
            self,
            OpCode::BrS(_) | OpCode::BrtrueS(_) | OpCode::BrfalseS(_) | OpCode::LeaveS(_)
        )
    }

    /// Long-form equivalent of a short branch; other opcodes are returned as-is
    pub fn to_long_form(&self) -> OpCode {
        match *self {
            OpCode::BrS(t) => OpCode::Br(t),
            OpCode::BrtrueS(t) => OpCode::Brtrue(t),
            OpCode::BrfalseS(t) => OpCode::Brfalse(t),
            OpCode::LeaveS(t) => OpCode::Leave(t),
            ref other => other.clone(),
        }
    }

    /// Short-form equivalent of a long branch; other opcodes are returned as-is
    pub fn to_short_form(&self) -> OpCode {
        match *self {
            OpCode::Br(t) => OpCode::BrS(t),
            OpCode::Brtrue(t) => OpCode::BrtrueS(t),
            OpCode::Brfalse(t) => OpCode::BrfalseS(t),
            OpCode::Leave(t) => OpCode::LeaveS(t),
            ref other => other.clone(),
        }
    }

    /// Encoded size in bytes, using the most compact form for the operand
    /// value (branches are sized by their current short/long form)
    pub fn encoded_size(&self) -> u32 {
        match self {
            OpCode::Ldarg(n) => slot_size(*n),
            OpCode::Ldloc(LocalId(n)) | OpCode::Stloc(LocalId(n)) => slot_size(*n),
            OpCode::LdcI4(v) => match *v {
                -1..=8 => 1,
                -128..=127 => 2,
                _ => 5,
            },
            OpCode::Ldstr(_)
            | OpCode::Ldfld(_)
            | OpCode::Stfld(_)
            | OpCode::Call(_)
            | OpCode::Callvirt(_)
            | OpCode::Newobj(_) => 5,
            OpCode::BrS(_) | OpCode::BrtrueS(_) | OpCode::BrfalseS(_) | OpCode::LeaveS(_) => 2,
            OpCode::Br(_) | OpCode::Brtrue(_) | OpCode::Brfalse(_) | OpCode::Leave(_) => 5,
            OpCode::Ceq | OpCode::Clt | OpCode::Cgt => 2,
            OpCode::Nop
            | OpCode::Ldnull
            | OpCode::Ret
            | OpCode::Endfinally
            | OpCode::Throw
            | OpCode::Pop
            | OpCode::Dup
            | OpCode::Add
            | OpCode::Sub
            | OpCode::Mul => 1,
        }
    }
}

/// ldarg/ldloc/stloc: macro form for 0-3, `.s` form up to 255, long form beyond
fn slot_size(index: u16) -> u32 {
    match index {
        0..=3 => 1,
        4..=255 => 2,
        _ => 4,
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.mnemonic();
        match self {
            OpCode::Ldarg(n) => write!(f, "{name} {n}"),
            OpCode::Ldloc(LocalId(n)) | OpCode::Stloc(LocalId(n)) => write!(f, "{name} {n}"),
            OpCode::LdcI4(v) => write!(f, "{name} {v}"),
            OpCode::Ldstr(s) => write!(f, "{name} {s:?}"),
            OpCode::Ldfld(field) | OpCode::Stfld(field) => {
                write!(f, "{name} {}::{}", field.declaring_type, field.name)
            }
            OpCode::Call(m) | OpCode::Callvirt(m) | OpCode::Newobj(m) => write!(f, "{name} {m}"),
            _ => match self.branch_target() {
                Some(target) => write!(f, "{name} {target}"),
                None => f.write_str(name),
            },
        }
    }
}

/// One instruction of a method body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    id: InstrId,
    /// Operation and operand
    pub op: OpCode,
}

impl Instruction {
    /// Identity used by branch operands and region boundaries
    pub fn id(&self) -> InstrId {
        self.id
    }

    pub(crate) fn with_id(id: InstrId, op: OpCode) -> Self {
        Self { id, op }
    }

    /// Whether this instruction leaves a protected region, in either encoding
    pub fn is_branch_to_cleanup(&self) -> bool {
        matches!(self.op, OpCode::Leave(_) | OpCode::LeaveS(_))
    }

    /// Whether this is `call` (not `callvirt`) of a routine with this name
    pub fn is_call_named(&self, name: &str) -> bool {
        matches!(&self.op, OpCode::Call(m) if m.name == name)
    }

    /// Callee of a `call`/`callvirt`, if any
    pub fn callee(&self) -> Option<&MethodRef> {
        match &self.op {
            OpCode::Call(m) | OpCode::Callvirt(m) => Some(m),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.op)
    }
}
