//! Mutable method body
//!
//! Owns the instruction sequence, local slots and exception regions of one
//! method. Position is implicit in sequence order; everything that points at
//! an instruction does so through its [`InstrId`].

use crate::instruction::{InstrId, Instruction, OpCode};
use crate::types::{Local, LocalId, MethodRef, TypeRef};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use thiserror::Error;

/// Structural problems detected in a method body
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    #[error("instruction {0} appears more than once")]
    DuplicateInstruction(InstrId),

    #[error("{from} branches to {target}, which is not in the body")]
    DanglingBranch { from: InstrId, target: InstrId },

    #[error("exception region #{index} references {id}, which is not in the body")]
    DanglingRegion { index: usize, id: InstrId },

    #[error("exception region #{index} boundaries are out of order")]
    RegionOrder { index: usize },

    #[error("{at} uses local {local}, which is not declared")]
    UndeclaredLocal { at: InstrId, local: u16 },

    #[error("label {0} was never bound to an instruction")]
    UnboundLabel(InstrId),

    #[error("method already declares {0} locals, the most a body can hold")]
    TooManyLocals(usize),
}

/// Handler kind of a protected region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionKind {
    /// Run-on-exit handler, entered on every exit from the protected range
    Finally,
    /// Handler entered when an exception of the given type escapes the protected range
    Catch(TypeRef),
}

/// Protected region with its handler
///
/// Ends are exclusive: `try_end` is the first instruction after the protected
/// range and `handler_end` the first instruction after the handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRegion {
    pub kind: RegionKind,
    pub try_start: InstrId,
    pub try_end: InstrId,
    pub handler_start: InstrId,
    pub handler_end: InstrId,
}

impl ExceptionRegion {
    /// All four boundary instructions, in `try_start..handler_end` order
    pub fn boundaries(&self) -> [InstrId; 4] {
        [self.try_start, self.try_end, self.handler_start, self.handler_end]
    }
}

/// Instruction sequence, locals and exception regions of one method
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    instructions: Vec<Instruction>,
    /// Local variable slots, indexed by [`LocalId`]
    pub locals: Vec<Local>,
    /// Exception regions, innermost first
    pub regions: Vec<ExceptionRegion>,
    /// Whether locals are zero-initialized on entry
    pub init_locals: bool,
    next_id: u32,
}

impl MethodBody {
    /// Create an empty body
    pub fn new() -> Self {
        Self::default()
    }

    /// Instructions in execution-order layout
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Number of instructions
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Whether the body has no instructions
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Instruction at a position
    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.instructions.get(index)
    }

    /// Current position of an instruction
    pub fn position(&self, id: InstrId) -> Option<usize> {
        self.instructions.iter().position(|i| i.id() == id)
    }

    /// Look up an instruction by identity
    pub fn instruction(&self, id: InstrId) -> Option<&Instruction> {
        self.instructions.iter().find(|i| i.id() == id)
    }

    /// Mutable lookup by identity; the identity itself cannot change
    pub fn instruction_mut(&mut self, id: InstrId) -> Option<&mut Instruction> {
        self.instructions.iter_mut().find(|i| i.id() == id)
    }

    /// Allocate a fresh, not yet placed instruction
    ///
    /// Its id may be used as a branch target before it is inserted, as long
    /// as it is inserted before the body is next validated.
    pub fn create(&mut self, op: OpCode) -> Instruction {
        let id = self.allocate_id();
        Instruction::with_id(id, op)
    }

    pub(crate) fn allocate_id(&mut self) -> InstrId {
        let id = InstrId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Append a new instruction at the end
    pub fn push(&mut self, op: OpCode) -> InstrId {
        let instruction = self.create(op);
        self.push_instruction(instruction)
    }

    /// Append an instruction previously obtained from [`MethodBody::create`]
    pub fn push_instruction(&mut self, instruction: Instruction) -> InstrId {
        let id = instruction.id();
        self.instructions.push(instruction);
        id
    }

    /// Insert a contiguous, order-preserving run before the instruction at `index`
    ///
    /// Later instructions shift forward. Branch operands and region boundaries
    /// are untouched since they reference identities, not positions.
    ///
    /// # Panics
    /// Panics if `index > self.len()`.
    pub fn insert_sequence<I>(&mut self, index: usize, instructions: I)
    where
        I: IntoIterator<Item = Instruction>,
    {
        assert!(
            index <= self.instructions.len(),
            "insertion index {index} out of range for body of {} instructions",
            self.instructions.len()
        );
        self.instructions.splice(index..index, instructions);
    }

    /// Create and insert a run of opcodes before the instruction at `index`
    ///
    /// Returns the identities of the inserted instructions.
    pub fn insert_ops(&mut self, index: usize, ops: Vec<OpCode>) -> Vec<InstrId> {
        let created: Vec<Instruction> = ops.into_iter().map(|op| self.create(op)).collect();
        let ids = created.iter().map(Instruction::id).collect();
        self.insert_sequence(index, created);
        ids
    }

    /// Insert code ahead of `anchor` so that control arriving at `anchor`,
    /// by fall-through or by branch, runs the new code first
    ///
    /// `anchor` keeps its identity but becomes a `nop`; the new opcodes
    /// follow it, then a fresh instruction carrying the anchor's original
    /// opcode and operand. Returns the identity of that fresh instruction,
    /// or `None` if `anchor` is not in the body.
    pub fn insert_ahead_of_target(&mut self, anchor: InstrId, ops: Vec<OpCode>) -> Option<InstrId> {
        let index = self.position(anchor)?;
        let original = std::mem::replace(&mut self.instructions[index].op, OpCode::Nop);
        let mut run: Vec<Instruction> = ops.into_iter().map(|op| self.create(op)).collect();
        let moved = self.create(original);
        let moved_id = moved.id();
        run.push(moved);
        self.insert_sequence(index + 1, run);
        Some(moved_id)
    }

    /// Declare a new local slot; slots are indexed by `u16`
    pub fn add_local(&mut self, ty: TypeRef) -> Result<LocalId, BodyError> {
        let index = u16::try_from(self.locals.len()).map_err(|_| BodyError::TooManyLocals(self.locals.len()))?;
        self.locals.push(Local { ty });
        Ok(LocalId(index))
    }

    /// Whether any instruction calls `method`
    pub fn calls(&self, method: &MethodRef) -> bool {
        self.instructions.iter().any(|i| i.callee() == Some(method))
    }

    /// Check the body invariants
    ///
    /// * every identity appears once
    /// * every branch operand and region boundary is in the body
    /// * region boundaries are ordered `try_start <= try_end <= handler_start <= handler_end`
    /// * every local access names a declared slot
    pub fn validate(&self) -> Result<(), BodyError> {
        let mut positions = HashMap::with_capacity(self.instructions.len());
        for (index, instruction) in self.instructions.iter().enumerate() {
            if positions.insert(instruction.id(), index).is_some() {
                return Err(BodyError::DuplicateInstruction(instruction.id()));
            }
        }

        for instruction in &self.instructions {
            if let Some(target) = instruction.op.branch_target() {
                if !positions.contains_key(&target) {
                    return Err(BodyError::DanglingBranch {
                        from: instruction.id(),
                        target,
                    });
                }
            }
            if let OpCode::Ldloc(LocalId(n)) | OpCode::Stloc(LocalId(n)) = instruction.op {
                if usize::from(n) >= self.locals.len() {
                    return Err(BodyError::UndeclaredLocal {
                        at: instruction.id(),
                        local: n,
                    });
                }
            }
        }

        for (index, region) in self.regions.iter().enumerate() {
            let mut previous = 0;
            for id in region.boundaries() {
                let position = *positions
                    .get(&id)
                    .ok_or(BodyError::DanglingRegion { index, id })?;
                if position < previous {
                    return Err(BodyError::RegionOrder { index });
                }
                previous = position;
            }
        }

        Ok(())
    }

    /// Rewrite every short branch to its long form
    ///
    /// Done before editing so inserted code can never push a displacement
    /// out of short range.
    pub fn simplify_branches(&mut self) {
        for instruction in &mut self.instructions {
            if instruction.op.is_short_branch() {
                instruction.op = instruction.op.to_long_form();
            }
        }
    }

    /// Shrink long branches to short form wherever the displacement fits
    ///
    /// Repeats until no further branch can shrink, since every shrink can
    /// bring other targets into range.
    pub fn optimize_branches(&mut self) {
        let mut shrunk = 0usize;
        loop {
            let offsets = self.offsets();
            let mut changed = false;

            for index in 0..self.instructions.len() {
                let instruction = &self.instructions[index];
                let Some(target) = instruction.op.branch_target() else {
                    continue;
                };
                if instruction.op.is_short_branch() {
                    continue;
                }
                let Some(&target_offset) = offsets.get(&target) else {
                    continue;
                };
                let offset = offsets[&instruction.id()];
                // Forward targets move back by the same 3 bytes this branch loses.
                let displacement = if target_offset > offset {
                    i64::from(target_offset) - i64::from(offset) - 5
                } else {
                    i64::from(target_offset) - i64::from(offset) - 2
                };
                if i8::try_from(displacement).is_ok() {
                    let short = instruction.op.to_short_form();
                    self.instructions[index].op = short;
                    shrunk += 1;
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }
        tracing::trace!("Shrunk {} branches to short form, code size {} bytes", shrunk, self.code_size());
    }

    /// Byte offset of every instruction under the current encodings
    pub fn offsets(&self) -> HashMap<InstrId, u32> {
        let mut offset = 0;
        self.instructions
            .iter()
            .map(|i| {
                let here = offset;
                offset += i.op.encoded_size();
                (i.id(), here)
            })
            .collect()
    }

    /// Total encoded size in bytes
    pub fn code_size(&self) -> u32 {
        self.instructions.iter().map(|i| i.op.encoded_size()).sum()
    }

    /// Identities referenced as branch targets anywhere in the body
    pub fn branch_targets(&self) -> HashSet<InstrId> {
        self.instructions
            .iter()
            .filter_map(|i| i.op.branch_target())
            .collect()
    }

    /// Human-readable listing, one instruction per line with its offset
    pub fn disassemble(&self) -> String {
        let offsets = self.offsets();
        let mut out = String::new();
        for instruction in &self.instructions {
            let _ = writeln!(
                out,
                "IL_{:04x} {instruction}",
                offsets[&instruction.id()]
            );
        }
        for region in &self.regions {
            let _ = writeln!(
                out,
                ".{:?} try {}..{} handler {}..{}",
                region.kind, region.try_start, region.try_end, region.handler_start, region.handler_end
            );
        }
        out
    }
}
