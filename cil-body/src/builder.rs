//! Label-based construction of method bodies
//!
//! Branch operands need the identity of their target before the target is
//! emitted. `BodyBuilder` hands out labels (reserved identities) that are
//! bound to whichever instruction is emitted next.
//!
//! ```
//! use cil_body::{BodyBuilder, OpCode};
//!
//! let mut b = BodyBuilder::new();
//! let done = b.label();
//! b.emit(OpCode::Ldarg(0));
//! b.emit(OpCode::Brfalse(done.id()));
//! b.emit(OpCode::Nop);
//! b.bind(done);
//! b.emit(OpCode::Ret);
//! let body = b.build().unwrap();
//! assert_eq!(body.len(), 4);
//! ```

use crate::body::{BodyError, ExceptionRegion, MethodBody, RegionKind};
use crate::instruction::{InstrId, Instruction, OpCode};
use crate::types::{LocalId, TypeRef};
use std::collections::HashSet;

/// Reserved instruction identity, bound with [`BodyBuilder::bind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(InstrId);

impl Label {
    /// Identity the bound instruction will carry
    pub fn id(self) -> InstrId {
        self.0
    }
}

/// Builder for [`MethodBody`]
#[derive(Debug, Default)]
pub struct BodyBuilder {
    body: MethodBody,
    /// Label waiting for the next emitted instruction
    pending: Option<InstrId>,
    /// Labels handed out but not yet bound
    unbound: HashSet<InstrId>,
}

impl BodyBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a label
    pub fn label(&mut self) -> Label {
        let id = self.body.allocate_id();
        self.unbound.insert(id);
        Label(id)
    }

    /// Bind `label` to the next emitted instruction
    ///
    /// Binding a second label before emitting anything inserts a `nop` to
    /// carry the first one, since an instruction has exactly one identity.
    pub fn bind(&mut self, label: Label) {
        if self.pending.is_some() {
            self.emit(OpCode::Nop);
        }
        self.unbound.remove(&label.0);
        self.pending = Some(label.0);
    }

    /// Emit an instruction, returning its identity
    pub fn emit(&mut self, op: OpCode) -> InstrId {
        match self.pending.take() {
            Some(id) => self.body.push_instruction(Instruction::with_id(id, op)),
            None => self.body.push(op),
        }
    }

    /// Emit a sequence of instructions
    pub fn emit_all(&mut self, ops: impl IntoIterator<Item = OpCode>) {
        for op in ops {
            self.emit(op);
        }
    }

    /// Declare a local slot
    pub fn local(&mut self, ty: TypeRef) -> Result<LocalId, BodyError> {
        self.body.add_local(ty)
    }

    /// Attach a protected region; regions must be added innermost first
    pub fn region(
        &mut self,
        kind: RegionKind,
        try_start: Label,
        try_end: Label,
        handler_start: Label,
        handler_end: Label,
    ) {
        self.body.regions.push(ExceptionRegion {
            kind,
            try_start: try_start.0,
            try_end: try_end.0,
            handler_start: handler_start.0,
            handler_end: handler_end.0,
        });
    }

    /// Set the zero-initialize-locals flag
    pub fn init_locals(&mut self, init: bool) {
        self.body.init_locals = init;
    }

    /// Finish the body, checking that every label is bound and the body is valid
    pub fn build(self) -> Result<MethodBody, BodyError> {
        if let Some(id) = self.pending {
            return Err(BodyError::UnboundLabel(id));
        }
        if let Some(&id) = self.unbound.iter().min() {
            return Err(BodyError::UnboundLabel(id));
        }
        self.body.validate()?;
        Ok(self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_resolve_forward_and_backward() {
        let mut b = BodyBuilder::new();
        let top = b.label();
        let end = b.label();
        b.bind(top);
        b.emit(OpCode::Ldarg(0));
        b.emit(OpCode::Brtrue(end.id()));
        b.emit(OpCode::Br(top.id()));
        b.bind(end);
        b.emit(OpCode::Ret);

        let body = b.build().unwrap();
        assert_eq!(body.position(top.id()), Some(0));
        assert_eq!(body.position(end.id()), Some(3));
    }

    #[test]
    fn test_two_labels_on_one_spot() {
        let mut b = BodyBuilder::new();
        let first = b.label();
        let second = b.label();
        b.bind(first);
        b.bind(second);
        b.emit(OpCode::Ret);

        let body = b.build().unwrap();
        assert_eq!(body.instruction(first.id()).unwrap().op, OpCode::Nop);
        assert_eq!(body.instruction(second.id()).unwrap().op, OpCode::Ret);
    }

    #[test]
    fn test_unbound_label_is_an_error() {
        let mut b = BodyBuilder::new();
        let never = b.label();
        b.emit(OpCode::Br(never.id()));
        assert_eq!(b.build().unwrap_err(), BodyError::UnboundLabel(never.id()));
    }

    #[test]
    fn test_trailing_bind_is_an_error() {
        let mut b = BodyBuilder::new();
        b.emit(OpCode::Ret);
        let dangling = b.label();
        b.bind(dangling);
        assert_eq!(b.build().unwrap_err(), BodyError::UnboundLabel(dangling.id()));
    }

    #[test]
    fn test_region_by_labels() {
        let mut b = BodyBuilder::new();
        let (try_start, handler, after) = (b.label(), b.label(), b.label());
        b.bind(try_start);
        b.emit(OpCode::Nop);
        b.emit(OpCode::Leave(after.id()));
        b.bind(handler);
        b.emit(OpCode::Endfinally);
        b.bind(after);
        b.emit(OpCode::Ret);
        b.region(RegionKind::Finally, try_start, handler, handler, after);

        let body = b.build().unwrap();
        assert_eq!(body.regions.len(), 1);
        assert_eq!(body.regions[0].handler_start, handler.id());
    }
}
