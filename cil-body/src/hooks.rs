//! Tracer entry points
//!
//! The four already-resolved routines inserted calls target. Shared
//! read-only by every transformation in a run.

use crate::types::{MethodRef, TypeRef};
use serde::{Deserialize, Serialize};

/// Which tracer entry point a call targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookKind {
    /// `Begin(name: string)`
    Begin,
    /// `End()`
    End,
    /// `AsyncBegin(id: int32, name: string)`
    AsyncBegin,
    /// `AsyncEnd(id: int32, name: string)`
    AsyncEnd,
}

/// Resolved tracer entry points
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracerHooks {
    pub begin: MethodRef,
    pub end: MethodRef,
    pub async_begin: MethodRef,
    pub async_end: MethodRef,
}

impl TracerHooks {
    /// Entry points with the standard signatures on `tracer_type`
    pub fn on_type(tracer_type: TypeRef) -> Self {
        Self {
            begin: MethodRef::new_static(
                tracer_type.clone(),
                "Begin",
                vec![TypeRef::string()],
                TypeRef::void(),
            ),
            end: MethodRef::new_static(tracer_type.clone(), "End", vec![], TypeRef::void()),
            async_begin: MethodRef::new_static(
                tracer_type.clone(),
                "AsyncBegin",
                vec![TypeRef::int32(), TypeRef::string()],
                TypeRef::void(),
            ),
            async_end: MethodRef::new_static(
                tracer_type,
                "AsyncEnd",
                vec![TypeRef::int32(), TypeRef::string()],
                TypeRef::void(),
            ),
        }
    }

    /// Classify a callee as one of the hooks
    pub fn kind_of(&self, method: &MethodRef) -> Option<HookKind> {
        if *method == self.begin {
            Some(HookKind::Begin)
        } else if *method == self.end {
            Some(HookKind::End)
        } else if *method == self.async_begin {
            Some(HookKind::AsyncBegin)
        } else if *method == self.async_end {
            Some(HookKind::AsyncEnd)
        } else {
            None
        }
    }

    /// All four entry points
    pub fn all(&self) -> [&MethodRef; 4] {
        [&self.begin, &self.end, &self.async_begin, &self.async_end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_of() {
        let hooks = TracerHooks::on_type(TypeRef::new("Diagnostics", "Tracer"));
        assert_eq!(hooks.kind_of(&hooks.async_end), Some(HookKind::AsyncEnd));
        assert_eq!(hooks.kind_of(&hooks.begin), Some(HookKind::Begin));

        let unrelated = MethodRef::new_static(TypeRef::new("System", "Console"), "WriteLine", vec![], TypeRef::void());
        assert_eq!(hooks.kind_of(&unrelated), None);
    }
}
