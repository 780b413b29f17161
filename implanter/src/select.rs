//! Method selection by include-lists

use crate::config::ImplantConfig;
use cil_body::{MethodDef, Module, TypeDef};
use std::collections::HashSet;

/// Position of a selected method inside a module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSlot {
    pub type_index: usize,
    pub method_index: usize,
}

/// Include-list filter over namespaces, type names and method names
///
/// An empty list includes everything. Only concrete methods (with a body,
/// not abstract, not an empty constructor) are ever selected.
#[derive(Debug, Clone, Default)]
pub struct MethodSelector {
    namespaces: HashSet<String>,
    types: HashSet<String>,
    methods: HashSet<String>,
}

impl MethodSelector {
    /// Build the filter from a configuration
    pub fn new(config: &ImplantConfig) -> Self {
        Self {
            namespaces: config.namespaces.iter().cloned().collect(),
            types: config.types.iter().cloned().collect(),
            methods: config.methods.iter().cloned().collect(),
        }
    }

    /// Whether methods of this type may be selected
    pub fn includes_type(&self, ty: &TypeDef) -> bool {
        included(&self.namespaces, &ty.namespace) && included(&self.types, &ty.name)
    }

    /// Whether this method is selected, given that its type is
    pub fn includes_method(&self, method: &MethodDef) -> bool {
        method.is_concrete() && included(&self.methods, &method.name)
    }

    /// Every selected method of `module`, in declaration order
    pub fn select(&self, module: &Module) -> Vec<MethodSlot> {
        module
            .types
            .iter()
            .enumerate()
            .filter(|(_, ty)| self.includes_type(ty))
            .flat_map(|(type_index, ty)| {
                ty.methods
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| self.includes_method(m))
                    .map(move |(method_index, _)| MethodSlot {
                        type_index,
                        method_index,
                    })
            })
            .collect()
    }
}

fn included(list: &HashSet<String>, name: &str) -> bool {
    list.is_empty() || list.contains(name)
}
