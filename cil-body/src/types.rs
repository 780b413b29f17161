//! Metadata references carried by instruction operands
//!
//! These are already-resolved references supplied by the module loader.
//! The transformation engine only compares and clones them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a type by namespace and name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeRef {
    /// Namespace, empty for the global namespace and for nested types
    pub namespace: String,
    /// Simple type name (nested types keep their compiler-generated name)
    pub name: String,
}

impl TypeRef {
    /// Create a new type reference
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// `System.Void`
    pub fn void() -> Self {
        Self::new("System", "Void")
    }

    /// `System.Int32`
    pub fn int32() -> Self {
        Self::new("System", "Int32")
    }

    /// `System.String`
    pub fn string() -> Self {
        Self::new("System", "String")
    }

    /// `System.Object`
    pub fn object() -> Self {
        Self::new("System", "Object")
    }

    /// `System.Exception`
    pub fn exception() -> Self {
        Self::new("System", "Exception")
    }

    /// Namespace-qualified name, e.g. `System.Int32`
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    /// Whether this is `System.Void`
    pub fn is_void(&self) -> bool {
        self.namespace == "System" && self.name == "Void"
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

/// Reference to a callable routine (call / callvirt / newobj operand)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    /// Type declaring the routine
    pub declaring_type: TypeRef,
    /// Routine name (`.ctor` for constructors)
    pub name: String,
    /// Parameter types, not counting the implicit `this`
    pub params: Vec<TypeRef>,
    /// Declared return type
    pub return_type: TypeRef,
    /// Whether the routine takes an implicit `this` argument
    pub has_this: bool,
}

impl MethodRef {
    /// Reference to a static routine
    pub fn new_static(
        declaring_type: TypeRef,
        name: impl Into<String>,
        params: Vec<TypeRef>,
        return_type: TypeRef,
    ) -> Self {
        Self {
            declaring_type,
            name: name.into(),
            params,
            return_type,
            has_this: false,
        }
    }

    /// Reference to an instance routine
    pub fn new_instance(
        declaring_type: TypeRef,
        name: impl Into<String>,
        params: Vec<TypeRef>,
        return_type: TypeRef,
    ) -> Self {
        Self {
            has_this: true,
            ..Self::new_static(declaring_type, name, params, return_type)
        }
    }

    /// Reference to an instance constructor of `declaring_type`
    pub fn constructor(declaring_type: TypeRef, params: Vec<TypeRef>) -> Self {
        Self::new_instance(declaring_type, ".ctor", params, TypeRef::void())
    }

    /// Whether this names an instance constructor
    pub fn is_constructor(&self) -> bool {
        self.name == ".ctor"
    }

    /// Number of stack slots consumed by a call, including `this`
    pub fn stack_args(&self) -> usize {
        self.params.len() + usize::from(self.has_this)
    }

    /// Whether a call pushes a result
    pub fn returns_value(&self) -> bool {
        !self.return_type.is_void()
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(TypeRef::full_name).collect();
        write!(
            f,
            "{} {}::{}({})",
            self.return_type,
            self.declaring_type,
            self.name,
            params.join(",")
        )
    }
}

/// Reference to a field (ldfld / stfld operand)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    /// Type declaring the field
    pub declaring_type: TypeRef,
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: TypeRef,
}

impl FieldRef {
    /// Create a new field reference
    pub fn new(declaring_type: TypeRef, name: impl Into<String>, field_type: TypeRef) -> Self {
        Self {
            declaring_type,
            name: name.into(),
            field_type,
        }
    }
}

/// Index of a local variable slot within a method body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(pub u16);

/// Local variable slot declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Local {
    /// Declared type of the slot
    pub ty: TypeRef,
}
