//! Method and type metadata as supplied by the module loader
//!
//! Also holds the structural marker predicates used to classify methods
//! (constructor, async, generator). They are pure checks over metadata.

use crate::body::MethodBody;
use crate::instruction::OpCode;
use crate::types::TypeRef;
use serde::{Deserialize, Serialize};

/// Name of the attribute the compiler places on async methods
pub const ASYNC_STATE_MACHINE_ATTRIBUTE: &str = "AsyncStateMachineAttribute";

/// Loaded module: the unit handed to and returned from the coordinator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub types: Vec<TypeDef>,
}

/// Type definition with its methods
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub namespace: String,
    pub name: String,
    pub base_type: Option<TypeRef>,
    /// Names of nested types (compiler-generated state objects live here)
    pub nested_types: Vec<String>,
    pub methods: Vec<MethodDef>,
}

/// Read-only view of a type's own metadata, detached from its methods
#[derive(Debug, Clone, Copy)]
pub struct DeclaringType<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    pub base_type: Option<&'a TypeRef>,
    pub nested_types: &'a [String],
}

impl TypeDef {
    /// Create a type with no base, nested types or methods
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Reference to this type
    pub fn type_ref(&self) -> TypeRef {
        TypeRef::new(self.namespace.clone(), self.name.clone())
    }

    /// Split into type metadata and mutable access to the methods
    pub fn split(&mut self) -> (DeclaringType<'_>, &mut Vec<MethodDef>) {
        let TypeDef {
            namespace,
            name,
            base_type,
            nested_types,
            methods,
        } = self;
        let declaring = DeclaringType {
            namespace: namespace.as_str(),
            name: name.as_str(),
            base_type: base_type.as_ref(),
            nested_types: nested_types.as_slice(),
        };
        (declaring, methods)
    }

    /// Metadata view without touching the methods
    pub fn declaring(&self) -> DeclaringType<'_> {
        DeclaringType {
            namespace: &self.namespace,
            name: &self.name,
            base_type: self.base_type.as_ref(),
            nested_types: &self.nested_types,
        }
    }
}

impl DeclaringType<'_> {
    /// Reference to the type
    pub fn type_ref(&self) -> TypeRef {
        TypeRef::new(self.namespace, self.name)
    }
}

/// Association between an async method and its compiler-generated state type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMachineBinding {
    /// The state type
    pub state_type: TypeRef,
    /// Methods of the state type; exactly one is expected to be the step method
    pub methods: Vec<MethodDef>,
}

impl StateMachineBinding {
    /// Indices of the state type's methods with the given name
    pub fn candidates(&self, step_method: &str) -> Vec<usize> {
        self.methods
            .iter()
            .enumerate()
            .filter(|(_, m)| m.name == step_method && m.body.is_some())
            .map(|(i, _)| i)
            .collect()
    }
}

/// Method definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    pub params: Vec<TypeRef>,
    pub return_type: TypeRef,
    pub is_static: bool,
    pub is_abstract: bool,
    /// Type names of the custom attributes applied to the method
    pub attributes: Vec<String>,
    pub body: Option<MethodBody>,
    /// State machine of an async method, resolved by the loader
    pub state_machine: Option<StateMachineBinding>,
}

impl MethodDef {
    /// Create a concrete instance method with the given body
    pub fn new(name: impl Into<String>, return_type: TypeRef, body: MethodBody) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            return_type,
            is_static: false,
            is_abstract: false,
            attributes: Vec::new(),
            body: Some(body),
            state_machine: None,
        }
    }

    /// Fully qualified name, e.g. `System.Int32 App.Calc::Add(System.Int32,System.Int32)`
    pub fn full_name(&self, declaring: &DeclaringType<'_>) -> String {
        let params: Vec<String> = self.params.iter().map(TypeRef::full_name).collect();
        format!(
            "{} {}::{}({})",
            self.return_type,
            declaring.type_ref(),
            self.name,
            params.join(",")
        )
    }

    /// Whether the method returns `System.Void`
    pub fn returns_void(&self) -> bool {
        self.return_type.is_void()
    }

    /// Instance (non-static) constructor
    pub fn is_instance_constructor(&self) -> bool {
        self.name == ".ctor" && !self.is_static
    }

    /// Carries the named async state machine attribute
    pub fn is_async(&self, attribute: &str) -> bool {
        self.attributes.iter().any(|a| a == attribute)
    }

    /// Iterator method lowered into a generated state type
    ///
    /// Recognized by an `IEnumerable...` return type together with a nested
    /// type named after the method (`<Name>d__N`).
    pub fn is_generator(&self, declaring: &DeclaringType<'_>) -> bool {
        if !self.return_type.name.starts_with("IEnumerable") {
            return false;
        }
        let prefix = format!("<{}>", self.name);
        declaring.nested_types.iter().any(|n| n.starts_with(&prefix))
    }

    /// Constructor whose body is only the base chaining call (`ldarg.0; call; ret`)
    pub fn is_empty_constructor(&self) -> bool {
        self.name == ".ctor"
            && self.body.as_ref().is_some_and(|body| {
                body.instructions()
                    .iter()
                    .filter(|i| i.op != OpCode::Nop)
                    .count()
                    == 3
            })
    }

    /// Has a body worth instrumenting
    pub fn is_concrete(&self) -> bool {
        !self.is_abstract && self.body.is_some() && !self.is_empty_constructor()
    }
}
