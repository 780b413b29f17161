//! Tracer entry point resolution
//!
//! Looks up the four tracer routines on the tracer type by name and
//! signature. Any one missing is a precondition failure: nothing is
//! instrumented.

use crate::error::PreconditionError;
use cil_body::{MethodDef, MethodRef, TracerHooks, TypeDef, TypeRef};

/// Resolve `Begin(string)`, `End()`, `AsyncBegin(int32,string)` and
/// `AsyncEnd(int32,string)` on `tracer`
pub fn resolve_hooks(tracer: &TypeDef) -> Result<TracerHooks, PreconditionError> {
    let correlated = [TypeRef::int32(), TypeRef::string()];

    let hooks = TracerHooks {
        begin: find_hook(tracer, "Begin", &[TypeRef::string()], "Begin(System.String)")?,
        end: find_hook(tracer, "End", &[], "End()")?,
        async_begin: find_hook(tracer, "AsyncBegin", &correlated, "AsyncBegin(System.Int32,System.String)")?,
        async_end: find_hook(tracer, "AsyncEnd", &correlated, "AsyncEnd(System.Int32,System.String)")?,
    };

    tracing::info!("Resolved tracer hooks on {}", tracer.type_ref());
    Ok(hooks)
}

fn find_hook(
    tracer: &TypeDef,
    name: &str,
    params: &[TypeRef],
    signature: &'static str,
) -> Result<MethodRef, PreconditionError> {
    tracer
        .methods
        .iter()
        .find(|m| is_hook(m, name, params))
        .map(|m| MethodRef::new_static(tracer.type_ref(), m.name.clone(), m.params.clone(), m.return_type.clone()))
        .ok_or_else(|| PreconditionError::MissingHook {
            tracer: tracer.type_ref().full_name(),
            hook: signature,
        })
}

/// Static, void, matching name and exact parameter types
fn is_hook(method: &MethodDef, name: &str, params: &[TypeRef]) -> bool {
    method.name == name && method.is_static && method.returns_void() && method.params == params
}

#[cfg(test)]
mod tests {
    use super::*;
    use cil_body::MethodBody;

    fn hook(name: &str, params: Vec<TypeRef>) -> MethodDef {
        let mut m = MethodDef::new(name, TypeRef::void(), MethodBody::new());
        m.params = params;
        m.is_static = true;
        m
    }

    fn tracer_type() -> TypeDef {
        let mut ty = TypeDef::new("Diagnostics", "Tracer");
        ty.methods = vec![
            hook("Begin", vec![TypeRef::string()]),
            hook("End", vec![]),
            hook("AsyncBegin", vec![TypeRef::int32(), TypeRef::string()]),
            hook("AsyncEnd", vec![TypeRef::int32(), TypeRef::string()]),
        ];
        ty
    }

    #[test]
    fn test_resolves_standard_signatures() {
        let hooks = resolve_hooks(&tracer_type()).unwrap();
        assert_eq!(hooks, TracerHooks::on_type(TypeRef::new("Diagnostics", "Tracer")));
    }

    #[test]
    fn test_overloads_are_told_apart() {
        let mut ty = tracer_type();
        // an unrelated overload listed first must not be picked
        ty.methods.insert(0, hook("Begin", vec![TypeRef::int32()]));

        let hooks = resolve_hooks(&ty).unwrap();
        assert_eq!(hooks.begin.params, vec![TypeRef::string()]);
    }

    #[test]
    fn test_missing_hook_is_a_precondition_error() {
        let mut ty = tracer_type();
        ty.methods.retain(|m| m.name != "AsyncEnd");

        assert_eq!(
            resolve_hooks(&ty),
            Err(PreconditionError::MissingHook {
                tracer: "Diagnostics.Tracer".into(),
                hook: "AsyncEnd(System.Int32,System.String)",
            })
        );
    }

    #[test]
    fn test_instance_hook_is_rejected() {
        let mut ty = tracer_type();
        ty.methods[1].is_static = false;
        assert!(matches!(resolve_hooks(&ty), Err(PreconditionError::MissingHook { hook: "End()", .. })));
    }
}
