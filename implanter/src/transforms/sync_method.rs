//! Synchronous method transform
//!
//! Wraps an ordinary body so that `End()` runs exactly once per invocation:
//!
//! ```text
//!         <base constructor chaining, constructors only>
//!         ldstr <name>
//!         call Begin
//! try {
//!   entry: <original body, every ret turned into a leave to the funnel>
//! } finally {
//!   marker: nop
//!         call End
//!         endfinally
//! }
//! funnel: ret                 (void)
//! funnel: ldloc <result>; ret (non-void)
//! ```

use super::{ensure_uninstrumented, finish, Instrumented, MethodContext, MethodTransform};
use crate::error::TransformError;
use cil_body::{
    ExceptionRegion, InstrId, MethodBody, MethodDef, OpCode, RegionKind, TracerHooks, TypeRef,
};

/// Begin/End wrapper for ordinary methods and instance constructors
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncMethodTransform;

impl MethodTransform for SyncMethodTransform {
    fn transform(&self, method: &mut MethodDef, cx: &MethodContext<'_>) -> Result<Instrumented, TransformError> {
        let chained_base = if method.is_instance_constructor() {
            Some(
                cx.declaring
                    .base_type
                    .ok_or(TransformError::MissingBaseConstructorCall)?,
            )
        } else {
            None
        };

        let original = method.body.as_mut().ok_or(TransformError::MissingBody)?;
        let mut body = original.clone();
        wrap_body(&mut body, chained_base, &method.return_type, cx.full_name, cx.hooks)?;
        *original = body;

        Ok(Instrumented::Sync)
    }
}

/// Single exit every normalized return now leads to
struct Funnel {
    /// First instruction of the funnel
    id: InstrId,
    /// Number of instructions from the funnel to the end of the body
    len: usize,
    /// How many returns were redirected
    returns: usize,
}

/// Wrap `body` with `Begin(name)` and a finally region calling `End()`
///
/// # Arguments
/// * `body` - Body to rewrite in place
/// * `chained_base` - For instance constructors, the base type whose
///   constructor call must complete before `Begin`
/// * `return_type` - Declared return type of the method
/// * `name` - Name passed to `Begin`
/// * `hooks` - Tracer entry points
pub fn wrap_body(
    body: &mut MethodBody,
    chained_base: Option<&TypeRef>,
    return_type: &TypeRef,
    name: &str,
    hooks: &TracerHooks,
) -> Result<(), TransformError> {
    if body.is_empty() {
        return Err(TransformError::EmptyBody);
    }
    ensure_uninstrumented(body, hooks)?;

    let chain_call = match chained_base {
        Some(base) => Some(find_base_constructor_call(body, base)?),
        None => None,
    };

    body.simplify_branches();
    let funnel = normalize_returns(body, return_type)?;

    let entry = match chain_call {
        Some(call) => body
            .position(call)
            .map(|at| at + 1)
            .filter(|&at| at < body.len())
            .ok_or(TransformError::MissingBaseConstructorCall)?,
        None => 0,
    };
    let entry_id = body.instructions()[entry].id();
    body.insert_ops(entry, vec![OpCode::Ldstr(name.to_string()), OpCode::Call(hooks.begin.clone())]);

    let handler = body.insert_ops(
        body.len() - funnel.len,
        vec![OpCode::Nop, OpCode::Call(hooks.end.clone()), OpCode::Endfinally],
    );
    let marker = handler[0];

    // Outermost region, so it goes last
    body.regions.push(ExceptionRegion {
        kind: RegionKind::Finally,
        try_start: entry_id,
        try_end: marker,
        handler_start: marker,
        handler_end: funnel.id,
    });

    finish(body)?;

    tracing::debug!(
        "Wrapped {}: {} returns funneled into {}, try starts at {}",
        name,
        funnel.returns,
        funnel.id,
        entry_id
    );
    Ok(())
}

/// The call chaining to a constructor of `base`
fn find_base_constructor_call(body: &MethodBody, base: &TypeRef) -> Result<InstrId, TransformError> {
    body.instructions()
        .iter()
        .find(|i| matches!(&i.op, OpCode::Call(m) if m.is_constructor() && m.declaring_type == *base))
        .map(|i| i.id())
        .ok_or(TransformError::MissingBaseConstructorCall)
}

/// Redirect every `ret` into one funnel appended at the end
///
/// Void bodies funnel into a single `ret`. Other bodies store the result in
/// a new local typed as the return type and funnel into `ldloc; ret`.
fn normalize_returns(body: &mut MethodBody, return_type: &TypeRef) -> Result<Funnel, TransformError> {
    let returns: Vec<InstrId> = body
        .instructions()
        .iter()
        .filter(|i| i.op == OpCode::Ret)
        .map(|i| i.id())
        .collect();

    if return_type.is_void() {
        let exit = body.create(OpCode::Ret);
        let exit_id = exit.id();
        for &ret in &returns {
            if let Some(instruction) = body.instruction_mut(ret) {
                instruction.op = OpCode::Leave(exit_id);
            }
        }
        body.push_instruction(exit);
        return Ok(Funnel {
            id: exit_id,
            len: 1,
            returns: returns.len(),
        });
    }

    let result = body
        .add_local(return_type.clone())
        .map_err(TransformError::InvalidOutput)?;
    let load = body.create(OpCode::Ldloc(result));
    let load_id = load.id();
    for &ret in &returns {
        if let Some(instruction) = body.instruction_mut(ret) {
            instruction.op = OpCode::Stloc(result);
        }
        if let Some(at) = body.position(ret) {
            body.insert_ops(at + 1, vec![OpCode::Leave(load_id)]);
        }
    }
    body.push_instruction(load);
    body.push(OpCode::Ret);
    Ok(Funnel {
        id: load_id,
        len: 2,
        returns: returns.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cil_body::{BodyBuilder, BodyError, MethodRef, TypeDef};

    fn hooks() -> TracerHooks {
        TracerHooks::on_type(TypeRef::new("Diagnostics", "Tracer"))
    }

    fn ops(body: &MethodBody) -> Vec<OpCode> {
        body.instructions().iter().map(|i| i.op.clone()).collect()
    }

    #[test]
    fn test_void_body_layout() {
        let hooks = hooks();
        let mut body = MethodBody::new();
        let first = body.push(OpCode::Nop);
        body.push(OpCode::Ret);

        wrap_body(&mut body, None, &TypeRef::void(), "M", &hooks).unwrap();

        let exit = body.get(body.len() - 1).unwrap().id();
        assert_eq!(
            ops(&body),
            vec![
                OpCode::Ldstr("M".into()),
                OpCode::Call(hooks.begin.clone()),
                OpCode::Nop,
                OpCode::LeaveS(exit),
                OpCode::Nop,
                OpCode::Call(hooks.end.clone()),
                OpCode::Endfinally,
                OpCode::Ret,
            ]
        );
        let region = &body.regions[0];
        assert_eq!(region.kind, RegionKind::Finally);
        assert_eq!(region.try_start, first, "Begin stays outside the protected range");
        assert_eq!(region.try_end, region.handler_start);
        assert_eq!(region.handler_end, exit);
        assert!(body.init_locals);
    }

    #[test]
    fn test_value_body_funnels_through_local() {
        let hooks = hooks();
        let mut b = BodyBuilder::new();
        let other = b.label();
        b.emit(OpCode::Ldarg(0));
        b.emit(OpCode::Brfalse(other.id()));
        b.emit(OpCode::LdcI4(1));
        b.emit(OpCode::Ret);
        b.bind(other);
        b.emit(OpCode::LdcI4(2));
        b.emit(OpCode::Ret);
        let mut body = b.build().unwrap();

        wrap_body(&mut body, None, &TypeRef::int32(), "Pick", &hooks).unwrap();

        assert_eq!(body.locals.len(), 1);
        assert_eq!(body.locals[0].ty, TypeRef::int32());
        let stores = ops(&body).iter().filter(|op| matches!(op, OpCode::Stloc(_))).count();
        let rets = ops(&body).iter().filter(|op| **op == OpCode::Ret).count();
        assert_eq!(stores, 2, "each return stores into the result local");
        assert_eq!(rets, 1, "a single ret remains");

        let tail: Vec<OpCode> = ops(&body).into_iter().rev().take(2).collect();
        assert_eq!(tail, vec![OpCode::Ret, OpCode::Ldloc(cil_body::LocalId(0))]);
    }

    #[test]
    fn test_constructor_entry_follows_base_call() {
        let hooks = hooks();
        let base_ctor = MethodRef::constructor(TypeRef::new("App", "Base"), vec![]);
        let mut body = MethodBody::new();
        body.push(OpCode::Ldarg(0));
        body.push(OpCode::Call(base_ctor.clone()));
        let work = body.push(OpCode::Nop);
        body.push(OpCode::Ret);

        wrap_body(&mut body, Some(&TypeRef::new("App", "Base")), &TypeRef::void(), "Ctor", &hooks).unwrap();

        assert_eq!(body.get(1).unwrap().op, OpCode::Call(base_ctor));
        assert_eq!(body.get(2).unwrap().op, OpCode::Ldstr("Ctor".into()));
        assert_eq!(body.get(3).unwrap().op, OpCode::Call(hooks.begin.clone()));
        assert_eq!(body.regions[0].try_start, work);
    }

    #[test]
    fn test_constructor_without_base_call_fails_untouched() {
        let mut ty = TypeDef::new("App", "Widget");
        ty.base_type = Some(TypeRef::new("App", "Base"));
        let mut body = MethodBody::new();
        body.push(OpCode::Ldarg(0));
        body.push(OpCode::Pop);
        body.push(OpCode::Nop);
        body.push(OpCode::Ret);
        let mut ctor = MethodDef::new(".ctor", TypeRef::void(), body.clone());

        let hooks = hooks();
        let cx = MethodContext {
            full_name: "System.Void App.Widget::.ctor()",
            declaring: ty.declaring(),
            hooks: &hooks,
        };
        assert_eq!(
            SyncMethodTransform.transform(&mut ctor, &cx),
            Err(TransformError::MissingBaseConstructorCall)
        );
        assert_eq!(ctor.body, Some(body), "failed transform leaves the body unchanged");
    }

    #[test]
    fn test_nested_regions_stay_inner() {
        let hooks = hooks();
        let mut b = BodyBuilder::new();
        let (try_start, handler, after) = (b.label(), b.label(), b.label());
        b.bind(try_start);
        b.emit(OpCode::Leave(after.id()));
        b.bind(handler);
        b.emit(OpCode::Endfinally);
        b.bind(after);
        b.emit(OpCode::Ret);
        b.region(RegionKind::Finally, try_start, handler, handler, after);
        let mut body = b.build().unwrap();

        wrap_body(&mut body, None, &TypeRef::void(), "M", &hooks).unwrap();

        assert_eq!(body.regions.len(), 2);
        assert_eq!(body.regions[0].try_start, try_start.id(), "existing region keeps its place");
        assert_eq!(body.regions[1].try_start, try_start.id());
        body.validate().unwrap();
    }

    #[test]
    fn test_result_local_beyond_slot_limit_fails_untouched() {
        let ty = TypeDef::new("App", "Wide");
        let mut body = MethodBody::new();
        body.locals = vec![cil_body::Local { ty: TypeRef::int32() }; usize::from(u16::MAX) + 1];
        body.push(OpCode::LdcI4(7));
        body.push(OpCode::Ret);
        let mut method = MethodDef::new("Seven", TypeRef::int32(), body.clone());

        let hooks = hooks();
        let cx = MethodContext {
            full_name: "System.Int32 App.Wide::Seven()",
            declaring: ty.declaring(),
            hooks: &hooks,
        };
        assert_eq!(
            SyncMethodTransform.transform(&mut method, &cx),
            Err(TransformError::InvalidOutput(BodyError::TooManyLocals(usize::from(u16::MAX) + 1)))
        );
        assert_eq!(method.body, Some(body));
    }

    #[test]
    fn test_empty_body_is_rejected() {
        let mut body = MethodBody::new();
        assert_eq!(
            wrap_body(&mut body, None, &TypeRef::void(), "M", &hooks()),
            Err(TransformError::EmptyBody)
        );
    }
}
