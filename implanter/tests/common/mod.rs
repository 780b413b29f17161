//! Fixtures shared by the integration suites
#![allow(dead_code)]

use cil_body::{
    BodyBuilder, FieldRef, MethodBody, MethodDef, MethodRef, OpCode, RegionKind, StateMachineBinding,
    TracerHooks, TypeDef, TypeRef, ASYNC_STATE_MACHINE_ATTRIBUTE,
};
use cil_tracer::{trace_method, Execution, Heap, Host, HostOutcome, Invocation, Value};

/// Install a test log writer; filtered by `RUST_LOG`
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn tracer_ref() -> TypeRef {
    TypeRef::new("Diagnostics", "Tracer")
}

pub fn hooks() -> TracerHooks {
    TracerHooks::on_type(tracer_ref())
}

/// Tracer type as the loader would hand it over
pub fn tracer_type() -> TypeDef {
    let mut ty = TypeDef::new("Diagnostics", "Tracer");
    for (name, params) in [
        ("Begin", vec![TypeRef::string()]),
        ("End", vec![]),
        ("AsyncBegin", vec![TypeRef::int32(), TypeRef::string()]),
        ("AsyncEnd", vec![TypeRef::int32(), TypeRef::string()]),
    ] {
        let mut hook = MethodDef::new(name, TypeRef::void(), MethodBody::new());
        hook.params = params;
        hook.is_static = true;
        ty.methods.push(hook);
    }
    ty
}

/// `App.Sink::Record(int32)`, a host call with a visible side effect
pub fn record() -> MethodRef {
    MethodRef::new_static(TypeRef::new("App", "Sink"), "Record", vec![TypeRef::int32()], TypeRef::void())
}

/// Host remembering every `Record(n)` and raising on `Record(13)`
#[derive(Debug, Default)]
pub struct Recorder {
    pub recorded: Vec<i32>,
}

impl Host for Recorder {
    fn call(&mut self, method: &MethodRef, args: Vec<Value>, _heap: &mut Heap) -> HostOutcome {
        if method.name == "Record" {
            if let Some(Value::Int(n)) = args.first() {
                if *n == 13 {
                    return HostOutcome::Raise(Value::Str("unlucky".into()));
                }
                self.recorded.push(*n);
            }
        }
        HostOutcome::Return(method.returns_value().then_some(Value::Int(0)))
    }
}

/// Run a body once with a fresh heap
pub fn run(body: &MethodBody, args: Vec<Value>, host: &mut impl Host) -> Execution {
    let mut heap = Heap::new();
    trace_method(body, &hooks(), Invocation::new(args), &mut heap, host).unwrap()
}

pub fn body_of(method: &MethodDef) -> &MethodBody {
    method.body.as_ref().unwrap()
}

// ---- async step function fixture ----

pub fn task() -> TypeRef {
    TypeRef::new("System.Threading.Tasks", "Task")
}

pub fn state_type(method: &str) -> TypeRef {
    TypeRef::new("", format!("<{method}>d__1"))
}

pub fn state_field(method: &str) -> FieldRef {
    FieldRef::new(state_type(method), "<>1__state", TypeRef::int32())
}

fn builder(name: &str, params: Vec<TypeRef>) -> MethodRef {
    MethodRef::new_static(TypeRef::new("App", "Builder"), name, params, TypeRef::void())
}

fn work(name: &str) -> MethodRef {
    MethodRef::new_static(TypeRef::new("App", "Work"), name, vec![], TypeRef::int32())
}

/// Step function in the shape the C# compiler emits:
///
/// state -1 parks on the awaited work; later steps poll `IsReady` and park
/// again until it reports ready, then publish `GetResult()` through
/// `SetResult`. A fault from the work is caught and published through
/// `SetException`.
pub fn step_body(method: &str) -> MethodBody {
    let state = state_field(method);
    let mut b = BodyBuilder::new();
    let current = b.local(TypeRef::int32()).unwrap();
    let result = b.local(TypeRef::int32()).unwrap();
    let fault = b.local(TypeRef::object()).unwrap();
    let (try_start, park, resume, handler, publish, end) =
        (b.label(), b.label(), b.label(), b.label(), b.label(), b.label());

    b.emit_all([OpCode::Ldarg(0), OpCode::Ldfld(state.clone()), OpCode::Stloc(current)]);
    b.bind(try_start);
    b.emit_all([OpCode::Ldloc(current), OpCode::BrfalseS(resume.id())]);
    b.bind(park);
    b.emit_all([
        OpCode::Ldarg(0),
        OpCode::LdcI4(0),
        OpCode::Stfld(state.clone()),
        OpCode::Ldarg(0),
        OpCode::Call(builder("AwaitOnCompleted", vec![TypeRef::object()])),
        OpCode::LeaveS(end.id()),
    ]);
    b.bind(resume);
    b.emit_all([OpCode::Call(work("IsReady")), OpCode::BrfalseS(park.id())]);
    b.emit_all([
        OpCode::Ldarg(0),
        OpCode::LdcI4(-1),
        OpCode::Stfld(state.clone()),
        OpCode::Call(work("GetResult")),
        OpCode::Stloc(result),
        OpCode::LeaveS(publish.id()),
    ]);
    b.bind(handler);
    b.emit_all([
        OpCode::Stloc(fault),
        OpCode::Ldarg(0),
        OpCode::LdcI4(-2),
        OpCode::Stfld(state.clone()),
        OpCode::Ldloc(fault),
        OpCode::Call(builder("SetException", vec![TypeRef::object()])),
        OpCode::LeaveS(end.id()),
    ]);
    b.bind(publish);
    b.emit_all([
        OpCode::Ldarg(0),
        OpCode::LdcI4(-2),
        OpCode::Stfld(state),
        OpCode::Ldloc(result),
        OpCode::Call(builder("SetResult", vec![TypeRef::int32()])),
    ]);
    b.bind(end);
    b.emit(OpCode::Ret);
    b.region(RegionKind::Catch(TypeRef::exception()), try_start, handler, handler, publish);
    b.build().unwrap()
}

/// Step function that only parks when the awaited work is not yet ready
///
/// On the first step (state -1) it polls `IsReady` once; if the work is ready
/// the whole operation completes in that single step. After a park the next
/// step resumes straight into `GetResult`.
pub fn eager_step_body(method: &str) -> MethodBody {
    let state = state_field(method);
    let mut b = BodyBuilder::new();
    let current = b.local(TypeRef::int32()).unwrap();
    let result = b.local(TypeRef::int32()).unwrap();
    let fault = b.local(TypeRef::object()).unwrap();
    let (try_start, resume, ready, handler, publish, end) =
        (b.label(), b.label(), b.label(), b.label(), b.label(), b.label());

    b.emit_all([OpCode::Ldarg(0), OpCode::Ldfld(state.clone()), OpCode::Stloc(current)]);
    b.bind(try_start);
    b.emit_all([OpCode::Ldloc(current), OpCode::BrfalseS(resume.id())]);
    b.emit_all([OpCode::Call(work("IsReady")), OpCode::BrtrueS(ready.id())]);
    b.emit_all([
        OpCode::Ldarg(0),
        OpCode::LdcI4(0),
        OpCode::Stfld(state.clone()),
        OpCode::Ldarg(0),
        OpCode::Call(builder("AwaitOnCompleted", vec![TypeRef::object()])),
        OpCode::LeaveS(end.id()),
    ]);
    b.bind(resume);
    b.emit_all([OpCode::Ldarg(0), OpCode::LdcI4(-1), OpCode::Stfld(state.clone())]);
    b.bind(ready);
    b.emit_all([
        OpCode::Call(work("GetResult")),
        OpCode::Stloc(result),
        OpCode::LeaveS(publish.id()),
    ]);
    b.bind(handler);
    b.emit_all([
        OpCode::Stloc(fault),
        OpCode::Ldarg(0),
        OpCode::LdcI4(-2),
        OpCode::Stfld(state.clone()),
        OpCode::Ldloc(fault),
        OpCode::Call(builder("SetException", vec![TypeRef::object()])),
        OpCode::LeaveS(end.id()),
    ]);
    b.bind(publish);
    b.emit_all([
        OpCode::Ldarg(0),
        OpCode::LdcI4(-2),
        OpCode::Stfld(state),
        OpCode::Ldloc(result),
        OpCode::Call(builder("SetResult", vec![TypeRef::int32()])),
    ]);
    b.bind(end);
    b.emit(OpCode::Ret);
    b.region(RegionKind::Catch(TypeRef::exception()), try_start, handler, handler, publish);
    b.build().unwrap()
}

/// Step function that never touches a state field
///
/// Every step polls `IsReady` and parks until the work is ready.
pub fn stateless_step_body() -> MethodBody {
    let mut b = BodyBuilder::new();
    let result = b.local(TypeRef::int32()).unwrap();
    let fault = b.local(TypeRef::object()).unwrap();
    let (try_start, ready, handler, publish, end) = (b.label(), b.label(), b.label(), b.label(), b.label());

    b.bind(try_start);
    b.emit_all([OpCode::Call(work("IsReady")), OpCode::BrtrueS(ready.id())]);
    b.emit_all([
        OpCode::Ldnull,
        OpCode::Call(builder("AwaitOnCompleted", vec![TypeRef::object()])),
        OpCode::LeaveS(end.id()),
    ]);
    b.bind(ready);
    b.emit_all([
        OpCode::Call(work("GetResult")),
        OpCode::Stloc(result),
        OpCode::LeaveS(publish.id()),
    ]);
    b.bind(handler);
    b.emit_all([
        OpCode::Stloc(fault),
        OpCode::Ldloc(fault),
        OpCode::Call(builder("SetException", vec![TypeRef::object()])),
        OpCode::LeaveS(end.id()),
    ]);
    b.bind(publish);
    b.emit_all([OpCode::Ldloc(result), OpCode::Call(builder("SetResult", vec![TypeRef::int32()]))]);
    b.bind(end);
    b.emit(OpCode::Ret);
    b.region(RegionKind::Catch(TypeRef::exception()), try_start, handler, handler, publish);
    b.build().unwrap()
}

/// Async kickoff method bound to its state type
pub fn async_method(name: &str) -> MethodDef {
    async_method_with(name, step_body(name))
}

/// Async kickoff method whose state type steps through `step`
pub fn async_method_with(name: &str, step: MethodBody) -> MethodDef {
    let mut kickoff = MethodBody::new();
    kickoff.push(OpCode::Ldnull);
    kickoff.push(OpCode::Ret);

    let mut method = MethodDef::new(name, task(), kickoff);
    method.attributes.push(ASYNC_STATE_MACHINE_ATTRIBUTE.to_string());

    let mut set_state_machine = MethodBody::new();
    set_state_machine.push(OpCode::Ret);
    method.state_machine = Some(StateMachineBinding {
        state_type: state_type(name),
        methods: vec![
            MethodDef::new("MoveNext", TypeRef::void(), step),
            MethodDef::new("SetStateMachine", TypeRef::void(), set_state_machine),
        ],
    });
    method
}

/// The step body of an async method
pub fn step_of(method: &MethodDef) -> &MethodBody {
    let binding = method.state_machine.as_ref().unwrap();
    binding.methods[0].body.as_ref().unwrap()
}

/// Host standing in for the awaited work and the result builder
#[derive(Debug)]
pub struct AsyncWorld {
    /// Polls answered "not ready" before the work completes
    pub pending_polls: u32,
    /// What `GetResult` does once the work is ready
    pub completion: HostOutcome,
    /// `SetResult` / `SetException` calls, rendered
    pub published: Vec<String>,
}

impl AsyncWorld {
    pub fn succeeding(value: i32, pending_polls: u32) -> Self {
        Self {
            pending_polls,
            completion: HostOutcome::Return(Some(Value::Int(value))),
            published: Vec::new(),
        }
    }

    pub fn failing(fault: &str, pending_polls: u32) -> Self {
        Self {
            pending_polls,
            completion: HostOutcome::Raise(Value::Str(fault.into())),
            published: Vec::new(),
        }
    }
}

impl Host for AsyncWorld {
    fn call(&mut self, method: &MethodRef, args: Vec<Value>, _heap: &mut Heap) -> HostOutcome {
        match method.name.as_str() {
            "IsReady" => {
                let ready = self.pending_polls == 0;
                self.pending_polls = self.pending_polls.saturating_sub(1);
                HostOutcome::Return(Some(Value::Int(i32::from(ready))))
            }
            "GetResult" => self.completion.clone(),
            "SetResult" | "SetException" => {
                let rendered: Vec<String> = args.iter().map(Value::to_string).collect();
                self.published.push(format!("{}({})", method.name, rendered.join(",")));
                HostOutcome::Return(None)
            }
            _ => HostOutcome::Return(None),
        }
    }
}

/// Drive a step body until the operation publishes its outcome
///
/// Returns one execution per step invocation.
pub fn drive(step: &MethodBody, world: &mut AsyncWorld, max_steps: usize) -> Vec<Execution> {
    let hooks = hooks();
    let mut heap = Heap::new();
    let this = heap.alloc();
    if let Value::Object(object) = this {
        heap.set_field(object, "<>1__state", Value::Int(-1));
    }

    let mut steps = Vec::new();
    while world.published.is_empty() && steps.len() < max_steps {
        let execution =
            trace_method(step, &hooks, Invocation::new(vec![this.clone()]), &mut heap, world).unwrap();
        steps.push(execution);
    }
    steps
}
