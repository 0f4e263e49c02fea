//! Sandbox instantiation, host imports and calls into sandbox exports.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};
use wasmtime::{Engine, Func, FuncType, Linker, Module, Store, Val, ValType};

use super::args::{ArgStream, Trap};
use super::memory::{GuestExports, GuestMemory, LinearMemory, MemoryError};
use super::packed;
use super::signature::{Signature, SignatureError};
use super::SandboxContext;
use crate::callable::{Callable, ForeignFunctionId};
use crate::config::Limits;
use crate::directory::Directory;
use crate::error::CallError;
use crate::value::{ResourceId, Value, ValueList};

/// Import module the built-in bindings live under.
pub const SANDBOX_MODULE: &str = "scriptwire";

/// A host function body. Reads its arguments from the stream and writes
/// the result through [`ArgStream::ret`].
pub type Handler = Arc<dyn Fn(&mut ArgStream<'_>) -> Result<(), Trap> + Send + Sync>;

static NEXT_FUNCTION: AtomicU64 = AtomicU64::new(1);

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Compilation failed: {0}")]
    Compile(String),

    #[error("Function registration failed: {0}")]
    Link(String),

    #[error("Instantiation failed: {0}")]
    Instantiate(String),

    #[error("Invalid signature: {0}")]
    Signature(#[from] SignatureError),
}

fn zero(ty: &ValType) -> Val {
    match ty {
        ValType::I64 => Val::I64(0),
        ValType::F32 => Val::F32(0),
        ValType::F64 => Val::F64(0),
        _ => Val::I32(0),
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Collects the host functions a sandbox may import.
pub struct SandboxBuilder {
    engine: Engine,
    linker: Linker<SandboxContext>,
    limits: Limits,
}

impl SandboxBuilder {
    pub fn new(engine: &Engine) -> Self {
        Self {
            engine: engine.clone(),
            linker: Linker::new(engine),
            limits: Limits::default(),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Start registering functions under an import module name.
    ///
    /// ```ignore
    /// builder.interface("game")
    ///     .func("getHealth", "fe", |args| {
    ///         let player = args.read_handle();
    ///         args.ret(100.0f64, player.is_none().then_some("no player"))
    ///     })?;
    /// ```
    pub fn interface(&mut self, module: &str) -> InterfaceBuilder<'_> {
        InterfaceBuilder {
            builder: self,
            module: module.to_string(),
        }
    }
}

/// Registers functions within one import module.
pub struct InterfaceBuilder<'a> {
    builder: &'a mut SandboxBuilder,
    module: String,
}

impl InterfaceBuilder<'_> {
    /// Register `name` with an ABI signature string such as `"bes"`.
    pub fn func<F>(&mut self, name: &str, signature: &str, handler: F) -> Result<&mut Self, SandboxError>
    where
        F: Fn(&mut ArgStream<'_>) -> Result<(), Trap> + Send + Sync + 'static,
    {
        let signature = Signature::parse(signature)?;
        let ty = signature.func_type(&self.builder.engine);
        let ret = signature.ret;
        let function = name.to_string();
        let handler: Handler = Arc::new(handler);

        self.builder
            .linker
            .func_new(&self.module, name, ty, move |mut caller, params, results| {
                if let (Some(kind), Some(slot)) = (ret, results.first_mut()) {
                    *slot = zero(&kind.val_type());
                }
                let context = caller.data().clone();
                let exports = GuestExports::from_caller(&mut caller);
                let mut memory = GuestMemory::new(&mut caller, exports);
                let mut stream =
                    ArgStream::new(&function, params, results, ret, &mut memory, &context);
                handler(&mut stream)?;
                Ok(())
            })
            .map_err(|e| SandboxError::Link(e.to_string()))?;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.module
    }
}

// ============================================================================
// Sandbox
// ============================================================================

/// One resource's instantiated module.
pub struct Sandbox {
    store: RefCell<Store<SandboxContext>>,
    exported: HashMap<String, Func>,
    exports: GuestExports,
    functions: RefCell<HashMap<ForeignFunctionId, Func>>,
    by_name: RefCell<HashMap<String, ForeignFunctionId>>,
    resource: ResourceId,
}

impl Sandbox {
    pub fn instantiate(
        builder: &SandboxBuilder,
        wasm: &[u8],
        resource: ResourceId,
        directory: Weak<dyn Directory>,
    ) -> Result<Rc<Sandbox>, SandboxError> {
        let module = Module::new(&builder.engine, wasm)
            .map_err(|e| SandboxError::Compile(format!("{e:#}")))?;
        let context = SandboxContext {
            resource,
            directory,
            limits: builder.limits,
        };
        let mut store = Store::new(&builder.engine, context);
        let instance = builder
            .linker
            .instantiate(&mut store, &module)
            .map_err(|e| SandboxError::Instantiate(format!("{e:#}")))?;
        let exports = GuestExports::from_instance(&mut store, &instance);
        // resolved up front so exports can be named while the store is in use
        let exported: HashMap<String, Func> = instance
            .exports(&mut store)
            .filter_map(|export| {
                let name = export.name().to_string();
                export.into_func().map(|func| (name, func))
            })
            .collect();
        debug!(%resource, functions = exported.len(), "sandbox instantiated");

        Ok(Rc::new(Sandbox {
            store: RefCell::new(store),
            exported,
            exports,
            functions: RefCell::new(HashMap::new()),
            by_name: RefCell::new(HashMap::new()),
            resource,
        }))
    }

    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    /// A callable for an exported function. Asking twice for the same
    /// export yields the same callable.
    pub fn callable(&self, export: &str) -> Option<Callable> {
        if let Some(&function) = self.by_name.borrow().get(export) {
            return Some(Callable::ForeignFunction {
                resource: self.resource,
                function,
            });
        }
        let func = *self.exported.get(export)?;
        let function = ForeignFunctionId(NEXT_FUNCTION.fetch_add(1, Ordering::Relaxed));
        self.functions.borrow_mut().insert(function, func);
        self.by_name.borrow_mut().insert(export.to_string(), function);
        Some(Callable::ForeignFunction {
            resource: self.resource,
            function,
        })
    }

    /// Run `f` against the sandbox's linear memory and allocator.
    pub fn with_memory<R>(&self, f: impl FnOnce(&mut dyn LinearMemory) -> R) -> Result<R, CallError> {
        let mut store = self.store.try_borrow_mut().map_err(|_| CallError::Busy)?;
        let mut memory = GuestMemory::new(&mut *store, self.exports);
        Ok(f(&mut memory))
    }

    /// Call an export by name.
    pub fn call_export(&self, export: &str, args: &ValueList) -> Result<ValueList, CallError> {
        match self.callable(export) {
            Some(Callable::ForeignFunction { function, .. }) => self.call(function, args),
            _ => Err(CallError::Raised(format!("no export named '{export}'"))),
        }
    }

    /// Call a registered export.
    ///
    /// Arguments are converted to the export's parameter types. Strings,
    /// callable hashes and tables are copied into sandbox memory for the
    /// duration of the call and freed afterwards, even when it traps.
    pub fn call(&self, function: ForeignFunctionId, args: &ValueList) -> Result<ValueList, CallError> {
        let func = self
            .functions
            .borrow()
            .get(&function)
            .copied()
            .ok_or(CallError::StaleReference)?;
        let mut store = self.store.try_borrow_mut().map_err(|_| CallError::Busy)?;
        let ty = func.ty(&*store);

        let mut scratch = Vec::new();
        let result = self.invoke(&mut store, func, &ty, args, &mut scratch);

        let mut memory = GuestMemory::new(&mut *store, self.exports);
        for ptr in scratch {
            memory.free(ptr);
        }
        result
    }

    fn invoke(
        &self,
        store: &mut Store<SandboxContext>,
        func: Func,
        ty: &FuncType,
        args: &ValueList,
        scratch: &mut Vec<u32>,
    ) -> Result<ValueList, CallError> {
        let limits = store.data().limits;
        let params = {
            let mut memory = GuestMemory::new(&mut *store, self.exports);
            ty.params()
                .enumerate()
                .map(|(index, param)| match args.get(index) {
                    Some(value) => marshal(&mut memory, &limits, args, value, &param, scratch),
                    None => Ok(zero(&param)),
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        let mut results: Vec<Val> = ty.results().map(|result| zero(&result)).collect();

        func.call(&mut *store, &params, &mut results).map_err(|e| {
            let message = match e.downcast_ref::<Trap>() {
                Some(trap) => trap.to_string(),
                None => e.root_cause().to_string(),
            };
            debug!(resource = %self.resource, %message, "sandbox call trapped");
            CallError::Raised(message)
        })?;

        Ok(results
            .iter()
            .map(|val| match val {
                Val::I32(v) => Value::Number(*v as f64),
                Val::I64(v) => Value::Number(*v as f64),
                Val::F32(bits) => Value::Number(f32::from_bits(*bits) as f64),
                Val::F64(bits) => Value::Number(f64::from_bits(*bits)),
                _ => Value::Nil,
            })
            .collect())
    }
}

fn alloc_failed(e: MemoryError) -> CallError {
    CallError::Raised(e.to_string())
}

fn mismatch(value: &Value, ty: &ValType) -> CallError {
    CallError::Raised(format!("cannot pass {} as {ty}", value.kind()))
}

/// Convert one argument to a wasm parameter, recording any allocation.
fn marshal(
    memory: &mut dyn LinearMemory,
    limits: &Limits,
    list: &ValueList,
    value: &Value,
    ty: &ValType,
    scratch: &mut Vec<u32>,
) -> Result<Val, CallError> {
    let val = match (ty, value) {
        (_, Value::Nil) => zero(ty),
        (ValType::I32, Value::Boolean(b)) => Val::I32(*b as i32),
        (ValType::I32, Value::Number(n)) => Val::I32(*n as i32),
        (ValType::I32, Value::String(s)) => {
            let ptr = memory.alloc_cstr(s).map_err(alloc_failed)?;
            scratch.push(ptr);
            Val::I32(ptr as i32)
        }
        (ValType::I32, Value::Callable(callable)) => {
            let ptr = memory
                .alloc_bytes(callable.write_hash().as_bytes())
                .map_err(alloc_failed)?;
            scratch.push(ptr);
            Val::I32(ptr as i32)
        }
        (ValType::I32, Value::Table(table)) => {
            let (data, count, report) = packed::pack_table(list, table.id, limits);
            if !report.is_clean() {
                warn!(failures = report.failures.len(), "table argument packed lossily");
            }
            let (descriptor, allocations) =
                packed::write_blob(memory, &data, count).map_err(alloc_failed)?;
            scratch.extend(allocations);
            Val::I32(descriptor as i32)
        }
        (ValType::I64, Value::Boolean(b)) => Val::I64(*b as i64),
        (ValType::I64, Value::Number(n)) => Val::I64(*n as i64),
        (ValType::I64, Value::Handle(handle)) => Val::I64(handle.to_bits() as i64),
        (ValType::F32, Value::Number(n)) => Val::F32((*n as f32).to_bits()),
        (ValType::F64, Value::Number(n)) => Val::F64(n.to_bits()),
        (ValType::F32 | ValType::F64, Value::Boolean(b)) => {
            let n = if *b { 1.0 } else { 0.0 };
            if matches!(ty, ValType::F32) {
                Val::F32((n as f32).to_bits())
            } else {
                Val::F64(f64::to_bits(n))
            }
        }
        (_, other) => return Err(mismatch(other, ty)),
    };
    Ok(val)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Registry;

    const ECHO: &str = r#"
        (module
            (import "game" "double" (func $double (param i32) (result i32)))
            (func (export "run") (param i32) (result i32)
                local.get 0
                call $double))
    "#;

    fn instantiate(builder: &SandboxBuilder, wat: &str) -> (Rc<Registry>, Rc<Sandbox>) {
        let registry = Rc::new(Registry::new());
        let resource = registry.add_resource("test");
        let directory: Rc<dyn Directory> = registry.clone();
        let wasm = wat::parse_str(wat).expect("Failed to parse WAT");
        let sandbox = Sandbox::instantiate(builder, &wasm, resource, Rc::downgrade(&directory))
            .expect("Failed to instantiate");
        (registry, sandbox)
    }

    #[test]
    fn host_function_round_trip() {
        let engine = Engine::default();
        let mut builder = SandboxBuilder::new(&engine);
        builder
            .interface("game")
            .func("double", "ii", |args| {
                let v = args.read_i32(0);
                args.ret(v * 2, None)
            })
            .expect("register");
        let (_registry, sandbox) = instantiate(&builder, ECHO);

        let mut args = ValueList::new();
        args.push_number(21.0);
        let results = sandbox.call_export("run", &args).expect("call");
        assert_eq!(results.get(0), Some(&Value::Number(42.0)));
    }

    #[test]
    fn handler_trap_names_the_function() {
        let engine = Engine::default();
        let mut builder = SandboxBuilder::new(&engine);
        builder
            .interface("game")
            .func("double", "ii", |args| args.ret(0, Some("refused")))
            .expect("register");
        let (_registry, sandbox) = instantiate(&builder, ECHO);

        let err = sandbox.call_export("run", &ValueList::new()).unwrap_err();
        assert_eq!(err, CallError::Raised("->`double`: refused".to_string()));
    }

    #[test]
    fn exports_resolve_while_the_sandbox_runs() {
        let engine = Engine::default();
        let mut builder = SandboxBuilder::new(&engine);
        builder
            .interface("game")
            .func("double", "ii", |args| {
                let context = args.context().clone();
                let Some(sandbox) = context
                    .directory
                    .upgrade()
                    .and_then(|directory| directory.sandbox(context.resource))
                else {
                    return args.ret(0, Some("sandbox not attached"));
                };
                let found = sandbox.callable("run").is_some();
                let nested = sandbox.call_export("run", &ValueList::new());
                let outcome = match nested {
                    Ok(_) => "completed".to_string(),
                    Err(e) => e.to_string(),
                };
                args.ret(0, Some(format!("found={found} nested={outcome}").as_str()))
            })
            .expect("register");
        let (registry, sandbox) = instantiate(&builder, ECHO);
        registry.attach_sandbox(sandbox.resource(), sandbox.clone());

        let err = sandbox.call_export("run", &ValueList::new()).unwrap_err();
        assert_eq!(
            err,
            CallError::Raised("->`double`: found=true nested=Sandbox is busy".to_string())
        );
    }

    #[test]
    fn bad_signature_is_rejected() {
        let engine = Engine::default();
        let mut builder = SandboxBuilder::new(&engine);
        let result = builder.interface("game").func("f", "iq", |_| Ok(())).map(|_| ());
        assert!(matches!(result, Err(SandboxError::Signature(_))));
    }

    #[test]
    fn callable_ids_are_stable_per_export() {
        let engine = Engine::default();
        let mut builder = SandboxBuilder::new(&engine);
        builder
            .interface("game")
            .func("double", "ii", |args| {
                let v = args.read_i32(0);
                args.ret(v * 2, None)
            })
            .expect("register");
        let (_registry, sandbox) = instantiate(&builder, ECHO);

        let first = sandbox.callable("run").expect("export");
        assert_eq!(sandbox.callable("run"), Some(first));
        assert!(first.is_foreign());
        assert_eq!(sandbox.callable("missing"), None);
    }
}
