//! Argument and result slots of a host function called from a sandbox.

use thiserror::Error;
use wasmtime::{Val, ValType};

use super::memory::{LinearMemory, MemoryError};
use super::packed::{self, PackError};
use super::signature::Kind;
use super::SandboxContext;
use crate::callable::{Callable, CALLABLE_HASH_LEN};
use crate::value::{ForeignHandle, ValueList};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArgError {
    #[error("Argument {index} is {found}, expected {expected}")]
    KindMismatch {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Argument {0} is missing")]
    Missing(usize),

    #[error("Argument {0} is a null pointer")]
    Null(usize),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Packed list error: {0}")]
    Packed(#[from] PackError),

    #[error("Invalid argument: {0}")]
    Invalid(String),
}

/// Aborts the current sandbox call frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("->`{function}`: {message}")]
pub struct Trap {
    pub function: String,
    pub message: String,
}

/// A value a host function hands back to the sandbox.
#[derive(Debug, Clone, Default)]
pub enum Ret {
    #[default]
    Void,
    Bool(bool),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Pointer(u32),
    String(String),
    Handle(Option<ForeignHandle>),
    List(ValueList),
    Callable(Callable),
}

impl From<bool> for Ret {
    fn from(b: bool) -> Self {
        Ret::Bool(b)
    }
}

impl From<i32> for Ret {
    fn from(v: i32) -> Self {
        Ret::I32(v)
    }
}

impl From<u32> for Ret {
    fn from(v: u32) -> Self {
        Ret::U32(v)
    }
}

impl From<i64> for Ret {
    fn from(v: i64) -> Self {
        Ret::I64(v)
    }
}

impl From<f64> for Ret {
    fn from(v: f64) -> Self {
        Ret::F64(v)
    }
}

impl From<String> for Ret {
    fn from(s: String) -> Self {
        Ret::String(s)
    }
}

impl From<&str> for Ret {
    fn from(s: &str) -> Self {
        Ret::String(s.to_string())
    }
}

impl From<Option<ForeignHandle>> for Ret {
    fn from(handle: Option<ForeignHandle>) -> Self {
        Ret::Handle(handle)
    }
}

impl From<ValueList> for Ret {
    fn from(list: ValueList) -> Self {
        Ret::List(list)
    }
}

fn val_name(val: &Val) -> &'static str {
    match val {
        Val::I32(_) => "i32",
        Val::I64(_) => "i64",
        Val::F32(_) => "f32",
        Val::F64(_) => "f64",
        Val::V128(_) => "v128",
        _ => "reference",
    }
}

/// Reads a host call's arguments in order and writes its single result.
///
/// Every read consumes one slot, even when it fails, so later reads stay
/// aligned. The `read_*` forms return the caller's default on any failure;
/// the `try_read_*` forms report why.
pub struct ArgStream<'a> {
    function: &'a str,
    args: &'a [Val],
    results: &'a mut [Val],
    ret: Option<Kind>,
    next: usize,
    memory: &'a mut dyn LinearMemory,
    context: &'a SandboxContext,
}

impl<'a> ArgStream<'a> {
    pub fn new(
        function: &'a str,
        args: &'a [Val],
        results: &'a mut [Val],
        ret: Option<Kind>,
        memory: &'a mut dyn LinearMemory,
        context: &'a SandboxContext,
    ) -> Self {
        Self {
            function,
            args,
            results,
            ret,
            next: 0,
            memory,
            context,
        }
    }

    pub fn function(&self) -> &str {
        self.function
    }

    pub fn context(&self) -> &SandboxContext {
        self.context
    }

    /// Slots not yet consumed.
    pub fn remaining(&self) -> usize {
        self.args.len().saturating_sub(self.next)
    }

    /// A trap for this call frame.
    pub fn trap(&self, message: impl Into<String>) -> Trap {
        Trap {
            function: self.function.to_string(),
            message: message.into(),
        }
    }

    fn take(&mut self) -> Result<(usize, Val), ArgError> {
        let index = self.next;
        self.next += 1;
        match self.args.get(index) {
            Some(val) => Ok((index, val.clone())),
            None => Err(ArgError::Missing(index)),
        }
    }

    fn mismatch(index: usize, expected: &'static str, val: &Val) -> ArgError {
        ArgError::KindMismatch {
            index,
            expected,
            found: val_name(val),
        }
    }

    // ========================================================================
    // Primitives
    // ========================================================================

    pub fn try_read_i32(&mut self) -> Result<i32, ArgError> {
        match self.take()? {
            (_, Val::I32(v)) => Ok(v),
            (index, other) => Err(Self::mismatch(index, "i32", &other)),
        }
    }

    pub fn try_read_i64(&mut self) -> Result<i64, ArgError> {
        match self.take()? {
            (_, Val::I64(v)) => Ok(v),
            (index, other) => Err(Self::mismatch(index, "i64", &other)),
        }
    }

    pub fn try_read_f32(&mut self) -> Result<f32, ArgError> {
        match self.take()? {
            (_, Val::F32(bits)) => Ok(f32::from_bits(bits)),
            (index, other) => Err(Self::mismatch(index, "f32", &other)),
        }
    }

    pub fn try_read_f64(&mut self) -> Result<f64, ArgError> {
        match self.take()? {
            (_, Val::F64(bits)) => Ok(f64::from_bits(bits)),
            (index, other) => Err(Self::mismatch(index, "f64", &other)),
        }
    }

    /// Any numeric slot; nonzero is true.
    pub fn try_read_bool(&mut self) -> Result<bool, ArgError> {
        match self.take()? {
            (_, Val::I32(v)) => Ok(v != 0),
            (_, Val::I64(v)) => Ok(v != 0),
            (_, Val::F32(bits)) => Ok(f32::from_bits(bits) != 0.0),
            (_, Val::F64(bits)) => Ok(f64::from_bits(bits) != 0.0),
            (index, other) => Err(Self::mismatch(index, "bool", &other)),
        }
    }

    pub fn try_read_pointer(&mut self) -> Result<u32, ArgError> {
        let index = self.next;
        match self.try_read_i32()? {
            0 => Err(ArgError::Null(index)),
            ptr => Ok(ptr as u32),
        }
    }

    pub fn read_i32(&mut self, default: i32) -> i32 {
        self.try_read_i32().unwrap_or(default)
    }

    pub fn read_u32(&mut self, default: u32) -> u32 {
        self.try_read_i32().map(|v| v as u32).unwrap_or(default)
    }

    pub fn read_i64(&mut self, default: i64) -> i64 {
        self.try_read_i64().unwrap_or(default)
    }

    pub fn read_u64(&mut self, default: u64) -> u64 {
        self.try_read_i64().map(|v| v as u64).unwrap_or(default)
    }

    pub fn read_f32(&mut self, default: f32) -> f32 {
        self.try_read_f32().unwrap_or(default)
    }

    pub fn read_f64(&mut self, default: f64) -> f64 {
        self.try_read_f64().unwrap_or(default)
    }

    pub fn read_bool(&mut self, default: bool) -> bool {
        self.try_read_bool().unwrap_or(default)
    }

    /// A raw address; 0 when the slot is null or not an address.
    pub fn read_pointer(&mut self) -> u32 {
        self.try_read_pointer().unwrap_or(0)
    }

    // ========================================================================
    // Memory-backed reads
    // ========================================================================

    /// A NUL-terminated UTF-8 string.
    pub fn try_read_string(&mut self) -> Result<String, ArgError> {
        let ptr = self.try_read_pointer()?;
        let bytes = self
            .memory
            .read_cstr(ptr, self.context.limits.max_long_string)?;
        String::from_utf8(bytes).map_err(|e| ArgError::Invalid(e.to_string()))
    }

    pub fn read_string(&mut self, default: &str) -> String {
        self.try_read_string()
            .unwrap_or_else(|_| default.to_string())
    }

    /// A string given as an address slot followed by a byte-length slot.
    pub fn try_read_string_sized(&mut self) -> Result<String, ArgError> {
        let ptr = self.try_read_pointer();
        let len = self.try_read_i32()? as u32 as usize;
        let ptr = ptr?;
        let max = self.context.limits.max_long_string;
        if len > max {
            return Err(ArgError::Invalid(format!(
                "string of {len} bytes exceeds limit of {max}"
            )));
        }
        let bytes = self.memory.read_vec(ptr, len)?;
        String::from_utf8(bytes).map_err(|e| ArgError::Invalid(e.to_string()))
    }

    pub fn read_string_sized(&mut self, default: &str) -> String {
        self.try_read_string_sized()
            .unwrap_or_else(|_| default.to_string())
    }

    fn try_read_floats<const N: usize>(&mut self) -> Result<[f32; N], ArgError> {
        let ptr = self.try_read_pointer()?;
        let mut out = [0f32; N];
        self.memory.read_f32s(ptr, &mut out)?;
        Ok(out)
    }

    /// `{x, y}` as two consecutive f32s.
    pub fn read_vector2(&mut self, default: [f32; 2]) -> [f32; 2] {
        self.try_read_floats().unwrap_or(default)
    }

    /// `{x, y, z}` as three consecutive f32s.
    pub fn read_vector3(&mut self, default: [f32; 3]) -> [f32; 3] {
        self.try_read_floats().unwrap_or(default)
    }

    /// A 4x3 transform: right, front, up and position rows of three f32s.
    pub fn read_matrix(&mut self, default: [[f32; 3]; 4]) -> [[f32; 3]; 4] {
        match self.try_read_floats::<12>() {
            Ok(flat) => {
                let mut rows = [[0f32; 3]; 4];
                for (row, chunk) in rows.iter_mut().zip(flat.chunks_exact(3)) {
                    row.copy_from_slice(chunk);
                }
                rows
            }
            Err(_) => default,
        }
    }

    /// An object handle. Zero bits, unknown kinds and dead entities read as
    /// `None`.
    pub fn try_read_handle(&mut self) -> Result<Option<ForeignHandle>, ArgError> {
        let bits = self.try_read_i64()? as u64;
        if bits == 0 {
            return Ok(None);
        }
        let handle = ForeignHandle::from_bits(bits)
            .ok_or_else(|| ArgError::Invalid(format!("handle {bits:#x}")))?;
        if let ForeignHandle::Entity(id) = handle {
            let alive = self
                .context
                .directory
                .upgrade()
                .is_some_and(|directory| directory.entity_exists(id));
            if !alive {
                return Ok(None);
            }
        }
        Ok(Some(handle))
    }

    pub fn read_handle(&mut self) -> Option<ForeignHandle> {
        self.try_read_handle().ok().flatten()
    }

    /// A pointer to a 21-byte callable hash.
    pub fn try_read_callable(&mut self) -> Result<Callable, ArgError> {
        let ptr = self.try_read_pointer()?;
        let bytes = self.memory.read_vec(ptr, CALLABLE_HASH_LEN)?;
        let directory = self
            .context
            .directory
            .upgrade()
            .ok_or_else(|| ArgError::Invalid("directory dropped".to_string()))?;
        Callable::read_hash(&bytes, &*directory).map_err(|e| ArgError::Invalid(e.to_string()))
    }

    pub fn read_callable(&mut self) -> Option<Callable> {
        self.try_read_callable().ok()
    }

    /// A pointer to a packed value-list descriptor.
    pub fn try_read_value_list(&mut self) -> Result<ValueList, ArgError> {
        let ptr = self.try_read_pointer()?;
        let directory = self.context.directory.upgrade();
        let (list, _) = packed::read_packed(
            &*self.memory,
            ptr,
            directory.as_deref(),
            &self.context.limits,
        )?;
        Ok(list)
    }

    /// An empty list when the slot is null or malformed.
    pub fn read_value_list(&mut self) -> ValueList {
        self.try_read_value_list().unwrap_or_default()
    }

    // ========================================================================
    // Result
    // ========================================================================

    /// Write the call's result slot, or trap with `error`.
    ///
    /// Strings, lists and callable hashes are copied onto the guest heap and
    /// the guest owns the copy. An empty string returns 0 without allocating.
    pub fn ret(&mut self, value: impl Into<Ret>, error: Option<&str>) -> Result<(), Trap> {
        if let Some(message) = error {
            return Err(self.trap(message));
        }
        let Some(kind) = self.ret else {
            return Ok(());
        };
        let val = self.to_val(value.into(), kind.val_type())?;
        if let Some(slot) = self.results.first_mut() {
            *slot = val;
        }
        Ok(())
    }

    fn to_val(&mut self, value: Ret, ty: ValType) -> Result<Val, Trap> {
        let word: i64 = match value {
            Ret::Void => 0,
            Ret::Bool(b) => b as i64,
            Ret::I32(v) => v as i64,
            Ret::U32(v) | Ret::Pointer(v) => v as i32 as i64,
            Ret::I64(v) => v,
            Ret::U64(v) => v as i64,
            Ret::F32(v) => return Ok(float_val(v as f64, ty)),
            Ret::F64(v) => return Ok(float_val(v, ty)),
            Ret::Handle(handle) => handle.map_or(0, |h| h.to_bits() as i64),
            Ret::String(s) if s.is_empty() => 0,
            Ret::String(s) => {
                let ptr = self
                    .memory
                    .alloc_cstr(s.as_bytes())
                    .map_err(|e| self.trap(e.to_string()))?;
                ptr as i32 as i64
            }
            Ret::Callable(callable) => {
                let ptr = self
                    .memory
                    .alloc_bytes(callable.write_hash().as_bytes())
                    .map_err(|e| self.trap(e.to_string()))?;
                ptr as i32 as i64
            }
            Ret::List(list) => {
                let packed = packed::write_packed(&mut *self.memory, &list, &self.context.limits)
                    .map_err(|e| self.trap(e.to_string()))?;
                packed.descriptor as i32 as i64
            }
        };
        Ok(match ty {
            ValType::I64 => Val::I64(word),
            ValType::F32 => Val::F32((word as f32).to_bits()),
            ValType::F64 => Val::F64((word as f64).to_bits()),
            _ => Val::I32(word as i32),
        })
    }
}

fn float_val(v: f64, ty: ValType) -> Val {
    match ty {
        ValType::F32 => Val::F32((v as f32).to_bits()),
        ValType::F64 => Val::F64(v.to_bits()),
        ValType::I64 => Val::I64(v as i64),
        _ => Val::I32(v as i32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Directory, Registry};
    use crate::config::Limits;
    use crate::foreign::memory::BufferMemory;
    use crate::value::Value;
    use std::rc::Rc;

    fn context(registry: &Rc<Registry>) -> SandboxContext {
        let directory: Rc<dyn Directory> = registry.clone();
        SandboxContext {
            resource: registry.add_resource("test"),
            directory: Rc::downgrade(&directory),
            limits: Limits::default(),
        }
    }

    #[test]
    fn mismatched_slot_yields_default_and_advances() {
        let registry = Rc::new(Registry::new());
        let context = context(&registry);
        let mut memory = BufferMemory::new(64);
        let args = [Val::F32(2.5f32.to_bits()), Val::I32(7)];
        let mut results: [Val; 0] = [];
        let mut stream = ArgStream::new("f", &args, &mut results, None, &mut memory, &context);

        assert_eq!(stream.read_i32(-1), -1);
        assert_eq!(stream.read_i32(-1), 7);
        assert_eq!(stream.read_i32(-1), -1);
        assert_eq!(stream.remaining(), 0);
    }

    #[test]
    fn bool_accepts_any_numeric_slot() {
        let registry = Rc::new(Registry::new());
        let context = context(&registry);
        let mut memory = BufferMemory::new(64);
        let args = [Val::I64(0), Val::F64(1.0f64.to_bits()), Val::I32(3)];
        let mut results: [Val; 0] = [];
        let mut stream = ArgStream::new("f", &args, &mut results, None, &mut memory, &context);

        assert!(!stream.read_bool(true));
        assert!(stream.read_bool(false));
        assert!(stream.read_bool(false));
    }

    #[test]
    fn strings_and_vectors_from_memory() {
        let registry = Rc::new(Registry::new());
        let context = context(&registry);
        let mut memory = BufferMemory::new(256);
        let name = memory.alloc_cstr(b"Infernus").unwrap();
        let mut floats = Vec::new();
        for v in [1.0f32, 2.0, 3.0] {
            floats.extend_from_slice(&v.to_le_bytes());
        }
        let vector = memory.alloc_bytes(&floats).unwrap();

        let args = [
            Val::I32(name as i32),
            Val::I32(0),
            Val::I32(vector as i32),
            Val::I32(4000),
        ];
        let mut results: [Val; 0] = [];
        let mut stream = ArgStream::new("f", &args, &mut results, None, &mut memory, &context);

        assert_eq!(stream.read_string("?"), "Infernus");
        assert_eq!(stream.read_string("?"), "?");
        assert_eq!(stream.read_vector3([0.0; 3]), [1.0, 2.0, 3.0]);
        assert_eq!(stream.read_vector2([9.0; 2]), [9.0; 2]);
    }

    #[test]
    fn matrix_rows_from_memory() {
        let registry = Rc::new(Registry::new());
        let context = context(&registry);
        let mut memory = BufferMemory::new(256);
        let flat: Vec<u8> = (1..=12).flat_map(|v| (v as f32).to_le_bytes()).collect();
        let matrix = memory.alloc_bytes(&flat).unwrap();

        let args = [Val::I64(matrix as i64), Val::I32(matrix as i32), Val::I32(0)];
        let mut results: [Val; 0] = [];
        let mut stream = ArgStream::new("f", &args, &mut results, None, &mut memory, &context);
        let identity = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [0.0; 3]];

        assert_eq!(stream.read_matrix(identity), identity);
        assert_eq!(
            stream.read_matrix(identity),
            [[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0], [10.0, 11.0, 12.0]]
        );
        assert_eq!(stream.read_matrix(identity), identity);
        assert_eq!(stream.remaining(), 0);
    }

    #[test]
    fn sized_string_takes_two_slots() {
        let registry = Rc::new(Registry::new());
        let context = context(&registry);
        let mut memory = BufferMemory::new(256);
        let text = memory.alloc_bytes(b"Banshee-and-more").unwrap();

        let args = [
            Val::I32(text as i32),
            Val::I32(7),
            Val::F32(1.0f32.to_bits()),
            Val::I32(3),
            Val::I32(text as i32),
            Val::I32(-1),
            Val::I32(42),
        ];
        let mut results: [Val; 0] = [];
        let mut stream = ArgStream::new("f", &args, &mut results, None, &mut memory, &context);

        assert_eq!(stream.read_string_sized("?"), "Banshee");
        // a bad address slot still consumes the length slot
        assert_eq!(stream.read_string_sized("?"), "?");
        // a length past the limit is rejected
        assert_eq!(stream.read_string_sized("?"), "?");
        assert_eq!(stream.read_i32(0), 42);
    }

    #[test]
    fn wide_integers_keep_their_bits() {
        let registry = Rc::new(Registry::new());
        let context = context(&registry);
        let mut memory = BufferMemory::new(64);
        let args = [
            Val::I64(-1),
            Val::I32(5),
            Val::I64(i64::MIN),
            Val::I32(-2),
        ];
        let mut results: [Val; 0] = [];
        let mut stream = ArgStream::new("f", &args, &mut results, None, &mut memory, &context);

        assert_eq!(stream.read_u64(0), u64::MAX);
        assert_eq!(stream.read_u64(9), 9);
        assert_eq!(stream.read_u64(0), 1u64 << 63);
        assert_eq!(stream.read_u32(0), u32::MAX - 1);
    }

    #[test]
    fn callable_hash_from_memory() {
        let registry = Rc::new(Registry::new());
        let context = context(&registry);
        let callable = Callable::InterpreterFunction {
            resource: context.resource,
            handle: 12,
        };
        let mut memory = BufferMemory::new(256);
        let hash = memory.alloc_bytes(callable.write_hash().as_bytes()).unwrap();
        let garbage = memory.alloc_bytes(&[0xAB; CALLABLE_HASH_LEN]).unwrap();

        let args = [
            Val::I64(hash as i64),
            Val::I32(hash as i32),
            Val::I32(garbage as i32),
            Val::I32(0),
            Val::I32(1),
        ];
        let mut results: [Val; 0] = [];
        let mut stream = ArgStream::new("f", &args, &mut results, None, &mut memory, &context);

        assert_eq!(stream.read_callable(), None);
        assert_eq!(stream.read_callable(), Some(callable));
        assert_eq!(stream.read_callable(), None);
        assert_eq!(stream.read_callable(), None);
        assert_eq!(stream.read_i32(0), 1);
    }

    #[test]
    fn dead_entity_reads_as_none() {
        let registry = Rc::new(Registry::new());
        let context = context(&registry);
        let car = registry.spawn_entity();
        let wreck = registry.spawn_entity();
        registry.destroy_entity(wreck);

        let mut memory = BufferMemory::new(64);
        let args = [
            Val::I64(ForeignHandle::Entity(car).to_bits() as i64),
            Val::I64(ForeignHandle::Entity(wreck).to_bits() as i64),
        ];
        let mut results: [Val; 0] = [];
        let mut stream = ArgStream::new("f", &args, &mut results, None, &mut memory, &context);

        assert_eq!(stream.read_handle(), Some(ForeignHandle::Entity(car)));
        assert_eq!(stream.read_handle(), None);
    }

    #[test]
    fn string_result_is_allocated() {
        let registry = Rc::new(Registry::new());
        let context = context(&registry);
        let mut memory = BufferMemory::new(64);
        let mut results = [Val::I32(0)];
        {
            let mut stream = ArgStream::new(
                "name",
                &[],
                &mut results,
                Some(Kind::String),
                &mut memory,
                &context,
            );
            stream.ret("race", None).unwrap();
        }
        let ptr = results[0].unwrap_i32() as u32;
        assert_ne!(ptr, 0);
        assert_eq!(memory.read_cstr(ptr, 16).unwrap(), b"race");

        let mut results = [Val::I32(9)];
        let mut stream = ArgStream::new(
            "name",
            &[],
            &mut results,
            Some(Kind::String),
            &mut memory,
            &context,
        );
        stream.ret("", None).unwrap();
        drop(stream);
        assert_eq!(results[0].unwrap_i32(), 0);
        assert_eq!(memory.live_allocations(), 1);
    }

    #[test]
    fn error_message_traps() {
        let registry = Rc::new(Registry::new());
        let context = context(&registry);
        let mut memory = BufferMemory::new(64);
        let mut results = [Val::I32(0)];
        let mut stream = ArgStream::new(
            "setHealth",
            &[],
            &mut results,
            Some(Kind::Bool),
            &mut memory,
            &context,
        );
        let trap = stream.ret(false, Some("no such player")).unwrap_err();
        assert_eq!(trap.to_string(), "->`setHealth`: no such player");
    }

    #[test]
    fn value_list_argument() {
        let registry = Rc::new(Registry::new());
        let context = context(&registry);
        let mut memory = BufferMemory::new(256);
        let list: ValueList = [Value::from(1.5), Value::from("x")].into_iter().collect();
        let packed = packed::write_packed(&mut memory, &list, &Limits::default()).unwrap();

        let args = [Val::I32(packed.descriptor as i32), Val::I32(0)];
        let mut results: [Val; 0] = [];
        let mut stream = ArgStream::new("f", &args, &mut results, None, &mut memory, &context);
        assert_eq!(stream.read_value_list(), list);
        assert!(stream.read_value_list().is_empty());
    }
}
