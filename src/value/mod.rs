//! Dynamic script values.
//!
//! A [`Value`] is one datum as scripts see it. Tables are not stored inline:
//! they live in the arena of the [`ValueList`] that carries the value, and a
//! [`Value::Table`] holds a [`TableRef`] into that arena. The first reference
//! created for a table owns it; every later reference is weak. Because the
//! arena owns each table exactly once, shared and cyclic tables need no
//! reference counting and dropping the list frees every table once.

mod compare;
mod list;

pub use list::{Table, ValueList};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::callable::Callable;

/// Identifier of a game entity in the [`Directory`](crate::Directory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u32);

/// Identifier of a loaded script resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource#{}", self.0)
    }
}

/// Index of a table in a [`ValueList`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(pub(crate) u32);

impl TableId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A table slot: which arena table, and whether this slot owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub id: TableId,
    pub owned: bool,
}

/// Opaque handle to an object that lives outside the scripting runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForeignHandle {
    Entity(EntityId),
    Resource(ResourceId),
}

const HANDLE_KIND_SHIFT: u32 = 56;
const HANDLE_KIND_ENTITY: u64 = 0x45;
const HANDLE_KIND_RESOURCE: u64 = 0x52;

impl ForeignHandle {
    /// Pack into 64 bits: a kind byte at the top and the id in the low word.
    /// Never zero, so a zero handle always means "no object".
    pub fn to_bits(self) -> u64 {
        match self {
            ForeignHandle::Entity(id) => (HANDLE_KIND_ENTITY << HANDLE_KIND_SHIFT) | id.0 as u64,
            ForeignHandle::Resource(id) => {
                (HANDLE_KIND_RESOURCE << HANDLE_KIND_SHIFT) | id.0 as u64
            }
        }
    }

    pub fn from_bits(bits: u64) -> Option<Self> {
        if bits & 0x00FF_FFFF_0000_0000 != 0 {
            return None;
        }
        let id = bits as u32;
        match bits >> HANDLE_KIND_SHIFT {
            HANDLE_KIND_ENTITY => Some(ForeignHandle::Entity(EntityId(id))),
            HANDLE_KIND_RESOURCE => Some(ForeignHandle::Resource(ResourceId(id))),
            _ => None,
        }
    }
}

/// One dynamic value.
///
/// Derived equality compares table slots by arena id. Compare whole
/// [`ValueList`]s for structural equality.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Number(f64),
    /// Script strings are byte strings and need not be UTF-8.
    String(Vec<u8>),
    Table(TableRef),
    Callable(Callable),
    Handle(ForeignHandle),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Nil => ValueKind::Nil,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Table(_) => ValueKind::Table,
            Value::Callable(_) => ValueKind::Callable,
            Value::Handle(_) => ValueKind::Handle,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(s) => Some(s.as_slice()),
            _ => None,
        }
    }

    /// The string payload, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|s| std::str::from_utf8(s).ok())
    }

    pub fn as_table(&self) -> Option<TableId> {
        match self {
            Value::Table(table) => Some(table.id),
            _ => None,
        }
    }

    pub fn as_callable(&self) -> Option<Callable> {
        match self {
            Value::Callable(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<ForeignHandle> {
        match self {
            Value::Handle(h) => Some(*h),
            _ => None,
        }
    }

    /// Whether a table slot is a weak reference.
    pub fn is_weak(&self) -> bool {
        matches!(self, Value::Table(TableRef { owned: false, .. }))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into_bytes())
    }
}

impl From<&[u8]> for Value {
    fn from(s: &[u8]) -> Self {
        Value::String(s.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(s: Vec<u8>) -> Self {
        Value::String(s)
    }
}

impl From<ForeignHandle> for Value {
    fn from(h: ForeignHandle) -> Self {
        Value::Handle(h)
    }
}

impl From<Callable> for Value {
    fn from(c: Callable) -> Self {
        Value::Callable(c)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Nil,
    Boolean,
    Number,
    String,
    Table,
    Callable,
    Handle,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Nil => "nil",
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Table => "table",
            ValueKind::Callable => "function",
            ValueKind::Handle => "handle",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether `n` is an exact integer that fits in an `i32`.
pub(crate) fn exact_i32(n: f64) -> Option<i32> {
    if n.fract() == 0.0 && n >= i32::MIN as f64 && n <= i32::MAX as f64 {
        Some(n as i32)
    } else {
        None
    }
}
