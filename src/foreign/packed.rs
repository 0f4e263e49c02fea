//! Packed value lists in sandbox memory.
//!
//! A list crosses into the sandbox as the address of a 12-byte descriptor:
//!
//! ```text
//! data_ptr: u32 LE | data_len: u32 LE | count: u32 LE
//! ```
//!
//! `data` holds `count` records, each a type byte followed by its payload:
//!
//! | type | payload                                         |
//! |------|-------------------------------------------------|
//! | `0`  | nil                                             |
//! | `b`  | 1 byte, 0 or 1                                  |
//! | `n`  | f64 LE                                          |
//! | `s`  | u32 LE length, bytes                            |
//! | `c`  | 21-byte callable hash                           |
//! | `u`  | u64 LE handle bits                              |
//! | `l`  | u32 LE pair count, then two records per pair    |
//!
//! Packed tables are trees. A table reached again while it is being packed
//! is written as nil.

use std::collections::HashSet;

use thiserror::Error;

use super::memory::{LinearMemory, MemoryError};
use crate::callable::{Callable, CALLABLE_HASH_LEN};
use crate::codec::{Failure, Report};
use crate::config::Limits;
use crate::directory::Directory;
use crate::value::{ForeignHandle, TableId, Value, ValueKind, ValueList};

pub const DESCRIPTOR_LEN: usize = 12;

const T_NIL: u8 = b'0';
const T_BOOL: u8 = b'b';
const T_NUMBER: u8 = b'n';
const T_STRING: u8 = b's';
const T_CALLABLE: u8 = b'c';
const T_HANDLE: u8 = b'u';
const T_LIST: u8 = b'l';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackError {
    #[error("Packed data truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("Unknown packed record type {0:#04x}")]
    UnknownType(u8),

    #[error("Packed tables nest deeper than {0} levels")]
    TooDeep(usize),

    #[error("Packed sequence too large: {len} elements, limit {max}")]
    SequenceTooLong { len: usize, max: usize },

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),
}

// ============================================================================
// Packing
// ============================================================================

/// Serialize `list` into record bytes. Returns the data and its root count.
pub fn pack(list: &ValueList, limits: &Limits) -> (Vec<u8>, u32, Report) {
    let mut packer = Packer {
        list,
        limits,
        out: Vec::new(),
        open: HashSet::new(),
        report: Report::default(),
    };
    for value in list.iter() {
        packer.value(value, 0);
    }
    (packer.out, list.len() as u32, packer.report)
}

/// Pack `list` as the root records of a blob.
///
/// A table packs as its own pairs at the root, so `[k1, v1, k2, v2, ...]`.
pub fn pack_table(list: &ValueList, table: TableId, limits: &Limits) -> (Vec<u8>, u32, Report) {
    let mut packer = Packer {
        list,
        limits,
        out: Vec::new(),
        open: HashSet::from([table]),
        report: Report::default(),
    };
    let mut count = 0u32;
    if let Some(body) = list.table(table) {
        for (key, value) in body.pairs() {
            packer.value(key, 1);
            packer.value(value, 1);
            count += 2;
        }
    }
    (packer.out, count, packer.report)
}

struct Packer<'a> {
    list: &'a ValueList,
    limits: &'a Limits,
    out: Vec<u8>,
    open: HashSet<TableId>,
    report: Report,
}

impl Packer<'_> {
    fn nil(&mut self, failure: Failure) {
        self.out.push(T_NIL);
        self.report.record(failure);
    }

    fn value(&mut self, value: &Value, depth: usize) {
        match value {
            Value::Nil => self.out.push(T_NIL),
            Value::Boolean(b) => {
                self.out.push(T_BOOL);
                self.out.push(*b as u8);
            }
            Value::Number(n) => {
                self.out.push(T_NUMBER);
                self.out.extend_from_slice(&n.to_le_bytes());
            }
            Value::String(s) => {
                self.out.push(T_STRING);
                self.out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                self.out.extend_from_slice(s);
            }
            Value::Callable(callable) => {
                self.out.push(T_CALLABLE);
                self.out.extend_from_slice(callable.write_hash().as_bytes());
            }
            Value::Handle(handle) => {
                self.out.push(T_HANDLE);
                self.out.extend_from_slice(&handle.to_bits().to_le_bytes());
            }
            Value::Table(table) => {
                if self.open.contains(&table.id) {
                    self.nil(Failure::Unsupported(ValueKind::Table));
                    return;
                }
                if depth >= self.limits.max_depth {
                    self.nil(Failure::TooDeep(self.limits.max_depth));
                    return;
                }
                let list = self.list;
                let Some(body) = list.table(table.id) else {
                    self.nil(Failure::BrokenReference(format!("table {}", table.id.index())));
                    return;
                };
                self.open.insert(table.id);
                self.out.push(T_LIST);
                self.out
                    .extend_from_slice(&(body.pair_count() as u32).to_le_bytes());
                for (key, value) in body.pairs() {
                    self.value(key, depth + 1);
                    self.value(value, depth + 1);
                }
                self.open.remove(&table.id);
            }
        }
    }
}

// ============================================================================
// Unpacking
// ============================================================================

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], PackError> {
        if self.pos + len > self.bytes.len() {
            return Err(PackError::Truncated {
                need: self.pos + len,
                have: self.bytes.len(),
            });
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..self.pos])
    }

    fn read_u8(&mut self) -> Result<u8, PackError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, PackError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, PackError> {
        let b = self.read_bytes(8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(b);
        Ok(u64::from_le_bytes(word))
    }
}

/// Rebuild a list from `count` root records in `data`.
///
/// Callable hashes resolve through `directory`; without one they read as nil.
pub fn unpack(
    data: &[u8],
    count: u32,
    directory: Option<&dyn Directory>,
    limits: &Limits,
) -> Result<(ValueList, Report), PackError> {
    let max = limits.max_sequence_len;
    if count as usize > max {
        return Err(PackError::SequenceTooLong {
            len: count as usize,
            max,
        });
    }
    let mut unpacker = Unpacker {
        cursor: Cursor::new(data),
        directory,
        limits,
        list: ValueList::new(),
        report: Report::default(),
    };
    for _ in 0..count {
        let value = unpacker.value(0)?;
        unpacker.list.push(value);
    }
    Ok((unpacker.list, unpacker.report))
}

struct Unpacker<'a> {
    cursor: Cursor<'a>,
    directory: Option<&'a dyn Directory>,
    limits: &'a Limits,
    list: ValueList,
    report: Report,
}

impl Unpacker<'_> {
    fn value(&mut self, depth: usize) -> Result<Value, PackError> {
        let value = match self.cursor.read_u8()? {
            T_NIL => Value::Nil,
            T_BOOL => Value::Boolean(self.cursor.read_u8()? != 0),
            T_NUMBER => Value::Number(f64::from_bits(self.cursor.read_u64()?)),
            T_STRING => {
                let len = self.cursor.read_u32()? as usize;
                Value::from(self.cursor.read_bytes(len)?)
            }
            T_CALLABLE => {
                let bytes = self.cursor.read_bytes(CALLABLE_HASH_LEN)?;
                match self.directory.map(|d| Callable::read_hash(bytes, d)) {
                    Some(Ok(callable)) => Value::Callable(callable),
                    Some(Err(e)) => self.nil(Failure::BrokenReference(e.to_string())),
                    None => self.nil(Failure::Unsupported(ValueKind::Callable)),
                }
            }
            T_HANDLE => {
                let bits = self.cursor.read_u64()?;
                match ForeignHandle::from_bits(bits) {
                    Some(ForeignHandle::Entity(id))
                        if self.directory.is_some_and(|d| !d.entity_exists(id)) =>
                    {
                        self.nil(Failure::BrokenReference(id.to_string()))
                    }
                    Some(handle) => Value::Handle(handle),
                    None => self.nil(Failure::Invalid {
                        what: "handle",
                        detail: format!("{bits:#x}"),
                    }),
                }
            }
            T_LIST => {
                if depth >= self.limits.max_depth {
                    return Err(PackError::TooDeep(self.limits.max_depth));
                }
                let pairs = self.cursor.read_u32()? as usize;
                let max = self.limits.max_sequence_len;
                if pairs > max {
                    return Err(PackError::SequenceTooLong { len: pairs, max });
                }
                let id = self.list.new_table();
                let slot = self.list.reference(id);
                for _ in 0..pairs * 2 {
                    let entry = self.value(depth + 1)?;
                    if let Some(table) = self.list.table_mut(id) {
                        table.push(entry);
                    }
                }
                if let Some(table) = self.list.table_mut(id) {
                    table.validate_keys();
                }
                slot
            }
            other => return Err(PackError::UnknownType(other)),
        };
        Ok(value)
    }

    fn nil(&mut self, failure: Failure) -> Value {
        self.report.record(failure);
        Value::Nil
    }
}

// ============================================================================
// Sandbox memory
// ============================================================================

/// A packed list written into guest memory.
#[derive(Debug, Clone, Default)]
pub struct PackedList {
    /// Address of the descriptor; 0 when nothing was written.
    pub descriptor: u32,
    /// Every block allocated for the list.
    pub allocations: Vec<u32>,
    pub report: Report,
}

/// Allocate and write a descriptor and its data.
pub fn write_blob(
    memory: &mut dyn LinearMemory,
    data: &[u8],
    count: u32,
) -> Result<(u32, Vec<u32>), MemoryError> {
    let data_ptr = memory.alloc_bytes(data)?;
    let mut descriptor = [0u8; DESCRIPTOR_LEN];
    descriptor[0..4].copy_from_slice(&data_ptr.to_le_bytes());
    descriptor[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
    descriptor[8..12].copy_from_slice(&count.to_le_bytes());
    match memory.alloc_bytes(&descriptor) {
        Ok(ptr) => Ok((ptr, vec![ptr, data_ptr])),
        Err(e) => {
            memory.free(data_ptr);
            Err(e)
        }
    }
}

pub fn write_packed(
    memory: &mut dyn LinearMemory,
    list: &ValueList,
    limits: &Limits,
) -> Result<PackedList, MemoryError> {
    let (data, count, report) = pack(list, limits);
    let (descriptor, allocations) = write_blob(memory, &data, count)?;
    Ok(PackedList {
        descriptor,
        allocations,
        report,
    })
}

pub fn read_packed(
    memory: &dyn LinearMemory,
    descriptor: u32,
    directory: Option<&dyn Directory>,
    limits: &Limits,
) -> Result<(ValueList, Report), PackError> {
    let header = memory.read_vec(descriptor, DESCRIPTOR_LEN)?;
    let mut cursor = Cursor::new(&header);
    let data_ptr = cursor.read_u32()?;
    let data_len = cursor.read_u32()? as usize;
    let count = cursor.read_u32()?;
    if data_ptr == 0 || data_len == 0 {
        return Ok((ValueList::new(), Report::default()));
    }
    let data = memory.read_vec(data_ptr, data_len)?;
    unpack(&data, count, directory, limits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Registry;
    use crate::foreign::memory::BufferMemory;

    #[test]
    fn record_layout() {
        let list: ValueList = [Value::Boolean(true), Value::from("ab")].into_iter().collect();
        let (data, count, _) = pack(&list, &Limits::default());
        assert_eq!(count, 2);
        assert_eq!(data, vec![b'b', 1, b's', 2, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn nested_tables_survive_memory() {
        let registry = Registry::new();
        let resource = registry.add_resource("race");
        let mut list = ValueList::new();
        let t = list.new_table();
        list.table_mut(t).unwrap().insert("speed", 1.5);
        list.table_mut(t).unwrap().insert(1, Value::Nil);
        list.push_table(t);
        list.push_callable(Callable::InterpreterFunction { resource, handle: 3 });
        list.push_number(-2.0);

        let limits = Limits::default();
        let mut memory = BufferMemory::new(1024);
        let packed = write_packed(&mut memory, &list, &limits).unwrap();
        assert_eq!(packed.allocations.len(), 2);

        let (decoded, report) =
            read_packed(&memory, packed.descriptor, Some(&registry), &limits).unwrap();
        assert!(report.is_clean());
        assert_eq!(decoded, list);
    }

    #[test]
    fn cyclic_table_packs_as_nil() {
        let mut list = ValueList::new();
        let t = list.new_table();
        let me = list.reference(t);
        list.table_mut(t).unwrap().insert("self", me);
        list.push_table(t);

        let (data, count, report) = pack(&list, &Limits::default());
        assert_eq!(report.failures.len(), 1);
        let (decoded, _) = unpack(&data, count, None, &Limits::default()).unwrap();
        let table = decoded.table_of(decoded.get(0).unwrap()).unwrap();
        assert_eq!(table.get(&Value::from("self")), Some(&Value::Nil));
    }

    #[test]
    fn descriptor_at_the_address_limit_is_out_of_bounds() {
        let memory = BufferMemory::new(64);
        let err = read_packed(&memory, u32::MAX - 3, None, &Limits::default()).unwrap_err();
        assert!(matches!(err, PackError::Memory(MemoryError::OutOfBounds { .. })));
    }

    #[test]
    fn string_records_keep_raw_bytes() {
        let list: ValueList = [Value::from(&b"\xff\xfeAB"[..])].into_iter().collect();
        let (data, count, _) = pack(&list, &Limits::default());
        let (unpacked, report) = unpack(&data, count, None, &Limits::default()).unwrap();
        assert!(report.is_clean());
        assert_eq!(unpacked, list);
    }

    #[test]
    fn truncated_and_unknown_records_fail() {
        let limits = Limits::default();
        assert!(matches!(
            unpack(&[b's', 9, 0, 0, 0, b'x'], 1, None, &limits),
            Err(PackError::Truncated { .. })
        ));
        assert_eq!(
            unpack(&[b'?'], 1, None, &limits).unwrap_err(),
            PackError::UnknownType(b'?')
        );
    }
}
