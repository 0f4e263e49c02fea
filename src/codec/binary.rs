//! Tagged binary wire format.
//!
//! Every list body (the root argument list and each table) starts with a
//! compressed element count. Every value starts with a one-byte tag:
//!
//! | tag | value        | payload                                             |
//! |-----|--------------|-----------------------------------------------------|
//! | 0   | nil          |                                                     |
//! | 1   | boolean      | 1 bit                                               |
//! | 3   | number       | `0` + compressed i32, `10` + f32, or `11` + f64     |
//! | 4   | string       | compressed u16 length, bytes                        |
//! | 5   | table        | list body                                           |
//! | 7   | entity       | compressed u32 entity id                            |
//! | 9   | table ref    | compressed u32 registry index                       |
//! | 10  | long string  | compressed u32 length, byte alignment, bytes        |
//!
//! The table registry is shared by both sides: index 0 is the root list and
//! each table takes the next index when its tag is first seen, before its
//! body. There is no table-count preamble.

use std::collections::HashMap;

use scriptwire_bits::BitStream;
use tracing::debug;

use super::{Failure, Report};
use crate::config::Limits;
use crate::directory::Directory;
use crate::error::WireError;
use crate::value::{exact_i32, EntityId, ForeignHandle, TableId, Value, ValueList};

pub const TAG_NIL: u8 = 0;
pub const TAG_BOOLEAN: u8 = 1;
pub const TAG_NUMBER: u8 = 3;
pub const TAG_STRING: u8 = 4;
pub const TAG_TABLE: u8 = 5;
pub const TAG_ENTITY: u8 = 7;
pub const TAG_TABLE_REF: u8 = 9;
pub const TAG_LONG_STRING: u8 = 10;

pub struct BinaryCodec<'d> {
    directory: &'d dyn Directory,
    limits: Limits,
}

impl<'d> BinaryCodec<'d> {
    pub fn new(directory: &'d dyn Directory) -> Self {
        Self {
            directory,
            limits: Limits::default(),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Append `list` to `stream`.
    pub fn write(&self, list: &ValueList, stream: &mut BitStream) -> Report {
        let mut writer = Writer {
            codec: self,
            list,
            stream,
            known: HashMap::new(),
            next_index: 1,
            report: Report::default(),
        };
        writer.write_body(list.values(), 0);
        writer.report
    }

    /// Read one list from the current position of `stream`.
    pub fn read(&self, stream: &mut BitStream) -> Result<(ValueList, Report), WireError> {
        let mut reader = Reader {
            codec: self,
            stream,
            list: ValueList::new(),
            registry: vec![None],
            report: Report::default(),
        };
        let count = reader.read_count()?;
        for _ in 0..count {
            let value = reader.read_value(0)?;
            reader.list.push(value);
        }
        Ok((reader.list, reader.report))
    }

    pub fn to_bytes(&self, list: &ValueList) -> (Vec<u8>, Report) {
        let mut stream = BitStream::new();
        let report = self.write(list, &mut stream);
        (stream.into_bytes(), report)
    }

    pub fn from_bytes(&self, bytes: &[u8]) -> Result<(ValueList, Report), WireError> {
        let mut stream = BitStream::from_bytes(bytes.to_vec());
        self.read(&mut stream)
    }
}

// ============================================================================
// Encoding
// ============================================================================

struct Writer<'a, 'd> {
    codec: &'a BinaryCodec<'d>,
    list: &'a ValueList,
    stream: &'a mut BitStream,
    known: HashMap<TableId, u32>,
    next_index: u32,
    report: Report,
}

impl Writer<'_, '_> {
    fn write_body(&mut self, values: &[Value], depth: usize) {
        self.stream.write_compressed_u32(values.len() as u32);
        for value in values {
            self.write_value(value, depth);
        }
    }

    fn skip(&mut self, failure: Failure) {
        self.stream.write_u8(TAG_NIL);
        self.report.record(failure);
    }

    fn write_value(&mut self, value: &Value, depth: usize) {
        match value {
            Value::Nil => self.stream.write_u8(TAG_NIL),
            Value::Boolean(b) => {
                self.stream.write_u8(TAG_BOOLEAN);
                self.stream.write_bit(*b);
            }
            Value::Number(n) => {
                self.stream.write_u8(TAG_NUMBER);
                self.write_number(*n);
            }
            Value::String(s) => self.write_string(s),
            Value::Table(table) => {
                if let Some(&index) = self.known.get(&table.id) {
                    self.stream.write_u8(TAG_TABLE_REF);
                    self.stream.write_compressed_u32(index);
                    return;
                }
                if depth >= self.codec.limits.max_depth {
                    self.skip(Failure::TooDeep(self.codec.limits.max_depth));
                    return;
                }
                let Some(body) = self.list.table(table.id) else {
                    self.skip(Failure::BrokenReference(format!("table {}", table.id.index())));
                    return;
                };
                self.known.insert(table.id, self.next_index);
                self.next_index += 1;
                self.stream.write_u8(TAG_TABLE);
                self.write_body(body.entries(), depth + 1);
            }
            Value::Handle(ForeignHandle::Entity(id)) => {
                if self.codec.directory.entity_exists(*id) {
                    self.stream.write_u8(TAG_ENTITY);
                    self.stream.write_compressed_u32(id.0);
                } else {
                    self.skip(Failure::BrokenReference(id.to_string()));
                }
            }
            Value::Handle(ForeignHandle::Resource(_)) | Value::Callable(_) => {
                self.skip(Failure::Unsupported(value.kind()));
            }
        }
    }

    fn write_number(&mut self, n: f64) {
        if let Some(int) = exact_i32(n) {
            self.stream.write_bit(false);
            self.stream.write_compressed_i32(int);
        } else if (n as f32) as f64 == n {
            self.stream.write_bit(true);
            self.stream.write_bit(false);
            self.stream.write_f32(n as f32);
        } else {
            self.stream.write_bit(true);
            self.stream.write_bit(true);
            self.stream.write_f64(n);
        }
    }

    fn write_string(&mut self, s: &[u8]) {
        let len = s.len();
        if len <= self.codec.limits.max_short_string && len <= u16::MAX as usize {
            self.stream.write_u8(TAG_STRING);
            self.stream.write_compressed_u16(len as u16);
            self.stream.write_bytes(s);
        } else if len <= self.codec.limits.max_long_string && len <= u32::MAX as usize {
            self.stream.write_u8(TAG_LONG_STRING);
            self.stream.write_compressed_u32(len as u32);
            self.stream.align_write();
            self.stream.write_bytes(s);
        } else {
            self.skip(Failure::Overflow {
                len,
                max: self.codec.limits.max_long_string,
            });
        }
    }
}

// ============================================================================
// Decoding
// ============================================================================

struct Reader<'a, 'd> {
    codec: &'a BinaryCodec<'d>,
    stream: &'a mut BitStream,
    list: ValueList,
    registry: Vec<Option<TableId>>,
    report: Report,
}

impl Reader<'_, '_> {
    fn read_count(&mut self) -> Result<usize, WireError> {
        let len = self.stream.read_compressed_u32()? as usize;
        let max = self.codec.limits.max_sequence_len;
        if len > max {
            return Err(WireError::SequenceTooLong { len, max });
        }
        Ok(len)
    }

    fn read_value(&mut self, depth: usize) -> Result<Value, WireError> {
        let tag = self.stream.read_u8()?;
        let value = match tag {
            TAG_NIL => Value::Nil,
            TAG_BOOLEAN => Value::Boolean(self.stream.read_bit()?),
            TAG_NUMBER => Value::Number(self.read_number()?),
            TAG_STRING => {
                let len = self.stream.read_compressed_u16()? as usize;
                let bytes = self.stream.read_bytes(len)?;
                Value::String(bytes)
            }
            TAG_LONG_STRING => {
                let len = self.stream.read_compressed_u32()? as usize;
                let max = self.codec.limits.max_long_string;
                if len > max {
                    return Err(WireError::StringTooLong { len, max });
                }
                self.stream.align_read();
                let bytes = self.stream.read_bytes(len)?;
                Value::String(bytes)
            }
            TAG_TABLE => {
                if depth >= self.codec.limits.max_depth {
                    return Err(WireError::TooDeep(self.codec.limits.max_depth));
                }
                let count = self.read_count()?;
                let id = self.list.new_table();
                self.registry.push(Some(id));
                let slot = self.list.reference(id);
                for _ in 0..count {
                    let entry = self.read_value(depth + 1)?;
                    if let Some(table) = self.list.table_mut(id) {
                        table.push(entry);
                    }
                }
                if let Some(table) = self.list.table_mut(id) {
                    let dropped = table.validate_keys();
                    if dropped > 0 {
                        debug!(dropped, "dropped table pairs with nil keys");
                    }
                }
                slot
            }
            TAG_TABLE_REF => {
                let index = self.stream.read_compressed_u32()?;
                match self.registry.get(index as usize).copied().flatten() {
                    Some(id) => self.list.reference(id),
                    None => {
                        self.report
                            .record(Failure::BrokenReference(format!("table index {index}")));
                        Value::Nil
                    }
                }
            }
            TAG_ENTITY => {
                let id = EntityId(self.stream.read_compressed_u32()?);
                if self.codec.directory.entity_exists(id) {
                    Value::Handle(ForeignHandle::Entity(id))
                } else {
                    self.report.record(Failure::BrokenReference(id.to_string()));
                    Value::Nil
                }
            }
            other => return Err(WireError::InvalidTag(other)),
        };
        Ok(value)
    }

    fn read_number(&mut self) -> Result<f64, WireError> {
        if !self.stream.read_bit()? {
            return Ok(self.stream.read_compressed_i32()? as f64);
        }
        if self.stream.read_bit()? {
            Ok(self.stream.read_f64()?)
        } else {
            Ok(self.stream.read_f32()? as f64)
        }
    }

}
