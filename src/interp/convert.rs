//! Conversion between live Lua values and [`ValueList`]s.
//!
//! Each top-level read or push uses a fresh identity map, so a table reached
//! twice in one call maps to one arena table (or one Lua table) and cycles
//! terminate. Maps never outlive the call.

use std::collections::HashMap;
use std::ffi::c_void;

use mlua::{Function, LightUserData, Lua, MultiValue, Table, Value as LuaValue};

use super::dispatch;
use super::host;
use crate::callable::Callable;
use crate::value::{ForeignHandle, TableId, Value, ValueList};

const REFS: &str = "scriptwire.refs";

pub(crate) fn install(lua: &Lua) -> mlua::Result<()> {
    lua.set_named_registry_value(REFS, lua.create_table()?)
}

// ============================================================================
// Function anchors
// ============================================================================

/// Anchor `function` so it survives as long as its handle.
pub(crate) fn anchor(lua: &Lua, function: Function) -> mlua::Result<u64> {
    let handle = {
        let host = host(lua)?;
        let handle = host.next_ref.get();
        host.next_ref.set(handle + 1);
        handle
    };
    let refs: Table = lua.named_registry_value(REFS)?;
    refs.raw_set(handle, function)?;
    Ok(handle)
}

pub(crate) fn anchored(lua: &Lua, handle: u64) -> mlua::Result<Option<Function>> {
    let refs: Table = lua.named_registry_value(REFS)?;
    match refs.raw_get::<LuaValue>(handle)? {
        LuaValue::Function(function) => Ok(Some(function)),
        _ => Ok(None),
    }
}

pub(crate) fn release(lua: &Lua, handle: u64) -> mlua::Result<bool> {
    let refs: Table = lua.named_registry_value(REFS)?;
    let present = !matches!(refs.raw_get::<LuaValue>(handle)?, LuaValue::Nil);
    refs.raw_set(handle, LuaValue::Nil)?;
    Ok(present)
}

pub(crate) fn handle_pointer(bits: u64) -> LuaValue {
    LuaValue::LightUserData(LightUserData(bits as usize as *mut c_void))
}

// ============================================================================
// Lua -> ValueList
// ============================================================================

pub(crate) fn read_multi(lua: &Lua, values: MultiValue) -> mlua::Result<ValueList> {
    let mut list = ValueList::new();
    let mut known = HashMap::new();
    for value in values {
        let value = read_value(lua, &mut list, value, &mut known)?;
        list.push(value);
    }
    Ok(list)
}

pub(crate) fn read_value(
    lua: &Lua,
    list: &mut ValueList,
    value: LuaValue,
    known: &mut HashMap<*const c_void, TableId>,
) -> mlua::Result<Value> {
    let value = match value {
        LuaValue::Nil => Value::Nil,
        LuaValue::Boolean(b) => Value::Boolean(b),
        LuaValue::Integer(i) => Value::Number(i as f64),
        LuaValue::Number(n) => Value::Number(n),
        LuaValue::String(s) => Value::String(s.as_bytes().to_vec()),
        LuaValue::LightUserData(ud) => ForeignHandle::from_bits(ud.0 as usize as u64)
            .map(Value::Handle)
            .unwrap_or(Value::Nil),
        LuaValue::Table(table) => {
            let pointer = table.to_pointer();
            if let Some(&id) = known.get(&pointer) {
                return Ok(list.reference(id));
            }
            if let Some(callable) = dispatch::callable_from_table(lua, &table)? {
                return Ok(Value::Callable(callable));
            }
            let id = list.new_table();
            known.insert(pointer, id);
            let slot = list.reference(id);
            for pair in table.pairs::<LuaValue, LuaValue>() {
                let (key, value) = pair?;
                let key = read_value(lua, list, key, known)?;
                let value = read_value(lua, list, value, known)?;
                if let Some(body) = list.table_mut(id) {
                    body.insert(key, value);
                }
            }
            slot
        }
        LuaValue::Function(function) => {
            let resource = host(lua)?.resource;
            let handle = anchor(lua, function)?;
            Value::Callable(Callable::InterpreterFunction { resource, handle })
        }
        // threads, full userdata and error objects have no portable form
        _ => Value::Nil,
    };
    Ok(value)
}

// ============================================================================
// ValueList -> Lua
// ============================================================================

pub(crate) fn push_multi(lua: &Lua, list: &ValueList) -> mlua::Result<MultiValue> {
    let mut cache = HashMap::new();
    let values = list
        .iter()
        .map(|value| push_value(lua, list, value, &mut cache))
        .collect::<mlua::Result<Vec<_>>>()?;
    Ok(MultiValue::from_vec(values))
}

pub(crate) fn push_value(
    lua: &Lua,
    list: &ValueList,
    value: &Value,
    cache: &mut HashMap<TableId, Table>,
) -> mlua::Result<LuaValue> {
    let pushed = match value {
        Value::Nil => LuaValue::Nil,
        Value::Boolean(b) => LuaValue::Boolean(*b),
        Value::Number(n) => {
            if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n < i64::MAX as f64 {
                LuaValue::Integer(*n as i64)
            } else {
                LuaValue::Number(*n)
            }
        }
        Value::String(s) => LuaValue::String(lua.create_string(s)?),
        Value::Table(table) => {
            if let Some(existing) = cache.get(&table.id) {
                return Ok(LuaValue::Table(existing.clone()));
            }
            let target = lua.create_table()?;
            cache.insert(table.id, target.clone());
            if let Some(body) = list.table(table.id) {
                for (key, value) in body.pairs() {
                    let key = push_value(lua, list, key, cache)?;
                    if matches!(key, LuaValue::Nil) || matches!(key, LuaValue::Number(n) if n.is_nan())
                    {
                        continue;
                    }
                    let value = push_value(lua, list, value, cache)?;
                    target.raw_set(key, value)?;
                }
            }
            LuaValue::Table(target)
        }
        Value::Callable(callable) => dispatch::callable_table(lua, *callable)?,
        Value::Handle(handle) => handle_pointer(handle.to_bits()),
    };
    Ok(pushed)
}
