//! Callable tables.
//!
//! A [`Callable`] enters Lua as a table
//! `{ resource = <handle>, reference = <handle or id>, free = <cleanup> }`
//! whose metatable routes `__call` through a single dispatcher function.
//! A table is recognised as a callable when its `__call` slot is that exact
//! dispatcher.

use mlua::{Function, Lua, MultiValue, Table, Value as LuaValue};
use tracing::warn;

use super::convert::{self, handle_pointer};
use super::host;
use crate::callable::{Callable, ForeignFunctionId};
use crate::value::ForeignHandle;

const DISPATCH: &str = "scriptwire.dispatch";
const FREE: &str = "scriptwire.free";
const CALLABLE_META: &str = "scriptwire.callable_meta";

pub(crate) fn install(lua: &Lua) -> mlua::Result<()> {
    let dispatch = lua.create_function(dispatch)?;
    let free = lua.create_function(free)?;
    let meta = lua.create_table()?;
    meta.raw_set("__call", dispatch.clone())?;
    lua.set_named_registry_value(DISPATCH, dispatch)?;
    lua.set_named_registry_value(FREE, free)?;
    lua.set_named_registry_value(CALLABLE_META, meta)
}

pub(crate) fn callable_table(lua: &Lua, callable: Callable) -> mlua::Result<LuaValue> {
    let table = lua.create_table()?;
    table.raw_set(
        "resource",
        handle_pointer(ForeignHandle::Resource(callable.resource()).to_bits()),
    )?;
    match callable {
        Callable::InterpreterFunction { handle, .. } => table.raw_set("reference", handle)?,
        Callable::ForeignFunction { function, .. } => {
            table.raw_set("reference", handle_pointer(function.0))?
        }
    }
    table.raw_set("free", lua.named_registry_value::<Function>(FREE)?)?;
    let meta: Table = lua.named_registry_value(CALLABLE_META)?;
    table.set_metatable(Some(meta));
    Ok(LuaValue::Table(table))
}

pub(crate) fn callable_from_table(lua: &Lua, table: &Table) -> mlua::Result<Option<Callable>> {
    let Some(meta) = table.get_metatable() else {
        return Ok(None);
    };
    let LuaValue::Function(call) = meta.raw_get::<LuaValue>("__call")? else {
        return Ok(None);
    };
    let dispatch: Function = lua.named_registry_value(DISPATCH)?;
    if call.to_pointer() != dispatch.to_pointer() {
        return Ok(None);
    }

    let resource = match table.raw_get::<LuaValue>("resource")? {
        LuaValue::LightUserData(ud) => match ForeignHandle::from_bits(ud.0 as usize as u64) {
            Some(ForeignHandle::Resource(id)) => id,
            _ => return Ok(None),
        },
        _ => return Ok(None),
    };
    let callable = match table.raw_get::<LuaValue>("reference")? {
        LuaValue::Integer(handle) if handle > 0 => Callable::InterpreterFunction {
            resource,
            handle: handle as u64,
        },
        LuaValue::Number(handle) if handle >= 1.0 && handle.fract() == 0.0 => {
            Callable::InterpreterFunction {
                resource,
                handle: handle as u64,
            }
        }
        LuaValue::LightUserData(ud) if !ud.0.is_null() => Callable::ForeignFunction {
            resource,
            function: ForeignFunctionId(ud.0 as usize as u64),
        },
        _ => return Ok(None),
    };
    Ok(Some(callable))
}

/// `__call` handler: `callable(args...)`.
fn dispatch(lua: &Lua, args: MultiValue) -> mlua::Result<MultiValue> {
    let mut args = args.into_vec();
    if args.is_empty() {
        return Ok(MultiValue::new());
    }
    let this = args.remove(0);
    let callable = match &this {
        LuaValue::Table(table) => callable_from_table(lua, table)?,
        _ => None,
    };
    let Some(callable) = callable else {
        warn!("call through a malformed callable table");
        return Ok(MultiValue::new());
    };
    let Some(directory) = host(lua)?.directory.upgrade() else {
        warn!("callable invoked after its directory was dropped");
        return Ok(MultiValue::new());
    };
    if !directory.resource_active(callable.resource()) {
        warn!(resource = %callable.resource(), "call to function of inactive resource");
        return Ok(MultiValue::new());
    }

    let list = convert::read_multi(lua, MultiValue::from_vec(args))?;
    match callable.call(&*directory, &list) {
        Ok(results) => convert::push_multi(lua, &results),
        Err(err) => {
            warn!(resource = %callable.resource(), %err, "callable failed");
            Ok(MultiValue::new())
        }
    }
}

/// `callable:free()`: release the anchored function behind the table.
fn free(lua: &Lua, this: LuaValue) -> mlua::Result<bool> {
    let LuaValue::Table(table) = this else {
        return Ok(false);
    };
    let Some(Callable::InterpreterFunction { resource, handle }) =
        callable_from_table(lua, &table)?
    else {
        return Ok(false);
    };
    if host(lua)?.resource == resource {
        return convert::release(lua, handle);
    }
    let directory = host(lua)?.directory.upgrade();
    Ok(directory
        .and_then(|directory| directory.interpreter(resource))
        .is_some_and(|interpreter| interpreter.release(handle)))
}
