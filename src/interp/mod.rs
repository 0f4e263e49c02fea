//! Lua interpreter bridge.
//!
//! An [`Interpreter`] is one resource's Lua state. Values leave Lua through
//! [`read_arguments`](Interpreter::read_arguments) and enter it through
//! [`push_arguments`](Interpreter::push_arguments). Lua functions that leave
//! the interpreter are anchored under a numeric handle and travel as
//! [`Callable::InterpreterFunction`](crate::Callable::InterpreterFunction).
//!
//! Scripts also get `toJSON(value [, pretty])` and `fromJSON(text)`, backed
//! by the text codec.

mod convert;
mod dispatch;

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Weak;

use mlua::{AppDataRef, Function, Lua, MultiValue, Value as LuaValue};
use tracing::{debug, warn};

use crate::codec::TextCodec;
use crate::config::TextOptions;
use crate::directory::Directory;
use crate::error::CallError;
use crate::value::{ResourceId, Value, ValueList};

pub(crate) struct HostState {
    pub(crate) resource: ResourceId,
    pub(crate) directory: Weak<dyn Directory>,
    pub(crate) next_ref: Cell<u64>,
}

pub(crate) fn host(lua: &Lua) -> mlua::Result<AppDataRef<'_, HostState>> {
    lua.app_data_ref::<HostState>()
        .ok_or_else(|| mlua::Error::runtime("interpreter host state missing"))
}

/// Readable text of a Lua error, without the callback wrapping.
pub(crate) fn error_message(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(message) => message.clone(),
        mlua::Error::CallbackError { cause, .. } => error_message(cause),
        other => other.to_string(),
    }
}

fn raised(err: mlua::Error) -> CallError {
    CallError::Raised(error_message(&err))
}

pub struct Interpreter {
    lua: Lua,
    resource: ResourceId,
}

impl Interpreter {
    pub fn new(resource: ResourceId, directory: Weak<dyn Directory>) -> mlua::Result<Self> {
        let lua = Lua::new();
        lua.set_app_data(HostState {
            resource,
            directory,
            next_ref: Cell::new(1),
        });
        convert::install(&lua)?;
        dispatch::install(&lua)?;
        install_json(&lua)?;
        debug!(%resource, "interpreter created");
        Ok(Self { lua, resource })
    }

    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    /// The underlying Lua state.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Run a chunk and return whatever it returns.
    pub fn exec(&self, chunk: &str) -> Result<ValueList, CallError> {
        let results: MultiValue = self.lua.load(chunk).eval().map_err(raised)?;
        convert::read_multi(&self.lua, results).map_err(raised)
    }

    pub fn read_arguments(&self, values: MultiValue) -> mlua::Result<ValueList> {
        convert::read_multi(&self.lua, values)
    }

    pub fn push_arguments(&self, list: &ValueList) -> mlua::Result<MultiValue> {
        convert::push_multi(&self.lua, list)
    }

    /// Read a single Lua value into a one-element list.
    pub fn read_value(&self, value: LuaValue) -> mlua::Result<ValueList> {
        convert::read_multi(&self.lua, MultiValue::from_vec(vec![value]))
    }

    /// Push one value carried by `list`.
    pub fn push_value(&self, list: &ValueList, value: &Value) -> mlua::Result<LuaValue> {
        convert::push_value(&self.lua, list, value, &mut HashMap::new())
    }

    /// Anchor a function and return its handle.
    pub fn function_ref(&self, function: Function) -> mlua::Result<u64> {
        convert::anchor(&self.lua, function)
    }

    /// Drop the anchor for `handle`. Returns whether it was anchored.
    pub fn release(&self, handle: u64) -> bool {
        convert::release(&self.lua, handle).unwrap_or(false)
    }

    /// Protected call of an anchored function.
    pub fn call_function(&self, handle: u64, args: &ValueList) -> Result<ValueList, CallError> {
        let function = convert::anchored(&self.lua, handle)
            .map_err(raised)?
            .ok_or(CallError::StaleReference)?;
        self.invoke(&function, args)
    }

    /// Protected call of a global function.
    pub fn call_global(&self, name: &str, args: &ValueList) -> Result<ValueList, CallError> {
        match self.lua.globals().get::<LuaValue>(name).map_err(raised)? {
            LuaValue::Function(function) => self.invoke(&function, args),
            _ => Err(CallError::Raised(format!("global '{name}' is not a function"))),
        }
    }

    fn invoke(&self, function: &Function, args: &ValueList) -> Result<ValueList, CallError> {
        let pushed = convert::push_multi(&self.lua, args).map_err(raised)?;
        let results: MultiValue = function.call(pushed).map_err(|err| {
            debug!(resource = %self.resource, error = %err, "lua call raised");
            raised(err)
        })?;
        convert::read_multi(&self.lua, results).map_err(raised)
    }
}

fn install_json(lua: &Lua) -> mlua::Result<()> {
    let to_json = lua.create_function(|lua, (value, pretty): (LuaValue, Option<bool>)| {
        let Some(directory) = host(lua)?.directory.upgrade() else {
            return Ok(None);
        };
        let list = convert::read_multi(lua, MultiValue::from_vec(vec![value]))?;
        let options = TextOptions {
            serialize: false,
            pretty: pretty.unwrap_or(false),
        };
        let (text, report) = TextCodec::new(&*directory, options)
            .encode_string(&list)
            .map_err(mlua::Error::external)?;
        for failure in &report.failures {
            warn!(resource = %host(lua)?.resource, %failure, "toJSON wrote null");
        }
        Ok(Some(text))
    })?;

    let from_json = lua.create_function(|lua, text: String| {
        let Some(directory) = host(lua)?.directory.upgrade() else {
            return Ok(MultiValue::new());
        };
        match TextCodec::new(&*directory, TextOptions::default()).decode_str(&text) {
            Ok((list, report)) => {
                for failure in &report.failures {
                    warn!(resource = %host(lua)?.resource, %failure, "fromJSON read nil");
                }
                convert::push_multi(lua, &list)
            }
            Err(err) => {
                debug!(%err, "fromJSON rejected document");
                Ok(MultiValue::new())
            }
        }
    })?;

    let globals = lua.globals();
    globals.set("toJSON", to_json)?;
    globals.set("fromJSON", from_json)
}
