//! Function values that cross runtime boundaries.
//!
//! A [`Callable`] names a function living either in a resource's Lua
//! interpreter or in its WebAssembly sandbox. Its identity hash is a fixed
//! 21-byte field serialization, not a digest:
//!
//! ```text
//! "CALL" | resource id: u64 LE | handle or function id: u64 LE | flag: u8
//! ```
//!
//! The flag is 0 for interpreter functions and 1 for sandbox functions.

use std::fmt;

use thiserror::Error;

use crate::directory::Directory;
use crate::error::CallError;
use crate::value::{ResourceId, ValueList};

pub const CALLABLE_HASH_LEN: usize = 21;
const HASH_HEADER: [u8; 4] = *b"CALL";

/// Identity of an exported sandbox function, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForeignFunctionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Callable {
    /// A function anchored in a resource's interpreter.
    InterpreterFunction { resource: ResourceId, handle: u64 },
    /// An exported function of a resource's sandbox.
    ForeignFunction {
        resource: ResourceId,
        function: ForeignFunctionId,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    #[error("Callable hash must be {CALLABLE_HASH_LEN} bytes, got {0}")]
    Length(usize),

    #[error("Callable hash header mismatch")]
    Header,

    #[error("Callable hash names unknown resource {0}")]
    UnknownResource(u64),

    #[error("Callable hash has a null reference")]
    NullReference,

    #[error("Callable hash has invalid variant flag {0}")]
    Flag(u8),
}

/// The 21-byte identity of a callable. Usable as a map key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallableHash([u8; CALLABLE_HASH_LEN]);

impl CallableHash {
    pub fn as_bytes(&self) -> &[u8; CALLABLE_HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for CallableHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallableHash(")?;
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

impl Callable {
    pub fn resource(&self) -> ResourceId {
        match *self {
            Callable::InterpreterFunction { resource, .. } => resource,
            Callable::ForeignFunction { resource, .. } => resource,
        }
    }

    pub fn is_foreign(&self) -> bool {
        matches!(self, Callable::ForeignFunction { .. })
    }

    pub fn write_hash(&self) -> CallableHash {
        let (resource, reference, flag) = match *self {
            Callable::InterpreterFunction { resource, handle } => (resource, handle, 0u8),
            Callable::ForeignFunction { resource, function } => (resource, function.0, 1u8),
        };
        let mut bytes = [0u8; CALLABLE_HASH_LEN];
        bytes[0..4].copy_from_slice(&HASH_HEADER);
        bytes[4..12].copy_from_slice(&(resource.0 as u64).to_le_bytes());
        bytes[12..20].copy_from_slice(&reference.to_le_bytes());
        bytes[20] = flag;
        CallableHash(bytes)
    }

    /// Rebuild a callable from its identity hash.
    ///
    /// Fails when the header is wrong, the resource is unknown to
    /// `directory`, or the reference is zero.
    pub fn read_hash(bytes: &[u8], directory: &dyn Directory) -> Result<Callable, HashError> {
        if bytes.len() != CALLABLE_HASH_LEN {
            return Err(HashError::Length(bytes.len()));
        }
        if bytes[0..4] != HASH_HEADER {
            return Err(HashError::Header);
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[4..12]);
        let raw_resource = u64::from_le_bytes(word);
        word.copy_from_slice(&bytes[12..20]);
        let reference = u64::from_le_bytes(word);

        let resource = u32::try_from(raw_resource)
            .ok()
            .map(ResourceId)
            .filter(|id| directory.resource_name(*id).is_some())
            .ok_or(HashError::UnknownResource(raw_resource))?;
        if reference == 0 {
            return Err(HashError::NullReference);
        }
        match bytes[20] {
            0 => Ok(Callable::InterpreterFunction {
                resource,
                handle: reference,
            }),
            1 => Ok(Callable::ForeignFunction {
                resource,
                function: ForeignFunctionId(reference),
            }),
            flag => Err(HashError::Flag(flag)),
        }
    }

    /// Invoke the function in whichever runtime owns it.
    ///
    /// Fails when the owning resource is stopped or has no matching runtime,
    /// when the reference is stale, or when the function itself raises.
    pub fn call(&self, directory: &dyn Directory, args: &ValueList) -> Result<ValueList, CallError> {
        let resource = self.resource();
        if !directory.resource_active(resource) {
            return Err(CallError::ResourceInactive(resource));
        }
        match *self {
            Callable::InterpreterFunction { handle, .. } => directory
                .interpreter(resource)
                .ok_or(CallError::NoRuntime(resource, "interpreter"))?
                .call_function(handle, args),
            Callable::ForeignFunction { function, .. } => directory
                .sandbox(resource)
                .ok_or(CallError::NoRuntime(resource, "sandbox"))?
                .call(function, args),
        }
    }
}
