//! WebAssembly sandbox bridge.
//!
//! A [`Sandbox`] is one resource's instantiated module. Host functions it
//! imports are registered on a [`SandboxBuilder`] with an ABI signature
//! string and a handler that reads its arguments through an [`ArgStream`].
//! Sandbox exports leave the sandbox as
//! [`Callable::ForeignFunction`](crate::Callable::ForeignFunction).

mod args;
pub mod bindings;
mod memory;
pub mod packed;
mod sandbox;
mod signature;

pub use args::{ArgError, ArgStream, Ret, Trap};
pub use memory::{BufferMemory, GuestExports, GuestMemory, LinearMemory, MemoryError};
pub use packed::{PackError, PackedList};
pub use sandbox::{
    Handler, InterfaceBuilder, Sandbox, SandboxBuilder, SandboxError, SANDBOX_MODULE,
};
pub use signature::{Kind, Signature, SignatureError};

use std::rc::Weak;

use crate::config::Limits;
use crate::directory::Directory;
use crate::value::ResourceId;

/// Store data of a sandbox: who owns it and where to resolve references.
#[derive(Clone)]
pub struct SandboxContext {
    pub resource: ResourceId,
    pub directory: Weak<dyn Directory>,
    pub limits: Limits,
}
