//! Scriptwire: dynamic value interchange for a scripted game server
//!
//! Script values travel between a resource's Lua interpreter, its
//! WebAssembly sandbox, the network wire and persisted JSON. Every hop goes
//! through one intermediate representation, the [`ValueList`].
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   ┌────────────────┐   ┌────────────────┐
//! │  interp (Lua)  │   │ foreign (wasm) │   │ codec          │
//! │  read / push   │   │ ArgStream,     │   │ binary: wire   │
//! │  dispatcher    │   │ packed lists   │   │ text:   JSON   │
//! └───────┬────────┘   └───────┬────────┘   └───────┬────────┘
//!         └──────────── ValueList + Callable ───────┘
//!                             │
//!                       Directory (entities, resources)
//! ```
//!
//! Tables live in the list's arena and are addressed by index, so shared
//! and self-referencing tables survive every hop that supports them.

pub mod callable;
pub mod codec;
pub mod config;
pub mod directory;
pub mod error;
pub mod foreign;
pub mod interp;
pub mod value;

pub use callable::{Callable, CallableHash, ForeignFunctionId, HashError, CALLABLE_HASH_LEN};
pub use codec::{BinaryCodec, Failure, Report, TextCodec};
pub use config::{Limits, TextOptions};
pub use directory::{Directory, Registry};
pub use error::{CallError, WireError};
pub use foreign::{ArgStream, Sandbox, SandboxBuilder, Signature, Trap};
pub use interp::Interpreter;
pub use value::{
    EntityId, ForeignHandle, ResourceId, Table, TableId, TableRef, Value, ValueKind, ValueList,
};

pub use scriptwire_bits::{BitStream, StreamError};
