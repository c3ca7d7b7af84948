// File: src/runtime/mod.rs
//
// Runtime object model and host integration for the Strand VM.

pub mod async_bridge;
pub mod context;
pub mod natives;
pub mod object;

pub use async_bridge::{AsyncBridge, Completion, HostValue};
pub use context::{ErrorKind, RuntimeContext};
pub use natives::{NativeCtx, NativeFunction, NativeKind, NativeRegistry};
pub use object::{Instance, MapKey, SClass, Storage};
