//! # Lua Bridge
//!
//! A dynamic value bridge between a Rust host and an embedded Lua engine.
//!
//! ## Features
//!
//! - **Dynamic values**: [`DynamicValue`] is the single exchange type, a tagged union of
//!   scalars, strings, byte data, arrays, maps, host objects, opaque pointers, functions
//!   and multi-value tuples
//! - **Marshalling**: lossless host → engine → host conversion with cycle and depth checks;
//!   Nil array elements and map values travel as a shared placeholder, and byte data supports
//!   `..` and `string` methods (`buf:byte(1)`) inside scripts
//! - **Native functions**: host closures registered under (optionally dotted) global names
//!   and called from scripts like ordinary Lua functions
//! - **Execution**: string and file evaluation with line-aware compile/runtime errors,
//!   optional instruction budgets and a sandboxed standard library
//! - **Threading**: [`ThreadSafeBridge`] serialises every call onto a dedicated engine thread
//!
//! ### Example
//!
//! ```ignore
//! use lua_bridge::{DynamicValue, ScriptBridge};
//!
//! let mut bridge = ScriptBridge::new()?;
//! bridge.register_method("add", |args: &[DynamicValue]| {
//!     let a: i64 = lua_bridge::registry::argument(args, 0)?;
//!     let b: i64 = lua_bridge::registry::argument(args, 1)?;
//!     Ok(DynamicValue::from(a + b))
//! })?;
//! bridge.eval_string("result = add(2, 3)")?;
//! assert_eq!(bridge.get_global("result")?, DynamicValue::Integer(5));
//! ```
//!
//! ## Modules
//!
//! - [`core`]: error types and shared macros
//! - [`config`]: bridge configuration and logging setup
//! - [`value`]: the dynamic value model
//! - [`codec`]: conversion between dynamic values and engine values
//! - [`registry`]: native function registry and dispatch
//! - [`bridge`]: the script bridge itself
//! - [`worker`]: thread-safe front running the bridge on its own thread

/// Error types and shared macros
pub mod core;
/// Bridge configuration and logging setup
pub mod config;
/// The dynamic value model
pub mod value;
/// Conversion between dynamic values and engine values
pub mod codec;
/// Native function registry and dispatch
pub mod registry;
/// The script bridge
pub mod bridge;
/// Thread-safe front for the script bridge
pub mod worker;

pub use bridge::{BridgeState, ScriptBridge};
pub use config::BridgeConfig;
pub use crate::core::error::{status_of, BridgeError, BridgeResult, ErrorKind};
pub use registry::{HandlerError, HandlerResult, NativeFunction};
pub use value::{
    DynamicValue, ErrorValue, FunctionRef, HostObject, OpaquePtr, ScriptFunction, ValueMap,
    ValueType,
};
pub use worker::ThreadSafeBridge;
