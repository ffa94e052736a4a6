//! A native Rust instrument-control messaging runtime.
//!
//! `labmesh` hosts named objects inside a per-process [`Context`], routes
//! typed messages between them, dispatches remote procedure calls with
//! cooperative locking, and disseminates publish/subscribe signals across
//! a mesh of peer contexts connected by TCP. Contexts find each other
//! through a UDP discovery protocol.
//!
//! # Example
//!
//! ```no_run
//! use labmesh::{CallArgs, Config, Context, MethodTable, RpcService, RpcValue};
//!
//! struct Doubler;
//!
//! impl RpcService for Doubler {
//!   fn class_name() -> &'static str {
//!     "Doubler"
//!   }
//!   fn method_table() -> MethodTable<Self> {
//!     MethodTable::new().method(
//!       "double",
//!       "(x: int) -> int",
//!       "Return twice the argument.",
//!       |_service, call: CallArgs| Ok(RpcValue::Int(call.require_i64(0)? * 2)),
//!     )
//!   }
//! }
//!
//! fn main() -> Result<(), labmesh::Error> {
//!   let context = Context::new("demo", Config::default())?;
//!   context.start()?;
//!   let proxy = context.make_rpc_object("doubler", || Ok(Doubler))?;
//!   assert_eq!(proxy.call("double", vec![RpcValue::Int(21)])?, RpcValue::Int(42));
//!   context.stop()?;
//!   Ok(())
//! }
//! ```

pub mod address;
pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod message;
pub mod messaging;
pub mod proxy;
pub mod pubsub;
pub mod rpc;
pub mod task;

pub(crate) mod worker;

/// Version of this crate; exchanged in connection handshakes and
/// reported by the `$context` object.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use address::Address;
pub use config::{Config, ContextConfig};
pub use context::Context;
pub use error::{Error, Result};
pub use message::{CallArgs, LockToken, Message, RemoteError, RpcValue};
pub use proxy::{RpcFuture, RpcProxy};
pub use pubsub::{
  DiscardPolicy, ReceivedSignal, RegisteredSignal, SignalReceiver, SignalSubscriber,
};
pub use rpc::{
  MethodTable, RpcInterface, RpcObjectDescriptor, RpcService, RpcSignalDescriptor,
};
pub use task::{
  LoopTask, MissedLoopPolicy, Task, TaskContext, TaskProxy, TaskRunner, TaskState,
};
