//! Error types used throughout the crate.

use crate::message::RemoteError;

/// Result type with the crate-wide [`Error`] as the default error.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors produced by the messaging core.
///
/// The variants follow the failure categories of the runtime: caller
/// mistakes (`Usage`, `WrongThread`, `InvalidOperation`), naming problems
/// (`DuplicateName`, `UnknownName`), routing and wire failures
/// (`MessageDelivery`, `Protocol`, `Io`), RPC outcomes (`RpcTimeout`,
/// `UnknownRpc`, `Remote`, `ObjectLocked`) and task lifecycle failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
  /// A precondition of the public API was violated by the caller.
  #[error("usage error: {0}")]
  Usage(String),

  /// A required configuration field is missing or self-referential.
  #[error("configuration error: {0}")]
  Configuration(String),

  /// An object or message-handler name is already in use.
  #[error("duplicate name: {0}")]
  DuplicateName(String),

  /// A named object or peer context does not exist.
  #[error("unknown name: {0}")]
  UnknownName(String),

  /// The operation is not valid in the current lifecycle state.
  #[error("invalid operation: {0}")]
  InvalidOperation(String),

  /// A context-thread-only method was called from another thread.
  #[error("wrong thread: {0}")]
  WrongThread(String),

  /// A message could not be routed to its destination.
  #[error("message delivery failed: {0}")]
  MessageDelivery(String),

  /// A blocking RPC call did not complete within its timeout.
  #[error("timeout in RPC call")]
  RpcTimeout,

  /// The requested method does not exist or is not RPC-callable.
  #[error("unknown RPC method: {0}")]
  UnknownRpc(String),

  /// A remote signal subscription was refused.
  #[error("signal subscription failed: {0}")]
  SignalSubscription(String),

  /// A non-RPC wait expired (e.g. waiting for a signal).
  #[error("timeout")]
  Timeout,

  /// The current task received a cooperative stop request.
  ///
  /// This is a control-flow signal, not a failure: task code is expected
  /// to let it propagate out of `run()`, where the task worker treats it
  /// as an orderly stop.
  #[error("task stop requested")]
  TaskStop,

  /// Constructing a task instance failed.
  #[error("failed to initialize task {name}: {source}")]
  TaskInit {
    name: String,
    #[source]
    source: Box<Error>,
  },

  /// The task's `run()` method failed.
  #[error("task {name} failed: {source}")]
  TaskRun {
    name: String,
    #[source]
    source: Box<Error>,
  },

  /// An error raised by a remote RPC method, re-raised locally.
  #[error("{0}")]
  Remote(RemoteError),

  /// An RPC method call was refused because the object is locked by
  /// another proxy.
  #[error("the object is locked by another proxy")]
  ObjectLocked,

  /// The peer violated the wire protocol.
  #[error("protocol violation: {0}")]
  Protocol(String),

  /// An I/O error, reduced to its message so errors stay cloneable
  /// (futures and worker init results hand the same error to several
  /// waiters).
  #[error("I/O error: {0}")]
  Io(String),
}

impl From<std::io::Error> for Error {
  fn from(e: std::io::Error) -> Self {
    Error::Io(e.to_string())
  }
}

impl Error {
  /// Encode this error for transport in an RPC reply.
  ///
  /// The kind string allows the receiving side to restore well-known
  /// variants; everything else becomes a generic remote error.
  pub(crate) fn to_remote(&self) -> RemoteError {
    match self {
      Error::Remote(remote) => remote.clone(),
      Error::UnknownRpc(msg) => RemoteError::new("UnknownRpcError", msg),
      Error::TaskStop => RemoteError::new("TaskStopError", "task stop requested"),
      other => RemoteError::new("Error", &other.to_string()),
    }
  }
}

impl From<RemoteError> for Error {
  fn from(remote: RemoteError) -> Self {
    // Restore well-known error kinds so callers can match on them.
    match remote.kind.as_str() {
      "UnknownRpcError" => Error::UnknownRpc(remote.message),
      "TaskStopError" => Error::TaskStop,
      _ => Error::Remote(remote),
    }
  }
}
