//! Message envelopes exchanged between contexts, and the self-describing
//! value type that carries RPC arguments and results.

use std::fmt;

use speedy::{Readable, Writable};

use crate::address::{Address, RequestId};

/// Self-describing, type-preserving value.
///
/// `RpcValue` carries method arguments, return values, task settings and
/// status, and encoded object descriptors across the wire. The tagged
/// binary encoding round-trips exactly between peers.
#[derive(Debug, Clone, PartialEq, Readable, Writable)]
#[speedy(tag_type = u8)]
pub enum RpcValue {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
  Bytes(Vec<u8>),
  List(Vec<RpcValue>),
  Map(Vec<(String, RpcValue)>),
}

impl RpcValue {
  pub fn is_null(&self) -> bool {
    matches!(self, RpcValue::Null)
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      RpcValue::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      RpcValue::Int(i) => Some(*i),
      _ => None,
    }
  }

  pub fn as_f64(&self) -> Option<f64> {
    match self {
      RpcValue::Float(f) => Some(*f),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      RpcValue::Str(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_bytes(&self) -> Option<&[u8]> {
    match self {
      RpcValue::Bytes(b) => Some(b),
      _ => None,
    }
  }

  pub fn as_list(&self) -> Option<&[RpcValue]> {
    match self {
      RpcValue::List(items) => Some(items),
      _ => None,
    }
  }

  /// Look up an entry of a `Map` value by key.
  pub fn get(&self, key: &str) -> Option<&RpcValue> {
    match self {
      RpcValue::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
      _ => None,
    }
  }

  /// Short type name of this value, for error messages.
  pub fn type_name(&self) -> &'static str {
    match self {
      RpcValue::Null => "null",
      RpcValue::Bool(_) => "bool",
      RpcValue::Int(_) => "int",
      RpcValue::Float(_) => "float",
      RpcValue::Str(_) => "str",
      RpcValue::Bytes(_) => "bytes",
      RpcValue::List(_) => "list",
      RpcValue::Map(_) => "map",
    }
  }
}

impl From<()> for RpcValue {
  fn from(_: ()) -> Self {
    RpcValue::Null
  }
}

impl From<bool> for RpcValue {
  fn from(v: bool) -> Self {
    RpcValue::Bool(v)
  }
}

impl From<i64> for RpcValue {
  fn from(v: i64) -> Self {
    RpcValue::Int(v)
  }
}

impl From<i32> for RpcValue {
  fn from(v: i32) -> Self {
    RpcValue::Int(v.into())
  }
}

impl From<u32> for RpcValue {
  fn from(v: u32) -> Self {
    RpcValue::Int(v.into())
  }
}

impl From<f64> for RpcValue {
  fn from(v: f64) -> Self {
    RpcValue::Float(v)
  }
}

impl From<&str> for RpcValue {
  fn from(v: &str) -> Self {
    RpcValue::Str(v.to_string())
  }
}

impl From<String> for RpcValue {
  fn from(v: String) -> Self {
    RpcValue::Str(v)
  }
}

impl From<Vec<u8>> for RpcValue {
  fn from(v: Vec<u8>) -> Self {
    RpcValue::Bytes(v)
  }
}

impl From<Vec<RpcValue>> for RpcValue {
  fn from(v: Vec<RpcValue>) -> Self {
    RpcValue::List(v)
  }
}

/// Positional and keyword arguments of an RPC method call.
#[derive(Debug, Clone, Default, PartialEq, Readable, Writable)]
pub struct CallArgs {
  pub args: Vec<RpcValue>,
  pub kwargs: Vec<(String, RpcValue)>,
}

impl CallArgs {
  pub fn positional(args: Vec<RpcValue>) -> Self {
    Self {
      args,
      kwargs: Vec::new(),
    }
  }

  pub fn none() -> Self {
    Self::default()
  }

  pub fn arg(&self, index: usize) -> Option<&RpcValue> {
    self.args.get(index)
  }

  pub fn kwarg(&self, name: &str) -> Option<&RpcValue> {
    self
      .kwargs
      .iter()
      .find(|(k, _)| k == name)
      .map(|(_, v)| v)
  }

  /// Fetch a required positional argument, as a `TypeError` if missing.
  pub fn require(&self, index: usize) -> Result<&RpcValue, crate::error::Error> {
    self.arg(index).ok_or_else(|| {
      crate::error::Error::Remote(RemoteError::new(
        "TypeError",
        &format!("missing positional argument {index}"),
      ))
    })
  }

  /// Fetch a required `Float` argument.
  pub fn require_f64(&self, index: usize) -> Result<f64, crate::error::Error> {
    let value = self.require(index)?;
    value.as_f64().ok_or_else(|| {
      crate::error::Error::Remote(RemoteError::new(
        "TypeError",
        &format!("argument {index} must be float, got {}", value.type_name()),
      ))
    })
  }

  /// Fetch a required `Int` argument.
  pub fn require_i64(&self, index: usize) -> Result<i64, crate::error::Error> {
    let value = self.require(index)?;
    value.as_i64().ok_or_else(|| {
      crate::error::Error::Remote(RemoteError::new(
        "TypeError",
        &format!("argument {index} must be int, got {}", value.type_name()),
      ))
    })
  }

  /// Fetch a required `Str` argument.
  pub fn require_str(&self, index: usize) -> Result<&str, crate::error::Error> {
    let value = self.require(index)?;
    value.as_str().ok_or_else(|| {
      crate::error::Error::Remote(RemoteError::new(
        "TypeError",
        &format!("argument {index} must be str, got {}", value.type_name()),
      ))
    })
  }
}

/// Serialized form of an error raised by a remote RPC method.
///
/// The `kind` string restores well-known error variants on the caller
/// side; unknown kinds surface as a generic remote error with the message.
#[derive(Debug, Clone, PartialEq, Readable, Writable)]
pub struct RemoteError {
  pub kind: String,
  pub message: String,
}

impl RemoteError {
  pub fn new(kind: &str, message: &str) -> Self {
    Self {
      kind: kind.to_string(),
      message: message.to_string(),
    }
  }
}

impl fmt::Display for RemoteError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.kind, self.message)
  }
}

impl std::error::Error for RemoteError {}

/// Token string of the placeholder returned when a lock request is refused.
pub const ACCESS_DENIED_TOKEN: &str = "__ACCESS_DENIED__";

/// Token string of the placeholder returned on a lock query of a locked
/// object. The real token is never revealed.
pub const OBJECT_LOCKED_TOKEN: &str = "__OBJECT_LOCKED__";

/// Lock token guarding RPC method dispatch on a specific object.
///
/// Equality is by value, so a token can be transferred between proxies and
/// processes whose contexts share a name.
#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct LockToken {
  pub context_id: String,
  pub token: String,
}

impl LockToken {
  pub fn new(context_id: impl Into<String>, token: impl Into<String>) -> Self {
    Self {
      context_id: context_id.into(),
      token: token.into(),
    }
  }

  pub fn access_denied(context_id: &str) -> Self {
    Self::new(context_id, ACCESS_DENIED_TOKEN)
  }

  pub fn object_locked(context_id: &str) -> Self {
    Self::new(context_id, OBJECT_LOCKED_TOKEN)
  }

  pub fn is_placeholder(&self) -> bool {
    self.token == ACCESS_DENIED_TOKEN || self.token == OBJECT_LOCKED_TOKEN
  }
}

impl fmt::Display for LockToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.context_id, self.token)
  }
}

/// Outcome of an RPC method invocation, carried in [`MethodRpcReply`].
#[derive(Debug, Clone, PartialEq, Readable, Writable)]
#[speedy(tag_type = u8)]
pub enum RpcOutcome {
  Value(RpcValue),
  Exception(RemoteError),
  ObjectLocked,
}

/// Action requested on the lock state of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Readable, Writable)]
#[speedy(tag_type = u8)]
pub enum LockAction {
  Acquire,
  Release,
  ForceRelease,
  Query,
}

/// Initial handshake exchanged on each new TCP connection, before any
/// other message. It has no destination address.
#[derive(Debug, Clone, PartialEq, Readable, Writable)]
pub struct Handshake {
  pub version: String,
  pub is_server: bool,
}

#[derive(Debug, Clone, PartialEq, Readable, Writable)]
pub struct MethodRpcRequest {
  pub request_id: RequestId,
  pub method: String,
  pub call: CallArgs,
  pub lock_token: Option<LockToken>,
}

#[derive(Debug, Clone, PartialEq, Readable, Writable)]
pub struct MethodRpcReply {
  pub request_id: RequestId,
  pub outcome: RpcOutcome,
}

#[derive(Debug, Clone, PartialEq, Readable, Writable)]
pub struct LockRpcRequest {
  pub request_id: RequestId,
  pub action: LockAction,
  pub lock_token: Option<LockToken>,
}

/// Reply to a lock request, carrying the lock state after the action.
///
/// If an acquire was granted, the returned token equals the requested one;
/// a release that succeeded returns `None`; a refused request returns the
/// access-denied placeholder; a query of a locked object returns the
/// object-locked placeholder, never the real token.
#[derive(Debug, Clone, PartialEq, Readable, Writable)]
pub struct LockRpcReply {
  pub request_id: RequestId,
  pub lock_token: Option<LockToken>,
}

#[derive(Debug, Clone, PartialEq, Readable, Writable)]
pub struct SignalMessage {
  pub signal_name: String,
  pub args: Vec<RpcValue>,
}

#[derive(Debug, Clone, PartialEq, Readable, Writable)]
pub struct SignalSubscriptionRequest {
  pub request_id: RequestId,
  pub publisher_name: String,
  pub signal_name: String,
  pub subscribe: bool,
}

#[derive(Debug, Clone, PartialEq, Readable, Writable)]
pub struct SignalSubscriptionReply {
  pub request_id: RequestId,
  pub success: bool,
  pub error_msg: String,
}

/// Notification to remote subscribers that a publisher no longer exists.
#[derive(Debug, Clone, PartialEq, Readable, Writable)]
pub struct SignalRemoved {
  pub publisher_name: String,
  pub signal_name: String,
}

/// Reply generated when a request can not be processed: the destination is
/// unreachable, the connection was lost before a reply arrived, or the
/// receiving worker shut down with the request still queued.
#[derive(Debug, Clone, PartialEq, Readable, Writable)]
pub struct ErrorReply {
  pub request_id: RequestId,
  pub error_msg: String,
}

#[derive(Debug, Clone, PartialEq, Readable, Writable)]
#[speedy(tag_type = u8)]
pub enum MessageBody {
  Handshake(Handshake),
  MethodRpcRequest(MethodRpcRequest),
  MethodRpcReply(MethodRpcReply),
  LockRpcRequest(LockRpcRequest),
  LockRpcReply(LockRpcReply),
  Signal(SignalMessage),
  SignalSubscriptionRequest(SignalSubscriptionRequest),
  SignalSubscriptionReply(SignalSubscriptionReply),
  SignalRemoved(SignalRemoved),
  ErrorReply(ErrorReply),
}

/// A message routed between named objects, within one context or across
/// peer contexts.
#[derive(Debug, Clone, PartialEq, Readable, Writable)]
pub struct Message {
  pub source: Address,
  pub destination: Address,
  pub body: MessageBody,
}

impl Message {
  pub fn new(source: Address, destination: Address, body: MessageBody) -> Self {
    Self {
      source,
      destination,
      body,
    }
  }

  /// Build the handshake greeting sent on a new connection.
  pub fn handshake(context_name: &str, version: &str, is_server: bool) -> Self {
    Self {
      source: Address::new(context_name, "$router"),
      destination: Address::new("", ""),
      body: MessageBody::Handshake(Handshake {
        version: version.to_string(),
        is_server,
      }),
    }
  }

  /// Request id of this message, if it is a request.
  pub fn request_id(&self) -> Option<RequestId> {
    match &self.body {
      MessageBody::MethodRpcRequest(m) => Some(m.request_id),
      MessageBody::LockRpcRequest(m) => Some(m.request_id),
      MessageBody::SignalSubscriptionRequest(m) => Some(m.request_id),
      _ => None,
    }
  }

  /// Request id this message answers, if it is a reply.
  pub fn reply_request_id(&self) -> Option<RequestId> {
    match &self.body {
      MessageBody::MethodRpcReply(m) => Some(m.request_id),
      MessageBody::LockRpcReply(m) => Some(m.request_id),
      MessageBody::SignalSubscriptionReply(m) => Some(m.request_id),
      MessageBody::ErrorReply(m) => Some(m.request_id),
      _ => None,
    }
  }

  pub fn is_request(&self) -> bool {
    self.request_id().is_some()
  }

  pub fn is_reply(&self) -> bool {
    self.reply_request_id().is_some()
  }

  /// Build an error reply answering `request`, with source and destination
  /// swapped.
  pub fn error_reply_to(request: &Message, error_msg: &str) -> Option<Message> {
    request.request_id().map(|request_id| Message {
      source: request.destination.clone(),
      destination: request.source.clone(),
      body: MessageBody::ErrorReply(ErrorReply {
        request_id,
        error_msg: error_msg.to_string(),
      }),
    })
  }
}

#[cfg(test)]
mod tests {
  use speedy::{Readable, Writable};

  use super::*;

  #[test]
  fn method_request_roundtrip() {
    let msg = Message::new(
      Address::new("c2", "$future_1"),
      Address::new("c1", "tc1"),
      MessageBody::MethodRpcRequest(MethodRpcRequest {
        request_id: RequestId(0x0123_4567_89ab_cdef),
        method: "remote_sqrt".to_string(),
        call: CallArgs::positional(vec![RpcValue::Float(256.0)]),
        lock_token: Some(LockToken::new("c2", "$lock_1")),
      }),
    );
    let bytes = msg.write_to_vec().unwrap();
    let back = Message::read_from_buffer(&bytes).unwrap();
    assert_eq!(back, msg);
  }

  #[test]
  fn nested_value_roundtrip() {
    let value = RpcValue::Map(vec![
      ("amplitude".to_string(), RpcValue::Float(1.5)),
      ("label".to_string(), RpcValue::Str("sine".to_string())),
      (
        "samples".to_string(),
        RpcValue::List(vec![RpcValue::Int(-1), RpcValue::Null, RpcValue::Bool(true)]),
      ),
    ]);
    let bytes = value.write_to_vec().unwrap();
    assert_eq!(RpcValue::read_from_buffer(&bytes).unwrap(), value);
  }

  #[test]
  fn error_reply_swaps_addresses() {
    let request = Message::new(
      Address::new("c1", "$pubsub"),
      Address::new("c2", "$pubsub"),
      MessageBody::SignalSubscriptionRequest(SignalSubscriptionRequest {
        request_id: RequestId(7),
        publisher_name: "pub1".to_string(),
        signal_name: "sig1".to_string(),
        subscribe: true,
      }),
    );
    let reply = Message::error_reply_to(&request, "no route").unwrap();
    assert_eq!(reply.source, request.destination);
    assert_eq!(reply.destination, request.source);
    assert_eq!(reply.reply_request_id(), Some(RequestId(7)));
    assert!(!reply.is_request());
  }

  #[test]
  fn handshake_has_no_destination() {
    let msg = Message::handshake("c1", "0.3.1", true);
    assert_eq!(msg.source, Address::new("c1", "$router"));
    assert_eq!(msg.destination, Address::new("", ""));
    assert!(!msg.is_request() && !msg.is_reply());
  }
}
