//! Server side of the RPC mechanism: service definitions, the per-object
//! worker thread and lock-token enforcement.
//!
//! A service exposes its callable methods through an explicit dispatch
//! table, built once per service type. Each live object is owned by one
//! worker thread; requests delivered to the object's address are queued
//! and handled by that worker, which serializes all access to the object
//! state (including its lock-token slot).

use std::{
  collections::{BTreeMap, VecDeque},
  sync::{Arc, Condvar, Mutex},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  address::Address,
  error::{Error, Result},
  message::{
    CallArgs, LockAction, LockRpcReply, LockRpcRequest, LockToken, Message, MessageBody,
    MethodRpcReply, MethodRpcRequest, RemoteError, RpcOutcome, RpcValue,
  },
  messaging::{MessageHandler, MessageRouter},
  worker::WorkerHandle,
};

/// Description of an exported constant.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcConstantDescriptor {
  pub name: String,
  pub value: RpcValue,
}

/// Description of an RPC-callable method.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcMethodDescriptor {
  pub name: String,
  /// Human-readable signature, e.g. `"(x: float) -> float"`.
  pub signature: String,
  pub doc: String,
}

/// Description of a signal a service may publish.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcSignalDescriptor {
  pub name: String,
  /// Argument type names, e.g. `["int", "str"]`.
  pub arg_types: Vec<String>,
}

/// The RPC-accessible subset of a service's interface.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcInterface {
  pub class_name: String,
  pub doc: String,
  pub constants: Vec<RpcConstantDescriptor>,
  pub methods: Vec<RpcMethodDescriptor>,
  pub signals: Vec<RpcSignalDescriptor>,
}

/// Description of one live RPC object instance.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcObjectDescriptor {
  pub address: Address,
  /// Free-form category name grouping similar objects (`"context"`,
  /// `"task"`, `"instrument"`, ...).
  pub category: Option<String>,
  pub interface: RpcInterface,
}

impl RpcObjectDescriptor {
  /// Encode the descriptor so it can travel as a plain RPC value.
  pub fn to_value(&self) -> RpcValue {
    RpcValue::Map(vec![
      (
        "address".to_string(),
        RpcValue::Str(self.address.to_string()),
      ),
      (
        "category".to_string(),
        match &self.category {
          Some(category) => RpcValue::Str(category.clone()),
          None => RpcValue::Null,
        },
      ),
      ("interface".to_string(), self.interface.to_value()),
    ])
  }

  pub fn from_value(value: &RpcValue) -> Result<Self> {
    let malformed = || Error::Protocol("malformed object descriptor".to_string());
    let address = Address::parse(value.get("address").and_then(RpcValue::as_str).ok_or_else(malformed)?)?;
    let category = match value.get("category") {
      Some(RpcValue::Str(category)) => Some(category.clone()),
      _ => None,
    };
    let interface = RpcInterface::from_value(value.get("interface").ok_or_else(malformed)?)?;
    Ok(Self {
      address,
      category,
      interface,
    })
  }
}

impl RpcInterface {
  pub fn to_value(&self) -> RpcValue {
    let constants = self
      .constants
      .iter()
      .map(|c| {
        RpcValue::Map(vec![
          ("name".to_string(), RpcValue::Str(c.name.clone())),
          ("value".to_string(), c.value.clone()),
        ])
      })
      .collect();
    let methods = self
      .methods
      .iter()
      .map(|m| {
        RpcValue::Map(vec![
          ("name".to_string(), RpcValue::Str(m.name.clone())),
          ("signature".to_string(), RpcValue::Str(m.signature.clone())),
          ("doc".to_string(), RpcValue::Str(m.doc.clone())),
        ])
      })
      .collect();
    let signals = self
      .signals
      .iter()
      .map(|s| {
        RpcValue::Map(vec![
          ("name".to_string(), RpcValue::Str(s.name.clone())),
          (
            "arg_types".to_string(),
            RpcValue::List(s.arg_types.iter().cloned().map(RpcValue::Str).collect()),
          ),
        ])
      })
      .collect();
    RpcValue::Map(vec![
      (
        "class_name".to_string(),
        RpcValue::Str(self.class_name.clone()),
      ),
      ("doc".to_string(), RpcValue::Str(self.doc.clone())),
      ("constants".to_string(), RpcValue::List(constants)),
      ("methods".to_string(), RpcValue::List(methods)),
      ("signals".to_string(), RpcValue::List(signals)),
    ])
  }

  pub fn from_value(value: &RpcValue) -> Result<Self> {
    let malformed = || Error::Protocol("malformed interface descriptor".to_string());
    let str_field = |v: &RpcValue, key: &str| -> Result<String> {
      Ok(v.get(key).and_then(RpcValue::as_str).ok_or_else(malformed)?.to_string())
    };

    let mut constants = Vec::new();
    for entry in value.get("constants").and_then(RpcValue::as_list).ok_or_else(malformed)? {
      constants.push(RpcConstantDescriptor {
        name: str_field(entry, "name")?,
        value: entry.get("value").cloned().unwrap_or(RpcValue::Null),
      });
    }
    let mut methods = Vec::new();
    for entry in value.get("methods").and_then(RpcValue::as_list).ok_or_else(malformed)? {
      methods.push(RpcMethodDescriptor {
        name: str_field(entry, "name")?,
        signature: str_field(entry, "signature")?,
        doc: str_field(entry, "doc")?,
      });
    }
    let mut signals = Vec::new();
    for entry in value.get("signals").and_then(RpcValue::as_list).ok_or_else(malformed)? {
      let mut arg_types = Vec::new();
      for arg in entry.get("arg_types").and_then(RpcValue::as_list).ok_or_else(malformed)? {
        arg_types.push(arg.as_str().ok_or_else(malformed)?.to_string());
      }
      signals.push(RpcSignalDescriptor {
        name: str_field(entry, "name")?,
        arg_types,
      });
    }
    Ok(Self {
      class_name: str_field(value, "class_name")?,
      doc: str_field(value, "doc")?,
      constants,
      methods,
      signals,
    })
  }
}

/// Method names handled at the proxy level; a service may not define them.
const PROTECTED_METHOD_NAMES: [&str; 4] = ["lock", "unlock", "is_locked", "force_unlock"];

/// Methods every service answers without declaring them.
const IMPLICIT_METHODS: [(&str, &str, &str); 2] = [
  ("get_name", "() -> str", "Return the name of this object."),
  (
    "get_signals",
    "() -> list",
    "Return the signals that can be published by this object.",
  ),
];

struct MethodEntry<S> {
  handler: Box<dyn Fn(&mut S, CallArgs) -> Result<RpcValue> + Send>,
  signature: String,
  doc: String,
}

/// Explicit dispatch table of a service type: method name to handler.
///
/// Built once per service class by [`RpcService::method_table`]. Unknown
/// method names at call time yield an `UnknownRpcError` reply.
pub struct MethodTable<S> {
  methods: BTreeMap<String, MethodEntry<S>>,
}

impl<S> Default for MethodTable<S> {
  fn default() -> Self {
    Self::new()
  }
}

impl<S> MethodTable<S> {
  pub fn new() -> Self {
    Self {
      methods: BTreeMap::new(),
    }
  }

  /// Add a method to the table. Panics on a duplicate or protected name;
  /// both are service-definition mistakes.
  pub fn method(
    mut self,
    name: &str,
    signature: &str,
    doc: &str,
    handler: impl Fn(&mut S, CallArgs) -> Result<RpcValue> + Send + 'static,
  ) -> Self {
    assert!(
      !PROTECTED_METHOD_NAMES.contains(&name),
      "{name} is a protected method name"
    );
    assert!(
      !self.methods.contains_key(name),
      "duplicate RPC method name {name}"
    );
    self.methods.insert(
      name.to_string(),
      MethodEntry {
        handler: Box::new(handler),
        signature: signature.to_string(),
        doc: doc.to_string(),
      },
    );
    self
  }

  fn descriptors(&self) -> Vec<RpcMethodDescriptor> {
    self
      .methods
      .iter()
      .map(|(name, entry)| RpcMethodDescriptor {
        name: name.clone(),
        signature: entry.signature.clone(),
        doc: entry.doc.clone(),
      })
      .collect()
  }
}

/// A server-side object whose methods can be called via RPC.
///
/// Implementations describe their interface statically (dispatch table,
/// signals, constants) and are hosted by a dedicated worker thread, which
/// is the only thread that ever touches the object after construction.
pub trait RpcService: Send + 'static {
  /// Class name reported in the object descriptor.
  fn class_name() -> &'static str
  where
    Self: Sized;

  /// Docstring reported in the object descriptor.
  fn doc() -> &'static str
  where
    Self: Sized,
  {
    ""
  }

  /// Category grouping similar objects, e.g. `"instrument"`.
  fn category() -> Option<&'static str>
  where
    Self: Sized,
  {
    None
  }

  fn method_table() -> MethodTable<Self>
  where
    Self: Sized;

  /// Signals this service may publish.
  fn signals() -> Vec<RpcSignalDescriptor>
  where
    Self: Sized,
  {
    Vec::new()
  }

  /// Constants exported to proxies.
  fn constants() -> Vec<RpcConstantDescriptor>
  where
    Self: Sized,
  {
    Vec::new()
  }

  /// Called by the worker just before the object is removed from the
  /// context. Release resources here.
  fn release(&mut self) {}
}

/// Build the full object descriptor of a service type at `address`.
pub(crate) fn make_descriptor<S: RpcService>(
  address: Address,
  table: &MethodTable<S>,
) -> RpcObjectDescriptor {
  let mut methods = table.descriptors();
  for (name, signature, doc) in IMPLICIT_METHODS {
    methods.push(RpcMethodDescriptor {
      name: name.to_string(),
      signature: signature.to_string(),
      doc: doc.to_string(),
    });
  }
  methods.sort_by(|a, b| a.name.cmp(&b.name));
  RpcObjectDescriptor {
    address,
    category: S::category().map(str::to_string),
    interface: RpcInterface {
      class_name: S::class_name().to_string(),
      doc: S::doc().to_string(),
      constants: S::constants(),
      methods,
      signals: S::signals(),
    },
  }
}

/// Apply a lock action to the lock-token slot of an object, returning the
/// token to report in the reply.
///
/// Acquire is idempotent for the holding token; a mismatching acquire or
/// release reports the access-denied placeholder; a query of a locked
/// object reports the object-locked placeholder, never the real token.
fn apply_lock_action(
  slot: &mut Option<LockToken>,
  action: LockAction,
  request_token: Option<&LockToken>,
  context_name: &str,
  object_name: &str,
) -> Option<LockToken> {
  match action {
    LockAction::Acquire => match (slot.as_ref(), request_token) {
      (_, None) => Some(LockToken::access_denied(context_name)),
      (None, Some(token)) => {
        *slot = Some(token.clone());
        info!("{object_name} locked with {token}");
        Some(token.clone())
      }
      (Some(held), Some(token)) if held == token => Some(held.clone()),
      (Some(held), Some(token)) => {
        warn!(
          "lock request (token={token}) for {object_name} failed, already locked with \
           token={held}"
        );
        Some(LockToken::access_denied(context_name))
      }
    },
    LockAction::Release => match (slot.as_ref(), request_token) {
      (None, _) => None,
      (Some(held), Some(token)) if held == token => {
        info!("{object_name} unlocked with {token}");
        *slot = None;
        None
      }
      (Some(held), _) => {
        warn!("unlock request for {object_name} failed, locked with token={held}");
        Some(LockToken::access_denied(context_name))
      }
    },
    LockAction::ForceRelease => {
      if slot.take().is_some() {
        warn!("{object_name} forcefully unlocked");
      }
      None
    }
    LockAction::Query => slot
      .as_ref()
      .map(|_| LockToken::object_locked(context_name)),
  }
}

enum WorkerInit {
  Pending,
  Ready(RpcObjectDescriptor),
  Failed(Error),
}

struct WorkerState {
  queue: VecDeque<Message>,
  shutdown_requested: bool,
  init: WorkerInit,
}

struct WorkerShared {
  state: Mutex<WorkerState>,
  cond: Condvar,
}

/// Manages a single RPC object: receives its messages, queues them for
/// the worker thread, and owns that thread.
pub(crate) struct RpcObjectManager {
  address: Address,
  shared: Arc<WorkerShared>,
  /// Guards the running flag so no request can slip into the queue after
  /// the manager stopped accepting.
  running: Mutex<bool>,
  worker: Mutex<Option<WorkerHandle>>,
}

impl RpcObjectManager {
  /// Spawn the worker thread, which constructs the service via `maker`
  /// and then serves requests until shutdown.
  pub fn start<S: RpcService>(
    address: Address,
    router: Arc<MessageRouter>,
    maker: impl FnOnce() -> Result<S> + Send + 'static,
  ) -> Result<Arc<Self>> {
    let shared = Arc::new(WorkerShared {
      state: Mutex::new(WorkerState {
        queue: VecDeque::new(),
        shutdown_requested: false,
        init: WorkerInit::Pending,
      }),
      cond: Condvar::new(),
    });

    let run_shared = Arc::clone(&shared);
    let run_address = address.clone();
    let shutdown_shared = Arc::clone(&shared);
    let worker = WorkerHandle::spawn(
      &format!("rpc-{}", address.object_id),
      move || worker_run(run_shared, router, run_address, maker),
      move || {
        let mut state = shutdown_shared.state.lock().unwrap();
        state.shutdown_requested = true;
        shutdown_shared.cond.notify_all();
      },
    )?;

    Ok(Arc::new(Self {
      address,
      shared,
      running: Mutex::new(true),
      worker: Mutex::new(Some(worker)),
    }))
  }

  /// Block until the service constructor has run; return the object
  /// descriptor, or the construction error.
  pub fn wait_ready(&self) -> Result<RpcObjectDescriptor> {
    let mut state = self.shared.state.lock().unwrap();
    loop {
      match &state.init {
        WorkerInit::Ready(descriptor) => return Ok(descriptor.clone()),
        WorkerInit::Failed(error) => return Err(error.clone()),
        WorkerInit::Pending => state = self.shared.cond.wait(state).unwrap(),
      }
    }
  }

  /// Stop accepting requests, then shut down and join the worker.
  pub fn stop(&self) {
    {
      let mut running = self.running.lock().unwrap();
      *running = false;
    }
    let worker = self.worker.lock().unwrap().take();
    if let Some(mut worker) = worker {
      worker.shutdown();
      worker.join();
    }
  }
}

impl MessageHandler for RpcObjectManager {
  fn handle_message(&self, message: Message) -> Result<()> {
    if !matches!(
      message.body,
      MessageBody::MethodRpcRequest(_) | MessageBody::LockRpcRequest(_)
    ) {
      error!(
        "received unexpected message type from {} for RPC object {}",
        message.source, self.address
      );
      return Ok(());
    }

    let running = self.running.lock().unwrap();
    if !*running {
      return Err(Error::MessageDelivery(format!(
        "RPC object {} already stopped",
        self.address
      )));
    }
    let mut state = self.shared.state.lock().unwrap();
    state.queue.push_back(message);
    self.shared.cond.notify_all();
    Ok(())
  }
}

fn worker_run<S: RpcService>(
  shared: Arc<WorkerShared>,
  router: Arc<MessageRouter>,
  address: Address,
  maker: impl FnOnce() -> Result<S>,
) {
  debug!("starting RPC worker for {address}");
  let table = S::method_table();

  let mut service = match maker() {
    Ok(service) => service,
    Err(error) => {
      warn!("initialization of RPC object {address} failed: {error}");
      let mut state = shared.state.lock().unwrap();
      state.init = WorkerInit::Failed(error);
      shared.cond.notify_all();
      return;
    }
  };
  let descriptor = make_descriptor::<S>(address.clone(), &table);
  {
    let mut state = shared.state.lock().unwrap();
    state.init = WorkerInit::Ready(descriptor.clone());
    shared.cond.notify_all();
  }

  // The lock-token slot is only ever touched by this worker.
  let mut locking_token: Option<LockToken> = None;
  let context_name = router.context_name().to_string();

  loop {
    let request = {
      let mut state = shared.state.lock().unwrap();
      loop {
        if state.shutdown_requested {
          break None;
        }
        if let Some(request) = state.queue.pop_front() {
          break Some(request);
        }
        state = shared.cond.wait(state).unwrap();
      }
    };
    let request = match request {
      Some(request) => request,
      None => break,
    };

    let reply = match &request.body {
      MessageBody::MethodRpcRequest(method_request) => handle_method_request(
        &mut service,
        &table,
        &descriptor,
        &locking_token,
        &request,
        method_request,
      ),
      MessageBody::LockRpcRequest(lock_request) => handle_lock_request(
        &mut locking_token,
        &context_name,
        &address,
        &request,
        lock_request,
      ),
      _ => continue,
    };

    if let Err(e) = router.send_message(reply) {
      error!("failed to send RPC reply from {address} to {}: {e}", request.source);
    }
  }

  reject_remaining_requests(&shared, &router);

  if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| service.release())).is_err() {
    error!("failed to release RPC object {address}");
  }
  debug!("stopping RPC worker for {address}");
}

fn handle_method_request<S: RpcService>(
  service: &mut S,
  table: &MethodTable<S>,
  descriptor: &RpcObjectDescriptor,
  locking_token: &Option<LockToken>,
  request: &Message,
  method_request: &MethodRpcRequest,
) -> Message {
  let allowed =
    locking_token.is_none() || method_request.lock_token.as_ref() == locking_token.as_ref();

  let outcome = if allowed {
    dispatch_method(service, table, descriptor, method_request)
  } else {
    error!(
      "{} locked, method request without matching lock token is denied",
      descriptor.address
    );
    RpcOutcome::ObjectLocked
  };

  Message {
    source: request.destination.clone(),
    destination: request.source.clone(),
    body: MessageBody::MethodRpcReply(MethodRpcReply {
      request_id: method_request.request_id,
      outcome,
    }),
  }
}

fn dispatch_method<S: RpcService>(
  service: &mut S,
  table: &MethodTable<S>,
  descriptor: &RpcObjectDescriptor,
  method_request: &MethodRpcRequest,
) -> RpcOutcome {
  // Implicit methods answered by every object.
  match method_request.method.as_str() {
    "get_name" => {
      return RpcOutcome::Value(RpcValue::Str(descriptor.address.object_id.clone()));
    }
    "get_signals" => {
      let signals = descriptor
        .interface
        .signals
        .iter()
        .map(|s| {
          RpcValue::Map(vec![
            ("name".to_string(), RpcValue::Str(s.name.clone())),
            (
              "arg_types".to_string(),
              RpcValue::List(s.arg_types.iter().cloned().map(RpcValue::Str).collect()),
            ),
          ])
        })
        .collect();
      return RpcOutcome::Value(RpcValue::List(signals));
    }
    _ => {}
  }

  let entry = match table.methods.get(&method_request.method) {
    Some(entry) => entry,
    None => {
      return RpcOutcome::Exception(RemoteError::new(
        "UnknownRpcError",
        &format!(
          "object {} of type {} has no RPC method {}",
          descriptor.address.object_id, descriptor.interface.class_name, method_request.method
        ),
      ));
    }
  };

  // A failing or panicking user method must not kill the worker.
  let call = method_request.call.clone();
  let result =
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (entry.handler)(service, call)));
  match result {
    Ok(Ok(value)) => RpcOutcome::Value(value),
    Ok(Err(error)) => {
      debug!("RPC method call failed: {error}");
      RpcOutcome::Exception(error.to_remote())
    }
    Err(_) => {
      error!("RPC method {} panicked", method_request.method);
      RpcOutcome::Exception(RemoteError::new(
        "Panic",
        &format!("method {} panicked", method_request.method),
      ))
    }
  }
}

fn handle_lock_request(
  locking_token: &mut Option<LockToken>,
  context_name: &str,
  address: &Address,
  request: &Message,
  lock_request: &LockRpcRequest,
) -> Message {
  let return_token = apply_lock_action(
    locking_token,
    lock_request.action,
    lock_request.lock_token.as_ref(),
    context_name,
    &address.object_id,
  );
  Message {
    source: request.destination.clone(),
    destination: request.source.clone(),
    body: MessageBody::LockRpcReply(LockRpcReply {
      request_id: lock_request.request_id,
      lock_token: return_token,
    }),
  }
}

/// Send an error reply for every request still queued when the worker
/// shuts down. Best-effort; send failures are ignored.
fn reject_remaining_requests(shared: &WorkerShared, router: &MessageRouter) {
  loop {
    let request = {
      let mut state = shared.state.lock().unwrap();
      state.queue.pop_front()
    };
    let request = match request {
      Some(request) => request,
      None => break,
    };
    if let Some(reply) = Message::error_reply_to(&request, "") {
      if router.send_message(reply).is_err() {
        debug!("failed to send RPC error reply to {}", request.source);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn token(ctx: &str, value: &str) -> LockToken {
    LockToken::new(ctx, value)
  }

  #[test]
  fn acquire_and_release() {
    let mut slot = None;
    let t = token("c1", "$lock_1");

    // Acquire on an unlocked object stores and echoes the token.
    let reply = apply_lock_action(&mut slot, LockAction::Acquire, Some(&t), "c1", "obj");
    assert_eq!(reply, Some(t.clone()));
    assert_eq!(slot, Some(t.clone()));

    // Acquire with the same token is idempotent.
    let reply = apply_lock_action(&mut slot, LockAction::Acquire, Some(&t), "c1", "obj");
    assert_eq!(reply, Some(t.clone()));

    // Release with the matching token clears the slot.
    let reply = apply_lock_action(&mut slot, LockAction::Release, Some(&t), "c1", "obj");
    assert_eq!(reply, None);
    assert_eq!(slot, None);

    // Release of an unlocked object reports None (success).
    let reply = apply_lock_action(&mut slot, LockAction::Release, Some(&t), "c1", "obj");
    assert_eq!(reply, None);
  }

  #[test]
  fn mismatching_tokens_are_denied() {
    let mut slot = Some(token("c1", "$lock_1"));
    let other = token("c2", "$lock_1");

    let reply = apply_lock_action(&mut slot, LockAction::Acquire, Some(&other), "c1", "obj");
    assert_eq!(reply, Some(LockToken::access_denied("c1")));
    let reply = apply_lock_action(&mut slot, LockAction::Release, Some(&other), "c1", "obj");
    assert_eq!(reply, Some(LockToken::access_denied("c1")));
    assert!(slot.is_some());
  }

  #[test]
  fn query_never_reveals_the_token() {
    let mut slot = None;
    assert_eq!(
      apply_lock_action(&mut slot, LockAction::Query, None, "c1", "obj"),
      None
    );
    slot = Some(token("c1", "secret"));
    assert_eq!(
      apply_lock_action(&mut slot, LockAction::Query, None, "c1", "obj"),
      Some(LockToken::object_locked("c1"))
    );
    assert_eq!(slot, Some(token("c1", "secret")));
  }

  #[test]
  fn force_release_clears_any_lock() {
    let mut slot = Some(token("c1", "whatever"));
    assert_eq!(
      apply_lock_action(&mut slot, LockAction::ForceRelease, None, "c1", "obj"),
      None
    );
    assert_eq!(slot, None);
    // Force release of an unlocked object also reports None.
    assert_eq!(
      apply_lock_action(&mut slot, LockAction::ForceRelease, None, "c1", "obj"),
      None
    );
  }

  #[test]
  fn descriptor_value_roundtrip() {
    let descriptor = RpcObjectDescriptor {
      address: Address::new("c1", "tc1"),
      category: Some("instrument".to_string()),
      interface: RpcInterface {
        class_name: "SineGenerator".to_string(),
        doc: "Test object.".to_string(),
        constants: vec![RpcConstantDescriptor {
          name: "MAX_FREQUENCY".to_string(),
          value: RpcValue::Float(1e6),
        }],
        methods: vec![RpcMethodDescriptor {
          name: "remote_sqrt".to_string(),
          signature: "(x: float) -> float".to_string(),
          doc: "".to_string(),
        }],
        signals: vec![RpcSignalDescriptor {
          name: "sig3".to_string(),
          arg_types: vec!["int".to_string(), "str".to_string()],
        }],
      },
    };
    let value = descriptor.to_value();
    assert_eq!(RpcObjectDescriptor::from_value(&value).unwrap(), descriptor);
  }
}
