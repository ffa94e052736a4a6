//! Client side of the RPC mechanism: futures and proxies.

use std::{
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex,
  },
  time::{Duration, Instant},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  address::{Address, RequestId},
  context::ContextCore,
  error::{Error, Result},
  message::{
    CallArgs, LockAction, LockRpcRequest, LockToken, Message, MessageBody, MethodRpcRequest,
    RpcOutcome, RpcValue,
  },
  messaging::MessageHandler,
  pubsub::SignalSubscriber,
  rpc::RpcObjectDescriptor,
};

/// Retry period for lock acquisition with a timeout.
const LOCK_RETRY_PERIOD: Duration = Duration::from_millis(100);

enum FutureResult {
  Value(RpcValue),
  Exception(Error),
  ObjectLocked,
  DeliveryFailed(String),
  LockReply(Option<LockToken>),
}

struct FutureShared {
  target: Address,
  state: Mutex<Option<FutureResult>>,
  cond: Condvar,
}

impl FutureShared {
  fn set_result(&self, result: FutureResult) {
    let mut state = self.state.lock().unwrap();
    if state.is_some() {
      error!("future for {} received duplicate reply message", self.target);
      return;
    }
    *state = Some(result);
    self.cond.notify_all();
  }
}

impl MessageHandler for FutureShared {
  fn handle_message(&self, message: Message) -> Result<()> {
    match message.body {
      MessageBody::MethodRpcReply(reply) => {
        let result = match reply.outcome {
          RpcOutcome::Value(value) => FutureResult::Value(value),
          RpcOutcome::Exception(remote) => FutureResult::Exception(remote.into()),
          RpcOutcome::ObjectLocked => FutureResult::ObjectLocked,
        };
        self.set_result(result);
      }
      MessageBody::LockRpcReply(reply) => {
        self.set_result(FutureResult::LockReply(reply.lock_token));
      }
      MessageBody::ErrorReply(reply) => {
        self.set_result(FutureResult::DeliveryFailed(reply.error_msg));
      }
      other => {
        error!(
          "future for {} received unexpected message type {other:?}",
          self.target
        );
      }
    }
    Ok(())
  }
}

/// One-shot completion handle for an RPC call in flight.
///
/// The future registers itself as a message handler under a fresh
/// `$future_N` address so the reply routes to it. It completes with the
/// method's value, the remote exception, an object-locked refusal, or a
/// delivery failure. After completion (or drop) it unregisters itself; a
/// reply arriving later is dropped by the router.
pub struct RpcFuture {
  core: Arc<ContextCore>,
  object_id: String,
  shared: Arc<FutureShared>,
  handler: Arc<dyn MessageHandler>,
  lock_token: Option<LockToken>,
  unregistered: AtomicBool,
}

impl RpcFuture {
  pub(crate) fn new(
    core: &Arc<ContextCore>,
    target: Address,
    lock_token: Option<LockToken>,
  ) -> Result<Self> {
    let object_id = core.make_unique_id("$future_");
    let shared = Arc::new(FutureShared {
      target,
      state: Mutex::new(None),
      cond: Condvar::new(),
    });
    let handler: Arc<dyn MessageHandler> = Arc::clone(&shared) as Arc<dyn MessageHandler>;
    core
      .router
      .register_message_handler(&object_id, Arc::clone(&handler))?;
    Ok(Self {
      core: Arc::clone(core),
      object_id,
      shared,
      handler,
      lock_token,
      unregistered: AtomicBool::new(false),
    })
  }

  fn own_address(&self) -> Address {
    Address::new(self.core.name.clone(), self.object_id.clone())
  }

  /// Send the method invocation request this future will answer for.
  pub(crate) fn send_method_request(&self, method: &str, call: CallArgs) {
    let request = Message {
      source: self.own_address(),
      destination: self.shared.target.clone(),
      body: MessageBody::MethodRpcRequest(MethodRpcRequest {
        request_id: RequestId::fresh(),
        method: method.to_string(),
        call,
        lock_token: self.lock_token.clone(),
      }),
    };
    if let Err(e) = self.core.router.send_message(request) {
      self.fail_with_send_error(e);
    }
  }

  /// Send a lock-state request this future will answer for.
  pub(crate) fn send_lock_request(&self, action: LockAction) {
    let request = Message {
      source: self.own_address(),
      destination: self.shared.target.clone(),
      body: MessageBody::LockRpcRequest(LockRpcRequest {
        request_id: RequestId::fresh(),
        action,
        lock_token: self.lock_token.clone(),
      }),
    };
    if let Err(e) = self.core.router.send_message(request) {
      self.fail_with_send_error(e);
    }
  }

  fn fail_with_send_error(&self, error: Error) {
    let result = match error {
      Error::MessageDelivery(reason) => FutureResult::DeliveryFailed(reason),
      other => FutureResult::Exception(other),
    };
    self.shared.set_result(result);
  }

  fn wait_result(&self, timeout: Option<Duration>) -> Result<FutureResult> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut state = self.shared.state.lock().unwrap();
    loop {
      if let Some(result) = state.take() {
        return Ok(result);
      }
      match deadline {
        Some(deadline) => {
          let now = Instant::now();
          if now >= deadline {
            return Err(Error::RpcTimeout);
          }
          state = self
            .shared
            .cond
            .wait_timeout(state, deadline - now)
            .unwrap()
            .0;
        }
        None => state = self.shared.cond.wait(state).unwrap(),
      }
    }
  }

  fn unregister(&self) {
    if !self.unregistered.swap(true, Ordering::SeqCst) {
      let _ = self
        .core
        .router
        .unregister_message_handler(&self.object_id, &self.handler);
    }
  }

  /// Block until the call completes, then return its value or re-raise
  /// its error. `None` waits forever; on expiry the call fails with
  /// `Error::RpcTimeout` (the remote side keeps running and its late
  /// reply is dropped).
  pub fn wait(self, timeout: Option<Duration>) -> Result<RpcValue> {
    let result = self.wait_result(timeout);
    self.unregister();
    match result? {
      FutureResult::Value(value) => Ok(value),
      FutureResult::Exception(error) => Err(error),
      FutureResult::ObjectLocked => Err(Error::ObjectLocked),
      FutureResult::DeliveryFailed(reason) => Err(Error::MessageDelivery(reason)),
      FutureResult::LockReply(_) => {
        Err(Error::Protocol("lock reply on a method-call future".to_string()))
      }
    }
  }

  /// Wait for the reply to a lock-state request.
  pub(crate) fn wait_lock(self, timeout: Option<Duration>) -> Result<Option<LockToken>> {
    let result = self.wait_result(timeout);
    self.unregister();
    match result? {
      FutureResult::LockReply(token) => Ok(token),
      FutureResult::DeliveryFailed(reason) => Err(Error::MessageDelivery(reason)),
      FutureResult::Exception(error) => Err(error),
      _ => Err(Error::Protocol("method reply on a lock future".to_string())),
    }
  }
}

impl Drop for RpcFuture {
  fn drop(&mut self) {
    self.unregister();
  }
}

/// Client-side handle for invoking methods, managing the lock and
/// subscribing to signals of an RPC object, local or remote.
///
/// A proxy is constructed from an object descriptor; it performs no I/O
/// until a method is called.
pub struct RpcProxy {
  core: Arc<ContextCore>,
  descriptor: RpcObjectDescriptor,
  lock_token: Mutex<Option<LockToken>>,
}

impl std::fmt::Debug for RpcProxy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RpcProxy")
      .field("address", self.address())
      .finish()
  }
}

impl RpcProxy {
  pub(crate) fn new(core: Arc<ContextCore>, descriptor: RpcObjectDescriptor) -> Self {
    Self {
      core,
      descriptor,
      lock_token: Mutex::new(None),
    }
  }

  pub fn address(&self) -> &Address {
    &self.descriptor.address
  }

  pub fn descriptor(&self) -> &RpcObjectDescriptor {
    &self.descriptor
  }

  fn current_token(&self) -> Option<LockToken> {
    self.lock_token.lock().unwrap().clone()
  }

  /// Invoke a method with positional arguments and block until it
  /// returns.
  pub fn call(&self, method: &str, args: Vec<RpcValue>) -> Result<RpcValue> {
    self.call_with_timeout(method, CallArgs::positional(args), None)
  }

  /// Invoke a method and block until it returns or `rpc_timeout`
  /// expires.
  pub fn call_with_timeout(
    &self,
    method: &str,
    call: CallArgs,
    rpc_timeout: Option<Duration>,
  ) -> Result<RpcValue> {
    let future = self.call_nonblocking(method, call)?;
    future.wait(rpc_timeout)
  }

  /// Invoke a method without waiting; returns the future to wait on.
  pub fn call_nonblocking(&self, method: &str, call: CallArgs) -> Result<RpcFuture> {
    let future = RpcFuture::new(
      &self.core,
      self.descriptor.address.clone(),
      self.current_token(),
    )?;
    future.send_method_request(method, call);
    Ok(future)
  }

  /// Try to lock the object.
  ///
  /// A fresh unique token is minted unless `lock_token` supplies a custom
  /// one (enabling lock transfer between proxies whose contexts share a
  /// name). With a non-zero timeout, acquisition is retried every 100 ms
  /// until granted or the timeout elapses. A granted lock is recorded on
  /// the proxy and attached to every subsequent method call until
  /// [`unlock`](Self::unlock).
  pub fn lock(&self, timeout: Duration, lock_token: Option<&str>) -> Result<bool> {
    let my_token = match lock_token {
      Some(token) => LockToken::new(self.core.name.clone(), token),
      None => self.core.make_unique_token("$lock_"),
    };

    if timeout > Duration::ZERO {
      let deadline = Instant::now() + timeout;
      while Instant::now() < deadline {
        let attempt_start = Instant::now();
        if self.try_acquire(&my_token)? {
          return Ok(true);
        }
        let elapsed = attempt_start.elapsed();
        if elapsed < LOCK_RETRY_PERIOD {
          std::thread::sleep(LOCK_RETRY_PERIOD - elapsed);
        }
      }
    } else if self.try_acquire(&my_token)? {
      return Ok(true);
    }

    debug!("{} lock denied, already locked", self.descriptor.address);
    Ok(false)
  }

  fn try_acquire(&self, token: &LockToken) -> Result<bool> {
    let future = RpcFuture::new(
      &self.core,
      self.descriptor.address.clone(),
      Some(token.clone()),
    )?;
    future.send_lock_request(LockAction::Acquire);
    let granted = future.wait_lock(None)?;
    if granted.as_ref() == Some(token) {
      debug!("{} locked with {token}", self.descriptor.address);
      *self.lock_token.lock().unwrap() = Some(token.clone());
      Ok(true)
    } else {
      Ok(false)
    }
  }

  /// Release the lock. Uses the proxy's stored token unless a custom
  /// token is supplied. Returns whether the object is unlocked
  /// afterwards.
  pub fn unlock(&self, lock_token: Option<&str>) -> Result<bool> {
    let token = match lock_token {
      Some(token) => Some(LockToken::new(self.core.name.clone(), token)),
      None => self.current_token(),
    };
    let future = RpcFuture::new(&self.core, self.descriptor.address.clone(), token)?;
    future.send_lock_request(LockAction::Release);
    match future.wait_lock(None)? {
      None => {
        debug!("{} unlocked", self.descriptor.address);
        *self.lock_token.lock().unwrap() = None;
        Ok(true)
      }
      Some(_) => Ok(false),
    }
  }

  /// Clear the lock regardless of who owns it. Use with care.
  pub fn force_unlock(&self) -> Result<()> {
    let future = RpcFuture::new(
      &self.core,
      self.descriptor.address.clone(),
      self.current_token(),
    )?;
    future.send_lock_request(LockAction::ForceRelease);
    match future.wait_lock(None)? {
      None => {
        debug!("{} unlocked forcefully", self.descriptor.address);
        *self.lock_token.lock().unwrap() = None;
        Ok(())
      }
      Some(_) => {
        warn!("{} force unlock failed", self.descriptor.address);
        Ok(())
      }
    }
  }

  /// Query whether the object is currently locked (by anyone).
  pub fn is_locked(&self) -> Result<bool> {
    let future = RpcFuture::new(
      &self.core,
      self.descriptor.address.clone(),
      self.current_token(),
    )?;
    future.send_lock_request(LockAction::Query);
    Ok(future.wait_lock(None)?.is_some())
  }

  /// Value of an exported constant, from the descriptor.
  pub fn constant(&self, name: &str) -> Option<&RpcValue> {
    self
      .descriptor
      .interface
      .constants
      .iter()
      .find(|c| c.name == name)
      .map(|c| &c.value)
  }

  /// Accessor for a declared signal of the object, for subscribing and
  /// unsubscribing receivers.
  pub fn signal(&self, name: &str) -> Result<SignalSubscriber> {
    let declared = self
      .descriptor
      .interface
      .signals
      .iter()
      .any(|s| s.name == name);
    if !declared {
      return Err(Error::UnknownName(format!(
        "object {} declares no signal {name}",
        self.descriptor.address
      )));
    }
    Ok(SignalSubscriber::new(
      Arc::clone(&self.core.pubsub),
      self.descriptor.address.context_id.clone(),
      self.descriptor.address.object_id.clone(),
      name.to_string(),
    ))
  }
}
