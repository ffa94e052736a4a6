//! Publish/subscribe signal dissemination.
//!
//! Each context owns one [`SignalManager`], registered as the message
//! handler for the reserved `$pubsub` object. It tracks which local
//! receivers are subscribed to which signals, which remote contexts want
//! our locally published signals, and the subscription requests currently
//! in flight to remote contexts. All of that state sits behind a single
//! mutex; no callback or network send runs while it is held.

use std::{
  collections::{HashMap, HashSet, VecDeque},
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Condvar, Mutex,
  },
  time::Duration,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  address::{is_valid_name, Address, RequestId},
  context::ObjectRegistry,
  error::{Error, Result},
  message::{
    Message, MessageBody, RpcValue, SignalMessage, SignalRemoved, SignalSubscriptionReply,
    SignalSubscriptionRequest,
  },
  messaging::{MessageHandler, MessageRouter},
  worker::wait_for_condition,
};

/// Reserved object name of the pub/sub manager in every context.
pub const PUBSUB_OBJECT_ID: &str = "$pubsub";

/// Policy for a full receiver queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardPolicy {
  /// Discard the oldest pending signal to make room for a new one.
  DiscardOld,
  /// Drop newly received signals while the queue is full.
  DiscardNew,
}

/// A signal instance stored in a receiver's queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedSignal {
  pub publisher_context: String,
  pub publisher_name: String,
  pub signal_name: String,
  pub args: Vec<RpcValue>,
  /// Per-receiver sequence number, incremented for every *received*
  /// signal (also for signals dropped on overflow), so gaps reveal
  /// queue overflow.
  pub receiver_seqnr: u64,
}

struct ReceiverQueue {
  queue: VecDeque<ReceivedSignal>,
  seqnr: u64,
}

static NEXT_RECEIVER_ID: AtomicU64 = AtomicU64::new(1);

/// Bounded FIFO of received signals.
///
/// A receiver can be subscribed to any number of signals, local or
/// remote. All methods are thread-safe. When the queue overflows, the
/// configured [`DiscardPolicy`] decides which signal is dropped.
pub struct SignalReceiver {
  id: u64,
  max_queue_length: usize,
  policy: DiscardPolicy,
  state: Mutex<ReceiverQueue>,
  cond: Arc<Condvar>,
}

impl Default for SignalReceiver {
  fn default() -> Self {
    Self::new(10_000, DiscardPolicy::DiscardOld)
  }
}

impl SignalReceiver {
  pub fn new(max_queue_length: usize, policy: DiscardPolicy) -> Self {
    assert!(max_queue_length > 0);
    Self {
      id: NEXT_RECEIVER_ID.fetch_add(1, Ordering::Relaxed),
      max_queue_length,
      policy,
      state: Mutex::new(ReceiverQueue {
        queue: VecDeque::new(),
        seqnr: 0,
      }),
      cond: Arc::new(Condvar::new()),
    }
  }

  /// Discard all pending signals.
  pub fn discard_all(&self) {
    self.state.lock().unwrap().queue.clear();
  }

  /// True if at least one received signal is waiting.
  pub fn has_signal_ready(&self) -> bool {
    !self.state.lock().unwrap().queue.is_empty()
  }

  /// Number of signals currently queued. May change at any time due to
  /// other threads.
  pub fn queue_length(&self) -> usize {
    self.state.lock().unwrap().queue.len()
  }

  /// Return the oldest queued signal, waiting up to `timeout` for one to
  /// arrive (`None` waits indefinitely).
  ///
  /// Fails with `Error::Timeout` when the timeout expires, and with
  /// `Error::TaskStop` when the calling task receives a stop request
  /// while waiting.
  pub fn get_next_signal(&self, timeout: Option<Duration>) -> Result<ReceivedSignal> {
    let guard = self.state.lock().unwrap();
    let (mut guard, ready) =
      wait_for_condition(&self.cond, guard, |q| !q.queue.is_empty(), timeout)?;
    if !ready {
      return Err(Error::Timeout);
    }
    Ok(guard.queue.pop_front().expect("queue non-empty"))
  }

  fn receive_signal(&self, message: &SignalMessage, source: &Address) {
    let mut state = self.state.lock().unwrap();
    let signal = ReceivedSignal {
      publisher_context: source.context_id.clone(),
      publisher_name: source.object_id.clone(),
      signal_name: message.signal_name.clone(),
      args: message.args.clone(),
      receiver_seqnr: state.seqnr,
    };
    state.seqnr += 1;

    if state.queue.len() == self.max_queue_length {
      match self.policy {
        DiscardPolicy::DiscardNew => return,
        DiscardPolicy::DiscardOld => {
          state.queue.pop_front();
        }
      }
    }
    state.queue.push_back(signal);
    self.cond.notify_all();
  }
}

struct CompletionEvent {
  state: Mutex<Option<(bool, String)>>,
  cond: Condvar,
}

impl CompletionEvent {
  fn new() -> Self {
    Self {
      state: Mutex::new(None),
      cond: Condvar::new(),
    }
  }

  fn set(&self, success: bool, error_msg: String) {
    let mut state = self.state.lock().unwrap();
    debug_assert!(state.is_none());
    *state = Some((success, error_msg));
    self.cond.notify_all();
  }

  fn wait(&self) -> (bool, String) {
    let mut state = self.state.lock().unwrap();
    loop {
      if let Some(result) = state.as_ref() {
        return result.clone();
      }
      state = self.cond.wait(state).unwrap();
    }
  }
}

/// A subscribe/unsubscribe request sent to a remote context and not yet
/// answered. At most one exists per `"ctx.pub.sig"`; local subscription
/// changes during its flight mutate the attached receiver set instead of
/// sending another message.
struct PendingRequest {
  publisher_context: String,
  publisher_name: String,
  signal_name: String,
  subscribe: Mutex<bool>,
  receivers: Mutex<HashMap<u64, Arc<SignalReceiver>>>,
  event: CompletionEvent,
}

impl PendingRequest {
  fn new(publisher_context: &str, publisher_name: &str, signal_name: &str, subscribe: bool) -> Self {
    Self {
      publisher_context: publisher_context.to_string(),
      publisher_name: publisher_name.to_string(),
      signal_name: signal_name.to_string(),
      subscribe: Mutex::new(subscribe),
      receivers: Mutex::new(HashMap::new()),
      event: CompletionEvent::new(),
    }
  }

  fn full_name(&self) -> String {
    format!(
      "{}.{}.{}",
      self.publisher_context, self.publisher_name, self.signal_name
    )
  }
}

#[derive(Default)]
struct PubSubState {
  /// `"ctx.pub.sig"` -> receivers subscribed in this context.
  local_subscriptions: HashMap<String, HashMap<u64, Arc<SignalReceiver>>>,
  /// `"pub.sig"` -> remote contexts subscribed to our signal.
  remote_subscriptions: HashMap<String, HashSet<String>>,
  pending_by_request_id: HashMap<RequestId, Arc<PendingRequest>>,
  pending_by_signal_name: HashMap<String, Arc<PendingRequest>>,
}

/// Keeps track of signal subscriptions and handles signal publishing.
pub struct SignalManager {
  context_name: String,
  router: Arc<MessageRouter>,
  registry: Arc<ObjectRegistry>,
  state: Mutex<PubSubState>,
}

impl SignalManager {
  pub(crate) fn new(
    context_name: &str,
    router: Arc<MessageRouter>,
    registry: Arc<ObjectRegistry>,
  ) -> Arc<Self> {
    debug!("signal manager initializing");
    Arc::new(Self {
      context_name: context_name.to_string(),
      router,
      registry,
      state: Mutex::new(PubSubState::default()),
    })
  }

  fn own_address(&self) -> Address {
    Address::new(self.context_name.clone(), PUBSUB_OBJECT_ID)
  }

  fn validate_names(&self, publisher_context: &str, publisher_name: &str, signal_name: &str) -> Result<()> {
    if !is_valid_name(publisher_context) {
      return Err(Error::Usage(format!(
        "invalid context name {publisher_context:?}"
      )));
    }
    if !is_valid_name(publisher_name) {
      return Err(Error::Usage(format!(
        "invalid publisher name {publisher_name:?}"
      )));
    }
    if !is_valid_name(signal_name) {
      return Err(Error::Usage(format!("invalid signal name {signal_name:?}")));
    }
    Ok(())
  }

  /// Subscribe a receiver to a signal. Blocks until the subscription is
  /// established (for a remote publisher, until the remote context
  /// confirms). Thread-safe.
  pub fn subscribe_signal(
    &self,
    publisher_context: &str,
    publisher_name: &str,
    signal_name: &str,
    receiver: &Arc<SignalReceiver>,
  ) -> Result<()> {
    let publisher_context = if publisher_context.is_empty() {
      self.context_name.as_str()
    } else {
      publisher_context
    };
    self.validate_names(publisher_context, publisher_name, signal_name)?;
    debug!("subscribing to signal {publisher_context}.{publisher_name}.{signal_name}");

    if publisher_context == self.context_name {
      self.subscribe_local(publisher_context, publisher_name, signal_name, receiver)
    } else {
      self.subscribe_remote(publisher_context, publisher_name, signal_name, receiver)
    }
  }

  /// Unsubscribe a receiver from a signal. Does nothing if it is not
  /// subscribed. Thread-safe; never blocks on the network.
  pub fn unsubscribe_signal(
    &self,
    publisher_context: &str,
    publisher_name: &str,
    signal_name: &str,
    receiver: &Arc<SignalReceiver>,
  ) -> Result<()> {
    let publisher_context = if publisher_context.is_empty() {
      self.context_name.as_str()
    } else {
      publisher_context
    };
    self.validate_names(publisher_context, publisher_name, signal_name)?;
    debug!("unsubscribing from signal {publisher_context}.{publisher_name}.{signal_name}");

    let full_name = format!("{publisher_context}.{publisher_name}.{signal_name}");
    if publisher_context == self.context_name {
      let mut state = self.state.lock().unwrap();
      remove_local_subscriber(&mut state, &full_name, receiver.id);
      Ok(())
    } else {
      self.unsubscribe_remote(publisher_context, publisher_name, signal_name, receiver)
    }
  }

  fn subscribe_local(
    &self,
    publisher_context: &str,
    publisher_name: &str,
    signal_name: &str,
    receiver: &Arc<SignalReceiver>,
  ) -> Result<()> {
    // The publisher must exist as a registered RPC object.
    if self.registry.descriptor_of(publisher_name).is_none() {
      return Err(Error::SignalSubscription(format!(
        "unknown RPC object {publisher_context}.{publisher_name}"
      )));
    }
    let full_name = format!("{publisher_context}.{publisher_name}.{signal_name}");
    {
      let mut state = self.state.lock().unwrap();
      state
        .local_subscriptions
        .entry(full_name.clone())
        .or_default()
        .insert(receiver.id, Arc::clone(receiver));
    }
    // The publisher may have vanished while we were subscribing; undo.
    if self.registry.descriptor_of(publisher_name).is_none() {
      let mut state = self.state.lock().unwrap();
      remove_local_subscriber(&mut state, &full_name, receiver.id);
    }
    Ok(())
  }

  fn subscribe_remote(
    &self,
    publisher_context: &str,
    publisher_name: &str,
    signal_name: &str,
    receiver: &Arc<SignalReceiver>,
  ) -> Result<()> {
    let full_name = format!("{publisher_context}.{publisher_name}.{signal_name}");
    let mut request_message = None;

    let pending = {
      let mut state = self.state.lock().unwrap();

      // With existing local subscribers the remote side already knows
      // about us; just attach the receiver.
      if let Some(subs) = state.local_subscriptions.get_mut(&full_name) {
        if !subs.is_empty() {
          subs.insert(receiver.id, Arc::clone(receiver));
          return Ok(());
        }
      }

      let pending = match state.pending_by_signal_name.get(&full_name) {
        Some(pending) => Arc::clone(pending),
        None => {
          let request = Message {
            source: self.own_address(),
            destination: Address::new(publisher_context, PUBSUB_OBJECT_ID),
            body: MessageBody::SignalSubscriptionRequest(SignalSubscriptionRequest {
              request_id: RequestId::fresh(),
              publisher_name: publisher_name.to_string(),
              signal_name: signal_name.to_string(),
              subscribe: true,
            }),
          };
          let request_id = request.request_id().expect("subscription request has an id");
          let pending = Arc::new(PendingRequest::new(
            publisher_context,
            publisher_name,
            signal_name,
            true,
          ));
          state
            .pending_by_signal_name
            .insert(full_name.clone(), Arc::clone(&pending));
          state
            .pending_by_request_id
            .insert(request_id, Arc::clone(&pending));
          request_message = Some(request);
          pending
        }
      };
      pending
        .receivers
        .lock()
        .unwrap()
        .insert(receiver.id, Arc::clone(receiver));
      pending
    };

    if let Some(request) = request_message {
      self.send_subscription_request(request);
    }

    let (success, error_msg) = pending.event.wait();
    if success {
      Ok(())
    } else {
      Err(Error::SignalSubscription(error_msg))
    }
  }

  fn unsubscribe_remote(
    &self,
    publisher_context: &str,
    publisher_name: &str,
    signal_name: &str,
    receiver: &Arc<SignalReceiver>,
  ) -> Result<()> {
    let full_name = format!("{publisher_context}.{publisher_name}.{signal_name}");
    let mut request_message = None;

    {
      let mut state = self.state.lock().unwrap();
      let last_subscriber = remove_local_subscriber(&mut state, &full_name, receiver.id);

      // When the last local subscriber leaves, tell the publisher's
      // context, unless a subscription request is already in flight (its
      // completion handling will reconcile).
      if last_subscriber && !state.pending_by_signal_name.contains_key(&full_name) {
        let request = Message {
          source: self.own_address(),
          destination: Address::new(publisher_context, PUBSUB_OBJECT_ID),
          body: MessageBody::SignalSubscriptionRequest(SignalSubscriptionRequest {
            request_id: RequestId::fresh(),
            publisher_name: publisher_name.to_string(),
            signal_name: signal_name.to_string(),
            subscribe: false,
          }),
        };
        let request_id = request.request_id().expect("subscription request has an id");
        let pending = Arc::new(PendingRequest::new(
          publisher_context,
          publisher_name,
          signal_name,
          false,
        ));
        state
          .pending_by_signal_name
          .insert(full_name.clone(), Arc::clone(&pending));
        state.pending_by_request_id.insert(request_id, pending);
        request_message = Some(request);
      }
    }

    // Unsubscribe completions never raise; the caller already considers
    // itself unsubscribed.
    if let Some(request) = request_message {
      self.send_subscription_request(request);
    }
    Ok(())
  }

  fn send_subscription_request(&self, request: Message) {
    let request_id = request.request_id().expect("subscription request has an id");
    let subscribe = matches!(
      &request.body,
      MessageBody::SignalSubscriptionRequest(r) if r.subscribe
    );
    debug!(
      "sending {} request for {}",
      if subscribe { "subscribe" } else { "unsubscribe" },
      request.destination.context_id
    );
    if let Err(e) = self.router.send_message(request) {
      // Handle a send failure as if an error reply arrived.
      self.handle_subscription_reply(request_id, false, &e.to_string());
    }
  }

  /// Publish a signal: deliver to local subscribers and forward one
  /// message per subscribed remote context. Thread-safe; remote delivery
  /// is best-effort.
  pub fn publish_signal(
    &self,
    publisher_name: &str,
    signal_name: &str,
    args: Vec<RpcValue>,
  ) -> Result<()> {
    if !is_valid_name(publisher_name) {
      return Err(Error::Usage(format!(
        "invalid publisher name {publisher_name:?}"
      )));
    }
    if !is_valid_name(signal_name) {
      return Err(Error::Usage(format!("invalid signal name {signal_name:?}")));
    }

    let source = Address::new(self.context_name.clone(), publisher_name);
    let signal = SignalMessage {
      signal_name: signal_name.to_string(),
      args,
    };

    // Local delivery first.
    self.deliver_local(&source, &signal);

    // Remote delivery: snapshot the subscriber contexts, send outside
    // the lock.
    let remote_subscribers: Vec<String> = {
      let state = self.state.lock().unwrap();
      state
        .remote_subscriptions
        .get(&format!("{publisher_name}.{signal_name}"))
        .map(|subs| subs.iter().cloned().collect())
        .unwrap_or_default()
    };
    for subscriber_context in remote_subscribers {
      let message = Message {
        source: source.clone(),
        destination: Address::new(subscriber_context.clone(), PUBSUB_OBJECT_ID),
        body: MessageBody::Signal(signal.clone()),
      };
      if let Err(e) = self.router.send_message(message) {
        debug!("can not send signal to remote context {subscriber_context}: {e}");
      }
    }
    Ok(())
  }

  fn deliver_local(&self, source: &Address, signal: &SignalMessage) {
    let full_name = format!(
      "{}.{}.{}",
      source.context_id, source.object_id, signal.signal_name
    );
    let receivers: Vec<Arc<SignalReceiver>> = {
      let state = self.state.lock().unwrap();
      state
        .local_subscriptions
        .get(&full_name)
        .map(|subs| subs.values().cloned().collect())
        .unwrap_or_default()
    };
    // Delivery happens outside the lock; each receiver takes its own.
    for receiver in receivers {
      receiver.receive_signal(signal, source);
    }
  }

  fn handle_subscription_request(&self, message: &Message, request: &SignalSubscriptionRequest) {
    let subscriber_context = message.source.context_id.clone();
    let publisher_name = &request.publisher_name;
    let signal_name = &request.signal_name;
    debug!(
      "got {} request from {subscriber_context} for {publisher_name}.{signal_name}",
      if request.subscribe { "subscribe" } else { "unsubscribe" }
    );

    let full_name = format!("{publisher_name}.{signal_name}");
    let (success, error_msg) = if request.subscribe {
      if self.registry.descriptor_of(publisher_name).is_none() {
        (
          false,
          format!("unknown RPC object {}.{publisher_name}", self.context_name),
        )
      } else {
        {
          let mut state = self.state.lock().unwrap();
          state
            .remote_subscriptions
            .entry(full_name.clone())
            .or_default()
            .insert(subscriber_context.clone());
        }
        // The publisher may have vanished in between; undo and refuse.
        if self.registry.descriptor_of(publisher_name).is_none() {
          let mut state = self.state.lock().unwrap();
          remove_remote_subscriber(&mut state, &full_name, &subscriber_context);
          (
            false,
            format!("unknown RPC object {}.{publisher_name}", self.context_name),
          )
        } else {
          (true, String::new())
        }
      }
    } else {
      let mut state = self.state.lock().unwrap();
      remove_remote_subscriber(&mut state, &full_name, &subscriber_context);
      (true, String::new())
    };

    let reply = Message {
      source: message.destination.clone(),
      destination: message.source.clone(),
      body: MessageBody::SignalSubscriptionReply(SignalSubscriptionReply {
        request_id: request.request_id,
        success,
        error_msg,
      }),
    };
    // Reply delivery is best-effort.
    let _ = self.router.send_message(reply);
  }

  fn handle_subscription_reply(&self, request_id: RequestId, success: bool, error_msg: &str) {
    let mut new_request = None;
    {
      let mut state = self.state.lock().unwrap();
      let pending = match state.pending_by_request_id.remove(&request_id) {
        Some(pending) => pending,
        None => {
          warn!("received subscription reply for unknown request id {request_id}");
          return;
        }
      };
      let full_name = pending.full_name();
      state.pending_by_signal_name.remove(&full_name);

      let was_subscribe = *pending.subscribe.lock().unwrap();
      debug!(
        "got reply to {} request for {full_name}, status {success}",
        if was_subscribe { "subscribe" } else { "unsubscribe" }
      );

      if was_subscribe {
        if success {
          // Move the waiting receivers into the live subscription table.
          let mut receivers = pending.receivers.lock().unwrap();
          let target = state.local_subscriptions.entry(full_name).or_default();
          for (id, receiver) in receivers.drain() {
            target.insert(id, receiver);
          }
        }
        pending.event.set(success, error_msg.to_string());
      } else if !pending.receivers.lock().unwrap().is_empty() {
        // An unsubscribe completed while new subscribers appeared for the
        // same signal; immediately subscribe again on their behalf.
        let request = Message {
          source: self.own_address(),
          destination: Address::new(pending.publisher_context.clone(), PUBSUB_OBJECT_ID),
          body: MessageBody::SignalSubscriptionRequest(SignalSubscriptionRequest {
            request_id: RequestId::fresh(),
            publisher_name: pending.publisher_name.clone(),
            signal_name: pending.signal_name.clone(),
            subscribe: true,
          }),
        };
        let new_id = request.request_id().expect("subscription request has an id");
        *pending.subscribe.lock().unwrap() = true;
        state
          .pending_by_signal_name
          .insert(pending.full_name(), Arc::clone(&pending));
        state.pending_by_request_id.insert(new_id, pending);
        new_request = Some(request);
      }
    }

    if let Some(request) = new_request {
      self.send_subscription_request(request);
    }
  }

  fn handle_remote_signal_removed(&self, message: &Message, removed: &SignalRemoved) {
    let full_name = format!(
      "{}.{}.{}",
      message.source.context_id, removed.publisher_name, removed.signal_name
    );
    let mut state = self.state.lock().unwrap();
    state.local_subscriptions.remove(&full_name);
  }

  /// Called when a local RPC object is removed: drop local subscriptions
  /// on its signals and notify remote subscribers that the signals are
  /// gone.
  pub(crate) fn handle_object_removed(&self, object_name: &str) {
    let mut notify = Vec::new();
    {
      let mut state = self.state.lock().unwrap();

      let local_prefix = format!("{}.{object_name}.", self.context_name);
      state
        .local_subscriptions
        .retain(|full_name, _| !full_name.starts_with(&local_prefix));

      let remote_prefix = format!("{object_name}.");
      let removed: Vec<String> = state
        .remote_subscriptions
        .keys()
        .filter(|full_name| full_name.starts_with(&remote_prefix))
        .cloned()
        .collect();
      for full_name in removed {
        if let Some(subscribers) = state.remote_subscriptions.remove(&full_name) {
          if let Some((_, signal_name)) = full_name.split_once('.') {
            for subscriber_context in subscribers {
              notify.push((signal_name.to_string(), subscriber_context));
            }
          }
        }
      }
    }

    for (signal_name, subscriber_context) in notify {
      debug!(
        "sending signal removed notification to {subscriber_context} for \
         {object_name}.{signal_name}"
      );
      let message = Message {
        source: self.own_address(),
        destination: Address::new(subscriber_context, PUBSUB_OBJECT_ID),
        body: MessageBody::SignalRemoved(SignalRemoved {
          publisher_name: object_name.to_string(),
          signal_name,
        }),
      };
      // Best-effort notification.
      let _ = self.router.send_message(message);
    }
  }

  /// Called when a peer connection closes: drop remote subscribers in
  /// that context and local subscriptions on its publishers.
  pub(crate) fn handle_peer_context_removed(&self, context_name: &str) {
    let mut state = self.state.lock().unwrap();

    state.remote_subscriptions.retain(|_, subscribers| {
      subscribers.remove(context_name);
      !subscribers.is_empty()
    });

    let prefix = format!("{context_name}.");
    state
      .local_subscriptions
      .retain(|full_name, _| !full_name.starts_with(&prefix));
  }
}

fn remove_local_subscriber(state: &mut PubSubState, full_name: &str, receiver_id: u64) -> bool {
  if let Some(subs) = state.local_subscriptions.get_mut(full_name) {
    subs.remove(&receiver_id);
    if subs.is_empty() {
      state.local_subscriptions.remove(full_name);
      return true;
    }
  }
  false
}

fn remove_remote_subscriber(state: &mut PubSubState, full_name: &str, subscriber_context: &str) {
  if let Some(subs) = state.remote_subscriptions.get_mut(full_name) {
    subs.remove(subscriber_context);
    if subs.is_empty() {
      state.remote_subscriptions.remove(full_name);
    }
  }
}

impl MessageHandler for SignalManager {
  fn handle_message(&self, message: Message) -> Result<()> {
    debug_assert_eq!(message.destination.context_id, self.context_name);
    debug_assert_eq!(message.destination.object_id, PUBSUB_OBJECT_ID);

    // Control messages must originate from a peer's pub/sub manager.
    if !matches!(message.body, MessageBody::Signal(_))
      && message.source.object_id != PUBSUB_OBJECT_ID
    {
      return Err(Error::Protocol(format!(
        "unexpected message from {} to pub/sub manager",
        message.source
      )));
    }

    match &message.body {
      MessageBody::Signal(signal) => {
        self.deliver_local(&message.source, signal);
        Ok(())
      }
      MessageBody::SignalSubscriptionRequest(request) => {
        self.handle_subscription_request(&message, request);
        Ok(())
      }
      MessageBody::SignalSubscriptionReply(reply) => {
        self.handle_subscription_reply(reply.request_id, reply.success, &reply.error_msg);
        Ok(())
      }
      MessageBody::ErrorReply(reply) => {
        self.handle_subscription_reply(reply.request_id, false, &reply.error_msg);
        Ok(())
      }
      MessageBody::SignalRemoved(removed) => {
        self.handle_remote_signal_removed(&message, removed);
        Ok(())
      }
      other => Err(Error::Protocol(format!(
        "unexpected message type {other:?} for pub/sub manager"
      ))),
    }
  }
}

/// Publisher-side handle for a named signal, bound to a named object.
#[derive(Clone)]
pub struct RegisteredSignal {
  manager: Arc<SignalManager>,
  publisher_name: String,
  signal_name: String,
}

impl RegisteredSignal {
  pub(crate) fn new(manager: Arc<SignalManager>, publisher_name: &str, signal_name: &str) -> Self {
    Self {
      manager,
      publisher_name: publisher_name.to_string(),
      signal_name: signal_name.to_string(),
    }
  }

  /// Publish this signal to all subscribed receivers. Thread-safe.
  pub fn publish(&self, args: Vec<RpcValue>) -> Result<()> {
    self
      .manager
      .publish_signal(&self.publisher_name, &self.signal_name, args)
  }
}

/// Subscriber-side handle for a named signal of a (possibly remote)
/// object, obtained from a proxy.
pub struct SignalSubscriber {
  manager: Arc<SignalManager>,
  publisher_context: String,
  publisher_name: String,
  signal_name: String,
}

impl SignalSubscriber {
  pub(crate) fn new(
    manager: Arc<SignalManager>,
    publisher_context: String,
    publisher_name: String,
    signal_name: String,
  ) -> Self {
    Self {
      manager,
      publisher_context,
      publisher_name,
      signal_name,
    }
  }

  /// Subscribe a receiver to this signal. Blocks until established.
  pub fn subscribe(&self, receiver: &Arc<SignalReceiver>) -> Result<()> {
    self.manager.subscribe_signal(
      &self.publisher_context,
      &self.publisher_name,
      &self.signal_name,
      receiver,
    )
  }

  /// Unsubscribe a receiver from this signal.
  pub fn unsubscribe(&self, receiver: &Arc<SignalReceiver>) -> Result<()> {
    self.manager.unsubscribe_signal(
      &self.publisher_context,
      &self.publisher_name,
      &self.signal_name,
      receiver,
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn deliver(receiver: &SignalReceiver, n: i64) {
    let signal = SignalMessage {
      signal_name: "sig3".to_string(),
      args: vec![RpcValue::Int(n), RpcValue::Str(String::new())],
    };
    receiver.receive_signal(&signal, &Address::new("c1", "pub1"));
  }

  #[test]
  fn fifo_order_and_seqnr() {
    let receiver = SignalReceiver::new(10, DiscardPolicy::DiscardOld);
    for n in 0..3 {
      deliver(&receiver, n);
    }
    assert_eq!(receiver.queue_length(), 3);
    for n in 0..3 {
      let signal = receiver.get_next_signal(None).unwrap();
      assert_eq!(signal.args[0], RpcValue::Int(n));
      assert_eq!(signal.receiver_seqnr, n as u64);
      assert_eq!(signal.publisher_name, "pub1");
    }
    assert!(!receiver.has_signal_ready());
  }

  #[test]
  fn discard_old_keeps_the_tail() {
    // With queue length k, after k+m deliveries the queue holds the last
    // k signals and the sequence number has advanced by k+m.
    let receiver = SignalReceiver::new(5, DiscardPolicy::DiscardOld);
    for n in 10..20 {
      deliver(&receiver, n);
    }
    assert_eq!(receiver.queue_length(), 5);
    let signal = receiver.get_next_signal(None).unwrap();
    assert_eq!(signal.args[0], RpcValue::Int(15));
    assert_eq!(signal.receiver_seqnr, 5);
  }

  #[test]
  fn discard_new_drops_overflow() {
    let receiver = SignalReceiver::new(2, DiscardPolicy::DiscardNew);
    for n in 0..5 {
      deliver(&receiver, n);
    }
    assert_eq!(receiver.queue_length(), 2);
    assert_eq!(
      receiver.get_next_signal(None).unwrap().args[0],
      RpcValue::Int(0)
    );
    assert_eq!(
      receiver.get_next_signal(None).unwrap().args[0],
      RpcValue::Int(1)
    );
    // The counter still advanced for the dropped signals.
    deliver(&receiver, 5);
    assert_eq!(receiver.get_next_signal(None).unwrap().receiver_seqnr, 5);
  }

  #[test]
  fn empty_queue_times_out() {
    let receiver = SignalReceiver::new(2, DiscardPolicy::DiscardOld);
    match receiver.get_next_signal(Some(Duration::from_millis(10))) {
      Err(Error::Timeout) => {}
      other => panic!("expected timeout, got {other:?}"),
    }
  }

  #[test]
  fn discard_all_clears_queue() {
    let receiver = SignalReceiver::new(5, DiscardPolicy::DiscardOld);
    deliver(&receiver, 1);
    deliver(&receiver, 2);
    receiver.discard_all();
    assert_eq!(receiver.queue_length(), 0);
    // Sequence numbering continues after a discard.
    deliver(&receiver, 3);
    assert_eq!(receiver.get_next_signal(None).unwrap().receiver_seqnr, 2);
  }
}
