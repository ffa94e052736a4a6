//! The context: object registry, lifecycle and the tie between router,
//! pub/sub manager and RPC workers.

use std::{
  collections::HashMap,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Condvar, Mutex,
  },
  thread::{self, ThreadId},
  time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  address::{is_valid_name, Address},
  config::Config,
  discovery::{self, DEFAULT_UDP_RESPONDER_PORT},
  error::{Error, Result},
  message::{LockToken, Message, RpcValue},
  messaging::{MessageHandler, MessageRouter},
  proxy::RpcProxy,
  pubsub::{RegisteredSignal, SignalManager, SignalReceiver, PUBSUB_OBJECT_ID},
  rpc::{make_descriptor, MethodTable, RpcObjectDescriptor, RpcObjectManager, RpcService},
  task::{Task, TaskContext, TaskProxy, TaskRunner},
  VERSION,
};

/// Reserved name of the per-context information object.
pub const CONTEXT_OBJECT_ID: &str = "$context";

// Process-wide count of active (started, not yet stopped) contexts.
static ACTIVE_CONTEXTS: AtomicUsize = AtomicUsize::new(0);

/// Registry of the RPC objects living in one context.
///
/// Name reservation is two-phase: the name is first claimed with an empty
/// slot, then the live manager is swapped in once its worker finished
/// construction. This keeps name uniqueness and worker startup atomic
/// with respect to each other.
pub(crate) struct ObjectRegistry {
  map: Mutex<HashMap<String, Option<Arc<RpcObjectManager>>>>,
}

impl ObjectRegistry {
  fn new() -> Self {
    Self {
      map: Mutex::new(HashMap::new()),
    }
  }

  fn live_manager(&self, name: &str) -> Option<Arc<RpcObjectManager>> {
    self.map.lock().unwrap().get(name).cloned().flatten()
  }

  /// Descriptor of the named object, if it exists (waits for a worker
  /// still constructing).
  pub(crate) fn descriptor_of(&self, name: &str) -> Option<RpcObjectDescriptor> {
    self.live_manager(name).and_then(|m| m.wait_ready().ok())
  }

  fn descriptors(&self) -> Vec<RpcObjectDescriptor> {
    let managers: Vec<Arc<RpcObjectManager>> = {
      let map = self.map.lock().unwrap();
      map.values().flatten().cloned().collect()
    };
    managers
      .into_iter()
      .filter_map(|m| m.wait_ready().ok())
      .collect()
  }
}

/// Shared kernel of a context, handed to proxies and futures.
pub(crate) struct ContextCore {
  pub(crate) name: String,
  pub(crate) router: Arc<MessageRouter>,
  pub(crate) pubsub: Arc<SignalManager>,
  pub(crate) registry: Arc<ObjectRegistry>,
  counters: Mutex<HashMap<String, u64>>,
}

impl ContextCore {
  /// Generate a unique object name with the given prefix (`$future_N`,
  /// `$lock_N`, ...).
  pub(crate) fn make_unique_id(&self, prefix: &str) -> String {
    let mut counters = self.counters.lock().unwrap();
    let n = counters.entry(prefix.to_string()).or_insert(0);
    *n += 1;
    format!("{prefix}{n}")
  }

  pub(crate) fn make_unique_token(&self, prefix: &str) -> LockToken {
    LockToken::new(self.name.clone(), self.make_unique_id(prefix))
  }
}

struct ShutdownFlag {
  state: Mutex<bool>,
  cond: Condvar,
}

impl ShutdownFlag {
  fn new() -> Self {
    Self {
      state: Mutex::new(false),
      cond: Condvar::new(),
    }
  }

  fn set(&self) {
    *self.state.lock().unwrap() = true;
    self.cond.notify_all();
  }

  fn is_set(&self) -> bool {
    *self.state.lock().unwrap()
  }

  fn wait(&self, duration: Duration) -> bool {
    let guard = self.state.lock().unwrap();
    let (guard, _) = self
      .cond
      .wait_timeout_while(guard, duration, |set| !*set)
      .unwrap();
    *guard
  }
}

/// Internal RPC object answering queries about the local context.
struct ContextInfoService {
  registry: Arc<ObjectRegistry>,
  shutdown: Arc<ShutdownFlag>,
}

impl RpcService for ContextInfoService {
  fn class_name() -> &'static str {
    "ContextInfo"
  }

  fn doc() -> &'static str {
    "Information about the local context."
  }

  fn category() -> Option<&'static str> {
    Some("context")
  }

  fn method_table() -> MethodTable<Self> {
    MethodTable::new()
      .method(
        "get_version",
        "() -> str",
        "Return the runtime version used by this context.",
        |_service: &mut Self, _| Ok(RpcValue::Str(VERSION.to_string())),
      )
      .method(
        "get_pid",
        "() -> int",
        "Return the process ID of the program hosting this context.",
        |_service, _| Ok(RpcValue::Int(std::process::id() as i64)),
      )
      .method(
        "get_rpc_object_descriptors",
        "() -> list",
        "Return descriptors of all RPC objects in this context.",
        |service, _| {
          let descriptors = service
            .registry
            .descriptors()
            .iter()
            .map(RpcObjectDescriptor::to_value)
            .collect();
          Ok(RpcValue::List(descriptors))
        },
      )
      .method(
        "get_rpc_object_descriptor",
        "(name: str) -> descriptor",
        "Return the descriptor of the named RPC object, or null.",
        |service, call| {
          let name = call.require_str(0)?.to_string();
          Ok(match service.registry.descriptor_of(&name) {
            Some(descriptor) => descriptor.to_value(),
            None => RpcValue::Null,
          })
        },
      )
      .method(
        "shutdown_context",
        "(hard: bool)",
        "Tell the context to shut down. A hard shutdown exits the \
         process immediately with exit code 1; a soft shutdown sets a \
         flag the application is expected to observe.",
        |service, call| {
          let hard = call.require(0)?.as_bool().unwrap_or(false);
          if hard {
            info!("received hard shutdown request");
            println!("Answering external hard-kill request, exiting with exitcode 1.");
            std::process::exit(1);
          }
          info!("received soft shutdown request");
          service.shutdown.set();
          Ok(RpcValue::Null)
        },
      )
  }
}

struct Lifecycle {
  active: bool,
  used: bool,
}

/// A named runtime instance hosting RPC objects, connected by TCP to a
/// mesh of peer contexts.
///
/// Unless documented otherwise, methods may only be called from the
/// thread that created the context; violations fail with
/// `Error::WrongThread`. Thread-safe exceptions: [`send_message`]
/// (`Context::send_message`), signal subscribe/unsubscribe/publish, and
/// everything on [`SignalReceiver`].
pub struct Context {
  core: Arc<ContextCore>,
  config: Config,
  lifecycle: Mutex<Lifecycle>,
  creation_thread: ThreadId,
  shutdown: Arc<ShutdownFlag>,
  stop_handlers: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
  start_time: SystemTime,
}

impl Context {
  /// Create a new context. It must be started with [`start`]
  /// (`Context::start`) before peers can be contacted or objects
  /// created.
  pub fn new(name: &str, config: Config) -> Result<Self> {
    debug!("initializing context {name:?}");
    if !is_valid_name(name) {
      return Err(Error::Usage(format!("invalid context name {name:?}")));
    }

    let registry = Arc::new(ObjectRegistry::new());
    let router = Arc::new(MessageRouter::new(name, &config.workgroup, VERSION));
    let pubsub = SignalManager::new(name, Arc::clone(&router), Arc::clone(&registry));

    let pubsub_cb = Arc::clone(&pubsub);
    router.set_peer_context_callbacks(
      |_peer| {},
      move |peer| pubsub_cb.handle_peer_context_removed(peer),
    )?;
    router.register_message_handler(
      PUBSUB_OBJECT_ID,
      Arc::clone(&pubsub) as Arc<dyn MessageHandler>,
    )?;

    let core = Arc::new(ContextCore {
      name: name.to_string(),
      router,
      pubsub,
      registry: Arc::clone(&registry),
      counters: Mutex::new(HashMap::new()),
    });

    let context = Self {
      core,
      config,
      lifecycle: Mutex::new(Lifecycle {
        active: false,
        used: false,
      }),
      creation_thread: thread::current().id(),
      shutdown: Arc::new(ShutdownFlag::new()),
      stop_handlers: Mutex::new(Vec::new()),
      start_time: SystemTime::now(),
    };

    // The internal information object exists from the start.
    let info_registry = Arc::clone(&registry);
    let info_shutdown = Arc::clone(&context.shutdown);
    context.internal_make_rpc_object(CONTEXT_OBJECT_ID, move || {
      Ok(ContextInfoService {
        registry: info_registry,
        shutdown: info_shutdown,
      })
    })?;

    Ok(context)
  }

  fn check_in_context_thread(&self) -> Result<()> {
    if thread::current().id() != self.creation_thread {
      return Err(Error::WrongThread("not in context main thread".to_string()));
    }
    Ok(())
  }

  pub fn name(&self) -> &str {
    &self.core.name
  }

  pub fn workgroup_name(&self) -> &str {
    &self.config.workgroup
  }

  pub fn get_version(&self) -> &'static str {
    VERSION
  }

  pub fn get_config(&self) -> &Config {
    &self.config
  }

  /// Number of active contexts in this process.
  pub fn active_count() -> usize {
    ACTIVE_CONTEXTS.load(Ordering::SeqCst)
  }

  /// Suppress the warning emitted when a peer runs a different runtime
  /// version.
  pub fn set_suppress_version_mismatch_warnings(&self, value: bool) {
    self.core.router.set_suppress_version_mismatch_warnings(value);
  }

  /// Start the context: the event loop, the TCP server (when
  /// configured) and the UDP discovery responder.
  pub fn start(&self) -> Result<()> {
    self.check_in_context_thread()?;
    info!("starting context {:?}", self.core.name);
    {
      let lifecycle = self.lifecycle.lock().unwrap();
      if lifecycle.active {
        return Err(Error::Usage("context already started".to_string()));
      }
      if lifecycle.used {
        return Err(Error::Usage(
          "can not start a context a second time".to_string(),
        ));
      }
    }

    Arc::clone(&self.core.router).start()?;

    let context_config = self.config.context(&self.core.name);
    if let Some(port) = context_config.tcp_server_port {
      self.core.router.start_tcp_server(port)?;
    }
    if let Some(port) = self.config.udp_responder_port {
      self.core.router.start_udp_responder(port)?;
    }

    let mut lifecycle = self.lifecycle.lock().unwrap();
    lifecycle.active = true;
    lifecycle.used = true;
    ACTIVE_CONTEXTS.fetch_add(1, Ordering::SeqCst);
    info!("context {:?} now active", self.core.name);
    Ok(())
  }

  /// Stop the context: run stop handlers, close all connections, stop
  /// every RPC worker. A stopped context can not be restarted.
  pub fn stop(&self) -> Result<()> {
    self.check_in_context_thread()?;
    info!("stopping context {:?}", self.core.name);
    if !self.lifecycle.lock().unwrap().active {
      return Err(Error::Usage("context already inactive".to_string()));
    }
    self.stop_internal();
    Ok(())
  }

  fn stop_internal(&self) {
    // Give subsystems a chance to stop first; their failures must not
    // interrupt shutdown.
    let handlers: Vec<_> = self.stop_handlers.lock().unwrap().drain(..).collect();
    for handler in handlers {
      if std::panic::catch_unwind(std::panic::AssertUnwindSafe(handler)).is_err() {
        error!("context stop handler failed");
      }
    }

    self.core.router.stop();

    let managers: Vec<(String, Arc<RpcObjectManager>)> = {
      let mut lifecycle = self.lifecycle.lock().unwrap();
      lifecycle.active = false;
      let mut map = self.core.registry.map.lock().unwrap();
      let names: Vec<String> = map
        .iter()
        .filter(|(_, manager)| manager.is_some())
        .map(|(name, _)| name.clone())
        .collect();
      names
        .into_iter()
        .filter_map(|name| map.remove(&name).flatten().map(|m| (name, m)))
        .collect()
    };
    for (name, manager) in managers {
      let handler = Arc::clone(&manager) as Arc<dyn MessageHandler>;
      let _ = self
        .core
        .router
        .unregister_message_handler(&name, &handler);
      manager.stop();
    }

    ACTIVE_CONTEXTS.fetch_sub(1, Ordering::SeqCst);
  }

  /// True if a soft shutdown was requested via the `$context` object.
  /// Thread-safe.
  pub fn shutdown_requested(&self) -> bool {
    self.shutdown.is_set()
  }

  /// Wait up to `duration` for a shutdown request; true when one
  /// arrived. Thread-safe.
  pub fn wait_until_shutdown(&self, duration: Duration) -> bool {
    self.shutdown.wait(duration)
  }

  /// Register a callback invoked when this context stops.
  pub fn register_stop_handler(&self, handler: impl FnOnce() + Send + 'static) -> Result<()> {
    self.check_in_context_thread()?;
    self.stop_handlers.lock().unwrap().push(Box::new(handler));
    Ok(())
  }

  /// Send a message to its destination, local or remote. Thread-safe.
  pub fn send_message(&self, message: Message) -> Result<()> {
    self.core.router.send_message(message)
  }

  /// Connect to a peer context. When `peer_address` is `None`, the
  /// address is taken from the configuration.
  pub fn connect_to_peer(&self, peer_context_name: &str, peer_address: Option<&str>) -> Result<()> {
    self.check_in_context_thread()?;
    if !self.lifecycle.lock().unwrap().active {
      return Err(Error::InvalidOperation(
        "inactive context can not connect to peer".to_string(),
      ));
    }
    let address = match peer_address {
      Some(address) => address.to_string(),
      None => {
        let peer_config = self.config.contexts.get(peer_context_name).ok_or_else(|| {
          Error::UnknownName(format!("unknown remote context {peer_context_name}"))
        })?;
        match (&peer_config.host, peer_config.tcp_server_port) {
          (Some(host), Some(port)) => crate::address::format_host_and_port(host, port),
          _ => {
            return Err(Error::Configuration(format!(
              "missing host/port for peer context {peer_context_name}"
            )));
          }
        }
      }
    };
    self.core.router.connect_to_peer(peer_context_name, &address)
  }

  /// Disconnect from a peer context.
  pub fn disconnect_from_peer(&self, peer_context_name: &str) -> Result<()> {
    self.check_in_context_thread()?;
    if !self.lifecycle.lock().unwrap().active {
      return Err(Error::InvalidOperation(
        "inactive context can not have peers".to_string(),
      ));
    }
    self.core.router.disconnect_from_peer(peer_context_name)
  }

  /// True if the named context is currently connected as a peer. The
  /// result may become stale at any time.
  pub fn has_peer_context(&self, peer_context_name: &str) -> bool {
    self.core.router.has_peer_context(peer_context_name)
  }

  /// Names of currently connected peer contexts.
  pub fn get_peer_context_names(&self) -> Vec<String> {
    self.core.router.get_peer_context_names()
  }

  /// Listening TCP port, or 0 when the context has no TCP server.
  pub fn get_tcp_server_port(&self) -> u16 {
    if self.lifecycle.lock().unwrap().active {
      self.core.router.tcp_server_port()
    } else {
      0
    }
  }

  /// Discover contexts on the network via UDP broadcast.
  ///
  /// Filters are shell-style globs (`*`, `?`), case-sensitive. The local
  /// context is excluded from the results. Returns
  /// `(context_name, "host:port")` pairs suitable for
  /// [`connect_to_peer`](Self::connect_to_peer).
  pub fn discover_peer_contexts(
    &self,
    workgroup_filter: Option<&str>,
    context_filter: &str,
    timeout: Duration,
  ) -> Result<Vec<(String, String)>> {
    let workgroup_filter = workgroup_filter.unwrap_or(&self.config.workgroup);
    let target = self
      .config
      .discovery_target
      .as_deref()
      .unwrap_or("255.255.255.255");
    // The target may carry an explicit port; otherwise the configured
    // responder port is used.
    let (host, port) = match crate::address::parse_host_and_port(target) {
      Ok(parsed) => parsed,
      Err(_) => (
        target.to_string(),
        self
          .config
          .udp_responder_port
          .unwrap_or(DEFAULT_UDP_RESPONDER_PORT),
      ),
    };
    let responses =
      discovery::discover_contexts(&host, port, workgroup_filter, context_filter, timeout)?;
    Ok(
      responses
        .into_iter()
        .filter(|r| r.descriptor.name != self.core.name)
        .map(|r| (r.descriptor.name, r.address))
        .collect(),
    )
  }

  /// Create an RPC object hosted by a new worker thread and return a
  /// proxy for it.
  ///
  /// The `maker` runs inside the worker thread; its failure is returned
  /// from here and the name is released again.
  pub fn make_rpc_object<S: RpcService>(
    &self,
    name: &str,
    maker: impl FnOnce() -> Result<S> + Send + 'static,
  ) -> Result<RpcProxy> {
    if !is_valid_name(name) {
      return Err(Error::Usage(format!("invalid object name {name:?}")));
    }
    self.internal_make_rpc_object(name, maker)
  }

  fn internal_make_rpc_object<S: RpcService>(
    &self,
    name: &str,
    maker: impl FnOnce() -> Result<S> + Send + 'static,
  ) -> Result<RpcProxy> {
    // Claim the name first; the live manager is swapped in below.
    {
      let lifecycle = self.lifecycle.lock().unwrap();
      let mut map = self.core.registry.map.lock().unwrap();
      if !lifecycle.active && !name.starts_with('$') {
        return Err(Error::InvalidOperation(
          "can not create RPC object in inactive context".to_string(),
        ));
      }
      if map.contains_key(name) {
        return Err(Error::DuplicateName(format!("duplicate object name {name}")));
      }
      map.insert(name.to_string(), None);
    }

    let result = self.start_rpc_object(name, maker);
    if result.is_err() {
      self.core.registry.map.lock().unwrap().remove(name);
    }
    result
  }

  fn start_rpc_object<S: RpcService>(
    &self,
    name: &str,
    maker: impl FnOnce() -> Result<S> + Send + 'static,
  ) -> Result<RpcProxy> {
    let address = Address::new(self.core.name.clone(), name);
    let manager = RpcObjectManager::start(address, Arc::clone(&self.core.router), maker)?;

    // Blocks until the worker ran the constructor; a constructor error
    // surfaces here.
    let descriptor = match manager.wait_ready() {
      Ok(descriptor) => descriptor,
      Err(e) => {
        manager.stop();
        return Err(e);
      }
    };

    {
      let lifecycle = self.lifecycle.lock().unwrap();
      let mut map = self.core.registry.map.lock().unwrap();
      if !lifecycle.active && !name.starts_with('$') {
        drop(map);
        drop(lifecycle);
        manager.stop();
        return Err(Error::InvalidOperation(
          "can not create RPC object in inactive context".to_string(),
        ));
      }
      map.insert(name.to_string(), Some(Arc::clone(&manager)));
    }

    let handler = Arc::clone(&manager) as Arc<dyn MessageHandler>;
    if let Err(e) = self.core.router.register_message_handler(name, handler) {
      manager.stop();
      return Err(e);
    }

    Ok(RpcProxy::new(Arc::clone(&self.core), descriptor))
  }

  /// Stop the named local RPC object and release its resources.
  pub fn remove_rpc_object(&self, proxy: &RpcProxy) -> Result<()> {
    let address = proxy.address();
    if address.context_id != self.core.name {
      return Err(Error::Usage(format!(
        "can not remove remote RPC object {address}"
      )));
    }
    let name = address.object_id.clone();

    let manager = {
      let mut map = self.core.registry.map.lock().unwrap();
      match map.get(&name).cloned().flatten() {
        Some(manager) => {
          // Mark the object as being removed.
          map.insert(name.clone(), None);
          manager
        }
        None => {
          return Err(Error::UnknownName(format!(
            "can not remove unknown RPC object {name}"
          )));
        }
      }
    };

    let handler = Arc::clone(&manager) as Arc<dyn MessageHandler>;
    let _ = self.core.router.unregister_message_handler(&name, &handler);

    // Drop subscriptions on signals published by this object.
    self.core.pubsub.handle_object_removed(&name);

    self.core.registry.map.lock().unwrap().remove(&name);
    manager.stop();
    Ok(())
  }

  /// Create a background task managed by a [`TaskRunner`] and return a
  /// typed proxy for it. The task is not started yet.
  pub fn make_task<T: Task>(
    &self,
    name: &str,
    maker: impl FnOnce(&TaskContext) -> Result<T> + Send + 'static,
  ) -> Result<TaskProxy> {
    if !is_valid_name(name) {
      return Err(Error::Usage(format!("invalid task name {name:?}")));
    }
    let pubsub = Arc::clone(&self.core.pubsub);
    let task_name = name.to_string();
    let proxy = self.internal_make_rpc_object(name, move || {
      TaskRunner::<T>::new(&task_name, pubsub, maker)
    })?;
    Ok(TaskProxy::new(proxy))
  }

  /// Descriptors of all RPC objects in this context.
  pub fn get_rpc_object_descriptors(&self) -> Vec<RpcObjectDescriptor> {
    self.core.registry.descriptors()
  }

  /// Descriptor of the named local RPC object, if it exists.
  pub fn get_rpc_object_descriptor(&self, name: &str) -> Option<RpcObjectDescriptor> {
    self.core.registry.descriptor_of(name)
  }

  /// Build a proxy from an object descriptor.
  pub fn proxy_for(&self, descriptor: RpcObjectDescriptor) -> RpcProxy {
    RpcProxy::new(Arc::clone(&self.core), descriptor)
  }

  /// Proxy for the internal `$context` object of a peer context.
  pub fn peer_context_proxy(&self, context_name: &str) -> RpcProxy {
    let descriptor = make_descriptor::<ContextInfoService>(
      Address::new(context_name, CONTEXT_OBJECT_ID),
      &ContextInfoService::method_table(),
    );
    self.proxy_for(descriptor)
  }

  /// Proxy for an object anywhere in the mesh, looked up by
  /// `"context.object"` name via the owning context's `$context` object.
  pub fn get_rpc_object_by_name(&self, full_name: &str) -> Result<RpcProxy> {
    let address = Address::parse(full_name)?;
    let context_proxy = self.peer_context_proxy(&address.context_id);
    let value = context_proxy.call(
      "get_rpc_object_descriptor",
      vec![RpcValue::Str(address.object_id.clone())],
    )?;
    if value.is_null() {
      return Err(Error::UnknownName(format!("unknown RPC object {full_name}")));
    }
    let descriptor = RpcObjectDescriptor::from_value(&value)?;
    Ok(self.proxy_for(descriptor))
  }

  /// Publisher handle for a signal of a named local object, for use by
  /// the object's own code.
  pub fn signal_publisher(&self, publisher_name: &str, signal_name: &str) -> RegisteredSignal {
    RegisteredSignal::new(Arc::clone(&self.core.pubsub), publisher_name, signal_name)
  }

  /// Subscribe a receiver to a signal. An empty `publisher_context`
  /// refers to the local context. Thread-safe; blocks until established.
  pub fn subscribe_signal(
    &self,
    publisher_context: &str,
    publisher_name: &str,
    signal_name: &str,
    receiver: &Arc<SignalReceiver>,
  ) -> Result<()> {
    self
      .core
      .pubsub
      .subscribe_signal(publisher_context, publisher_name, signal_name, receiver)
  }

  /// Unsubscribe a receiver from a signal. Thread-safe.
  pub fn unsubscribe_signal(
    &self,
    publisher_context: &str,
    publisher_name: &str,
    signal_name: &str,
    receiver: &Arc<SignalReceiver>,
  ) -> Result<()> {
    self
      .core
      .pubsub
      .unsubscribe_signal(publisher_context, publisher_name, signal_name, receiver)
  }

  /// Publish a signal on behalf of a named local object. Thread-safe.
  pub fn publish_signal(
    &self,
    publisher_name: &str,
    signal_name: &str,
    args: Vec<RpcValue>,
  ) -> Result<()> {
    self.core.pubsub.publish_signal(publisher_name, signal_name, args)
  }

  /// The home directory: configured `home`, else `LABMESH_HOME`, else
  /// the user's home directory.
  pub fn home_dir(&self) -> String {
    if let Some(home) = &self.config.home {
      return home.clone();
    }
    if let Ok(home) = std::env::var("LABMESH_HOME") {
      return home;
    }
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
  }

  /// Directory for log files: configured `log_dir` (with substitutions
  /// applied), else the home directory.
  pub fn log_dir(&self) -> Result<String> {
    match &self.config.log_dir {
      Some(log_dir) => self.resolve_file_name(log_dir),
      None => Ok(self.home_dir()),
    }
  }

  /// Base directory of the datastore.
  pub fn datastore_dir(&self) -> Result<String> {
    let datastore = self.config.datastore.as_ref().ok_or_else(|| {
      Error::Configuration("missing field 'datastore' in configuration".to_string())
    })?;
    if file_name_references_keyword(datastore, "datastore") {
      return Err(Error::Configuration(
        "recursive reference to 'datastore' directory".to_string(),
      ));
    }
    self.resolve_file_name(datastore)
  }

  /// Apply substitutions to a configured file name.
  ///
  /// Supported: `$$` (a literal `$`), `${context}`, `${home}`,
  /// `${datastore}`, `${config_dir}`, `${date}` (program start, UTC,
  /// `YYYY-mm-dd`) and `${datetime}` (`YYYY-mm-ddTHH-MM-SS`).
  pub fn resolve_file_name(&self, file_name: &str) -> Result<String> {
    if !file_name.contains('$') {
      return Ok(file_name.to_string());
    }

    let home = self.home_dir();
    let config_dir = match &self.config.config_file {
      Some(config_file) => std::path::Path::new(config_file)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| home.clone()),
      None => home.clone(),
    };
    let start: DateTime<Utc> = self.start_time.into();
    let date = start.format("%Y-%m-%d").to_string();
    let datetime = start.format("%Y-%m-%dT%H-%M-%S").to_string();

    // The datastore directory is only resolved when referenced; its
    // resolution fails when unconfigured and recurses through this
    // function.
    let datastore = if file_name_references_keyword(file_name, "datastore") {
      Some(self.datastore_dir()?)
    } else {
      None
    };

    substitute_keywords(file_name, |keyword| match keyword {
      "context" => Some(self.core.name.clone()),
      "home" => Some(home.clone()),
      "config_dir" => Some(config_dir.clone()),
      "date" => Some(date.clone()),
      "datetime" => Some(datetime.clone()),
      "datastore" => datastore.clone(),
      _ => None,
    })
  }
}

impl Drop for Context {
  fn drop(&mut self) {
    if self.lifecycle.lock().unwrap().active {
      warn!(
        "context {:?} dropped while still active; stopping it now",
        self.core.name
      );
      self.stop_internal();
    }
  }
}

/// True if `file_name` uses the given `${keyword}` (or `$keyword`)
/// substitution.
fn file_name_references_keyword(file_name: &str, keyword: &str) -> bool {
  let mut found = false;
  // Errors are ignored here; resolution reports them properly.
  let _ = substitute_keywords(file_name, |k| {
    if k == keyword {
      found = true;
    }
    Some(String::new())
  });
  found
}

/// Substitute `$$`, `${keyword}` and `$keyword` occurrences.
fn substitute_keywords(
  input: &str,
  mut lookup: impl FnMut(&str) -> Option<String>,
) -> Result<String> {
  let mut output = String::with_capacity(input.len());
  let mut chars = input.char_indices().peekable();
  while let Some((_, c)) = chars.next() {
    if c != '$' {
      output.push(c);
      continue;
    }
    match chars.peek() {
      Some((_, '$')) => {
        chars.next();
        output.push('$');
      }
      Some((_, '{')) => {
        chars.next();
        let mut keyword = String::new();
        let mut closed = false;
        for (_, k) in chars.by_ref() {
          if k == '}' {
            closed = true;
            break;
          }
          keyword.push(k);
        }
        if !closed {
          return Err(Error::Configuration(format!(
            "unterminated substitution in {input:?}"
          )));
        }
        match lookup(&keyword) {
          Some(replacement) => output.push_str(&replacement),
          None => {
            return Err(Error::Configuration(format!(
              "unknown substitution ${{{keyword}}} in {input:?}"
            )));
          }
        }
      }
      _ => {
        let mut keyword = String::new();
        while let Some((_, k)) = chars.peek() {
          if k.is_ascii_alphanumeric() || *k == '_' {
            keyword.push(*k);
            chars.next();
          } else {
            break;
          }
        }
        if keyword.is_empty() {
          return Err(Error::Configuration(format!(
            "stray '$' in file name {input:?}"
          )));
        }
        match lookup(&keyword) {
          Some(replacement) => output.push_str(&replacement),
          None => {
            return Err(Error::Configuration(format!(
              "unknown substitution ${keyword} in {input:?}"
            )));
          }
        }
      }
    }
  }
  Ok(output)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_context(name: &str) -> Context {
    let mut config = Config::default();
    config.udp_responder_port = None;
    config.home = Some("/data/mesh".to_string());
    config.datastore = Some("${home}/store".to_string());
    config.config_file = Some("/etc/mesh/site.conf".to_string());
    Context::new(name, config).unwrap()
  }

  #[test]
  fn file_name_substitutions() {
    let context = test_context("ctx9");
    assert_eq!(context.resolve_file_name("plain.txt").unwrap(), "plain.txt");
    assert_eq!(
      context.resolve_file_name("${home}/x_$$_${context}.dat").unwrap(),
      "/data/mesh/x_$_ctx9.dat"
    );
    assert_eq!(
      context.resolve_file_name("${datastore}/out").unwrap(),
      "/data/mesh/store/out"
    );
    assert_eq!(
      context.resolve_file_name("${config_dir}/more").unwrap(),
      "/etc/mesh/more"
    );
    let dated = context.resolve_file_name("${date}").unwrap();
    assert_eq!(dated.len(), 10);
    assert!(context.resolve_file_name("${nope}").is_err());
  }

  #[test]
  fn datastore_must_not_self_reference() {
    let mut config = Config::default();
    config.udp_responder_port = None;
    config.datastore = Some("${datastore}/loop".to_string());
    let context = Context::new("ctx10", config).unwrap();
    assert!(matches!(
      context.datastore_dir(),
      Err(Error::Configuration(_))
    ));
  }

  #[test]
  fn invalid_context_name_is_rejected() {
    assert!(matches!(
      Context::new("bad name", Config::default()),
      Err(Error::Usage(_))
    ));
  }
}
