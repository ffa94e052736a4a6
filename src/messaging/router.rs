//! Message routing within a context and across peer connections.

use std::{
  collections::{HashMap, HashSet},
  io::{Read, Write},
  net::{SocketAddr, TcpStream, ToSocketAddrs},
  sync::{
    atomic::{AtomicBool, AtomicU16, Ordering},
    Arc, Mutex,
  },
  time::{Duration, Instant},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  address::parse_host_and_port,
  error::{Error, Result},
  message::{Message, MessageBody},
};
use super::{
  event_loop::EventLoopHandle,
  socket_manager::SocketManager,
  wire::{encode_frame, FrameDecoder},
};

/// Timeout for connecting to a peer context via TCP. Short, since peers
/// are expected on the local network.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for the initial handshake on outgoing peer connections.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// An object that can receive messages addressed to it.
///
/// Handlers are registered with the router under their object name.
/// `handle_message` is called synchronously on the delivering thread and
/// must not block for long. It should not fail with anything other than
/// `Error::MessageDelivery`.
pub trait MessageHandler: Send + Sync {
  fn handle_message(&self, message: Message) -> Result<()>;
}

type PeerCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Sends and delivers messages within a context and between contexts.
///
/// Each context owns one router. The router hosts the registry of local
/// message handlers and, once started, the event-loop thread with all
/// network sockets.
pub struct MessageRouter {
  context_name: String,
  workgroup_name: String,
  version: String,
  handlers: Mutex<HashMap<String, Arc<dyn MessageHandler>>>,
  peer_names: Mutex<HashSet<String>>,
  loop_handle: Mutex<Option<Arc<EventLoopHandle>>>,
  tcp_server_port: AtomicU16,
  cb_peer_added: Mutex<Option<PeerCallback>>,
  cb_peer_removed: Mutex<Option<PeerCallback>>,
  suppress_version_mismatch: AtomicBool,
}

impl MessageRouter {
  pub fn new(context_name: &str, workgroup_name: &str, version: &str) -> Self {
    Self {
      context_name: context_name.to_string(),
      workgroup_name: workgroup_name.to_string(),
      version: version.to_string(),
      handlers: Mutex::new(HashMap::new()),
      peer_names: Mutex::new(HashSet::new()),
      loop_handle: Mutex::new(None),
      tcp_server_port: AtomicU16::new(0),
      cb_peer_added: Mutex::new(None),
      cb_peer_removed: Mutex::new(None),
      suppress_version_mismatch: AtomicBool::new(false),
    }
  }

  pub fn context_name(&self) -> &str {
    &self.context_name
  }

  pub fn workgroup_name(&self) -> &str {
    &self.workgroup_name
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Listening TCP port, or 0 when no TCP server was started.
  pub fn tcp_server_port(&self) -> u16 {
    self.tcp_server_port.load(Ordering::SeqCst)
  }

  pub fn set_suppress_version_mismatch_warnings(&self, value: bool) {
    self.suppress_version_mismatch.store(value, Ordering::SeqCst);
  }

  /// Register callbacks invoked when a peer context is added or removed.
  ///
  /// The added callback fires for outgoing connections only; the removed
  /// callback fires for both directions. Both run on the event-loop
  /// thread. Must be called before `start()`.
  pub fn set_peer_context_callbacks(
    &self,
    added: impl Fn(&str) + Send + Sync + 'static,
    removed: impl Fn(&str) + Send + Sync + 'static,
  ) -> Result<()> {
    if self.loop_handle.lock().unwrap().is_some() {
      return Err(Error::Usage(
        "peer context callbacks must be set before the router is started".to_string(),
      ));
    }
    *self.cb_peer_added.lock().unwrap() = Some(Box::new(added));
    *self.cb_peer_removed.lock().unwrap() = Some(Box::new(removed));
    Ok(())
  }

  /// Start the event-loop thread.
  pub fn start(self: Arc<Self>) -> Result<()> {
    let mut guard = self.loop_handle.lock().unwrap();
    if guard.is_some() {
      return Err(Error::Usage("message router already started".to_string()));
    }
    let router = Arc::clone(&self);
    let handle = EventLoopHandle::start(move |registry| SocketManager::new(registry, router))?;
    *guard = Some(Arc::new(handle));
    Ok(())
  }

  /// Close all peer connections and stop the event-loop thread.
  pub fn stop(&self) {
    let handle = self.loop_handle.lock().unwrap().take();
    if let Some(handle) = handle {
      let _ = handle.submit(|sockets| sockets.close_all());
      handle.shutdown();
    }
    self.peer_names.lock().unwrap().clear();
  }

  fn loop_handle(&self) -> Result<Arc<EventLoopHandle>> {
    self
      .loop_handle
      .lock()
      .unwrap()
      .clone()
      .ok_or_else(|| Error::MessageDelivery("message router inactive".to_string()))
  }

  /// Register a local message handler under its object name.
  pub fn register_message_handler(
    &self,
    object_id: &str,
    handler: Arc<dyn MessageHandler>,
  ) -> Result<()> {
    let mut handlers = self.handlers.lock().unwrap();
    if handlers.contains_key(object_id) {
      return Err(Error::DuplicateName(format!(
        "can not register duplicate message handler address {}.{object_id}",
        self.context_name
      )));
    }
    handlers.insert(object_id.to_string(), handler);
    Ok(())
  }

  /// Unregister a previously registered message handler. The handler must
  /// be the one registered under this name.
  pub fn unregister_message_handler(
    &self,
    object_id: &str,
    handler: &Arc<dyn MessageHandler>,
  ) -> Result<()> {
    let mut handlers = self.handlers.lock().unwrap();
    match handlers.get(object_id) {
      Some(registered) if Arc::ptr_eq(registered, handler) => {
        handlers.remove(object_id);
        Ok(())
      }
      _ => Err(Error::UnknownName(format!(
        "unknown message handler {}.{object_id}",
        self.context_name
      ))),
    }
  }

  /// Deliver a message to a local message handler.
  ///
  /// Thread-safe; may be called from any thread. The handler runs
  /// synchronously on the calling thread.
  pub fn deliver_message(&self, message: Message) -> Result<()> {
    if message.destination.context_id != self.context_name {
      return Err(Error::MessageDelivery(format!(
        "can not deliver message to non-local destination {}",
        message.destination
      )));
    }
    let handler = {
      let handlers = self.handlers.lock().unwrap();
      handlers.get(&message.destination.object_id).cloned()
    };
    match handler {
      Some(handler) => handler.handle_message(message),
      None => Err(Error::MessageDelivery(format!(
        "can not deliver message to unknown destination {}",
        message.destination
      ))),
    }
  }

  /// Send a message to its destination: locally delivered when the
  /// destination is this context, otherwise forwarded to the peer
  /// connection via the event loop.
  ///
  /// Thread-safe; may be called from any thread.
  pub fn send_message(&self, message: Message) -> Result<()> {
    if message.destination.context_id == self.context_name {
      return self.deliver_message(message);
    }

    // Forwarding between two remote contexts is not supported.
    if message.source.context_id != self.context_name {
      return Err(Error::MessageDelivery(format!(
        "can not send message from remote context {} to remote context {}",
        message.source.context_id, message.destination.context_id
      )));
    }
    let handle = self.loop_handle()?;
    if !self.has_peer_context(&message.destination.context_id) {
      return Err(Error::MessageDelivery(format!(
        "can not send message to unknown context {:?}",
        message.destination.context_id
      )));
    }
    handle.submit_send(message)
  }

  /// Start the TCP server for incoming peer connections.
  ///
  /// `port` may be 0 to let the OS assign a free port; the resulting port
  /// is available from [`tcp_server_port`](Self::tcp_server_port).
  pub fn start_tcp_server(&self, port: u16) -> Result<()> {
    let handle = self.loop_handle()?;
    if self.tcp_server_port() != 0 {
      return Err(Error::Usage("TCP server already started".to_string()));
    }
    info!("starting TCP server on port {port} ...");

    let socket = socket2::Socket::new(
      socket2::Domain::IPV4,
      socket2::Type::STREAM,
      Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    let bind_addr: SocketAddr = ([0, 0, 0, 0], port).into();
    socket.bind(&bind_addr.into())?;
    socket.listen(5)?;
    socket.set_nonblocking(true)?;

    let listener: std::net::TcpListener = socket.into();
    let local_port = listener.local_addr()?.port();
    self.tcp_server_port.store(local_port, Ordering::SeqCst);

    let listener = mio::net::TcpListener::from_std(listener);
    handle.submit(move |sockets| sockets.add_tcp_server(listener))
  }

  /// Start the UDP discovery responder on the specified port.
  ///
  /// The port is shared between contexts on one host via address reuse.
  pub fn start_udp_responder(&self, port: u16) -> Result<()> {
    let handle = self.loop_handle()?;
    if port == 0 {
      return Err(Error::Usage("UDP responder port may not be 0".to_string()));
    }
    info!("starting UDP responder on port {port} ...");

    let socket = socket2::Socket::new(
      socket2::Domain::IPV4,
      socket2::Type::DGRAM,
      Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    let bind_addr: SocketAddr = ([0, 0, 0, 0], port).into();
    socket.bind(&bind_addr.into())?;
    socket.set_nonblocking(true)?;

    let socket = mio::net::UdpSocket::from_std(socket.into());
    handle.submit(move |sockets| sockets.add_udp_responder(socket))
  }

  /// Connect as a client to a remote context at `"host:port"`.
  ///
  /// Blocks the calling thread for the TCP connect (2 s timeout) and the
  /// handshake exchange (30 s timeout), then transfers the established
  /// connection into the event loop.
  pub fn connect_to_peer(&self, peer_name: &str, peer_address: &str) -> Result<()> {
    let handle = self.loop_handle()?;

    if peer_name.starts_with('$') {
      return Err(Error::Usage(format!("invalid peer context name {peer_name}")));
    }
    if self.has_peer_context(peer_name) {
      return Err(Error::Usage(format!(
        "duplicate connection to context {peer_name} not allowed"
      )));
    }

    let (host, port) = parse_host_and_port(peer_address)?;
    info!("connecting to peer context {peer_name} at {host}:{port}");

    let mut stream = connect_with_timeout(&host, port)?;
    stream.set_nodelay(true)?;

    // Exchange handshakes in the calling thread, with blocking I/O.
    let client_handshake = Message::handshake(&self.context_name, &self.version, false);
    stream.write_all(&encode_frame(&client_handshake)?)?;
    let (server_handshake, decoder) = receive_handshake(&mut stream, HANDSHAKE_TIMEOUT)?;

    let (declared_name, peer_version) = match server_handshake.body {
      MessageBody::Handshake(handshake) if handshake.is_server => {
        (server_handshake.source.context_id, handshake.version)
      }
      MessageBody::Handshake(_) => {
        return Err(Error::Protocol(
          "received client handshake while connecting as client".to_string(),
        ));
      }
      other => {
        return Err(Error::Protocol(format!(
          "expecting handshake message but got {other:?}"
        )));
      }
    };
    if declared_name != peer_name {
      return Err(Error::Protocol(format!(
        "got handshake from context {declared_name} while expecting {peer_name}"
      )));
    }
    if peer_version != self.version && !self.suppress_version_mismatch.load(Ordering::SeqCst) {
      warn!(
        "version mismatch detected; peer context {peer_name} at {host}:{port} runs version \
         {peer_version} (local version is {})",
        self.version
      );
    }

    // Transfer the connection to the event loop.
    let peer_name = peer_name.to_string();
    handle.submit_wait(move |sockets| {
      sockets.add_outgoing_connection(stream, peer_name, peer_version, decoder)
    })
  }

  /// Disconnect from the named peer context. Performed inside the event
  /// loop; blocks until done.
  pub fn disconnect_from_peer(&self, peer_name: &str) -> Result<()> {
    let handle = self.loop_handle()?;
    info!("disconnecting from peer context {peer_name}");
    let peer_name = peer_name.to_string();
    handle.submit_wait(move |sockets| sockets.disconnect_from_peer(&peer_name))
  }

  /// Names of currently connected peer contexts (real names for outgoing
  /// connections, `$client_N` aliases for incoming ones). Thread-safe.
  pub fn get_peer_context_names(&self) -> Vec<String> {
    self.peer_names.lock().unwrap().iter().cloned().collect()
  }

  /// Thread-safe membership test; the result may become stale at any
  /// time as peers connect and disconnect asynchronously.
  pub fn has_peer_context(&self, peer_name: &str) -> bool {
    self.peer_names.lock().unwrap().contains(peer_name)
  }

  pub(crate) fn peer_name_added(&self, name: &str) {
    self.peer_names.lock().unwrap().insert(name.to_string());
  }

  pub(crate) fn peer_name_removed(&self, name: &str) {
    self.peer_names.lock().unwrap().remove(name);
  }

  pub(crate) fn notify_peer_context_added(&self, name: &str) {
    let cb = self.cb_peer_added.lock().unwrap();
    if let Some(cb) = cb.as_ref() {
      cb(name);
    }
  }

  pub(crate) fn notify_peer_context_removed(&self, name: &str) {
    let cb = self.cb_peer_removed.lock().unwrap();
    if let Some(cb) = cb.as_ref() {
      cb(name);
    }
  }
}

fn connect_with_timeout(host: &str, port: u16) -> Result<TcpStream> {
  let addrs: Vec<SocketAddr> = (host, port)
    .to_socket_addrs()
    .map_err(|e| Error::UnknownName(format!("can not resolve {host}: {e}")))?
    .collect();
  let mut last_error = None;
  for addr in addrs {
    match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
      Ok(stream) => return Ok(stream),
      Err(e) => last_error = Some(e),
    }
  }
  Err(match last_error {
    Some(e) => e.into(),
    None => Error::UnknownName(format!("no addresses found for {host}")),
  })
}

/// Blocking read of the first framed message on a fresh connection.
///
/// Returns the message and the decoder holding any bytes that arrived
/// after it; those are handed over to the event loop together with the
/// connection.
fn receive_handshake(stream: &mut TcpStream, timeout: Duration) -> Result<(Message, FrameDecoder)> {
  let deadline = Instant::now() + timeout;
  let mut decoder = FrameDecoder::new();
  let mut buf = [0u8; 4096];
  loop {
    if let Some(message) = decoder.next_message()? {
      stream.set_read_timeout(None)?;
      return Ok((message, decoder));
    }
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
      return Err(Error::Timeout);
    }
    stream.set_read_timeout(Some(remaining))?;
    match stream.read(&mut buf) {
      Ok(0) => {
        return Err(Error::Protocol(
          "connection closed by peer before handshake".to_string(),
        ));
      }
      Ok(n) => decoder.extend(&buf[..n]),
      Err(e)
        if e.kind() == std::io::ErrorKind::WouldBlock
          || e.kind() == std::io::ErrorKind::TimedOut =>
      {
        return Err(Error::Timeout);
      }
      Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
      Err(e) => return Err(e.into()),
    }
  }
}
