//! Socket ownership and peer connection handling inside the event loop.
//!
//! The socket manager owns one optional UDP responder, an optional TCP
//! listener and the set of peer TCP connections. It runs exclusively on
//! the event-loop thread; other threads reach it through the loop's
//! submission primitives.

use std::{
  collections::HashMap,
  io::{self, Read, Write},
  sync::Arc,
};

use bytes::{Buf, BytesMut};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio::{
  event::Event,
  net::{TcpListener, TcpStream, UdpSocket},
  Interest, Registry, Token,
};

use crate::{
  address::Address,
  discovery::{glob_match, posix_timestamp, ContextDescriptor, DiscoveryPacket},
  error::{Error, Result},
  message::{Message, MessageBody},
};
use super::{
  router::MessageRouter,
  wire::{encode_frame, FrameDecoder},
};

/// A TCP connection to a peer context, either outgoing (client side) or
/// incoming (server side).
pub(crate) struct PeerConnection {
  stream: TcpStream,
  token: Token,
  /// Local name used to address this peer. The real context name for
  /// outgoing connections; `$client_N` for incoming connections.
  alias: String,
  is_incoming: bool,
  /// Declared name of the peer, known once the handshake is received.
  peer_name: Option<String>,
  peer_version: Option<String>,
  peer_addr: String,
  decoder: FrameDecoder,
  out_buf: BytesMut,
  want_writable: bool,
  /// Outgoing requests awaiting a reply: request id -> (source,
  /// destination) of the request.
  pending_requests: HashMap<crate::address::RequestId, (Address, Address)>,
}

impl PeerConnection {
  fn new(
    stream: TcpStream,
    token: Token,
    alias: String,
    is_incoming: bool,
    peer_name: Option<String>,
    peer_version: Option<String>,
    decoder: FrameDecoder,
  ) -> Self {
    let peer_addr = stream
      .peer_addr()
      .map(|a| a.to_string())
      .unwrap_or_else(|_| "[unknown]".to_string());
    Self {
      stream,
      token,
      alias,
      is_incoming,
      peer_name,
      peer_version,
      peer_addr,
      decoder,
      out_buf: BytesMut::new(),
      want_writable: false,
      pending_requests: HashMap::new(),
    }
  }

  fn peer_display(&self) -> &str {
    self.peer_name.as_deref().unwrap_or(&self.alias)
  }

  /// Serialize and queue a message for this peer, flushing as much as the
  /// socket accepts. Requests are recorded in the pending table.
  fn send_message(&mut self, registry: &Registry, mut message: Message) -> Result<()> {
    // Replace the local alias by the real peer context name. Handshakes
    // have no destination and are skipped.
    if !matches!(message.body, MessageBody::Handshake(_)) {
      debug_assert_eq!(message.destination.context_id, self.alias);
      let peer_name = self
        .peer_name
        .clone()
        .ok_or_else(|| Error::InvalidOperation("peer name not yet known".to_string()))?;
      message.destination = Address::new(peer_name, message.destination.object_id.clone());
    }

    let frame = encode_frame(&message)?;
    self.out_buf.extend_from_slice(&frame);
    self.flush(registry)?;

    if let Some(request_id) = message.request_id() {
      if self.pending_requests.contains_key(&request_id) {
        warn!(
          "duplicate request id {request_id} in message to {}",
          message.destination
        );
      } else {
        self
          .pending_requests
          .insert(request_id, (message.source.clone(), message.destination.clone()));
      }
    }
    Ok(())
  }

  /// Write buffered data until the socket would block.
  fn flush(&mut self, registry: &Registry) -> Result<()> {
    while !self.out_buf.is_empty() {
      match self.stream.write(&self.out_buf) {
        Ok(0) => {
          return Err(io::Error::from(io::ErrorKind::WriteZero).into());
        }
        Ok(n) => self.out_buf.advance(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => return Err(e.into()),
      }
    }
    let need_writable = !self.out_buf.is_empty();
    if need_writable != self.want_writable {
      let interest = if need_writable {
        Interest::READABLE | Interest::WRITABLE
      } else {
        Interest::READABLE
      };
      registry.reregister(&mut self.stream, self.token, interest)?;
      self.want_writable = need_writable;
    }
    Ok(())
  }

  /// Synthesize error replies for requests that will never be answered
  /// because this connection is closing.
  fn take_pending_error_replies(&mut self) -> Vec<Message> {
    let reason = format!(
      "Connection to {} closed while waiting for reply",
      self.peer_display()
    );
    self
      .pending_requests
      .drain()
      .map(|(request_id, (source, destination))| Message {
        source: destination,
        destination: source,
        body: MessageBody::ErrorReply(crate::message::ErrorReply {
          request_id,
          error_msg: reason.clone(),
        }),
      })
      .collect()
  }
}

enum SocketSlot {
  Udp(UdpSocket),
  Listener(TcpListener),
}

/// Owner of all sockets of one router.
pub(crate) struct SocketManager {
  registry: Registry,
  router: Arc<MessageRouter>,
  next_token: usize,
  slots: HashMap<Token, SocketSlot>,
  connections: HashMap<Token, PeerConnection>,
  /// Alias (outgoing: peer name; incoming: `$client_N`) -> token.
  peer_tokens: HashMap<String, Token>,
  client_alias_counter: u64,
}

impl SocketManager {
  pub fn new(registry: &Registry, router: Arc<MessageRouter>) -> io::Result<Self> {
    debug!("socket manager initializing");
    Ok(Self {
      registry: registry.try_clone()?,
      router,
      next_token: 1, // token 0 is the waker
      slots: HashMap::new(),
      connections: HashMap::new(),
      peer_tokens: HashMap::new(),
      client_alias_counter: 0,
    })
  }

  fn fresh_token(&mut self) -> Token {
    let token = Token(self.next_token);
    self.next_token += 1;
    token
  }

  /// Attach a pre-bound, non-blocking UDP responder socket.
  pub fn add_udp_responder(&mut self, mut socket: UdpSocket) {
    let token = self.fresh_token();
    match self.registry.register(&mut socket, token, Interest::READABLE) {
      Ok(()) => {
        debug!("UDP responder ready on {:?}", socket.local_addr().ok());
        self.slots.insert(token, SocketSlot::Udp(socket));
      }
      Err(e) => error!("can not register UDP responder: {e}"),
    }
  }

  /// Attach a pre-bound, non-blocking TCP listener socket.
  pub fn add_tcp_server(&mut self, mut listener: TcpListener) {
    let token = self.fresh_token();
    match self
      .registry
      .register(&mut listener, token, Interest::READABLE)
    {
      Ok(()) => {
        debug!("TCP server ready on {:?}", listener.local_addr().ok());
        self.slots.insert(token, SocketSlot::Listener(listener));
      }
      Err(e) => error!("can not register TCP listener: {e}"),
    }
  }

  /// Attach an outgoing connection whose handshake has already completed
  /// in the calling thread.
  pub fn add_outgoing_connection(
    &mut self,
    stream: std::net::TcpStream,
    peer_name: String,
    peer_version: String,
    decoder: FrameDecoder,
  ) -> Result<()> {
    if self.peer_tokens.contains_key(&peer_name) {
      return Err(Error::Usage(format!(
        "duplicate connection to context {peer_name}"
      )));
    }
    stream.set_nonblocking(true)?;
    let mut stream = TcpStream::from_std(stream);
    let token = self.fresh_token();
    self
      .registry
      .register(&mut stream, token, Interest::READABLE)?;
    let conn = PeerConnection::new(
      stream,
      token,
      peer_name.clone(),
      false,
      Some(peer_name.clone()),
      Some(peer_version),
      decoder,
    );
    self.connections.insert(token, conn);
    self.peer_tokens.insert(peer_name.clone(), token);
    self.router.peer_name_added(&peer_name);
    self.router.notify_peer_context_added(&peer_name);

    // The peer may already have sent messages right behind its
    // handshake; they are sitting in the decoder.
    self.drain_received(token);
    Ok(())
  }

  /// Dispatch a readiness event to the socket it belongs to.
  pub fn handle_event(&mut self, event: &Event) {
    let token = event.token();
    if self.connections.contains_key(&token) {
      if event.is_writable() {
        let flushed = match self.connections.get_mut(&token) {
          Some(conn) => conn
            .flush(&self.registry)
            .map_err(|e| format!("error on connection to {} - closing: {e}", conn.peer_addr)),
          None => Ok(()),
        };
        if let Err(reason) = flushed {
          info!("{reason}");
          self.remove_connection(token, true);
          return;
        }
      }
      if event.is_readable() {
        self.handle_connection_readable(token);
      }
    } else {
      let is_udp = matches!(self.slots.get(&token), Some(SocketSlot::Udp(_)));
      let is_listener = matches!(self.slots.get(&token), Some(SocketSlot::Listener(_)));
      if is_udp {
        self.handle_udp_readable(token);
      } else if is_listener {
        self.handle_accept(token);
      }
    }
  }

  fn handle_udp_readable(&mut self, token: Token) {
    let mut buf = [0u8; 4096];
    loop {
      let socket = match self.slots.get(&token) {
        Some(SocketSlot::Udp(socket)) => socket,
        _ => return,
      };
      let (len, incoming) = match socket.recv_from(&mut buf) {
        Ok(received) => received,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
        Err(e) => {
          warn!("UDP responder receive failed: {e}");
          return;
        }
      };
      match DiscoveryPacket::unpack(&buf[..len]) {
        Ok(DiscoveryPacket::ContextInfoRequest {
          pkt_id,
          pkt_timestamp,
          workgroup_filter,
          context_filter,
        }) => {
          if !glob_match(&workgroup_filter, self.router.workgroup_name())
            || !glob_match(&context_filter, self.router.context_name())
          {
            continue;
          }
          let tcp_port = self.router.tcp_server_port();
          let response = DiscoveryPacket::ContextInfoResponse {
            pkt_id: rand::random::<u64>() | 1,
            pkt_timestamp: posix_timestamp(),
            request_pkt_id: pkt_id,
            request_pkt_timestamp: pkt_timestamp,
            descriptor: ContextDescriptor {
              pid: std::process::id() as i32,
              name: self.router.context_name().to_string(),
              workgroup: self.router.workgroup_name().to_string(),
              port: if tcp_port > 0 { tcp_port as i32 } else { -1 },
            },
          };
          match response.pack() {
            Ok(bytes) => {
              if let Err(e) = socket.send_to(&bytes, incoming) {
                warn!("can not send discovery response to {incoming}: {e}");
              }
            }
            Err(e) => error!("can not pack discovery response: {e}"),
          }
        }
        Ok(DiscoveryPacket::KillRequest { .. }) => {
          println!("Answering external hard-kill request, exiting with exitcode 1.");
          std::process::exit(1);
        }
        Ok(other) => {
          warn!("discarded unexpected discovery packet {other:?}");
        }
        Err(e) => {
          debug!("discarded bad UDP packet from {incoming}: {e}");
        }
      }
    }
  }

  fn handle_accept(&mut self, token: Token) {
    loop {
      let listener = match self.slots.get(&token) {
        Some(SocketSlot::Listener(listener)) => listener,
        _ => return,
      };
      let (stream, incoming) = match listener.accept() {
        Ok(accepted) => accepted,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
        Err(e) => {
          // Accept can fail on an early TCP protocol error.
          warn!("accepting new TCP connection failed: {e}");
          return;
        }
      };
      debug!("incoming TCP connection from {incoming}");
      if let Err(e) = stream.set_nodelay(true) {
        // We can work correctly without TCP_NODELAY.
        warn!("setting TCP_NODELAY failed on incoming connection: {e}");
      }
      self.add_incoming_connection(stream);
    }
  }

  fn add_incoming_connection(&mut self, mut stream: TcpStream) {
    self.client_alias_counter += 1;
    let alias = format!("$client_{}", self.client_alias_counter);

    let conn_token = self.fresh_token();
    if let Err(e) = self
      .registry
      .register(&mut stream, conn_token, Interest::READABLE)
    {
      error!("can not register incoming connection: {e}");
      return;
    }
    let mut conn = PeerConnection::new(
      stream,
      conn_token,
      alias.clone(),
      true,
      None,
      None,
      FrameDecoder::new(),
    );

    // Greet the client; the connection stays in handshake-pending state
    // until the client handshake arrives.
    let handshake = Message::handshake(self.router.context_name(), self.router.version(), true);
    if let Err(e) = conn.send_message(&self.registry, handshake) {
      warn!("error on new incoming connection: {e}");
      let _ = self.registry.deregister(&mut conn.stream);
      return;
    }
    self.connections.insert(conn_token, conn);
    self.peer_tokens.insert(alias.clone(), conn_token);
    self.router.peer_name_added(&alias);
  }

  fn handle_connection_readable(&mut self, token: Token) {
    let mut buf = [0u8; 4096];
    loop {
      let read_result = match self.connections.get_mut(&token) {
        Some(conn) => conn.stream.read(&mut buf),
        None => return,
      };
      match read_result {
        Ok(0) => {
          if let Some(conn) = self.connections.get(&token) {
            debug!(
              "connection to {} ({}) closed by peer",
              conn.peer_addr,
              conn.peer_display()
            );
          }
          self.remove_connection(token, true);
          return;
        }
        Ok(n) => {
          if let Some(conn) = self.connections.get_mut(&token) {
            conn.decoder.extend(&buf[..n]);
          }
          if !self.drain_received(token) {
            return;
          }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => {
          if let Some(conn) = self.connections.get(&token) {
            info!("error on connection to {} - closing: {e}", conn.peer_addr);
          }
          self.remove_connection(token, true);
          return;
        }
      }
    }
  }

  /// Process all complete messages buffered on a connection. Returns
  /// false if the connection was closed.
  fn drain_received(&mut self, token: Token) -> bool {
    loop {
      let conn = match self.connections.get_mut(&token) {
        Some(conn) => conn,
        None => return false,
      };
      match conn.decoder.next_message() {
        Ok(Some(message)) => {
          if let Err(e) = self.process_message(token, message) {
            let peer = self
              .connections
              .get(&token)
              .map(|c| c.peer_addr.clone())
              .unwrap_or_default();
            info!("error on connection to {peer} - closing: {e}");
            self.remove_connection(token, true);
            return false;
          }
        }
        Ok(None) => return true,
        Err(e) => {
          info!(
            "protocol error on connection to {} - closing: {e}",
            conn.peer_addr
          );
          self.remove_connection(token, true);
          return false;
        }
      }
    }
  }

  /// Handle one message received from a peer connection.
  fn process_message(&mut self, token: Token, mut message: Message) -> Result<()> {
    let conn = self
      .connections
      .get_mut(&token)
      .ok_or_else(|| Error::InvalidOperation("connection vanished".to_string()))?;

    if conn.peer_name.is_none() {
      // The first message from the peer must be the handshake.
      let handshake = match &message.body {
        MessageBody::Handshake(handshake) => handshake,
        other => {
          return Err(Error::Protocol(format!(
            "expecting handshake message but got {other:?}"
          )));
        }
      };
      if handshake.is_server && conn.is_incoming {
        return Err(Error::Protocol(
          "received server handshake from connecting client".to_string(),
        ));
      }
      if !handshake.is_server && !conn.is_incoming {
        return Err(Error::Protocol(
          "received client handshake while connecting as client".to_string(),
        ));
      }
      debug!("received handshake from {:?}", message.source.context_id);
      conn.peer_name = Some(message.source.context_id.clone());
      conn.peer_version = Some(handshake.version.clone());
      return Ok(());
    }

    if matches!(message.body, MessageBody::Handshake(_)) {
      return Err(Error::Protocol(
        "unexpected handshake message from peer".to_string(),
      ));
    }

    // Sanity checks: the destination must be us, the source must be the
    // peer's declared name. The source is rewritten to the local alias so
    // local handlers see a stable name.
    if message.destination.context_id != self.router.context_name() {
      return Err(Error::MessageDelivery(format!(
        "unexpected destination context {} in message from {}",
        message.destination.context_id,
        conn.peer_display()
      )));
    }
    let peer_name = conn.peer_name.as_deref().unwrap_or_default();
    if message.source.context_id != peer_name {
      return Err(Error::MessageDelivery(format!(
        "unexpected source context {} in message from {peer_name}",
        message.source.context_id
      )));
    }
    message.source = Address::new(conn.alias.clone(), message.source.object_id.clone());

    if let Some(request_id) = message.reply_request_id() {
      if conn.pending_requests.remove(&request_id).is_none() {
        warn!("received reply message for unknown request id {request_id}");
      }
    }

    let request_info = message
      .request_id()
      .map(|id| (id, message.source.clone(), message.destination.clone()));
    match self.router.deliver_message(message) {
      Ok(()) => {}
      Err(Error::MessageDelivery(reason)) => {
        warn!("{reason}");
        if let Some((request_id, source, destination)) = request_info {
          self.send_error_reply_on(token, request_id, source, destination, &reason);
        }
      }
      Err(e) => {
        // A handler failed; this must not bring the connection down.
        error!("unexpected error while delivering message: {e}");
      }
    }
    Ok(())
  }

  fn send_error_reply_on(
    &mut self,
    token: Token,
    request_id: crate::address::RequestId,
    request_source: Address,
    request_destination: Address,
    reason: &str,
  ) {
    let peer_context = request_source.context_id.clone();
    let reply = Message {
      source: request_destination,
      destination: request_source,
      body: MessageBody::ErrorReply(crate::message::ErrorReply {
        request_id,
        error_msg: reason.to_string(),
      }),
    };
    if let Some(conn) = self.connections.get_mut(&token) {
      // The reply's destination carries the alias; send_message maps it
      // back to the peer's real name.
      if let Err(e) = conn.send_message(&self.registry, reply) {
        warn!("error while sending error reply to {peer_context}: {e}");
      }
    }
  }

  /// Send a message to the right peer context. On failure of a request,
  /// an error reply is generated and delivered locally. Never panics and
  /// never returns an error: this runs directly on the event loop.
  pub fn send_message(&mut self, message: Message) {
    debug_assert_eq!(message.source.context_id, self.router.context_name());

    // Keep what is needed to synthesize an error reply if sending fails.
    let request_info = message
      .request_id()
      .map(|id| (id, message.source.clone(), message.destination.clone()));

    let destination_context = message.destination.context_id.clone();
    let error_msg = match self.peer_tokens.get(&destination_context) {
      Some(&token) => match self.connections.get_mut(&token) {
        Some(conn) => match conn.send_message(&self.registry, message) {
          Ok(()) => None,
          Err(e) => {
            error!("error while sending message to context {destination_context}: {e}");
            Some(e.to_string())
          }
        },
        None => Some(format!(
          "Unknown message destination context {destination_context}"
        )),
      },
      None => {
        warn!("unknown message destination context {destination_context:?}");
        Some(format!(
          "Unknown message destination context {destination_context}"
        ))
      }
    };

    if let (Some(reason), Some((request_id, source, destination))) = (error_msg, request_info) {
      let reply = Message {
        source: destination,
        destination: source,
        body: MessageBody::ErrorReply(crate::message::ErrorReply {
          request_id,
          error_msg: reason,
        }),
      };
      let reply_destination = reply.destination.clone();
      if let Err(e) = self.router.deliver_message(reply) {
        debug!("failed to deliver error reply to {reply_destination}: {e}");
      }
    }
  }

  /// Remove a peer connection: deregister, synthesize error replies for
  /// its pending requests, and optionally notify the router.
  fn remove_connection(&mut self, token: Token, notify: bool) {
    let mut conn = match self.connections.remove(&token) {
      Some(conn) => conn,
      None => return,
    };
    debug!(
      "closing TCP connection to {} ({:?}, version {:?})",
      conn.peer_addr, conn.peer_name, conn.peer_version
    );
    let _ = self.registry.deregister(&mut conn.stream);
    self.peer_tokens.remove(&conn.alias);
    self.router.peer_name_removed(&conn.alias);

    for reply in conn.take_pending_error_replies() {
      let destination = reply.destination.clone();
      if self.router.deliver_message(reply).is_err() {
        debug!("failed to deliver error reply to {destination} while closing socket");
      }
    }

    if notify {
      self.router.notify_peer_context_removed(&conn.alias);
    }
  }

  /// Disconnect from the named peer context.
  pub fn disconnect_from_peer(&mut self, peer_name: &str) -> Result<()> {
    match self.peer_tokens.get(peer_name) {
      Some(&token) => {
        self.remove_connection(token, true);
        Ok(())
      }
      None => Err(Error::UnknownName(format!(
        "unknown peer context {peer_name}"
      ))),
    }
  }

  /// Close every socket. Called when the router stops. Pending requests
  /// get error replies; peer-removed callbacks are not invoked.
  pub fn close_all(&mut self) {
    debug!("socket manager closing all sockets");
    let tokens: Vec<Token> = self.connections.keys().copied().collect();
    for token in tokens {
      self.remove_connection(token, false);
    }
    for (_, slot) in self.slots.drain() {
      match slot {
        SocketSlot::Udp(mut socket) => {
          let _ = self.registry.deregister(&mut socket);
        }
        SocketSlot::Listener(mut listener) => {
          let _ = self.registry.deregister(&mut listener);
        }
      }
    }
  }
}

impl Drop for SocketManager {
  fn drop(&mut self) {
    self.close_all();
  }
}
