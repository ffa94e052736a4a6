//! Messaging internals: the event-loop worker, the socket manager with
//! its peer TCP connections, the message router and the wire framing.

pub(crate) mod event_loop;
pub(crate) mod socket_manager;

pub mod router;
pub mod wire;

pub use router::{MessageHandler, MessageRouter};
