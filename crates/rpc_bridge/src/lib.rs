//! Call/response semantics over a message channel.
//!
//! One side exposes a local object ([`expose`]); the other side wraps its end
//! of the channel into a [`Remote`] ([`wrap`]) and calls methods by name.
//! Both sides speak [`rpc_protocol::RpcMessage`].
//!
//! The exposing context executes calls on its own thread, whenever its loop
//! serves the [`ExposedPort`]. The calling context never blocks on a call:
//! [`Remote::call`] returns a [`PendingCall`] immediately and a background
//! reader routes each response to its call by correlation id.

mod expose;
mod remote;

use message_channel::{ChannelId, Port, message_channel};

pub use expose::{Exposed, ExposedPort, IncomingCall, Reply, Responder, ServeStatus, expose};
pub use remote::{CallError, PendingCall, Remote, TypedCall, wrap};
pub use rpc_protocol::{CallId, RemoteError};

/// Opaque reference to an object exposed on the other end of one channel.
///
/// A handle is the channel endpoint itself, so it can be moved into a call's
/// transfer list and wrapped by whichever context ends up holding it. It is
/// meaningless outside its channel and dead once the channel closes.
#[derive(Debug)]
pub struct ProxyHandle {
    port: Port,
}

impl ProxyHandle {
    pub fn from_port(port: Port) -> Self {
        Self { port }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.port.channel_id()
    }

    pub fn into_port(self) -> Port {
        self.port
    }
}

/// Open a fresh channel, expose one end, and return a handle to the other.
pub fn expose_new() -> (ExposedPort, ProxyHandle) {
    let (local, remote) = message_channel();
    (expose(local), ProxyHandle::from_port(remote))
}
