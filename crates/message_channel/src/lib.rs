//! Structured-data pipe between two execution contexts.
//!
//! A channel is an entangled pair of [`Port`]s. Whatever one port posts, the
//! other receives, in posting order. A message carries JSON data plus a
//! transfer list of further ports, so an endpoint can be handed to a third
//! context the same way a browser transfers a `MessagePort`.

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde_json::Value;

pub use crossbeam_channel::{RecvTimeoutError, TryRecvError};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "ch#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("message channel {channel} closed")]
pub struct ChannelClosed {
    pub channel: ChannelId,
}

/// One posted message.
pub struct Envelope {
    pub data: Value,
    pub transfer: Vec<Port>,
}

impl Envelope {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            transfer: Vec::new(),
        }
    }

    pub fn with_transfer(data: Value, transfer: Vec<Port>) -> Self {
        Self { data, transfer }
    }
}

impl Debug for Envelope {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Envelope")
            .field("data", &self.data)
            .field("transfer_len", &self.transfer.len())
            .finish()
    }
}

/// Sending half of a port. Cheap to clone; the peer only observes the
/// channel as closed once every clone is gone.
#[derive(Clone)]
pub struct PortSender {
    channel: ChannelId,
    inner: Sender<Envelope>,
}

impl PortSender {
    pub fn channel_id(&self) -> ChannelId {
        self.channel
    }

    pub fn post(&self, envelope: Envelope) -> Result<(), ChannelClosed> {
        self.inner.send(envelope).map_err(|_| ChannelClosed {
            channel: self.channel,
        })
    }

    pub fn post_message(&self, data: Value, transfer: Vec<Port>) -> Result<(), ChannelClosed> {
        self.post(Envelope::with_transfer(data, transfer))
    }
}

impl Debug for PortSender {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "PortSender({})", self.channel)
    }
}

/// Receiving half of a port.
pub struct PortReceiver {
    channel: ChannelId,
    inner: Receiver<Envelope>,
}

impl PortReceiver {
    pub fn channel_id(&self) -> ChannelId {
        self.channel
    }

    pub fn try_recv(&self) -> Result<Envelope, TryRecvError> {
        self.inner.try_recv()
    }

    pub fn recv(&self) -> Result<Envelope, ChannelClosed> {
        self.inner.recv().map_err(|_| ChannelClosed {
            channel: self.channel,
        })
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Envelope, RecvTimeoutError> {
        self.inner.recv_timeout(timeout)
    }

    /// Raw receiver, for `crossbeam_channel::select!` in actor loops.
    pub fn as_receiver(&self) -> &Receiver<Envelope> {
        &self.inner
    }
}

impl Debug for PortReceiver {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "PortReceiver({})", self.channel)
    }
}

/// One end of a message channel.
pub struct Port {
    sender: PortSender,
    receiver: PortReceiver,
}

impl Port {
    pub fn channel_id(&self) -> ChannelId {
        self.sender.channel
    }

    pub fn post_message(&self, data: Value, transfer: Vec<Port>) -> Result<(), ChannelClosed> {
        self.sender.post_message(data, transfer)
    }

    pub fn post(&self, envelope: Envelope) -> Result<(), ChannelClosed> {
        self.sender.post(envelope)
    }

    pub fn try_recv(&self) -> Result<Envelope, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv(&self) -> Result<Envelope, ChannelClosed> {
        self.receiver.recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Envelope, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn sender(&self) -> &PortSender {
        &self.sender
    }

    pub fn receiver(&self) -> &PortReceiver {
        &self.receiver
    }

    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }
}

impl Debug for Port {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "Port({})", self.sender.channel)
    }
}

/// Create an entangled pair of ports.
pub fn message_channel() -> (Port, Port) {
    let channel = ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed));
    let (left_to_right_sender, left_to_right_receiver) = unbounded();
    let (right_to_left_sender, right_to_left_receiver) = unbounded();

    let left = Port {
        sender: PortSender {
            channel,
            inner: left_to_right_sender,
        },
        receiver: PortReceiver {
            channel,
            inner: right_to_left_receiver,
        },
    };
    let right = Port {
        sender: PortSender {
            channel,
            inner: right_to_left_sender,
        },
        receiver: PortReceiver {
            channel,
            inner: left_to_right_receiver,
        },
    };
    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_arrive_in_posting_order() {
        let (left, right) = message_channel();
        for index in 0..5 {
            left.post_message(json!({ "index": index }), Vec::new())
                .unwrap_or_else(|error| panic!("post message {index}: {error}"));
        }
        for index in 0..5 {
            let envelope = right
                .try_recv()
                .unwrap_or_else(|error| panic!("receive message {index}: {error}"));
            assert_eq!(envelope.data["index"], json!(index));
        }
        assert!(matches!(right.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn both_directions_are_independent() {
        let (left, right) = message_channel();
        left.post_message(json!("to-right"), Vec::new())
            .unwrap_or_else(|error| panic!("post: {error}"));
        right
            .post_message(json!("to-left"), Vec::new())
            .unwrap_or_else(|error| panic!("post: {error}"));
        assert_eq!(right.try_recv().map(|envelope| envelope.data).ok(), Some(json!("to-right")));
        assert_eq!(left.try_recv().map(|envelope| envelope.data).ok(), Some(json!("to-left")));
    }

    #[test]
    fn transferred_port_stays_entangled_with_its_peer() {
        let (left, right) = message_channel();
        let (kept, transferred) = message_channel();
        left.post_message(json!({ "port": 0 }), vec![transferred])
            .unwrap_or_else(|error| panic!("post with transfer: {error}"));

        let mut envelope = right
            .try_recv()
            .unwrap_or_else(|error| panic!("receive transfer: {error}"));
        let received_port = envelope.transfer.remove(0);
        assert_eq!(received_port.channel_id(), kept.channel_id());

        received_port
            .post_message(json!("hello"), Vec::new())
            .unwrap_or_else(|error| panic!("post on transferred port: {error}"));
        assert_eq!(kept.try_recv().map(|envelope| envelope.data).ok(), Some(json!("hello")));
    }

    #[test]
    fn dropping_peer_closes_channel() {
        let (left, right) = message_channel();
        let channel = left.channel_id();
        drop(right);

        assert_eq!(
            left.post_message(json!(null), Vec::new()),
            Err(ChannelClosed { channel })
        );
        assert!(matches!(left.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn queued_messages_survive_peer_drop() {
        let (left, right) = message_channel();
        right
            .post_message(json!(1), Vec::new())
            .unwrap_or_else(|error| panic!("post: {error}"));
        drop(right);

        assert_eq!(left.recv().map(|envelope| envelope.data).ok(), Some(json!(1)));
        assert!(left.recv().is_err());
    }
}
