//! Peer-facing seams: connections, the peer manager, the rebroadcaster.
//!
//! Transport (TCP, handshake, read loops) is an external collaborator.
//! The node only needs a way to send messages to a peer and to
//! enumerate the peers currently able to receive them; inbound traffic
//! arrives as [`PeerEvent`]s on a channel. [`ChannelConnection`] is a
//! loopback implementation used by tests and single-process setups.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use galena_core::types::Transaction;

use crate::messages::{FrameError, Message};

/// A peer the node can send messages to.
pub trait Connection: Send + Sync {
    /// Queue a message for delivery to this peer.
    fn send(&self, message: Message) -> Result<(), FrameError>;

    /// Human-readable peer identity for logs.
    fn peer_label(&self) -> String;
}

/// The set of currently-ready peers.
pub trait PeerManager: Send + Sync {
    /// Every connection that completed its handshake and is writable.
    fn active_connections(&self) -> Vec<Arc<dyn Connection>>;
}

/// Seam for the transaction rebroadcaster: transactions submitted
/// locally are registered here so they keep being announced until
/// confirmed.
pub trait TxRebroadcast: Send + Sync {
    fn register(&self, tx: Arc<Transaction>);
}

/// Inbound activity delivered to the node's event loop.
pub enum PeerEvent {
    /// The first peer finished its handshake.
    Connected,
    /// A parsed message arrived from a peer.
    Message { from: Arc<dyn Connection>, message: Message },
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::Connected => write!(f, "Connected"),
            PeerEvent::Message { from, message } => f
                .debug_struct("Message")
                .field("from", &from.peer_label())
                .field("command", &message.command())
                .finish(),
        }
    }
}

/// Loopback connection backed by an unbounded channel.
pub struct ChannelConnection {
    label: String,
    sender: mpsc::UnboundedSender<Message>,
}

impl ChannelConnection {
    /// Create a connection and the receiver observing everything sent
    /// through it.
    pub fn pair(label: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { label: label.into(), sender }), receiver)
    }
}

impl Connection for ChannelConnection {
    fn send(&self, message: Message) -> Result<(), FrameError> {
        self.sender.send(message).map_err(|_| FrameError::Closed)
    }

    fn peer_label(&self) -> String {
        self.label.clone()
    }
}

/// A peer manager over an explicitly registered connection list.
#[derive(Default)]
pub struct StaticPeerManager {
    connections: RwLock<Vec<Arc<dyn Connection>>>,
}

impl StaticPeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a ready connection.
    pub fn register(&self, connection: Arc<dyn Connection>) {
        self.connections.write().push(connection);
    }
}

impl PeerManager for StaticPeerManager {
    fn active_connections(&self) -> Vec<Arc<dyn Connection>> {
        self.connections.read().clone()
    }
}
