//! Transport abstractions for gossip and point-to-point sync streams.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Capacity of each transport's event queue.
pub const EVENT_CAPACITY: usize = 1024;

/// Buffer size of in-memory sync streams.
const STREAM_BUFFER: usize = 64 * 1024;

/// Unique identifier for a peer. Peers are totally ordered by id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Peer connection state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
}

/// Information about a connected peer.
#[derive(Clone, Debug)]
pub struct Peer {
    pub id: PeerId,
    pub state: PeerState,
}

/// A bidirectional byte stream to one peer.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxStream = Box<dyn ByteStream>;

/// Something that happened on the transport.
pub enum TransportEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    /// A gossip message published on `topic`.
    Message {
        from: PeerId,
        topic: String,
        data: Vec<u8>,
    },
    /// A peer opened a stream to us.
    Stream {
        from: PeerId,
        protocol: String,
        stream: BoxStream,
    },
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::Connected(peer) => write!(f, "Connected({})", peer),
            TransportEvent::Disconnected(peer) => write!(f, "Disconnected({})", peer),
            TransportEvent::Message { from, topic, data } => {
                write!(f, "Message({} on {}, {} bytes)", from, topic, data.len())
            }
            TransportEvent::Stream { from, protocol, .. } => {
                write!(f, "Stream({} for {})", from, protocol)
            }
        }
    }
}

/// Network error type.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum NetworkError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("events already taken by another subscriber")]
    AlreadySubscribed,

    #[error("disconnected")]
    Disconnected,
}

/// Abstract network transport trait.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_id(&self) -> &PeerId;

    /// Open a stream to `peer` for `protocol`.
    async fn dial(&self, peer: &PeerId, protocol: &str) -> Result<BoxStream, NetworkError>;

    /// Gossip `data` on `topic`. Returns the number of peers it was handed to.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<usize, NetworkError>;

    /// Get list of connected peers.
    async fn connected_peers(&self) -> Vec<Peer>;

    /// Take the event receiver. Only one subscriber is supported.
    fn subscribe(&self) -> Result<mpsc::Receiver<TransportEvent>, NetworkError>;
}

/// Type alias for the event receiver shared across threads.
type SharedEventReceiver = Arc<RwLock<Option<mpsc::Receiver<TransportEvent>>>>;
/// Type alias for the peers' event senders shared across threads.
type SharedOutgoing = Arc<RwLock<HashMap<PeerId, mpsc::Sender<TransportEvent>>>>;

/// In-memory transport for testing and simulation.
///
/// Gossip can be made lossy with [`MemoryTransport::set_loss`]; streams are
/// always reliable. Clones share the same endpoint.
#[derive(Clone)]
pub struct MemoryTransport {
    local_id: PeerId,
    peers: Arc<RwLock<HashMap<PeerId, Peer>>>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: SharedEventReceiver,
    outgoing: SharedOutgoing,
    loss: Arc<RwLock<f64>>,
}

impl MemoryTransport {
    pub fn new(local_id: PeerId) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            local_id,
            peers: Arc::new(RwLock::new(HashMap::new())),
            event_tx: tx,
            event_rx: Arc::new(RwLock::new(Some(rx))),
            outgoing: Arc::new(RwLock::new(HashMap::new())),
            loss: Arc::new(RwLock::new(0.0)),
        }
    }

    /// Probability in `[0, 1]` that a published message is dropped per recipient.
    pub fn set_loss(&self, rate: f64) {
        *self.loss.write() = rate.clamp(0.0, 1.0);
    }

    /// Connect two memory transports and notify both sides.
    pub fn connect_to(&self, other: &MemoryTransport) {
        self.link(other);
        other.link(self);
        notify(&self.event_tx, TransportEvent::Connected(other.local_id.clone()));
        notify(&other.event_tx, TransportEvent::Connected(self.local_id.clone()));
    }

    /// Tear down the link between two transports and notify both sides.
    pub fn disconnect_from(&self, other: &MemoryTransport) {
        self.unlink(&other.local_id);
        other.unlink(&self.local_id);
        notify(&self.event_tx, TransportEvent::Disconnected(other.local_id.clone()));
        notify(&other.event_tx, TransportEvent::Disconnected(self.local_id.clone()));
    }

    fn link(&self, other: &MemoryTransport) {
        self.peers.write().insert(
            other.local_id.clone(),
            Peer {
                id: other.local_id.clone(),
                state: PeerState::Connected,
            },
        );
        self.outgoing
            .write()
            .insert(other.local_id.clone(), other.event_tx.clone());
    }

    fn unlink(&self, peer: &PeerId) {
        self.peers.write().remove(peer);
        self.outgoing.write().remove(peer);
    }

    fn sender(&self, peer: &PeerId) -> Option<mpsc::Sender<TransportEvent>> {
        self.outgoing.read().get(peer).cloned()
    }
}

fn notify(tx: &mpsc::Sender<TransportEvent>, event: TransportEvent) {
    if let Err(err) = tx.try_send(event) {
        warn!(error = %err, "dropping transport event");
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    async fn dial(&self, peer: &PeerId, protocol: &str) -> Result<BoxStream, NetworkError> {
        let tx = self
            .sender(peer)
            .ok_or_else(|| NetworkError::PeerNotFound(peer.to_string()))?;

        let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
        tx.send(TransportEvent::Stream {
            from: self.local_id.clone(),
            protocol: protocol.to_string(),
            stream: Box::new(remote),
        })
        .await
        .map_err(|_| NetworkError::ConnectionFailed(peer.to_string()))?;

        debug!(local = %self.local_id, %peer, protocol, "dialed");
        Ok(Box::new(local))
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<usize, NetworkError> {
        let senders: Vec<_> = {
            let outgoing = self.outgoing.read();
            outgoing.values().cloned().collect()
        };
        let loss = *self.loss.read();

        let mut delivered = 0;
        for tx in senders {
            if loss > 0.0 && rand::random::<f64>() < loss {
                continue;
            }
            let event = TransportEvent::Message {
                from: self.local_id.clone(),
                topic: topic.to_string(),
                data: data.clone(),
            };
            if tx.send(event).await.is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn connected_peers(&self) -> Vec<Peer> {
        self.peers.read().values().cloned().collect()
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<TransportEvent>, NetworkError> {
        self.event_rx
            .write()
            .take()
            .ok_or(NetworkError::AlreadySubscribed)
    }
}

/// Create a network of connected memory transports for testing.
pub fn create_network(count: usize) -> Vec<MemoryTransport> {
    let transports: Vec<_> = (0..count)
        .map(|i| MemoryTransport::new(PeerId::new(format!("peer-{}", i))))
        .collect();

    // Connect all peers to each other
    for i in 0..count {
        for j in (i + 1)..count {
            transports[i].connect_to(&transports[j]);
        }
    }

    transports
}
