//! Thicket SDK - run replicated logs over a network
//!
//! A [`Replica`] connects a [`thicket_log::Log`] to a [`Transport`]. New
//! messages travel by gossip; anything gossip misses is repaired by merkle
//! sync, which the [`SyncScheduler`] runs whenever a peer connects.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use thicket_sdk::prelude::*;
//!
//! struct Ignore;
//!
//! #[async_trait::async_trait]
//! impl Consumer<String> for Ignore {
//!     type Output = ();
//!
//!     async fn apply(
//!         &self,
//!         _id: &Id,
//!         _signature: Option<&Signature>,
//!         _message: &Message<String>,
//!     ) -> Result<(), BoxError> {
//!         Ok(())
//!     }
//! }
//!
//! tokio_test::block_on(async {
//!     let mut network = create_network(2);
//!     let config = LogConfig::builder("chat").signatures(false).build();
//!
//!     let mut replicas = Vec::new();
//!     for transport in network.drain(..) {
//!         let log = Log::open(config.clone(), Ignore, MemoryStore::new()).unwrap();
//!         replicas.push(Replica::start(log, Arc::new(transport), SchedulerConfig::default()).unwrap());
//!     }
//!
//!     let appended = replicas[0].append("hi".to_string(), None).await.unwrap();
//!     assert_eq!(appended.message.clock, 1);
//! });
//! ```
//!
//! # Modules
//!
//! - [`network`] - transport trait and an in-memory transport
//! - [`scheduler`] - when to sync with which peer
//! - [`replica`] - a log wired to a transport
//! - [`error`] - error types

pub mod error;
pub mod network;
pub mod replica;
pub mod scheduler;

pub use error::{Result, SdkError};
pub use network::{
    create_network, BoxStream, ByteStream, MemoryTransport, NetworkError, Peer, PeerId, PeerState,
    Transport, TransportEvent,
};
pub use replica::Replica;
pub use scheduler::{SchedulerConfig, SchedulerConfigBuilder, Skipped, SyncScheduler, SyncTarget};

/// Everything needed to start a replica.
pub mod prelude {
    pub use crate::network::{create_network, MemoryTransport, PeerId, Transport};
    pub use crate::replica::Replica;
    pub use crate::scheduler::{SchedulerConfig, SchedulerConfigBuilder};
    pub use crate::SdkError;
    pub use thicket_log::{
        BoxError, Consumer, Ed25519Signer, Id, Log, LogConfig, LogEvent, Message, Signature,
        Signer, Status,
    };
    pub use thicket_merkle::MemoryStore;
}
