//! # thicket-log
//!
//! A causal replicated message log.
//!
//! Peers append signed messages, gossip them, and reconcile with merkle
//! sync. Any two replicas that have seen the same messages hold byte-identical
//! stores, whatever order the messages arrived in.
//!
//! This crate provides:
//! - [`Id`]: sortable content-addressed ids with a clock prefix
//! - [`Frontier`]: the heads a new message builds on
//! - [`Mempool`]: messages waiting for their parents
//! - [`Log`]: the apply/commit pipeline, iteration, sync and serve
//!
//! ## Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use thicket_log::{BoxError, Consumer, Id, Log, LogConfig, Message, Signature};
//! use thicket_merkle::MemoryStore;
//!
//! struct Counter;
//!
//! #[async_trait]
//! impl Consumer<u64> for Counter {
//!     type Output = u64;
//!
//!     async fn apply(&self, _: &Id, _: Option<&Signature>, m: &Message<u64>) -> Result<u64, BoxError> {
//!         Ok(m.payload * 2)
//!     }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let config = LogConfig::builder("counter").signatures(false).build();
//! let log = Log::open(config, Counter, MemoryStore::new()).unwrap();
//!
//! let first = log.append(21, None).await.unwrap();
//! assert_eq!(first.result, Some(42));
//! assert_eq!(log.clock().await, (2, vec![first.id]));
//! # });
//! ```

mod config;
mod error;
mod frontier;
mod id;
mod log;
mod mempool;
mod message;
mod signature;

pub use config::{is_valid_topic, LogConfig, LogConfigBuilder};
pub use error::{BoxError, LogError, Result};
pub use frontier::{Frontier, HEADS_PREFIX};
pub use id::{get_clock, Id, InvalidKey, CLOCK_SIZE, DIGEST_SIZE, ID_SIZE};
pub use log::{
    Appended, Consumer, Inserted, Log, LogEvent, Payload, Status, SyncOutcome, EVENT_CAPACITY,
};
pub use mempool::Mempool;
pub use message::{decode_value, encode_value, signed_bytes, Message, SignedMessage};
pub use signature::{Ed25519Signer, Ed25519Verifier, Signature, Signer, Verifier, ED25519};
