//! # thicket-merkle
//!
//! Order-independent Merkle tree, transactional store and merkle-diff sync
//! for the Thicket replicated log.
//!
//! This crate provides:
//! - A Merkle tree whose shape depends only on the set of keys it holds
//! - A [`Store`] with snapshot reads and a single exclusive writer
//! - A pull-based sync [`Driver`] that fetches only the entries a peer is missing
//! - Length-prefixed JSON framing so a [`Client`] can query a remote [`Server`]
//!
//! ## Architecture
//!
//! Level 0 of the tree holds one leaf per entry plus an *anchor* leaf under
//! the empty key. Keys are promoted to higher levels by a hash of
//! `(level, key)`, giving an expected fan-out of [`FANOUT`]. The root is the
//! anchor of the topmost level, so two stores holding the same entries have
//! the same root regardless of insertion order.
//!
//! ## Example
//!
//! ```rust
//! use thicket_merkle::{Driver, MemoryStore, Server, Store, WriteTransaction};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let remote = MemoryStore::new();
//! let mut txn = remote.write().await.unwrap();
//! txn.set(b"hello", b"world").unwrap();
//! txn.commit().unwrap();
//!
//! let local = MemoryStore::new();
//! let snapshot = local.read().unwrap();
//! let mut server = Server::new(remote.read().unwrap());
//! let missing = Driver::new(&snapshot, &mut server).collect().await.unwrap();
//!
//! assert_eq!(missing, vec![(b"hello".to_vec(), b"world".to_vec())]);
//! # });
//! ```

mod hash;
mod node;
mod store;
mod syncer;
mod tree;
mod wire;

pub use hash::{Hash, Hasher, HASH_SIZE};
pub use node::{hex_bytes, hex_bytes_opt, is_promoted, Node, FANOUT};
pub use store::{
    Entries, Entry, MemoryReadTransaction, MemoryStore, MemoryWriteTransaction, ReadTransaction,
    Store, StoreError, WriteTransaction,
};
pub use syncer::{Driver, DriverStats, Server, Source, SyncError};
pub use tree::Tree;
pub use wire::{
    protocol_name, read_frame, serve, write_frame, Client, Request, Response, MAX_FRAME_SIZE,
    PROTOCOL_PREFIX,
};
