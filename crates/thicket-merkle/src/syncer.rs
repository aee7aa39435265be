//! Merkle-diff synchronization.
//!
//! Reconciliation is pull-based and involves three roles:
//! 1. A [`Source`] answers root, node and children queries about a tree
//! 2. The [`Server`] is a `Source` backed by a local read transaction
//! 3. The [`Driver`] walks a remote `Source` against the local tree and yields
//!    every entry the remote holds that the local tree lacks
//!
//! The driver only descends where hashes differ, so the number of requests it
//! makes grows with the difference between the two trees, not with their size.

use crate::hash::Hasher;
use crate::node::Node;
use crate::store::{Entry, ReadTransaction, StoreError};
use crate::wire::{Request, Response};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::pin;
use thiserror::Error;

/// Errors that abort a sync attempt.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote sent something inconsistent or unexpected.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The remote reported a failure of its own.
    #[error("remote error: {0}")]
    Remote(String),

    /// The stream ended before a response arrived.
    #[error("stream closed by peer")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    fn protocol(msg: impl Into<String>) -> Self {
        SyncError::Protocol(msg.into())
    }
}

/// Something that can answer questions about a tree.
#[async_trait]
pub trait Source: Send {
    async fn root(&mut self) -> Result<Node, SyncError>;

    /// A node with its value if it is a leaf, or `None` if absent.
    async fn node(&mut self, level: u8, key: &[u8]) -> Result<Option<Node>, SyncError>;

    /// Children of an interior node, values stripped.
    async fn children(&mut self, level: u8, key: &[u8]) -> Result<Vec<Node>, SyncError>;
}

/// Serves tree queries from a read transaction. Holds no per-peer state.
pub struct Server<T: ReadTransaction> {
    txn: T,
}

impl<T: ReadTransaction> Server<T> {
    pub fn new(txn: T) -> Self {
        Server { txn }
    }

    pub fn transaction(&self) -> &T {
        &self.txn
    }

    /// Answer one wire request. Store failures become [`Response::Error`].
    pub fn handle(&self, request: Request) -> Response {
        let result = match request {
            Request::Root => self.txn.root().map(Response::Root),
            Request::Node { level, key } => self.txn.node(level, &key).map(Response::Node),
            Request::Children { level, key } => {
                self.txn.children(level, &key).map(Response::Children)
            }
        };
        result.unwrap_or_else(|e| Response::Error(e.to_string()))
    }
}

#[async_trait]
impl<T: ReadTransaction> Source for Server<T> {
    async fn root(&mut self) -> Result<Node, SyncError> {
        Ok(self.txn.root()?)
    }

    async fn node(&mut self, level: u8, key: &[u8]) -> Result<Option<Node>, SyncError> {
        Ok(self.txn.node(level, key)?)
    }

    async fn children(&mut self, level: u8, key: &[u8]) -> Result<Vec<Node>, SyncError> {
        Ok(self.txn.children(level, key)?)
    }
}

/// Counters for one driver pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DriverStats {
    /// Remote nodes compared against the local tree.
    pub visited: usize,
    /// Requests sent to the source.
    pub requests: usize,
    /// Entries yielded.
    pub fetched: usize,
}

/// Walks a remote tree against a local one.
///
/// Traversal is depth-first and visits children in ascending key order at
/// every level, so entries come out in key order.
pub struct Driver<'a, L: ReadTransaction, R: Source> {
    local: &'a L,
    remote: &'a mut R,
    stats: DriverStats,
}

impl<'a, L: ReadTransaction, R: Source> Driver<'a, L, R> {
    pub fn new(local: &'a L, remote: &'a mut R) -> Self {
        Driver {
            local,
            remote,
            stats: DriverStats::default(),
        }
    }

    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }

    /// Entries present remotely and missing locally.
    pub fn entries(
        &mut self,
    ) -> impl Stream<Item = Result<Entry, SyncError>> + Send + use<'_, 'a, L, R> {
        try_stream! {
            let local_root = self.local.root()?;
            let remote_root = self.remote.root().await?;
            self.stats.requests += 1;
            self.stats.visited += 1;

            if !remote_root.is_anchor() {
                Err(SyncError::protocol("remote root is not an anchor"))?;
            }

            let mut stack = Vec::new();
            if remote_root.hash != local_root.hash {
                stack.push(remote_root);
            }

            while let Some(remote) = stack.pop() {
                let local = self.local.node(remote.level, &remote.key)?;
                if local.as_ref().map(|n| n.hash) == Some(remote.hash) {
                    continue;
                }

                if remote.level > 0 {
                    let children = self.remote.children(remote.level, &remote.key).await?;
                    self.stats.requests += 1;
                    self.stats.visited += children.len();
                    verify_children(&remote, &children)?;
                    stack.extend(children.into_iter().rev());
                    continue;
                }

                if remote.is_anchor() {
                    continue;
                }
                if local.is_some() {
                    Err(SyncError::protocol("remote holds a different value for an existing key"))?;
                }

                let leaf = self.remote.node(0, &remote.key).await?;
                self.stats.requests += 1;
                let value = leaf
                    .filter(|leaf| leaf.level == 0 && leaf.key == remote.key)
                    .and_then(|leaf| leaf.value)
                    .ok_or_else(|| SyncError::protocol("leaf missing from its own tree"))?;
                if Hasher::leaf(&remote.key, &value) != remote.hash {
                    Err(SyncError::protocol("leaf value does not match its hash"))?;
                }

                self.stats.fetched += 1;
                yield (remote.key, value);
            }
        }
    }

    /// Run the whole pass and collect its entries.
    pub async fn collect(&mut self) -> Result<Vec<Entry>, SyncError> {
        let mut entries = pin!(self.entries());
        let mut out = Vec::new();
        while let Some(entry) = entries.next().await {
            out.push(entry?);
        }
        Ok(out)
    }
}

/// A child list must start at its parent's key, be strictly ascending, sit one
/// level down, and hash to the parent.
fn verify_children(parent: &Node, children: &[Node]) -> Result<(), SyncError> {
    let first = children
        .first()
        .ok_or_else(|| SyncError::protocol("interior node without children"))?;
    if first.key != parent.key {
        return Err(SyncError::protocol("children do not start at the parent key"));
    }
    if children.iter().any(|c| c.level + 1 != parent.level) {
        return Err(SyncError::protocol("child at the wrong level"));
    }
    if children.windows(2).any(|w| w[0].key >= w[1].key) {
        return Err(SyncError::protocol("children out of order"));
    }
    if Hasher::interior(children.iter().map(|c| &c.hash)) != parent.hash {
        return Err(SyncError::protocol("children do not hash to their parent"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store, WriteTransaction};

    async fn store_with(keys: impl IntoIterator<Item = u32>) -> MemoryStore {
        let store = MemoryStore::new();
        let mut txn = store.write().await.unwrap();
        for k in keys {
            txn.set(&k.to_be_bytes(), format!("value-{}", k).as_bytes()).unwrap();
        }
        txn.commit().unwrap();
        store
    }

    async fn pull(local: &MemoryStore, remote: &MemoryStore) -> (Vec<Entry>, DriverStats) {
        let local_txn = local.read().unwrap();
        let mut server = Server::new(remote.read().unwrap());
        let mut driver = Driver::new(&local_txn, &mut server);
        let entries = driver.collect().await.unwrap();
        (entries, driver.stats().clone())
    }

    #[tokio::test]
    async fn test_empty_trees_transfer_nothing() {
        let a = MemoryStore::new();
        let b = MemoryStore::new();
        let (entries, stats) = pull(&a, &b).await;
        assert!(entries.is_empty());
        assert_eq!(stats.requests, 1);
    }

    #[tokio::test]
    async fn test_pull_everything_into_empty() {
        let local = MemoryStore::new();
        let remote = store_with(0..300).await;

        let (entries, _) = pull(&local, &remote).await;
        assert_eq!(entries.len(), 300);
        assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));

        let mut txn = local.write().await.unwrap();
        for (k, v) in &entries {
            txn.set(k, v).unwrap();
        }
        let root = txn.commit().unwrap();
        assert_eq!(root, remote.read().unwrap().root().unwrap());
    }

    #[tokio::test]
    async fn test_pull_only_the_difference() {
        let local = store_with(0..2_000).await;
        let remote = store_with((0..2_000).chain([5_000, 6_000])).await;

        let (entries, stats) = pull(&local, &remote).await;
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![5_000u32.to_be_bytes().to_vec(), 6_000u32.to_be_bytes().to_vec()]);
        // Two paths from root to leaf, a few dozen siblings each, far below 2000.
        assert!(stats.visited < 400, "visited {}", stats.visited);
    }

    #[tokio::test]
    async fn test_local_superset_fetches_nothing() {
        let local = store_with(0..100).await;
        let remote = store_with(0..50).await;
        let (entries, _) = pull(&local, &remote).await;
        assert!(entries.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_entries_stream_stops_early_on_another_thread() {
        let local = MemoryStore::new();
        let remote = store_with(0..50).await;

        let (first, fetched) = tokio::spawn(async move {
            let local_txn = local.read().unwrap();
            let mut server = Server::new(remote.read().unwrap());
            let mut driver = Driver::new(&local_txn, &mut server);
            let first = {
                let mut entries = pin!(driver.entries());
                entries.next().await.unwrap().unwrap()
            };
            (first, driver.stats().fetched)
        })
        .await
        .unwrap();

        assert_eq!(first.0, 0u32.to_be_bytes().to_vec());
        assert_eq!(fetched, 1);
    }

    struct Tampered<T: ReadTransaction> {
        inner: Server<T>,
    }

    #[async_trait]
    impl<T: ReadTransaction> Source for Tampered<T> {
        async fn root(&mut self) -> Result<Node, SyncError> {
            self.inner.root().await
        }

        async fn node(&mut self, level: u8, key: &[u8]) -> Result<Option<Node>, SyncError> {
            let node = self.inner.node(level, key).await?;
            Ok(node.map(|mut n| {
                n.value = Some(b"forged".to_vec());
                n
            }))
        }

        async fn children(&mut self, level: u8, key: &[u8]) -> Result<Vec<Node>, SyncError> {
            self.inner.children(level, key).await
        }
    }

    #[tokio::test]
    async fn test_forged_leaf_rejected() {
        let local = MemoryStore::new();
        let remote = store_with([1]).await;

        let local_txn = local.read().unwrap();
        let mut source = Tampered {
            inner: Server::new(remote.read().unwrap()),
        };
        let result = Driver::new(&local_txn, &mut source).collect().await;
        assert!(matches!(result, Err(SyncError::Protocol(_))));
    }

    #[test]
    fn test_verify_children_rejects_bad_hash() {
        let child = Node {
            level: 0,
            key: Vec::new(),
            hash: Hasher::hash(b"x"),
            value: None,
        };
        let parent = Node {
            level: 1,
            key: Vec::new(),
            hash: Hasher::hash(b"not the child"),
            value: None,
        };
        assert!(verify_children(&parent, &[child.clone()]).is_err());

        let honest = Node {
            hash: Hasher::interior([&child.hash]),
            ..parent
        };
        assert!(verify_children(&honest, &[child]).is_ok());
    }

    #[test]
    fn test_server_handles_requests() {
        let server = Server::new(MemoryStore::new().read().unwrap());
        match server.handle(Request::Root) {
            Response::Root(root) => assert!(root.is_anchor()),
            other => panic!("unexpected response {:?}", other),
        }
        match server.handle(Request::Children { level: 3, key: vec![1] }) {
            Response::Children(children) => assert!(children.is_empty()),
            other => panic!("unexpected response {:?}", other),
        }
    }
}
