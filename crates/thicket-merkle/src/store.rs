//! Transactional storage trait and the in-memory implementation.
//!
//! A [`Store`] holds two tables:
//! - the *entries* table, indexed by the Merkle [`Tree`] and exposed through
//!   its root hash, nodes and children
//! - a small *meta* table for bookkeeping that must commit together with the
//!   entries but must not affect the root (the log keeps its head markers there)
//!
//! Read transactions are snapshots. Write transactions are exclusive, and
//! nothing they do is visible until [`WriteTransaction::commit`]. Dropping an
//! uncommitted write transaction discards it.

use crate::node::Node;
use crate::tree::{KeyRange, Tree};
use async_trait::async_trait;
use im::OrdMap;
use parking_lot::RwLock;
use std::ops::Bound;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Errors raised by a store backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("empty keys are reserved for the tree anchor")]
    EmptyKey,

    #[error("storage backend failure: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A committed `(key, value)` pair.
pub type Entry = (Vec<u8>, Vec<u8>);

/// Lazy iterator over entries. It owns its snapshot, so it outlives the
/// transaction that created it.
pub type Entries = Box<dyn Iterator<Item = Result<Entry>> + Send>;

/// Operations available on every transaction.
pub trait ReadTransaction: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Entries between `lower` and `upper`, ascending or descending.
    fn entries(&self, lower: Bound<Vec<u8>>, upper: Bound<Vec<u8>>, reverse: bool)
        -> Result<Entries>;

    /// Number of entries.
    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn root(&self) -> Result<Node>;

    fn node(&self, level: u8, key: &[u8]) -> Result<Option<Node>>;

    fn children(&self, level: u8, key: &[u8]) -> Result<Vec<Node>>;

    fn get_meta(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Meta entries whose key starts with `prefix`, in key order.
    fn meta_entries(&self, prefix: &[u8]) -> Result<Vec<Entry>>;
}

/// Mutations, applied atomically by [`WriteTransaction::commit`].
pub trait WriteTransaction: ReadTransaction {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    fn set_meta(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete_meta(&mut self, key: &[u8]) -> Result<()>;

    /// Publish every mutation at once and return the new root.
    fn commit(self) -> Result<Node>
    where
        Self: Sized;
}

/// A transactional, Merkle-indexed key/value store.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Read: ReadTransaction + 'static;
    type Write: WriteTransaction + 'static;

    /// Open a snapshot. Never blocks on writers.
    fn read(&self) -> Result<Self::Read>;

    /// Open the single write transaction, waiting for the current one to finish.
    async fn write(&self) -> Result<Self::Write>;

    /// Run `f` over a fresh snapshot.
    fn view<R, E>(&self, f: impl FnOnce(&Self::Read) -> std::result::Result<R, E>) -> std::result::Result<R, E>
    where
        E: From<StoreError>,
        Self: Sized,
    {
        let txn = self.read()?;
        f(&txn)
    }
}

/// Everything a snapshot sees.
#[derive(Clone, Debug, Default)]
struct State {
    tree: Tree,
    meta: OrdMap<Vec<u8>, Vec<u8>>,
}

impl State {
    fn entries(
        state: &Arc<State>,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
        reverse: bool,
    ) -> Entries {
        Box::new(Cursor {
            state: Arc::clone(state),
            lower,
            upper,
            reverse,
            done: false,
        })
    }

    fn meta_entries(&self, prefix: &[u8]) -> Vec<Entry> {
        self.meta
            .range(KeyRange(Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Lazy, restartable walk over a snapshot. Each step re-seeks from the last
/// key returned, so the cursor holds no borrow.
struct Cursor {
    state: Arc<State>,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    reverse: bool,
    done: bool,
}

impl Iterator for Cursor {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = {
            let mut range = self.state.tree.range(as_slice(&self.lower), as_slice(&self.upper))?;
            let item = if self.reverse {
                range.next_back()
            } else {
                range.next()
            };
            item.map(|(k, v)| (k.clone(), v.clone()))
        };
        match next {
            Some((key, value)) => {
                if self.reverse {
                    self.upper = Bound::Excluded(key.clone());
                } else {
                    self.lower = Bound::Excluded(key.clone());
                }
                Some(Ok((key, value)))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

fn as_slice(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(k) => Bound::Included(k.as_slice()),
        Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

struct Inner {
    state: RwLock<Arc<State>>,
    writer: Arc<Mutex<()>>,
}

/// In-memory [`Store`]. Cloning yields another handle to the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Arc::new(Inner {
                state: RwLock::new(Arc::new(State::default())),
                writer: Arc::new(Mutex::new(())),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("MemoryStore")
            .field("entries", &state.tree.len())
            .field("root", &state.tree.root().hash)
            .finish()
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Read = MemoryReadTransaction;
    type Write = MemoryWriteTransaction;

    fn read(&self) -> Result<Self::Read> {
        Ok(MemoryReadTransaction {
            state: Arc::clone(&self.inner.state.read()),
        })
    }

    async fn write(&self) -> Result<Self::Write> {
        let guard = Arc::clone(&self.inner.writer).lock_owned().await;
        let base = Arc::clone(&self.inner.state.read());
        Ok(MemoryWriteTransaction {
            inner: Arc::clone(&self.inner),
            base,
            working: None,
            _guard: guard,
        })
    }
}

/// Snapshot of a [`MemoryStore`].
pub struct MemoryReadTransaction {
    state: Arc<State>,
}

/// Exclusive write transaction on a [`MemoryStore`].
///
/// The snapshot is cloned on the first mutation, sharing structure with the
/// base; until then reads go to the base itself.
pub struct MemoryWriteTransaction {
    inner: Arc<Inner>,
    base: Arc<State>,
    working: Option<Arc<State>>,
    _guard: OwnedMutexGuard<()>,
}

impl MemoryWriteTransaction {
    fn current(&self) -> &Arc<State> {
        self.working.as_ref().unwrap_or(&self.base)
    }

    fn working_mut(&mut self) -> &mut State {
        let base = &self.base;
        let working = self.working.get_or_insert_with(|| Arc::new(State::clone(base)));
        Arc::make_mut(working)
    }
}

macro_rules! impl_read_transaction {
    ($ty:ty, $state:ident => $expr:expr) => {
        impl ReadTransaction for $ty {
            fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
                let $state = self;
                Ok($expr.tree.get(key).map(<[u8]>::to_vec))
            }

            fn entries(
                &self,
                lower: Bound<Vec<u8>>,
                upper: Bound<Vec<u8>>,
                reverse: bool,
            ) -> Result<Entries> {
                let $state = self;
                Ok(State::entries($expr, lower, upper, reverse))
            }

            fn len(&self) -> Result<usize> {
                let $state = self;
                Ok($expr.tree.len())
            }

            fn root(&self) -> Result<Node> {
                let $state = self;
                Ok($expr.tree.root())
            }

            fn node(&self, level: u8, key: &[u8]) -> Result<Option<Node>> {
                let $state = self;
                Ok($expr.tree.node(level, key))
            }

            fn children(&self, level: u8, key: &[u8]) -> Result<Vec<Node>> {
                let $state = self;
                Ok($expr.tree.children(level, key))
            }

            fn get_meta(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
                let $state = self;
                Ok($expr.meta.get(key).cloned())
            }

            fn meta_entries(&self, prefix: &[u8]) -> Result<Vec<Entry>> {
                let $state = self;
                Ok($expr.meta_entries(prefix))
            }
        }
    };
}

impl_read_transaction!(MemoryReadTransaction, txn => &txn.state);
impl_read_transaction!(MemoryWriteTransaction, txn => txn.current());

impl WriteTransaction for MemoryWriteTransaction {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.working_mut().tree.set(key, value)
    }

    fn set_meta(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.working_mut().meta.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete_meta(&mut self, key: &[u8]) -> Result<()> {
        if self.current().meta.contains_key(key) {
            self.working_mut().meta.remove(key);
        }
        Ok(())
    }

    fn commit(self) -> Result<Node> {
        let state = self.working.unwrap_or(self.base);
        let root = state.tree.root();
        *self.inner.state.write() = state;
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(entries: Entries) -> Vec<Vec<u8>> {
        entries.map(|e| e.unwrap().0).collect()
    }

    #[tokio::test]
    async fn test_commit_publishes_root() {
        let store = MemoryStore::new();
        let empty_root = store.read().unwrap().root().unwrap();

        let mut txn = store.write().await.unwrap();
        txn.set(b"a", b"1").unwrap();
        txn.set(b"b", b"2").unwrap();
        let root = txn.commit().unwrap();

        assert_ne!(root, empty_root);
        assert_eq!(store.read().unwrap().root().unwrap(), root);
        assert_eq!(store.read().unwrap().len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_drop_discards_mutations() {
        let store = MemoryStore::new();
        let before = store.read().unwrap().root().unwrap();

        {
            let mut txn = store.write().await.unwrap();
            txn.set(b"a", b"1").unwrap();
            txn.set_meta(b"m", b"x").unwrap();
            assert_eq!(txn.get(b"a").unwrap(), Some(b"1".to_vec()));
        }

        let snapshot = store.read().unwrap();
        assert_eq!(snapshot.root().unwrap(), before);
        assert_eq!(snapshot.get(b"a").unwrap(), None);
        assert_eq!(snapshot.get_meta(b"m").unwrap(), None);
    }

    #[tokio::test]
    async fn test_failing_closure_leaves_store_unchanged() {
        let store = MemoryStore::new();

        async fn attempt(store: &MemoryStore) -> Result<Node> {
            let mut txn = store.write().await?;
            txn.set(b"ok", b"1")?;
            txn.set(b"", b"boom")?;
            txn.commit()
        }

        assert_eq!(attempt(&store).await, Err(StoreError::EmptyKey));
        assert!(store.read().unwrap().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_isolation() {
        let store = MemoryStore::new();
        let snapshot = store.read().unwrap();

        let mut txn = store.write().await.unwrap();
        txn.set(b"a", b"1").unwrap();
        txn.commit().unwrap();

        assert_eq!(snapshot.get(b"a").unwrap(), None);
        assert_eq!(store.read().unwrap().get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_writers_are_exclusive() {
        let store = MemoryStore::new();
        let first = store.write().await.unwrap();

        let pending = tokio::time::timeout(std::time::Duration::from_millis(20), store.write()).await;
        assert!(pending.is_err());

        drop(first);
        assert!(store.write().await.is_ok());
    }

    #[tokio::test]
    async fn test_entries_bounds_and_direction() {
        let store = MemoryStore::new();
        let mut txn = store.write().await.unwrap();
        for k in [b"a", b"b", b"c", b"d"] {
            txn.set(k, b"v").unwrap();
        }
        txn.commit().unwrap();

        let snap = store.read().unwrap();
        let all = collect(snap.entries(Bound::Unbounded, Bound::Unbounded, false).unwrap());
        assert_eq!(all, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        let reversed = collect(
            snap.entries(Bound::Excluded(b"a".to_vec()), Bound::Included(b"c".to_vec()), true)
                .unwrap(),
        );
        assert_eq!(reversed, vec![b"c".to_vec(), b"b".to_vec()]);

        let empty = collect(
            snap.entries(Bound::Included(b"c".to_vec()), Bound::Excluded(b"c".to_vec()), false)
                .unwrap(),
        );
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_cursor_outlives_transaction_and_writes() {
        let store = MemoryStore::new();
        let mut txn = store.write().await.unwrap();
        txn.set(b"a", b"1").unwrap();
        txn.commit().unwrap();

        let cursor = store
            .read()
            .unwrap()
            .entries(Bound::Unbounded, Bound::Unbounded, false)
            .unwrap();

        let mut txn = store.write().await.unwrap();
        txn.set(b"b", b"2").unwrap();
        txn.commit().unwrap();

        assert_eq!(collect(cursor), vec![b"a".to_vec()]);
    }

    #[tokio::test]
    async fn test_meta_prefix_scan() {
        let store = MemoryStore::new();
        let mut txn = store.write().await.unwrap();
        txn.set_meta(b"heads/1", b"").unwrap();
        txn.set_meta(b"heads/2", b"").unwrap();
        txn.set_meta(b"other", b"").unwrap();
        txn.delete_meta(b"heads/1").unwrap();
        let root = txn.commit().unwrap();

        let snap = store.read().unwrap();
        let heads = snap.meta_entries(b"heads/").unwrap();
        assert_eq!(heads, vec![(b"heads/2".to_vec(), Vec::new())]);
        // Meta never touches the tree.
        assert_eq!(root, Tree::new().root());
    }

    #[test]
    fn test_view() {
        let store = MemoryStore::new();
        let len = store.view(|txn| txn.len()).unwrap();
        assert_eq!(len, 0);
    }
}
