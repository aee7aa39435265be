//! Order-independent Merkle tree over a sorted key/value set.
//!
//! The tree is kept as one sorted map per level. Level 0 holds the leaves,
//! including the anchor under the empty key. A key appears at level `l + 1`
//! iff [`is_promoted`] says so, and every node at level `l + 1` covers the
//! level-`l` nodes from its own key up to the next key at its level.
//!
//! Because promotion depends only on keys and hashing only on values, two
//! trees holding the same entries are identical node for node, whatever the
//! order in which the entries were inserted.
//!
//! Levels and values are persistent maps: cloning a tree is cheap and the
//! clone shares every node it does not later modify.

use crate::hash::{Hash, Hasher};
use crate::node::{is_promoted, Node};
use crate::store::StoreError;
use im::OrdMap;
use std::collections::BTreeSet;
use std::ops::{Bound, RangeBounds};

type Level = OrdMap<Vec<u8>, Hash>;

/// Slice bounds over `Vec<u8>` keys.
#[derive(Clone, Copy, Debug)]
pub(crate) struct KeyRange<'a>(pub Bound<&'a [u8]>, pub Bound<&'a [u8]>);

impl RangeBounds<[u8]> for KeyRange<'_> {
    fn start_bound(&self) -> Bound<&[u8]> {
        self.0
    }

    fn end_bound(&self) -> Bound<&[u8]> {
        self.1
    }
}

/// In-memory Merkle tree with incremental updates.
#[derive(Clone, Debug)]
pub struct Tree {
    /// `levels[0]` are the leaves, the last level holds only the anchor.
    levels: Vec<Level>,

    /// Leaf values by key. The anchor has no value.
    values: OrdMap<Vec<u8>, Vec<u8>>,
}

impl Tree {
    pub fn new() -> Self {
        let mut leaves = Level::new();
        leaves.insert(Vec::new(), Hasher::hash(&[]));
        Tree {
            levels: vec![leaves],
            values: OrdMap::new(),
        }
    }

    /// Number of entries, not counting the anchor.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of levels, including the root level.
    pub fn height(&self) -> usize {
        self.levels.len()
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.values.get(key).map(Vec::as_slice)
    }

    /// The anchor of the top level.
    pub fn root(&self) -> Node {
        let level = self.levels.len() - 1;
        let anchor: &[u8] = &[];
        let hash = self.levels[level]
            .get(anchor)
            .copied()
            .unwrap_or_else(|| Hasher::hash(&[]));
        Node {
            level: level as u8,
            key: Vec::new(),
            hash,
            value: None,
        }
    }

    /// Look up a node. Leaves other than the anchor carry their value.
    pub fn node(&self, level: u8, key: &[u8]) -> Option<Node> {
        let hash = *self.levels.get(level as usize)?.get(key)?;
        let value = if level == 0 {
            self.values.get(key).cloned()
        } else {
            None
        };
        Some(Node {
            level,
            key: key.to_vec(),
            hash,
            value,
        })
    }

    /// Children of an interior node, without values, in key order.
    ///
    /// Returns an empty list for leaves and for nodes that do not exist.
    pub fn children(&self, level: u8, key: &[u8]) -> Vec<Node> {
        if level == 0 {
            return Vec::new();
        }
        let Some(parents) = self.levels.get(level as usize) else {
            return Vec::new();
        };
        if !parents.contains_key(key) {
            return Vec::new();
        }
        let end = next_key(parents, key);
        child_range(&self.levels[level as usize - 1], key, end)
            .map(|(k, hash)| Node {
                level: level - 1,
                key: k.clone(),
                hash: *hash,
                value: None,
            })
            .collect()
    }

    /// Entries within the given bounds, or `None` when the bounds select nothing.
    pub fn range(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Option<impl DoubleEndedIterator<Item = (&Vec<u8>, &Vec<u8>)> + '_> {
        if is_empty_range(lower, upper) {
            return None;
        }
        Some(self.values.range(KeyRange(lower, upper)))
    }

    /// Insert or replace an entry and refresh every affected ancestor.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        if self.values.get(key).map(Vec::as_slice) == Some(value) {
            return Ok(());
        }

        self.values.insert(key.to_vec(), value.to_vec());
        self.levels[0].insert(key.to_vec(), Hasher::leaf(key, value));

        let mut dirty: BTreeSet<Vec<u8>> = BTreeSet::from([key.to_vec()]);
        let mut level = 0usize;

        loop {
            if level + 1 == self.levels.len() {
                if self.levels[level].len() == 1 {
                    break;
                }
                // The top level outgrew the anchor: every node there needs a parent.
                self.levels.push(Level::new());
                dirty = self.levels[level].keys().cloned().collect();
            }

            let mut parents = BTreeSet::new();

            // Structure first, so that child ranges are final before hashing.
            for k in &dirty {
                let upper = &mut self.levels[level + 1];
                if is_promoted(level as u8, k) {
                    if !upper.contains_key(k) {
                        if let Some((prev, _)) = upper
                            .range(KeyRange(Bound::Unbounded, Bound::Excluded(k.as_slice())))
                            .next_back()
                        {
                            parents.insert(prev.clone());
                        }
                        upper.insert(k.clone(), Hasher::hash(&[]));
                    }
                    parents.insert(k.clone());
                } else if let Some((parent, _)) = upper
                    .range(KeyRange(Bound::Unbounded, Bound::Included(k.as_slice())))
                    .next_back()
                {
                    parents.insert(parent.clone());
                }
            }

            for parent in &parents {
                let hash = {
                    let upper = &self.levels[level + 1];
                    let end = next_key(upper, parent);
                    Hasher::interior(child_range(&self.levels[level], parent, end).map(|(_, h)| h))
                };
                self.levels[level + 1].insert(parent.clone(), hash);
            }

            dirty = parents;
            level += 1;
        }

        Ok(())
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

fn next_key<'a>(level: &'a Level, key: &[u8]) -> Option<&'a [u8]> {
    level
        .range(KeyRange(Bound::Excluded(key), Bound::Unbounded))
        .next()
        .map(|(k, _)| k.as_slice())
}

fn child_range<'a>(
    below: &'a Level,
    start: &[u8],
    end: Option<&[u8]>,
) -> impl DoubleEndedIterator<Item = (&'a Vec<u8>, &'a Hash)> + 'a {
    let upper = match end {
        Some(end) => Bound::Excluded(end),
        None => Bound::Unbounded,
    };
    below.range(KeyRange(Bound::Included(start), upper))
}

/// Ordered range scans panic on inverted or empty-exclusive bounds.
fn is_empty_range(lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u))
        | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
        _ => false,
    }
}
