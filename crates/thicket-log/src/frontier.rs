//! The set of heads of a sequenced log.

use crate::id::{get_clock, Id};
use std::collections::BTreeSet;
use thicket_merkle::{ReadTransaction, StoreError, WriteTransaction};

/// Meta-table prefix of the persisted head markers.
pub const HEADS_PREFIX: &[u8] = b"heads/";

fn head_key(id: &Id) -> Vec<u8> {
    let mut key = HEADS_PREFIX.to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

/// Anti-chain of the ids no committed message names as a parent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frontier {
    heads: BTreeSet<Id>,
}

impl Frontier {
    /// Rebuild from the head markers committed alongside the entries.
    pub fn load<T: ReadTransaction>(txn: &T) -> Result<Self, crate::LogError> {
        let mut heads = BTreeSet::new();
        for (key, _) in txn.meta_entries(HEADS_PREFIX)? {
            heads.insert(Id::decode(&key[HEADS_PREFIX.len()..])?);
        }
        Ok(Frontier { heads })
    }

    /// Clock and parents for the next local message.
    pub fn current(&self) -> (u64, Vec<Id>) {
        let parents: Vec<Id> = self.heads.iter().copied().collect();
        // Committed clocks only grow by one per causal step, so this never saturates.
        (get_clock(&parents).unwrap_or(u64::MAX), parents)
    }

    pub fn heads(&self) -> impl Iterator<Item = &Id> {
        self.heads.iter()
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Write the marker changes for committing `id` into `txn`.
    pub fn stage<T: WriteTransaction>(
        &self,
        txn: &mut T,
        id: &Id,
        parents: &[Id],
    ) -> Result<(), StoreError> {
        for parent in parents {
            txn.delete_meta(&head_key(parent))?;
        }
        txn.set_meta(&head_key(id), &[])
    }

    /// Apply a committed message to the in-memory set.
    pub fn update(&mut self, id: Id, parents: &[Id]) {
        for parent in parents {
            self.heads.remove(parent);
        }
        self.heads.insert(id);
    }
}
