//! Buffer for messages that arrived before their parents.

use crate::id::Id;
use std::collections::{BTreeMap, BTreeSet};

struct Pending<T> {
    item: T,
    missing: BTreeSet<Id>,
}

/// Pending messages, indexed both by id and by the parents they wait for.
///
/// Nothing here is persisted: a restart forgets every pending message, and
/// sync brings them back.
pub struct Mempool<T> {
    entries: BTreeMap<Id, Pending<T>>,
    children: BTreeMap<Id, BTreeSet<Id>>,
}

impl<T> Mempool<T> {
    pub fn new() -> Self {
        Mempool {
            entries: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    /// Park `item` until every id in `missing` has been resolved.
    ///
    /// Returns false if `id` is already pending.
    pub fn insert(&mut self, id: Id, item: T, missing: BTreeSet<Id>) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        for parent in &missing {
            self.children.entry(*parent).or_default().insert(id);
        }
        self.entries.insert(id, Pending { item, missing });
        true
    }

    /// Mark `parent` as committed and release every entry that no longer
    /// waits for anything, in id order.
    ///
    /// Only direct dependents are released. Committing a released entry and
    /// resolving it in turn is left to the caller.
    pub fn resolve(&mut self, parent: &Id) -> Vec<(Id, T)> {
        let Some(dependents) = self.children.remove(parent) else {
            return Vec::new();
        };

        let mut ready = Vec::new();
        for id in dependents {
            let Some(pending) = self.entries.get_mut(&id) else {
                continue;
            };
            pending.missing.remove(parent);
            if pending.missing.is_empty() {
                ready.push(id);
            }
        }

        // BTreeSet iteration already yields ids in order.
        ready
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|p| (id, p.item)))
            .collect()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.entries.contains_key(id)
    }

    /// Parents `id` is still waiting for.
    pub fn missing(&self, id: &Id) -> Option<&BTreeSet<Id>> {
        self.entries.get(id).map(|p| &p.missing)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for Mempool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Mempool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mempool")
            .field("pending", &self.entries.len())
            .field("awaited", &self.children.len())
            .finish()
    }
}
