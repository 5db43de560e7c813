//! The collection store: id-keyed registry of ordered collections.

use crate::btree::KeyTree;
use crate::range::KeyRange;
use alloc::vec::Vec;
use hashbrown::HashMap;
use skein_heap::{Heap, ValueRef};

/// Identifier of a collection. Node ids in the graph share this number
/// space: a node's output collection carries the node's id.
pub type ColId = u32;

/// An entry displaced by `CollectionStore::apply`.
///
/// The store holds one heap reference per stored key and per stored value
/// occurrence. Displaced references are returned to the caller rather than
/// released, so the propagator can emit diffs over the old values first and
/// settle the counts afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Displaced {
    /// The key whose multiset changed.
    pub key: ValueRef,
    /// True if the key itself left the collection; its key reference is
    /// then owed to the caller as well.
    pub removed_key: bool,
    /// The displaced value occurrences.
    pub values: Vec<ValueRef>,
}

/// Storage for every collection in the engine.
#[derive(Debug, Default)]
pub struct CollectionStore {
    collections: HashMap<ColId, KeyTree>,
}

impl CollectionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            collections: HashMap::new(),
        }
    }

    /// Creates an empty collection under the given id.
    pub fn create(&mut self, col: ColId) {
        self.collections.entry(col).or_insert_with(KeyTree::new);
    }

    /// Returns true if the collection exists.
    pub fn exists(&self, col: ColId) -> bool {
        self.collections.contains_key(&col)
    }

    /// Returns the number of collections.
    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    /// Removes a collection, returning its drained entries. The caller owns
    /// the key and value references of every returned entry.
    pub fn drop_collection(&mut self, col: ColId) -> Vec<(ValueRef, Vec<ValueRef>)> {
        match self.collections.remove(&col) {
            Some(mut tree) => tree.drain(),
            None => Vec::new(),
        }
    }

    /// Returns the value multiset of a key; empty if the key or the
    /// collection is absent.
    pub fn get_array(&self, heap: &Heap, col: ColId, key: ValueRef) -> &[ValueRef] {
        self.collections
            .get(&col)
            .and_then(|tree| tree.get(heap, key))
            .unwrap_or(&[])
    }

    /// Returns every (key, multiset) entry in key order.
    pub fn get_all(&self, col: ColId) -> Vec<(ValueRef, Vec<ValueRef>)> {
        match self.collections.get(&col) {
            Some(tree) => tree.iter().map(|(k, bag)| (k, bag.clone())).collect(),
            None => Vec::new(),
        }
    }

    /// Returns entries whose keys fall in the range, in key order.
    pub fn get_range(
        &self,
        heap: &Heap,
        col: ColId,
        range: &KeyRange,
    ) -> Vec<(ValueRef, Vec<ValueRef>)> {
        let tree = match self.collections.get(&col) {
            Some(tree) => tree,
            None => return Vec::new(),
        };
        let iter = match range.scan_start() {
            Some(lower) => tree.iter_from(heap, lower),
            None => tree.iter(),
        };

        let mut out = Vec::new();
        for (key, bag) in iter {
            if range.contains(heap, key) {
                out.push((key, bag.clone()));
            } else if range.is_past(heap, key) {
                break;
            }
        }
        out
    }

    /// Returns the lowest `n` keys in order.
    pub fn first_keys(&self, col: ColId, n: usize) -> Vec<ValueRef> {
        match self.collections.get(&col) {
            Some(tree) => tree.first_keys(n),
            None => Vec::new(),
        }
    }

    /// Returns the number of keys in a collection.
    pub fn size(&self, col: ColId) -> usize {
        self.collections.get(&col).map_or(0, |tree| tree.len())
    }

    /// Applies a diff to a collection.
    ///
    /// Each entry `(k, vs)` replaces the multiset at `k`; an empty `vs`
    /// deletes `k`. New keys and values are increfed by the store; every
    /// displaced reference is returned for the caller to settle.
    pub fn apply(
        &mut self,
        heap: &mut Heap,
        col: ColId,
        entries: &[(ValueRef, Vec<ValueRef>)],
    ) -> Vec<Displaced> {
        let tree = self.collections.entry(col).or_insert_with(KeyTree::new);
        let mut displaced = Vec::new();

        for (key, values) in entries {
            if values.is_empty() {
                if let Some(old) = tree.remove(heap, *key) {
                    displaced.push(Displaced {
                        key: *key,
                        removed_key: true,
                        values: old,
                    });
                }
                continue;
            }

            for &v in values {
                heap.incref(v);
            }
            let had_key = tree.contains_key(heap, *key);
            if !had_key {
                heap.incref(*key);
            }
            if let Some(old) = tree.set(heap, *key, values.clone()) {
                displaced.push(Displaced {
                    key: *key,
                    removed_key: false,
                    values: old,
                });
            }
        }
        displaced
    }

    /// Releases every displaced reference back to the heap.
    pub fn release_displaced(heap: &mut Heap, displaced: Vec<Displaced>) {
        for entry in displaced {
            for v in entry.values {
                heap.decref(v);
            }
            if entry.removed_key {
                heap.decref(entry.key);
            }
        }
    }
}
