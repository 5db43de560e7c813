//! Per-node consult traces.
//!
//! While an operator runs for one of its keys, every collection read it
//! performs is recorded as a consult. The trace keeps a forward record (own
//! key -> consults) so entries can be cleared precisely before a rerun, and
//! an inverted index ((source, source key) -> own keys) that the propagator
//! uses to find which keys to rerun when a source key changes.
//!
//! The inverted index may over-approximate (a rerun that consults nothing is
//! harmless); it must never under-approximate. Whole-collection reads are
//! recorded as broad consults that match any key of the source.
//!
//! The forward record owns one heap reference per stored handle; the
//! inverted index stores the same handles and is always cleared in lockstep.

use alloc::vec::Vec;
use hashbrown::{HashMap, HashSet};
use skein_heap::{Heap, ValueRef};
use skein_store::ColId;

/// One recorded read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Consult {
    /// A point read of (source, key).
    Key { src: ColId, key: ValueRef },
    /// A whole-collection read of the source.
    Broad { src: ColId },
}

impl Consult {
    /// The source collection of this consult.
    pub fn src(&self) -> ColId {
        match self {
            Consult::Key { src, .. } | Consult::Broad { src } => *src,
        }
    }
}

/// The consult trace of one node.
#[derive(Default)]
pub struct TraceSet {
    /// own key -> consults recorded when it was last computed
    forward: HashMap<ValueRef, Vec<Consult>>,
    /// source -> source key -> own keys that consulted it
    inverse: HashMap<ColId, HashMap<ValueRef, HashSet<ValueRef>>>,
    /// source -> own keys that read the whole source
    broad: HashMap<ColId, HashSet<ValueRef>>,
}

impl TraceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no consults are recorded.
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Replaces the consults recorded for `own_key`.
    ///
    /// Takes one reference on `own_key` and on each consulted key for the
    /// lifetime of the record.
    pub fn install(&mut self, heap: &mut Heap, own_key: ValueRef, consults: Vec<Consult>) {
        self.clear_key(heap, own_key);
        if consults.is_empty() {
            return;
        }
        for consult in &consults {
            match consult {
                Consult::Key { src, key } => {
                    heap.incref(*key);
                    self.inverse
                        .entry(*src)
                        .or_default()
                        .entry(*key)
                        .or_default()
                        .insert(own_key);
                }
                Consult::Broad { src } => {
                    self.broad.entry(*src).or_default().insert(own_key);
                }
            }
        }
        heap.incref(own_key);
        self.forward.insert(own_key, consults);
    }

    /// Clears the consults recorded for `own_key`, releasing their
    /// references.
    pub fn clear_key(&mut self, heap: &mut Heap, own_key: ValueRef) {
        let consults = match self.forward.remove(&own_key) {
            Some(cs) => cs,
            None => return,
        };
        for consult in consults {
            match consult {
                Consult::Key { src, key } => {
                    if let Some(keys) = self.inverse.get_mut(&src) {
                        if let Some(owners) = keys.get_mut(&key) {
                            owners.remove(&own_key);
                            if owners.is_empty() {
                                keys.remove(&key);
                            }
                        }
                        if keys.is_empty() {
                            self.inverse.remove(&src);
                        }
                    }
                    heap.decref(key);
                }
                Consult::Broad { src } => {
                    if let Some(owners) = self.broad.get_mut(&src) {
                        owners.remove(&own_key);
                        if owners.is_empty() {
                            self.broad.remove(&src);
                        }
                    }
                }
            }
        }
        heap.decref(own_key);
    }

    /// Own keys whose computation consulted (src, key), including broad
    /// readers of src.
    pub fn invalidated_by(&self, src: ColId, key: ValueRef) -> Vec<ValueRef> {
        let mut out: Vec<ValueRef> = Vec::new();
        if let Some(owners) = self.inverse.get(&src).and_then(|keys| keys.get(&key)) {
            out.extend(owners.iter().copied());
        }
        if let Some(owners) = self.broad.get(&src) {
            for &k in owners {
                if !out.contains(&k) {
                    out.push(k);
                }
            }
        }
        out
    }

    /// Every own key with a consult on src (used when a source fails or is
    /// replaced wholesale).
    pub fn all_readers_of(&self, src: ColId) -> Vec<ValueRef> {
        let mut out: Vec<ValueRef> = Vec::new();
        if let Some(keys) = self.inverse.get(&src) {
            for owners in keys.values() {
                for &k in owners {
                    if !out.contains(&k) {
                        out.push(k);
                    }
                }
            }
        }
        if let Some(owners) = self.broad.get(&src) {
            for &k in owners {
                if !out.contains(&k) {
                    out.push(k);
                }
            }
        }
        out
    }

    /// The sources this trace references.
    pub fn sources(&self) -> Vec<ColId> {
        let mut out: Vec<ColId> = self.inverse.keys().copied().collect();
        for src in self.broad.keys() {
            if !out.contains(src) {
                out.push(*src);
            }
        }
        out
    }

    /// Clears everything, releasing all held references.
    pub fn clear_all(&mut self, heap: &mut Heap) {
        let own_keys: Vec<ValueRef> = self.forward.keys().copied().collect();
        for k in own_keys {
            self.clear_key(heap, k);
        }
        self.inverse.clear();
        self.broad.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_install_and_invalidate() {
        let mut heap = Heap::new();
        let mut trace = TraceSet::new();
        let own = heap.intern_int(1);
        let src_key = heap.intern_int(10);

        trace.install(
            &mut heap,
            own,
            vec![Consult::Key {
                src: 7,
                key: src_key,
            }],
        );

        assert_eq!(trace.invalidated_by(7, src_key), vec![own]);
        let other = heap.intern_int(11);
        assert!(trace.invalidated_by(7, other).is_empty());
        assert!(trace.invalidated_by(8, src_key).is_empty());
        assert_eq!(trace.sources(), vec![7]);
    }

    #[test]
    fn test_install_replaces_previous_consults() {
        let mut heap = Heap::new();
        let mut trace = TraceSet::new();
        let own = heap.intern_int(1);
        let a = heap.intern_int(10);
        let b = heap.intern_int(11);

        trace.install(&mut heap, own, vec![Consult::Key { src: 7, key: a }]);
        trace.install(&mut heap, own, vec![Consult::Key { src: 7, key: b }]);

        assert!(trace.invalidated_by(7, a).is_empty());
        assert_eq!(trace.invalidated_by(7, b), vec![own]);
    }

    #[test]
    fn test_broad_consult_matches_any_key() {
        let mut heap = Heap::new();
        let mut trace = TraceSet::new();
        let own = heap.intern_int(1);

        trace.install(&mut heap, own, vec![Consult::Broad { src: 7 }]);

        let any = heap.intern_int(99);
        assert_eq!(trace.invalidated_by(7, any), vec![own]);
        assert_eq!(trace.all_readers_of(7), vec![own]);
    }

    #[test]
    fn test_refcounts_released_on_clear() {
        let mut heap = Heap::new();
        let mut trace = TraceSet::new();
        let own = heap.intern_int(1);
        let key = heap.intern_int(10);

        trace.install(&mut heap, own, vec![Consult::Key { src: 7, key }]);
        assert_eq!(heap.refs(own), 2);
        assert_eq!(heap.refs(key), 2);

        trace.clear_all(&mut heap);
        assert_eq!(heap.refs(own), 1);
        assert_eq!(heap.refs(key), 1);

        heap.decref(own);
        heap.decref(key);
        assert!(heap.is_empty());
    }
}
