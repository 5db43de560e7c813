//! The dataflow graph: node registry, edge wiring and lifecycle.

use crate::node::{ExternalStatus, LazyCompute, Mapper, Node, NodeKind, NodeState, Reducer};
use alloc::format;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::HashMap;
use skein_core::{Error, Result};
use skein_heap::{Heap, ValueRef};
use skein_store::{ColId, CollectionStore};

/// Nodes and collections share one id space: a node's output collection
/// carries the node's id.
pub type NodeId = ColId;

/// The collection graph together with the store backing its collections.
///
/// All mutation happens on the engine thread; the propagator (see
/// `propagate`) and the lazy evaluator (see `eval`) are implemented as
/// methods on this type.
pub struct Dataflow {
    pub(crate) nodes: HashMap<NodeId, Node>,
    pub(crate) store: CollectionStore,
    next_id: NodeId,
    /// Lazy evaluation stack for cycle detection.
    pub(crate) lazy_stack: Vec<(NodeId, ValueRef)>,
    /// external node -> (reader, reader key) recomputations parked until
    /// the subscription delivers. Each parked key holds one reference.
    pub(crate) deferred: HashMap<NodeId, Vec<(NodeId, ValueRef)>>,
    /// The pending external that aborted the current computation, set at
    /// the deepest read and consumed by the propagator.
    pub(crate) last_pending: Option<NodeId>,
}

impl Default for Dataflow {
    fn default() -> Self {
        Self::new()
    }
}

impl Dataflow {
    /// Creates an empty dataflow.
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            store: CollectionStore::new(),
            next_id: 1,
            lazy_stack: Vec::new(),
            deferred: HashMap::new(),
            last_pending: None,
        }
    }

    /// Returns the number of live nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the node exists.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub(crate) fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(&id)
            .ok_or(Error::UnknownCollection { id })
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or(Error::UnknownCollection { id })
    }

    // ---- builders ----

    fn insert_node(&mut self, heap: &mut Heap, kind: NodeKind) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        let inputs = kind.primary_inputs();
        let node = Node::new(kind, heap);
        self.nodes.insert(id, node);
        self.store.create(id);
        for input in inputs {
            self.connect(input, id);
        }
        id
    }

    /// Creates a writable input collection.
    pub fn add_input(&mut self, heap: &mut Heap) -> NodeId {
        self.insert_node(heap, NodeKind::Input)
    }

    /// Creates a map node over `input`.
    pub fn add_map(
        &mut self,
        heap: &mut Heap,
        input: NodeId,
        mapper: impl Mapper + 'static,
    ) -> Result<NodeId> {
        self.node(input)?;
        Ok(self.insert_node(
            heap,
            NodeKind::Map {
                input,
                mapper: Rc::new(mapper),
            },
        ))
    }

    /// Creates a map-reduce node over `input`.
    pub fn add_map_reduce(
        &mut self,
        heap: &mut Heap,
        input: NodeId,
        mapper: impl Mapper + 'static,
        reducer: impl Reducer + 'static,
    ) -> Result<NodeId> {
        self.node(input)?;
        Ok(self.insert_node(
            heap,
            NodeKind::MapReduce {
                input,
                mapper: Rc::new(mapper),
                reducer: Rc::new(reducer),
            },
        ))
    }

    /// Creates a merge node over two or more inputs.
    pub fn add_merge(&mut self, heap: &mut Heap, inputs: &[NodeId]) -> Result<NodeId> {
        if inputs.len() < 2 {
            return Err(Error::contract("merge requires at least two inputs"));
        }
        for &input in inputs {
            self.node(input)?;
        }
        Ok(self.insert_node(
            heap,
            NodeKind::Merge {
                inputs: inputs.to_vec(),
            },
        ))
    }

    /// Creates a slice node keeping keys inside any of the inclusive
    /// `[lo, hi]` ranges. Takes one reference per bound.
    pub fn add_slice(
        &mut self,
        heap: &mut Heap,
        input: NodeId,
        ranges: &[(ValueRef, ValueRef)],
    ) -> Result<NodeId> {
        self.node(input)?;
        for &(lo, hi) in ranges {
            heap.incref(lo);
            heap.incref(hi);
        }
        Ok(self.insert_node(
            heap,
            NodeKind::Slice {
                input,
                ranges: ranges.to_vec(),
            },
        ))
    }

    /// Creates a take node keeping the lowest `limit` keys.
    pub fn add_take(&mut self, heap: &mut Heap, input: NodeId, limit: usize) -> Result<NodeId> {
        self.node(input)?;
        Ok(self.insert_node(heap, NodeKind::Take { input, limit }))
    }

    /// Creates a whole-collection reduce node.
    pub fn add_reduce(
        &mut self,
        heap: &mut Heap,
        input: NodeId,
        reducer: impl Reducer + 'static,
    ) -> Result<NodeId> {
        self.node(input)?;
        Ok(self.insert_node(
            heap,
            NodeKind::Reduce {
                input,
                reducer: Rc::new(reducer),
            },
        ))
    }

    /// Creates a lazy node.
    pub fn add_lazy(&mut self, heap: &mut Heap, compute: impl LazyCompute + 'static) -> NodeId {
        self.insert_node(
            heap,
            NodeKind::Lazy {
                compute: Rc::new(compute),
            },
        )
    }

    /// Creates an external node bound to (service, identifier).
    pub fn add_external(
        &mut self,
        heap: &mut Heap,
        service: impl Into<String>,
        identifier: impl Into<String>,
    ) -> NodeId {
        self.insert_node(
            heap,
            NodeKind::External {
                service: service.into(),
                identifier: identifier.into(),
            },
        )
    }

    // ---- edges ----

    fn connect(&mut self, src: NodeId, reader: NodeId) {
        if let Some(node) = self.nodes.get_mut(&src) {
            if !node.downstream.contains(&reader) {
                node.downstream.push(reader);
            }
        }
    }

    /// Wires a dynamic edge discovered through a consult. Lazy self-reads
    /// are legal and not stored; any other cycle is rejected.
    pub(crate) fn connect_dynamic(&mut self, src: NodeId, reader: NodeId) -> Result<()> {
        if src == reader {
            let lazy = self.nodes.get(&src).map(|n| n.is_lazy()).unwrap_or(false);
            if lazy {
                return Ok(());
            }
            return Err(Error::contract(format!(
                "collection {} reads itself",
                src
            )));
        }
        if self.reaches(reader, src) {
            return Err(Error::contract(format!(
                "read of collection {} from {} would close a cycle",
                src, reader
            )));
        }
        self.connect(src, reader);
        Ok(())
    }

    /// Returns true if `to` is reachable from `from` along downstream edges.
    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        if from == to {
            return true;
        }
        let mut stack = alloc::vec![from];
        let mut seen: Vec<NodeId> = Vec::new();
        while let Some(id) = stack.pop() {
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            if let Some(node) = self.nodes.get(&id) {
                for &next in &node.downstream {
                    if next == to {
                        return true;
                    }
                    if next != id {
                        stack.push(next);
                    }
                }
            }
        }
        false
    }

    /// Topological order over the current graph, ignoring lazy self-edges.
    pub(crate) fn topo_order(&self) -> Vec<NodeId> {
        let mut indegree: HashMap<NodeId, usize> =
            self.nodes.keys().map(|&id| (id, 0)).collect();
        for (&id, node) in &self.nodes {
            for &reader in &node.downstream {
                if reader != id && self.nodes.contains_key(&reader) {
                    *indegree.entry(reader).or_insert(0) += 1;
                }
            }
        }

        let mut ready: Vec<NodeId> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();
        ready.sort_unstable();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.first().copied() {
            ready.remove(0);
            order.push(id);
            if let Some(node) = self.nodes.get(&id) {
                for &reader in &node.downstream {
                    if reader == id {
                        continue;
                    }
                    if let Some(d) = indegree.get_mut(&reader) {
                        *d -= 1;
                        if *d == 0 {
                            let pos = ready
                                .binary_search(&reader)
                                .unwrap_or_else(|insert_at| insert_at);
                            ready.insert(pos, reader);
                        }
                    }
                }
            }
        }
        order
    }

    // ---- lifecycle ----

    /// Pins a node on behalf of a resource instance.
    pub fn pin(&mut self, id: NodeId) -> Result<()> {
        self.node_mut(id)?.pins += 1;
        Ok(())
    }

    /// Unpins a node. Call `sweep` afterwards to release unreachable nodes.
    pub fn unpin(&mut self, id: NodeId) -> Result<()> {
        let node = self.node_mut(id)?;
        if node.pins > 0 {
            node.pins -= 1;
        }
        Ok(())
    }

    /// Releases every node with no pins and no readers, transitively.
    /// Returns the released ids (externals among them need unsubscribing).
    pub fn sweep(&mut self, heap: &mut Heap) -> Vec<NodeId> {
        let mut released = Vec::new();
        loop {
            let victim = self
                .nodes
                .iter()
                .filter(|(_, n)| n.pins == 0 && n.downstream.is_empty())
                .map(|(&id, _)| id)
                .min();
            match victim {
                Some(id) => {
                    self.release_node(heap, id);
                    released.push(id);
                }
                None => return released,
            }
        }
    }

    /// Tears a node down, settling every reference its state holds.
    pub(crate) fn release_node(&mut self, heap: &mut Heap, id: NodeId) {
        let mut node = match self.nodes.remove(&id) {
            Some(n) => n,
            None => return,
        };

        for (key, values) in self.store.drop_collection(id) {
            heap.decref(key);
            for v in values {
                heap.decref(v);
            }
        }

        node.trace.clear_all(heap);
        match node.state {
            NodeState::Mapped { emitted } => release_emitted(heap, emitted),
            NodeState::Reduced {
                emitted,
                groups,
                accs,
            } => {
                release_emitted(heap, emitted);
                for (k2, values) in groups {
                    heap.decref(k2);
                    for v in values {
                        heap.decref(v);
                    }
                }
                for (k2, acc) in accs {
                    heap.decref(k2);
                    heap.decref(acc);
                }
            }
            NodeState::Total { out_key, acc } => {
                heap.decref(out_key);
                heap.decref(acc);
            }
            NodeState::LazyCache { cached } => {
                for key in cached {
                    heap.decref(key);
                }
            }
            NodeState::External { .. } | NodeState::None => {}
        }
        if let NodeKind::Slice { ranges, .. } = &node.kind {
            for &(lo, hi) in ranges {
                heap.decref(lo);
                heap.decref(hi);
            }
        }

        for other in self.nodes.values_mut() {
            other.downstream.retain(|&reader| reader != id);
        }

        if let Some(parked) = self.deferred.remove(&id) {
            for (_, key) in parked {
                heap.decref(key);
            }
        }
        for parked in self.deferred.values_mut() {
            let mut keep = Vec::with_capacity(parked.len());
            for (reader, key) in parked.drain(..) {
                if reader == id {
                    heap.decref(key);
                } else {
                    keep.push((reader, key));
                }
            }
            *parked = keep;
        }
    }

    // ---- reads ----

    /// Reader-facing point lookup. Lazy collections are pulled (and
    /// memoized); pending externals read as empty.
    pub fn read_array(
        &mut self,
        heap: &mut Heap,
        col: NodeId,
        key: ValueRef,
    ) -> Result<Vec<ValueRef>> {
        let node = self.node(col)?;
        if node.is_lazy() {
            return self.lazy_get(heap, col, key);
        }
        if matches!(node.external_status(), Some(ExternalStatus::Pending)) {
            return Ok(Vec::new());
        }
        Ok(self.store.get_array(heap, col, key).to_vec())
    }

    /// Reader-facing unique lookup: exactly one value or a typed error.
    pub fn read_unique(
        &mut self,
        heap: &mut Heap,
        col: NodeId,
        key: ValueRef,
    ) -> Result<ValueRef> {
        let values = self.read_array(heap, col, key)?;
        match values.as_slice() {
            [single] => Ok(*single),
            other => Err(Error::NotUnique { count: other.len() }),
        }
    }

    /// Every (key, multiset) entry of a collection in key order.
    pub fn read_all(&self, col: NodeId) -> Result<Vec<(ValueRef, Vec<ValueRef>)>> {
        self.node(col)?;
        Ok(self.store.get_all(col))
    }

    /// Number of keys in a collection.
    pub fn size(&self, col: NodeId) -> Result<usize> {
        self.node(col)?;
        Ok(self.store.size(col))
    }
}

pub(crate) fn release_emitted(
    heap: &mut Heap,
    emitted: HashMap<ValueRef, Vec<(ValueRef, ValueRef)>>,
) {
    for (k1, pairs) in emitted {
        heap.decref(k1);
        for (k2, v2) in pairs {
            heap.decref(k2);
            heap.decref(v2);
        }
    }
}
