//! Node definitions and operator traits.
//!
//! Each node produces one collection; the node id doubles as the collection
//! id in the store. Operator code is held behind `Rc` trait objects so the
//! propagator can invoke an operator while it mutates the rest of the graph.
//!
//! # Reference ownership protocol for operators
//!
//! Handles returned by an operator (mapper output pairs, reducer
//! accumulators, lazy results) each carry one heap reference that the engine
//! takes over. Freshly interned handles (`ctx.heap().intern_int(..)` and
//! friends) already satisfy this; to return a handle the operator merely
//! borrowed (an input value, the incoming accumulator), bump it first with
//! `EvalContext::keep` / `Heap::incref`.

use crate::eval::EvalContext;
use crate::trace::TraceSet;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::{HashMap, HashSet};
use skein_core::Result;
use skein_heap::{Heap, ValueRef};
use skein_store::ColId;

/// Per-key transformation: invoked once per (key, multiset) entry of the
/// input, emitting arbitrarily many (output key, value) pairs.
pub trait Mapper {
    fn map_entry(
        &self,
        ctx: &mut EvalContext<'_>,
        key: ValueRef,
        values: &[ValueRef],
    ) -> Result<Vec<(ValueRef, ValueRef)>>;
}

/// Group-law accumulator over the values mapped to one output key.
///
/// `remove` undoes `add`: `remove(add(a, v), v) == a`. A reducer that cannot
/// rewind a particular removal returns `Ok(None)` and the engine rebuilds
/// the accumulator from the key's full value multiset.
pub trait Reducer {
    /// The accumulator of an empty multiset.
    fn initial(&self, heap: &mut Heap) -> ValueRef;
    /// Advances the accumulator by one value.
    fn add(&self, heap: &mut Heap, acc: ValueRef, value: ValueRef) -> Result<ValueRef>;
    /// Rewinds the accumulator by one value; `None` requests a rebuild.
    fn remove(&self, heap: &mut Heap, acc: ValueRef, value: ValueRef)
        -> Result<Option<ValueRef>>;
}

/// Computes a lazy collection's multiset at one key on demand. The compute
/// function may read any collection through the context, including its own
/// (memoized; revisiting a key already being computed is a `CycleError`).
pub trait LazyCompute {
    fn compute(&self, ctx: &mut EvalContext<'_>, key: ValueRef) -> Result<Vec<ValueRef>>;
}

/// Delivery state of an external subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExternalStatus {
    /// No data yet; reads defer dependent recomputation.
    Pending,
    /// Data delivered; behaves like an input.
    Ready,
    /// The adapter reported an error; reads surface it.
    Failed(String),
}

/// The type and operator of a node.
pub enum NodeKind {
    /// Writable from outside through the engine API.
    Input,
    /// Per-key mapper.
    Map {
        input: ColId,
        mapper: Rc<dyn Mapper>,
    },
    /// Mapper followed by a per-output-key reducer.
    MapReduce {
        input: ColId,
        mapper: Rc<dyn Mapper>,
        reducer: Rc<dyn Reducer>,
    },
    /// Per-key multiset union of the inputs.
    Merge { inputs: Vec<ColId> },
    /// Keeps keys falling in any of the inclusive ranges.
    Slice {
        input: ColId,
        ranges: Vec<(ValueRef, ValueRef)>,
    },
    /// Keeps the lowest `limit` keys in sort order.
    Take { input: ColId, limit: usize },
    /// Whole-collection reduction onto a single sentinel key.
    Reduce {
        input: ColId,
        reducer: Rc<dyn Reducer>,
    },
    /// Memoized on demand per key.
    Lazy { compute: Rc<dyn LazyCompute> },
    /// Populated by an adapter subscription.
    External {
        service: String,
        identifier: String,
    },
}

impl NodeKind {
    /// The primary upstream collections of this kind.
    pub fn primary_inputs(&self) -> Vec<ColId> {
        match self {
            NodeKind::Input | NodeKind::Lazy { .. } | NodeKind::External { .. } => Vec::new(),
            NodeKind::Map { input, .. }
            | NodeKind::MapReduce { input, .. }
            | NodeKind::Slice { input, .. }
            | NodeKind::Take { input, .. }
            | NodeKind::Reduce { input, .. } => alloc::vec![*input],
            NodeKind::Merge { inputs } => inputs.clone(),
        }
    }

    /// Short name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Input => "input",
            NodeKind::Map { .. } => "map",
            NodeKind::MapReduce { .. } => "map_reduce",
            NodeKind::Merge { .. } => "merge",
            NodeKind::Slice { .. } => "slice",
            NodeKind::Take { .. } => "take",
            NodeKind::Reduce { .. } => "reduce",
            NodeKind::Lazy { .. } => "lazy",
            NodeKind::External { .. } => "external",
        }
    }
}

/// Mutable operator state, matching the node's kind.
///
/// Every handle stored here carries one heap reference owned by the state;
/// `Dataflow::release_node` settles them on teardown.
pub enum NodeState {
    None,
    /// Map: mapper output pairs per input key, the prior contribution to
    /// remove when the key reruns.
    Mapped {
        emitted: HashMap<ValueRef, Vec<(ValueRef, ValueRef)>>,
    },
    /// MapReduce: mapper outputs per input key plus the per-output-key
    /// value groups and accumulators.
    Reduced {
        emitted: HashMap<ValueRef, Vec<(ValueRef, ValueRef)>>,
        groups: HashMap<ValueRef, Vec<ValueRef>>,
        accs: HashMap<ValueRef, ValueRef>,
    },
    /// Reduce: the single accumulator and its sentinel output key.
    Total { out_key: ValueRef, acc: ValueRef },
    /// Lazy: the set of memoized keys.
    LazyCache { cached: HashSet<ValueRef> },
    /// External: subscription delivery state.
    External { status: ExternalStatus },
}

/// A node of the collection graph.
pub struct Node {
    pub kind: NodeKind,
    pub state: NodeState,
    /// Nodes reading this one, through primary edges or recorded consults.
    pub downstream: Vec<ColId>,
    /// Consults recorded while this node's operator ran.
    pub trace: TraceSet,
    /// Live resource instances holding this node as (part of) their graph.
    pub pins: u32,
}

impl Node {
    pub fn new(kind: NodeKind, heap: &mut Heap) -> Self {
        let state = match &kind {
            NodeKind::Map { .. } => NodeState::Mapped {
                emitted: HashMap::new(),
            },
            NodeKind::MapReduce { .. } => NodeState::Reduced {
                emitted: HashMap::new(),
                groups: HashMap::new(),
                accs: HashMap::new(),
            },
            NodeKind::Reduce { reducer, .. } => {
                let out_key = heap.intern_int(0);
                let acc = reducer.initial(heap);
                NodeState::Total { out_key, acc }
            }
            NodeKind::Lazy { .. } => NodeState::LazyCache {
                cached: HashSet::new(),
            },
            NodeKind::External { .. } => NodeState::External {
                status: ExternalStatus::Pending,
            },
            _ => NodeState::None,
        };
        Self {
            kind,
            state,
            downstream: Vec::new(),
            trace: TraceSet::new(),
            pins: 0,
        }
    }

    /// Returns the external status, if this is an external node.
    pub fn external_status(&self) -> Option<&ExternalStatus> {
        match &self.state {
            NodeState::External { status } => Some(status),
            _ => None,
        }
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self.kind, NodeKind::Lazy { .. })
    }

    pub fn is_external(&self) -> bool {
        matches!(self.kind, NodeKind::External { .. })
    }
}
