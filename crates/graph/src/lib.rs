//! Skein Graph - the collection graph and its incremental propagator.
//!
//! A `Dataflow` holds typed nodes (inputs, per-key operators, lazy and
//! external collections), their dependency edges, and the per-key traces
//! that record which inputs each output key consulted. The propagator turns
//! input diffs into the minimum set of per-key operator reruns and produces
//! the changed entries each downstream consumer needs.
//!
//! # Core Concepts
//!
//! - `NodeKind`: Input, Map, MapReduce, Merge, Slice, Take, Reduce, Lazy,
//!   External.
//! - `Mapper` / `Reducer` / `LazyCompute`: the operator traits user code
//!   implements. Operators are deterministic and read collections only
//!   through the `EvalContext` handed to them, which records traces.
//! - `TraceSet`: per-node record of (source, key) consults, inverted for
//!   invalidation.
//! - `Dataflow::apply_input`: applies a client diff and propagates to
//!   quiescence, returning the changed entries per node.
//!
//! Eager cycles are rejected when edges are wired; lazy self-recursion is
//! legal and guarded by an evaluation stack that turns revisits into
//! `CycleError`.

#![no_std]

extern crate alloc;

mod eval;
mod graph;
mod node;
mod propagate;
mod trace;

pub use eval::EvalContext;
pub use graph::{Dataflow, NodeId};
pub use node::{ExternalStatus, LazyCompute, Mapper, Node, NodeKind, Reducer};
pub use propagate::{NodeChanges, Propagated};
pub use trace::{Consult, TraceSet};
