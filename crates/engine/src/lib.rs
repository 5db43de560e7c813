//! Skein Engine - the embedding-facing surface of the reactive dataflow
//! kernel.
//!
//! An `Engine` owns the interned heap, the collection graph, the event
//! queue and the reader registries, and exposes the control API an
//! embedding service drives:
//!
//! - `create_input` / `update`: writable collections and client diffs.
//! - `register_resource` / `instantiate_resource` /
//!   `close_resource_instance`: resource templates and their live
//!   instances.
//! - `get_all` / `get_all_since` / `get_array` / `subscribe`: the reader
//!   protocol with monotonic watermarks.
//! - `register_external` + the `Adapter` trait: external data sources.
//! - `close`: engine shutdown, releasing every node, instance and value.
//!
//! Everything runs on one thread: client calls and adapter callbacks are
//! serialized through the event queue, and each event propagates to
//! quiescence before the next is popped.

#![no_std]

extern crate alloc;

mod context;
mod engine;

pub use context::{Resource, ResourceContext};
pub use engine::Engine;

pub use skein_core::{Error, Result, Value, ValueObject};
pub use skein_graph::{EvalContext, LazyCompute, Mapper, NodeId, Reducer};
pub use skein_reactive::{Adapter, Diff, SubscriptionHandle, SubscriptionId, Watermark};
