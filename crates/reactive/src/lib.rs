//! Skein Reactive - the reader-facing half of the engine.
//!
//! This crate implements the subscription machinery around the dataflow
//! kernel: watermarked diffs, per-reader resource instances with their diff
//! logs and callbacks, the adapter-facing external subscription surface,
//! and the single-threaded event queue that serializes everything that
//! touches the graph.
//!
//! # Core Concepts
//!
//! - `Diff`: a batch of (key, values) changes with a monotonic `Watermark`;
//!   the unit delivered to subscribers and returned by `get_all(since)`.
//! - `ResourceInstance`: a live binding of a resource template to
//!   parameters, with its own watermark sequence and diff log.
//! - `Adapter` / `SubscriptionHandle`: how external data enters the engine;
//!   callbacks never touch the graph directly, they enqueue events.
//! - `EventQueue`: the cooperative scheduler's mailbox.

#![no_std]

extern crate alloc;

pub mod diff;
pub mod external;
pub mod instance;
pub mod scheduler;
pub mod subscription;

pub use diff::{Diff, Watermark};
pub use external::{Adapter, ExternalBinding, ExternalRegistry, SubscriptionHandle};
pub use instance::{InstanceRegistry, ResourceInstance};
pub use scheduler::{Event, EventQueue};
pub use subscription::{DiffCallback, Subscription, SubscriptionId, SubscriptionManager};
