//! Skein Heap - interned, reference-counted storage for engine values.
//!
//! Every value that crosses a collection boundary lives here. Interning
//! canonicalizes structure: two structurally equal values always resolve to
//! the same handle, so handle equality is structural equality and handles
//! can be used directly as hash-map keys by the rest of the engine.
//!
//! # Core Concepts
//!
//! - `ValueRef`: a copyable handle into the heap, stable for the life of the
//!   value it names.
//! - `Heap`: slot arena with a free pool, a content-hash dedup table, and
//!   per-slot reference counts. Dropping the last reference releases the
//!   slot and, iteratively, every child reference it held.
//! - Structural comparison (`Heap::cmp`) over handles without materializing,
//!   used by the ordered collection store for key order.
//!
//! The heap is single-threaded by design; the engine scheduler owns it.

#![no_std]

extern crate alloc;

mod heap;

pub use heap::{Heap, ValueRef};
