//! Skein Core - value model and error types for the skein dataflow engine.
//!
//! This crate defines the `Value` tree that flows through every collection in
//! the engine, the structural ordering and hashing used for keys, a JSON text
//! codec for the wire format, and the engine-wide error taxonomy.
//!
//! # Core Concepts
//!
//! - `Value`: a JSON-shaped tree (null, booleans, numbers, strings, arrays,
//!   string-keyed objects) plus an `Error` variant used to surface operator
//!   failures through the diff stream.
//! - `ValueObject`: a JSON object with entries kept sorted by key so that
//!   lookup is O(log n) and structurally equal objects have one canonical
//!   representation.
//! - `Error` / `Result`: the error taxonomy shared by every engine crate.

#![no_std]

extern crate alloc;

pub mod error;
pub mod json;
pub mod value;

pub use error::{Error, Result};
pub use json::{parse, render};
pub use value::{Value, ValueKind, ValueObject};
