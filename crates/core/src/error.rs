//! Error types for the skein engine.

use crate::value::Value;
use alloc::string::String;
use core::fmt;

/// Result type alias for skein operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error taxonomy for the engine.
///
/// Every variant except `Pending` is surfaced to clients, either
/// synchronously (bad writes, unknown names) or as an error value embedded
/// in the diff stream of the affected keys. `Pending` is an internal signal:
/// a read hit an external collection whose subscription has not delivered
/// data yet, and the dependent recomputation must be deferred.
///
/// Invariant violations (refcount underflow, dangling handles) are not
/// represented here; they abort the engine via `panic!` because no correct
/// recovery exists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// An operator failed while processing a key.
    User { message: String },
    /// A lazy computation revisited a key already on its evaluation stack.
    Cycle { message: String },
    /// A constraint of the engine API was violated.
    Contract { message: String },
    /// An external adapter reported a failure for its subscription.
    Adapter { message: String, retryable: bool },
    /// A write or read referenced a collection that does not exist.
    UnknownCollection { id: u32 },
    /// A resource template name is not registered.
    UnknownResource { name: String },
    /// A resource instance id is not open.
    UnknownInstance { id: String },
    /// An external service name is not registered.
    UnknownService { name: String },
    /// `get_unique` found zero or more than one value at the key.
    NotUnique { count: usize },
    /// The consulted external collection is still loading.
    Pending,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::User { message } => write!(f, "operator failed: {}", message),
            Error::Cycle { message } => write!(f, "cyclic lazy computation: {}", message),
            Error::Contract { message } => write!(f, "contract violation: {}", message),
            Error::Adapter { message, retryable } => {
                write!(f, "adapter error (retryable: {}): {}", retryable, message)
            }
            Error::UnknownCollection { id } => write!(f, "unknown collection: {}", id),
            Error::UnknownResource { name } => write!(f, "unknown resource: {}", name),
            Error::UnknownInstance { id } => write!(f, "unknown resource instance: {}", id),
            Error::UnknownService { name } => write!(f, "unknown external service: {}", name),
            Error::NotUnique { count } => {
                write!(f, "expected exactly one value, found {}", count)
            }
            Error::Pending => write!(f, "external subscription still loading"),
        }
    }
}

impl Error {
    /// Creates a user (operator) error.
    pub fn user(message: impl Into<String>) -> Self {
        Error::User {
            message: message.into(),
        }
    }

    /// Creates a cycle error.
    pub fn cycle(message: impl Into<String>) -> Self {
        Error::Cycle {
            message: message.into(),
        }
    }

    /// Creates a contract error.
    pub fn contract(message: impl Into<String>) -> Self {
        Error::Contract {
            message: message.into(),
        }
    }

    /// Creates an adapter error.
    pub fn adapter(message: impl Into<String>, retryable: bool) -> Self {
        Error::Adapter {
            message: message.into(),
            retryable,
        }
    }

    /// Creates an unknown resource error.
    pub fn unknown_resource(name: impl Into<String>) -> Self {
        Error::UnknownResource { name: name.into() }
    }

    /// Creates an unknown instance error.
    pub fn unknown_instance(id: impl Into<String>) -> Self {
        Error::UnknownInstance { id: id.into() }
    }

    /// Creates an unknown service error.
    pub fn unknown_service(name: impl Into<String>) -> Self {
        Error::UnknownService { name: name.into() }
    }

    /// Returns true if this is the internal loading signal.
    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, Error::Pending)
    }

    /// Returns true if retrying the triggering operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Adapter { retryable, .. } => *retryable,
            Error::Pending => true,
            _ => false,
        }
    }

    /// Converts this error into an error value for the diff stream.
    ///
    /// Errors do not crash the engine; they travel through collections as
    /// `Value::Error` and reach readers in place of the affected values.
    pub fn into_error_value(self) -> Value {
        use alloc::string::ToString;
        Value::Error(self.to_string())
    }

    /// Renders the wire envelope `{"error": <json>, "retryable": <bool>}`
    /// returned for failed control-API calls.
    pub fn to_envelope_json(&self) -> String {
        use alloc::string::ToString;
        let mut out = String::from("{\"error\":");
        out.push_str(&crate::json::render(&Value::String(self.to_string())));
        out.push_str(",\"retryable\":");
        out.push_str(if self.is_retryable() { "true" } else { "false" });
        out.push('}');
        out
    }
}
