//! The adapter-facing subscription surface.
//!
//! An adapter is handed a `SubscriptionHandle` when the engine subscribes
//! to one of its resources. The handle's callback triple (`update`,
//! `loading`, `error`) never touches the graph: each call enqueues an event
//! that the engine thread applies in order. Late callbacks arriving after
//! unsubscription are dropped through the handle's liveness flag.

use crate::scheduler::{Event, EventQueue};
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::Cell;
use hashbrown::HashMap;
use skein_core::{render, Value};
use skein_store::ColId;

/// The engine-side callbacks of one external subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    queue: EventQueue,
    node: ColId,
    alive: Rc<Cell<bool>>,
}

impl SubscriptionHandle {
    pub fn new(queue: EventQueue, node: ColId, alive: Rc<Cell<bool>>) -> Self {
        Self { queue, node, alive }
    }

    /// The external collection this subscription feeds.
    #[inline]
    pub fn node(&self) -> ColId {
        self.node
    }

    /// Delivers data. `is_initial` replaces the whole contents; otherwise
    /// the entries are a delta where an empty value list deletes the key.
    pub fn update(&self, entries: Vec<(Value, Vec<Value>)>, is_initial: bool) {
        if self.alive.get() {
            self.queue.push(Event::ExternalUpdate {
                node: self.node,
                entries,
                is_initial,
            });
        }
    }

    /// Marks the subscription as pending until the next update.
    pub fn loading(&self) {
        if self.alive.get() {
            self.queue.push(Event::ExternalLoading { node: self.node });
        }
    }

    /// Reports a subscription failure.
    pub fn error(&self, message: impl Into<String>) {
        if self.alive.get() {
            self.queue.push(Event::ExternalError {
                node: self.node,
                message: message.into(),
            });
        }
    }
}

/// An external data source the engine can subscribe to.
///
/// Implementations own their I/O (connections, timers, worker threads) and
/// deliver results exclusively through the handle. `subscribe` may call the
/// handle synchronously; the events drain after the current engine event
/// completes.
pub trait Adapter {
    /// Opens a subscription for (instance, identifier, params).
    fn subscribe(
        &self,
        instance: &str,
        identifier: &str,
        params: &Value,
        handle: SubscriptionHandle,
    );

    /// Closes the subscription previously opened for the identifier.
    /// Best-effort; callbacks arriving afterwards are dropped.
    fn unsubscribe(&self, identifier: &str);

    /// Releases every resource the adapter holds.
    fn shutdown(&self);
}

/// One bound external collection.
pub struct ExternalBinding {
    pub node: ColId,
    pub service: String,
    pub identifier: String,
    pub params: Value,
    /// Cleared on unsubscribe so late callbacks die at the handle.
    pub alive: Rc<Cell<bool>>,
}

/// Registry of external collections, shared across resource instances that
/// subscribe to the same (service, identifier, params) triple.
#[derive(Default)]
pub struct ExternalRegistry {
    by_key: HashMap<(String, String, String), ColId>,
    bindings: HashMap<ColId, ExternalBinding>,
}

impl ExternalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(service: &str, identifier: &str, params: &Value) -> (String, String, String) {
        (String::from(service), String::from(identifier), render(params))
    }

    /// Looks up the collection already bound to this triple.
    pub fn find(&self, service: &str, identifier: &str, params: &Value) -> Option<ColId> {
        self.by_key
            .get(&Self::key(service, identifier, params))
            .copied()
    }

    /// Binds a collection to the triple.
    pub fn bind(
        &mut self,
        node: ColId,
        service: &str,
        identifier: &str,
        params: Value,
    ) -> Rc<Cell<bool>> {
        let alive = Rc::new(Cell::new(true));
        self.by_key.insert(Self::key(service, identifier, &params), node);
        self.bindings.insert(
            node,
            ExternalBinding {
                node,
                service: String::from(service),
                identifier: String::from(identifier),
                params,
                alive: alive.clone(),
            },
        );
        alive
    }

    /// Returns the binding of a collection, if it is external.
    pub fn get(&self, node: ColId) -> Option<&ExternalBinding> {
        self.bindings.get(&node)
    }

    /// Returns true if the collection is a live external binding.
    pub fn is_live(&self, node: ColId) -> bool {
        self.bindings
            .get(&node)
            .map(|b| b.alive.get())
            .unwrap_or(false)
    }

    /// Unbinds a collection, killing its handle. Returns the binding so the
    /// caller can unsubscribe from the adapter.
    pub fn unbind(&mut self, node: ColId) -> Option<ExternalBinding> {
        let binding = self.bindings.remove(&node)?;
        binding.alive.set(false);
        self.by_key
            .remove(&Self::key(&binding.service, &binding.identifier, &binding.params));
        Some(binding)
    }

    /// All bound collections.
    pub fn nodes(&self) -> Vec<ColId> {
        self.bindings.keys().copied().collect()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_handle_enqueues_while_alive() {
        let queue = EventQueue::new();
        let alive = Rc::new(Cell::new(true));
        let handle = SubscriptionHandle::new(queue.clone(), 5, alive.clone());

        handle.loading();
        handle.update(vec![(Value::Int(0), vec![Value::Int(100)])], true);
        assert_eq!(queue.len(), 2);

        // a dead handle drops everything silently
        alive.set(false);
        handle.update(vec![], false);
        handle.error("late");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_registry_shares_bindings_by_triple() {
        let mut registry = ExternalRegistry::new();
        registry.bind(9, "db", "users", Value::Null);

        assert_eq!(registry.find("db", "users", &Value::Null), Some(9));
        assert_eq!(registry.find("db", "users", &Value::Int(1)), None);
        assert_eq!(registry.find("db", "orders", &Value::Null), None);
        assert!(registry.is_live(9));
    }

    #[test]
    fn test_unbind_kills_the_handle() {
        let queue = EventQueue::new();
        let mut registry = ExternalRegistry::new();
        let alive = registry.bind(9, "db", "users", Value::Null);
        let handle = SubscriptionHandle::new(queue.clone(), 9, alive);

        let binding = registry.unbind(9).unwrap();
        assert_eq!(binding.identifier, "users");
        assert!(registry.find("db", "users", &Value::Null).is_none());

        handle.update(vec![], true);
        assert!(queue.is_empty());
    }
}
