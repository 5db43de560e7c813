//! The cooperative event queue.
//!
//! Every mutation of the graph is funneled through one queue drained on the
//! engine thread: client writes, adapter callbacks, lifecycle requests.
//! Each event runs to completion (including its propagation) before the
//! next is popped; adapter I/O happens elsewhere and lands here as events.

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use skein_core::Value;
use skein_store::ColId;

/// An event awaiting the engine thread.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A client write to an input collection.
    ClientUpdate {
        collection: ColId,
        entries: Vec<(Value, Vec<Value>)>,
    },
    /// An adapter delivered data for an external collection.
    ExternalUpdate {
        node: ColId,
        entries: Vec<(Value, Vec<Value>)>,
        is_initial: bool,
    },
    /// An adapter marked its subscription as loading.
    ExternalLoading { node: ColId },
    /// An adapter reported a failure.
    ExternalError { node: ColId, message: String },
}

/// A shared handle to the engine's event queue. Cloneable so adapter
/// callback handles can enqueue from wherever their results arrive;
/// dequeueing happens only on the engine thread.
#[derive(Clone, Default)]
pub struct EventQueue {
    events: Rc<RefCell<VecDeque<Event>>>,
}

impl EventQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues an event.
    pub fn push(&self, event: Event) {
        self.events.borrow_mut().push_back(event);
    }

    /// Pops the next event, if any.
    pub fn pop(&self) -> Option<Event> {
        self.events.borrow_mut().pop_front()
    }

    /// Returns the number of queued events.
    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    /// Returns true if no events are queued.
    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_fifo_order() {
        let queue = EventQueue::new();
        queue.push(Event::ExternalLoading { node: 1 });
        queue.push(Event::ExternalLoading { node: 2 });

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(Event::ExternalLoading { node: 1 }));
        assert_eq!(queue.pop(), Some(Event::ExternalLoading { node: 2 }));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_clones_share_the_queue() {
        let queue = EventQueue::new();
        let handle = queue.clone();
        handle.push(Event::ClientUpdate {
            collection: 3,
            entries: vec![(Value::Int(1), vec![Value::Int(2)])],
        });

        assert!(!queue.is_empty());
        assert!(matches!(
            queue.pop(),
            Some(Event::ClientUpdate { collection: 3, .. })
        ));
        assert!(handle.is_empty());
    }
}
