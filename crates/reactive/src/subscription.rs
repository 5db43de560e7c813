//! Subscription management for resource instances.

use crate::diff::Diff;
use alloc::boxed::Box;
use hashbrown::HashMap;

/// Unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Callback type for diff notifications.
pub type DiffCallback = Box<dyn Fn(&Diff)>;

/// A subscription to an instance's diff stream.
pub struct Subscription {
    id: SubscriptionId,
    callback: DiffCallback,
    active: bool,
}

impl Subscription {
    /// Creates a new subscription.
    pub fn new<F>(id: SubscriptionId, callback: F) -> Self
    where
        F: Fn(&Diff) + 'static,
    {
        Self {
            id,
            callback: Box::new(callback),
            active: true,
        }
    }

    /// Returns the subscription ID.
    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns whether this subscription is active.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Deactivates this subscription.
    #[inline]
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Delivers a diff to this subscription.
    pub fn notify(&self, diff: &Diff) {
        if self.active {
            (self.callback)(diff);
        }
    }
}

/// Manages the subscriptions of one resource instance.
pub struct SubscriptionManager {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    next_id: SubscriptionId,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionManager {
    /// Creates a new subscription manager.
    pub fn new() -> Self {
        Self {
            subscriptions: HashMap::new(),
            next_id: 1,
        }
    }

    /// Subscribes with the given callback, returning the subscription ID.
    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: Fn(&Diff) + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.subscriptions.insert(id, Subscription::new(id, callback));
        id
    }

    /// Unsubscribes by ID. Returns true if the subscription existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    /// Delivers a diff to every active subscription.
    pub fn notify_all(&self, diff: &Diff) {
        for sub in self.subscriptions.values() {
            sub.notify(diff);
        }
    }

    /// Returns the number of subscriptions.
    #[inline]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Returns true if there are no subscriptions.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::Watermark;
    use alloc::rc::Rc;
    use alloc::vec;
    use alloc::vec::Vec;
    use core::cell::RefCell;
    use skein_core::Value;

    fn sample_diff() -> Diff {
        Diff::new(vec![(Value::Int(1), vec![Value::Int(10)])], Watermark::ZERO.next())
    }

    #[test]
    fn test_subscribe_and_notify() {
        let mut manager = SubscriptionManager::new();
        let seen: Rc<RefCell<Vec<Watermark>>> = Rc::new(RefCell::new(Vec::new()));

        let seen_clone = seen.clone();
        manager.subscribe(move |diff| seen_clone.borrow_mut().push(diff.watermark));

        manager.notify_all(&sample_diff());
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let mut manager = SubscriptionManager::new();
        let count = Rc::new(RefCell::new(0));

        let count_clone = count.clone();
        let id = manager.subscribe(move |_| *count_clone.borrow_mut() += 1);

        manager.notify_all(&sample_diff());
        assert!(manager.unsubscribe(id));
        manager.notify_all(&sample_diff());

        assert_eq!(*count.borrow(), 1);
        assert!(!manager.unsubscribe(id));
    }

    #[test]
    fn test_multiple_subscribers_all_notified() {
        let mut manager = SubscriptionManager::new();
        let count = Rc::new(RefCell::new(0));

        for _ in 0..3 {
            let count_clone = count.clone();
            manager.subscribe(move |_| *count_clone.borrow_mut() += 1);
        }
        assert_eq!(manager.len(), 3);

        manager.notify_all(&sample_diff());
        assert_eq!(*count.borrow(), 3);
    }
}
