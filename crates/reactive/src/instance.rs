//! Resource instances: reader-scoped snapshot-plus-subscription state.

use crate::diff::{Diff, Watermark};
use crate::subscription::{SubscriptionId, SubscriptionManager};
use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::HashMap;
use skein_core::Value;
use skein_store::ColId;

/// A live, uniquely-identified binding of a resource template to
/// parameters.
///
/// The instance owns its watermark sequence: every diff pushed through it
/// gets the next watermark, is appended to the log for `get_all(since)`
/// polling, and is delivered to the subscribed callbacks.
pub struct ResourceInstance {
    id: String,
    resource: String,
    params: Value,
    output: ColId,
    /// Nodes pinned in the graph on behalf of this instance.
    pinned: Vec<ColId>,
    watermark: Watermark,
    log: Vec<Diff>,
    subscriptions: SubscriptionManager,
}

impl ResourceInstance {
    /// Creates an instance bound to the given output collection.
    pub fn new(
        id: impl Into<String>,
        resource: impl Into<String>,
        params: Value,
        output: ColId,
        pinned: Vec<ColId>,
    ) -> Self {
        Self {
            id: id.into(),
            resource: resource.into(),
            params,
            output,
            pinned,
            watermark: Watermark::ZERO,
            log: Vec::new(),
            subscriptions: SubscriptionManager::new(),
        }
    }

    /// The caller-chosen instance id.
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The resource template name this instance was built from.
    #[inline]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The instantiation parameters.
    #[inline]
    pub fn params(&self) -> &Value {
        &self.params
    }

    /// The instance's output collection.
    #[inline]
    pub fn output(&self) -> ColId {
        self.output
    }

    /// The nodes pinned for this instance.
    #[inline]
    pub fn pinned(&self) -> &[ColId] {
        &self.pinned
    }

    /// The highest watermark issued so far.
    #[inline]
    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    /// True if this instance binds the same (resource, params) pair.
    pub fn matches(&self, resource: &str, params: &Value) -> bool {
        self.resource == resource && &self.params == params
    }

    /// Issues the next watermark, appends the diff to the log and notifies
    /// subscribers. Returns the assigned watermark.
    pub fn push_diff(&mut self, entries: Vec<(Value, Vec<Value>)>, is_initial: bool) -> Watermark {
        self.watermark = self.watermark.next();
        let diff = if is_initial {
            Diff::initial(entries, self.watermark)
        } else {
            Diff::new(entries, self.watermark)
        };
        self.subscriptions.notify_all(&diff);
        self.log.push(diff);
        self.watermark
    }

    /// Returns the concatenation of every logged diff with a watermark
    /// beyond `since`, under the current high watermark.
    pub fn get_all_since(&self, since: Watermark) -> Diff {
        let mut entries = Vec::new();
        for diff in &self.log {
            if diff.watermark > since {
                entries.extend(diff.entries.iter().cloned());
            }
        }
        Diff::new(entries, self.watermark)
    }

    /// Subscribes a callback to this instance's diff stream.
    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: Fn(&Diff) + 'static,
    {
        self.subscriptions.subscribe(callback)
    }

    /// Unsubscribes a callback.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscriptions.unsubscribe(id)
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

/// The registry of open instances, indexed by id and by output collection.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: HashMap<String, ResourceInstance>,
    by_output: HashMap<ColId, Vec<String>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an instance. The caller has checked id uniqueness.
    pub fn open(&mut self, instance: ResourceInstance) {
        self.by_output
            .entry(instance.output())
            .or_default()
            .push(String::from(instance.id()));
        self.instances.insert(String::from(instance.id()), instance);
    }

    /// Removes an instance, returning it for teardown.
    pub fn close(&mut self, id: &str) -> Option<ResourceInstance> {
        let instance = self.instances.remove(id)?;
        if let Some(ids) = self.by_output.get_mut(&instance.output()) {
            ids.retain(|other| other != id);
            if ids.is_empty() {
                self.by_output.remove(&instance.output());
            }
        }
        Some(instance)
    }

    pub fn get(&self, id: &str) -> Option<&ResourceInstance> {
        self.instances.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ResourceInstance> {
        self.instances.get_mut(id)
    }

    /// Instance ids watching the given output collection.
    pub fn watching(&self, output: ColId) -> &[String] {
        self.by_output
            .get(&output)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
    }

    /// All open instance ids.
    pub fn ids(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use alloc::vec;
    use core::cell::RefCell;

    fn instance() -> ResourceInstance {
        ResourceInstance::new("i1", "res", Value::Null, 7, vec![7])
    }

    #[test]
    fn test_watermarks_strictly_increase() {
        let mut inst = instance();
        let w1 = inst.push_diff(vec![(Value::Int(1), vec![Value::Int(10)])], true);
        let w2 = inst.push_diff(vec![(Value::Int(1), vec![Value::Int(11)])], false);
        let w3 = inst.push_diff(vec![], false);
        assert!(w1 < w2 && w2 < w3);
        assert_eq!(inst.watermark(), w3);
    }

    #[test]
    fn test_get_all_since_returns_suffix() {
        let mut inst = instance();
        inst.push_diff(vec![(Value::Int(1), vec![Value::Int(10)])], true);
        let w1 = inst.watermark();
        inst.push_diff(vec![(Value::Int(2), vec![Value::Int(20)])], false);
        inst.push_diff(vec![(Value::Int(1), vec![])], false);

        let suffix = inst.get_all_since(w1);
        assert_eq!(suffix.entries.len(), 2);
        assert_eq!(suffix.entries[0].0, Value::Int(2));
        assert_eq!(suffix.entries[1], (Value::Int(1), vec![]));
        assert_eq!(suffix.watermark, inst.watermark());

        // nothing beyond the high watermark
        assert!(inst.get_all_since(inst.watermark()).is_empty());
    }

    #[test]
    fn test_subscribers_see_pushed_diffs() {
        let mut inst = instance();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        inst.subscribe(move |diff| seen_clone.borrow_mut().push(diff.clone()));

        inst.push_diff(vec![(Value::Int(1), vec![Value::Int(10)])], true);
        inst.push_diff(vec![(Value::Int(1), vec![])], false);

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_initial);
        assert!(!seen[1].is_initial);
        assert!(seen[0].watermark < seen[1].watermark);
    }

    #[test]
    fn test_matches() {
        let inst = instance();
        assert!(inst.matches("res", &Value::Null));
        assert!(!inst.matches("other", &Value::Null));
        assert!(!inst.matches("res", &Value::Int(1)));
    }

    #[test]
    fn test_registry_indexes_by_output() {
        let mut registry = InstanceRegistry::new();
        registry.open(instance());
        registry.open(ResourceInstance::new("i2", "res", Value::Null, 7, vec![7]));

        assert_eq!(registry.watching(7).len(), 2);
        assert!(registry.watching(8).is_empty());

        let closed = registry.close("i1").unwrap();
        assert_eq!(closed.id(), "i1");
        assert_eq!(registry.watching(7), &[String::from("i2")][..]);
        assert!(registry.close("i1").is_none());
    }
}
