//! The engine facade.

use crate::context::{Resource, ResourceContext};
use alloc::format;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::HashMap;
use skein_core::{Error, Result, Value};
use skein_graph::{Dataflow, Propagated};
use skein_heap::{Heap, ValueRef};
use skein_reactive::{
    Adapter, Diff, Event, EventQueue, ExternalRegistry, InstanceRegistry, ResourceInstance,
    SubscriptionId, Watermark,
};
use skein_store::ColId;

/// One reactive dataflow engine: heap, graph, scheduler and reader state.
///
/// Embedders instantiate one per service, register inputs, resources and
/// adapters, and drive it from a single thread. Adapter callbacks may be
/// issued from anywhere; they enqueue events that apply on the next
/// `pump` (every control-API call pumps before returning).
pub struct Engine {
    heap: Heap,
    df: Dataflow,
    queue: EventQueue,
    inputs: HashMap<String, ColId>,
    resources: HashMap<String, Rc<dyn Resource>>,
    adapters: HashMap<String, Rc<dyn Adapter>>,
    instances: InstanceRegistry,
    externals: ExternalRegistry,
    closed: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Creates an engine with no collections.
    pub fn new() -> Self {
        Self {
            heap: Heap::new(),
            df: Dataflow::new(),
            queue: EventQueue::new(),
            inputs: HashMap::new(),
            resources: HashMap::new(),
            adapters: HashMap::new(),
            instances: InstanceRegistry::new(),
            externals: ExternalRegistry::new(),
            closed: false,
        }
    }

    /// The interned heap, for diagnostics.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    // ---- registration ----

    /// Creates a named writable input collection.
    pub fn create_input(&mut self, name: &str) -> Result<ColId> {
        self.ensure_open()?;
        if self.inputs.contains_key(name) {
            return Err(Error::contract(format!(
                "input collection already exists: {}",
                name
            )));
        }
        let id = self.df.add_input(&mut self.heap);
        self.df.pin(id)?;
        self.inputs.insert(String::from(name), id);
        Ok(id)
    }

    /// Registers a resource template under a name.
    pub fn register_resource(&mut self, name: &str, resource: impl Resource + 'static) {
        self.resources.insert(String::from(name), Rc::new(resource));
    }

    /// Registers an adapter for an external service name.
    pub fn register_external(&mut self, service: &str, adapter: impl Adapter + 'static) {
        self.adapters.insert(String::from(service), Rc::new(adapter));
    }

    // ---- writes ----

    /// Applies a client diff to a named input collection. The whole batch
    /// is applied atomically before propagation runs.
    pub fn update(&mut self, collection: &str, entries: &[(Value, Vec<Value>)]) -> Result<()> {
        self.ensure_open()?;
        let col = *self
            .inputs
            .get(collection)
            .ok_or_else(|| Error::contract(format!("unknown input collection: {}", collection)))?;
        self.queue.push(Event::ClientUpdate {
            collection: col,
            entries: entries.to_vec(),
        });
        self.pump();
        Ok(())
    }

    // ---- resource instances ----

    /// Opens a resource instance. Idempotent for an identical
    /// (id, resource, params) triple; a conflicting id is an error.
    pub fn instantiate_resource(
        &mut self,
        instance_id: &str,
        resource: &str,
        params: Value,
    ) -> Result<()> {
        self.ensure_open()?;
        if let Some(existing) = self.instances.get(instance_id) {
            if existing.matches(resource, &params) {
                return Ok(());
            }
            return Err(Error::contract(format!(
                "instance {} already bound to a different resource",
                instance_id
            )));
        }

        let template = self
            .resources
            .get(resource)
            .cloned()
            .ok_or_else(|| Error::unknown_resource(resource))?;

        let mut ctx = ResourceContext::new(
            &mut self.heap,
            &mut self.df,
            &self.inputs,
            &self.adapters,
            &mut self.externals,
            &self.queue,
            instance_id,
            &params,
        );
        match template.instantiate(&mut ctx) {
            Ok(output) => {
                let mut pinned = ctx.finish();
                if !pinned.contains(&output) {
                    pinned.push(output);
                }
                for &node in &pinned {
                    self.df.pin(node)?;
                }
                let mut instance =
                    ResourceInstance::new(instance_id, resource, params, output, pinned);
                let snapshot = self.materialize_all(output)?;
                instance.push_diff(snapshot, true);
                self.instances.open(instance);
            }
            Err(e) => {
                drop(ctx);
                self.cleanup_released();
                return Err(e);
            }
        }

        // adapter subscriptions opened during wiring may already have
        // enqueued their first payloads
        self.pump();
        Ok(())
    }

    /// Closes a resource instance, dropping its sub-graph where no other
    /// instance holds it. In-flight diffs for the instance are discarded.
    pub fn close_resource_instance(&mut self, instance_id: &str) -> Result<()> {
        let instance = self
            .instances
            .close(instance_id)
            .ok_or_else(|| Error::unknown_instance(instance_id))?;
        for &node in instance.pinned() {
            let _ = self.df.unpin(node);
        }
        self.cleanup_released();
        Ok(())
    }

    // ---- reads ----

    /// The current full contents of an instance's output, as an initial
    /// diff under its high watermark.
    pub fn get_all(&mut self, instance_id: &str) -> Result<Diff> {
        let (output, watermark) = self.instance_output(instance_id)?;
        let entries = self.materialize_all(output)?;
        Ok(Diff::initial(entries, watermark))
    }

    /// The concatenation of every diff issued after `since`, plus the new
    /// high watermark.
    pub fn get_all_since(&self, instance_id: &str, since: Watermark) -> Result<Diff> {
        let instance = self
            .instances
            .get(instance_id)
            .ok_or_else(|| Error::unknown_instance(instance_id))?;
        Ok(instance.get_all_since(since))
    }

    /// Point lookup against an instance's output. Lazy outputs compute on
    /// demand; a pending external reads as empty.
    pub fn get_array(&mut self, instance_id: &str, key: &Value) -> Result<(Vec<Value>, Watermark)> {
        let (output, watermark) = self.instance_output(instance_id)?;
        let key_ref = self.heap.intern(key);
        let result = self.df.read_array(&mut self.heap, output, key_ref);
        self.heap.decref(key_ref);
        let values = result?;
        let materialized = values.iter().map(|&v| self.heap.materialize(v)).collect();
        Ok((materialized, watermark))
    }

    /// Subscribes to an instance's diff stream. The callback immediately
    /// receives the current contents as an initial diff, then every
    /// subsequent change with a strictly increasing watermark.
    pub fn subscribe<F>(&mut self, instance_id: &str, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&Diff) + 'static,
    {
        let (output, watermark) = self.instance_output(instance_id)?;
        let snapshot = self.materialize_all(output)?;
        callback(&Diff::initial(snapshot, watermark));
        let instance = self
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| Error::unknown_instance(instance_id))?;
        Ok(instance.subscribe(callback))
    }

    /// Removes a subscription.
    pub fn unsubscribe(&mut self, instance_id: &str, subscription: SubscriptionId) -> Result<bool> {
        let instance = self
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| Error::unknown_instance(instance_id))?;
        Ok(instance.unsubscribe(subscription))
    }

    // ---- lifecycle ----

    /// Drains the event queue, running each event (and its propagation) to
    /// completion. Control-API calls pump implicitly; embedders call this
    /// after adapter callbacks arrive from their workers.
    pub fn pump(&mut self) {
        while let Some(event) = self.queue.pop() {
            match event {
                Event::ClientUpdate {
                    collection,
                    entries,
                } => {
                    let interned = self.intern_entries(&entries);
                    let outcome = self.df.apply_input(&mut self.heap, collection, &interned);
                    self.release_entries(interned);
                    if let Ok(propagated) = outcome {
                        self.dispatch(propagated);
                    }
                }
                Event::ExternalUpdate {
                    node,
                    entries,
                    is_initial,
                } => {
                    if !self.externals.is_live(node) {
                        continue;
                    }
                    let interned = self.intern_entries(&entries);
                    let outcome =
                        self.df
                            .external_update(&mut self.heap, node, &interned, is_initial);
                    self.release_entries(interned);
                    if let Ok(propagated) = outcome {
                        self.dispatch(propagated);
                    }
                }
                Event::ExternalLoading { node } => {
                    if self.externals.is_live(node) {
                        let _ = self.df.external_loading(node);
                    }
                }
                Event::ExternalError { node, message } => {
                    if !self.externals.is_live(node) {
                        continue;
                    }
                    if let Ok(propagated) =
                        self.df.external_error(&mut self.heap, node, &message)
                    {
                        self.dispatch(propagated);
                    }
                }
            }
        }
    }

    /// Shuts the engine down: closes every instance, shuts adapters down
    /// and releases every collection and interned value.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pump();

        for id in self.instances.ids() {
            let _ = self.close_resource_instance(&id);
        }
        for adapter in self.adapters.values() {
            adapter.shutdown();
        }
        let inputs: Vec<ColId> = self.inputs.drain().map(|(_, id)| id).collect();
        for id in inputs {
            let _ = self.df.unpin(id);
        }
        self.cleanup_released();
    }

    // ---- internals ----

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::contract("engine is closed"));
        }
        Ok(())
    }

    fn instance_output(&self, instance_id: &str) -> Result<(ColId, Watermark)> {
        let instance = self
            .instances
            .get(instance_id)
            .ok_or_else(|| Error::unknown_instance(instance_id))?;
        Ok((instance.output(), instance.watermark()))
    }

    fn materialize_all(&mut self, output: ColId) -> Result<Vec<(Value, Vec<Value>)>> {
        let entries = self.df.read_all(output)?;
        Ok(entries
            .into_iter()
            .map(|(key, values)| {
                (
                    self.heap.materialize(key),
                    values.iter().map(|&v| self.heap.materialize(v)).collect(),
                )
            })
            .collect())
    }

    fn intern_entries(&mut self, entries: &[(Value, Vec<Value>)]) -> Vec<(ValueRef, Vec<ValueRef>)> {
        entries
            .iter()
            .map(|(key, values)| {
                let key_ref = self.heap.intern(key);
                let value_refs = values.iter().map(|v| self.heap.intern(v)).collect();
                (key_ref, value_refs)
            })
            .collect()
    }

    fn release_entries(&mut self, entries: Vec<(ValueRef, Vec<ValueRef>)>) {
        for (key, values) in entries {
            self.heap.decref(key);
            for v in values {
                self.heap.decref(v);
            }
        }
    }

    /// Delivers changed entries to the instances watching each node, then
    /// settles the propagation result's references.
    fn dispatch(&mut self, propagated: Propagated) {
        for change in &propagated.changes {
            let ids = self.instances.watching(change.node).to_vec();
            if ids.is_empty() {
                continue;
            }
            let entries: Vec<(Value, Vec<Value>)> = change
                .entries
                .iter()
                .map(|(key, values)| {
                    (
                        self.heap.materialize(*key),
                        values.iter().map(|&v| self.heap.materialize(v)).collect(),
                    )
                })
                .collect();
            for id in ids {
                if let Some(instance) = self.instances.get_mut(&id) {
                    instance.push_diff(entries.clone(), false);
                }
            }
        }
        propagated.release(&mut self.heap);
    }

    /// Releases unpinned, reader-less nodes and unsubscribes any external
    /// bindings that died with them.
    fn cleanup_released(&mut self) {
        for node in self.df.sweep(&mut self.heap) {
            if let Some(binding) = self.externals.unbind(node) {
                if let Some(adapter) = self.adapters.get(&binding.service) {
                    adapter.unsubscribe(&binding.identifier);
                }
            }
        }
    }
}
