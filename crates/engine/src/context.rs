//! Resource templates and the wiring context handed to them.

use alloc::format;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::HashMap;
use skein_core::{Error, Result, Value};
use skein_graph::{Dataflow, LazyCompute, Mapper, Reducer};
use skein_heap::Heap;
use skein_reactive::{Adapter, EventQueue, ExternalRegistry, SubscriptionHandle};
use skein_store::ColId;

/// A parameterizable template that, when instantiated, wires a sub-graph
/// and returns its output collection.
pub trait Resource {
    fn instantiate(&self, ctx: &mut ResourceContext<'_>) -> Result<ColId>;
}

/// The wiring surface a resource template builds with.
///
/// Every collection created here is pinned to the instance being built and
/// released when the instance closes. External subscriptions opened through
/// `use_external_resource` are shared between instances binding the same
/// (service, identifier, params) triple.
///
/// Subscribing is legal only here: lazy compute functions and mappers run
/// against an `EvalContext`, whose `use_external_resource` rejects the call
/// with a contract error that surfaces as an error value at the offending
/// key.
pub struct ResourceContext<'a> {
    heap: &'a mut Heap,
    df: &'a mut Dataflow,
    inputs: &'a HashMap<String, ColId>,
    adapters: &'a HashMap<String, Rc<dyn Adapter>>,
    externals: &'a mut ExternalRegistry,
    queue: &'a EventQueue,
    instance_id: &'a str,
    params: &'a Value,
    created: Vec<ColId>,
}

impl<'a> ResourceContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        heap: &'a mut Heap,
        df: &'a mut Dataflow,
        inputs: &'a HashMap<String, ColId>,
        adapters: &'a HashMap<String, Rc<dyn Adapter>>,
        externals: &'a mut ExternalRegistry,
        queue: &'a EventQueue,
        instance_id: &'a str,
        params: &'a Value,
    ) -> Self {
        Self {
            heap,
            df,
            inputs,
            adapters,
            externals,
            queue,
            instance_id,
            params,
            created: Vec::new(),
        }
    }

    pub(crate) fn finish(self) -> Vec<ColId> {
        self.created
    }

    /// The parameters this instance was opened with.
    pub fn params(&self) -> &Value {
        self.params
    }

    /// The id of the instance being built.
    pub fn instance_id(&self) -> &str {
        self.instance_id
    }

    /// Resolves a named input collection.
    pub fn input(&self, name: &str) -> Result<ColId> {
        self.inputs
            .get(name)
            .copied()
            .ok_or_else(|| Error::contract(format!("unknown input collection: {}", name)))
    }

    fn track(&mut self, id: ColId) -> ColId {
        self.created.push(id);
        id
    }

    /// Wires a map collection over `input`.
    pub fn map(&mut self, input: ColId, mapper: impl Mapper + 'static) -> Result<ColId> {
        let id = self.df.add_map(self.heap, input, mapper)?;
        self.df.prime_node(self.heap, id)?;
        Ok(self.track(id))
    }

    /// Wires a map-reduce collection over `input`.
    pub fn map_reduce(
        &mut self,
        input: ColId,
        mapper: impl Mapper + 'static,
        reducer: impl Reducer + 'static,
    ) -> Result<ColId> {
        let id = self.df.add_map_reduce(self.heap, input, mapper, reducer)?;
        self.df.prime_node(self.heap, id)?;
        Ok(self.track(id))
    }

    /// Wires a merge of two or more collections.
    pub fn merge(&mut self, inputs: &[ColId]) -> Result<ColId> {
        let id = self.df.add_merge(self.heap, inputs)?;
        self.df.prime_node(self.heap, id)?;
        Ok(self.track(id))
    }

    /// Wires a slice keeping keys inside any of the inclusive ranges.
    pub fn slice(&mut self, input: ColId, ranges: &[(Value, Value)]) -> Result<ColId> {
        let bounds: Vec<_> = ranges
            .iter()
            .map(|(lo, hi)| (self.heap.intern(lo), self.heap.intern(hi)))
            .collect();
        let result = self.df.add_slice(self.heap, input, &bounds);
        for (lo, hi) in bounds {
            self.heap.decref(lo);
            self.heap.decref(hi);
        }
        let id = result?;
        self.df.prime_node(self.heap, id)?;
        Ok(self.track(id))
    }

    /// Wires a take keeping the lowest `limit` keys.
    pub fn take(&mut self, input: ColId, limit: usize) -> Result<ColId> {
        let id = self.df.add_take(self.heap, input, limit)?;
        self.df.prime_node(self.heap, id)?;
        Ok(self.track(id))
    }

    /// Wires a whole-collection reduction.
    pub fn reduce(&mut self, input: ColId, reducer: impl Reducer + 'static) -> Result<ColId> {
        let id = self.df.add_reduce(self.heap, input, reducer)?;
        self.df.prime_node(self.heap, id)?;
        Ok(self.track(id))
    }

    /// Creates a lazy collection computed per key on demand.
    pub fn create_lazy_collection(&mut self, compute: impl LazyCompute + 'static) -> ColId {
        let id = self.df.add_lazy(self.heap, compute);
        self.track(id)
    }

    /// Binds (or reuses) an external collection fed by the named service's
    /// adapter.
    pub fn use_external_resource(
        &mut self,
        service: &str,
        identifier: &str,
        params: &Value,
    ) -> Result<ColId> {
        let adapter = self
            .adapters
            .get(service)
            .cloned()
            .ok_or_else(|| Error::unknown_service(service))?;

        if let Some(node) = self.externals.find(service, identifier, params) {
            return Ok(self.track(node));
        }

        let node = self.df.add_external(self.heap, service, identifier);
        let alive = self.externals.bind(node, service, identifier, params.clone());
        adapter.subscribe(
            self.instance_id,
            identifier,
            params,
            SubscriptionHandle::new(self.queue.clone(), node, alive),
        );
        Ok(self.track(node))
    }
}
