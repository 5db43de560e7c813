//! Operator evaluation context and the lazy pull path.

use crate::graph::{Dataflow, NodeId};
use crate::node::{ExternalStatus, NodeKind, NodeState};
use crate::trace::Consult;
use alloc::format;
use alloc::vec::Vec;
use skein_core::{Error, Result, Value};
use skein_heap::{Heap, ValueRef};
use skein_store::CollectionStore;

/// The window through which operator code touches the engine.
///
/// Every read is recorded as a consult; when the operator finishes, the
/// consults become the trace entry for the key being computed, which is
/// what scopes future invalidation to exactly the keys that need rerunning.
pub struct EvalContext<'a> {
    df: &'a mut Dataflow,
    heap: &'a mut Heap,
    reader: NodeId,
    consults: Vec<Consult>,
}

impl<'a> EvalContext<'a> {
    pub(crate) fn new(df: &'a mut Dataflow, heap: &'a mut Heap, reader: NodeId) -> Self {
        Self {
            df,
            heap,
            reader,
            consults: Vec::new(),
        }
    }

    pub(crate) fn finish(self) -> Vec<Consult> {
        self.consults
    }

    /// The node this context evaluates for.
    pub fn reader(&self) -> NodeId {
        self.reader
    }

    /// The heap, for interning result values.
    pub fn heap(&mut self) -> &mut Heap {
        self.heap
    }

    /// Bumps a borrowed handle so it can be returned as an operator result.
    pub fn keep(&mut self, h: ValueRef) -> ValueRef {
        self.heap.incref(h);
        h
    }

    /// Reads the multiset of (collection, key). Lazy collections are pulled
    /// and memoized; a pending external defers the current computation; a
    /// failed external surfaces the adapter error.
    pub fn get_array(&mut self, col: NodeId, key: ValueRef) -> Result<Vec<ValueRef>> {
        self.consults.push(Consult::Key { src: col, key });
        let node = self.df.node(col)?;
        let values = if node.is_lazy() {
            self.df.lazy_get(self.heap, col, key)?
        } else {
            match node.external_status() {
                Some(ExternalStatus::Pending) => {
                    self.df.last_pending = Some(col);
                    return Err(Error::Pending);
                }
                Some(ExternalStatus::Failed(message)) => {
                    let message = message.clone();
                    return Err(Error::adapter(message, false));
                }
                _ => self.df.store.get_array(self.heap, col, key).to_vec(),
            }
        };
        // an error value among the inputs fails the consuming operator, so
        // the error propagates to its output keys
        if let Some(&err) = values.iter().find(|&&v| self.heap.is_error(v)) {
            let message = self.heap.error_message(err).unwrap_or("upstream error");
            return Err(Error::user(message));
        }
        Ok(values)
    }

    /// Reads the single value at (collection, key); a typed error if the
    /// multiset does not hold exactly one value.
    pub fn get_unique(&mut self, col: NodeId, key: ValueRef) -> Result<ValueRef> {
        let values = self.get_array(col, key)?;
        match values.as_slice() {
            [single] => Ok(*single),
            other => Err(Error::NotUnique { count: other.len() }),
        }
    }

    /// Always a contract error: external subscriptions may only be opened
    /// while a resource template instantiates, never from operator or lazy
    /// compute code. The error surfaces as an error value at the key being
    /// computed and the engine continues.
    pub fn use_external_resource(
        &mut self,
        service: &str,
        identifier: &str,
        _params: &Value,
    ) -> Result<NodeId> {
        Err(Error::contract(format!(
            "collection {} called use_external_resource({}/{}) during evaluation",
            self.reader, service, identifier
        )))
    }

    /// The number of keys in a collection. Recorded as a whole-collection
    /// consult: any change to the source reruns this key.
    pub fn size(&mut self, col: NodeId) -> Result<usize> {
        self.consults.push(Consult::Broad { src: col });
        let node = self.df.node(col)?;
        if matches!(node.external_status(), Some(ExternalStatus::Pending)) {
            self.df.last_pending = Some(col);
            return Err(Error::Pending);
        }
        Ok(self.df.store.size(col))
    }
}

impl Dataflow {
    /// Pulls a lazy collection at one key, memoizing the result.
    ///
    /// Revisiting a key already on the evaluation stack is a `CycleError`.
    /// Returned handles stay alive through the memo cache; the caller does
    /// not own references to them.
    pub fn lazy_get(
        &mut self,
        heap: &mut Heap,
        lazy: NodeId,
        key: ValueRef,
    ) -> Result<Vec<ValueRef>> {
        {
            let node = self.node(lazy)?;
            if !node.is_lazy() {
                return Err(Error::contract(format!("collection {} is not lazy", lazy)));
            }
            if let NodeState::LazyCache { cached } = &node.state {
                if cached.contains(&key) {
                    return Ok(self.store.get_array(heap, lazy, key).to_vec());
                }
            }
        }

        if self.lazy_stack.contains(&(lazy, key)) {
            return Err(Error::cycle(format!(
                "lazy collection {} depends on itself at key {}",
                lazy,
                skein_core::render(&heap.materialize(key))
            )));
        }

        let compute = match &self.node(lazy)?.kind {
            NodeKind::Lazy { compute } => compute.clone(),
            _ => unreachable!(),
        };

        self.lazy_stack.push((lazy, key));
        let mut ctx = EvalContext::new(self, heap, lazy);
        let result = compute.compute(&mut ctx, key);
        let consults = ctx.finish();
        self.lazy_stack.pop();

        let values = match result {
            Ok(values) => values,
            Err(e) if e.is_pending() => return Err(e),
            Err(e) => {
                // memoize the failure as an error value so repeated pulls do
                // not rerun it; the installed trace clears it when an input
                // it read changes
                let _ = self.install_trace(heap, lazy, key, consults);
                let err = heap.intern_error(&alloc::string::ToString::to_string(&e));
                let displaced = self.store.apply(heap, lazy, &[(key, alloc::vec![err])]);
                CollectionStore::release_displaced(heap, displaced);
                heap.decref(err);
                self.mark_cached(heap, lazy, key);
                return Ok(alloc::vec![err]);
            }
        };

        if let Err(e) = self.install_trace(heap, lazy, key, consults) {
            for &v in &values {
                heap.decref(v);
            }
            return Err(e);
        }
        if !values.is_empty() {
            let displaced = self.store.apply(heap, lazy, &[(key, values.clone())]);
            CollectionStore::release_displaced(heap, displaced);
            // the store holds the result now; drop the operator's references
            for &v in &values {
                heap.decref(v);
            }
        }
        self.mark_cached(heap, lazy, key);
        Ok(values)
    }

    fn mark_cached(&mut self, heap: &mut Heap, lazy: NodeId, key: ValueRef) {
        if let Ok(node) = self.node_mut(lazy) {
            if let NodeState::LazyCache { cached } = &mut node.state {
                if cached.insert(key) {
                    heap.incref(key);
                }
            }
        }
    }

    /// Installs the consult trace for (reader, own_key), wiring dynamic
    /// edges for any source not yet connected. Eager cycles are rejected.
    pub(crate) fn install_trace(
        &mut self,
        heap: &mut Heap,
        reader: NodeId,
        own_key: ValueRef,
        consults: Vec<Consult>,
    ) -> Result<()> {
        for consult in &consults {
            self.connect_dynamic(consult.src(), reader)?;
        }
        self.node_mut(reader)?.trace.install(heap, own_key, consults);
        Ok(())
    }
}
