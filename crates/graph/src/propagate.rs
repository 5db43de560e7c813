//! The incremental propagator.
//!
//! Each engine event that touches an input or external collection runs one
//! propagation cycle: the changed (node, key) pairs are expanded along
//! primary edges and consult traces, each affected node reruns its operator
//! for exactly the dirtied keys in topological order, and the cycle ends
//! with a `Propagated` record of every changed entry for the reactive layer.
//!
//! Reference hygiene: during the cycle nothing is released directly. Every
//! displaced handle lands in a graveyard that is settled after the result
//! snapshot has taken its own references, so a value removed early in the
//! cycle is still readable by operators that run later in it.

use crate::graph::{Dataflow, NodeId};
use crate::node::{ExternalStatus, Mapper, NodeKind, NodeState, Reducer};
use alloc::format;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use hashbrown::HashMap;
use skein_core::{Error, Result};
use skein_heap::{Heap, ValueRef};

/// The changed entries of one node, in key order. An empty value list is a
/// key deletion.
pub struct NodeChanges {
    pub node: NodeId,
    pub entries: Vec<(ValueRef, Vec<ValueRef>)>,
}

/// The outcome of one propagation cycle, in topological node order.
///
/// Owns one reference per key and value handle; call `release` once the
/// entries have been consumed.
pub struct Propagated {
    pub changes: Vec<NodeChanges>,
}

impl Propagated {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns the changed entries of one node, if any.
    pub fn entries_for(&self, node: NodeId) -> Option<&[(ValueRef, Vec<ValueRef>)]> {
        self.changes
            .iter()
            .find(|c| c.node == node)
            .map(|c| c.entries.as_slice())
    }

    /// Releases the references held by this result.
    pub fn release(self, heap: &mut Heap) {
        for change in self.changes {
            for (key, values) in change.entries {
                heap.decref(key);
                for v in values {
                    heap.decref(v);
                }
            }
        }
    }
}

/// Old and new multiset of one key during a cycle. The handles stay alive
/// through the store and the graveyard; no references are owned here.
struct BagChange {
    old: Vec<ValueRef>,
    new: Vec<ValueRef>,
}

type ChangeMap = HashMap<NodeId, HashMap<ValueRef, BagChange>>;

/// Outcome of rerunning a mapper for one input key.
enum KeyRun {
    /// The new output pairs, one owned reference per handle.
    Pairs(Vec<(ValueRef, ValueRef)>),
    /// A pending external was consulted; the key is parked.
    Deferred,
}

/// What to do for a node, extracted under a short borrow.
enum Plan {
    Seeded,
    Map {
        input: NodeId,
        mapper: Rc<dyn Mapper>,
        reducer: Option<Rc<dyn Reducer>>,
    },
    Merge(Vec<NodeId>),
    Slice {
        input: NodeId,
        ranges: Vec<(ValueRef, ValueRef)>,
    },
    Take {
        input: NodeId,
        limit: usize,
    },
    Reduce {
        input: NodeId,
        reducer: Rc<dyn Reducer>,
    },
    Lazy,
}

impl Dataflow {
    // ---- entry points ----

    /// Applies a client diff to an input collection and propagates to
    /// quiescence.
    pub fn apply_input(
        &mut self,
        heap: &mut Heap,
        input: NodeId,
        entries: &[(ValueRef, Vec<ValueRef>)],
    ) -> Result<Propagated> {
        if !matches!(self.node(input)?.kind, NodeKind::Input) {
            return Err(Error::contract(format!(
                "collection {} is not writable",
                input
            )));
        }
        let mut changes = ChangeMap::new();
        let mut graveyard = Vec::new();
        self.seed_apply(heap, input, entries, &mut changes, &mut graveyard);
        Ok(self.run(heap, changes, HashMap::new(), graveyard))
    }

    /// Applies an adapter update to an external collection.
    ///
    /// `is_initial` replaces the whole contents (idempotent); otherwise the
    /// entries are a delta. Either form ends the pending state and releases
    /// recomputations parked on this collection.
    pub fn external_update(
        &mut self,
        heap: &mut Heap,
        external: NodeId,
        entries: &[(ValueRef, Vec<ValueRef>)],
        is_initial: bool,
    ) -> Result<Propagated> {
        let was_failed = matches!(
            self.node(external)?.external_status(),
            Some(ExternalStatus::Failed(_))
        );
        self.set_external_status(external, ExternalStatus::Ready)?;

        let mut changes = ChangeMap::new();
        let mut graveyard = Vec::new();

        if is_initial {
            let mut full: Vec<(ValueRef, Vec<ValueRef>)> = entries.to_vec();
            for (key, _) in self.store.get_all(external) {
                if !entries.iter().any(|(k, _)| *k == key) {
                    full.push((key, Vec::new()));
                }
            }
            self.seed_apply(heap, external, &full, &mut changes, &mut graveyard);
        } else {
            self.seed_apply(heap, external, entries, &mut changes, &mut graveyard);
        }

        let mut extra = self.drain_deferred(external, &mut graveyard);
        if was_failed {
            // recovery must also rerun readers whose consults hit keys the
            // collection does not carry, since those reads now succeed
            self.collect_consult_readers(external, &mut extra);
        }
        Ok(self.run(heap, changes, extra, graveyard))
    }

    /// Marks an external collection as loading. Reads return empty but
    /// nothing is propagated; dependent recomputation defers until the next
    /// update.
    pub fn external_loading(&mut self, external: NodeId) -> Result<()> {
        self.set_external_status(external, ExternalStatus::Pending)
    }

    /// Marks an external collection as failed: every present key becomes an
    /// error value and every recorded reader reruns to observe the failure.
    pub fn external_error(
        &mut self,
        heap: &mut Heap,
        external: NodeId,
        message: &str,
    ) -> Result<Propagated> {
        self.set_external_status(external, ExternalStatus::Failed(String::from(message)))?;

        let err = heap.intern_error(message);
        let rewritten: Vec<(ValueRef, Vec<ValueRef>)> = self
            .store
            .get_all(external)
            .into_iter()
            .map(|(key, _)| (key, alloc::vec![err]))
            .collect();

        let mut changes = ChangeMap::new();
        let mut graveyard = Vec::new();
        self.seed_apply(heap, external, &rewritten, &mut changes, &mut graveyard);
        graveyard.push(err);

        // readers that consulted keys the collection never held must also
        // observe the failure
        let mut extra = self.drain_deferred(external, &mut graveyard);
        self.collect_consult_readers(external, &mut extra);
        Ok(self.run(heap, changes, extra, graveyard))
    }

    /// Schedules every (reader, key) with a recorded consult on `src`.
    fn collect_consult_readers(
        &self,
        src: NodeId,
        extra: &mut HashMap<NodeId, Vec<ValueRef>>,
    ) {
        let readers = match self.nodes.get(&src) {
            Some(node) => node.downstream.clone(),
            None => return,
        };
        for reader in readers {
            if let Some(node) = self.nodes.get(&reader) {
                let slot = extra.entry(reader).or_default();
                for k in node.trace.all_readers_of(src) {
                    if !slot.contains(&k) {
                        slot.push(k);
                    }
                }
            }
        }
    }

    /// Computes the initial contents of a freshly wired node from its
    /// inputs' current state. No downstream exists yet, so nothing
    /// propagates further.
    pub fn prime_node(&mut self, heap: &mut Heap, id: NodeId) -> Result<()> {
        let plan_inputs: Vec<NodeId> = self.node(id)?.kind.primary_inputs();
        let mut dirty: Vec<ValueRef> = Vec::new();
        for input in plan_inputs {
            for (key, _) in self.store.get_all(input) {
                if !dirty.contains(&key) {
                    dirty.push(key);
                }
            }
        }

        let mut changes = ChangeMap::new();
        let mut graveyard = Vec::new();

        if let NodeKind::Reduce { .. } = self.node(id)?.kind {
            // a reduction always materializes its sentinel key
            if let NodeState::Total { out_key, acc } = self.node(id)?.state {
                self.write_bag(
                    heap,
                    id,
                    out_key,
                    alloc::vec![acc],
                    &mut changes,
                    &mut graveyard,
                );
            }
        }

        if !dirty.is_empty() {
            self.process_node(heap, id, dirty, &mut changes, &mut graveyard);
        }
        for h in graveyard {
            heap.decref(h);
        }
        Ok(())
    }

    fn set_external_status(&mut self, external: NodeId, status: ExternalStatus) -> Result<()> {
        let node = self.node_mut(external)?;
        match &mut node.state {
            NodeState::External { status: slot } => {
                *slot = status;
                Ok(())
            }
            _ => Err(Error::contract(format!(
                "collection {} is not external",
                external
            ))),
        }
    }

    fn drain_deferred(
        &mut self,
        external: NodeId,
        graveyard: &mut Vec<ValueRef>,
    ) -> HashMap<NodeId, Vec<ValueRef>> {
        let mut extra: HashMap<NodeId, Vec<ValueRef>> = HashMap::new();
        for (reader, key) in self.deferred.remove(&external).unwrap_or_default() {
            let slot = extra.entry(reader).or_default();
            if !slot.contains(&key) {
                slot.push(key);
            }
            // the parked reference keeps the key alive through this cycle
            graveyard.push(key);
        }
        extra
    }

    // ---- the cycle ----

    fn seed_apply(
        &mut self,
        heap: &mut Heap,
        node: NodeId,
        entries: &[(ValueRef, Vec<ValueRef>)],
        changes: &mut ChangeMap,
        graveyard: &mut Vec<ValueRef>,
    ) {
        for (key, values) in entries {
            let old = self.store.get_array(heap, node, *key).to_vec();
            if multiset_eq(&old, values) {
                continue;
            }
            let displaced = self
                .store
                .apply(heap, node, core::slice::from_ref(&(*key, values.clone())));
            bury_displaced(displaced, graveyard);
            record_change(changes, node, *key, old, values.clone());
        }
    }

    fn run(
        &mut self,
        heap: &mut Heap,
        mut changes: ChangeMap,
        extra: HashMap<NodeId, Vec<ValueRef>>,
        mut graveyard: Vec<ValueRef>,
    ) -> Propagated {
        let topo = self.topo_order();
        let mut schedule: HashMap<NodeId, Vec<ValueRef>> = extra;

        let seeds: Vec<NodeId> = changes.keys().copied().collect();
        for src in seeds {
            let keys: Vec<ValueRef> = changes[&src].keys().copied().collect();
            self.expand(src, &keys, &mut schedule);
        }

        for v in topo.iter().copied() {
            let dirty = match schedule.remove(&v) {
                Some(d) if !d.is_empty() => d,
                _ => continue,
            };
            self.process_node(heap, v, dirty, &mut changes, &mut graveyard);
            if let Some(ch) = changes.get(&v) {
                let keys: Vec<ValueRef> = ch.keys().copied().collect();
                self.expand(v, &keys, &mut schedule);
            }
        }

        let result = self.build_result(heap, changes, &topo);
        for h in graveyard {
            heap.decref(h);
        }
        result
    }

    fn expand(
        &self,
        src: NodeId,
        keys: &[ValueRef],
        schedule: &mut HashMap<NodeId, Vec<ValueRef>>,
    ) {
        let downstream = match self.nodes.get(&src) {
            Some(node) => node.downstream.clone(),
            None => return,
        };
        for reader in downstream {
            if reader == src {
                continue;
            }
            let rnode = match self.nodes.get(&reader) {
                Some(n) => n,
                None => continue,
            };
            let is_primary = rnode.kind.primary_inputs().contains(&src);
            let slot = schedule.entry(reader).or_default();
            for &key in keys {
                if is_primary && !slot.contains(&key) {
                    slot.push(key);
                }
                for own in rnode.trace.invalidated_by(src, key) {
                    if !slot.contains(&own) {
                        slot.push(own);
                    }
                }
            }
        }
    }

    fn process_node(
        &mut self,
        heap: &mut Heap,
        v: NodeId,
        dirty: Vec<ValueRef>,
        changes: &mut ChangeMap,
        graveyard: &mut Vec<ValueRef>,
    ) {
        let plan = match self.nodes.get(&v) {
            Some(node) => match &node.kind {
                NodeKind::Input | NodeKind::External { .. } => Plan::Seeded,
                NodeKind::Map { input, mapper } => Plan::Map {
                    input: *input,
                    mapper: mapper.clone(),
                    reducer: None,
                },
                NodeKind::MapReduce {
                    input,
                    mapper,
                    reducer,
                } => Plan::Map {
                    input: *input,
                    mapper: mapper.clone(),
                    reducer: Some(reducer.clone()),
                },
                NodeKind::Merge { inputs } => Plan::Merge(inputs.clone()),
                NodeKind::Slice { input, ranges } => Plan::Slice {
                    input: *input,
                    ranges: ranges.clone(),
                },
                NodeKind::Take { input, limit } => Plan::Take {
                    input: *input,
                    limit: *limit,
                },
                NodeKind::Reduce { input, reducer } => Plan::Reduce {
                    input: *input,
                    reducer: reducer.clone(),
                },
                NodeKind::Lazy { .. } => Plan::Lazy,
            },
            None => return,
        };

        match plan {
            Plan::Seeded => {}
            Plan::Map {
                input,
                mapper,
                reducer,
            } => self.process_map(heap, v, input, &mapper, reducer.as_ref(), dirty, changes, graveyard),
            Plan::Merge(inputs) => self.process_merge(heap, v, &inputs, dirty, changes, graveyard),
            Plan::Slice { input, ranges } => {
                self.process_slice(heap, v, input, &ranges, dirty, changes, graveyard)
            }
            Plan::Take { input, limit } => {
                self.process_take(heap, v, input, limit, changes, graveyard)
            }
            Plan::Reduce { input, reducer } => {
                self.process_reduce(heap, v, input, &reducer, dirty, changes, graveyard)
            }
            Plan::Lazy => self.process_lazy(heap, v, dirty, changes, graveyard),
        }
    }

    // ---- operators ----

    #[allow(clippy::too_many_arguments)]
    fn process_map(
        &mut self,
        heap: &mut Heap,
        v: NodeId,
        input: NodeId,
        mapper: &Rc<dyn Mapper>,
        reducer: Option<&Rc<dyn Reducer>>,
        dirty: Vec<ValueRef>,
        changes: &mut ChangeMap,
        graveyard: &mut Vec<ValueRef>,
    ) {
        for k1 in dirty {
            let input_bag = self.store.get_array(heap, input, k1).to_vec();
            let run = self.rerun_mapper(heap, v, mapper, k1, &input_bag);
            let new_pairs = match run {
                KeyRun::Deferred => continue,
                KeyRun::Pairs(pairs) => pairs,
            };

            // swap the key's prior contribution for the new one
            let old_pairs = {
                let node = match self.nodes.get_mut(&v) {
                    Some(n) => n,
                    None => return,
                };
                let emitted = match &mut node.state {
                    NodeState::Mapped { emitted } => emitted,
                    NodeState::Reduced { emitted, .. } => emitted,
                    _ => return,
                };
                let had = emitted.contains_key(&k1);
                let old = emitted.remove(&k1).unwrap_or_default();
                if !new_pairs.is_empty() {
                    if !had {
                        heap.incref(k1);
                    }
                    emitted.insert(k1, new_pairs.clone());
                } else if had {
                    graveyard.push(k1);
                }
                old
            };

            match reducer {
                Some(reducer) => {
                    self.reduce_stage(heap, v, reducer, &old_pairs, &new_pairs, changes, graveyard)
                }
                None => {
                    self.map_output_stage(heap, v, &old_pairs, &new_pairs, changes, graveyard)
                }
            }

            for (k2, v2) in old_pairs {
                graveyard.push(k2);
                graveyard.push(v2);
            }
        }
    }

    /// Reruns a mapper for one input key. Error inputs short-circuit to an
    /// error pair at the same key; a pending consult parks the key.
    fn rerun_mapper(
        &mut self,
        heap: &mut Heap,
        v: NodeId,
        mapper: &Rc<dyn Mapper>,
        k1: ValueRef,
        input_bag: &[ValueRef],
    ) -> KeyRun {
        if input_bag.is_empty() {
            if let Ok(node) = self.node_mut(v) {
                node.trace.clear_key(heap, k1);
            }
            return KeyRun::Pairs(Vec::new());
        }
        if let Some(&err) = input_bag.iter().find(|&&x| heap.is_error(x)) {
            if let Ok(node) = self.node_mut(v) {
                node.trace.clear_key(heap, k1);
            }
            heap.incref(k1);
            heap.incref(err);
            return KeyRun::Pairs(alloc::vec![(k1, err)]);
        }

        self.last_pending = None;
        let mapper = mapper.clone();
        let mut ctx = crate::eval::EvalContext::new(self, heap, v);
        let result = mapper.map_entry(&mut ctx, k1, input_bag);
        let consults = ctx.finish();

        match result {
            Ok(pairs) => match self.install_trace(heap, v, k1, consults) {
                Ok(()) => KeyRun::Pairs(pairs),
                Err(e) => {
                    for (k2, v2) in pairs {
                        heap.decref(k2);
                        heap.decref(v2);
                    }
                    let err = heap.intern_error(&e.to_string());
                    heap.incref(k1);
                    KeyRun::Pairs(alloc::vec![(k1, err)])
                }
            },
            Err(e) if e.is_pending() => {
                let src = self.last_pending.take().unwrap_or(v);
                heap.incref(k1);
                self.deferred.entry(src).or_default().push((v, k1));
                KeyRun::Deferred
            }
            Err(e) => {
                // keep the consults: a change to what the operator read
                // before failing must rerun this key
                let _ = self.install_trace(heap, v, k1, consults);
                let err = heap.intern_error(&e.to_string());
                heap.incref(k1);
                KeyRun::Pairs(alloc::vec![(k1, err)])
            }
        }
    }

    /// Applies a mapper contribution swap to the output bags of a Map node.
    fn map_output_stage(
        &mut self,
        heap: &mut Heap,
        v: NodeId,
        removals: &[(ValueRef, ValueRef)],
        additions: &[(ValueRef, ValueRef)],
        changes: &mut ChangeMap,
        graveyard: &mut Vec<ValueRef>,
    ) {
        let touched = touched_keys(removals, additions);
        for k2 in touched {
            let mut bag = self.store.get_array(heap, v, k2).to_vec();
            for &(rk, rv) in removals {
                if rk == k2 {
                    if let Some(pos) = bag.iter().position(|&x| x == rv) {
                        bag.remove(pos);
                    }
                }
            }
            for &(ak, av) in additions {
                if ak == k2 {
                    bag.push(av);
                }
            }
            self.write_bag(heap, v, k2, bag, changes, graveyard);
        }
    }

    /// Applies a mapper contribution swap to the groups and accumulators of
    /// a MapReduce node.
    #[allow(clippy::too_many_arguments)]
    fn reduce_stage(
        &mut self,
        heap: &mut Heap,
        v: NodeId,
        reducer: &Rc<dyn Reducer>,
        removals: &[(ValueRef, ValueRef)],
        additions: &[(ValueRef, ValueRef)],
        changes: &mut ChangeMap,
        graveyard: &mut Vec<ValueRef>,
    ) {
        let mut state = match self.nodes.get_mut(&v) {
            Some(node) => core::mem::replace(&mut node.state, NodeState::None),
            None => return,
        };
        let (groups, accs) = match &mut state {
            NodeState::Reduced { groups, accs, .. } => (groups, accs),
            _ => return,
        };

        for k2 in touched_keys(removals, additions) {
            let removed: Vec<ValueRef> = removals
                .iter()
                .filter(|(rk, _)| *rk == k2)
                .map(|(_, rv)| *rv)
                .collect();
            let added: Vec<ValueRef> = additions
                .iter()
                .filter(|(ak, _)| *ak == k2)
                .map(|(_, av)| *av)
                .collect();

            let group_is_new = !groups.contains_key(&k2);
            if group_is_new {
                heap.incref(k2);
                groups.insert(k2, Vec::new());
            }
            if let Some(group) = groups.get_mut(&k2) {
                for &rv in &removed {
                    if let Some(pos) = group.iter().position(|&x| x == rv) {
                        group.remove(pos);
                        graveyard.push(rv);
                    }
                }
                for &av in &added {
                    heap.incref(av);
                    group.push(av);
                }
            }

            let group_now = groups.get(&k2).cloned().unwrap_or_default();
            if group_now.is_empty() {
                if groups.remove(&k2).is_some() {
                    graveyard.push(k2);
                }
                if let Some(old_acc) = accs.remove(&k2) {
                    graveyard.push(old_acc);
                    graveyard.push(k2);
                }
                self.write_bag(heap, v, k2, Vec::new(), changes, graveyard);
                continue;
            }

            let current = accs.get(&k2).copied();
            let new_acc = adjust_acc(heap, reducer, current, &removed, &added, &group_now);
            match accs.get_mut(&k2) {
                Some(slot) => {
                    graveyard.push(*slot);
                    *slot = new_acc;
                }
                None => {
                    heap.incref(k2);
                    accs.insert(k2, new_acc);
                }
            }
            self.write_bag(heap, v, k2, alloc::vec![new_acc], changes, graveyard);
        }

        if let Some(node) = self.nodes.get_mut(&v) {
            node.state = state;
        }
    }

    fn process_merge(
        &mut self,
        heap: &mut Heap,
        v: NodeId,
        inputs: &[NodeId],
        dirty: Vec<ValueRef>,
        changes: &mut ChangeMap,
        graveyard: &mut Vec<ValueRef>,
    ) {
        for key in dirty {
            let mut bag = Vec::new();
            for &input in inputs {
                bag.extend_from_slice(self.store.get_array(heap, input, key));
            }
            self.write_bag(heap, v, key, bag, changes, graveyard);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_slice(
        &mut self,
        heap: &mut Heap,
        v: NodeId,
        input: NodeId,
        ranges: &[(ValueRef, ValueRef)],
        dirty: Vec<ValueRef>,
        changes: &mut ChangeMap,
        graveyard: &mut Vec<ValueRef>,
    ) {
        use core::cmp::Ordering;
        for key in dirty {
            let in_range = ranges.iter().any(|&(lo, hi)| {
                heap.cmp(lo, key) != Ordering::Greater && heap.cmp(key, hi) != Ordering::Greater
            });
            let bag = if in_range {
                self.store.get_array(heap, input, key).to_vec()
            } else {
                Vec::new()
            };
            self.write_bag(heap, v, key, bag, changes, graveyard);
        }
    }

    fn process_take(
        &mut self,
        heap: &mut Heap,
        v: NodeId,
        input: NodeId,
        limit: usize,
        changes: &mut ChangeMap,
        graveyard: &mut Vec<ValueRef>,
    ) {
        // any input change can shift the window; rebuild it whole
        let window_keys = self.store.first_keys(input, limit);
        let current: Vec<ValueRef> = self
            .store
            .get_all(v)
            .into_iter()
            .map(|(key, _)| key)
            .collect();

        for key in current {
            if !window_keys.contains(&key) {
                self.write_bag(heap, v, key, Vec::new(), changes, graveyard);
            }
        }
        for key in window_keys {
            let bag = self.store.get_array(heap, input, key).to_vec();
            self.write_bag(heap, v, key, bag, changes, graveyard);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_reduce(
        &mut self,
        heap: &mut Heap,
        v: NodeId,
        input: NodeId,
        reducer: &Rc<dyn Reducer>,
        dirty: Vec<ValueRef>,
        changes: &mut ChangeMap,
        graveyard: &mut Vec<ValueRef>,
    ) {
        let mut removed = Vec::new();
        let mut added = Vec::new();
        for key in dirty {
            match changes.get(&input).and_then(|m| m.get(&key)) {
                Some(change) => {
                    let (r, a) = multiset_diff(&change.old, &change.new);
                    removed.extend(r);
                    added.extend(a);
                }
                // no recorded change: first computation over existing data
                None => added.extend_from_slice(self.store.get_array(heap, input, key)),
            }
        }
        if removed.is_empty() && added.is_empty() {
            return;
        }

        let (out_key, current) = match self.node(v).map(|n| &n.state) {
            Ok(NodeState::Total { out_key, acc }) => (*out_key, *acc),
            _ => return,
        };
        let group: Vec<ValueRef> = self
            .store
            .get_all(input)
            .into_iter()
            .flat_map(|(_, values)| values)
            .collect();

        let new_acc = adjust_acc(heap, reducer, Some(current), &removed, &added, &group);
        if let Some(node) = self.nodes.get_mut(&v) {
            if let NodeState::Total { acc, .. } = &mut node.state {
                graveyard.push(*acc);
                *acc = new_acc;
            }
        }
        self.write_bag(heap, v, out_key, alloc::vec![new_acc], changes, graveyard);
    }

    fn process_lazy(
        &mut self,
        heap: &mut Heap,
        v: NodeId,
        dirty: Vec<ValueRef>,
        changes: &mut ChangeMap,
        graveyard: &mut Vec<ValueRef>,
    ) {
        let pinned = self.nodes.get(&v).map(|n| n.pins > 0).unwrap_or(false);
        for key in dirty {
            let was_cached = {
                let node = match self.nodes.get_mut(&v) {
                    Some(n) => n,
                    None => return,
                };
                node.trace.clear_key(heap, key);
                match &mut node.state {
                    NodeState::LazyCache { cached } => cached.remove(&key),
                    _ => false,
                }
            };
            if was_cached {
                graveyard.push(key);
            }

            let old = self.store.get_array(heap, v, key).to_vec();
            if !old.is_empty() {
                let displaced = self.store.apply(heap, v, &[(key, Vec::new())]);
                bury_displaced(displaced, graveyard);
            }
            if was_cached {
                record_change(changes, v, key, old.clone(), Vec::new());
            }

            if pinned {
                // an instance is watching: refresh eagerly so its diff
                // carries values instead of a bare invalidation
                self.last_pending = None;
                match self.lazy_get(heap, v, key) {
                    Ok(values) => record_change(changes, v, key, old, values),
                    Err(e) if e.is_pending() => {
                        let src = self.last_pending.take().unwrap_or(v);
                        heap.incref(key);
                        self.deferred.entry(src).or_default().push((v, key));
                    }
                    Err(_) => {}
                }
            }
        }
    }

    // ---- shared plumbing ----

    /// Replaces the bag at (node, key), recording the change and burying
    /// displaced references. No-op writes are skipped.
    fn write_bag(
        &mut self,
        heap: &mut Heap,
        node: NodeId,
        key: ValueRef,
        bag: Vec<ValueRef>,
        changes: &mut ChangeMap,
        graveyard: &mut Vec<ValueRef>,
    ) {
        let old = self.store.get_array(heap, node, key).to_vec();
        if multiset_eq(&old, &bag) {
            return;
        }
        let displaced = self
            .store
            .apply(heap, node, core::slice::from_ref(&(key, bag.clone())));
        bury_displaced(displaced, graveyard);
        record_change(changes, node, key, old, bag);
    }

    fn build_result(
        &mut self,
        heap: &mut Heap,
        mut changes: ChangeMap,
        topo: &[NodeId],
    ) -> Propagated {
        let mut out = Vec::new();
        for &v in topo {
            let ch = match changes.remove(&v) {
                Some(ch) => ch,
                None => continue,
            };
            let mut entries: Vec<(ValueRef, Vec<ValueRef>)> = ch
                .into_iter()
                .filter(|(_, bc)| !multiset_eq(&bc.old, &bc.new))
                .map(|(key, bc)| (key, bc.new))
                .collect();
            if entries.is_empty() {
                continue;
            }
            entries.sort_by(|a, b| heap.cmp(a.0, b.0));
            for (key, values) in &entries {
                heap.incref(*key);
                for &value in values {
                    heap.incref(value);
                }
            }
            out.push(NodeChanges { node: v, entries });
        }
        Propagated { changes: out }
    }
}

fn record_change(
    changes: &mut ChangeMap,
    node: NodeId,
    key: ValueRef,
    old: Vec<ValueRef>,
    new: Vec<ValueRef>,
) {
    let slot = changes.entry(node).or_default();
    match slot.get_mut(&key) {
        // keep the oldest old so a key changed twice in one cycle diffs
        // against its pre-cycle contents
        Some(change) => change.new = new,
        None => {
            slot.insert(key, BagChange { old, new });
        }
    }
}

fn bury_displaced(displaced: Vec<skein_store::Displaced>, graveyard: &mut Vec<ValueRef>) {
    for entry in displaced {
        graveyard.extend(entry.values);
        if entry.removed_key {
            graveyard.push(entry.key);
        }
    }
}

/// Order-insensitive multiset equality over interned handles.
fn multiset_eq(a: &[ValueRef], b: &[ValueRef]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut xs: Vec<ValueRef> = a.to_vec();
    let mut ys: Vec<ValueRef> = b.to_vec();
    xs.sort_unstable();
    ys.sort_unstable();
    xs == ys
}

/// Multiset difference in both directions: (in old only, in new only).
fn multiset_diff(old: &[ValueRef], new: &[ValueRef]) -> (Vec<ValueRef>, Vec<ValueRef>) {
    let mut counts: HashMap<ValueRef, i64> = HashMap::new();
    for &v in old {
        *counts.entry(v).or_insert(0) -= 1;
    }
    for &v in new {
        *counts.entry(v).or_insert(0) += 1;
    }
    let mut removed = Vec::new();
    let mut added = Vec::new();
    for (v, count) in counts {
        if count < 0 {
            for _ in 0..(-count) {
                removed.push(v);
            }
        } else {
            for _ in 0..count {
                added.push(v);
            }
        }
    }
    (removed, added)
}

/// Output keys touched by a contribution swap, deduplicated.
fn touched_keys(
    removals: &[(ValueRef, ValueRef)],
    additions: &[(ValueRef, ValueRef)],
) -> Vec<ValueRef> {
    let mut keys: Vec<ValueRef> = Vec::new();
    for (k, _) in removals.iter().chain(additions.iter()) {
        if !keys.contains(k) {
            keys.push(*k);
        }
    }
    keys
}

/// Applies a removal/addition batch to an accumulator, falling back to a
/// full rebuild when the reducer asks for one, and surfacing errors as
/// error values. Returns an owned reference.
fn adjust_acc(
    heap: &mut Heap,
    reducer: &Rc<dyn Reducer>,
    current: Option<ValueRef>,
    removed: &[ValueRef],
    added: &[ValueRef],
    group: &[ValueRef],
) -> ValueRef {
    if let Some(&err) = group.iter().find(|&&x| heap.is_error(x)) {
        heap.incref(err);
        return err;
    }

    match current {
        Some(acc0) if !heap.is_error(acc0) => {
            heap.incref(acc0);
            let mut acc = acc0;
            for &value in removed {
                match reducer.remove(heap, acc, value) {
                    Ok(Some(next)) => {
                        heap.decref(acc);
                        acc = next;
                    }
                    Ok(None) => {
                        heap.decref(acc);
                        return fold_group(heap, reducer, group);
                    }
                    Err(e) => {
                        heap.decref(acc);
                        return heap.intern_error(&e.to_string());
                    }
                }
            }
            for &value in added {
                match reducer.add(heap, acc, value) {
                    Ok(next) => {
                        heap.decref(acc);
                        acc = next;
                    }
                    Err(e) => {
                        heap.decref(acc);
                        return heap.intern_error(&e.to_string());
                    }
                }
            }
            acc
        }
        _ => fold_group(heap, reducer, group),
    }
}

fn fold_group(heap: &mut Heap, reducer: &Rc<dyn Reducer>, group: &[ValueRef]) -> ValueRef {
    let mut acc = reducer.initial(heap);
    for &value in group {
        match reducer.add(heap, acc, value) {
            Ok(next) => {
                heap.decref(acc);
                acc = next;
            }
            Err(e) => {
                heap.decref(acc);
                return heap.intern_error(&e.to_string());
            }
        }
    }
    acc
}
