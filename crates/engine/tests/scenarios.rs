//! End-to-end scenarios against the engine's control API.

use skein_engine::{
    Adapter, Diff, Engine, Error, EvalContext, LazyCompute, Mapper, NodeId, Reducer, Resource,
    ResourceContext, Result, SubscriptionHandle, Value, Watermark,
};
use skein_heap::{Heap, ValueRef};
use skein_store::ColId;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

// ---- operators ----

struct Offset(i64);

impl Mapper for Offset {
    fn map_entry(
        &self,
        ctx: &mut EvalContext<'_>,
        key: ValueRef,
        values: &[ValueRef],
    ) -> Result<Vec<(ValueRef, ValueRef)>> {
        let mut out = Vec::new();
        for &v in values {
            let i = ctx
                .heap()
                .as_int(v)
                .ok_or_else(|| Error::user("expected an integer"))?;
            let mapped = ctx.heap().intern_int(i + self.0);
            out.push((ctx.keep(key), mapped));
        }
        Ok(out)
    }
}

struct KeyMod(i64);

impl Mapper for KeyMod {
    fn map_entry(
        &self,
        ctx: &mut EvalContext<'_>,
        key: ValueRef,
        values: &[ValueRef],
    ) -> Result<Vec<(ValueRef, ValueRef)>> {
        let k = ctx
            .heap()
            .as_int(key)
            .ok_or_else(|| Error::user("expected an integer key"))?;
        let out_key = ctx.heap().intern_int(k.rem_euclid(self.0));
        let mut out = Vec::new();
        for &v in values {
            if !out.is_empty() {
                ctx.heap().incref(out_key);
            }
            out.push((out_key, ctx.keep(v)));
        }
        if out.is_empty() {
            ctx.heap().decref(out_key);
        }
        Ok(out)
    }
}

struct Square;

impl Mapper for Square {
    fn map_entry(
        &self,
        ctx: &mut EvalContext<'_>,
        key: ValueRef,
        _values: &[ValueRef],
    ) -> Result<Vec<(ValueRef, ValueRef)>> {
        let k = ctx
            .heap()
            .as_int(key)
            .ok_or_else(|| Error::user("expected an integer key"))?;
        let squared = ctx.heap().intern_int(k * k);
        Ok(vec![(ctx.keep(key), squared)])
    }
}

struct Sum;

impl Reducer for Sum {
    fn initial(&self, heap: &mut Heap) -> ValueRef {
        heap.intern_int(0)
    }

    fn add(&self, heap: &mut Heap, acc: ValueRef, value: ValueRef) -> Result<ValueRef> {
        let a = heap.as_int(acc).ok_or_else(|| Error::user("bad accumulator"))?;
        let v = heap
            .as_int(value)
            .ok_or_else(|| Error::user("sum of non-integer"))?;
        Ok(heap.intern_int(a + v))
    }

    fn remove(&self, heap: &mut Heap, acc: ValueRef, value: ValueRef) -> Result<Option<ValueRef>> {
        let a = heap.as_int(acc).ok_or_else(|| Error::user("bad accumulator"))?;
        let v = heap
            .as_int(value)
            .ok_or_else(|| Error::user("sum of non-integer"))?;
        Ok(Some(heap.intern_int(a - v)))
    }
}

struct PlusTwo {
    input: NodeId,
}

impl LazyCompute for PlusTwo {
    fn compute(&self, ctx: &mut EvalContext<'_>, key: ValueRef) -> Result<Vec<ValueRef>> {
        let v = ctx.get_unique(self.input, key)?;
        let i = ctx
            .heap()
            .as_int(v)
            .ok_or_else(|| Error::user("expected an integer"))?;
        Ok(vec![ctx.heap().intern_int(i + 2)])
    }
}

struct MinusLazy {
    lazy: NodeId,
}

impl Mapper for MinusLazy {
    fn map_entry(
        &self,
        ctx: &mut EvalContext<'_>,
        key: ValueRef,
        values: &[ValueRef],
    ) -> Result<Vec<(ValueRef, ValueRef)>> {
        let l = ctx.get_unique(self.lazy, key)?;
        let l = ctx
            .heap()
            .as_int(l)
            .ok_or_else(|| Error::user("expected an integer"))?;
        let mut out = Vec::new();
        for &v in values {
            let i = ctx
                .heap()
                .as_int(v)
                .ok_or_else(|| Error::user("expected an integer"))?;
            let mapped = ctx.heap().intern_int(l - i);
            out.push((ctx.keep(key), mapped));
        }
        Ok(out)
    }
}

// ---- resources ----

struct OffsetResource;

impl Resource for OffsetResource {
    fn instantiate(&self, ctx: &mut ResourceContext<'_>) -> Result<ColId> {
        let input = ctx.input("numbers")?;
        ctx.map(input, Offset(5))
    }
}

struct ParitySumResource;

impl Resource for ParitySumResource {
    fn instantiate(&self, ctx: &mut ResourceContext<'_>) -> Result<ColId> {
        let input = ctx.input("numbers")?;
        ctx.map_reduce(input, KeyMod(2), Sum)
    }
}

struct MergeResource;

impl Resource for MergeResource {
    fn instantiate(&self, ctx: &mut ResourceContext<'_>) -> Result<ColId> {
        let left = ctx.input("left")?;
        let right = ctx.input("right")?;
        ctx.merge(&[left, right])
    }
}

struct WindowResource;

impl Resource for WindowResource {
    fn instantiate(&self, ctx: &mut ResourceContext<'_>) -> Result<ColId> {
        let input = ctx.input("numbers")?;
        let squares = ctx.map(input, Square)?;
        let sliced = ctx.slice(
            squares,
            &[
                (Value::Int(1), Value::Int(1)),
                (Value::Int(3), Value::Int(4)),
                (Value::Int(7), Value::Int(9)),
                (Value::Int(20), Value::Int(50)),
            ],
        )?;
        let taken = ctx.take(sliced, 7)?;
        ctx.slice(taken, &[(Value::Int(0), Value::Int(2000))])
    }
}

struct LazyEagerResource;

impl Resource for LazyEagerResource {
    fn instantiate(&self, ctx: &mut ResourceContext<'_>) -> Result<ColId> {
        let input = ctx.input("numbers")?;
        let lazy = ctx.create_lazy_collection(PlusTwo { input });
        ctx.map(input, MinusLazy { lazy })
    }
}

struct FeedResource;

impl Resource for FeedResource {
    fn instantiate(&self, ctx: &mut ResourceContext<'_>) -> Result<ColId> {
        let feed = ctx.use_external_resource("svc", "feed", &Value::Null)?;
        ctx.map(feed, Offset(1))
    }
}

/// Lazy compute that tries to open an external subscription.
struct ForbiddenSubscribe;

impl LazyCompute for ForbiddenSubscribe {
    fn compute(&self, ctx: &mut EvalContext<'_>, key: ValueRef) -> Result<Vec<ValueRef>> {
        let col = ctx.use_external_resource("svc", "feed", &Value::Null)?;
        ctx.get_array(col, key)
    }
}

struct ForbiddenLazyResource;

impl Resource for ForbiddenLazyResource {
    fn instantiate(&self, ctx: &mut ResourceContext<'_>) -> Result<ColId> {
        let input = ctx.input("numbers")?;
        let lazy = ctx.create_lazy_collection(ForbiddenSubscribe);
        ctx.map(input, MinusLazy { lazy })
    }
}

// ---- adapter ----

#[derive(Clone, Default)]
struct TestAdapter {
    handles: Rc<RefCell<Vec<SubscriptionHandle>>>,
    unsubscribed: Rc<RefCell<Vec<String>>>,
    shut_down: Rc<Cell<bool>>,
}

impl Adapter for TestAdapter {
    fn subscribe(
        &self,
        _instance: &str,
        _identifier: &str,
        _params: &Value,
        handle: SubscriptionHandle,
    ) {
        handle.loading();
        self.handles.borrow_mut().push(handle);
    }

    fn unsubscribe(&self, identifier: &str) {
        self.unsubscribed.borrow_mut().push(identifier.into());
    }

    fn shutdown(&self) {
        self.shut_down.set(true);
    }
}

// ---- helpers ----

fn ints(data: &[(i64, &[i64])]) -> Vec<(Value, Vec<Value>)> {
    data.iter()
        .map(|(k, vs)| {
            (
                Value::Int(*k),
                vs.iter().map(|&v| Value::Int(v)).collect(),
            )
        })
        .collect()
}

fn as_ints(entries: &[(Value, Vec<Value>)]) -> Vec<(i64, Vec<i64>)> {
    entries
        .iter()
        .map(|(k, vs)| {
            (
                k.as_i64().unwrap(),
                vs.iter().map(|v| v.as_i64().unwrap()).collect(),
            )
        })
        .collect()
}

fn snapshot(engine: &mut Engine, instance: &str) -> Vec<(i64, Vec<i64>)> {
    as_ints(&engine.get_all(instance).unwrap().entries)
}

// ---- scenarios ----

#[test]
fn offset_map_scenario() {
    let mut engine = Engine::new();
    engine.create_input("numbers").unwrap();
    engine.register_resource("offset", OffsetResource);

    engine
        .update("numbers", &ints(&[(1, &[10]), (2, &[20])]))
        .unwrap();
    engine
        .instantiate_resource("i1", "offset", Value::Null)
        .unwrap();
    assert_eq!(snapshot(&mut engine, "i1"), vec![(1, vec![15]), (2, vec![25])]);

    engine.update("numbers", &ints(&[(1, &[])])).unwrap();
    assert_eq!(snapshot(&mut engine, "i1"), vec![(2, vec![25])]);
}

#[test]
fn parity_sum_scenario() {
    let mut engine = Engine::new();
    engine.create_input("numbers").unwrap();
    engine.register_resource("parity", ParitySumResource);

    engine
        .update(
            "numbers",
            &ints(&[(0, &[1]), (1, &[1]), (2, &[1]), (3, &[2])]),
        )
        .unwrap();
    engine
        .instantiate_resource("i1", "parity", Value::Null)
        .unwrap();
    assert_eq!(snapshot(&mut engine, "i1"), vec![(0, vec![3]), (1, vec![3])]);

    engine.update("numbers", &ints(&[(4, &[10])])).unwrap();
    assert_eq!(snapshot(&mut engine, "i1"), vec![(0, vec![13]), (1, vec![3])]);

    engine.update("numbers", &ints(&[(0, &[])])).unwrap();
    assert_eq!(snapshot(&mut engine, "i1"), vec![(0, vec![12]), (1, vec![3])]);
}

#[test]
fn merge_scenario() {
    let mut engine = Engine::new();
    engine.create_input("left").unwrap();
    engine.create_input("right").unwrap();
    engine.register_resource("merged", MergeResource);

    engine.update("left", &ints(&[(1, &[10])])).unwrap();
    engine
        .update("right", &ints(&[(1, &[20]), (2, &[7])]))
        .unwrap();
    engine
        .instantiate_resource("i1", "merged", Value::Null)
        .unwrap();

    let mut got = snapshot(&mut engine, "i1");
    for (_, vs) in &mut got {
        vs.sort_unstable();
    }
    assert_eq!(got, vec![(1, vec![10, 20]), (2, vec![7])]);
}

#[test]
fn take_slice_scenario() {
    let mut engine = Engine::new();
    engine.create_input("numbers").unwrap();
    engine.register_resource("window", WindowResource);

    let data: Vec<(Value, Vec<Value>)> =
        (0..30).map(|k| (Value::Int(k), vec![Value::Int(k)])).collect();
    engine.update("numbers", &data).unwrap();
    engine
        .instantiate_resource("i1", "window", Value::Null)
        .unwrap();

    assert_eq!(
        snapshot(&mut engine, "i1"),
        vec![
            (1, vec![1]),
            (3, vec![9]),
            (4, vec![16]),
            (7, vec![49]),
            (8, vec![64]),
            (9, vec![81]),
            (20, vec![400]),
        ]
    );
}

#[test]
fn lazy_eager_scenario() {
    let mut engine = Engine::new();
    engine.create_input("numbers").unwrap();
    engine.register_resource("lazy_eager", LazyEagerResource);

    engine
        .update("numbers", &ints(&[(0, &[10]), (1, &[20])]))
        .unwrap();
    engine
        .instantiate_resource("i1", "lazy_eager", Value::Null)
        .unwrap();
    assert_eq!(snapshot(&mut engine, "i1"), vec![(0, vec![2]), (1, vec![2])]);

    engine.update("numbers", &ints(&[(2, &[4])])).unwrap();
    assert_eq!(
        snapshot(&mut engine, "i1"),
        vec![(0, vec![2]), (1, vec![2]), (2, vec![2])]
    );
}

#[test]
fn external_loading_scenario() {
    let mut engine = Engine::new();
    let adapter = TestAdapter::default();
    engine.register_external("svc", adapter.clone());
    engine.register_resource("feed", FeedResource);

    engine
        .instantiate_resource("i1", "feed", Value::Null)
        .unwrap();
    assert_eq!(adapter.handles.borrow().len(), 1);

    // while loading, reads are empty and nothing propagated
    let (values, _) = engine.get_array("i1", &Value::Int(0)).unwrap();
    assert!(values.is_empty());
    assert!(snapshot(&mut engine, "i1").is_empty());

    // the initial payload arrives and the downstream map is consistent
    let handle = adapter.handles.borrow()[0].clone();
    handle.update(ints(&[(0, &[100])]), true);
    engine.pump();
    assert_eq!(snapshot(&mut engine, "i1"), vec![(0, vec![101])]);

    // failure turns the keys into error values downstream
    handle.error("feed offline");
    engine.pump();
    let broken = engine.get_all("i1").unwrap();
    assert!(broken.entries[0].1[0].is_error());

    // recovery through a fresh snapshot
    handle.update(ints(&[(0, &[200])]), true);
    engine.pump();
    assert_eq!(snapshot(&mut engine, "i1"), vec![(0, vec![201])]);
}

#[test]
fn external_subscription_inside_lazy_surfaces_contract_error() {
    let mut engine = Engine::new();
    let adapter = TestAdapter::default();
    engine.register_external("svc", adapter);
    engine.create_input("numbers").unwrap();
    engine.register_resource("forbidden", ForbiddenLazyResource);

    engine.update("numbers", &ints(&[(1, &[10])])).unwrap();
    engine
        .instantiate_resource("i1", "forbidden", Value::Null)
        .unwrap();

    // the offending key carries the contract error; the engine continues
    let diff = engine.get_all("i1").unwrap();
    assert_eq!(diff.entries.len(), 1);
    let err = diff.entries[0].1[0].as_error().unwrap();
    assert!(err.contains("contract violation"));

    engine.update("numbers", &ints(&[(2, &[20])])).unwrap();
    assert_eq!(engine.get_all("i1").unwrap().entries.len(), 2);

    engine.close();
    assert!(engine.heap().is_empty());
}

// ---- universal properties ----

#[test]
fn watermarks_are_monotonic_per_instance() {
    let mut engine = Engine::new();
    engine.create_input("numbers").unwrap();
    engine.register_resource("offset", OffsetResource);
    engine
        .instantiate_resource("i1", "offset", Value::Null)
        .unwrap();

    let seen: Rc<RefCell<Vec<Watermark>>> = Rc::new(RefCell::new(Vec::new()));
    let seen_clone = seen.clone();
    engine
        .subscribe("i1", move |diff: &Diff| {
            seen_clone.borrow_mut().push(diff.watermark)
        })
        .unwrap();

    engine.update("numbers", &ints(&[(1, &[1])])).unwrap();
    engine.update("numbers", &ints(&[(2, &[2])])).unwrap();
    engine.update("numbers", &ints(&[(1, &[])])).unwrap();

    let seen = seen.borrow();
    assert!(seen.len() >= 4); // initial + three changes
    for pair in seen.windows(2) {
        assert!(pair[0] <= pair[1]);
    }
    for pair in seen[1..].windows(2) {
        assert!(pair[0] < pair[1]);
    }
}

#[test]
fn diff_replay_reproduces_get_all() {
    let mut engine = Engine::new();
    engine.create_input("numbers").unwrap();
    engine.register_resource("parity", ParitySumResource);
    engine
        .instantiate_resource("i1", "parity", Value::Null)
        .unwrap();

    let diffs: Rc<RefCell<Vec<Diff>>> = Rc::new(RefCell::new(Vec::new()));
    let diffs_clone = diffs.clone();
    engine
        .subscribe("i1", move |diff: &Diff| {
            diffs_clone.borrow_mut().push(diff.clone())
        })
        .unwrap();

    engine
        .update("numbers", &ints(&[(0, &[1]), (1, &[2]), (2, &[3])]))
        .unwrap();
    engine.update("numbers", &ints(&[(3, &[4])])).unwrap();
    engine
        .update("numbers", &ints(&[(1, &[]), (4, &[5, 6])]))
        .unwrap();

    // replay every diff in watermark order into a model
    let mut model: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for diff in diffs.borrow().iter() {
        for (k, vs) in as_ints(&diff.entries) {
            if vs.is_empty() {
                model.remove(&k);
            } else {
                model.insert(k, vs);
            }
        }
    }
    let replayed: Vec<(i64, Vec<i64>)> = model.into_iter().collect();
    assert_eq!(replayed, snapshot(&mut engine, "i1"));
}

#[test]
fn get_all_since_returns_the_incremental_suffix() {
    let mut engine = Engine::new();
    engine.create_input("numbers").unwrap();
    engine.register_resource("offset", OffsetResource);
    engine
        .instantiate_resource("i1", "offset", Value::Null)
        .unwrap();

    let w0 = engine.get_all("i1").unwrap().watermark;
    engine.update("numbers", &ints(&[(1, &[10])])).unwrap();
    engine.update("numbers", &ints(&[(2, &[20])])).unwrap();

    let suffix = engine.get_all_since("i1", w0).unwrap();
    assert_eq!(
        as_ints(&suffix.entries),
        vec![(1, vec![15]), (2, vec![25])]
    );
    assert!(suffix.watermark > w0);
    assert!(engine
        .get_all_since("i1", suffix.watermark)
        .unwrap()
        .is_empty());
}

#[test]
fn closing_everything_empties_the_heap() {
    let mut engine = Engine::new();
    engine.create_input("numbers").unwrap();
    engine.register_resource("parity", ParitySumResource);
    engine.register_resource("lazy_eager", LazyEagerResource);

    engine
        .update("numbers", &ints(&[(0, &[1]), (1, &[2]), (2, &[3])]))
        .unwrap();
    engine
        .instantiate_resource("i1", "parity", Value::Null)
        .unwrap();
    engine
        .instantiate_resource("i2", "lazy_eager", Value::Null)
        .unwrap();
    engine.update("numbers", &ints(&[(3, &[4])])).unwrap();

    engine.close();
    assert!(engine.heap().is_empty());
}

#[test]
fn closing_an_instance_releases_its_subgraph_and_externals() {
    let mut engine = Engine::new();
    let adapter = TestAdapter::default();
    engine.register_external("svc", adapter.clone());
    engine.register_resource("feed", FeedResource);

    engine
        .instantiate_resource("i1", "feed", Value::Null)
        .unwrap();
    engine.close_resource_instance("i1").unwrap();

    assert_eq!(adapter.unsubscribed.borrow().as_slice(), &["feed"]);
    assert!(engine.heap().is_empty());

    // a late callback after unsubscription is dropped
    let handle = adapter.handles.borrow()[0].clone();
    handle.update(ints(&[(0, &[1])]), true);
    engine.pump();

    assert!(matches!(
        engine.close_resource_instance("i1"),
        Err(Error::UnknownInstance { .. })
    ));
}

#[test]
fn instantiate_is_idempotent_and_conflicts_error() {
    let mut engine = Engine::new();
    engine.create_input("numbers").unwrap();
    engine.register_resource("offset", OffsetResource);
    engine.register_resource("parity", ParitySumResource);

    engine
        .instantiate_resource("i1", "offset", Value::Null)
        .unwrap();
    engine
        .instantiate_resource("i1", "offset", Value::Null)
        .unwrap();

    assert!(engine
        .instantiate_resource("i1", "parity", Value::Null)
        .is_err());
    assert!(matches!(
        engine.instantiate_resource("i2", "missing", Value::Null),
        Err(Error::UnknownResource { .. })
    ));
}

#[test]
fn unknown_collection_write_fails_synchronously() {
    let mut engine = Engine::new();
    assert!(engine.update("missing", &ints(&[(1, &[1])])).is_err());
}

#[test]
fn get_array_reads_one_key() {
    let mut engine = Engine::new();
    engine.create_input("numbers").unwrap();
    engine.register_resource("offset", OffsetResource);
    engine
        .update("numbers", &ints(&[(1, &[10]), (2, &[20])]))
        .unwrap();
    engine
        .instantiate_resource("i1", "offset", Value::Null)
        .unwrap();

    let (values, watermark) = engine.get_array("i1", &Value::Int(2)).unwrap();
    assert_eq!(values, vec![Value::Int(25)]);
    assert_eq!(watermark, engine.get_all("i1").unwrap().watermark);

    let (values, _) = engine.get_array("i1", &Value::Int(9)).unwrap();
    assert!(values.is_empty());
}

#[test]
fn close_shuts_adapters_down_and_rejects_writes() {
    let mut engine = Engine::new();
    let adapter = TestAdapter::default();
    engine.register_external("svc", adapter.clone());
    engine.register_resource("feed", FeedResource);
    engine.create_input("numbers").unwrap();
    engine
        .instantiate_resource("i1", "feed", Value::Null)
        .unwrap();

    engine.close();
    assert!(adapter.shut_down.get());
    assert!(engine.heap().is_empty());
    assert!(engine.update("numbers", &ints(&[(1, &[1])])).is_err());
}

#[test]
fn empty_and_boundary_collections() {
    let mut engine = Engine::new();
    engine.create_input("numbers").unwrap();
    engine.register_resource("offset", OffsetResource);
    engine
        .instantiate_resource("i1", "offset", Value::Null)
        .unwrap();

    // empty collection
    assert!(snapshot(&mut engine, "i1").is_empty());

    // single element
    engine.update("numbers", &ints(&[(7, &[1])])).unwrap();
    assert_eq!(snapshot(&mut engine, "i1"), vec![(7, vec![6])]);

    // deleting a key that does not exist is a no-op
    engine.update("numbers", &ints(&[(9, &[])])).unwrap();
    assert_eq!(snapshot(&mut engine, "i1"), vec![(7, vec![6])]);
}
