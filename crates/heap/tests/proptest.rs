//! Property-based tests for skein-heap using proptest.

use proptest::prelude::*;
use skein_core::Value;
use skein_heap::Heap;

/// Strategy for arbitrary value trees of bounded depth.
fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        any::<f64>().prop_filter("total order needs non-NaN", |f| !f.is_nan()).prop_map(Value::Float),
        "[a-z]{0,12}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::vec(("[a-z]{1,6}", inner), 0..4)
                .prop_map(|fields| Value::Object(fields.into_iter().collect())),
        ]
    })
}

proptest! {
    /// Structurally equal values interned independently share a handle.
    #[test]
    fn intern_identity(value in value_strategy()) {
        let mut heap = Heap::new();
        let a = heap.intern(&value);
        let b = heap.intern(&value.clone());
        prop_assert_eq!(a, b);
        prop_assert_eq!(heap.refs(a), 2);
    }

    /// Materializing an interned value reproduces the original tree.
    #[test]
    fn intern_materialize_roundtrip(value in value_strategy()) {
        let mut heap = Heap::new();
        let h = heap.intern(&value);
        prop_assert_eq!(heap.materialize(h), value);
    }

    /// Releasing every handle empties the heap.
    #[test]
    fn refcount_soundness(values in prop::collection::vec(value_strategy(), 1..10)) {
        let mut heap = Heap::new();
        let handles: Vec<_> = values.iter().map(|v| heap.intern(v)).collect();
        prop_assert!(!heap.is_empty());
        for h in handles {
            heap.decref(h);
        }
        prop_assert!(heap.is_empty());
    }

    /// Handle order agrees with structural value order.
    #[test]
    fn cmp_agrees_with_value_order(a in value_strategy(), b in value_strategy()) {
        let mut heap = Heap::new();
        let ha = heap.intern(&a);
        let hb = heap.intern(&b);
        prop_assert_eq!(heap.cmp(ha, hb), a.cmp(&b));
    }
}
