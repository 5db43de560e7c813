//! The interned heap implementation.
//!
//! Slots live in an arena; released slots return to a free pool and are
//! reused by later interns. A content-hash table maps structure to live
//! slots so that interning an already-known structure bumps a refcount
//! instead of allocating.
//!
//! Reference ownership convention: every `ValueRef` held by a caller or
//! stored in a slot accounts for exactly one reference. Public constructors
//! taking child handles leave the caller's references untouched; a freshly
//! allocated composite slot acquires its own child references.
//!
//! Invariant violations (refcount underflow, reading a freed slot, a
//! non-string object key) have no correct interpretation and abort.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::cmp::Ordering;
use hashbrown::HashMap;
use skein_core::{Value, ValueKind};

/// A handle to an interned value. Copyable; equality of handles is
/// structural equality of the values they name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueRef(u32);

impl ValueRef {
    /// Returns the raw slot index, for diagnostics only.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Strings shorter than one machine word are stored inline in the slot;
/// longer strings carry their own allocation.
#[derive(Debug)]
enum StrRepr {
    Inline { len: u8, bytes: [u8; 8] },
    Boxed(Box<str>),
}

impl StrRepr {
    fn new(s: &str) -> Self {
        if s.len() < 8 {
            let mut bytes = [0u8; 8];
            bytes[..s.len()].copy_from_slice(s.as_bytes());
            StrRepr::Inline {
                len: s.len() as u8,
                bytes,
            }
        } else {
            StrRepr::Boxed(s.into())
        }
    }

    fn as_str(&self) -> &str {
        match self {
            StrRepr::Inline { len, bytes } => {
                // only ever constructed from valid UTF-8 prefixes
                core::str::from_utf8(&bytes[..*len as usize]).unwrap_or("")
            }
            StrRepr::Boxed(s) => s,
        }
    }
}

/// Payload of a live slot. Children of composites are themselves interned.
#[derive(Debug)]
enum HeapValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(StrRepr),
    /// Element handles in sequence order.
    Array(Box<[ValueRef]>),
    /// (key, value) pairs; keys are interned strings, sorted by content.
    Object(Box<[(ValueRef, ValueRef)]>),
    Error(Box<str>),
}

struct Slot {
    refs: u32,
    hash: u64,
    value: HeapValue,
}

/// The interned heap.
pub struct Heap {
    slots: Vec<Slot>,
    /// Free pool of released slot indices.
    free: Vec<u32>,
    /// Content hash -> live slots with that hash.
    dedup: HashMap<u64, Vec<u32>>,
    live: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Creates a new empty heap.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            dedup: HashMap::new(),
            live: 0,
        }
    }

    /// Returns the number of live interned values.
    #[inline]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Returns true if no values are live.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Returns the current reference count of a handle.
    pub fn refs(&self, h: ValueRef) -> usize {
        self.slot(h).refs as usize
    }

    // ---- interning ----

    /// Interns a value tree, returning a handle owning one reference.
    pub fn intern(&mut self, value: &Value) -> ValueRef {
        match value {
            Value::Null => self.intern_null(),
            Value::Bool(b) => self.intern_bool(*b),
            Value::Int(i) => self.intern_int(*i),
            Value::Float(f) => self.intern_float(*f),
            Value::String(s) => self.intern_str(s),
            Value::Error(m) => self.intern_error(m),
            Value::Array(vs) => {
                let children: Vec<ValueRef> = vs.iter().map(|v| self.intern(v)).collect();
                let handle = self.intern_array(&children);
                for &c in &children {
                    self.decref(c);
                }
                handle
            }
            Value::Object(o) => {
                let entries: Vec<(ValueRef, ValueRef)> = o
                    .iter()
                    .map(|(k, v)| {
                        let kh = self.intern_str(k);
                        let vh = self.intern(v);
                        (kh, vh)
                    })
                    .collect();
                let handle = self.intern_object(&entries);
                for &(k, v) in &entries {
                    self.decref(k);
                    self.decref(v);
                }
                handle
            }
        }
    }

    /// Interns the null marker.
    pub fn intern_null(&mut self) -> ValueRef {
        self.intern_slot(HeapValue::Null).0
    }

    /// Interns a boolean.
    pub fn intern_bool(&mut self, b: bool) -> ValueRef {
        self.intern_slot(HeapValue::Bool(b)).0
    }

    /// Interns an integer.
    pub fn intern_int(&mut self, i: i64) -> ValueRef {
        self.intern_slot(HeapValue::Int(i)).0
    }

    /// Interns a float.
    pub fn intern_float(&mut self, f: f64) -> ValueRef {
        self.intern_slot(HeapValue::Float(f)).0
    }

    /// Interns a string. Short strings are stored inline; all strings are
    /// deduplicated by content.
    pub fn intern_str(&mut self, s: &str) -> ValueRef {
        self.intern_slot(HeapValue::Str(StrRepr::new(s))).0
    }

    /// Interns an error value.
    pub fn intern_error(&mut self, message: &str) -> ValueRef {
        self.intern_slot(HeapValue::Error(message.into())).0
    }

    /// Interns an array of already-interned elements. The caller's
    /// references to the elements are unaffected.
    pub fn intern_array(&mut self, elements: &[ValueRef]) -> ValueRef {
        let (handle, fresh) = self.intern_slot(HeapValue::Array(elements.into()));
        if fresh {
            for &c in elements {
                self.incref(c);
            }
        }
        handle
    }

    /// Interns an object from already-interned (string-key, value) pairs.
    /// Pairs are sorted by key content; duplicate keys keep the last value.
    /// The caller's references are unaffected.
    pub fn intern_object(&mut self, entries: &[(ValueRef, ValueRef)]) -> ValueRef {
        let mut sorted: Vec<(ValueRef, ValueRef)> = entries.to_vec();
        sorted.sort_by(|a, b| self.str_of(a.0).cmp(self.str_of(b.0)));
        sorted.dedup_by(|next, prev| {
            if next.0 == prev.0 {
                prev.1 = next.1;
                true
            } else {
                false
            }
        });
        let (handle, fresh) = self.intern_slot(HeapValue::Object(sorted.clone().into()));
        if fresh {
            for &(k, v) in &sorted {
                self.incref(k);
                self.incref(v);
            }
        }
        handle
    }

    fn intern_slot(&mut self, value: HeapValue) -> (ValueRef, bool) {
        let hash = content_hash(&value);
        if let Some(candidates) = self.dedup.get(&hash) {
            for &idx in candidates {
                if shallow_eq(&self.slots[idx as usize].value, &value) {
                    self.slots[idx as usize].refs += 1;
                    return (ValueRef(idx), false);
                }
            }
        }

        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Slot {
                    refs: 1,
                    hash,
                    value,
                };
                idx
            }
            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(Slot {
                    refs: 1,
                    hash,
                    value,
                });
                idx
            }
        };
        self.dedup.entry(hash).or_default().push(idx);
        self.live += 1;
        (ValueRef(idx), true)
    }

    // ---- reference counting ----

    /// Increments the reference count of a handle.
    pub fn incref(&mut self, h: ValueRef) {
        let slot = self.slot_mut(h);
        slot.refs += 1;
    }

    /// Decrements the reference count, returning the new count. Dropping to
    /// zero releases the slot and every child reference it held, iteratively.
    pub fn decref(&mut self, h: ValueRef) -> usize {
        let mut result = 0;
        let mut first = true;
        let mut stack = Vec::new();
        stack.push(h);

        while let Some(r) = stack.pop() {
            let idx = r.0 as usize;
            assert!(
                idx < self.slots.len() && self.slots[idx].refs > 0,
                "refcount underflow on slot {}",
                r.0
            );
            self.slots[idx].refs -= 1;
            let count = self.slots[idx].refs;
            if first {
                result = count as usize;
                first = false;
            }
            if count == 0 {
                let hash = self.slots[idx].hash;
                let value = core::mem::replace(&mut self.slots[idx].value, HeapValue::Null);
                self.unregister(hash, r.0);
                match value {
                    HeapValue::Array(children) => {
                        stack.extend(children.iter().copied());
                    }
                    HeapValue::Object(entries) => {
                        for &(k, v) in entries.iter() {
                            stack.push(k);
                            stack.push(v);
                        }
                    }
                    _ => {}
                }
                self.free.push(r.0);
                self.live -= 1;
            }
        }
        result
    }

    fn unregister(&mut self, hash: u64, idx: u32) {
        let candidates = self
            .dedup
            .get_mut(&hash)
            .unwrap_or_else(|| panic!("released slot {} missing from dedup table", idx));
        let pos = candidates
            .iter()
            .position(|&c| c == idx)
            .unwrap_or_else(|| panic!("released slot {} missing from dedup table", idx));
        candidates.swap_remove(pos);
        if candidates.is_empty() {
            self.dedup.remove(&hash);
        }
    }

    // ---- accessors ----

    fn slot(&self, h: ValueRef) -> &Slot {
        let slot = &self.slots[h.0 as usize];
        assert!(slot.refs > 0, "read of released slot {}", h.0);
        slot
    }

    fn slot_mut(&mut self, h: ValueRef) -> &mut Slot {
        let slot = &mut self.slots[h.0 as usize];
        assert!(slot.refs > 0, "access to released slot {}", h.0);
        slot
    }

    /// Returns the kind of the value behind a handle.
    pub fn kind(&self, h: ValueRef) -> ValueKind {
        match &self.slot(h).value {
            HeapValue::Null => ValueKind::Null,
            HeapValue::Bool(_) => ValueKind::Bool,
            HeapValue::Int(_) => ValueKind::Int,
            HeapValue::Float(_) => ValueKind::Float,
            HeapValue::Str(_) => ValueKind::String,
            HeapValue::Array(_) => ValueKind::Array,
            HeapValue::Object(_) => ValueKind::Object,
            HeapValue::Error(_) => ValueKind::Error,
        }
    }

    /// Returns the integer behind a handle, if it is an Int.
    pub fn as_int(&self, h: ValueRef) -> Option<i64> {
        match &self.slot(h).value {
            HeapValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the number behind a handle as f64, if it is Int or Float.
    pub fn as_float(&self, h: ValueRef) -> Option<f64> {
        match &self.slot(h).value {
            HeapValue::Int(i) => Some(*i as f64),
            HeapValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the boolean behind a handle, if it is a Bool.
    pub fn as_bool(&self, h: ValueRef) -> Option<bool> {
        match &self.slot(h).value {
            HeapValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the string behind a handle, if it is a String.
    pub fn as_str(&self, h: ValueRef) -> Option<&str> {
        match &self.slot(h).value {
            HeapValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Returns the element handles, if the handle names an Array.
    pub fn as_array(&self, h: ValueRef) -> Option<&[ValueRef]> {
        match &self.slot(h).value {
            HeapValue::Array(cs) => Some(cs),
            _ => None,
        }
    }

    /// Returns the (key, value) handle pairs, if the handle names an Object.
    pub fn object_entries(&self, h: ValueRef) -> Option<&[(ValueRef, ValueRef)]> {
        match &self.slot(h).value {
            HeapValue::Object(es) => Some(es),
            _ => None,
        }
    }

    /// Looks up a field of an object by name. O(log n)
    pub fn object_field(&self, h: ValueRef, name: &str) -> Option<ValueRef> {
        let entries = self.object_entries(h)?;
        entries
            .binary_search_by(|(k, _)| self.str_of(*k).cmp(name))
            .ok()
            .map(|idx| entries[idx].1)
    }

    /// Returns the field names of an object in sorted order.
    pub fn object_keys(&self, h: ValueRef) -> Option<Vec<&str>> {
        let entries = self.object_entries(h)?;
        Some(entries.iter().map(|(k, _)| self.str_of(*k)).collect())
    }

    /// Returns true if the handle names an error value.
    pub fn is_error(&self, h: ValueRef) -> bool {
        matches!(&self.slot(h).value, HeapValue::Error(_))
    }

    /// Returns the message of an error value.
    pub fn error_message(&self, h: ValueRef) -> Option<&str> {
        match &self.slot(h).value {
            HeapValue::Error(m) => Some(m),
            _ => None,
        }
    }

    fn str_of(&self, h: ValueRef) -> &str {
        match &self.slot(h).value {
            HeapValue::Str(s) => s.as_str(),
            other => panic!("object key is not a string: {:?}", other),
        }
    }

    /// Rebuilds the owned value tree behind a handle.
    pub fn materialize(&self, h: ValueRef) -> Value {
        match &self.slot(h).value {
            HeapValue::Null => Value::Null,
            HeapValue::Bool(b) => Value::Bool(*b),
            HeapValue::Int(i) => Value::Int(*i),
            HeapValue::Float(f) => Value::Float(*f),
            HeapValue::Str(s) => Value::String(String::from(s.as_str())),
            HeapValue::Error(m) => Value::Error(String::from(&**m)),
            HeapValue::Array(cs) => {
                Value::Array(cs.iter().map(|&c| self.materialize(c)).collect())
            }
            HeapValue::Object(es) => Value::Object(
                es.iter()
                    .map(|&(k, v)| (String::from(self.str_of(k)), self.materialize(v)))
                    .collect(),
            ),
        }
    }

    // ---- structural order ----

    /// Total structural order over handles, matching `Value`'s `Ord`.
    pub fn cmp(&self, a: ValueRef, b: ValueRef) -> Ordering {
        if a == b {
            return Ordering::Equal;
        }
        let (va, vb) = (&self.slot(a).value, &self.slot(b).value);
        let (ra, rb) = (rank(va), rank(vb));
        if ra != rb {
            return ra.cmp(&rb);
        }
        match (va, vb) {
            (HeapValue::Null, HeapValue::Null) => Ordering::Equal,
            (HeapValue::Bool(x), HeapValue::Bool(y)) => x.cmp(y),
            (HeapValue::Int(x), HeapValue::Int(y)) => x.cmp(y),
            (HeapValue::Float(x), HeapValue::Float(y)) => x.total_cmp(y),
            (HeapValue::Int(x), HeapValue::Float(y)) => {
                (*x as f64).total_cmp(y).then(Ordering::Less)
            }
            (HeapValue::Float(x), HeapValue::Int(y)) => {
                x.total_cmp(&(*y as f64)).then(Ordering::Greater)
            }
            (HeapValue::Str(x), HeapValue::Str(y)) => x.as_str().cmp(y.as_str()),
            (HeapValue::Error(x), HeapValue::Error(y)) => x.cmp(y),
            (HeapValue::Array(xs), HeapValue::Array(ys)) => {
                for (&x, &y) in xs.iter().zip(ys.iter()) {
                    let ord = self.cmp(x, y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                xs.len().cmp(&ys.len())
            }
            (HeapValue::Object(xs), HeapValue::Object(ys)) => {
                for (&(kx, vx), &(ky, vy)) in xs.iter().zip(ys.iter()) {
                    let ord = self
                        .str_of(kx)
                        .cmp(self.str_of(ky))
                        .then_with(|| self.cmp(vx, vy));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                xs.len().cmp(&ys.len())
            }
            _ => unreachable!(),
        }
    }
}

fn rank(v: &HeapValue) -> u8 {
    match v {
        HeapValue::Null => 0,
        HeapValue::Bool(_) => 1,
        HeapValue::Int(_) | HeapValue::Float(_) => 2,
        HeapValue::Str(_) => 3,
        HeapValue::Array(_) => 4,
        HeapValue::Object(_) => 5,
        HeapValue::Error(_) => 6,
    }
}

/// FNV-1a over the shallow content of a slot. Child handles are canonical,
/// so hashing them by index is consistent with structural equality.
fn content_hash(value: &HeapValue) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    let mut hash = OFFSET;
    let mut feed = |bytes: &[u8]| {
        for &b in bytes {
            hash ^= b as u64;
            hash = hash.wrapping_mul(PRIME);
        }
    };

    match value {
        HeapValue::Null => feed(&[0]),
        HeapValue::Bool(b) => feed(&[1, *b as u8]),
        HeapValue::Int(i) => {
            feed(&[2]);
            feed(&i.to_le_bytes());
        }
        HeapValue::Float(f) => {
            feed(&[3]);
            feed(&f.to_bits().to_le_bytes());
        }
        HeapValue::Str(s) => {
            feed(&[4]);
            feed(s.as_str().as_bytes());
        }
        HeapValue::Array(cs) => {
            feed(&[5]);
            for c in cs.iter() {
                feed(&c.0.to_le_bytes());
            }
        }
        HeapValue::Object(es) => {
            feed(&[6]);
            for (k, v) in es.iter() {
                feed(&k.0.to_le_bytes());
                feed(&v.0.to_le_bytes());
            }
        }
        HeapValue::Error(m) => {
            feed(&[7]);
            feed(m.as_bytes());
        }
    }
    hash
}

/// Shallow structural equality: children compare by handle.
fn shallow_eq(a: &HeapValue, b: &HeapValue) -> bool {
    match (a, b) {
        (HeapValue::Null, HeapValue::Null) => true,
        (HeapValue::Bool(x), HeapValue::Bool(y)) => x == y,
        (HeapValue::Int(x), HeapValue::Int(y)) => x == y,
        (HeapValue::Float(x), HeapValue::Float(y)) => x.to_bits() == y.to_bits(),
        (HeapValue::Str(x), HeapValue::Str(y)) => x.as_str() == y.as_str(),
        (HeapValue::Array(xs), HeapValue::Array(ys)) => xs == ys,
        (HeapValue::Object(xs), HeapValue::Object(ys)) => xs == ys,
        (HeapValue::Error(x), HeapValue::Error(y)) => x == y,
        _ => false,
    }
}
