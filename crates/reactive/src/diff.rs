//! Watermarked diffs, the unit of change delivery.

use alloc::string::String;
use alloc::vec::Vec;
use skein_core::{render, Value};

/// Monotonic logical time scoped to one resource instance. Rendered as an
/// opaque decimal string on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(u64);

impl Watermark {
    /// The watermark before any diff was emitted.
    pub const ZERO: Watermark = Watermark(0);

    /// The next watermark in sequence.
    #[inline]
    pub fn next(self) -> Watermark {
        Watermark(self.0 + 1)
    }

    /// Renders the opaque wire form.
    pub fn render(self) -> String {
        use alloc::string::ToString;
        self.0.to_string()
    }

    /// Parses the wire form back.
    pub fn parse(s: &str) -> Option<Watermark> {
        s.parse::<u64>().ok().map(Watermark)
    }
}

/// A batch of per-key changes delivered to one reader.
///
/// An empty value list deletes the key. `is_initial` marks the snapshot
/// that seeds a fresh subscriber; every later diff is incremental.
#[derive(Clone, Debug, PartialEq)]
pub struct Diff {
    pub entries: Vec<(Value, Vec<Value>)>,
    pub watermark: Watermark,
    pub is_initial: bool,
}

impl Diff {
    /// Creates an incremental diff.
    pub fn new(entries: Vec<(Value, Vec<Value>)>, watermark: Watermark) -> Self {
        Self {
            entries,
            watermark,
            is_initial: false,
        }
    }

    /// Creates an initial-snapshot diff.
    pub fn initial(entries: Vec<(Value, Vec<Value>)>, watermark: Watermark) -> Self {
        Self {
            entries,
            watermark,
            is_initial: true,
        }
    }

    /// Returns true if the diff carries no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of changed keys.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Renders the wire form:
    /// `{"values": [[key, [v, ...]], ...], "watermark": "<n>", "isInitial": bool}`.
    pub fn to_json(&self) -> String {
        let mut out = String::from("{\"values\":[");
        for (i, (key, values)) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push('[');
            out.push_str(&render(key));
            out.push_str(",[");
            for (j, v) in values.iter().enumerate() {
                if j > 0 {
                    out.push(',');
                }
                out.push_str(&render(v));
            }
            out.push_str("]]");
        }
        out.push_str("],\"watermark\":\"");
        out.push_str(&self.watermark.render());
        out.push('"');
        if self.is_initial {
            out.push_str(",\"isInitial\":true");
        }
        out.push('}');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_watermark_monotonic() {
        let w0 = Watermark::ZERO;
        let w1 = w0.next();
        let w2 = w1.next();
        assert!(w0 < w1 && w1 < w2);
    }

    #[test]
    fn test_watermark_wire_roundtrip() {
        let w = Watermark::ZERO.next().next().next();
        assert_eq!(Watermark::parse(&w.render()), Some(w));
        assert_eq!(Watermark::parse("not a number"), None);
    }

    #[test]
    fn test_diff_json() {
        let diff = Diff::initial(
            vec![
                (Value::Int(1), vec![Value::Int(10)]),
                (Value::Int(2), vec![]),
            ],
            Watermark::ZERO.next(),
        );
        assert_eq!(
            diff.to_json(),
            "{\"values\":[[1,[10]],[2,[]]],\"watermark\":\"1\",\"isInitial\":true}"
        );
    }

    #[test]
    fn test_incremental_diff_json_omits_initial_flag() {
        let diff = Diff::new(vec![(Value::from("k"), vec![Value::Bool(true)])], Watermark::ZERO.next());
        assert_eq!(
            diff.to_json(),
            "{\"values\":[[\"k\",[true]]],\"watermark\":\"1\"}"
        );
    }
}
