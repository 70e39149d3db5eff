//! Structured query keys: canonical hashing and partial matching.

use std::collections::BTreeMap;
use std::fmt::Write as _;

/// A single value inside a [`QueryKey`].
///
/// The variant set is closed so canonicalization and subset matching are
/// total functions: primitives, ordered lists, and maps. Maps are backed by
/// a `BTreeMap`, which makes canonicalization insensitive to the order
/// entries were inserted in; list order is significant, and a list never
/// matches a map.
#[derive(Clone, Debug, PartialEq)]
pub enum KeyValue {
    /// Absent/null segment value.
    Null,
    /// Boolean segment value.
    Bool(bool),
    /// Integer segment value.
    Int(i64),
    /// Floating point segment value. Hashes distinctly from [`KeyValue::Int`].
    Float(f64),
    /// String segment value.
    Str(String),
    /// Ordered list of values. Position is significant.
    List(Vec<KeyValue>),
    /// Map of named values with canonical (sorted) key order.
    Map(BTreeMap<String, KeyValue>),
}

impl KeyValue {
    /// Append the canonical representation of this value to `out`.
    ///
    /// Map keys iterate in sorted order, so `{a:1,b:2}` and `{b:2,a:1}`
    /// serialize identically. Lists keep their order and use distinct
    /// delimiters from maps.
    fn write_canonical(&self, out: &mut String) {
        match self {
            KeyValue::Null => out.push_str("null"),
            KeyValue::Bool(value) => {
                let _ = write!(out, "{value}");
            }
            KeyValue::Int(value) => {
                let _ = write!(out, "{value}");
            }
            KeyValue::Float(value) => {
                // Debug formatting keeps the decimal point, so 1.0 never
                // collides with the integer 1.
                let _ = write!(out, "{value:?}");
            }
            KeyValue::Str(value) => {
                let _ = write!(out, "{value:?}");
            }
            KeyValue::List(items) => {
                out.push('[');
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        out.push(',');
                    }
                    item.write_canonical(out);
                }
                out.push(']');
            }
            KeyValue::Map(entries) => {
                out.push('{');
                for (index, (key, value)) in entries.iter().enumerate() {
                    if index > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{key:?}:");
                    value.write_canonical(out);
                }
                out.push('}');
            }
        }
    }

    /// Whether `self`, the filter side, is contained in `candidate`.
    ///
    /// Maps match when every entry of the filter is present in the candidate
    /// with a matching value; extra candidate entries are ignored. Lists
    /// match as a position-by-position prefix. Primitives require equality,
    /// and differing variants never match.
    pub fn subset_of(&self, candidate: &KeyValue) -> bool {
        match (self, candidate) {
            (KeyValue::List(filter), KeyValue::List(candidate)) => {
                filter.len() <= candidate.len()
                    && filter
                        .iter()
                        .zip(candidate.iter())
                        .all(|(f, c)| f.subset_of(c))
            }
            (KeyValue::Map(filter), KeyValue::Map(candidate)) => filter
                .iter()
                .all(|(key, value)| candidate.get(key).is_some_and(|c| value.subset_of(c))),
            (filter, candidate) => filter == candidate,
        }
    }
}

impl From<bool> for KeyValue {
    fn from(value: bool) -> Self {
        KeyValue::Bool(value)
    }
}

impl From<i32> for KeyValue {
    fn from(value: i32) -> Self {
        KeyValue::Int(value.into())
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::Int(value)
    }
}

impl From<u32> for KeyValue {
    fn from(value: u32) -> Self {
        KeyValue::Int(value.into())
    }
}

impl From<f64> for KeyValue {
    fn from(value: f64) -> Self {
        KeyValue::Float(value)
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::Str(value.to_owned())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        KeyValue::Str(value)
    }
}

impl From<Vec<KeyValue>> for KeyValue {
    fn from(value: Vec<KeyValue>) -> Self {
        KeyValue::List(value)
    }
}

impl From<BTreeMap<String, KeyValue>> for KeyValue {
    fn from(value: BTreeMap<String, KeyValue>) -> Self {
        KeyValue::Map(value)
    }
}

/// A structured cache key: an ordered sequence of [`KeyValue`] segments.
///
/// Two keys are exactly equal when their canonical hash strings match.
/// Wrapping a key in an extra list level changes its identity: `[key]`
/// never matches `key`.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct QueryKey(Vec<KeyValue>);

impl QueryKey {
    /// Create a key from its segments.
    pub fn new(segments: Vec<KeyValue>) -> Self {
        Self(segments)
    }

    /// The key's segments in order.
    pub fn segments(&self) -> &[KeyValue] {
        &self.0
    }

    /// Whether the key has no segments. An empty key used as a filter
    /// matches every candidate.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical hash string; the cache's lookup key.
    ///
    /// Deterministic, insensitive to map-entry insertion order, sensitive
    /// to list order and to the list-vs-map distinction.
    pub fn hash_str(&self) -> String {
        let mut out = String::new();
        out.push('[');
        for (index, segment) in self.0.iter().enumerate() {
            if index > 0 {
                out.push(',');
            }
            segment.write_canonical(&mut out);
        }
        out.push(']');
        out
    }

    /// Whether `self`, used as a filter, partially matches `candidate`.
    ///
    /// Every segment of the filter must subset-match the candidate's
    /// segment at the same position; the candidate may have extra trailing
    /// segments. An empty filter matches everything.
    pub fn partial_match(&self, candidate: &QueryKey) -> bool {
        self.0.len() <= candidate.0.len()
            && self
                .0
                .iter()
                .zip(candidate.0.iter())
                .all(|(f, c)| f.subset_of(c))
    }

    /// Match `candidate` against this filter key, exactly or partially.
    pub fn matches(&self, candidate: &QueryKey, exact: bool) -> bool {
        if exact {
            self.hash_str() == candidate.hash_str()
        } else {
            self.partial_match(candidate)
        }
    }
}

impl From<Vec<KeyValue>> for QueryKey {
    fn from(segments: Vec<KeyValue>) -> Self {
        Self(segments)
    }
}

/// Build a [`QueryKey`] from a list of segments.
///
/// Segments can be primitives, `[..]` lists, or `{ "name" => value }` maps,
/// nested arbitrarily. Each segment must be a single token tree; bind a
/// compound expression to a variable first.
///
/// ```
/// use refetch::key;
///
/// let page = 2;
/// let k = key!["todos", page];
/// assert!(!k.is_empty());
/// ```
///
/// ```
/// use refetch::key;
///
/// let a = key!["todos", { "status" => "done", "page" => 2 }];
/// let b = key!["todos", { "page" => 2, "status" => "done" }];
/// assert_eq!(a.hash_str(), b.hash_str());
/// ```
#[macro_export]
macro_rules! key {
    () => {
        $crate::QueryKey::default()
    };
    ($($segment:tt),+ $(,)?) => {
        $crate::QueryKey::new(vec![$($crate::key_segment!($segment)),+])
    };
}

/// Build a single [`KeyValue`] segment; used by [`key!`].
#[doc(hidden)]
#[macro_export]
macro_rules! key_segment {
    ({ $($name:literal => $value:tt),* $(,)? }) => {{
        let mut map = ::std::collections::BTreeMap::new();
        $(map.insert(::std::string::String::from($name), $crate::key_segment!($value));)*
        $crate::KeyValue::Map(map)
    }};
    ([ $($item:tt),* $(,)? ]) => {
        $crate::KeyValue::List(vec![$($crate::key_segment!($item)),*])
    };
    ($value:expr) => {
        $crate::KeyValue::from($value)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ignores_map_entry_order() {
        let a = key!["todos", { "a" => 1, "b" => 2 }];
        let b = key!["todos", { "b" => 2, "a" => 1 }];
        assert_eq!(a.hash_str(), b.hash_str());
    }

    #[test]
    fn hash_preserves_list_order() {
        assert_ne!(key![1, 2].hash_str(), key![2, 1].hash_str());
    }

    #[test]
    fn hash_distinguishes_list_from_map() {
        assert_ne!(key![["a"]].hash_str(), key![{ "0" => "a" }].hash_str());
    }

    #[test]
    fn hash_distinguishes_int_from_float() {
        assert_ne!(key![1].hash_str(), key![1.0].hash_str());
    }

    #[test]
    fn wrapping_changes_identity() {
        let plain = key!["todos"];
        let wrapped = key![["todos"]];
        assert_ne!(plain.hash_str(), wrapped.hash_str());
        assert!(!wrapped.partial_match(&plain));
        assert!(!plain.matches(&wrapped, true));
    }

    #[test]
    fn partial_match_is_prefix_over_segments() {
        let candidate = key!["posts", 1];
        assert!(key!["posts"].partial_match(&candidate));
        assert!(key!["posts", 1].partial_match(&candidate));
        assert!(!key!["posts", 1, "comments"].partial_match(&candidate));
        assert!(!key!["todos"].partial_match(&candidate));
    }

    #[test]
    fn partial_match_uses_map_subsets() {
        let candidate = key![{ "a" => "a", "b" => "b" }];
        assert!(key![{ "a" => "a" }].partial_match(&candidate));
        assert!(key![{ "b" => "b" }].partial_match(&candidate));
        assert!(key![{ "a" => "a", "b" => "b" }].partial_match(&candidate));
        assert!(!key![{ "a" => "a", "b" => "b", "c" => "c" }].partial_match(&candidate));
        assert!(!key![{ "a" => "b" }].partial_match(&candidate));
    }

    #[test]
    fn partial_match_recurses_into_nested_values() {
        let candidate = key!["filters", { "range" => [1, 10], "flags" => { "x" => true, "y" => false } }];
        assert!(key!["filters", { "flags" => { "x" => true } }].partial_match(&candidate));
        assert!(key!["filters", { "range" => [1] }].partial_match(&candidate));
        assert!(!key!["filters", { "range" => [10] }].partial_match(&candidate));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(key![].partial_match(&key!["anything", 1]));
    }

    #[test]
    fn exact_match_compares_hashes() {
        let key = key!["todos", { "status" => "done" }];
        let same = key!["todos", { "status" => "done" }];
        let other = key!["todos", { "status" => "open" }];
        assert!(key.matches(&same, true));
        assert!(!key.matches(&other, true));
    }
}
