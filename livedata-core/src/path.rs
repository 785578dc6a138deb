//! Dotted-path lookup into documents.
//!
//! A path like `a.b` can resolve to several values when it crosses arrays:
//! `{a: [{b: 1}, {b: 2}]}` yields both `1` and `2`. Each resolved value is a
//! [`Branch`]; selectors match if any branch matches and sorts pick the
//! extreme branch.
//!
//! Rules:
//!
//! - A numeric part indexes into an array (`a.0.b`). A non-numeric or
//!   out-of-range part against an array yields no branches at all.
//! - When an intermediate value is an array, lookup continues both through
//!   the explicit index (if the next part is numeric) and into every plain
//!   object element. Sort lookups skip the element fan-out for numeric parts.
//! - Digging past a scalar yields a single missing branch, unless the scalar
//!   was reached through an explicit array index.

use crate::value::{Document, Value};

/// One value reached by a path lookup. `value` is `None` when missing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Branch<'a> {
    pub value: Option<&'a Value>,
    /// The value is an array found by explicit index into an outer array;
    /// matchers must treat it as a whole instead of iterating it.
    pub dont_iterate: bool,
}

/// Root of a lookup: documents are objects, `$elemMatch` may also look into
/// array elements.
#[derive(Debug, Clone, Copy)]
pub enum Node<'a> {
    Object(&'a Document),
    Array(&'a [Value]),
}

impl<'a> Node<'a> {
    pub fn from_value(value: &'a Value) -> Option<Self> {
        match value {
            Value::Object(o) => Some(Node::Object(o)),
            Value::Array(a) => Some(Node::Array(a)),
            _ => None,
        }
    }
}

impl<'a> From<&'a Document> for Node<'a> {
    fn from(doc: &'a Document) -> Self {
        Node::Object(doc)
    }
}

pub fn is_numeric_key(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
}

/// Resolve `path` against `root`.
pub fn lookup<'a>(root: Node<'a>, path: &str, for_sort: bool) -> Vec<Branch<'a>> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    lookup_parts(root, &parts, for_sort, &mut out);
    out
}

fn lookup_parts<'a>(node: Node<'a>, parts: &[&str], for_sort: bool, out: &mut Vec<Branch<'a>>) {
    let first = parts[0];
    let (first_level, node_is_array) = match node {
        Node::Object(o) => (o.get(first), false),
        Node::Array(items) => {
            let index = if is_numeric_key(first) { first.parse::<usize>().ok() } else { None };
            match index.and_then(|i| items.get(i)) {
                Some(v) => (Some(v), true),
                None => return,
            }
        }
    };

    if parts.len() == 1 {
        out.push(Branch {
            value: first_level,
            dont_iterate: node_is_array && matches!(first_level, Some(Value::Array(_))),
        });
        return;
    }

    let next = match first_level.and_then(Node::from_value) {
        Some(next) => next,
        None => {
            if !node_is_array {
                out.push(Branch { value: None, dont_iterate: false });
            }
            return;
        }
    };

    let rest = &parts[1..];
    lookup_parts(next, rest, for_sort, out);

    if let Node::Array(items) = next {
        if !(for_sort && is_numeric_key(rest[0])) {
            for item in items {
                if let Value::Object(o) = item {
                    lookup_parts(Node::Object(o), rest, for_sort, out);
                }
            }
        }
    }
}

/// Plain nested field access without array fan-out.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(o) => o.get(part)?,
            Value::Array(a) if is_numeric_key(part) => a.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Path with numeric components removed, for conservative overlap checks.
pub(crate) fn strip_numeric(path: &str) -> String {
    path.split('.')
        .filter(|p| !is_numeric_key(p))
        .collect::<Vec<_>>()
        .join(".")
}

/// Whether changing one path may change the value read at the other.
pub(crate) fn paths_overlap(a: &str, b: &str) -> bool {
    let (a, b) = (strip_numeric(a), strip_numeric(b));
    a == b || a.starts_with(&format!("{b}.")) || b.starts_with(&format!("{a}."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(j: serde_json::Value) -> Document {
        match Value::from(j) {
            Value::Object(o) => o,
            _ => unreachable!(),
        }
    }

    fn values(root: &Document, path: &str) -> Vec<Option<Value>> {
        lookup(Node::Object(root), path, false)
            .into_iter()
            .map(|b| b.value.cloned())
            .collect()
    }

    #[test]
    fn test_simple_and_missing() {
        let d = doc(json!({"a": {"b": 1}}));
        assert_eq!(values(&d, "a.b"), vec![Some(Value::from(1))]);
        assert_eq!(values(&d, "x"), vec![None]);
        assert_eq!(values(&d, "a.b.c"), vec![None]);
    }

    #[test]
    fn test_branches_into_array_elements() {
        let d = doc(json!({"a": [{"b": 1}, {"b": 2}, 5]}));
        assert_eq!(values(&d, "a.b"), vec![Some(Value::from(1)), Some(Value::from(2))]);
    }

    #[test]
    fn test_numeric_index() {
        let d = doc(json!({"a": [{"b": 1}, {"b": 2}]}));
        assert_eq!(values(&d, "a.1.b"), vec![Some(Value::from(2))]);
        assert!(values(&d, "a.5.b").iter().all(Option::is_none));
        // Digging past a scalar reached by index yields nothing.
        let d = doc(json!({"a": [5]}));
        assert!(values(&d, "a.0.b").is_empty());
    }

    #[test]
    fn test_explicit_index_to_nested_array_is_not_iterated() {
        let d = doc(json!({"a": [[5]]}));
        let branches = lookup(Node::Object(&d), "a.0", false);
        assert!(branches.iter().any(|b| b.dont_iterate));
    }

    #[test]
    fn test_get_path() {
        let d = doc(json!({"a": {"b": [10, {"c": 3}]}}));
        assert_eq!(get_path(&d, "a.b.1.c"), Some(&Value::from(3)));
        assert_eq!(get_path(&d, "a.z"), None);
    }

    #[test]
    fn test_paths_overlap() {
        assert!(paths_overlap("a", "a.b"));
        assert!(paths_overlap("a.0.b", "a.b"));
        assert!(!paths_overlap("a.b", "a.c"));
        assert!(!paths_overlap("ab", "a"));
    }
}
