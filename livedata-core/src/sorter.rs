//! Sort specifiers.
//!
//! Accepts `{a: 1, b: -1}` or `["a", ["b", "desc"]]`. When a sort path
//! resolves to several values (arrays), ascending sorts use the smallest and
//! descending sorts the largest, the way MongoDB does.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::path::{self, Node};
use crate::value::{compare_optional, Document, Value};

#[derive(Debug, Clone, PartialEq)]
struct SortPart {
    path: String,
    ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sorter {
    parts: Vec<SortPart>,
}

impl Sorter {
    pub fn new(spec: &Value) -> Result<Self> {
        let mut parts = Vec::new();
        match spec {
            Value::Object(obj) => {
                for (path, dir) in obj {
                    let ascending = match dir {
                        Value::Number(n) if *n >= 0.0 => true,
                        Value::Number(_) => false,
                        Value::String(s) => direction(s)?,
                        other => return Err(Error::MalformedSort(format!("bad direction for {path}: {other}"))),
                    };
                    parts.push(SortPart { path: path.clone(), ascending });
                }
            }
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::String(path) => parts.push(SortPart { path: path.clone(), ascending: true }),
                        Value::Array(pair) => match pair.as_slice() {
                            [Value::String(path)] => parts.push(SortPart { path: path.clone(), ascending: true }),
                            [Value::String(path), Value::String(dir)] => {
                                parts.push(SortPart { path: path.clone(), ascending: direction(dir)? })
                            }
                            _ => return Err(Error::MalformedSort(format!("bad sort entry: {item}"))),
                        },
                        other => return Err(Error::MalformedSort(format!("bad sort entry: {other}"))),
                    }
                }
            }
            other => return Err(Error::MalformedSort(format!("unsupported sort specifier: {other}"))),
        }
        for part in &parts {
            if part.path.is_empty() || part.path.split('.').any(str::is_empty) {
                return Err(Error::MalformedSort(format!("invalid sort path '{}'", part.path)));
            }
        }
        Ok(Sorter { parts })
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().map(|p| p.path.as_str())
    }

    /// Whether a write to `modified` can change a document's position.
    pub fn affected_by(&self, modified: Option<&[String]>) -> bool {
        match modified {
            None => true,
            Some(modified) => self
                .paths()
                .any(|p| modified.iter().any(|m| path::paths_overlap(p, m))),
        }
    }

    fn keys(&self, doc: &Document) -> Vec<Option<Value>> {
        self.parts.iter().map(|part| sort_key(doc, part)).collect()
    }

    fn compare_keys(&self, a: &[Option<Value>], b: &[Option<Value>]) -> Ordering {
        for (i, part) in self.parts.iter().enumerate() {
            let ord = compare_optional(a[i].as_ref(), b[i].as_ref());
            let ord = if part.ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        self.compare_keys(&self.keys(a), &self.keys(b))
    }

    /// Stable sort; documents with equal keys keep their relative order.
    pub fn sort(&self, docs: &mut Vec<Document>) {
        let mut keyed: Vec<(Vec<Option<Value>>, Document)> =
            docs.drain(..).map(|d| (self.keys(&d), d)).collect();
        keyed.sort_by(|(ka, _), (kb, _)| self.compare_keys(ka, kb));
        docs.extend(keyed.into_iter().map(|(_, d)| d));
    }
}

fn direction(s: &str) -> Result<bool> {
    match s {
        "asc" | "ascending" => Ok(true),
        "desc" | "descending" => Ok(false),
        other => Err(Error::MalformedSort(format!("unknown direction '{other}'"))),
    }
}

fn sort_key(doc: &Document, part: &SortPart) -> Option<Value> {
    let mut candidates: Vec<&Value> = Vec::new();
    for branch in path::lookup(Node::Object(doc), &part.path, true) {
        match branch.value {
            Some(Value::Array(items)) if !branch.dont_iterate => candidates.extend(items.iter()),
            Some(v) => candidates.push(v),
            None => {}
        }
    }
    candidates
        .into_iter()
        .reduce(|best, v| {
            let ord = v.compare(best);
            let better = if part.ascending { ord == Ordering::Less } else { ord == Ordering::Greater };
            if better { v } else { best }
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs(items: serde_json::Value) -> Vec<Document> {
        items
            .as_array()
            .unwrap()
            .iter()
            .map(|d| match Value::from(d.clone()) {
                Value::Object(o) => o,
                _ => unreachable!(),
            })
            .collect()
    }

    fn ids(docs: &[Document]) -> Vec<i64> {
        docs.iter().map(|d| d["_id"].as_f64().unwrap() as i64).collect()
    }

    #[test]
    fn test_multi_key_sort() {
        let sorter = Sorter::new(&Value::from(json!({"a": 1, "b": -1}))).unwrap();
        let mut d = docs(json!([
            {"_id": 1, "a": 2, "b": 1},
            {"_id": 2, "a": 1, "b": 1},
            {"_id": 3, "a": 1, "b": 5},
        ]));
        sorter.sort(&mut d);
        assert_eq!(ids(&d), vec![3, 2, 1]);
    }

    #[test]
    fn test_array_form_and_cross_type() {
        let sorter = Sorter::new(&Value::from(json!([["a", "desc"]]))).unwrap();
        let mut d = docs(json!([
            {"_id": 1, "a": "x"},
            {"_id": 2},
            {"_id": 3, "a": null},
            {"_id": 4, "a": 10},
        ]));
        sorter.sort(&mut d);
        assert_eq!(ids(&d), vec![1, 4, 3, 2]);
    }

    #[test]
    fn test_array_values_use_min_or_max() {
        let asc = Sorter::new(&Value::from(json!({"a": 1}))).unwrap();
        let desc = Sorter::new(&Value::from(json!({"a": -1}))).unwrap();
        let mut d = docs(json!([
            {"_id": 1, "a": [1, 10]},
            {"_id": 2, "a": [5]},
        ]));
        asc.sort(&mut d);
        assert_eq!(ids(&d), vec![1, 2]);
        desc.sort(&mut d);
        assert_eq!(ids(&d), vec![1, 2]);
        let mut d = docs(json!([{"_id": 1, "a": [1, 4]}, {"_id": 2, "a": [5]}]));
        desc.sort(&mut d);
        assert_eq!(ids(&d), vec![2, 1]);
    }

    #[test]
    fn test_sort_is_stable() {
        let sorter = Sorter::new(&Value::from(json!({"k": 1}))).unwrap();
        let mut d = docs(json!([{"_id": 1, "k": 0}, {"_id": 2, "k": 0}, {"_id": 3, "k": -1}]));
        sorter.sort(&mut d);
        assert_eq!(ids(&d), vec![3, 1, 2]);
    }

    #[test]
    fn test_malformed() {
        assert!(Sorter::new(&Value::from(json!({"a": "sideways"}))).is_err());
        assert!(Sorter::new(&Value::from(json!([1]))).is_err());
        assert!(Sorter::new(&Value::from(json!({"a..b": 1}))).is_err());
        assert!(Sorter::new(&Value::from(5)).is_err());
    }
}
