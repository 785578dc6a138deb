//! # Selector compiler
//!
//! Compiles a MongoDB-style selector document into a [`Matcher`] once, so
//! repeated matching against documents does no parsing.
//!
//! ```text
//! {a: 1, b: {$gt: 2}, $or: [{c: null}, {"d.e": {$in: [1, 2]}}]}
//!        │                    │
//!        ▼                    ▼
//!  DocMatcher::And ─┬─ Field(a, Equality)
//!                   ├─ Field(b, Compare(Gt))
//!                   └─ Or ─┬─ Field(c, Equality(null))
//!                          └─ Field(d.e, In)
//! ```
//!
//! Field matchers see every [`Branch`] a dotted path resolves to and match
//! if any branch does. Arrays found at the leaf are also matched element by
//! element, except for `$size` and `$elemMatch` which look at the array
//! itself.

use std::cmp::Ordering;

use regex::Regex;

use crate::error::{Error, Result};
use crate::path::{self, Branch, Node};
use crate::value::{Document, Value};

#[derive(Debug, Clone)]
enum DocMatcher {
    Everything,
    Nothing,
    And(Vec<DocMatcher>),
    Or(Vec<DocMatcher>),
    Nor(Vec<DocMatcher>),
    Field { path: String, matcher: ValueMatcher },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CmpOp {
    fn accepts(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Lte => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Gte => ord != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone)]
enum ElemMatch {
    Value(Box<ValueMatcher>),
    Document(Box<DocMatcher>),
}

#[derive(Debug, Clone)]
enum ValueMatcher {
    And(Vec<ValueMatcher>),
    Not(Box<ValueMatcher>),
    Nothing,
    Equality(Value),
    In(Vec<Value>),
    Compare(CmpOp, Value),
    Exists(bool),
    Size(usize),
    Type(i64),
    Mod(f64, f64),
    Regex(Regex),
    ElemMatch(ElemMatch),
}

/// A compiled selector.
#[derive(Debug, Clone)]
pub struct Matcher {
    root: DocMatcher,
    paths: Vec<String>,
    id: Option<Value>,
}

impl Matcher {
    /// Compile a selector. Strings and numbers select by `_id`; `null` and
    /// selectors with a falsy `_id` match nothing.
    pub fn new(selector: &Value) -> Result<Self> {
        match selector {
            Value::String(_) | Value::Number(_) => Ok(Self::for_id(selector.clone())),
            Value::Null => Ok(Matcher { root: DocMatcher::Nothing, paths: Vec::new(), id: None }),
            Value::Object(sel) => {
                if let Some(id) = sel.get("_id") {
                    if !id.is_truthy() {
                        return Ok(Matcher {
                            root: DocMatcher::Nothing,
                            paths: vec!["_id".into()],
                            id: None,
                        });
                    }
                }
                let mut paths = Vec::new();
                let root = compile_document(sel, &mut paths)?;
                let id = match (sel.len(), sel.get("_id")) {
                    (1, Some(id @ (Value::String(_) | Value::Number(_)))) => Some(id.clone()),
                    _ => None,
                };
                Ok(Matcher { root, paths, id })
            }
            other => Err(Error::MalformedSelector(format!("invalid selector: {other}"))),
        }
    }

    pub fn everything() -> Self {
        Matcher { root: DocMatcher::Everything, paths: Vec::new(), id: None }
    }

    pub fn for_id(id: Value) -> Self {
        Matcher {
            root: DocMatcher::Field { path: "_id".into(), matcher: ValueMatcher::Equality(id.clone()) },
            paths: vec!["_id".into()],
            id: Some(id),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.root.matches(Node::Object(doc))
    }

    /// Every top-level path the selector reads.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// The id when the selector is exactly `{_id: <scalar>}`.
    pub fn single_id(&self) -> Option<&Value> {
        self.id.as_ref()
    }

    /// Whether writing to any of `modified` can change this selector's
    /// verdict. `None` means every field may have changed.
    pub fn affected_by(&self, modified: Option<&[String]>) -> bool {
        match modified {
            None => true,
            Some(modified) => self
                .paths
                .iter()
                .any(|p| modified.iter().any(|m| path::paths_overlap(p, m))),
        }
    }
}

fn is_operator_object(value: &Value) -> Result<bool> {
    let Some(obj) = value.as_object() else {
        return Ok(false);
    };
    let mut result = None;
    for key in obj.keys() {
        let this = key.starts_with('$');
        match result {
            None => result = Some(this),
            Some(prev) if prev != this => {
                return Err(Error::MalformedSelector(format!(
                    "Inconsistent operator: {value}"
                )))
            }
            _ => {}
        }
    }
    Ok(result.unwrap_or(false))
}

fn compile_document(sel: &Document, paths: &mut Vec<String>) -> Result<DocMatcher> {
    let mut parts = Vec::with_capacity(sel.len());
    for (key, sub) in sel {
        if let Some(op) = key.strip_prefix('$') {
            match op {
                "and" => parts.push(DocMatcher::And(compile_logical(key, sub, paths)?)),
                "or" => parts.push(DocMatcher::Or(compile_logical(key, sub, paths)?)),
                "nor" => parts.push(DocMatcher::Nor(compile_logical(key, sub, paths)?)),
                "comment" => {}
                _ => {
                    return Err(Error::MalformedSelector(format!(
                        "Unrecognized logical operator: {key}"
                    )))
                }
            }
        } else {
            paths.push(key.clone());
            parts.push(DocMatcher::Field {
                path: key.clone(),
                matcher: compile_value(sub)?,
            });
        }
    }
    Ok(match parts.len() {
        0 => DocMatcher::Everything,
        1 => parts.remove(0),
        _ => DocMatcher::And(parts),
    })
}

fn compile_logical(key: &str, sub: &Value, paths: &mut Vec<String>) -> Result<Vec<DocMatcher>> {
    let items = sub
        .as_array()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| Error::MalformedSelector(format!("{key} must be a nonempty array")))?;
    items
        .iter()
        .map(|item| match item {
            Value::Object(o) => compile_document(o, paths),
            other => Err(Error::MalformedSelector(format!("{key} entries must be objects, got {other}"))),
        })
        .collect()
}

fn compile_value(operand: &Value) -> Result<ValueMatcher> {
    let obj = match operand {
        Value::Object(obj) if is_operator_object(operand)? => obj,
        _ => return Ok(ValueMatcher::Equality(operand.clone())),
    };
    let mut matchers = Vec::new();
    for (op, arg) in obj {
        let m = match op.as_str() {
            "$eq" => ValueMatcher::Equality(arg.clone()),
            "$ne" => ValueMatcher::Not(Box::new(ValueMatcher::Equality(arg.clone()))),
            "$in" => ValueMatcher::In(array_operand(op, arg)?),
            "$nin" => ValueMatcher::Not(Box::new(ValueMatcher::In(array_operand(op, arg)?))),
            "$gt" => compare(CmpOp::Gt, arg),
            "$gte" => compare(CmpOp::Gte, arg),
            "$lt" => compare(CmpOp::Lt, arg),
            "$lte" => compare(CmpOp::Lte, arg),
            "$exists" => ValueMatcher::Exists(arg.is_truthy()),
            "$size" => ValueMatcher::Size(size_operand(arg)?),
            "$type" => ValueMatcher::Type(type_operand(arg)?),
            "$mod" => {
                let pair = array_operand(op, arg)?;
                match pair.as_slice() {
                    [Value::Number(d), Value::Number(r)] if *d != 0.0 => ValueMatcher::Mod(*d, *r),
                    _ => {
                        return Err(Error::MalformedSelector(
                            "$mod requires [divisor, remainder] with a nonzero divisor".into(),
                        ))
                    }
                }
            }
            "$all" => {
                let items = array_operand(op, arg)?;
                if items.is_empty() {
                    ValueMatcher::Nothing
                } else {
                    let mut all = Vec::with_capacity(items.len());
                    for item in items {
                        if is_operator_object(&item)? {
                            return Err(Error::MalformedSelector("no $ expressions in $all".into()));
                        }
                        all.push(ValueMatcher::Equality(item));
                    }
                    ValueMatcher::And(all)
                }
            }
            "$regex" => ValueMatcher::Regex(compile_regex(arg, obj.get("$options"))?),
            "$options" => {
                if !obj.contains_key("$regex") {
                    return Err(Error::MalformedSelector("$options needs a $regex".into()));
                }
                continue;
            }
            "$not" => {
                if !is_operator_object(arg)? {
                    return Err(Error::MalformedSelector("$not needs an operator object".into()));
                }
                ValueMatcher::Not(Box::new(compile_value(arg)?))
            }
            "$elemMatch" => {
                let inner = match arg {
                    Value::Object(_) if is_operator_object(arg)? => {
                        ElemMatch::Value(Box::new(compile_value(arg)?))
                    }
                    Value::Object(o) => {
                        let mut ignored = Vec::new();
                        ElemMatch::Document(Box::new(compile_document(o, &mut ignored)?))
                    }
                    _ => return Err(Error::MalformedSelector("$elemMatch needs an object".into())),
                };
                ValueMatcher::ElemMatch(inner)
            }
            other => return Err(Error::MalformedSelector(format!("Unrecognized operator: {other}"))),
        };
        matchers.push(m);
    }
    Ok(if matchers.len() == 1 { matchers.remove(0) } else { ValueMatcher::And(matchers) })
}

fn compare(op: CmpOp, arg: &Value) -> ValueMatcher {
    match arg {
        Value::Array(_) => ValueMatcher::Nothing,
        _ => ValueMatcher::Compare(op, arg.clone()),
    }
}

fn array_operand(op: &str, arg: &Value) -> Result<Vec<Value>> {
    arg.as_array()
        .cloned()
        .ok_or_else(|| Error::MalformedSelector(format!("{op} needs an array")))
}

fn size_operand(arg: &Value) -> Result<usize> {
    match arg {
        Value::String(_) => Ok(0),
        Value::Number(n) if *n >= 0.0 && n.fract() == 0.0 => Ok(*n as usize),
        Value::Number(_) => Ok(usize::MAX),
        _ => Err(Error::MalformedSelector("$size needs a number".into())),
    }
}

fn type_operand(arg: &Value) -> Result<i64> {
    match arg {
        Value::Number(n) => Ok(*n as i64),
        Value::String(alias) => match alias.as_str() {
            "double" | "number" => Ok(1),
            "string" => Ok(2),
            "object" => Ok(3),
            "array" => Ok(4),
            "binData" => Ok(5),
            "bool" => Ok(8),
            "date" => Ok(9),
            "null" => Ok(10),
            other => Err(Error::MalformedSelector(format!("unknown $type alias: {other}"))),
        },
        _ => Err(Error::MalformedSelector("$type needs a number or alias".into())),
    }
}

fn compile_regex(pattern: &Value, options: Option<&Value>) -> Result<Regex> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| Error::MalformedSelector("$regex needs a string".into()))?;
    let flags: String = match options {
        None => String::new(),
        Some(Value::String(o)) => o.chars().filter(|c| matches!(c, 'i' | 'm' | 's' | 'x')).collect(),
        Some(_) => return Err(Error::MalformedSelector("$options needs a string".into())),
    };
    let source = if flags.is_empty() { pattern.to_string() } else { format!("(?{flags}){pattern}") };
    Regex::new(&source).map_err(|e| Error::MalformedSelector(format!("bad $regex: {e}")))
}

impl DocMatcher {
    fn matches(&self, node: Node<'_>) -> bool {
        match self {
            DocMatcher::Everything => true,
            DocMatcher::Nothing => false,
            DocMatcher::And(all) => all.iter().all(|m| m.matches(node)),
            DocMatcher::Or(any) => any.iter().any(|m| m.matches(node)),
            DocMatcher::Nor(none) => !none.iter().any(|m| m.matches(node)),
            DocMatcher::Field { path, matcher } => matcher.matches(&path::lookup(node, path, false)),
        }
    }
}

// Apply an element-level test over branches, expanding leaf arrays.
fn any_element(branches: &[Branch<'_>], expand: bool, f: impl Fn(Option<&Value>) -> bool) -> bool {
    branches.iter().any(|branch| match branch.value {
        Some(Value::Array(items)) if expand && !branch.dont_iterate => {
            items.iter().any(|item| f(Some(item))) || f(branch.value)
        }
        value => f(value),
    })
}

fn equal_element(operand: &Value, value: Option<&Value>) -> bool {
    match (operand, value) {
        (Value::Null, None) | (Value::Null, Some(Value::Null)) => true,
        (_, Some(v)) => operand.equals_ordered(v),
        _ => false,
    }
}

impl ValueMatcher {
    fn matches(&self, branches: &[Branch<'_>]) -> bool {
        match self {
            ValueMatcher::And(all) => all.iter().all(|m| m.matches(branches)),
            ValueMatcher::Not(inner) => !inner.matches(branches),
            ValueMatcher::Nothing => false,
            ValueMatcher::Exists(wanted) => branches.iter().any(|b| b.value.is_some()) == *wanted,
            ValueMatcher::Equality(operand) => any_element(branches, true, |v| equal_element(operand, v)),
            ValueMatcher::In(options) => {
                any_element(branches, true, |v| options.iter().any(|o| equal_element(o, v)))
            }
            ValueMatcher::Compare(op, operand) => any_element(branches, true, |v| {
                let v = v.unwrap_or(&Value::Null);
                v.type_order() == operand.type_order() && op.accepts(v.compare(operand))
            }),
            ValueMatcher::Size(n) => any_element(branches, false, |v| {
                matches!(v, Some(Value::Array(items)) if items.len() == *n)
            }),
            ValueMatcher::Type(code) => {
                any_element(branches, true, |v| v.map(|v| v.type_code() == *code).unwrap_or(false))
            }
            ValueMatcher::Mod(divisor, remainder) => any_element(branches, true, |v| {
                matches!(v, Some(Value::Number(n)) if n % divisor == *remainder)
            }),
            ValueMatcher::Regex(re) => any_element(branches, true, |v| {
                matches!(v, Some(Value::String(s)) if re.is_match(s))
            }),
            ValueMatcher::ElemMatch(inner) => any_element(branches, false, |v| {
                let Some(Value::Array(items)) = v else {
                    return false;
                };
                items.iter().any(|item| match inner {
                    ElemMatch::Value(m) => m.matches(&[Branch { value: Some(item), dont_iterate: true }]),
                    ElemMatch::Document(m) => Node::from_value(item).map(|n| m.matches(n)).unwrap_or(false),
                })
            }),
        }
    }
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

    fn matches(selector: serde_json::Value, d: serde_json::Value) -> bool {
        Matcher::new(&Value::from(selector)).unwrap().matches(&doc(d))
    }

    #[test]
    fn test_equality_and_arrays() {
        assert!(matches(json!({}), json!({"a": 1})));
        assert!(matches(json!({"a": 1}), json!({"a": 1})));
        assert!(!matches(json!({"a": 1}), json!({"a": 2})));
        assert!(matches(json!({"a": 1}), json!({"a": [3, 1]})));
        assert!(matches(json!({"a": [1, 2]}), json!({"a": [1, 2]})));
        assert!(!matches(json!({"a": [1, 2]}), json!({"a": [2, 1]})));
        assert!(matches(json!({"a": {"b": 1}}), json!({"a": {"b": 1}})));
        // Sub-document equality is key-order sensitive.
        assert!(!matches(json!({"a": {"b": 1, "c": 2}}), json!({"a": {"c": 2, "b": 1}})));
    }

    #[test]
    fn test_null_matches_missing() {
        assert!(matches(json!({"a": null}), json!({})));
        assert!(matches(json!({"a": null}), json!({"a": null})));
        assert!(!matches(json!({"a": null}), json!({"a": 0})));
        assert!(matches(json!({"a.b": null}), json!({"a": 5})));
    }

    #[test]
    fn test_dotted_paths() {
        assert!(matches(json!({"a.b": 1}), json!({"a": {"b": 1}})));
        assert!(matches(json!({"a.b": 2}), json!({"a": [{"b": 1}, {"b": 2}]})));
        assert!(matches(json!({"a.1.b": 2}), json!({"a": [{"b": 1}, {"b": 2}]})));
        assert!(!matches(json!({"a.0.b": 2}), json!({"a": [{"b": 1}, {"b": 2}]})));
        assert!(!matches(json!({"a.0": 5}), json!({"a": [[5]]})));
    }

    #[test]
    fn test_comparisons() {
        assert!(matches(json!({"a": {"$gt": 1}}), json!({"a": 2})));
        assert!(!matches(json!({"a": {"$gt": 1}}), json!({"a": 1})));
        assert!(matches(json!({"a": {"$gte": 1, "$lt": 3}}), json!({"a": [0, 2]})));
        assert!(!matches(json!({"a": {"$lt": "z"}}), json!({"a": 1})));
        assert!(matches(json!({"a": {"$lte": "b"}}), json!({"a": "a"})));
        assert!(!matches(json!({"a": {"$gt": [1]}}), json!({"a": [2]})));
    }

    #[test]
    fn test_in_nin_ne() {
        assert!(matches(json!({"a": {"$in": [1, 2]}}), json!({"a": 2})));
        assert!(matches(json!({"a": {"$in": [null]}}), json!({})));
        assert!(!matches(json!({"a": {"$nin": [1, 2]}}), json!({"a": [5, 2]})));
        assert!(matches(json!({"a": {"$ne": 1}}), json!({"a": 2})));
        assert!(!matches(json!({"a": {"$ne": 1}}), json!({"a": [1, 2]})));
        assert!(matches(json!({"a": {"$ne": 1}}), json!({})));
    }

    #[test]
    fn test_exists_size_type_mod() {
        assert!(matches(json!({"a": {"$exists": true}}), json!({"a": null})));
        assert!(!matches(json!({"a": {"$exists": true}}), json!({})));
        assert!(matches(json!({"a": {"$exists": false}}), json!({"b": 1})));
        assert!(matches(json!({"a": {"$size": 2}}), json!({"a": [1, [2, 3]]})));
        assert!(!matches(json!({"a": {"$size": 2}}), json!({"a": [[1, 2]]})));
        assert!(matches(json!({"a": {"$type": 2}}), json!({"a": "x"})));
        assert!(matches(json!({"a": {"$type": "array"}}), json!({"a": []})));
        assert!(matches(json!({"a": {"$mod": [4, 1]}}), json!({"a": 9})));
        assert!(!matches(json!({"a": {"$mod": [4, 1]}}), json!({"a": 8})));
    }

    #[test]
    fn test_all_regex_not() {
        assert!(matches(json!({"a": {"$all": [1, 3]}}), json!({"a": [1, 2, 3]})));
        assert!(!matches(json!({"a": {"$all": [1, 4]}}), json!({"a": [1, 2, 3]})));
        assert!(!matches(json!({"a": {"$all": []}}), json!({"a": []})));
        assert!(matches(json!({"a": {"$regex": "^fo+"}}), json!({"a": "foo"})));
        assert!(matches(json!({"a": {"$regex": "^FO", "$options": "i"}}), json!({"a": ["bar", "foo"]})));
        assert!(matches(json!({"a": {"$not": {"$gt": 5}}}), json!({"a": 3})));
        assert!(!matches(json!({"a": {"$not": {"$gt": 5}}}), json!({"a": 7})));
    }

    #[test]
    fn test_elem_match() {
        let d = json!({"a": [{"b": 1, "c": 2}, {"b": 2, "c": 1}]});
        assert!(matches(json!({"a": {"$elemMatch": {"b": 1, "c": 2}}}), d.clone()));
        assert!(!matches(json!({"a": {"$elemMatch": {"b": 1, "c": 1}}}), d));
        assert!(matches(json!({"a": {"$elemMatch": {"$gt": 2, "$lt": 4}}}), json!({"a": [1, 3]})));
        assert!(!matches(json!({"a": {"$elemMatch": {"$gt": 2}}}), json!({"a": 3})));
    }

    #[test]
    fn test_logical() {
        assert!(matches(json!({"$or": [{"a": 1}, {"b": 1}]}), json!({"b": 1})));
        assert!(!matches(json!({"$and": [{"a": 1}, {"b": 1}]}), json!({"b": 1})));
        assert!(matches(json!({"$nor": [{"a": 1}, {"b": 1}]}), json!({"c": 1})));
        assert!(matches(json!({"$and": [{"$or": [{"a": 1}, {"a": 2}]}, {"b": {"$exists": false}}]}), json!({"a": 2})));
    }

    #[test]
    fn test_id_shortcuts() {
        let m = Matcher::new(&Value::from("abc")).unwrap();
        assert!(m.matches(&doc(json!({"_id": "abc"}))));
        assert_eq!(m.single_id(), Some(&Value::from("abc")));
        assert!(!Matcher::new(&Value::Null).unwrap().matches(&doc(json!({"_id": "x"}))));
        assert!(!Matcher::new(&Value::from(json!({"_id": ""}))).unwrap().matches(&doc(json!({"_id": ""}))));
    }

    #[test]
    fn test_malformed_selectors() {
        for bad in [
            json!({"$where": "1"}),
            json!({"a": {"$bogus": 1}}),
            json!({"a": {"$in": 5}}),
            json!({"$or": []}),
            json!({"a": {"$gt": 1, "b": 2}}),
            json!({"a": {"$regex": "("}}),
        ] {
            assert!(
                matches!(Matcher::new(&Value::from(bad.clone())), Err(Error::MalformedSelector(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_affected_by_paths() {
        let m = Matcher::new(&Value::from(json!({"a.b": 1, "c": 2}))).unwrap();
        assert!(m.affected_by(Some(&["a".to_string()])));
        assert!(m.affected_by(Some(&["c".to_string()])));
        assert!(!m.affected_by(Some(&["d".to_string()])));
        assert!(m.affected_by(None));
    }
}
