//! # Update modifiers
//!
//! A [`Modifier`] is either a replacement document or a set of `$`
//! operators, compiled once and then applied to documents.
//!
//! Application is atomic per document: operators run against a copy that
//! only replaces the original when every operator succeeded, so a failing
//! `$inc` on a string leaves the stored document untouched.
//!
//! [`Modifier::modified_paths`] reports which paths an operator modifier
//! can touch; live queries use it to skip re-matching when a write cannot
//! affect their selector or sort.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::path::is_numeric_key;
use crate::selector::Matcher;
use crate::sorter::Sorter;
use crate::value::{Document, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Set,
    SetOnInsert,
    Unset,
    Inc,
    Mul,
    Min,
    Max,
    Rename,
    CurrentDate,
    Push,
    AddToSet,
    Pop,
    Pull,
    PullAll,
}

impl OpKind {
    fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "$set" => OpKind::Set,
            "$setOnInsert" => OpKind::SetOnInsert,
            "$unset" => OpKind::Unset,
            "$inc" => OpKind::Inc,
            "$mul" => OpKind::Mul,
            "$min" => OpKind::Min,
            "$max" => OpKind::Max,
            "$rename" => OpKind::Rename,
            "$currentDate" => OpKind::CurrentDate,
            "$push" => OpKind::Push,
            "$addToSet" => OpKind::AddToSet,
            "$pop" => OpKind::Pop,
            "$pull" => OpKind::Pull,
            "$pullAll" => OpKind::PullAll,
            other => return Err(Error::MalformedModifier(format!("Invalid modifier specified {other}"))),
        })
    }
}

#[derive(Debug, Clone)]
enum PullCondition {
    Equal(Value),
    Document(Matcher),
    Element(Matcher),
}

impl PullCondition {
    fn compile(arg: &Value) -> Result<Self> {
        let Value::Object(obj) = arg else {
            return Ok(PullCondition::Equal(arg.clone()));
        };
        let wrap_err = |e: Error| match e {
            Error::MalformedSelector(m) => Error::MalformedModifier(format!("bad $pull condition: {m}")),
            other => other,
        };
        if !obj.is_empty() && obj.keys().all(|k| k.starts_with('$')) {
            let mut wrapped = Document::new();
            wrapped.insert("v".into(), arg.clone());
            Matcher::new(&Value::Object(wrapped)).map(PullCondition::Element).map_err(wrap_err)
        } else {
            Matcher::new(arg).map(PullCondition::Document).map_err(wrap_err)
        }
    }

    fn matches(&self, element: &Value) -> bool {
        match self {
            PullCondition::Equal(v) => v.equals_ordered(element),
            PullCondition::Document(m) => element.as_object().map(|o| m.matches(o)).unwrap_or(false),
            PullCondition::Element(m) => {
                let mut wrapped = Document::new();
                wrapped.insert("v".into(), element.clone());
                m.matches(&wrapped)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Operation {
    kind: OpKind,
    path: String,
    parts: Vec<String>,
    arg: Value,
    pull: Option<PullCondition>,
}

#[derive(Debug, Clone)]
enum Kind {
    Replace(Document),
    Operators(Vec<Operation>),
}

#[derive(Debug, Clone)]
pub struct Modifier {
    kind: Kind,
}

fn split_path(path: &str) -> Result<Vec<String>> {
    let parts: Vec<String> = path.split('.').map(str::to_string).collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(Error::MalformedModifier(format!("The update path '{path}' contains an empty field name")));
    }
    if parts.iter().any(|p| p.starts_with('$')) {
        return Err(Error::MalformedModifier(format!("The update path '{path}' uses an unsupported $ operator")));
    }
    Ok(parts)
}

impl Modifier {
    pub fn new(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| Error::MalformedModifier(format!("Modifier must be an object, got {spec}")))?;
        let operator_keys = obj.keys().filter(|k| k.starts_with('$')).count();
        if operator_keys == 0 {
            for key in obj.keys() {
                if key.contains('.') {
                    return Err(Error::MalformedModifier(format!(
                        "Key {key} must not contain '.' in a replacement document"
                    )));
                }
            }
            return Ok(Modifier { kind: Kind::Replace(obj.clone()) });
        }
        if operator_keys != obj.len() {
            return Err(Error::MalformedModifier(
                "Update parameter cannot have both modifier and non-modifier fields".into(),
            ));
        }

        let mut ops = Vec::new();
        for (name, fields) in obj {
            let kind = OpKind::parse(name)?;
            let fields = fields
                .as_object()
                .ok_or_else(|| Error::MalformedModifier(format!("Modifier {name}'s argument must be an object")))?;
            for (path, arg) in fields {
                let parts = split_path(path)?;
                match kind {
                    OpKind::Inc | OpKind::Mul if !matches!(arg, Value::Number(_)) => {
                        return Err(Error::MalformedModifier(format!("Modifier {name} allowed for numbers only")))
                    }
                    OpKind::Pop if !matches!(arg, Value::Number(_)) => {
                        return Err(Error::MalformedModifier("Modifier $pop needs a number".into()))
                    }
                    OpKind::PullAll if !matches!(arg, Value::Array(_)) => {
                        return Err(Error::MalformedModifier("Modifier $pullAll allowed for arrays only".into()))
                    }
                    OpKind::Rename => {
                        let target = arg
                            .as_str()
                            .ok_or_else(|| Error::MalformedModifier("$rename target must be a string".into()))?;
                        split_path(target)?;
                        if target == path {
                            return Err(Error::MalformedModifier("$rename source must differ from target".into()));
                        }
                    }
                    _ => {}
                }
                let pull = if kind == OpKind::Pull { Some(PullCondition::compile(arg)?) } else { None };
                ops.push(Operation { kind, path: path.clone(), parts, arg: arg.clone(), pull });
            }
        }
        Ok(Modifier { kind: Kind::Operators(ops) })
    }

    pub fn is_replacement(&self) -> bool {
        matches!(self.kind, Kind::Replace(_))
    }

    /// Paths this modifier may write. `None` for replacements, which may
    /// touch anything.
    pub fn modified_paths(&self) -> Option<Vec<String>> {
        match &self.kind {
            Kind::Replace(_) => None,
            Kind::Operators(ops) => {
                let mut paths = Vec::with_capacity(ops.len());
                for op in ops {
                    paths.push(op.path.clone());
                    if let (OpKind::Rename, Value::String(target)) = (op.kind, &op.arg) {
                        paths.push(target.clone());
                    }
                }
                Some(paths)
            }
        }
    }

    /// Apply to `doc` in place. `is_insert` enables `$setOnInsert`.
    pub fn apply(&self, doc: &mut Document, is_insert: bool) -> Result<()> {
        let original_id = doc.get("_id").cloned();
        let mut updated = match &self.kind {
            Kind::Replace(replacement) => {
                let mut updated = replacement.clone();
                if let Some(id) = &original_id {
                    match updated.get("_id") {
                        Some(new_id) if new_id != id => {
                            return Err(Error::MalformedModifier("The _id field cannot be changed".into()))
                        }
                        _ => {
                            updated.shift_remove("_id");
                            updated.shift_insert(0, "_id".to_string(), id.clone());
                        }
                    }
                }
                updated
            }
            Kind::Operators(ops) => {
                let mut updated = doc.clone();
                for op in ops {
                    apply_operation(&mut updated, op, is_insert)?;
                }
                updated
            }
        };
        if original_id.is_some() && updated.get("_id") != original_id.as_ref() {
            return Err(Error::MalformedModifier("Mod on _id not allowed".into()));
        }
        std::mem::swap(doc, &mut updated);
        Ok(())
    }

    /// Document inserted by an upsert that matched nothing: the selector's
    /// equality constraints with the modifier applied on top.
    pub fn upsert_document(&self, selector: &Value) -> Result<Document> {
        let mut seed = Document::new();
        match selector {
            Value::String(_) | Value::Number(_) => {
                seed.insert("_id".into(), selector.clone());
            }
            Value::Object(sel) => collect_equalities(sel, &mut seed)?,
            _ => {}
        }
        match &self.kind {
            Kind::Replace(replacement) => {
                let mut doc = replacement.clone();
                if !doc.contains_key("_id") {
                    if let Some(id) = seed.get("_id") {
                        doc.shift_insert(0, "_id".to_string(), id.clone());
                    }
                }
                Ok(doc)
            }
            Kind::Operators(_) => {
                self.apply(&mut seed, true)?;
                Ok(seed)
            }
        }
    }
}

fn collect_equalities(sel: &Document, out: &mut Document) -> Result<()> {
    for (key, value) in sel {
        if key == "$and" {
            for clause in value.as_array().into_iter().flatten() {
                if let Value::Object(o) = clause {
                    collect_equalities(o, out)?;
                }
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }
        let literal = match value {
            Value::Object(o) if o.keys().next().map(|k| k.starts_with('$')).unwrap_or(false) => {
                match o.get("$eq") {
                    Some(v) => v.clone(),
                    None => continue,
                }
            }
            other => other.clone(),
        };
        let parts = split_path(key)?;
        if let Some(mut target) = find_target(out, &parts, true)? {
            target.set(&parts[parts.len() - 1], literal)?;
        }
    }
    Ok(())
}

enum Target<'a> {
    Object(&'a mut Document),
    Array(&'a mut Vec<Value>),
}

fn array_index(key: &str) -> Option<usize> {
    if is_numeric_key(key) {
        key.parse().ok()
    } else {
        None
    }
}

fn descend(value: &mut Value) -> Option<Target<'_>> {
    match value {
        Value::Object(o) => Some(Target::Object(o)),
        Value::Array(a) => Some(Target::Array(a)),
        _ => None,
    }
}

// Walk to the container of the last path component. With `create`, missing
// intermediate objects are created; without, a missing step yields `None`.
fn find_target<'a>(doc: &'a mut Document, parts: &[String], create: bool) -> Result<Option<Target<'a>>> {
    let mut current = Target::Object(doc);
    for part in &parts[..parts.len() - 1] {
        let next = match current {
            Target::Object(obj) => {
                if !obj.contains_key(part) {
                    if !create {
                        return Ok(None);
                    }
                    obj.insert(part.clone(), Value::Object(Document::new()));
                }
                obj.get_mut(part).and_then(descend)
            }
            Target::Array(arr) => {
                let Some(index) = array_index(part) else {
                    if !create {
                        return Ok(None);
                    }
                    return Err(Error::MalformedModifier(format!(
                        "can't append to array using string field name [{part}]"
                    )));
                };
                if index >= arr.len() {
                    if !create {
                        return Ok(None);
                    }
                    pad_to(arr, index)?;
                    arr.push(Value::Object(Document::new()));
                }
                arr.get_mut(index).and_then(descend)
            }
        };
        current = match next {
            Some(t) => t,
            None if create => {
                return Err(Error::MalformedModifier(format!(
                    "cannot use the part '{part}' to traverse the element"
                )))
            }
            None => return Ok(None),
        };
    }
    Ok(Some(current))
}

impl Target<'_> {
    fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Target::Object(o) => o.get(key),
            Target::Array(a) => array_index(key).and_then(|i| a.get(i)),
        }
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        match self {
            Target::Object(o) => o.get_mut(key),
            Target::Array(a) => array_index(key).and_then(|i| a.get_mut(i)),
        }
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        match self {
            Target::Object(o) => {
                o.insert(key.to_string(), value);
            }
            Target::Array(a) => {
                let index = array_index(key).ok_or_else(|| {
                    Error::MalformedModifier(format!("can't append to array using string field name [{key}]"))
                })?;
                if index >= a.len() {
                    pad_to(a, index)?;
                    a.push(value);
                } else {
                    a[index] = value;
                }
            }
        }
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Option<Value> {
        match self {
            Target::Object(o) => o.shift_remove(key),
            // Unsetting an array slot leaves a null in place.
            Target::Array(a) => array_index(key)
                .and_then(|i| a.get_mut(i))
                .map(|slot| std::mem::replace(slot, Value::Null)),
        }
    }
}

/// Most null slots a single write may add to an array.
const MAX_ARRAY_PADDING: usize = 1_500_000;

// Fill `arr` with nulls up to (not including) `index`.
fn pad_to(arr: &mut Vec<Value>, index: usize) -> Result<()> {
    if index - arr.len() > MAX_ARRAY_PADDING {
        return Err(Error::MalformedModifier(format!(
            "can't backfill array to index {index}, more than {MAX_ARRAY_PADDING} elements"
        )));
    }
    arr.resize(index, Value::Null);
    Ok(())
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn apply_operation(doc: &mut Document, op: &Operation, is_insert: bool) -> Result<()> {
    let key = op.parts[op.parts.len() - 1].as_str();
    let creates = !matches!(op.kind, OpKind::Unset | OpKind::Pop | OpKind::Pull | OpKind::PullAll | OpKind::Rename);
    if op.kind == OpKind::SetOnInsert && !is_insert {
        return Ok(());
    }
    if op.kind == OpKind::Rename {
        return apply_rename(doc, op);
    }
    let Some(mut target) = find_target(doc, &op.parts, creates)? else {
        return Ok(());
    };
    match op.kind {
        OpKind::Set | OpKind::SetOnInsert => target.set(key, op.arg.clone()),
        OpKind::Unset => {
            target.remove(key);
            Ok(())
        }
        OpKind::Inc | OpKind::Mul => {
            let arg = op.arg.as_f64().unwrap_or_default();
            let next = match target.get(key) {
                None => if op.kind == OpKind::Inc { arg } else { 0.0 },
                Some(Value::Number(n)) => if op.kind == OpKind::Inc { n + arg } else { n * arg },
                Some(_) => {
                    return Err(Error::MalformedModifier(format!(
                        "Cannot apply {} modifier to non-number",
                        if op.kind == OpKind::Inc { "$inc" } else { "$mul" }
                    )))
                }
            };
            target.set(key, Value::Number(next))
        }
        OpKind::Min | OpKind::Max => {
            let wanted = if op.kind == OpKind::Min { Ordering::Less } else { Ordering::Greater };
            let replace = match target.get(key) {
                None => true,
                Some(current) => op.arg.compare(current) == wanted,
            };
            if replace {
                target.set(key, op.arg.clone())?;
            }
            Ok(())
        }
        OpKind::CurrentDate => {
            let ok = match &op.arg {
                Value::Bool(true) => true,
                Value::Object(o) => o.get("$type") == Some(&Value::from("date")),
                _ => false,
            };
            if !ok {
                return Err(Error::MalformedModifier("$currentDate supports true or {$type: \"date\"}".into()));
            }
            target.set(key, Value::Date(now_ms()))
        }
        OpKind::Push => apply_push(&mut target, key, &op.arg),
        OpKind::AddToSet => {
            let items = match &op.arg {
                Value::Object(o) if o.contains_key("$each") => o["$each"]
                    .as_array()
                    .cloned()
                    .ok_or_else(|| Error::MalformedModifier("$each must be an array".into()))?,
                other => vec![other.clone()],
            };
            if target.get(key).is_none() {
                target.set(key, Value::Array(Vec::new()))?;
            }
            match target.get_mut(key) {
                Some(Value::Array(arr)) => {
                    for item in items {
                        if !arr.iter().any(|x| x.equals_ordered(&item)) {
                            arr.push(item);
                        }
                    }
                    Ok(())
                }
                _ => Err(Error::MalformedModifier("Cannot apply $addToSet modifier to non-array".into())),
            }
        }
        OpKind::Pop => match target.get_mut(key) {
            None => Ok(()),
            Some(Value::Array(arr)) => {
                if op.arg.as_f64().unwrap_or_default() < 0.0 {
                    if !arr.is_empty() {
                        arr.remove(0);
                    }
                } else {
                    arr.pop();
                }
                Ok(())
            }
            Some(_) => Err(Error::MalformedModifier("Cannot apply $pop modifier to non-array".into())),
        },
        OpKind::Pull | OpKind::PullAll => match target.get_mut(key) {
            None => Ok(()),
            Some(Value::Array(arr)) => {
                if let Some(cond) = &op.pull {
                    arr.retain(|el| !cond.matches(el));
                } else if let Value::Array(remove) = &op.arg {
                    arr.retain(|el| !remove.iter().any(|r| r.equals_ordered(el)));
                }
                Ok(())
            }
            Some(_) => Err(Error::MalformedModifier("Cannot apply $pull/pullAll modifier to non-array".into())),
        },
        OpKind::Rename => Ok(()),
    }
}

fn apply_rename(doc: &mut Document, op: &Operation) -> Result<()> {
    let key = &op.parts[op.parts.len() - 1];
    let value = match find_target(doc, &op.parts, false)? {
        Some(Target::Object(o)) => o.shift_remove(key.as_str()),
        Some(Target::Array(_)) => {
            return Err(Error::MalformedModifier("$rename source may not be an array element".into()))
        }
        None => None,
    };
    let Some(value) = value else {
        return Ok(());
    };
    let target_path = op.arg.as_str().unwrap_or_default();
    let parts = split_path(target_path)?;
    match find_target(doc, &parts, true)? {
        Some(Target::Object(o)) => {
            o.insert(parts[parts.len() - 1].clone(), value);
            Ok(())
        }
        _ => Err(Error::MalformedModifier("$rename target may not be an array element".into())),
    }
}

fn apply_push(target: &mut Target<'_>, key: &str, arg: &Value) -> Result<()> {
    let (items, position, slice, sort) = match arg {
        Value::Object(o) if o.contains_key("$each") => {
            let items = o["$each"]
                .as_array()
                .cloned()
                .ok_or_else(|| Error::MalformedModifier("$each must be an array".into()))?;
            for k in o.keys() {
                if !matches!(k.as_str(), "$each" | "$position" | "$slice" | "$sort") {
                    return Err(Error::MalformedModifier(format!("Unrecognized clause in $push: {k}")));
                }
            }
            let position = o.get("$position").map(number_arg("$position")).transpose()?;
            let slice = o.get("$slice").map(number_arg("$slice")).transpose()?;
            (items, position, slice, o.get("$sort").cloned())
        }
        other => (vec![other.clone()], None, None, None),
    };

    if target.get(key).is_none() {
        target.set(key, Value::Array(Vec::new()))?;
    }
    let Some(Value::Array(arr)) = target.get_mut(key) else {
        return Err(Error::MalformedModifier("Cannot apply $push modifier to non-array".into()));
    };

    let at = match position {
        None => arr.len(),
        Some(p) if p < 0 => arr.len().saturating_sub(p.unsigned_abs() as usize),
        Some(p) => (p as usize).min(arr.len()),
    };
    arr.splice(at..at, items);

    if let Some(spec) = sort {
        match &spec {
            Value::Number(n) => {
                let ascending = *n >= 0.0;
                arr.sort_by(|a, b| if ascending { a.compare(b) } else { b.compare(a) });
            }
            Value::Object(_) => {
                let sorter = Sorter::new(&spec).map_err(|e| Error::MalformedModifier(format!("bad $sort: {e}")))?;
                let mut docs = Vec::with_capacity(arr.len());
                for item in arr.drain(..) {
                    match item {
                        Value::Object(o) => docs.push(o),
                        _ => {
                            return Err(Error::MalformedModifier(
                                "$push $sort with a document spec needs document elements".into(),
                            ))
                        }
                    }
                }
                sorter.sort(&mut docs);
                arr.extend(docs.into_iter().map(Value::Object));
            }
            _ => return Err(Error::MalformedModifier("$sort must be 1, -1 or a sort document".into())),
        }
    }

    if let Some(n) = slice {
        if n == 0 {
            arr.clear();
        } else if n < 0 {
            let keep = n.unsigned_abs() as usize;
            if arr.len() > keep {
                arr.drain(..arr.len() - keep);
            }
        } else {
            arr.truncate(n as usize);
        }
    }
    Ok(())
}

fn number_arg(name: &'static str) -> impl Fn(&Value) -> Result<i64> {
    move |v| match v {
        Value::Number(n) if n.fract() == 0.0 => Ok(*n as i64),
        _ => Err(Error::MalformedModifier(format!("{name} must be an integer"))),
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

    fn modify(d: serde_json::Value, m: serde_json::Value) -> Value {
        let mut d = doc(d);
        Modifier::new(&Value::from(m)).unwrap().apply(&mut d, false).unwrap();
        Value::Object(d)
    }

    fn modify_err(d: serde_json::Value, m: serde_json::Value) -> Error {
        let mut d = doc(d);
        Modifier::new(&Value::from(m))
            .and_then(|m| m.apply(&mut d, false))
            .unwrap_err()
    }

    #[test]
    fn test_set_unset_nested() {
        assert_eq!(modify(json!({"a": 1}), json!({"$set": {"b.c": 2}})), Value::from(json!({"a": 1, "b": {"c": 2}})));
        assert_eq!(modify(json!({"a": {"b": 1, "c": 2}}), json!({"$unset": {"a.b": 1}})), Value::from(json!({"a": {"c": 2}})));
        assert_eq!(modify(json!({"a": [1, 2]}), json!({"$set": {"a.3": 9}})), Value::from(json!({"a": [1, 2, null, 9]})));
        assert_eq!(modify(json!({"a": [1, 2]}), json!({"$unset": {"a.0": 1}})), Value::from(json!({"a": [null, 2]})));
        assert_eq!(modify(json!({}), json!({"$unset": {"x.y": 1}})), Value::from(json!({})));
    }

    #[test]
    fn test_huge_array_index_rejected() {
        assert!(matches!(modify_err(json!({"a": [1]}), json!({"$set": {"a.99999999999": 1}})), Error::MalformedModifier(_)));
        assert!(matches!(
            modify_err(json!({"a": []}), json!({"$set": {"a.99999999999.b": 1}})),
            Error::MalformedModifier(_)
        ));
        assert_eq!(modify(json!({"a": []}), json!({"$set": {"a.1.b": 1}})), Value::from(json!({"a": [null, {"b": 1}]})));
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(modify(json!({"n": 1}), json!({"$inc": {"n": 2, "m": 5}})), Value::from(json!({"n": 3, "m": 5})));
        assert_eq!(modify(json!({"n": 3}), json!({"$mul": {"n": 2, "z": 4}})), Value::from(json!({"n": 6, "z": 0})));
        assert_eq!(modify(json!({"n": 3}), json!({"$min": {"n": 1}})), Value::from(json!({"n": 1})));
        assert_eq!(modify(json!({"n": 3}), json!({"$max": {"n": 1}})), Value::from(json!({"n": 3})));
        assert!(matches!(modify_err(json!({"s": "x"}), json!({"$inc": {"s": 1}})), Error::MalformedModifier(_)));
        assert!(matches!(modify_err(json!({}), json!({"$inc": {"s": "1"}})), Error::MalformedModifier(_)));
    }

    #[test]
    fn test_failed_apply_leaves_document_untouched() {
        let mut d = doc(json!({"_id": "a", "n": 1, "s": "x"}));
        let m = Modifier::new(&Value::from(json!({"$inc": {"n": 1, "s": 1}}))).unwrap();
        assert!(m.apply(&mut d, false).is_err());
        assert_eq!(Value::Object(d), Value::from(json!({"_id": "a", "n": 1, "s": "x"})));
    }

    #[test]
    fn test_rename_and_current_date() {
        assert_eq!(modify(json!({"a": 1, "b": 2}), json!({"$rename": {"a": "c.d"}})), Value::from(json!({"b": 2, "c": {"d": 1}})));
        let out = modify(json!({}), json!({"$currentDate": {"t": true}}));
        assert!(matches!(out.get("t"), Some(Value::Date(ms)) if *ms > 0));
    }

    #[test]
    fn test_push_variants() {
        assert_eq!(modify(json!({}), json!({"$push": {"a": 1}})), Value::from(json!({"a": [1]})));
        assert_eq!(
            modify(json!({"a": [1, 2]}), json!({"$push": {"a": {"$each": [0], "$position": 0}}})),
            Value::from(json!({"a": [0, 1, 2]}))
        );
        assert_eq!(
            modify(json!({"a": [5, 1]}), json!({"$push": {"a": {"$each": [3, 9], "$sort": 1, "$slice": 3}}})),
            Value::from(json!({"a": [1, 3, 5]}))
        );
        assert_eq!(
            modify(json!({"a": [1, 2, 3]}), json!({"$push": {"a": {"$each": [4], "$slice": -2}}})),
            Value::from(json!({"a": [3, 4]}))
        );
        assert_eq!(
            modify(
                json!({"a": [{"n": 2}, {"n": 1}]}),
                json!({"$push": {"a": {"$each": [{"n": 3}], "$sort": {"n": -1}}}})
            ),
            Value::from(json!({"a": [{"n": 3}, {"n": 2}, {"n": 1}]}))
        );
        assert!(matches!(modify_err(json!({"a": 1}), json!({"$push": {"a": 1}})), Error::MalformedModifier(_)));
    }

    #[test]
    fn test_set_operations() {
        assert_eq!(
            modify(json!({"a": [1, 2]}), json!({"$addToSet": {"a": {"$each": [2, 3, 3]}}})),
            Value::from(json!({"a": [1, 2, 3]}))
        );
        assert_eq!(modify(json!({"a": [1, 2, 3]}), json!({"$pop": {"a": 1}})), Value::from(json!({"a": [1, 2]})));
        assert_eq!(modify(json!({"a": [1, 2, 3]}), json!({"$pop": {"a": -1}})), Value::from(json!({"a": [2, 3]})));
        assert_eq!(modify(json!({"a": [1, 2, 1]}), json!({"$pull": {"a": 1}})), Value::from(json!({"a": [2]})));
        assert_eq!(
            modify(json!({"a": [1, 5, 8]}), json!({"$pull": {"a": {"$gte": 5}}})),
            Value::from(json!({"a": [1]}))
        );
        assert_eq!(
            modify(json!({"a": [{"x": 1}, {"x": 2}]}), json!({"$pull": {"a": {"x": 2}}})),
            Value::from(json!({"a": [{"x": 1}]}))
        );
        assert_eq!(modify(json!({"a": [1, 2, 3]}), json!({"$pullAll": {"a": [1, 3]}})), Value::from(json!({"a": [2]})));
    }

    #[test]
    fn test_replacement_preserves_id() {
        assert_eq!(
            modify(json!({"_id": "x", "a": 1}), json!({"b": 2})),
            Value::from(json!({"_id": "x", "b": 2}))
        );
        assert!(matches!(modify_err(json!({"_id": "x"}), json!({"_id": "y"})), Error::MalformedModifier(_)));
        assert!(matches!(modify_err(json!({"_id": "x"}), json!({"$set": {"_id": "y"}})), Error::MalformedModifier(_)));
    }

    #[test]
    fn test_malformed_modifiers() {
        for bad in [
            json!({"$set": {"a": 1}, "b": 2}),
            json!({"$bogus": {"a": 1}}),
            json!({"$set": 5}),
            json!({"$set": {"a..b": 1}}),
            json!({"a.b": 1}),
            json!({"$rename": {"a": 5}}),
        ] {
            assert!(matches!(Modifier::new(&Value::from(bad.clone())), Err(Error::MalformedModifier(_))), "{bad}");
        }
    }

    #[test]
    fn test_set_on_insert_and_upsert_document() {
        let m = Modifier::new(&Value::from(json!({"$set": {"a": 1}, "$setOnInsert": {"created": true}}))).unwrap();
        let mut existing = doc(json!({"_id": "x"}));
        m.apply(&mut existing, false).unwrap();
        assert_eq!(Value::Object(existing), Value::from(json!({"_id": "x", "a": 1})));

        let inserted = m
            .upsert_document(&Value::from(json!({"owner": "u1", "n": {"$gt": 1}, "$and": [{"tag": {"$eq": "t"}}]})))
            .unwrap();
        assert_eq!(
            Value::Object(inserted),
            Value::from(json!({"owner": "u1", "tag": "t", "a": 1, "created": true}))
        );
    }

    #[test]
    fn test_modified_paths() {
        let m = Modifier::new(&Value::from(json!({"$set": {"a.b": 1}, "$rename": {"c": "d"}}))).unwrap();
        assert_eq!(m.modified_paths(), Some(vec!["a.b".to_string(), "c".to_string(), "d".to_string()]));
        assert_eq!(Modifier::new(&Value::from(json!({"x": 1}))).unwrap().modified_paths(), None);
    }
}
