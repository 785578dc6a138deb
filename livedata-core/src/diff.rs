//! # Diff engine
//!
//! Computes the minimal observer calls that turn one query result into
//! another. Both the client cache (when a server batch lands) and the server
//! (when a subscription is rerun for a new user) go through here.
//!
//! ## Ordered results
//!
//! The documents that keep their place are a longest increasing subsequence
//! of old positions, taken over the new result order. Everything else is
//! either new (`added_before`), gone (`removed`) or moved (`moved_before`).
//! Calls are emitted as: every `removed` first, then the new sequence is
//! walked group by group, each group ending in an unmoved anchor (or the end
//! of the list), placing group members before their anchor.
//!
//! ```text
//! old: A B C D        LIS over old indices of new order → [A, C]
//! new: B A E C        removed(D)
//!                     moved_before(B, A)
//!                     added_before(E, C)
//! ```
//!
//! ## Unordered results
//!
//! Only `added`, `changed` and `removed`; no positions.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::id_map::{id_stringify, IdMap};
use crate::observe::{ChangedFields, ObserveChanges};
use crate::projection::Projection;
use crate::value::{Document, Value};

static NULL_ID: Value = Value::Null;

pub(crate) fn doc_id(doc: &Document) -> &Value {
    doc.get("_id").unwrap_or(&NULL_ID)
}

pub(crate) fn doc_key(doc: &Document) -> String {
    id_stringify(doc_id(doc)).unwrap_or_default()
}

fn project(doc: &Document, projection: Option<&Projection>) -> Document {
    match projection {
        Some(p) => p.apply(doc),
        None => doc.clone(),
    }
}

fn fields_of(doc: &Document, projection: Option<&Projection>) -> Document {
    let mut fields = project(doc, projection);
    fields.shift_remove("_id");
    fields
}

fn documents_equal(a: &Document, b: &Document) -> bool {
    a.len() == b.len() && a.iter().all(|(k, v)| b.get(k) == Some(v))
}

fn emit_changes(
    observer: &mut dyn ObserveChanges,
    new_doc: &Document,
    old_doc: &Document,
    projection: Option<&Projection>,
) {
    if documents_equal(new_doc, old_doc) {
        return;
    }
    let changed = make_changed_fields(&project(new_doc, projection), &project(old_doc, projection));
    if !changed.is_empty() {
        observer.changed(doc_id(new_doc), changed);
    }
}

/// Dispatch to the ordered or unordered diff.
pub fn diff_query_changes(
    old: &QueryResults,
    new: &QueryResults,
    observer: &mut dyn ObserveChanges,
    projection: Option<&Projection>,
) {
    match (old, new) {
        (QueryResults::Ordered(old), QueryResults::Ordered(new)) => {
            diff_query_ordered_changes(old, new, observer, projection)
        }
        (QueryResults::Unordered(old), QueryResults::Unordered(new)) => {
            diff_query_unordered_changes(old, new, observer, projection)
        }
        (old, new) => {
            let old: IdMap<Document> = old.iter().map(|d| (doc_key(d), d.clone())).collect();
            let new: IdMap<Document> = new.iter().map(|d| (doc_key(d), d.clone())).collect();
            diff_query_unordered_changes(&old, &new, observer, projection)
        }
    }
}

/// Snapshot of a live query's results.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResults {
    Ordered(Vec<Document>),
    Unordered(IdMap<Document>),
}

impl QueryResults {
    pub fn len(&self) -> usize {
        match self {
            QueryResults::Ordered(v) => v.len(),
            QueryResults::Unordered(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = &Document> + '_> {
        match self {
            QueryResults::Ordered(v) => Box::new(v.iter()),
            QueryResults::Unordered(m) => Box::new(m.values()),
        }
    }
}

pub fn diff_query_unordered_changes(
    old: &IdMap<Document>,
    new: &IdMap<Document>,
    observer: &mut dyn ObserveChanges,
    projection: Option<&Projection>,
) {
    for (key, new_doc) in new.iter() {
        match old.get(key) {
            Some(old_doc) => emit_changes(observer, new_doc, old_doc, projection),
            None => observer.added(doc_id(new_doc), fields_of(new_doc, projection)),
        }
    }
    for (key, old_doc) in old.iter() {
        if !new.contains_key(key) {
            observer.removed(doc_id(old_doc));
        }
    }
}

pub fn diff_query_ordered_changes(
    old: &[Document],
    new: &[Document],
    observer: &mut dyn ObserveChanges,
    projection: Option<&Projection>,
) {
    let new_keys: Vec<String> = new.iter().map(doc_key).collect();
    let new_presence: HashSet<&str> = new_keys.iter().map(String::as_str).collect();
    if new_presence.len() != new_keys.len() {
        log::debug!("Duplicate _id in new results");
    }
    let mut old_index: HashMap<String, usize> = HashMap::with_capacity(old.len());
    for (i, doc) in old.iter().enumerate() {
        if old_index.insert(doc_key(doc), i).is_some() {
            log::debug!("Duplicate _id in old results");
        }
    }

    let unmoved = unmoved_positions(&new_keys, &old_index);

    for doc in old {
        if !new_presence.contains(doc_key(doc).as_str()) {
            observer.removed(doc_id(doc));
        }
    }

    let mut start = 0;
    for end in unmoved.into_iter().chain(std::iter::once(new.len())) {
        let anchor = new.get(end).map(doc_id);
        for i in start..end {
            let new_doc = &new[i];
            match old_index.get(&new_keys[i]) {
                None => observer.added_before(doc_id(new_doc), fields_of(new_doc, projection), anchor),
                Some(&oi) => {
                    emit_changes(observer, new_doc, &old[oi], projection);
                    observer.moved_before(doc_id(new_doc), anchor);
                }
            }
        }
        if let Some(anchor_doc) = new.get(end) {
            if let Some(&oi) = old_index.get(&new_keys[end]) {
                emit_changes(observer, anchor_doc, &old[oi], projection);
            }
        }
        start = end + 1;
    }
}

// Indices into `new_keys` forming a longest increasing subsequence of old
// positions.
fn unmoved_positions(new_keys: &[String], old_index: &HashMap<String, usize>) -> Vec<usize> {
    let n = new_keys.len();
    let old_of = |i: usize| old_index.get(&new_keys[i]).copied();
    let mut seq_ends: Vec<usize> = Vec::with_capacity(n);
    let mut ptrs: Vec<Option<usize>> = vec![None; n];
    for i in 0..n {
        let Some(current) = old_of(i) else {
            continue;
        };
        let mut j = seq_ends.len();
        while j > 0 {
            if old_of(seq_ends[j - 1]).map(|o| o < current).unwrap_or(false) {
                break;
            }
            j -= 1;
        }
        ptrs[i] = if j == 0 { None } else { Some(seq_ends[j - 1]) };
        if j == seq_ends.len() {
            seq_ends.push(i);
        } else {
            seq_ends[j] = i;
        }
    }
    let mut unmoved = Vec::with_capacity(seq_ends.len());
    let mut idx = seq_ends.last().copied();
    while let Some(i) = idx {
        unmoved.push(i);
        idx = ptrs[i];
    }
    unmoved.reverse();
    unmoved
}

/// Field-level difference from `old` to `new`: changed or added fields map
/// to their new value, removed fields map to `None`.
pub fn make_changed_fields(new: &Document, old: &Document) -> ChangedFields {
    let mut fields = ChangedFields::new();
    for (key, old_value) in old {
        match new.get(key) {
            Some(new_value) if new_value != old_value => {
                fields.insert(key.clone(), Some(new_value.clone()));
            }
            Some(_) => {}
            None => {
                fields.insert(key.clone(), None);
            }
        }
    }
    for (key, new_value) in new {
        if !old.contains_key(key) {
            fields.insert(key.clone(), Some(new_value.clone()));
        }
    }
    fields
}

/// Apply a [`ChangedFields`] set to a document.
pub fn apply_changes(doc: &mut Document, changes: &ChangedFields) {
    for (key, value) in changes {
        match value {
            Some(v) => {
                doc.insert(key.clone(), v.clone());
            }
            None => {
                doc.shift_remove(key);
            }
        }
    }
}

/// Walk two objects key by key.
pub fn diff_objects<V>(
    left: &IndexMap<String, V>,
    right: &IndexMap<String, V>,
    mut both: impl FnMut(&str, &V, &V),
    mut left_only: impl FnMut(&str, &V),
    mut right_only: impl FnMut(&str, &V),
) {
    for (key, lv) in left {
        match right.get(key) {
            Some(rv) => both(key, lv, rv),
            None => left_only(key, lv),
        }
    }
    for (key, rv) in right {
        if !left.contains_key(key) {
            right_only(key, rv);
        }
    }
}

/// [`diff_objects`] over id maps.
pub fn diff_maps<V>(
    left: &IdMap<V>,
    right: &IdMap<V>,
    mut both: impl FnMut(&str, &V, &V),
    mut left_only: impl FnMut(&str, &V),
    mut right_only: impl FnMut(&str, &V),
) {
    for (key, lv) in left.iter() {
        match right.get(key) {
            Some(rv) => both(key, lv, rv),
            None => left_only(key, lv),
        }
    }
    for (key, rv) in right.iter() {
        if !left.contains_key(key) {
            right_only(key, rv);
        }
    }
}
