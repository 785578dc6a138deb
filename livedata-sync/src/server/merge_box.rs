//! Per-session merged view of every published document.
//!
//! Several subscriptions may publish the same document, each with its own
//! fields. The client sees one document whose fields are the union of what
//! the subscriptions publish. For each field the view keeps a precedence
//! list of `(subscription, value)`; the head of the list is what the
//! client sees. A subscription publishing a field first owns it until it
//! stops publishing it, then the next one in line takes over.
//!
//! ```text
//!  sub A ─ added {a:1, x:"A"} ─┐            ┌─ client sees {a:1, x:"A", b:2}
//!                              ├─► doc 42 ──┤
//!  sub B ─ added {b:2, x:"B"} ─┘            └─ A stops ⇒ changed {a:-, x:"B"}
//! ```
//!
//! A document is removed from the client only when no subscription still
//! publishes it.

use std::cell::RefCell;

use indexmap::IndexMap;
use livedata_core::{diff_objects, ChangedFields, Document, Value};

use crate::protocol::DdpMessage;

/// Session-unique subscription key. DDP sub ids can be reused after a
/// rerun, so the merge box never keys on them directly.
pub type SubKey = u64;

#[derive(Debug, Clone)]
struct DocumentView {
    id: Value,
    exists_in: Vec<SubKey>,
    data_by_key: IndexMap<String, Vec<(SubKey, Value)>>,
}

impl DocumentView {
    fn fields(&self) -> Document {
        self.data_by_key
            .iter()
            .filter_map(|(key, list)| list.first().map(|(_, v)| (key.clone(), v.clone())))
            .collect()
    }

    fn clear_field(&mut self, sub: SubKey, key: &str, changes: &mut ChangedFields) {
        if key == "_id" {
            return;
        }
        let Some(list) = self.data_by_key.get_mut(key) else {
            return;
        };
        let Some(pos) = list.iter().position(|(s, _)| *s == sub) else {
            return;
        };
        let (_, removed) = list.remove(pos);
        if list.is_empty() {
            self.data_by_key.shift_remove(key);
            changes.insert(key.to_string(), None);
        } else if pos == 0 && list[0].1 != removed {
            changes.insert(key.to_string(), Some(list[0].1.clone()));
        }
    }

    fn change_field(&mut self, sub: SubKey, key: &str, value: Value, changes: &mut ChangedFields, is_add: bool) {
        if key == "_id" {
            return;
        }
        let Some(list) = self.data_by_key.get_mut(key) else {
            changes.insert(key.to_string(), Some(value.clone()));
            self.data_by_key.insert(key.to_string(), vec![(sub, value)]);
            return;
        };
        let existing = if is_add { None } else { list.iter().position(|(s, _)| *s == sub) };
        match existing {
            Some(pos) => {
                if pos == 0 && list[0].1 != value {
                    changes.insert(key.to_string(), Some(value.clone()));
                }
                list[pos].1 = value;
            }
            None => list.push((sub, value)),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CollectionView {
    documents: IndexMap<String, DocumentView>,
}

/// Everything one session has published to its client.
#[derive(Debug, Clone, Default)]
pub struct SessionView {
    collections: IndexMap<String, CollectionView>,
}

fn changed_message(collection: &str, id: &Value, fields: ChangedFields) -> Option<DdpMessage> {
    (!fields.is_empty()).then(|| DdpMessage::Changed { collection: collection.to_string(), id: id.clone(), fields })
}

impl SessionView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document_count(&self) -> usize {
        self.collections.values().map(|c| c.documents.len()).sum()
    }

    /// Fields the client currently sees for a document.
    pub fn fields(&self, collection: &str, key: &str) -> Option<Document> {
        Some(self.collections.get(collection)?.documents.get(key)?.fields())
    }

    pub fn added(&mut self, sub: SubKey, collection: &str, key: &str, id: &Value, fields: Document) -> Option<DdpMessage> {
        let view = self.collections.entry(collection.to_string()).or_default();
        let is_new = !view.documents.contains_key(key);
        let doc = view
            .documents
            .entry(key.to_string())
            .or_insert_with(|| DocumentView { id: id.clone(), exists_in: Vec::new(), data_by_key: IndexMap::new() });
        if !doc.exists_in.contains(&sub) {
            doc.exists_in.push(sub);
        }
        let mut changes = ChangedFields::new();
        for (field, value) in fields {
            doc.change_field(sub, &field, value, &mut changes, true);
        }
        if is_new {
            let fields = changes.into_iter().filter_map(|(k, v)| v.map(|v| (k, v))).collect();
            Some(DdpMessage::Added { collection: collection.to_string(), id: id.clone(), fields })
        } else {
            changed_message(collection, id, changes)
        }
    }

    pub fn changed(&mut self, sub: SubKey, collection: &str, key: &str, fields: ChangedFields) -> Option<DdpMessage> {
        let Some(doc) = self.collections.get_mut(collection).and_then(|c| c.documents.get_mut(key)) else {
            log::warn!("changed for unknown document {collection}/{key}");
            return None;
        };
        let mut changes = ChangedFields::new();
        for (field, value) in fields {
            match value {
                Some(v) => doc.change_field(sub, &field, v, &mut changes, false),
                None => doc.clear_field(sub, &field, &mut changes),
            }
        }
        changed_message(collection, &doc.id.clone(), changes)
    }

    pub fn removed(&mut self, sub: SubKey, collection: &str, key: &str) -> Option<DdpMessage> {
        let Some(view) = self.collections.get_mut(collection) else {
            log::warn!("removed for unknown collection {collection}");
            return None;
        };
        let Some(doc) = view.documents.get_mut(key) else {
            log::warn!("removed for unknown document {collection}/{key}");
            return None;
        };
        doc.exists_in.retain(|s| *s != sub);
        if doc.exists_in.is_empty() {
            let id = doc.id.clone();
            view.documents.shift_remove(key);
            return Some(DdpMessage::Removed { collection: collection.to_string(), id });
        }
        let mut changes = ChangedFields::new();
        let keys: Vec<String> = doc.data_by_key.keys().cloned().collect();
        for field in keys {
            doc.clear_field(sub, &field, &mut changes);
        }
        changed_message(collection, &doc.id.clone(), changes)
    }

    /// Messages that take a client from `previous` to `self`.
    pub fn diff(&self, previous: &SessionView) -> Vec<DdpMessage> {
        let out = RefCell::new(Vec::new());
        let empty = CollectionView::default();
        let mut names: Vec<&String> = previous.collections.keys().collect();
        names.extend(self.collections.keys().filter(|k| !previous.collections.contains_key(*k)));
        for name in names {
            let before = previous.collections.get(name).unwrap_or(&empty);
            let after = self.collections.get(name).unwrap_or(&empty);
            diff_objects(
                &before.documents,
                &after.documents,
                |_, old, new| {
                    let fields = RefCell::new(ChangedFields::new());
                    diff_objects(
                        &old.fields(),
                        &new.fields(),
                        |k, a, b| {
                            if a != b {
                                fields.borrow_mut().insert(k.to_string(), Some(b.clone()));
                            }
                        },
                        |k, _| {
                            fields.borrow_mut().insert(k.to_string(), None);
                        },
                        |k, b| {
                            fields.borrow_mut().insert(k.to_string(), Some(b.clone()));
                        },
                    );
                    out.borrow_mut().extend(changed_message(name, &new.id, fields.into_inner()));
                },
                |_, old| out.borrow_mut().push(DdpMessage::Removed { collection: name.clone(), id: old.id.clone() }),
                |_, new| out.borrow_mut().push(DdpMessage::Added { collection: name.clone(), id: new.id.clone(), fields: new.fields() }),
            );
        }
        out.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, i32)]) -> Document {
        pairs.iter().map(|(k, v)| (k.to_string(), Value::from(*v))).collect()
    }

    fn id() -> Value {
        Value::from("d1")
    }

    #[test]
    fn test_union_of_fields_and_single_removed() {
        let mut view = SessionView::new();
        let first = view.added(1, "items", "d1", &id(), fields(&[("a", 1), ("x", 10)]));
        assert!(matches!(first, Some(DdpMessage::Added { .. })));
        let second = view.added(2, "items", "d1", &id(), fields(&[("b", 2), ("x", 20)]));
        match second {
            Some(DdpMessage::Changed { fields, .. }) => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields["b"], Some(Value::from(2)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(view.fields("items", "d1").unwrap(), fields(&[("a", 1), ("x", 10), ("b", 2)]));

        match view.removed(1, "items", "d1") {
            Some(DdpMessage::Changed { fields, .. }) => {
                assert_eq!(fields["a"], None);
                assert_eq!(fields["x"], Some(Value::from(20)));
                assert!(!fields.contains_key("b"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(view.removed(2, "items", "d1"), Some(DdpMessage::Removed { .. })));
        assert_eq!(view.document_count(), 0);
    }

    #[test]
    fn test_change_by_non_owner_is_silent() {
        let mut view = SessionView::new();
        view.added(1, "items", "d1", &id(), fields(&[("x", 1)]));
        view.added(2, "items", "d1", &id(), fields(&[("x", 2)]));
        let mut change = ChangedFields::new();
        change.insert("x".into(), Some(Value::from(3)));
        assert!(view.changed(2, "items", "d1", change.clone()).is_none());
        assert!(matches!(view.changed(1, "items", "d1", change), Some(DdpMessage::Changed { .. })));
    }

    #[test]
    fn test_diff_between_views() {
        let mut before = SessionView::new();
        before.added(1, "items", "d1", &id(), fields(&[("a", 1)]));
        before.added(1, "items", "d2", &Value::from("d2"), fields(&[("a", 1)]));
        let mut after = SessionView::new();
        after.added(5, "items", "d1", &id(), fields(&[("a", 2)]));
        after.added(5, "other", "d9", &Value::from("d9"), fields(&[]));
        let kinds: Vec<&str> = after.diff(&before).iter().map(DdpMessage::kind).collect();
        assert_eq!(kinds, vec!["changed", "removed", "added"]);
    }
}
