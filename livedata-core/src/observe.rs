//! Live query callbacks.
//!
//! [`ObserveChanges`] is the field-level interface every live query drives:
//! ids plus changed fields, never whole documents. [`Observe`] is the
//! document-level interface with positions, built on top of it by
//! [`ObserveAdapter`], which keeps its own copy of the results to hand out
//! old documents and indices.

use indexmap::IndexMap;

use crate::diff::apply_changes;
use crate::id_map::{id_stringify, OrderedDict};
use crate::value::{Document, Value};

/// Changed fields of one document: `Some(value)` for set, `None` for cleared.
pub type ChangedFields = IndexMap<String, Option<Value>>;

/// Field-level live query callbacks. All methods default to no-ops.
///
/// Ordered observers (those returning `true` from [`ordered`](Self::ordered))
/// receive `added_before` and `moved_before`; unordered ones receive `added`.
/// The default `added_before` forwards to `added`.
pub trait ObserveChanges {
    fn ordered(&self) -> bool {
        false
    }

    fn added(&mut self, _id: &Value, _fields: Document) {}

    fn added_before(&mut self, id: &Value, fields: Document, _before: Option<&Value>) {
        self.added(id, fields);
    }

    fn changed(&mut self, _id: &Value, _fields: ChangedFields) {}

    fn moved_before(&mut self, _id: &Value, _before: Option<&Value>) {}

    fn removed(&mut self, _id: &Value) {}
}

/// Document-level live query callbacks.
pub trait Observe {
    /// Ordered observers get the `*_at` callbacks and `moved_to`.
    fn ordered(&self) -> bool {
        false
    }

    fn added(&mut self, _doc: &Document) {}

    fn added_at(&mut self, _doc: &Document, _index: usize, _before: Option<&Value>) {}

    fn changed(&mut self, _new_doc: &Document, _old_doc: &Document) {}

    fn changed_at(&mut self, _new_doc: &Document, _old_doc: &Document, _index: usize) {}

    fn moved_to(&mut self, _doc: &Document, _from: usize, _to: usize, _before: Option<&Value>) {}

    fn removed(&mut self, _old_doc: &Document) {}

    fn removed_at(&mut self, _old_doc: &Document, _index: usize) {}
}

/// Turns field-level events into [`Observe`] calls.
pub struct ObserveAdapter<O> {
    observer: O,
    docs: OrderedDict<Document>,
}

impl<O: Observe> ObserveAdapter<O> {
    pub fn new(observer: O) -> Self {
        Self { observer, docs: OrderedDict::new() }
    }

    pub fn into_inner(self) -> O {
        self.observer
    }
}

fn key_of(id: &Value) -> String {
    id_stringify(id).unwrap_or_default()
}

fn with_id(id: &Value, fields: Document) -> Document {
    let mut doc = Document::with_capacity(fields.len() + 1);
    doc.insert("_id".to_string(), id.clone());
    doc.extend(fields);
    doc
}

impl<O: Observe> ObserveChanges for ObserveAdapter<O> {
    fn ordered(&self) -> bool {
        self.observer.ordered()
    }

    fn added(&mut self, id: &Value, fields: Document) {
        let doc = with_id(id, fields);
        if let Err(e) = self.docs.append(key_of(id), doc.clone()) {
            log::warn!("observe: {e}");
            return;
        }
        self.observer.added(&doc);
    }

    fn added_before(&mut self, id: &Value, fields: Document, before: Option<&Value>) {
        let doc = with_id(id, fields);
        let before_key = before.map(key_of);
        let index = before_key
            .as_deref()
            .and_then(|k| self.docs.index_of(k))
            .unwrap_or(self.docs.len());
        if let Err(e) = self.docs.put_before(key_of(id), doc.clone(), before_key.as_deref()) {
            log::warn!("observe: {e}");
            return;
        }
        self.observer.added_at(&doc, index, before);
    }

    fn changed(&mut self, id: &Value, fields: ChangedFields) {
        let key = key_of(id);
        let Some(index) = self.docs.index_of(&key) else {
            log::warn!("observe: changed for unknown document {key}");
            return;
        };
        let Some(current) = self.docs.get_mut(&key) else {
            return;
        };
        let old_doc = current.clone();
        apply_changes(current, &fields);
        let new_doc = current.clone();
        if self.observer.ordered() {
            self.observer.changed_at(&new_doc, &old_doc, index);
        } else {
            self.observer.changed(&new_doc, &old_doc);
        }
    }

    fn moved_before(&mut self, id: &Value, before: Option<&Value>) {
        let key = key_of(id);
        let before_key = before.map(key_of);
        let Some(from) = self.docs.index_of(&key) else {
            return;
        };
        if let Err(e) = self.docs.move_before(&key, before_key.as_deref()) {
            log::warn!("observe: {e}");
            return;
        }
        let to = self.docs.index_of(&key).unwrap_or(from);
        if let Some(doc) = self.docs.get(&key).cloned() {
            self.observer.moved_to(&doc, from, to, before);
        }
    }

    fn removed(&mut self, id: &Value) {
        let key = key_of(id);
        let index = self.docs.index_of(&key);
        match (self.docs.remove(&key), index) {
            (Ok(doc), Some(index)) if self.observer.ordered() => self.observer.removed_at(&doc, index),
            (Ok(doc), _) => self.observer.removed(&doc),
            (Err(e), _) => log::warn!("observe: {e}"),
        }
    }
}
