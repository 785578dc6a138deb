//! # In-memory collection
//!
//! [`LocalCollection`] stores documents by id and keeps every registered
//! live query's result set current as documents are written.
//!
//! ```text
//!   insert / update / remove / replace
//!                 │
//!                 ▼
//!        ┌─────────────────┐   per write: match, position, project
//!        │ LocalCollection │──────────────────────────────┐
//!        │  docs: IdMap    │                              ▼
//!        └─────────────────┘                  ┌──────────────────────┐
//!                 │ skip/limit queries        │ LiveQuery            │
//!                 └──── recompute + diff ────►│  results (snapshot)  │
//!                                             │  observer callbacks  │
//!                                             └──────────────────────┘
//! ```
//!
//! Queries without skip/limit are maintained incrementally; queries with
//! either are recomputed after each write and diffed. While observers are
//! paused, results still track every write but callbacks are held back;
//! resuming diffs the pre-pause snapshot against the current results, so
//! callers see only the net effect of a batch.
//!
//! [`Collection`] is the shareable handle. Observer callbacks run while the
//! collection lock is held and must not call back into the same collection.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::cursor::Cursor;
use crate::diff::{apply_changes, diff_query_changes, doc_id, make_changed_fields, QueryResults};
use crate::error::{Error, Result};
use crate::id_map::{id_stringify, IdMap};
use crate::modifier::Modifier;
use crate::observe::{ChangedFields, ObserveChanges};
use crate::projection::Projection;
use crate::random;
use crate::selector::Matcher;
use crate::sorter::Sorter;
use crate::value::{Document, Value};

/// Options accepted by `find`.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<Value>,
    pub skip: usize,
    pub limit: Option<usize>,
    pub fields: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    pub multi: bool,
    pub upsert: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateResult {
    pub number_affected: usize,
    pub inserted_id: Option<Value>,
}

/// A compiled query: selector, sort, window and projection.
#[derive(Debug, Clone)]
pub(crate) struct QuerySpec {
    pub matcher: Matcher,
    pub sorter: Option<Sorter>,
    pub projection: Option<Projection>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl QuerySpec {
    pub fn compile(selector: &Value, options: &FindOptions) -> Result<Self> {
        let projection = match &options.fields {
            Some(fields) => Some(Projection::new(fields)?).filter(|p| !p.is_identity()),
            None => None,
        };
        Ok(QuerySpec {
            matcher: Matcher::new(selector)?,
            sorter: options.sort.as_ref().map(Sorter::new).transpose()?,
            projection,
            skip: options.skip,
            limit: options.limit,
        })
    }

    fn recomputes(&self) -> bool {
        self.skip > 0 || self.limit.is_some()
    }

    pub fn project(&self, doc: &Document) -> Document {
        match &self.projection {
            Some(p) => p.apply(doc),
            None => doc.clone(),
        }
    }

    fn fields(&self, doc: &Document) -> Document {
        let mut fields = self.project(doc);
        fields.shift_remove("_id");
        fields
    }
}

struct LiveQuery {
    spec: Arc<QuerySpec>,
    ordered: bool,
    results: QueryResults,
    snapshot: Option<QueryResults>,
    dirty: bool,
    observer: Box<dyn ObserveChanges + Send>,
}

impl LiveQuery {
    fn position(&self, key: &str) -> Option<usize> {
        match &self.results {
            QueryResults::Ordered(docs) => docs.iter().position(|d| doc_key(d) == key),
            QueryResults::Unordered(_) => None,
        }
    }

    fn contains(&self, key: &str) -> bool {
        match &self.results {
            QueryResults::Ordered(_) => self.position(key).is_some(),
            QueryResults::Unordered(map) => map.contains_key(key),
        }
    }

    fn add(&mut self, key: &str, doc: &Document, store: &IdMap<Document>, notify: bool) {
        let fields = self.spec.fields(doc);
        match &mut self.results {
            QueryResults::Unordered(map) => {
                map.insert(key.to_string(), doc.clone());
                if notify {
                    self.observer.added(doc_id(doc), fields);
                }
            }
            QueryResults::Ordered(docs) => {
                let index = insertion_index(self.spec.sorter.as_ref(), docs, store, doc);
                docs.insert(index, doc.clone());
                if notify {
                    let before = docs.get(index + 1).map(|d| doc_id(d).clone());
                    self.observer.added_before(doc_id(doc), fields, before.as_ref());
                }
            }
        }
    }

    fn remove(&mut self, key: &str, id: &Value, notify: bool) {
        let removed = match &mut self.results {
            QueryResults::Unordered(map) => map.remove(key).is_some(),
            QueryResults::Ordered(docs) => match docs.iter().position(|d| doc_key(d) == key) {
                Some(i) => {
                    docs.remove(i);
                    true
                }
                None => false,
            },
        };
        if removed && notify {
            self.observer.removed(id);
        }
    }

    fn update(
        &mut self,
        key: &str,
        old: &Document,
        new: &Document,
        modified: Option<&[String]>,
        store: &IdMap<Document>,
        notify: bool,
    ) {
        let was_in = self.contains(key);
        let now_in = if self.spec.matcher.affected_by(modified) {
            self.spec.matcher.matches(new)
        } else {
            was_in
        };
        match (was_in, now_in) {
            (true, true) => self.change(key, old, new, modified, store, notify),
            (true, false) => self.remove(key, doc_id(old), notify),
            (false, true) => self.add(key, new, store, notify),
            (false, false) => {}
        }
    }

    fn change(
        &mut self,
        key: &str,
        old: &Document,
        new: &Document,
        modified: Option<&[String]>,
        store: &IdMap<Document>,
        notify: bool,
    ) {
        let changed = make_changed_fields(&self.spec.project(new), &self.spec.project(old));
        let id = doc_id(new).clone();
        if notify && !changed.is_empty() {
            self.observer.changed(&id, changed);
        }
        let resort = self.spec.sorter.as_ref().map(|s| s.affected_by(modified)).unwrap_or(false);
        match &mut self.results {
            QueryResults::Unordered(map) => {
                map.insert(key.to_string(), new.clone());
            }
            QueryResults::Ordered(docs) => {
                let Some(old_index) = docs.iter().position(|d| doc_key(d) == key) else {
                    return;
                };
                if !resort {
                    docs[old_index] = new.clone();
                    return;
                }
                docs.remove(old_index);
                let new_index = insertion_index(self.spec.sorter.as_ref(), docs, store, new);
                docs.insert(new_index, new.clone());
                if notify && new_index != old_index {
                    let before = docs.get(new_index + 1).map(|d| doc_id(d).clone());
                    self.observer.moved_before(&id, before.as_ref());
                }
            }
        }
    }
}

fn doc_key(doc: &Document) -> String {
    crate::diff::doc_key(doc)
}

// Ties on the sort key (and unsorted queries) fall back to store order,
// which is the order a stable sort over the store produces in
// `compute_results`.
fn insertion_index(sorter: Option<&Sorter>, docs: &[Document], store: &IdMap<Document>, doc: &Document) -> usize {
    let rank = |d: &Document| store.index_of(&doc_key(d));
    let own = rank(doc);
    docs.partition_point(|x| {
        let by_key = sorter.map_or(Ordering::Equal, |s| s.compare(x, doc));
        by_key.then_with(|| rank(x).cmp(&own)) == Ordering::Less
    })
}

fn compute_results(docs: &IdMap<Document>, spec: &QuerySpec, ordered: bool) -> QueryResults {
    let mut matched: Vec<Document> = match spec.matcher.single_id() {
        Some(id) => id_stringify(id)
            .ok()
            .and_then(|key| docs.get(&key))
            .filter(|d| spec.matcher.matches(d))
            .cloned()
            .into_iter()
            .collect(),
        None => docs.values().filter(|d| spec.matcher.matches(d)).cloned().collect(),
    };
    if let Some(sorter) = &spec.sorter {
        sorter.sort(&mut matched);
    }
    if spec.skip > 0 || spec.limit.is_some() {
        let limit = spec.limit.unwrap_or(usize::MAX);
        matched = matched.into_iter().skip(spec.skip).take(limit).collect();
    }
    if ordered {
        QueryResults::Ordered(matched)
    } else {
        QueryResults::Unordered(matched.into_iter().map(|d| (doc_key(&d), d)).collect())
    }
}

/// Documents plus the live queries observing them.
pub struct LocalCollection {
    name: String,
    docs: IdMap<Document>,
    queries: BTreeMap<u64, LiveQuery>,
    next_query_id: u64,
    paused: bool,
    originals: Option<IdMap<Option<Document>>>,
}

impl LocalCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: IdMap::new(),
            queries: BTreeMap::new(),
            next_query_id: 1,
            paused: false,
            originals: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Document> {
        self.docs.get(key)
    }

    // Write one document (insert, replace or delete) and bring every
    // incrementally maintained query up to date.
    fn store(&mut self, key: String, new: Option<Document>, modified: Option<&[String]>) {
        let old = self.docs.get(&key).cloned();
        if let Some(originals) = &mut self.originals {
            if !originals.contains_key(&key) {
                originals.insert(key.clone(), old.clone());
            }
        }
        match &new {
            Some(doc) => {
                self.docs.insert(key.clone(), doc.clone());
            }
            None => {
                self.docs.remove(&key);
            }
        }
        let notify = !self.paused;
        let docs = &self.docs;
        for query in self.queries.values_mut() {
            if query.spec.recomputes() {
                query.dirty = true;
                continue;
            }
            match (&old, &new) {
                (None, Some(n)) => {
                    if query.spec.matcher.matches(n) {
                        query.add(&key, n, docs, notify);
                    }
                }
                (Some(o), None) => query.remove(&key, doc_id(o), notify),
                (Some(o), Some(n)) => query.update(&key, o, n, modified, docs, notify),
                (None, None) => {}
            }
        }
    }

    fn recompute_dirty(&mut self) {
        let notify = !self.paused;
        let docs = &self.docs;
        for query in self.queries.values_mut().filter(|q| q.dirty) {
            let fresh = compute_results(docs, &query.spec, query.ordered);
            if notify {
                diff_query_changes(&query.results, &fresh, query.observer.as_mut(), query.spec.projection.as_ref());
            }
            query.results = fresh;
            query.dirty = false;
        }
    }

    fn matching_keys(&self, matcher: &Matcher, first_only: bool) -> Vec<String> {
        if let Some(id) = matcher.single_id() {
            return id_stringify(id)
                .ok()
                .filter(|key| self.docs.get(key).map(|d| matcher.matches(d)).unwrap_or(false))
                .into_iter()
                .collect();
        }
        let matching = self.docs.iter().filter(|(_, d)| matcher.matches(d)).map(|(k, _)| k.to_string());
        if first_only {
            matching.take(1).collect()
        } else {
            matching.collect()
        }
    }

    /// Insert a document, assigning a random `_id` when it has none.
    pub fn insert(&mut self, mut doc: Document) -> Result<Value> {
        let id = match doc.get("_id") {
            Some(id) => id.clone(),
            None => {
                let id = Value::String(random::id());
                doc.shift_insert(0, "_id".to_string(), id.clone());
                id
            }
        };
        let key = id_stringify(&id)?;
        if self.docs.contains_key(&key) {
            return Err(Error::DuplicateId(key));
        }
        self.store(key, Some(doc), None);
        self.recompute_dirty();
        Ok(id)
    }

    pub fn update(&mut self, selector: &Value, modifier: &Value, options: UpdateOptions) -> Result<UpdateResult> {
        let matcher = Matcher::new(selector)?;
        let modifier = Modifier::new(modifier)?;
        let keys = self.matching_keys(&matcher, !options.multi);

        if keys.is_empty() && options.upsert {
            let doc = modifier.upsert_document(selector)?;
            let id = self.insert(doc)?;
            return Ok(UpdateResult { number_affected: 1, inserted_id: Some(id) });
        }

        let modified = modifier.modified_paths();
        let mut result = UpdateResult::default();
        let mut outcome = Ok(());
        for key in keys {
            let Some(mut doc) = self.docs.get(&key).cloned() else {
                continue;
            };
            if let Err(e) = modifier.apply(&mut doc, false) {
                outcome = Err(e);
                break;
            }
            self.store(key, Some(doc), modified.as_deref());
            result.number_affected += 1;
        }
        self.recompute_dirty();
        outcome.map(|_| result)
    }

    pub fn remove(&mut self, selector: &Value) -> Result<usize> {
        let matcher = Matcher::new(selector)?;
        let keys = self.matching_keys(&matcher, false);
        let count = keys.len();
        for key in keys {
            self.store(key, None, None);
        }
        self.recompute_dirty();
        Ok(count)
    }

    /// Set the full contents of one document, inserting or removing it as
    /// needed.
    pub fn replace(&mut self, id: &Value, doc: Option<Document>) -> Result<()> {
        let key = id_stringify(id)?;
        let doc = doc.map(|mut d| {
            d.shift_remove("_id");
            d.shift_insert(0, "_id".to_string(), id.clone());
            d
        });
        if doc.is_none() && !self.docs.contains_key(&key) {
            return Ok(());
        }
        self.store(key, doc, None);
        self.recompute_dirty();
        Ok(())
    }

    /// Apply field-level changes to an existing document.
    pub fn change(&mut self, id: &Value, changes: &ChangedFields) -> Result<()> {
        let key = id_stringify(id)?;
        let mut doc = self
            .docs
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{}.{key}", self.name)))?;
        apply_changes(&mut doc, changes);
        let modified: Vec<String> = changes.keys().cloned().collect();
        self.store(key, Some(doc), Some(&modified));
        self.recompute_dirty();
        Ok(())
    }

    /// Remove every document.
    pub fn clear(&mut self) {
        let keys: Vec<String> = self.docs.keys().map(str::to_string).collect();
        for key in keys {
            self.store(key, None, None);
        }
        self.recompute_dirty();
    }

    pub(crate) fn fetch(&self, spec: &QuerySpec) -> Vec<Document> {
        match compute_results(&self.docs, spec, true) {
            QueryResults::Ordered(docs) => docs.iter().map(|d| spec.project(d)).collect(),
            QueryResults::Unordered(_) => Vec::new(),
        }
    }

    pub(crate) fn count(&self, spec: &QuerySpec) -> usize {
        compute_results(&self.docs, spec, true).len()
    }

    pub(crate) fn add_query(&mut self, spec: Arc<QuerySpec>, mut observer: Box<dyn ObserveChanges + Send>) -> u64 {
        let ordered = observer.ordered();
        let results = compute_results(&self.docs, &spec, ordered);
        let snapshot = if self.paused {
            Some(if ordered { QueryResults::Ordered(Vec::new()) } else { QueryResults::Unordered(IdMap::new()) })
        } else {
            for doc in results.iter() {
                if ordered {
                    observer.added_before(doc_id(doc), spec.fields(doc), None);
                } else {
                    observer.added(doc_id(doc), spec.fields(doc));
                }
            }
            None
        };
        let id = self.next_query_id;
        self.next_query_id += 1;
        self.queries.insert(
            id,
            LiveQuery { spec, ordered, results, snapshot, dirty: false, observer },
        );
        id
    }

    pub(crate) fn remove_query(&mut self, id: u64) {
        self.queries.remove(&id);
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    /// Hold back observer callbacks until [`resume_observers`](Self::resume_observers).
    pub fn pause_observers(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        for query in self.queries.values_mut() {
            query.snapshot = Some(query.results.clone());
        }
    }

    /// Deliver the net change since the matching pause.
    pub fn resume_observers(&mut self) {
        if !self.paused {
            return;
        }
        self.recompute_dirty();
        self.paused = false;
        for query in self.queries.values_mut() {
            if let Some(snapshot) = query.snapshot.take() {
                diff_query_changes(&snapshot, &query.results, query.observer.as_mut(), query.spec.projection.as_ref());
            }
        }
    }

    /// Start recording the pre-image of every document written.
    pub fn save_originals(&mut self) {
        self.originals = Some(IdMap::new());
    }

    /// Stop recording and return pre-images keyed by id; `None` marks a
    /// document that did not exist before.
    pub fn retrieve_originals(&mut self) -> IdMap<Option<Document>> {
        self.originals.take().unwrap_or_default()
    }
}

/// Shareable handle to a [`LocalCollection`].
#[derive(Clone)]
pub struct Collection {
    inner: Arc<Mutex<LocalCollection>>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Collection")
            .field("name", &inner.name)
            .field("documents", &inner.docs.len())
            .field("queries", &inner.queries.len())
            .finish()
    }
}

impl Collection {
    pub fn new(name: impl Into<String>) -> Self {
        Self { inner: Arc::new(Mutex::new(LocalCollection::new(name))) }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, LocalCollection> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<Mutex<LocalCollection>> {
        Arc::downgrade(&self.inner)
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn insert(&self, doc: Document) -> Result<Value> {
        self.lock().insert(doc)
    }

    pub fn update(&self, selector: &Value, modifier: &Value, options: UpdateOptions) -> Result<UpdateResult> {
        self.lock().update(selector, modifier, options)
    }

    pub fn upsert(&self, selector: &Value, modifier: &Value) -> Result<UpdateResult> {
        self.update(selector, modifier, UpdateOptions { multi: false, upsert: true })
    }

    pub fn remove(&self, selector: &Value) -> Result<usize> {
        self.lock().remove(selector)
    }

    pub fn replace(&self, id: &Value, doc: Option<Document>) -> Result<()> {
        self.lock().replace(id, doc)
    }

    pub fn change(&self, id: &Value, changes: &ChangedFields) -> Result<()> {
        self.lock().change(id, changes)
    }

    pub fn clear(&self) {
        self.lock().clear()
    }

    /// Document by id, unprojected.
    pub fn get(&self, id: &Value) -> Option<Document> {
        let key = id_stringify(id).ok()?;
        self.lock().get(&key).cloned()
    }

    pub fn find(&self, selector: &Value) -> Result<Cursor> {
        self.find_with(selector, FindOptions::default())
    }

    pub fn find_with(&self, selector: &Value, options: FindOptions) -> Result<Cursor> {
        let spec = QuerySpec::compile(selector, &options)?;
        Ok(Cursor::new(self.clone(), Arc::new(spec)))
    }

    pub fn find_one(&self, selector: &Value) -> Result<Option<Document>> {
        let cursor = self.find_with(selector, FindOptions { limit: Some(1), ..Default::default() })?;
        Ok(cursor.fetch().into_iter().next())
    }

    pub fn pause_observers(&self) {
        self.lock().pause_observers()
    }

    pub fn resume_observers(&self) {
        self.lock().resume_observers()
    }

    pub fn save_originals(&self) {
        self.lock().save_originals()
    }

    pub fn retrieve_originals(&self) -> IdMap<Option<Document>> {
        self.lock().retrieve_originals()
    }

    /// Run `f` with exclusive access, for batches that must not interleave
    /// with other writers.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut LocalCollection) -> R) -> R {
        f(&mut self.lock())
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

    fn sel(j: serde_json::Value) -> Value {
        Value::from(j)
    }

    #[test]
    fn test_insert_assigns_id_and_rejects_duplicates() {
        let c = Collection::new("items");
        let id = c.insert(doc(json!({"a": 1}))).unwrap();
        assert_eq!(id.as_str().map(str::len), Some(17));
        c.insert(doc(json!({"_id": "x"}))).unwrap();
        assert!(matches!(c.insert(doc(json!({"_id": "x"}))), Err(Error::DuplicateId(_))));
        assert!(matches!(c.insert(doc(json!({"_id": {"a": 1}}))), Err(Error::InvalidId(_))));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_update_single_and_multi() {
        let c = Collection::new("items");
        for i in 0..3 {
            c.insert(doc(json!({"_id": format!("d{i}"), "n": i, "tag": "t"}))).unwrap();
        }
        let r = c.update(&sel(json!({"tag": "t"})), &sel(json!({"$inc": {"n": 10}})), UpdateOptions::default()).unwrap();
        assert_eq!(r.number_affected, 1);
        let r = c
            .update(&sel(json!({"tag": "t"})), &sel(json!({"$set": {"seen": true}})), UpdateOptions { multi: true, upsert: false })
            .unwrap();
        assert_eq!(r.number_affected, 3);
        assert_eq!(c.get(&Value::from("d0")).unwrap()["n"], Value::from(10));
        assert_eq!(c.find(&sel(json!({"seen": true}))).unwrap().count(), 3);
    }

    #[test]
    fn test_upsert_inserts_from_selector() {
        let c = Collection::new("items");
        let r = c.upsert(&sel(json!({"owner": "u1"})), &sel(json!({"$set": {"n": 1}}))).unwrap();
        assert_eq!(r.number_affected, 1);
        let id = r.inserted_id.unwrap();
        let stored = c.get(&id).unwrap();
        assert_eq!(stored["owner"], Value::from("u1"));
        assert_eq!(stored["n"], Value::from(1));
        let r = c.upsert(&sel(json!({"owner": "u1"})), &sel(json!({"$set": {"n": 2}}))).unwrap();
        assert_eq!(r, UpdateResult { number_affected: 1, inserted_id: None });
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_remove_and_find_options() {
        let c = Collection::new("items");
        for i in 0..5 {
            c.insert(doc(json!({"_id": format!("d{i}"), "n": i, "secret": i}))).unwrap();
        }
        assert_eq!(c.remove(&sel(json!({"n": {"$gte": 3}}))).unwrap(), 2);
        let cursor = c
            .find_with(
                &sel(json!({})),
                FindOptions {
                    sort: Some(sel(json!({"n": -1}))),
                    skip: 1,
                    limit: Some(2),
                    fields: Some(sel(json!({"secret": 0}))),
                },
            )
            .unwrap();
        let fetched = cursor.fetch();
        assert_eq!(
            fetched.into_iter().map(Value::Object).collect::<Vec<_>>(),
            vec![sel(json!({"_id": "d1", "n": 1})), sel(json!({"_id": "d0", "n": 0}))]
        );
        assert_eq!(c.find_one(&Value::from("d2")).unwrap().map(|d| d["n"].clone()), Some(Value::from(2)));
        assert!(c.find_one(&sel(json!({"n": 99}))).unwrap().is_none());
    }

    #[test]
    fn test_malformed_inputs_fail_fast() {
        let c = Collection::new("items");
        assert!(matches!(c.find(&sel(json!({"a": {"$bogus": 1}}))), Err(Error::MalformedSelector(_))));
        assert!(matches!(
            c.update(&sel(json!({})), &sel(json!({"$bogus": {"a": 1}})), UpdateOptions::default()),
            Err(Error::MalformedModifier(_))
        ));
    }

    #[test]
    fn test_originals_record_first_pre_image() {
        let c = Collection::new("items");
        c.insert(doc(json!({"_id": "a", "n": 1}))).unwrap();
        c.save_originals();
        c.update(&Value::from("a"), &sel(json!({"$set": {"n": 2}})), UpdateOptions::default()).unwrap();
        c.update(&Value::from("a"), &sel(json!({"$set": {"n": 3}})), UpdateOptions::default()).unwrap();
        c.insert(doc(json!({"_id": "b"}))).unwrap();
        let originals = c.retrieve_originals();
        assert_eq!(originals.get("a").cloned().flatten().map(|d| d["n"].clone()), Some(Value::from(1)));
        assert_eq!(originals.get("b"), Some(&None));
        assert!(c.retrieve_originals().is_empty());
    }

    #[test]
    fn test_replace_and_change() {
        let c = Collection::new("items");
        c.replace(&Value::from("a"), Some(doc(json!({"x": 1})))).unwrap();
        assert_eq!(c.get(&Value::from("a")).map(Value::Object), Some(sel(json!({"_id": "a", "x": 1}))));
        let mut changes = ChangedFields::new();
        changes.insert("x".into(), None);
        changes.insert("y".into(), Some(Value::from(2)));
        c.change(&Value::from("a"), &changes).unwrap();
        assert_eq!(c.get(&Value::from("a")).map(Value::Object), Some(sel(json!({"_id": "a", "y": 2}))));
        assert!(matches!(c.change(&Value::from("zz"), &changes), Err(Error::NotFound(_))));
        c.replace(&Value::from("a"), None).unwrap();
        assert!(c.is_empty());
    }
}
