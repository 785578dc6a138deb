//! Query cursors and live query handles.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::collection::{Collection, LocalCollection, QuerySpec};
use crate::observe::{Observe, ObserveAdapter, ObserveChanges};
use crate::value::Document;

/// A compiled query bound to a collection. Cheap to clone.
#[derive(Clone)]
pub struct Cursor {
    collection: Collection,
    spec: Arc<QuerySpec>,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("collection", &self.collection.name())
            .field("skip", &self.spec.skip)
            .field("limit", &self.spec.limit)
            .finish()
    }
}

impl Cursor {
    pub(crate) fn new(collection: Collection, spec: Arc<QuerySpec>) -> Self {
        Self { collection, spec }
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub fn collection_name(&self) -> String {
        self.collection.name()
    }

    /// Matching documents, sorted and projected.
    pub fn fetch(&self) -> Vec<Document> {
        self.collection.lock().fetch(&self.spec)
    }

    pub fn count(&self) -> usize {
        self.collection.lock().count(&self.spec)
    }

    /// Start a live query. Initial results are delivered as adds before this
    /// returns; later writes are delivered as they happen.
    pub fn observe_changes<O>(&self, observer: O) -> ObserveHandle
    where
        O: ObserveChanges + Send + 'static,
    {
        let id = self.collection.lock().add_query(Arc::clone(&self.spec), Box::new(observer));
        ObserveHandle { collection: self.collection.downgrade(), id }
    }

    /// Start a document-level live query.
    pub fn observe<O>(&self, observer: O) -> ObserveHandle
    where
        O: Observe + Send + 'static,
    {
        self.observe_changes(ObserveAdapter::new(observer))
    }
}

/// Stops its live query when [`stop`](Self::stop) is called or when dropped.
#[derive(Debug)]
pub struct ObserveHandle {
    collection: Weak<Mutex<LocalCollection>>,
    id: u64,
}

impl ObserveHandle {
    pub fn stop(&self) {
        if let Some(inner) = self.collection.upgrade() {
            inner.lock().unwrap_or_else(PoisonError::into_inner).remove_query(self.id);
        }
    }
}

impl Drop for ObserveHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{FindOptions, UpdateOptions};
    use crate::observe::ChangedFields;
    use crate::value::Value;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn doc(j: serde_json::Value) -> Document {
        match Value::from(j) {
            Value::Object(o) => o,
            _ => unreachable!(),
        }
    }

    fn sel(j: serde_json::Value) -> Value {
        Value::from(j)
    }

    #[derive(Clone, Default)]
    struct Recorder {
        ordered: bool,
        events: Arc<StdMutex<Vec<String>>>,
    }

    impl Recorder {
        fn ordered() -> Self {
            Self { ordered: true, ..Default::default() }
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn short(v: Option<&Value>) -> String {
        v.map(|v| v.to_string()).unwrap_or_else(|| "end".into())
    }

    impl ObserveChanges for Recorder {
        fn ordered(&self) -> bool {
            self.ordered
        }
        fn added(&mut self, id: &Value, fields: Document) {
            self.push(format!("added {id} {}", Value::Object(fields)));
        }
        fn added_before(&mut self, id: &Value, fields: Document, before: Option<&Value>) {
            self.push(format!("added {id} {} before {}", Value::Object(fields), short(before)));
        }
        fn changed(&mut self, id: &Value, fields: ChangedFields) {
            let fields: Vec<String> = fields
                .iter()
                .map(|(k, v)| format!("{k}={}", v.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "-".into())))
                .collect();
            self.push(format!("changed {id} {}", fields.join(",")));
        }
        fn moved_before(&mut self, id: &Value, before: Option<&Value>) {
            self.push(format!("moved {id} before {}", short(before)));
        }
        fn removed(&mut self, id: &Value) {
            self.push(format!("removed {id}"));
        }
    }

    fn seeded() -> Collection {
        let c = Collection::new("items");
        c.insert(doc(json!({"_id": "a", "n": 1, "tag": "x"}))).unwrap();
        c.insert(doc(json!({"_id": "b", "n": 2, "tag": "y"}))).unwrap();
        c.insert(doc(json!({"_id": "c", "n": 3, "tag": "x"}))).unwrap();
        c
    }

    #[test]
    fn test_unordered_observe_changes() {
        let c = seeded();
        let rec = Recorder::default();
        let _handle = c.find(&sel(json!({"tag": "x"}))).unwrap().observe_changes(rec.clone());
        assert_eq!(rec.take(), vec![r#"added "a" {"n":1,"tag":"x"}"#, r#"added "c" {"n":3,"tag":"x"}"#]);

        c.insert(doc(json!({"_id": "d", "n": 4, "tag": "x"}))).unwrap();
        c.update(&Value::from("b"), &sel(json!({"$set": {"tag": "x"}})), UpdateOptions::default()).unwrap();
        c.update(&Value::from("a"), &sel(json!({"$set": {"tag": "z"}})), UpdateOptions::default()).unwrap();
        c.update(&Value::from("c"), &sel(json!({"$inc": {"n": 1}, "$unset": {"tag": 1}})), UpdateOptions::default())
            .unwrap();
        c.update(&Value::from("d"), &sel(json!({"$set": {"n": 4}})), UpdateOptions::default()).unwrap();
        assert_eq!(
            rec.take(),
            vec![
                r#"added "d" {"n":4,"tag":"x"}"#,
                r#"added "b" {"n":2,"tag":"x"}"#,
                r#"removed "a""#,
                r#"removed "c""#,
            ]
        );
    }

    #[test]
    fn test_ordered_observe_tracks_sort_position() {
        let c = seeded();
        let rec = Recorder::ordered();
        let cursor = c
            .find_with(&sel(json!({})), FindOptions { sort: Some(sel(json!({"n": 1}))), ..Default::default() })
            .unwrap();
        let _handle = cursor.observe_changes(rec.clone());
        assert_eq!(rec.take().len(), 3);

        c.update(&Value::from("a"), &sel(json!({"$set": {"n": 10}})), UpdateOptions::default()).unwrap();
        c.insert(doc(json!({"_id": "e", "n": 0}))).unwrap();
        c.update(&Value::from("b"), &sel(json!({"$set": {"tag": "q"}})), UpdateOptions::default()).unwrap();
        c.remove(&Value::from("c")).unwrap();
        assert_eq!(
            rec.take(),
            vec![
                r#"changed "a" n=10"#,
                r#"moved "a" before end"#,
                r#"added "e" {"n":0} before "b""#,
                r#"changed "b" tag="q""#,
                r#"removed "c""#,
            ]
        );
        let ids: Vec<Value> = cursor.fetch().into_iter().map(|d| d["_id"].clone()).collect();
        assert_eq!(ids, vec![Value::from("e"), Value::from("b"), Value::from("a")]);
    }

    #[test]
    fn test_sort_ties_keep_store_order() {
        let c = seeded();
        let rec = Recorder::ordered();
        let cursor = c
            .find_with(&sel(json!({})), FindOptions { sort: Some(sel(json!({"n": 1}))), ..Default::default() })
            .unwrap();
        let _handle = cursor.observe_changes(rec.clone());
        rec.take();

        c.insert(doc(json!({"_id": "x", "n": 2}))).unwrap();
        // Same key, same value: nothing to report.
        c.update(&Value::from("b"), &sel(json!({"$set": {"n": 2}})), UpdateOptions::default()).unwrap();
        c.update(&Value::from("a"), &sel(json!({"$set": {"n": 2}})), UpdateOptions::default()).unwrap();
        c.update(&Value::from("c"), &sel(json!({"$set": {"n": 2}})), UpdateOptions::default()).unwrap();
        assert_eq!(
            rec.take(),
            vec![
                r#"added "x" {"n":2} before "c""#,
                r#"changed "a" n=2"#,
                r#"changed "c" n=2"#,
                r#"moved "c" before "x""#,
            ]
        );
        let ids: Vec<Value> = cursor.fetch().into_iter().map(|d| d["_id"].clone()).collect();
        assert_eq!(ids, vec![Value::from("a"), Value::from("b"), Value::from("c"), Value::from("x")]);
    }

    #[test]
    fn test_limit_query_recomputes() {
        let c = seeded();
        let rec = Recorder::ordered();
        let cursor = c
            .find_with(
                &sel(json!({})),
                FindOptions { sort: Some(sel(json!({"n": -1}))), limit: Some(2), ..Default::default() },
            )
            .unwrap();
        let _handle = cursor.observe_changes(rec.clone());
        assert_eq!(rec.take(), vec![r#"added "c" {"n":3,"tag":"x"} before end"#, r#"added "b" {"n":2,"tag":"y"} before end"#]);

        c.insert(doc(json!({"_id": "z", "n": 5}))).unwrap();
        assert_eq!(rec.take(), vec![r#"removed "b""#, r#"added "z" {"n":5} before "c""#]);
    }

    #[test]
    fn test_projection_hides_fields_from_observers() {
        let c = seeded();
        let rec = Recorder::default();
        let cursor = c
            .find_with(&sel(json!({})), FindOptions { fields: Some(sel(json!({"tag": 1}))), ..Default::default() })
            .unwrap();
        let _handle = cursor.observe_changes(rec.clone());
        rec.take();
        c.update(&Value::from("a"), &sel(json!({"$inc": {"n": 1}})), UpdateOptions::default()).unwrap();
        assert!(rec.take().is_empty());
        c.update(&Value::from("a"), &sel(json!({"$set": {"tag": "w"}})), UpdateOptions::default()).unwrap();
        assert_eq!(rec.take(), vec![r#"changed "a" tag="w""#]);
    }

    #[test]
    fn test_pause_delivers_net_effect() {
        let c = seeded();
        let rec = Recorder::default();
        let _handle = c.find(&sel(json!({}))).unwrap().observe_changes(rec.clone());
        rec.take();

        c.pause_observers();
        c.update(&Value::from("a"), &sel(json!({"$set": {"n": 100}})), UpdateOptions::default()).unwrap();
        c.update(&Value::from("a"), &sel(json!({"$set": {"n": 1}})), UpdateOptions::default()).unwrap();
        c.insert(doc(json!({"_id": "t"}))).unwrap();
        c.remove(&Value::from("t")).unwrap();
        c.remove(&Value::from("b")).unwrap();
        assert!(rec.take().is_empty());
        c.resume_observers();
        assert_eq!(rec.take(), vec![r#"removed "b""#]);
    }

    #[test]
    fn test_stop_and_drop_detach_observer() {
        let c = seeded();
        let rec = Recorder::default();
        let handle = c.find(&sel(json!({}))).unwrap().observe_changes(rec.clone());
        handle.stop();
        rec.take();
        c.insert(doc(json!({"_id": "q"}))).unwrap();
        assert!(rec.take().is_empty());

        {
            let _scoped = c.find(&sel(json!({}))).unwrap().observe_changes(rec.clone());
            assert_eq!(c.with_lock(|lc| lc.query_count()), 1);
        }
        assert_eq!(c.with_lock(|lc| lc.query_count()), 0);
    }
}
