//! Publication side of a subscription.
//!
//! A publish handler receives a [`Subscription`] and either returns cursors
//! for the session to observe, or drives the low-level API itself through
//! the subscription (or a cloned [`SubscriptionSink`] kept for later).

use std::fmt;
use std::sync::Arc;

use livedata_core::{ChangedFields, Cursor, Document, ObserveChanges, ObserveHandle, Value};
use tokio::sync::mpsc;

use crate::error::{HandlerError, MethodError};
use crate::server::merge_box::SubKey;
use crate::server::session::SessionEvent;
use crate::server::Connection;

/// What a publish handler hands back to the session.
pub enum Publication {
    /// Observe each cursor and mark the subscription ready once their
    /// initial documents are queued. At most one cursor per collection.
    Cursors(Vec<Cursor>),
    /// The handler publishes through the subscription itself.
    Manual,
}

impl From<Cursor> for Publication {
    fn from(cursor: Cursor) -> Self {
        Publication::Cursors(vec![cursor])
    }
}

impl From<Vec<Cursor>> for Publication {
    fn from(cursors: Vec<Cursor>) -> Self {
        Publication::Cursors(cursors)
    }
}

pub type PublishHandler =
    Arc<dyn Fn(&mut Subscription, Vec<Value>) -> Result<Publication, HandlerError> + Send + Sync>;

/// Cloneable sender for one subscription's data. Safe to call from any
/// thread; calls after the subscription stopped are dropped by the session.
#[derive(Clone)]
pub struct SubscriptionSink {
    key: SubKey,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl fmt::Debug for SubscriptionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionSink").field("key", &self.key).finish()
    }
}

impl SubscriptionSink {
    pub(crate) fn new(key: SubKey, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { key, events }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn added(&self, collection: &str, id: &Value, fields: Document) {
        self.emit(SessionEvent::Added { key: self.key, collection: collection.to_string(), id: id.clone(), fields });
    }

    pub fn changed(&self, collection: &str, id: &Value, fields: ChangedFields) {
        self.emit(SessionEvent::Changed { key: self.key, collection: collection.to_string(), id: id.clone(), fields });
    }

    pub fn removed(&self, collection: &str, id: &Value) {
        self.emit(SessionEvent::Removed { key: self.key, collection: collection.to_string(), id: id.clone() });
    }

    pub fn ready(&self) {
        self.emit(SessionEvent::Ready { key: self.key });
    }

    /// Stop the subscription and report `error` to the client.
    pub fn error(&self, error: MethodError) {
        self.emit(SessionEvent::SubError { key: self.key, error });
    }

    pub fn stop(&self) {
        self.emit(SessionEvent::SubStop { key: self.key });
    }
}

/// The context a publish handler runs in.
pub struct Subscription {
    id: Option<String>,
    name: Option<String>,
    user_id: Option<String>,
    connection: Connection,
    sink: SubscriptionSink,
    handles: Vec<ObserveHandle>,
    stop_callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("user_id", &self.user_id)
            .field("observers", &self.handles.len())
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(
        id: Option<String>,
        name: Option<String>,
        user_id: Option<String>,
        connection: Connection,
        sink: SubscriptionSink,
    ) -> Self {
        Self { id, name, user_id, connection, sink, handles: Vec::new(), stop_callbacks: Vec::new() }
    }

    /// Client-chosen sub id; `None` for universal publications.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn sink(&self) -> SubscriptionSink {
        self.sink.clone()
    }

    pub fn added(&self, collection: &str, id: &Value, fields: Document) {
        self.sink.added(collection, id, fields)
    }

    pub fn changed(&self, collection: &str, id: &Value, fields: ChangedFields) {
        self.sink.changed(collection, id, fields)
    }

    pub fn removed(&self, collection: &str, id: &Value) {
        self.sink.removed(collection, id)
    }

    pub fn ready(&self) {
        self.sink.ready()
    }

    pub fn error(&self, error: MethodError) {
        self.sink.error(error)
    }

    pub fn stop(&self) {
        self.sink.stop()
    }

    /// Run `f` when the subscription stops for any reason.
    pub fn on_stop(&mut self, f: impl FnOnce() + Send + 'static) {
        self.stop_callbacks.push(Box::new(f));
    }

    /// Publish every document of `cursor` under this subscription.
    pub(crate) fn observe(&mut self, cursor: &Cursor) {
        let observer = PublishObserver { collection: cursor.collection_name(), sink: self.sink.clone() };
        self.handles.push(cursor.observe_changes(observer));
    }

    /// Stop observers and run stop callbacks. Idempotent.
    pub(crate) fn deactivate(&mut self) {
        for handle in self.handles.drain(..) {
            handle.stop();
        }
        for callback in self.stop_callbacks.drain(..) {
            callback();
        }
    }
}

/// Forwards live query output of one cursor into the session.
struct PublishObserver {
    collection: String,
    sink: SubscriptionSink,
}

impl ObserveChanges for PublishObserver {
    fn added(&mut self, id: &Value, fields: Document) {
        self.sink.added(&self.collection, id, fields);
    }

    fn changed(&mut self, id: &Value, fields: ChangedFields) {
        self.sink.changed(&self.collection, id, fields);
    }

    fn removed(&mut self, id: &Value) {
        self.sink.removed(&self.collection, id);
    }
}
