//! Server-side method context.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use livedata_core::random::{self, collection_scope};
use livedata_core::{Collection, Document, RandomStream, Value};
use tokio::sync::mpsc;

use crate::error::HandlerError;
use crate::server::session::SessionEvent;
use crate::server::Connection;

pub type MethodHandler =
    Arc<dyn Fn(MethodInvocation, Vec<Value>) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

pub(crate) fn boxed_method<F, Fut>(f: F) -> MethodHandler
where
    F: Fn(MethodInvocation, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(move |invocation, params| Box::pin(f(invocation, params)))
}

/// Context a method handler runs with.
pub struct MethodInvocation {
    id: String,
    name: String,
    user_id: Option<String>,
    connection: Connection,
    random: RandomStream,
    events: mpsc::UnboundedSender<SessionEvent>,
    unblocked: bool,
}

impl fmt::Debug for MethodInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodInvocation")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("user_id", &self.user_id)
            .field("connection", &self.connection.id())
            .finish()
    }
}

impl MethodInvocation {
    pub(crate) fn new(
        id: String,
        name: String,
        user_id: Option<String>,
        connection: Connection,
        random_seed: Option<String>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let seed = random_seed.unwrap_or_else(|| random::id_of_len(20));
        Self { id, name, user_id, connection, random: RandomStream::new(seed), events, unblocked: false }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Always false on the server.
    pub fn is_simulation(&self) -> bool {
        false
    }

    /// Let the next message from this connection start before this method
    /// finishes.
    pub fn unblock(&mut self) {
        if !self.unblocked {
            self.unblocked = true;
            let _ = self.events.send(SessionEvent::Unblock { id: self.id.clone() });
        }
    }

    /// Change the connection's user. Every subscription of the session is
    /// rerun under the new user.
    pub fn set_user_id(&mut self, user_id: Option<String>) {
        self.user_id = user_id.clone();
        let _ = self.events.send(SessionEvent::SetUserId { user_id });
    }

    /// Seeded id stream shared with the client's stub for this call.
    pub fn random_stream(&mut self) -> &mut RandomStream {
        &mut self.random
    }

    /// Insert into `collection`, drawing the id from the call's seeded
    /// stream when the document has none, so it matches the stub's id.
    pub fn insert(&mut self, collection: &Collection, mut doc: Document) -> livedata_core::Result<Value> {
        if !doc.contains_key("_id") {
            let id = self.random.id(&collection_scope(&collection.name()));
            doc.shift_insert(0, "_id".to_string(), Value::String(id));
        }
        collection.insert(doc)
    }
}
