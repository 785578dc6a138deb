//! Client connection state machine, free of I/O.
//!
//! The local stores always show the last known server state with the
//! effects of unconfirmed method stubs layered on top:
//!
//! ```text
//!  call ──► stub writes store ──► originals saved per document ("server doc")
//!                                        │
//!  added/changed/removed for a stub-written doc update the server doc only
//!                                        │
//!  updated [m] ──► last stub done with doc? ──► replace store doc with server doc
//!              └─► after every server doc is flushed ──► deliver m's result
//! ```
//!
//! After a reconnect to a new session, data is held back until every
//! resubscribed subscription is ready and every resent method is updated;
//! the stores are then reset and the held messages applied as one batch.
//!
//! Inputs are [`ClientState::on_reset`], [`ClientState::on_message`] and the
//! API calls; outputs are queued [`Action`]s for the transport.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use indexmap::IndexMap;
use livedata_core::random::{self, collection_scope};
use livedata_core::{
    apply_changes, id_parse, id_stringify, ChangedFields, Collection, Document, IdMap, RandomStream, TypeRegistry,
    Value,
};
use tokio::sync::{oneshot, watch};

use crate::error::MethodError;
use crate::protocol::DdpMessage;

/// What the transport should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(DdpMessage),
    /// Drop the current connection and connect again at once.
    Reconnect,
    /// Close for good.
    Fail(String),
}

/// Lifecycle of a client subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionState {
    Pending,
    Ready,
    Stopped(Option<MethodError>),
}

pub type StubHandler = Arc<dyn Fn(&mut StubInvocation, &[Value]) -> Result<Value, MethodError> + Send + Sync>;

/// Per-call options for [`ClientState::apply`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Hold every later call until this one has completed.
    pub wait: bool,
    /// Fail instead of resending after a reconnect.
    pub no_retry: bool,
    /// Hand the stub's return value back to the caller.
    pub return_stub_value: bool,
}

/// Context a method stub runs with.
pub struct StubInvocation {
    user_id: Option<String>,
    new_user_id: Option<Option<String>>,
    random: RandomStream,
}

impl fmt::Debug for StubInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubInvocation").field("user_id", &self.user_id).field("seed", &self.random.seed()).finish()
    }
}

impl StubInvocation {
    fn new(user_id: Option<String>, seed: String) -> Self {
        Self { user_id, new_user_id: None, random: RandomStream::new(seed) }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn is_simulation(&self) -> bool {
        true
    }

    pub fn set_user_id(&mut self, user_id: Option<String>) {
        self.user_id = user_id.clone();
        self.new_user_id = Some(user_id);
    }

    pub fn random_stream(&mut self) -> &mut RandomStream {
        &mut self.random
    }

    /// Insert with an id drawn from the call's seeded stream, matching the
    /// id the server will generate for the same insert.
    pub fn insert(&mut self, collection: &Collection, mut doc: Document) -> livedata_core::Result<Value> {
        if !doc.contains_key("_id") {
            let id = self.random.id(&collection_scope(&collection.name()));
            doc.shift_insert(0, "_id".to_string(), Value::String(id));
        }
        collection.insert(doc)
    }
}

#[derive(Debug)]
enum StoreUpdate {
    Added { id: Value, fields: Document },
    Changed { id: Value, fields: ChangedFields },
    Removed { id: Value },
    Replace { id: Value, doc: Option<Document> },
}

type Updates = IndexMap<String, Vec<StoreUpdate>>;

fn push_update(updates: &mut Updates, collection: &str, update: StoreUpdate) {
    updates.entry(collection.to_string()).or_default().push(update);
}

fn apply_update(store: &Collection, update: StoreUpdate) {
    let result = match update {
        StoreUpdate::Added { id, fields } => {
            if store.get(&id).is_some() {
                log::warn!("Expected not to find a document already present for an add: {id}");
            }
            store.replace(&id, Some(fields))
        }
        StoreUpdate::Changed { id, fields } => store.change(&id, &fields),
        StoreUpdate::Removed { id } => {
            if store.get(&id).is_none() {
                log::warn!("Expected to find a document to remove: {id}");
            }
            store.replace(&id, None)
        }
        StoreUpdate::Replace { id, doc } => store.replace(&id, doc),
    };
    if let Err(e) = result {
        log::warn!("Failed to apply server update to {}: {e}", store.name());
    }
}

/// Server's view of a document some pending stub has written.
#[derive(Debug)]
struct ServerDoc {
    document: Option<Document>,
    written_by_stubs: HashSet<String>,
    flush_waiters: Vec<u64>,
}

#[derive(Debug)]
enum AfterUpdate {
    SubReady(String),
    MethodDataVisible(String),
}

struct MethodInvoker {
    message: DdpMessage,
    wait: bool,
    no_retry: bool,
    sent: bool,
    data_visible: bool,
    result: Option<Result<Option<Value>, MethodError>>,
    callback: Option<oneshot::Sender<Result<Value, MethodError>>>,
}

#[derive(Debug)]
struct MethodBlock {
    wait: bool,
    methods: Vec<String>,
}

struct SubRecord {
    name: String,
    params: Vec<Value>,
    ready: bool,
    state: watch::Sender<SubscriptionState>,
}

pub(crate) struct ClientState {
    supported_versions: Vec<String>,
    types: TypeRegistry,
    /// Transport connection the queued actions belong to.
    pub generation: u64,
    version_suggestion: Option<String>,
    last_session_id: Option<String>,
    session: watch::Sender<Option<String>>,
    user_id: Option<String>,
    stores: HashMap<String, Collection>,
    updates_for_unknown_stores: HashMap<String, Vec<StoreUpdate>>,
    server_documents: HashMap<String, IdMap<ServerDoc>>,
    documents_written_by_stub: HashMap<String, Vec<(String, String)>>,
    stubs: HashMap<String, StubHandler>,
    method_invokers: HashMap<String, MethodInvoker>,
    outstanding_blocks: VecDeque<MethodBlock>,
    next_method_id: u64,
    subscriptions: IndexMap<String, SubRecord>,
    subs_being_revived: HashSet<String>,
    methods_blocking_quiescence: HashSet<String>,
    messages_buffered_until_quiescence: Vec<DdpMessage>,
    reset_stores: bool,
    after_update: Vec<AfterUpdate>,
    pending_flushes: HashMap<u64, (usize, AfterUpdate)>,
    next_flush_id: u64,
    actions: Vec<Action>,
}

impl ClientState {
    pub fn new(supported_versions: Vec<String>, types: TypeRegistry) -> Self {
        let (session, _) = watch::channel(None);
        Self {
            supported_versions,
            types,
            generation: 0,
            version_suggestion: None,
            last_session_id: None,
            session,
            user_id: None,
            stores: HashMap::new(),
            updates_for_unknown_stores: HashMap::new(),
            server_documents: HashMap::new(),
            documents_written_by_stub: HashMap::new(),
            stubs: HashMap::new(),
            method_invokers: HashMap::new(),
            outstanding_blocks: VecDeque::new(),
            next_method_id: 1,
            subscriptions: IndexMap::new(),
            subs_being_revived: HashSet::new(),
            methods_blocking_quiescence: HashSet::new(),
            messages_buffered_until_quiescence: Vec::new(),
            reset_stores: false,
            after_update: Vec::new(),
            pending_flushes: HashMap::new(),
            next_flush_id: 1,
            actions: Vec::new(),
        }
    }

    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    pub fn watch_session(&self) -> watch::Receiver<Option<String>> {
        self.session.subscribe()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.borrow().clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id.clone()
    }

    pub fn set_user_id(&mut self, user_id: Option<String>) {
        self.user_id = user_id;
    }

    fn send(&mut self, msg: DdpMessage) {
        self.actions.push(Action::Send(msg));
    }

    fn waiting_for_quiescence(&self) -> bool {
        !self.subs_being_revived.is_empty() || !self.methods_blocking_quiescence.is_empty()
    }

    // ---- stores -------------------------------------------------------

    /// The local store for `name`, created on first use. Data that arrived
    /// before the store existed is applied now.
    pub fn collection(&mut self, name: &str) -> Collection {
        if let Some(store) = self.stores.get(name) {
            return store.clone();
        }
        let store = Collection::new(name);
        self.stores.insert(name.to_string(), store.clone());
        if let Some(queued) = self.updates_for_unknown_stores.remove(name) {
            for update in queued {
                apply_update(&store, update);
            }
        }
        store
    }

    pub fn register_stub(&mut self, name: String, stub: StubHandler) {
        self.stubs.insert(name, stub);
    }

    // ---- methods ------------------------------------------------------

    /// Start a method call. Runs the stub, if any, right away and returns
    /// the method id, the stub's value when asked for, and the receiver for
    /// the server's outcome.
    pub fn apply(
        &mut self,
        name: &str,
        params: Vec<Value>,
        options: CallOptions,
    ) -> (String, Option<Value>, oneshot::Receiver<Result<Value, MethodError>>) {
        let id = self.next_method_id.to_string();
        self.next_method_id += 1;

        let mut random_seed = None;
        let mut stub_value = None;
        if let Some(stub) = self.stubs.get(name).cloned() {
            let seed = random::id_of_len(20);
            let mut invocation = StubInvocation::new(self.user_id.clone(), seed.clone());
            self.save_originals();
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| stub(&mut invocation, &params)));
            self.retrieve_and_store_originals(&id);
            match outcome {
                Ok(Ok(value)) => stub_value = Some(value),
                Ok(Err(e)) => log::debug!("Exception while simulating the effect of invoking '{name}': {e}"),
                Err(_) => log::warn!("Stub for '{name}' panicked"),
            }
            if let Some(user_id) = invocation.new_user_id {
                self.user_id = user_id;
            }
            random_seed = Some(seed);
        }

        let (callback, receiver) = oneshot::channel();
        let message = DdpMessage::Method { id: id.clone(), method: name.to_string(), params, random_seed };
        self.method_invokers.insert(
            id.clone(),
            MethodInvoker {
                message,
                wait: options.wait,
                no_retry: options.no_retry,
                sent: false,
                data_visible: false,
                result: None,
                callback: Some(callback),
            },
        );

        if options.wait {
            self.outstanding_blocks.push_back(MethodBlock { wait: true, methods: vec![id.clone()] });
        } else {
            match self.outstanding_blocks.back_mut() {
                Some(block) if !block.wait => block.methods.push(id.clone()),
                _ => self.outstanding_blocks.push_back(MethodBlock { wait: false, methods: vec![id.clone()] }),
            }
        }
        if self.outstanding_blocks.len() == 1 {
            self.send_method(&id);
        }

        let stub_value = if options.return_stub_value { stub_value } else { None };
        (id, stub_value, receiver)
    }

    fn send_method(&mut self, id: &str) {
        let Some(invoker) = self.method_invokers.get_mut(id) else {
            return;
        };
        if invoker.result.is_some() {
            log::warn!("Not resending method {id}: it already has a result");
            return;
        }
        invoker.data_visible = false;
        invoker.sent = true;
        let message = invoker.message.clone();
        if invoker.wait {
            self.methods_blocking_quiescence.insert(id.to_string());
        }
        self.send(message);
    }

    fn send_outstanding_methods(&mut self) {
        let ids = self.outstanding_blocks.front().map(|b| b.methods.clone()).unwrap_or_default();
        for id in ids {
            self.send_method(&id);
        }
    }

    fn maybe_invoke_callback(&mut self, id: &str) {
        let done = self.method_invokers.get(id).is_some_and(|i| i.result.is_some() && i.data_visible);
        if !done {
            return;
        }
        let Some(invoker) = self.method_invokers.remove(id) else {
            return;
        };
        if let (Some(callback), Some(result)) = (invoker.callback, invoker.result) {
            let _ = callback.send(result.map(|v| v.unwrap_or(Value::Null)));
        }
        self.outstanding_method_finished();
    }

    fn outstanding_method_finished(&mut self) {
        if self.method_invokers.values().any(|i| i.sent) {
            return;
        }
        if let Some(first) = self.outstanding_blocks.pop_front() {
            if !first.methods.is_empty() {
                log::warn!("No methods outstanding but nonempty block: {first:?}");
                self.outstanding_blocks.push_front(first);
                return;
            }
            if !self.outstanding_blocks.is_empty() {
                self.send_outstanding_methods();
            }
        }
    }

    fn save_originals(&mut self) {
        for store in self.stores.values() {
            store.save_originals();
        }
    }

    fn retrieve_and_store_originals(&mut self, method_id: &str) {
        let mut written = Vec::new();
        for (collection, store) in &self.stores {
            for (key, original) in store.retrieve_originals() {
                written.push((collection.clone(), key.clone()));
                let docs = self.server_documents.entry(collection.clone()).or_default();
                let server_doc = docs.entry_or_insert_with(key, || ServerDoc {
                    document: original,
                    written_by_stubs: HashSet::new(),
                    flush_waiters: Vec::new(),
                });
                server_doc.written_by_stubs.insert(method_id.to_string());
            }
        }
        if !written.is_empty() {
            self.documents_written_by_stub.insert(method_id.to_string(), written);
        }
    }

    // ---- subscriptions ------------------------------------------------

    pub fn subscribe(&mut self, name: &str, params: Vec<Value>) -> (String, watch::Receiver<SubscriptionState>) {
        let id = random::id();
        let (state, receiver) = watch::channel(SubscriptionState::Pending);
        self.subscriptions.insert(
            id.clone(),
            SubRecord { name: name.to_string(), params: params.clone(), ready: false, state },
        );
        self.send(DdpMessage::Sub { id: id.clone(), name: name.to_string(), params });
        (id, receiver)
    }

    pub fn unsubscribe(&mut self, id: &str) {
        if let Some(record) = self.subscriptions.shift_remove(id) {
            record.state.send_replace(SubscriptionState::Stopped(None));
            self.send(DdpMessage::Unsub { id: id.to_string() });
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    // ---- transport events ---------------------------------------------

    /// A new transport connection is up: handshake, then resend whatever
    /// the server must hear again.
    pub fn on_reset(&mut self) {
        let version = self
            .version_suggestion
            .clone()
            .or_else(|| self.supported_versions.first().cloned())
            .unwrap_or_else(|| "1".to_string());
        self.version_suggestion = Some(version.clone());
        self.send(DdpMessage::Connect {
            version,
            support: self.supported_versions.clone(),
            session: self.last_session_id.clone(),
        });

        let invokers = &self.method_invokers;
        let mut failed = Vec::new();
        if let Some(first) = self.outstanding_blocks.front_mut() {
            first.methods.retain(|id| {
                let drop = invokers.get(id).is_some_and(|i| i.sent && i.no_retry);
                if drop {
                    failed.push(id.clone());
                }
                !drop
            });
        }
        for id in failed {
            if let Some(callback) = self.method_invokers.remove(&id).and_then(|i| i.callback) {
                let _ = callback.send(Err(MethodError::connection_lost()));
            }
        }
        if self.outstanding_blocks.front().is_some_and(|b| b.methods.is_empty()) {
            self.outstanding_blocks.pop_front();
        }

        for invoker in self.method_invokers.values_mut() {
            invoker.sent = false;
        }
        self.send_outstanding_methods();

        let subs: Vec<DdpMessage> = self
            .subscriptions
            .iter()
            .map(|(id, sub)| DdpMessage::Sub { id: id.clone(), name: sub.name.clone(), params: sub.params.clone() })
            .collect();
        for sub in subs {
            self.send(sub);
        }
    }

    pub fn on_disconnect(&mut self) {
        self.session.send_replace(None);
    }

    pub fn on_message(&mut self, text: &str) {
        let msg = match DdpMessage::decode(text, &self.types) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Discarding message with invalid content: {e}");
                return;
            }
        };
        log::debug!("Client received {}", msg.kind());
        match msg {
            DdpMessage::Connected { session } => self.livedata_connected(session),
            DdpMessage::Failed { version } => {
                if self.supported_versions.contains(&version) {
                    log::info!("Server proposed DDP version {version}; reconnecting");
                    self.version_suggestion = Some(version);
                    self.actions.push(Action::Reconnect);
                } else {
                    let reason = format!("DDP version negotiation failed; server requested version {version}");
                    log::error!("{reason}");
                    self.actions.push(Action::Fail(reason));
                }
            }
            DdpMessage::Ping { id } => self.send(DdpMessage::Pong { id }),
            DdpMessage::Pong { .. } => {}
            DdpMessage::Nosub { id, error } => {
                self.livedata_data(DdpMessage::Nosub { id: id.clone(), error: error.clone() });
                if let Some(record) = self.subscriptions.shift_remove(&id) {
                    if let Some(e) = &error {
                        log::warn!("Subscription {} ({id}) stopped: {e}", record.name);
                    }
                    record.state.send_replace(SubscriptionState::Stopped(error));
                }
            }
            data @ (DdpMessage::Added { .. }
            | DdpMessage::Changed { .. }
            | DdpMessage::Removed { .. }
            | DdpMessage::Ready { .. }
            | DdpMessage::Updated { .. }) => self.livedata_data(data),
            DdpMessage::Result { id, outcome } => self.livedata_result(id, outcome),
            DdpMessage::Error { reason, offending_message } => {
                log::warn!("Received error from server: {reason} ({offending_message:?})");
            }
            other => log::warn!("Discarding unexpected {} message", other.kind()),
        }
    }

    fn livedata_connected(&mut self, session: String) {
        if self.last_session_id.is_some() {
            self.reset_stores = true;
        }
        let reconnected_to_previous = self.last_session_id.as_deref() == Some(session.as_str());
        self.last_session_id = Some(session.clone());
        self.session.send_replace(Some(session));
        if reconnected_to_previous {
            return;
        }

        self.updates_for_unknown_stores.clear();
        if self.reset_stores {
            self.documents_written_by_stub.clear();
            self.server_documents.clear();
            self.pending_flushes.clear();
        }
        self.after_update.clear();

        self.subs_being_revived = self.subscriptions.iter().filter(|(_, s)| s.ready).map(|(id, _)| id.clone()).collect();

        self.methods_blocking_quiescence.clear();
        if self.reset_stores {
            for (id, invoker) in &self.method_invokers {
                if invoker.result.is_some() {
                    self.after_update.push(AfterUpdate::MethodDataVisible(id.clone()));
                } else if invoker.sent {
                    self.methods_blocking_quiescence.insert(id.clone());
                }
            }
        }

        self.messages_buffered_until_quiescence.clear();
        if !self.waiting_for_quiescence() {
            if self.reset_stores {
                for store in self.stores.values() {
                    store.pause_observers();
                    store.clear();
                    store.resume_observers();
                }
                self.reset_stores = false;
            }
            self.run_after_update_callbacks();
        }
    }

    fn livedata_data(&mut self, msg: DdpMessage) {
        let mut updates = Updates::new();
        if self.waiting_for_quiescence() {
            match &msg {
                DdpMessage::Nosub { id, .. } => {
                    self.subs_being_revived.remove(id);
                }
                DdpMessage::Ready { subs } => {
                    for id in subs {
                        self.subs_being_revived.remove(id);
                    }
                }
                DdpMessage::Updated { methods } => {
                    for id in methods {
                        self.methods_blocking_quiescence.remove(id);
                    }
                }
                _ => {}
            }
            self.messages_buffered_until_quiescence.push(msg);
            if self.waiting_for_quiescence() {
                return;
            }
            for buffered in std::mem::take(&mut self.messages_buffered_until_quiescence) {
                self.process_one_data_message(buffered, &mut updates);
            }
        } else {
            self.process_one_data_message(msg, &mut updates);
        }
        self.perform_writes(updates);
    }

    fn process_one_data_message(&mut self, msg: DdpMessage, updates: &mut Updates) {
        match msg {
            DdpMessage::Added { collection, id, fields } => self.process_added(collection, id, fields, updates),
            DdpMessage::Changed { collection, id, fields } => self.process_changed(collection, id, fields, updates),
            DdpMessage::Removed { collection, id } => self.process_removed(collection, id, updates),
            DdpMessage::Ready { subs } => {
                for id in subs {
                    self.run_when_all_server_docs_are_flushed(AfterUpdate::SubReady(id));
                }
            }
            DdpMessage::Updated { methods } => self.process_updated(methods, updates),
            _ => {}
        }
    }

    fn server_doc_mut(&mut self, collection: &str, id: &Value) -> Option<&mut ServerDoc> {
        let key = id_stringify(id).ok()?;
        self.server_documents.get_mut(collection)?.get_mut(&key)
    }

    fn process_added(&mut self, collection: String, id: Value, fields: Document, updates: &mut Updates) {
        let reset_stores = self.reset_stores;
        let current = reset_stores.then(|| self.stores.get(&collection).and_then(|s| s.get(&id))).flatten();
        let Some(server_doc) = self.server_doc_mut(&collection, &id) else {
            push_update(updates, &collection, StoreUpdate::Added { id, fields });
            return;
        };
        let existed = server_doc.document.is_some();
        let mut document = fields.clone();
        document.shift_insert(0, "_id".to_string(), id.clone());
        server_doc.document = Some(document);
        if reset_stores {
            // Keep the stub's values in the store until the stub is done.
            let fields = match current {
                Some(mut doc) => {
                    doc.shift_remove("_id");
                    doc
                }
                None => fields,
            };
            push_update(updates, &collection, StoreUpdate::Added { id, fields });
        } else if existed {
            log::warn!("Server sent add for existing id {id} in {collection}");
        }
    }

    fn process_changed(&mut self, collection: String, id: Value, fields: ChangedFields, updates: &mut Updates) {
        match self.server_doc_mut(&collection, &id) {
            Some(server_doc) => match &mut server_doc.document {
                Some(document) => apply_changes(document, &fields),
                None => log::warn!("Server sent changed for nonexisting id {id} in {collection}"),
            },
            None => push_update(updates, &collection, StoreUpdate::Changed { id, fields }),
        }
    }

    fn process_removed(&mut self, collection: String, id: Value, updates: &mut Updates) {
        match self.server_doc_mut(&collection, &id) {
            Some(server_doc) => {
                if server_doc.document.take().is_none() {
                    log::warn!("Server sent removed for nonexisting id {id} in {collection}");
                }
            }
            None => push_update(updates, &collection, StoreUpdate::Removed { id }),
        }
    }

    fn process_updated(&mut self, methods: Vec<String>, updates: &mut Updates) {
        for method_id in methods {
            let written = self.documents_written_by_stub.remove(&method_id).unwrap_or_default();
            for (collection, key) in written {
                let Some(docs) = self.server_documents.get_mut(&collection) else {
                    log::warn!("Lost server doc for {collection}/{key}");
                    continue;
                };
                let Some(server_doc) = docs.get_mut(&key) else {
                    log::warn!("Lost server doc for {collection}/{key}");
                    continue;
                };
                server_doc.written_by_stubs.remove(&method_id);
                if !server_doc.written_by_stubs.is_empty() {
                    continue;
                }
                // Every stub that wrote this document is done: the server's
                // version replaces whatever the stubs left behind.
                let Some(server_doc) = docs.remove(&key) else { continue };
                match id_parse(&key) {
                    Ok(id) => push_update(updates, &collection, StoreUpdate::Replace { id, doc: server_doc.document }),
                    Err(e) => log::warn!("Unparseable id {key} in {collection}: {e}"),
                }
                for waiter in server_doc.flush_waiters {
                    self.server_doc_flushed(waiter);
                }
            }
            if self.method_invokers.contains_key(&method_id) {
                self.run_when_all_server_docs_are_flushed(AfterUpdate::MethodDataVisible(method_id));
            } else {
                log::warn!("No callback invoker for method {method_id}");
            }
        }
    }

    fn livedata_result(&mut self, id: String, outcome: Result<Option<Value>, MethodError>) {
        let Some(block) = self.outstanding_blocks.front_mut() else {
            log::warn!("Received method result but no methods outstanding");
            return;
        };
        let Some(pos) = block.methods.iter().position(|m| *m == id) else {
            log::warn!("Can't match method response to original method call: {id}");
            return;
        };
        block.methods.remove(pos);
        if let Some(invoker) = self.method_invokers.get_mut(&id) {
            invoker.result = Some(outcome);
        }
        self.maybe_invoke_callback(&id);
    }

    /// Queue `after` to run once every server doc written by a sent
    /// method's stub has been written back to its store.
    fn run_when_all_server_docs_are_flushed(&mut self, after: AfterUpdate) {
        let invokers = &self.method_invokers;
        let mut unflushed = Vec::new();
        for (collection, docs) in &self.server_documents {
            for (key, doc) in docs.iter() {
                if doc.written_by_stubs.iter().any(|m| invokers.get(m).is_some_and(|i| i.sent)) {
                    unflushed.push((collection.clone(), key.to_string()));
                }
            }
        }
        if unflushed.is_empty() {
            self.after_update.push(after);
            return;
        }
        let flush_id = self.next_flush_id;
        self.next_flush_id += 1;
        self.pending_flushes.insert(flush_id, (unflushed.len(), after));
        for (collection, key) in unflushed {
            if let Some(doc) = self.server_documents.get_mut(&collection).and_then(|d| d.get_mut(&key)) {
                doc.flush_waiters.push(flush_id);
            }
        }
    }

    fn server_doc_flushed(&mut self, flush_id: u64) {
        let Some(entry) = self.pending_flushes.get_mut(&flush_id) else {
            return;
        };
        entry.0 -= 1;
        if entry.0 == 0 {
            if let Some((_, after)) = self.pending_flushes.remove(&flush_id) {
                self.after_update.push(after);
            }
        }
    }

    fn perform_writes(&mut self, updates: Updates) {
        if self.reset_stores || !updates.is_empty() {
            let reset = std::mem::take(&mut self.reset_stores);
            let mut paused = Vec::new();
            for (name, store) in &self.stores {
                let batch = updates.get(name).map_or(0, Vec::len);
                if batch > 1 || reset {
                    store.pause_observers();
                    paused.push(store.clone());
                }
                if reset {
                    store.clear();
                }
            }
            for (name, batch) in updates {
                match self.stores.get(&name) {
                    Some(store) => {
                        for update in batch {
                            apply_update(store, update);
                        }
                    }
                    None => self.updates_for_unknown_stores.entry(name).or_default().extend(batch),
                }
            }
            for store in paused {
                store.resume_observers();
            }
        }
        self.run_after_update_callbacks();
    }

    fn run_after_update_callbacks(&mut self) {
        for after in std::mem::take(&mut self.after_update) {
            match after {
                AfterUpdate::SubReady(id) => {
                    if let Some(record) = self.subscriptions.get_mut(&id) {
                        if !record.ready {
                            record.ready = true;
                            record.state.send_replace(SubscriptionState::Ready);
                        }
                    }
                }
                AfterUpdate::MethodDataVisible(id) => {
                    if let Some(invoker) = self.method_invokers.get_mut(&id) {
                        invoker.data_visible = true;
                    }
                    self.maybe_invoke_callback(&id);
                }
            }
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

    fn state() -> ClientState {
        ClientState::new(vec!["1".into(), "pre2".into(), "pre1".into()], TypeRegistry::new())
    }

    fn feed(state: &mut ClientState, msg: DdpMessage) {
        state.on_message(&msg.encode().unwrap());
    }

    fn sent(state: &mut ClientState) -> Vec<DdpMessage> {
        state
            .take_actions()
            .into_iter()
            .filter_map(|a| match a {
                Action::Send(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn connect(state: &mut ClientState, session: &str) {
        state.on_reset();
        feed(state, DdpMessage::Connected { session: session.into() });
    }

    #[test]
    fn test_handshake_uses_first_supported_version() {
        let mut st = state();
        st.on_reset();
        assert_eq!(
            sent(&mut st),
            vec![DdpMessage::Connect { version: "1".into(), support: vec!["1".into(), "pre2".into(), "pre1".into()], session: None }]
        );
    }

    #[test]
    fn test_failed_with_supported_version_reconnects() {
        let mut st = state();
        st.on_reset();
        st.take_actions();
        feed(&mut st, DdpMessage::Failed { version: "pre2".into() });
        assert_eq!(st.take_actions(), vec![Action::Reconnect]);
        st.on_reset();
        match &sent(&mut st)[0] {
            DdpMessage::Connect { version, .. } => assert_eq!(version, "pre2"),
            other => panic!("unexpected {other:?}"),
        }
        feed(&mut st, DdpMessage::Failed { version: "7".into() });
        assert!(matches!(st.take_actions().as_slice(), [Action::Fail(_)]));
    }

    #[test]
    fn test_stub_then_server_version_wins() {
        let mut st = state();
        connect(&mut st, "s1");
        st.take_actions();
        let items = st.collection("items");
        let stub_items = items.clone();
        st.register_stub(
            "items.insert".into(),
            Arc::new(move |inv: &mut StubInvocation, _params: &[Value]| {
                inv.insert(&stub_items, doc(json!({"title": "X"}))).map_err(|e| MethodError::new(400, e.to_string()))
            }),
        );

        let (id, stub_value, mut rx) =
            st.apply("items.insert", vec![], CallOptions { return_stub_value: true, ..Default::default() });
        let doc_id = stub_value.unwrap();
        assert_eq!(items.get(&doc_id).unwrap()["title"], Value::from("X"));
        let seed = match &sent(&mut st)[0] {
            DdpMessage::Method { random_seed: Some(seed), .. } => seed.clone(),
            other => panic!("unexpected {other:?}"),
        };
        // The server derives the same id from the seed.
        let mut stream = RandomStream::new(seed);
        assert_eq!(Value::String(stream.id(&collection_scope("items"))), doc_id);

        feed(&mut st, DdpMessage::Added { collection: "items".into(), id: doc_id.clone(), fields: doc(json!({"title": "X'"})) });
        // Server data for a stub-written doc is held back.
        assert_eq!(items.get(&doc_id).unwrap()["title"], Value::from("X"));

        feed(&mut st, DdpMessage::Result { id: id.clone(), outcome: Ok(Some(Value::from(1))) });
        assert!(rx.try_recv().is_err());

        feed(&mut st, DdpMessage::Updated { methods: vec![id] });
        assert_eq!(items.get(&doc_id).unwrap()["title"], Value::from("X'"));
        assert_eq!(rx.try_recv().unwrap(), Ok(Value::from(1)));
    }

    #[test]
    fn test_stub_write_reverted_when_server_writes_nothing() {
        let mut st = state();
        connect(&mut st, "s1");
        let items = st.collection("items");
        let stub_items = items.clone();
        st.register_stub(
            "bump".into(),
            Arc::new(move |_inv: &mut StubInvocation, _params: &[Value]| {
                stub_items.insert(doc(json!({"_id": "a"}))).map_err(|e| MethodError::new(400, e.to_string()))
            }),
        );
        let (id, _, mut rx) = st.apply("bump", vec![], CallOptions::default());
        assert_eq!(items.len(), 1);
        feed(&mut st, DdpMessage::Result { id: id.clone(), outcome: Ok(None) });
        feed(&mut st, DdpMessage::Updated { methods: vec![id] });
        assert!(items.is_empty());
        assert_eq!(rx.try_recv().unwrap(), Ok(Value::Null));
    }

    #[test]
    fn test_wait_method_holds_later_calls() {
        let mut st = state();
        connect(&mut st, "s1");
        st.take_actions();
        let (first, _, _) = st.apply("login", vec![], CallOptions { wait: true, ..Default::default() });
        let (second, _, _) = st.apply("other", vec![], CallOptions::default());
        let kinds: Vec<String> = sent(&mut st)
            .into_iter()
            .filter_map(|m| match m {
                DdpMessage::Method { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![first.clone()]);

        feed(&mut st, DdpMessage::Result { id: first.clone(), outcome: Ok(None) });
        feed(&mut st, DdpMessage::Updated { methods: vec![first] });
        match sent(&mut st).as_slice() {
            [DdpMessage::Method { id, .. }] => assert_eq!(id, &second),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_reset_resends_methods_and_fails_no_retry() {
        let mut st = state();
        connect(&mut st, "s1");
        st.take_actions();
        let (keep, _, _) = st.apply("a", vec![], CallOptions::default());
        let (_, _, mut dropped) = st.apply("b", vec![], CallOptions { no_retry: true, ..Default::default() });
        let (sub_id, _) = st.subscribe("items", vec![]);
        st.take_actions();

        st.on_disconnect();
        st.on_reset();
        let msgs = sent(&mut st);
        assert!(matches!(&msgs[0], DdpMessage::Connect { session: Some(s), .. } if s == "s1"));
        assert!(matches!(&msgs[1], DdpMessage::Method { id, .. } if *id == keep));
        assert!(matches!(&msgs[2], DdpMessage::Sub { id, .. } if *id == sub_id));
        assert_eq!(msgs.len(), 3);
        assert_eq!(dropped.try_recv().unwrap(), Err(MethodError::connection_lost()));
    }

    #[test]
    fn test_quiescence_resets_stores_once() {
        let mut st = state();
        connect(&mut st, "s1");
        let items = st.collection("items");
        let (sub_id, mut sub_state) = st.subscribe("items", vec![]);
        feed(&mut st, DdpMessage::Added { collection: "items".into(), id: Value::from("a"), fields: doc(json!({"n": 1})) });
        feed(&mut st, DdpMessage::Ready { subs: vec![sub_id.clone()] });
        assert_eq!(*sub_state.borrow_and_update(), SubscriptionState::Ready);

        // New session: old data stays visible until the sub is ready again.
        st.on_disconnect();
        connect(&mut st, "s2");
        feed(&mut st, DdpMessage::Added { collection: "items".into(), id: Value::from("b"), fields: doc(json!({"n": 2})) });
        assert!(items.get(&Value::from("a")).is_some());
        assert!(items.get(&Value::from("b")).is_none());

        feed(&mut st, DdpMessage::Ready { subs: vec![sub_id] });
        assert!(items.get(&Value::from("a")).is_none());
        assert_eq!(items.get(&Value::from("b")).unwrap()["n"], Value::from(2));
    }

    #[test]
    fn test_unknown_store_updates_replayed() {
        let mut st = state();
        connect(&mut st, "s1");
        feed(&mut st, DdpMessage::Added { collection: "late".into(), id: Value::from("x"), fields: doc(json!({"v": true})) });
        let late = st.collection("late");
        assert_eq!(late.get(&Value::from("x")).unwrap()["v"], Value::from(true));
    }

    #[test]
    fn test_nosub_error_reaches_handle() {
        let mut st = state();
        connect(&mut st, "s1");
        let (id, mut sub_state) = st.subscribe("missing", vec![]);
        let error = MethodError::not_found("Subscription 'missing' not found");
        feed(&mut st, DdpMessage::Nosub { id, error: Some(error.clone()) });
        assert_eq!(*sub_state.borrow_and_update(), SubscriptionState::Stopped(Some(error)));
        assert_eq!(st.subscription_count(), 0);
    }

    #[test]
    fn test_ping_answered() {
        let mut st = state();
        feed(&mut st, DdpMessage::Ping { id: Some("p".into()) });
        assert_eq!(sent(&mut st), vec![DdpMessage::Pong { id: Some("p".into()) }]);
    }
}
