//! One DDP session per WebSocket connection.
//!
//! The session task owns the merged view and every subscription. Inbound
//! `method`, `sub` and `unsub` messages are handled strictly in arrival
//! order; a running method holds the queue until it completes or calls
//! `unblock()`. Everything that changes what the client sees arrives as a
//! [`SessionEvent`] on one FIFO channel and is applied by the task alone.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::{FutureExt, SinkExt, StreamExt};
use livedata_core::{id_stringify, ChangedFields, Cursor, Document, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::{HandlerError, MethodError};
use crate::heartbeat::{sleep_until, Heartbeat, HeartbeatAction};
use crate::protocol::{negotiate_version, DdpMessage, ProtocolError};
use crate::rate_limiter::{InvocationType, RateLimitInput};
use crate::server::merge_box::{SessionView, SubKey};
use crate::server::method::MethodInvocation;
use crate::server::subscription::{Publication, PublishHandler, Subscription, SubscriptionSink};
use crate::server::{Connection, ServerShared};

/// Work delivered to a session task.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Added { key: SubKey, collection: String, id: Value, fields: Document },
    Changed { key: SubKey, collection: String, id: Value, fields: ChangedFields },
    Removed { key: SubKey, collection: String, id: Value },
    Ready { key: SubKey },
    SubError { key: SubKey, error: MethodError },
    SubStop { key: SubKey },
    MethodDone { id: String, outcome: Result<Value, MethodError> },
    Unblock { id: String },
    SetUserId { user_id: Option<String> },
    /// A message held back while a rerun was in progress.
    Send(DdpMessage),
    /// Marks the end of the data produced by a subscription rerun.
    Resume,
    Close,
}

struct ActiveSub {
    sub: Subscription,
    handler: PublishHandler,
    params: Vec<Value>,
    ready: bool,
    documents: HashSet<(String, String)>,
}

/// Convert a handler failure into what the client may see.
pub(crate) fn client_error(err: HandlerError, context: &str) -> MethodError {
    match err.downcast::<MethodError>() {
        Ok(e) => *e,
        Err(other) => {
            log::error!("Exception in {context}: {other}");
            MethodError::internal()
        }
    }
}

pub(crate) async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<ServerShared>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    let (out, mut out_rx) = mpsc::channel::<Message>(shared.config.outbound_capacity.max(1));
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = ws_sender.send(frame).await {
                log::debug!("Write to {addr} failed: {e}");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    // Handshake: nothing but `connect` is accepted until a session exists.
    let version = loop {
        let text = match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
                log::info!("Connection closed from {addr} before connect");
                drop(out);
                let _ = writer.await;
                return Ok(());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };
        let reply = match serde_json::from_str::<serde_json::Value>(text.as_str()) {
            Err(_) => DdpMessage::Error { reason: "Parse error".into(), offending_message: None },
            Ok(json) => match DdpMessage::from_json(&json, &shared.config.types) {
                Ok(DdpMessage::Connect { version, support, .. }) => {
                    let supported = &shared.config.supported_versions;
                    if support.contains(&version) && supported.contains(&version) {
                        break version;
                    }
                    let proposal = negotiate_version(&support, supported);
                    log::info!("Client {addr} asked for version {version}; proposing {proposal}");
                    let _ = write(&out, &DdpMessage::Failed { version: proposal }, addr).await;
                    drop(out);
                    let _ = writer.await;
                    return Ok(());
                }
                _ => DdpMessage::Error { reason: "Must connect first".into(), offending_message: Some(json) },
            },
        };
        write(&out, &reply, addr).await?;
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let connection = Connection::new(Uuid::new_v4().to_string(), addr.ip().to_string(), events_tx.clone());
    write(&out, &DdpMessage::Connected { session: connection.id().to_string() }, addr).await?;
    shared.stats.active_sessions.fetch_add(1, Ordering::Relaxed);
    log::info!("Session {} opened for {addr} (DDP {version})", connection.id());

    let hooks = shared.registry().on_connection.clone();
    for hook in hooks {
        hook(&connection);
    }

    let mut session = Session::new(Arc::clone(&shared), connection, addr, events_tx, out);
    session.start_universal_subs();
    let result = session.run(&mut ws_receiver, events_rx).await;
    session.shutdown();
    shared.stats.active_sessions.fetch_sub(1, Ordering::Relaxed);
    log::info!("Session {} closed", session.connection.id());

    drop(session);
    let _ = writer.await;
    result.map_err(Into::into)
}

async fn write(out: &mpsc::Sender<Message>, msg: &DdpMessage, addr: SocketAddr) -> Result<(), ProtocolError> {
    let text = match msg.encode() {
        Ok(text) => text,
        Err(e) => {
            log::error!("Dropping unencodable {} message for {addr}: {e}", msg.kind());
            return Ok(());
        }
    };
    match out.try_send(Message::Text(text.into())) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(frame)) => {
            log::warn!("Outbound queue for {addr} is full; client is lagging");
            out.send(frame).await.map_err(|_| ProtocolError::ConnectionClosed)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Err(ProtocolError::ConnectionClosed),
    }
}

struct Session {
    shared: Arc<ServerShared>,
    connection: Connection,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<SessionEvent>,
    out: mpsc::Sender<Message>,
    outbox: Vec<DdpMessage>,
    user_id: Option<String>,
    view: SessionView,
    subs: HashMap<SubKey, ActiveSub>,
    named_subs: HashMap<String, SubKey>,
    next_key: SubKey,
    in_queue: VecDeque<DdpMessage>,
    blocked_on: Option<String>,
    // Sending pauses while subscriptions rerun for a new user.
    pending_resumes: u32,
    before_rerun: Option<SessionView>,
    pending_ready: Vec<String>,
    deferred: Vec<SessionEvent>,
    closing: bool,
}

impl Session {
    fn new(
        shared: Arc<ServerShared>,
        connection: Connection,
        addr: SocketAddr,
        events: mpsc::UnboundedSender<SessionEvent>,
        out: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            shared,
            addr,
            connection,
            events,
            out,
            outbox: Vec::new(),
            user_id: None,
            view: SessionView::new(),
            subs: HashMap::new(),
            named_subs: HashMap::new(),
            next_key: 1,
            in_queue: VecDeque::new(),
            blocked_on: None,
            pending_resumes: 0,
            before_rerun: None,
            pending_ready: Vec::new(),
            deferred: Vec::new(),
            closing: false,
        }
    }

    fn is_sending(&self) -> bool {
        self.pending_resumes == 0
    }

    async fn run<S>(
        &mut self,
        source: &mut S,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Result<(), ProtocolError>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let config = &self.shared.config;
        let mut heartbeat = Heartbeat::new(config.heartbeat_interval_ms, config.heartbeat_timeout_ms, Instant::now());

        loop {
            self.flush().await?;
            if self.closing {
                return Ok(());
            }
            let deadline = heartbeat.next_deadline();
            tokio::select! {
                biased;

                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => return Ok(()),
                },

                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        heartbeat.message_received(Instant::now());
                        self.shared.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        self.handle_text(text.as_str());
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {}", self.connection.client_address());
                        return Ok(());
                    }
                    Some(Ok(_)) => heartbeat.message_received(Instant::now()),
                    Some(Err(e)) => {
                        log::error!("WebSocket error on session {}: {e}", self.connection.id());
                        return Ok(());
                    }
                },

                _ = sleep_until(deadline) => match heartbeat.poll(Instant::now()) {
                    HeartbeatAction::SendPing => {
                        log::trace!("Pinging session {}", self.connection.id());
                        self.outbox.push(DdpMessage::Ping { id: None });
                    }
                    HeartbeatAction::TimedOut => {
                        log::info!("Session {} timed out", self.connection.id());
                        return Ok(());
                    }
                    HeartbeatAction::Idle => {}
                },
            }
        }
    }

    async fn flush(&mut self) -> Result<(), ProtocolError> {
        for msg in std::mem::take(&mut self.outbox) {
            write(&self.out, &msg, self.addr).await?;
        }
        Ok(())
    }

    fn handle_text(&mut self, text: &str) {
        let json: serde_json::Value = match serde_json::from_str(text) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("Unparseable message on session {}: {e}", self.connection.id());
                self.outbox.push(DdpMessage::Error { reason: "Parse error".into(), offending_message: None });
                return;
            }
        };
        let msg = match DdpMessage::from_json(&json, &self.shared.config.types) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Bad message on session {}: {e}", self.connection.id());
                let reason = match json.get("msg").and_then(|m| m.as_str()) {
                    Some("sub") => "Malformed subscription",
                    Some("method") => "Malformed method invocation",
                    _ => "Bad request",
                };
                self.outbox.push(DdpMessage::Error { reason: reason.into(), offending_message: Some(json) });
                return;
            }
        };
        log::debug!("Session {} received {}", self.connection.id(), msg.kind());

        match msg {
            DdpMessage::Ping { id } => {
                if self.shared.config.respond_to_pings {
                    self.outbox.push(DdpMessage::Pong { id });
                }
            }
            DdpMessage::Pong { .. } => {}
            DdpMessage::Method { .. } | DdpMessage::Sub { .. } | DdpMessage::Unsub { .. } => {
                self.in_queue.push_back(msg);
                self.process_queue();
            }
            DdpMessage::Connect { .. } => {
                log::warn!("Session {} sent connect twice", self.connection.id());
            }
            other => {
                let offending = other.to_json().ok();
                self.outbox.push(DdpMessage::Error { reason: "Bad request".into(), offending_message: offending });
            }
        }
    }

    fn process_queue(&mut self) {
        while self.blocked_on.is_none() {
            let Some(msg) = self.in_queue.pop_front() else {
                break;
            };
            match msg {
                DdpMessage::Method { id, method, params, random_seed } => {
                    self.start_method(id, method, params, random_seed)
                }
                DdpMessage::Sub { id, name, params } => self.start_named_sub(id, name, params),
                DdpMessage::Unsub { id } => match self.named_subs.get(&id).copied() {
                    Some(key) => self.stop_sub(key, None),
                    None => self.outbox.push(DdpMessage::Nosub { id, error: None }),
                },
                _ => {}
            }
        }
    }

    fn rate_limit(&self, type_: InvocationType, name: &str) -> Option<MethodError> {
        let input = RateLimitInput {
            type_,
            name: name.to_string(),
            user_id: self.user_id.clone(),
            connection_id: self.connection.id().to_string(),
            client_address: self.connection.client_address().to_string(),
        };
        let mut limiter = self.shared.rate_limiter();
        limiter.increment(&input);
        let reply = limiter.check(&input);
        if reply.allowed {
            None
        } else {
            log::warn!("Rate limit exceeded for {name} on session {}", self.connection.id());
            Some(MethodError::too_many_requests(reply.time_to_reset.as_millis() as u64))
        }
    }

    fn start_method(&mut self, id: String, name: String, params: Vec<Value>, random_seed: Option<String>) {
        let handler = self.shared.registry().methods.get(&name).cloned();
        let Some(handler) = handler else {
            self.outbox.push(DdpMessage::Result {
                id: id.clone(),
                outcome: Err(MethodError::not_found(format!("Method '{name}' not found"))),
            });
            self.outbox.push(DdpMessage::Updated { methods: vec![id] });
            return;
        };
        if let Some(error) = self.rate_limit(InvocationType::Method, &name) {
            self.outbox.push(DdpMessage::Result { id: id.clone(), outcome: Err(error) });
            self.outbox.push(DdpMessage::Updated { methods: vec![id] });
            return;
        }

        let invocation = MethodInvocation::new(
            id.clone(),
            name.clone(),
            self.user_id.clone(),
            self.connection.clone(),
            random_seed,
            self.events.clone(),
        );
        self.blocked_on = Some(id.clone());
        let events = self.events.clone();
        tokio::spawn(async move {
            let run = AssertUnwindSafe(async move { handler(invocation, params).await });
            let outcome = match run.catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(client_error(e, &format!("method '{name}'"))),
                Err(_) => {
                    log::error!("Method '{name}' panicked");
                    Err(MethodError::internal())
                }
            };
            let _ = events.send(SessionEvent::MethodDone { id, outcome });
        });
    }

    fn start_named_sub(&mut self, id: String, name: String, params: Vec<Value>) {
        if self.named_subs.contains_key(&id) {
            log::debug!("Ignoring duplicate sub id {id}");
            return;
        }
        let handler = self.shared.registry().publications.get(&name).cloned();
        let Some(handler) = handler else {
            let error = MethodError::not_found(format!("Subscription '{name}' not found"));
            self.outbox.push(DdpMessage::Nosub { id, error: Some(error) });
            return;
        };
        if let Some(error) = self.rate_limit(InvocationType::Subscription, &name) {
            self.outbox.push(DdpMessage::Nosub { id, error: Some(error) });
            return;
        }
        self.start_sub(Some(id), Some(name), handler, params);
    }

    fn start_universal_subs(&mut self) {
        let handlers = self.shared.registry().universal.clone();
        for handler in handlers {
            self.start_sub(None, None, handler, Vec::new());
        }
    }

    fn start_sub(&mut self, id: Option<String>, name: Option<String>, handler: PublishHandler, params: Vec<Value>) {
        let key = self.next_key;
        self.next_key += 1;
        self.shared.stats.total_subscriptions.fetch_add(1, Ordering::Relaxed);

        let sink = SubscriptionSink::new(key, self.events.clone());
        let mut sub = Subscription::new(id.clone(), name.clone(), self.user_id.clone(), self.connection.clone(), sink);
        let context = format!("publication '{}'", name.as_deref().unwrap_or("<universal>"));
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&mut sub, params.clone())));

        let failure = match result {
            Ok(Ok(Publication::Cursors(cursors))) => publish_cursors(&mut sub, &cursors, &context).err(),
            Ok(Ok(Publication::Manual)) => None,
            Ok(Err(e)) => Some(client_error(e, &context)),
            Err(_) => {
                log::error!("{context} panicked");
                Some(MethodError::internal())
            }
        };

        if let Some(id) = &id {
            self.named_subs.insert(id.clone(), key);
        }
        self.subs.insert(key, ActiveSub { sub, handler, params, ready: false, documents: HashSet::new() });
        if let Some(error) = failure {
            self.stop_sub(key, Some(error));
        }
    }

    /// Tear down a subscription, retract its documents and, for named
    /// subscriptions, tell the client with `nosub`.
    fn stop_sub(&mut self, key: SubKey, error: Option<MethodError>) {
        let Some(mut active) = self.subs.remove(&key) else {
            return;
        };
        active.sub.deactivate();
        self.remove_documents(key, &active.documents);
        if let Some(id) = active.sub.id() {
            self.named_subs.remove(id);
            let nosub = DdpMessage::Nosub { id: id.to_string(), error };
            if self.is_sending() {
                self.outbox.push(nosub);
            } else {
                self.deferred.push(SessionEvent::Send(nosub));
            }
        } else if let Some(error) = error {
            log::warn!("Universal publication stopped with error: {error}");
        }
    }

    fn remove_documents(&mut self, key: SubKey, documents: &HashSet<(String, String)>) {
        for (collection, doc_key) in documents {
            let msg = self.view.removed(key, collection, doc_key);
            self.emit(msg);
        }
    }

    fn emit(&mut self, msg: Option<DdpMessage>) {
        if let Some(msg) = msg {
            if self.is_sending() {
                self.outbox.push(msg);
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Added { key, collection, id, fields } => {
                let Some(doc_key) = self.doc_key(&id) else { return };
                let Some(active) = self.subs.get_mut(&key) else { return };
                if !active.documents.insert((collection.clone(), doc_key.clone())) {
                    log::warn!("Publication added {collection}/{doc_key} twice");
                }
                let msg = self.view.added(key, &collection, &doc_key, &id, fields);
                self.emit(msg);
            }
            SessionEvent::Changed { key, collection, id, fields } => {
                let Some(doc_key) = self.doc_key(&id) else { return };
                let Some(active) = self.subs.get(&key) else { return };
                if !active.documents.contains(&(collection.clone(), doc_key.clone())) {
                    log::warn!("Publication changed {collection}/{doc_key} it never added");
                    return;
                }
                let msg = self.view.changed(key, &collection, &doc_key, fields);
                self.emit(msg);
            }
            SessionEvent::Removed { key, collection, id } => {
                let Some(doc_key) = self.doc_key(&id) else { return };
                let Some(active) = self.subs.get_mut(&key) else { return };
                if !active.documents.remove(&(collection.clone(), doc_key.clone())) {
                    log::warn!("Publication removed {collection}/{doc_key} it never added");
                    return;
                }
                let msg = self.view.removed(key, &collection, &doc_key);
                self.emit(msg);
            }
            SessionEvent::Ready { key } => {
                let Some(active) = self.subs.get_mut(&key) else { return };
                if active.ready {
                    return;
                }
                active.ready = true;
                if let Some(id) = active.sub.id().map(str::to_string) {
                    if self.is_sending() {
                        self.outbox.push(DdpMessage::Ready { subs: vec![id] });
                    } else {
                        self.pending_ready.push(id);
                    }
                }
            }
            SessionEvent::SubError { key, error } => self.stop_sub(key, Some(error)),
            SessionEvent::SubStop { key } => self.stop_sub(key, None),
            SessionEvent::MethodDone { id, outcome } => {
                if !self.is_sending() {
                    self.deferred.push(SessionEvent::MethodDone { id, outcome });
                    return;
                }
                self.outbox.push(DdpMessage::Result { id: id.clone(), outcome: outcome.map(Some) });
                self.outbox.push(DdpMessage::Updated { methods: vec![id.clone()] });
                self.unblock(&id);
            }
            SessionEvent::Unblock { id } => self.unblock(&id),
            SessionEvent::SetUserId { user_id } => self.rerun_subs(user_id),
            SessionEvent::Send(msg) => {
                if self.is_sending() {
                    self.outbox.push(msg);
                } else {
                    self.deferred.push(SessionEvent::Send(msg));
                }
            }
            SessionEvent::Resume => self.resume(),
            SessionEvent::Close => self.closing = true,
        }
    }

    fn doc_key(&self, id: &Value) -> Option<String> {
        match id_stringify(id) {
            Ok(key) => Some(key),
            Err(e) => {
                log::warn!("Publication used an invalid id on session {}: {e}", self.connection.id());
                None
            }
        }
    }

    fn unblock(&mut self, id: &str) {
        if self.blocked_on.as_deref() == Some(id) {
            self.blocked_on = None;
            self.process_queue();
        }
    }

    /// Rerun every subscription under `user_id`. Output is held back until
    /// the reruns' initial data has been applied, then only the difference
    /// is sent.
    fn rerun_subs(&mut self, user_id: Option<String>) {
        log::info!("Session {} user changed to {user_id:?}", self.connection.id());
        if self.pending_resumes == 0 {
            self.before_rerun = Some(self.view.clone());
        }
        self.pending_resumes += 1;
        self.user_id = user_id;

        let mut keys: Vec<SubKey> = self.subs.keys().copied().collect();
        keys.sort_unstable();
        let mut reruns = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(mut active) = self.subs.remove(&key) else { continue };
            active.sub.deactivate();
            self.remove_documents(key, &active.documents);
            if let Some(id) = active.sub.id() {
                self.named_subs.remove(id);
            }
            let id = active.sub.id().map(str::to_string);
            let name = active.sub.name().map(str::to_string);
            reruns.push((id, name, active.handler, active.params));
        }
        for (id, name, handler, params) in reruns {
            self.start_sub(id, name, handler, params);
        }
        let _ = self.events.send(SessionEvent::Resume);
    }

    fn resume(&mut self) {
        self.pending_resumes = self.pending_resumes.saturating_sub(1);
        if !self.is_sending() {
            return;
        }
        let before = self.before_rerun.take().unwrap_or_default();
        self.outbox.extend(self.view.diff(&before));
        if !self.pending_ready.is_empty() {
            self.outbox.push(DdpMessage::Ready { subs: std::mem::take(&mut self.pending_ready) });
        }
        for event in std::mem::take(&mut self.deferred) {
            self.handle_event(event);
        }
    }

    fn shutdown(&mut self) {
        for (_, mut active) in self.subs.drain() {
            active.sub.deactivate();
        }
        self.named_subs.clear();
    }
}

fn publish_cursors(sub: &mut Subscription, cursors: &[Cursor], context: &str) -> Result<(), MethodError> {
    let mut seen = HashSet::new();
    for cursor in cursors {
        let name = cursor.collection_name();
        if !seen.insert(name.clone()) {
            log::error!("{context} returned multiple cursors for collection {name}");
            return Err(MethodError::internal());
        }
    }
    for cursor in cursors {
        sub.observe(cursor);
    }
    sub.ready();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_keeps_method_errors() {
        let err: HandlerError = Box::new(MethodError::new(403, "denied"));
        assert_eq!(client_error(err, "test"), MethodError::new(403, "denied"));
    }

    #[test]
    fn test_client_error_hides_internal_errors() {
        let err: HandlerError = "database exploded".into();
        assert_eq!(client_error(err, "test"), MethodError::internal());
    }
}
