//! DDP client with local stores and latency compensation.
//!
//! ```text
//!  app ── apply/subscribe ──► ClientState ── Action::Send ──► ClientStream ── ws ──► server
//!   ▲                           │   ▲                               │
//!   └── Collection observers ◄──┘   └──────── on_message ───────────┘
//! ```
//!
//! Store writes, their observer callbacks and method stubs all run while
//! the client state is locked. Neither observers nor stubs may call back
//! into the [`DdpClient`] (not even [`DdpClient::collection`]); a stub
//! should capture the [`Collection`] handles it writes to before it is
//! registered, and an observer should hand follow-up work to a task.

pub mod state;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use livedata_core::{Collection, TypeRegistry, Value};
use tokio::sync::{oneshot, watch};

use crate::error::{ClientError, MethodError};
use crate::protocol::SUPPORTED_VERSIONS;
use crate::retry::RetryConfig;
use crate::stream::{ClientStream, StreamConfig, StreamHandler, StreamStatus};

pub use state::{CallOptions, StubInvocation, SubscriptionState};
use state::{Action, ClientState};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the server
    pub url: String,
    /// Idle time before the client pings; 0 disables heartbeats
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Protocol versions offered, most preferred first
    pub supported_versions: Vec<String>,
    pub retry: RetryConfig,
    /// Custom EJSON types understood in server messages
    pub types: TypeRegistry,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000/websocket".to_string(),
            heartbeat_interval_ms: 17_500,
            heartbeat_timeout_ms: 15_000,
            connect_timeout_ms: 10_000,
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
            retry: RetryConfig::default(),
            types: TypeRegistry::new(),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Default::default() }
    }
}

struct ClientInner {
    state: Mutex<ClientState>,
    stream: OnceLock<ClientStream>,
}

impl ClientInner {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand queued actions to the transport. Called with the state locked
    /// so frames keep their order.
    fn flush(&self, state: &mut ClientState) {
        let Some(stream) = self.stream.get() else {
            return;
        };
        for action in state.take_actions() {
            match action {
                Action::Send(msg) => match msg.encode() {
                    Ok(text) => stream.send(text, state.generation),
                    Err(e) => log::error!("Failed to encode {}: {e}", msg.kind()),
                },
                Action::Reconnect => stream.reconnect(true),
                Action::Fail(reason) => stream.fail(reason),
            }
        }
    }
}

impl StreamHandler for ClientInner {
    fn on_reset(&self, generation: u64) -> Vec<String> {
        let mut state = self.state();
        state.generation = generation;
        state.on_reset();
        let mut frames = Vec::new();
        for action in state.take_actions() {
            match action {
                Action::Send(msg) => match msg.encode() {
                    Ok(text) => frames.push(text),
                    Err(e) => log::error!("Failed to encode {}: {e}", msg.kind()),
                },
                other => log::warn!("Ignoring {other:?} during reset"),
            }
        }
        frames
    }

    fn on_message(&self, generation: u64, text: &str) {
        let mut state = self.state();
        if generation != state.generation {
            log::trace!("Ignoring message from stale connection {generation}");
            return;
        }
        state.on_message(text);
        self.flush(&mut state);
    }

    fn on_disconnect(&self) {
        self.state().on_disconnect();
    }
}

/// Connection to a DDP server. Cheap to clone.
#[derive(Clone)]
pub struct DdpClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for DdpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DdpClient").field("session", &self.session_id()).finish()
    }
}

impl DdpClient {
    /// Start connecting to `config.url`. Must be called inside a Tokio
    /// runtime; the connection is kept alive until every clone is dropped.
    pub fn connect(config: ClientConfig) -> Self {
        let stream_config = StreamConfig {
            url: config.url.clone(),
            heartbeat_interval_ms: config.heartbeat_interval_ms,
            heartbeat_timeout_ms: config.heartbeat_timeout_ms,
            connect_timeout_ms: config.connect_timeout_ms,
            retry: config.retry.clone(),
        };
        let inner = Arc::new(ClientInner {
            state: Mutex::new(ClientState::new(config.supported_versions, config.types)),
            stream: OnceLock::new(),
        });
        let weak = Arc::downgrade(&inner);
        let handler: Weak<dyn StreamHandler> = weak;
        let stream = ClientStream::spawn(stream_config, handler);
        let _ = inner.stream.set(stream);
        inner.flush(&mut inner.state());
        Self { inner }
    }

    fn stream(&self) -> Option<&ClientStream> {
        self.inner.stream.get()
    }

    pub fn status(&self) -> StreamStatus {
        self.stream().map_or(StreamStatus::Offline, ClientStream::status)
    }

    pub fn watch_status(&self) -> Option<watch::Receiver<StreamStatus>> {
        self.stream().map(ClientStream::watch_status)
    }

    /// Session id of the current connection, once `connected` arrived.
    pub fn session_id(&self) -> Option<String> {
        self.inner.state().session_id()
    }

    /// Wait for the handshake to finish and return the session id.
    pub async fn connected(&self) -> Result<String, ClientError> {
        let mut session = self.inner.state().watch_session();
        let mut status = self.watch_status().ok_or(ClientError::Stopped)?;
        loop {
            if let Some(id) = session.borrow_and_update().clone() {
                return Ok(id);
            }
            if let StreamStatus::Failed(reason) = status.borrow_and_update().clone() {
                return Err(if reason.starts_with("DDP version negotiation failed") {
                    ClientError::ProtocolVersion(reason)
                } else {
                    ClientError::Connection(reason)
                });
            }
            tokio::select! {
                changed = session.changed() => changed.map_err(|_| ClientError::Stopped)?,
                changed = status.changed() => changed.map_err(|_| ClientError::Stopped)?,
            }
        }
    }

    pub fn reconnect(&self) {
        if let Some(stream) = self.stream() {
            stream.reconnect(false);
        }
    }

    /// Close the connection and stop retrying until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        if let Some(stream) = self.stream() {
            stream.disconnect();
        }
    }

    /// The local store for `name`.
    pub fn collection(&self, name: &str) -> Collection {
        self.inner.state().collection(name)
    }

    /// Register a stub that simulates method `name` against the local stores
    /// while the server runs the real thing.
    ///
    /// The stub runs with the client locked: capture the collections it
    /// needs up front instead of calling back into this client.
    pub fn method_stub<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut StubInvocation, &[Value]) -> Result<Value, MethodError> + Send + Sync + 'static,
    {
        self.inner.state().register_stub(name.into(), Arc::new(f));
    }

    pub fn apply(&self, name: &str, params: Vec<Value>, options: CallOptions) -> MethodCall {
        let mut state = self.inner.state();
        let (id, stub_value, receiver) = state.apply(name, params, options);
        self.inner.flush(&mut state);
        MethodCall { id, stub_value, receiver }
    }

    /// Call `name` and wait for its result and the data it wrote.
    pub async fn call(&self, name: &str, params: Vec<Value>) -> Result<Value, ClientError> {
        self.apply(name, params, CallOptions::default()).result().await
    }

    pub fn subscribe(&self, name: &str, params: Vec<Value>) -> SubscriptionHandle {
        let mut state = self.inner.state();
        let (id, receiver) = state.subscribe(name, params);
        self.inner.flush(&mut state);
        SubscriptionHandle { id, state: receiver, client: self.clone() }
    }

    fn unsubscribe(&self, id: &str) {
        let mut state = self.inner.state();
        state.unsubscribe(id);
        self.inner.flush(&mut state);
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.state().user_id()
    }

    pub fn set_user_id(&self, user_id: Option<String>) {
        self.inner.state().set_user_id(user_id);
    }
}

/// An in-flight method call.
#[derive(Debug)]
pub struct MethodCall {
    id: String,
    stub_value: Option<Value>,
    receiver: oneshot::Receiver<Result<Value, MethodError>>,
}

impl MethodCall {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// What the stub returned, when `return_stub_value` was set.
    pub fn stub_value(&self) -> Option<&Value> {
        self.stub_value.as_ref()
    }

    /// Resolve once the server's result is in and the data it wrote is
    /// visible in the local stores.
    pub async fn result(self) -> Result<Value, ClientError> {
        let outcome = self.receiver.await.map_err(|_| ClientError::Stopped)?;
        Ok(outcome?)
    }
}

/// A live subscription. Dropping the handle does not stop it; call
/// [`stop`](Self::stop).
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: String,
    state: watch::Receiver<SubscriptionState>,
    client: DdpClient,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SubscriptionState {
        self.state.borrow().clone()
    }

    /// Wait until the initial data set is in the local stores.
    pub async fn ready(&mut self) -> Result<(), ClientError> {
        let state = self
            .state
            .wait_for(|s| *s != SubscriptionState::Pending)
            .await
            .map_err(|_| ClientError::Stopped)?
            .clone();
        match state {
            SubscriptionState::Ready => Ok(()),
            SubscriptionState::Stopped(Some(error)) => Err(ClientError::Method(error)),
            SubscriptionState::Stopped(None) | SubscriptionState::Pending => Err(ClientError::Stopped),
        }
    }

    pub fn stop(&self) {
        self.client.unsubscribe(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::new("ws://example.test/websocket");
        assert_eq!(config.url, "ws://example.test/websocket");
        assert_eq!(config.heartbeat_interval_ms, 17_500);
        assert_eq!(config.supported_versions[0], "1");
    }

    #[tokio::test]
    async fn test_offline_client_queues_calls() {
        let client = DdpClient::connect(ClientConfig { connect_timeout_ms: 50, ..ClientConfig::new("ws://127.0.0.1:1") });
        let items = client.collection("items");
        client.method_stub("add", move |inv, _| {
            inv.insert(&items, Default::default()).map_err(|e| MethodError::new(500, e.to_string()))
        });
        let call = client.apply("add", vec![], CallOptions { return_stub_value: true, ..Default::default() });
        assert!(call.stub_value().is_some());
        assert_eq!(client.collection("items").len(), 1);
        assert_eq!(client.session_id(), None);
    }
}
