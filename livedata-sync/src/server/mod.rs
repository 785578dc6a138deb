//! DDP server: sessions, publications and methods.
//!
//! Architecture:
//! ```text
//!                    ┌──────────────────── Session (one task per socket) ───┐
//! Client ── ws ──►   │ in_queue ─► method ─► spawned handler ─┐             │
//!                    │     │                                   │ MethodDone  │
//!                    │     └──► sub ─► publish handler         ▼             │
//!                    │                   │ cursors ──► observers ─► events ─►│ SessionView ─► ws
//!                    └──────────────────────────────────────────────────────┘
//!                                        ▲
//!                    Collection writes ──┘ (from any session's methods)
//! ```
//!
//! Every subscription feeds one FIFO event channel per session. A method's
//! `result` and `updated` travel through the same channel after the data
//! events its writes produced, so the client never sees `updated` before
//! the data it implies.

pub mod merge_box;
pub mod method;
pub(crate) mod session;
pub mod subscription;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use livedata_core::{TypeRegistry, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::HandlerError;
use crate::protocol::SUPPORTED_VERSIONS;
use crate::rate_limiter::{RateLimiter, Rule};

pub use merge_box::SessionView;
pub use method::{MethodHandler, MethodInvocation};
pub use subscription::{Publication, PublishHandler, Subscription, SubscriptionSink};

use session::SessionEvent;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Idle time before the server pings a client; 0 disables heartbeats
    pub heartbeat_interval_ms: u64,
    /// How long a ping may go unanswered before the session is closed
    pub heartbeat_timeout_ms: u64,
    /// Answer client pings with pongs
    pub respond_to_pings: bool,
    /// Protocol versions accepted, most preferred first
    pub supported_versions: Vec<String>,
    /// Frames buffered per session before writes wait on the socket
    pub outbound_capacity: usize,
    /// Custom EJSON types accepted from clients
    pub types: TypeRegistry,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 15_000,
            respond_to_pings: true,
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
            outbound_capacity: 1024,
            types: TypeRegistry::new(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `LIVEDATA_BIND_ADDR` and `LIVEDATA_HEARTBEAT_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("LIVEDATA_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(raw) = std::env::var("LIVEDATA_HEARTBEAT_MS") {
            match raw.parse() {
                Ok(ms) => config.heartbeat_interval_ms = ms,
                Err(e) => log::warn!("Ignoring LIVEDATA_HEARTBEAT_MS={raw}: {e}"),
            }
        }
        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_sessions: u64,
    pub total_messages: u64,
    pub total_subscriptions: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub total_connections: AtomicU64,
    pub active_sessions: AtomicU64,
    pub total_messages: AtomicU64,
    pub total_subscriptions: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_subscriptions: self.total_subscriptions.load(Ordering::Relaxed),
        }
    }
}

/// A client connection as seen by methods, publications and hooks.
#[derive(Clone)]
pub struct Connection {
    id: String,
    client_address: String,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).field("client_address", &self.client_address).finish()
    }
}

impl Connection {
    pub(crate) fn new(id: String, client_address: String, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { id, client_address, events }
    }

    /// Session id sent to the client in `connected`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_address(&self) -> &str {
        &self.client_address
    }

    /// Close the session and its socket.
    pub fn close(&self) {
        let _ = self.events.send(SessionEvent::Close);
    }
}

pub type ConnectionHook = Arc<dyn Fn(&Connection) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Registry {
    pub methods: HashMap<String, MethodHandler>,
    pub publications: HashMap<String, PublishHandler>,
    pub universal: Vec<PublishHandler>,
    pub on_connection: Vec<ConnectionHook>,
}

/// State shared by the server handle and every session.
pub(crate) struct ServerShared {
    pub config: ServerConfig,
    pub registry: RwLock<Registry>,
    pub rate_limiter: Mutex<RateLimiter>,
    pub stats: StatsCounters,
}

impl ServerShared {
    pub fn registry(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn rate_limiter(&self) -> MutexGuard<'_, RateLimiter> {
        self.rate_limiter.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The DDP server. Register methods and publications, then [`run`](Self::run).
#[derive(Clone)]
pub struct DdpServer {
    shared: Arc<ServerShared>,
}

impl fmt::Debug for DdpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DdpServer").field("bind_addr", &self.shared.config.bind_addr).finish()
    }
}

impl DdpServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                config,
                registry: RwLock::new(Registry::default()),
                rate_limiter: Mutex::new(RateLimiter::new()),
                stats: StatsCounters::default(),
            }),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Register a method. A second registration under the same name is
    /// ignored.
    pub fn method<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(MethodInvocation, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let name = name.into();
        let mut registry = self.shared.registry_mut();
        if registry.methods.contains_key(&name) {
            log::warn!("Method '{name}' is already defined; ignoring redefinition");
            return;
        }
        registry.methods.insert(name, method::boxed_method(f));
    }

    /// Register a named publication. A second registration under the same
    /// name is ignored.
    pub fn publish<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut Subscription, Vec<Value>) -> Result<Publication, HandlerError> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut registry = self.shared.registry_mut();
        if registry.publications.contains_key(&name) {
            log::warn!("Publication '{name}' is already defined; ignoring redefinition");
            return;
        }
        registry.publications.insert(name, Arc::new(f));
    }

    /// Register a publication started for every session without a `sub`.
    pub fn publish_universal<F>(&self, f: F)
    where
        F: Fn(&mut Subscription, Vec<Value>) -> Result<Publication, HandlerError> + Send + Sync + 'static,
    {
        self.shared.registry_mut().universal.push(Arc::new(f));
    }

    /// Run `f` for every new session once it has been accepted.
    pub fn on_connection(&self, f: impl Fn(&Connection) + Send + Sync + 'static) {
        self.shared.registry_mut().on_connection.push(Arc::new(f));
    }

    /// Limit matching methods and subscriptions to `num_requests` per
    /// `interval_ms`.
    pub fn add_rate_limit_rule(&self, rule: Rule, num_requests: u32, interval_ms: u64) -> Uuid {
        self.shared.rate_limiter().add_rule(rule, num_requests, interval_ms)
    }

    pub fn remove_rate_limit_rule(&self, id: Uuid) -> bool {
        self.shared.rate_limiter().remove_rule(id)
    }

    pub fn stats(&self) -> ServerStats {
        self.shared.stats.snapshot()
    }

    /// Bind to `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("DDP server listening on {}", self.shared.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            self.shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);

            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                if let Err(e) = session::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}
