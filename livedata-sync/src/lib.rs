//! # livedata-sync — DDP server and client over WebSocket
//!
//! Publishes live queries from [`livedata_core`] collections to remote
//! clients and runs remote methods, with client-side latency compensation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    DDP over WebSocket     ┌──────────────┐
//! │  DdpClient   │ ◄───────────────────────► │  DdpServer   │
//! │ local stores │   JSON text frames        │ session/conn │
//! │ + stubs      │                           └──────┬───────┘
//! └──────┬───────┘                                  │
//!        │ ClientStream                     ┌───────┴────────┐
//!        │ (reconnect, heartbeat)           │  SessionView   │
//!        ▼                                  │ (merge box)    │
//! ┌──────────────┐                          └───────┬────────┘
//! │ Collection   │                                  │ observe_changes
//! │ (minimongo)  │                          ┌───────┴────────┐
//! └──────────────┘                          │  Collection    │
//!                                           └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — DDP message codec and version negotiation
//! - [`server`] — sessions, publications, methods and the merge box
//! - [`client`] — connection state, stubs and quiescence handling
//! - [`stream`] — reconnecting transport with [`retry`] backoff and [`heartbeat`]
//! - [`rate_limiter`] — per-rule request budgets for methods and subscriptions
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Encode/decode `added` message | <5µs |
//! | Merge box add, 3 overlapping subs | <2µs |
//! | Method round trip on loopback | <1ms |

pub mod client;
pub mod error;
pub mod heartbeat;
pub mod protocol;
pub mod rate_limiter;
pub mod retry;
pub mod server;
pub mod stream;

// Re-exports for convenience
pub use client::{
    CallOptions, ClientConfig, DdpClient, MethodCall, StubInvocation, SubscriptionHandle, SubscriptionState,
};
pub use error::{ClientError, ErrorCode, HandlerError, MethodError};
pub use protocol::{negotiate_version, DdpMessage, ProtocolError, SUPPORTED_VERSIONS};
pub use rate_limiter::{InvocationType, RateLimitInput, RateLimitReply, RateLimiter, Rule, RuleMatcher};
pub use retry::RetryConfig;
pub use server::{
    Connection, DdpServer, MethodInvocation, Publication, ServerConfig, ServerStats, SessionView, Subscription,
    SubscriptionSink,
};
pub use stream::{ClientStream, StreamStatus};
