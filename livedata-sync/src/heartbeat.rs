//! Connection liveness.
//!
//! Both ends run the same state machine: after `interval` without hearing
//! anything, send a `ping`; if nothing arrives within `timeout` of that
//! ping, the connection is dead. Any inbound message counts as proof of
//! life, not just `pong`.
//!
//! The machine holds no timers of its own. Callers ask for
//! [`Heartbeat::next_deadline`], sleep until then and call
//! [`Heartbeat::poll`].

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Idle,
    SendPing,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Option<Duration>,
    timeout: Duration,
    last_received: Instant,
    ping_sent_at: Option<Instant>,
}

impl Heartbeat {
    /// An interval of zero disables the heartbeat.
    pub fn new(interval_ms: u64, timeout_ms: u64, now: Instant) -> Self {
        Self {
            interval: (interval_ms > 0).then(|| Duration::from_millis(interval_ms)),
            timeout: Duration::from_millis(timeout_ms),
            last_received: now,
            ping_sent_at: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    pub fn message_received(&mut self, now: Instant) {
        self.last_received = now;
        self.ping_sent_at = None;
    }

    pub fn poll(&mut self, now: Instant) -> HeartbeatAction {
        let Some(interval) = self.interval else {
            return HeartbeatAction::Idle;
        };
        match self.ping_sent_at {
            Some(sent) if now >= sent + self.timeout => HeartbeatAction::TimedOut,
            Some(_) => HeartbeatAction::Idle,
            None if now >= self.last_received + interval => {
                self.ping_sent_at = Some(now);
                HeartbeatAction::SendPing
            }
            None => HeartbeatAction::Idle,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let interval = self.interval?;
        Some(match self.ping_sent_at {
            Some(sent) => sent + self.timeout,
            None => self.last_received + interval,
        })
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
