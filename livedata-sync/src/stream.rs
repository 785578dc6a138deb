//! Reconnecting client transport.
//!
//! ```text
//!             connect ok                 socket closed / heartbeat timeout
//! Connecting ───────────► Connected ─────────────────────────────┐
//!     ▲                                                          ▼
//!     └────────────── backoff elapsed / reconnect() ────── Waiting{retry_count}
//!
//! disconnect() ─► Offline        fail(reason) ─► Failed(reason)
//! ```
//!
//! The task owns the WebSocket. Each successful connection gets a new
//! generation number; the handler's [`StreamHandler::on_reset`] returns the
//! messages that must open the new connection (handshake, resent methods,
//! subscriptions) and they are written before anything else. Messages
//! queued for an older generation are dropped, because the reset already
//! re-sent everything that still matters.

use std::sync::Weak;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use crate::heartbeat::{sleep_until, Heartbeat, HeartbeatAction};
use crate::protocol::DdpMessage;
use crate::retry::RetryConfig;

/// Connection status as seen by the application.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamStatus {
    Connecting,
    Connected,
    Waiting { retry_count: u32, retry_in: Duration },
    Failed(String),
    Offline,
}

impl StreamStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, StreamStatus::Connected)
    }
}

/// Receives stream events. Held weakly by the stream task.
pub trait StreamHandler: Send + Sync {
    /// A new connection is up. Returns the frames to send first.
    fn on_reset(&self, generation: u64) -> Vec<String>;

    fn on_message(&self, generation: u64, text: &str);

    fn on_disconnect(&self);
}

#[derive(Debug)]
enum Command {
    Send { text: String, generation: u64 },
    Reconnect { force: bool },
    Disconnect,
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub retry: RetryConfig,
}

/// Handle to the transport task. Dropping every handle stops the task.
#[derive(Debug, Clone)]
pub struct ClientStream {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<StreamStatus>,
}

enum Exit {
    Lost,
    Disconnect,
    Fail(String),
    Reconnect,
    Shutdown,
}

impl ClientStream {
    /// Spawn the transport task and start connecting.
    pub fn spawn(config: StreamConfig, handler: Weak<dyn StreamHandler>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(StreamStatus::Connecting);
        tokio::spawn(run(config, handler, rx, status_tx));
        Self { commands, status }
    }

    /// Queue a frame for the connection identified by `generation`.
    pub fn send(&self, text: String, generation: u64) {
        let _ = self.commands.send(Command::Send { text, generation });
    }

    /// Reconnect now if not connected, resetting the backoff. `force` also
    /// drops a live connection.
    pub fn reconnect(&self, force: bool) {
        let _ = self.commands.send(Command::Reconnect { force });
    }

    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Close and stay closed until [`reconnect`](Self::reconnect).
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.commands.send(Command::Fail(reason.into()));
    }

    pub fn status(&self) -> StreamStatus {
        self.status.borrow().clone()
    }

    /// Watch channel of status changes.
    pub fn watch_status(&self) -> watch::Receiver<StreamStatus> {
        self.status.clone()
    }
}

async fn run(
    config: StreamConfig,
    handler: Weak<dyn StreamHandler>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<StreamStatus>,
) {
    let mut generation: u64 = 0;
    let mut retry_count: u32 = 0;

    loop {
        let _ = status.send(StreamStatus::Connecting);
        log::debug!("Connecting to {}", config.url);
        let connect = tokio_tungstenite::connect_async(config.url.as_str());
        let exit = match tokio::time::timeout(Duration::from_millis(config.connect_timeout_ms), connect).await {
            Ok(Ok((ws, _))) => {
                generation += 1;
                retry_count = 0;
                let _ = status.send(StreamStatus::Connected);
                log::info!("Connected to {} (generation {generation})", config.url);
                let exit = connected(&config, &handler, &mut commands, ws, generation).await;
                match handler.upgrade() {
                    Some(h) => h.on_disconnect(),
                    None => return,
                }
                exit
            }
            Ok(Err(e)) => {
                log::warn!("Connection to {} failed: {e}", config.url);
                Exit::Lost
            }
            Err(_) => {
                log::warn!("Connection to {} timed out", config.url);
                Exit::Lost
            }
        };

        let wait = match exit {
            Exit::Shutdown => return,
            Exit::Reconnect => continue,
            Exit::Lost => {
                let retry_in = config.retry.delay(retry_count);
                retry_count += 1;
                let _ = status.send(StreamStatus::Waiting { retry_count, retry_in });
                log::info!("Reconnecting in {retry_in:?} (attempt {retry_count})");
                Some(retry_in)
            }
            Exit::Disconnect => {
                let _ = status.send(StreamStatus::Offline);
                None
            }
            Exit::Fail(reason) => {
                log::error!("Stream failed: {reason}");
                let _ = status.send(StreamStatus::Failed(reason));
                None
            }
        };

        // Idle until the backoff elapses or someone asks to reconnect.
        let mut deadline = wait.map(|d| Instant::now() + d);
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => break,
                cmd = commands.recv() => match cmd {
                    None => return,
                    Some(Command::Reconnect { .. }) => {
                        retry_count = 0;
                        break;
                    }
                    Some(Command::Disconnect) => {
                        let _ = status.send(StreamStatus::Offline);
                        deadline = None;
                    }
                    Some(Command::Fail(reason)) => {
                        let _ = status.send(StreamStatus::Failed(reason));
                        deadline = None;
                    }
                    Some(Command::Send { .. }) => {}
                },
            }
        }
    }
}

async fn connected<S>(
    config: &StreamConfig,
    handler: &Weak<dyn StreamHandler>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    ws: S,
    generation: u64,
) -> Exit
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut sink, mut source) = ws.split();

    let opening = match handler.upgrade() {
        Some(h) => h.on_reset(generation),
        None => return Exit::Shutdown,
    };
    for text in opening {
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            log::warn!("Write failed during reset: {e}");
            return Exit::Lost;
        }
    }

    let mut heartbeat = Heartbeat::new(config.heartbeat_interval_ms, config.heartbeat_timeout_ms, Instant::now());

    loop {
        let deadline = heartbeat.next_deadline();
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    heartbeat.message_received(Instant::now());
                    match handler.upgrade() {
                        Some(h) => h.on_message(generation, text.as_str()),
                        None => return Exit::Shutdown,
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Server closed the connection");
                    return Exit::Lost;
                }
                Some(Ok(_)) => heartbeat.message_received(Instant::now()),
                Some(Err(e)) => {
                    log::warn!("Transport error: {e}");
                    return Exit::Lost;
                }
            },
            cmd = commands.recv() => match cmd {
                None => {
                    let _ = sink.close().await;
                    return Exit::Shutdown;
                }
                Some(Command::Send { text, generation: g }) => {
                    if g != generation {
                        log::trace!("Dropping frame queued for generation {g}");
                        continue;
                    }
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        log::warn!("Write failed: {e}");
                        return Exit::Lost;
                    }
                }
                Some(Command::Reconnect { force }) => {
                    if force {
                        let _ = sink.close().await;
                        return Exit::Reconnect;
                    }
                }
                Some(Command::Disconnect) => {
                    let _ = sink.close().await;
                    return Exit::Disconnect;
                }
                Some(Command::Fail(reason)) => {
                    let _ = sink.close().await;
                    return Exit::Fail(reason);
                }
            },
            _ = sleep_until(deadline) => match heartbeat.poll(Instant::now()) {
                HeartbeatAction::SendPing => {
                    log::trace!("Sending heartbeat ping");
                    if let Ok(text) = (DdpMessage::Ping { id: None }).encode() {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            return Exit::Lost;
                        }
                    }
                }
                HeartbeatAction::TimedOut => {
                    log::warn!("Heartbeat timed out; dropping connection");
                    let _ = sink.close().await;
                    return Exit::Lost;
                }
                HeartbeatAction::Idle => {}
            },
        }
    }
}
