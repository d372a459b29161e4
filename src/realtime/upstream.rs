//! Upstream broker connection manager.
//!
//! Owns the single WebSocket connection to the pub/sub broker shared by
//! every client session. Incoming frames are republished onto the internal
//! event bus; connection lifecycle transitions are published on the
//! reserved lifecycle channels so sessions can surface them to clients.
//!
//! All mutable state (connection state, retry counter, attempt throttle)
//! lives behind one mutex and is only written here. Reconnect timing comes
//! exclusively from [`retry`]; error classification decides how a failure
//! is labeled, never when the next attempt runs.

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, sleep};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, error::ProtocolError, Message},
};
use tracing::{debug, info, warn};

use super::bus::EventBus;
use super::channels::{self, DOMAIN_CHANNELS};
use super::retry;

/// Minimum time between connection attempts, independent of backoff.
pub const CONNECT_THROTTLE: Duration = Duration::from_secs(5);

/// Outbound ping cadence keeping intermediaries from idling the socket out.
const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Cooldown hint handed to clients in the `suspended` envelope.
const SUSPENDED_RETRY_AFTER_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Suspended,
}

/// Point-in-time view for the status endpoint.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamStatus {
    pub state: ConnectionState,
    pub retry_attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    ConnectionReset,
    Other,
}

impl ErrorClass {
    fn label(self) -> &'static str {
        match self {
            ErrorClass::ConnectionReset => "connection_reset",
            ErrorClass::Other => "upstream_error",
        }
    }
}

/// Frame received from the broker: a channel name plus an opaque payload.
#[derive(Debug, Deserialize)]
struct BrokerFrame {
    channel: String,
    data: Value,
}

struct Inner {
    state: ConnectionState,
    attempt: u32,
    last_attempt: Option<Instant>,
    shutting_down: bool,
    generation: u64,
}

pub struct UpstreamManager {
    url: String,
    bus: Arc<EventBus>,
    inner: Mutex<Inner>,
    // Bumped on shutdown; workers select on it to drop out promptly.
    shutdown_tx: watch::Sender<u64>,
    // Handed to spawned workers; always upgradable while the manager lives.
    weak_self: Weak<Self>,
}

impl UpstreamManager {
    pub fn new(url: String, bus: Arc<EventBus>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(0);
        Arc::new_cyclic(|weak_self| Self {
            url,
            bus,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                attempt: 0,
                last_attempt: None,
                shutting_down: false,
                generation: 0,
            }),
            shutdown_tx,
            weak_self: Weak::clone(weak_self),
        })
    }

    /// Idempotent: a live or in-flight connection is reused, and a fresh
    /// attempt inside the throttle window is refused. Callers get whatever
    /// the bus delivers and rely on lifecycle envelopes for the rest.
    pub fn ensure_connected(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            ConnectionState::Connected | ConnectionState::Connecting => return,
            ConnectionState::Disconnected | ConnectionState::Suspended => {}
        }
        if let Some(last) = inner.last_attempt {
            if last.elapsed() < CONNECT_THROTTLE {
                debug!("connection attempt throttled");
                return;
            }
        }

        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        inner.shutting_down = false;
        inner.state = ConnectionState::Connecting;
        inner.last_attempt = Some(Instant::now());
        inner.generation += 1;
        let generation = inner.generation;
        drop(inner);

        tokio::spawn(async move { manager.run(generation).await });
    }

    /// Suppress reconnection and close the connection. A later
    /// `ensure_connected` call starts a fresh cycle.
    pub fn shutdown(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return;
            }
            inner.shutting_down = true;
            inner.generation += 1;
            inner.state = ConnectionState::Disconnected;
        }
        self.shutdown_tx.send_modify(|epoch| *epoch += 1);
        info!("upstream connection manager shut down");
        self.publish_lifecycle("disconnected", json!({ "reason": "shutdown" }));
    }

    pub fn status(&self) -> UpstreamStatus {
        let inner = self.inner.lock();
        UpstreamStatus {
            state: inner.state,
            retry_attempt: inner.attempt,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// Identity of the current connection cycle; unchanged while a
    /// connection (or reconnect schedule) is being reused.
    pub fn connection_generation(&self) -> u64 {
        self.inner.lock().generation
    }

    async fn run(self: Arc<Self>, generation: u64) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.shutting_down || inner.generation != generation {
                    return;
                }
                inner.state = ConnectionState::Connecting;
                inner.last_attempt = Some(Instant::now());
            }

            let outcome = self.connect_and_stream(generation, &mut shutdown_rx).await;
            if self.is_stale(generation) {
                return;
            }

            let failed = match outcome {
                Ok(()) => {
                    info!("upstream connection closed");
                    self.mark_disconnected(generation, None);
                    false
                }
                Err(error) => {
                    let class = classify(&error);
                    warn!(error = %error, class = class.label(), "upstream connection failed");
                    self.mark_disconnected(generation, Some((class, &error)));
                    true
                }
            };

            let Some(backoff) = self.next_retry(generation, failed) else {
                return;
            };
            debug!(delay_ms = backoff.as_millis() as u64, "scheduling reconnect");
            tokio::select! {
                _ = sleep(backoff) => {}
                _ = shutdown_rx.changed() => return,
            }
        }
    }

    async fn connect_and_stream(
        &self,
        generation: u64,
        shutdown_rx: &mut watch::Receiver<u64>,
    ) -> Result<()> {
        info!("🔌 Connecting to upstream broker");
        let (ws_stream, response) = tokio::select! {
            connected = connect_async(self.url.as_str()) => {
                connected.context("connect to upstream broker")?
            }
            _ = shutdown_rx.changed() => return Ok(()),
        };
        info!("✅ Upstream broker connected (status={})", response.status());

        {
            let mut inner = self.inner.lock();
            if inner.shutting_down || inner.generation != generation {
                return Ok(());
            }
            inner.state = ConnectionState::Connected;
            inner.attempt = 0;
        }

        let (mut write, mut read) = ws_stream.split();

        let subscribe = json!({
            "action": "subscribe",
            "channels": DOMAIN_CHANNELS,
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("send channel subscription")?;

        self.publish_lifecycle("connected", json!({ "channels": DOMAIN_CHANNELS }));

        let mut ping = interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = ping.tick() => {
                    let _ = write.send(Message::Ping(Vec::new())).await;
                }
                frame = read.next() => {
                    let Some(frame) = frame else {
                        return Ok(());
                    };
                    match frame {
                        Ok(Message::Text(text)) => self.handle_frame(&text),
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "upstream close frame");
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(error) => {
                            return Err(anyhow::Error::from(error).context("upstream read"));
                        }
                    }
                }
            }
        }
    }

    /// Parse a broker frame and republish it. Control messages and
    /// malformed frames are dropped after logging; they never surface to
    /// a client stream.
    fn handle_frame(&self, text: &str) {
        let frame: BrokerFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(error) => {
                debug!(error = %error, "dropping unparseable broker frame");
                return;
            }
        };
        if !DOMAIN_CHANNELS.contains(&frame.channel.as_str()) {
            debug!(channel = %frame.channel, "frame on unregistered channel");
        }
        self.bus.publish(&frame.channel, &frame.data);
    }

    fn mark_disconnected(&self, generation: u64, failure: Option<(ErrorClass, &anyhow::Error)>) {
        {
            let mut inner = self.inner.lock();
            if inner.shutting_down || inner.generation != generation {
                return;
            }
            inner.state = ConnectionState::Disconnected;
        }
        match failure {
            Some((class, error)) => self.publish_lifecycle(
                "error",
                json!({ "class": class.label(), "message": error.to_string() }),
            ),
            None => self.publish_lifecycle("disconnected", json!({})),
        }
    }

    /// Account for the finished attempt and hand back the next backoff
    /// delay, or `None` when the cycle is over (stale, shutting down, or
    /// retries exhausted — the last of which transitions to `Suspended`).
    fn next_retry(&self, generation: u64, failed: bool) -> Option<Duration> {
        let mut suspend = false;
        let delay = {
            let mut inner = self.inner.lock();
            if inner.shutting_down || inner.generation != generation {
                return None;
            }
            if failed {
                inner.attempt += 1;
            }
            match retry::delay(inner.attempt) {
                Some(delay) => Some(delay),
                None => {
                    inner.state = ConnectionState::Suspended;
                    suspend = true;
                    None
                }
            }
        };
        if suspend {
            warn!(
                retry_after_secs = SUSPENDED_RETRY_AFTER_SECS,
                "upstream retries exhausted, suspending reconnection"
            );
            self.publish_lifecycle(
                "suspended",
                json!({ "retryAfter": SUSPENDED_RETRY_AFTER_SECS }),
            );
        }
        delay
    }

    fn is_stale(&self, generation: u64) -> bool {
        let inner = self.inner.lock();
        inner.shutting_down || inner.generation != generation
    }

    fn publish_lifecycle(&self, event: &str, mut payload: Value) {
        if let Some(object) = payload.as_object_mut() {
            object.insert("event".to_string(), Value::String(event.to_string()));
            object.insert("timestamp".to_string(), json!(Utc::now().timestamp_millis()));
        }
        let channel = format!("{}{}", channels::LIFECYCLE_PREFIX, event);
        self.bus.publish(&channel, &payload);
    }
}

fn classify(error: &anyhow::Error) -> ErrorClass {
    for cause in error.chain() {
        if let Some(ws) = cause.downcast_ref::<tungstenite::Error>() {
            match ws {
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                    return ErrorClass::ConnectionReset;
                }
                tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                    return ErrorClass::ConnectionReset;
                }
                tungstenite::Error::Io(io) if is_reset_kind(io.kind()) => {
                    return ErrorClass::ConnectionReset;
                }
                _ => {}
            }
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if is_reset_kind(io.kind()) {
                return ErrorClass::ConnectionReset;
            }
        }
    }
    ErrorClass::Other
}

fn is_reset_kind(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::channels::LIFECYCLE_SUSPENDED;
    use std::io;

    fn manager() -> (Arc<UpstreamManager>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        // Unroutable port: any dial fails fast and the tests never wait
        // on real upstream traffic.
        let manager = UpstreamManager::new("ws://127.0.0.1:9/stream".to_string(), Arc::clone(&bus));
        (manager, bus)
    }

    #[test]
    fn io_resets_classify_as_connection_reset() {
        let reset = anyhow::Error::from(io::Error::new(io::ErrorKind::ConnectionReset, "boom"));
        assert_eq!(classify(&reset), ErrorClass::ConnectionReset);

        let aborted = anyhow::Error::from(tungstenite::Error::Io(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "gone",
        )));
        assert_eq!(classify(&aborted), ErrorClass::ConnectionReset);

        let protocol = anyhow::Error::from(tungstenite::Error::Protocol(
            ProtocolError::ResetWithoutClosingHandshake,
        ));
        assert_eq!(classify(&protocol), ErrorClass::ConnectionReset);
    }

    #[test]
    fn other_errors_classify_as_generic() {
        let denied = anyhow::Error::from(io::Error::new(io::ErrorKind::PermissionDenied, "no"));
        assert_eq!(classify(&denied), ErrorClass::Other);
        assert_eq!(classify(&anyhow::anyhow!("handshake rejected")), ErrorClass::Other);
    }

    #[tokio::test]
    async fn recent_attempt_throttles_ensure_connected() {
        let (manager, _bus) = manager();
        manager.inner.lock().last_attempt = Some(Instant::now());

        manager.ensure_connected();
        assert_eq!(manager.status().state, ConnectionState::Disconnected);
        assert_eq!(manager.connection_generation(), 0);

        manager.inner.lock().last_attempt = Instant::now().checked_sub(Duration::from_secs(6));
        manager.ensure_connected();
        assert_eq!(manager.status().state, ConnectionState::Connecting);
        assert_eq!(manager.connection_generation(), 1);

        manager.shutdown();
    }

    #[tokio::test]
    async fn live_connection_is_reused() {
        let (manager, _bus) = manager();
        {
            let mut inner = manager.inner.lock();
            inner.state = ConnectionState::Connected;
            inner.generation = 3;
        }

        manager.ensure_connected();
        assert_eq!(manager.status().state, ConnectionState::Connected);
        assert_eq!(manager.connection_generation(), 3);
    }

    #[tokio::test]
    async fn suspended_recovers_through_ensure_connected_after_the_window() {
        let (manager, _bus) = manager();
        {
            let mut inner = manager.inner.lock();
            inner.state = ConnectionState::Suspended;
            inner.attempt = retry::MAX_ATTEMPTS;
            inner.last_attempt = Instant::now().checked_sub(Duration::from_secs(10));
        }

        manager.ensure_connected();
        assert_eq!(manager.status().state, ConnectionState::Connecting);

        manager.shutdown();
    }

    #[tokio::test]
    async fn exhausted_retries_suspend_and_announce_retry_after() {
        let (manager, bus) = manager();
        manager.inner.lock().generation = 1;

        let suspended = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&suspended);
        bus.subscribe(LIFECYCLE_SUSPENDED, move |_, payload| {
            sink.lock().push(payload.clone());
        });

        let mut scheduled = 0;
        loop {
            match manager.next_retry(1, true) {
                Some(_) => {
                    scheduled += 1;
                    assert!(scheduled < 2 * retry::MAX_ATTEMPTS, "never suspended");
                }
                None => break,
            }
        }

        // One delay per failure until the cap, then the sentinel.
        assert_eq!(scheduled, retry::MAX_ATTEMPTS - 1);
        assert_eq!(manager.status().state, ConnectionState::Suspended);
        assert_eq!(manager.status().retry_attempt, retry::MAX_ATTEMPTS);

        let envelopes = suspended.lock();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0]["event"], "suspended");
        assert_eq!(envelopes[0]["retryAfter"], SUSPENDED_RETRY_AFTER_SECS);
    }

    #[tokio::test]
    async fn graceful_close_keeps_the_retry_counter_at_zero() {
        let (manager, _bus) = manager();
        manager.inner.lock().generation = 1;

        let backoff = manager.next_retry(1, false).expect("reconnect scheduled");
        assert_eq!(backoff, retry::INITIAL_DELAY);
        assert_eq!(manager.status().retry_attempt, 0);
        assert_eq!(manager.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_suppresses_scheduled_retries() {
        let (manager, _bus) = manager();
        manager.inner.lock().generation = 1;
        manager.shutdown();

        assert!(manager.is_shut_down());
        assert_eq!(manager.next_retry(1, true), None);
        assert_eq!(manager.status().state, ConnectionState::Disconnected);
    }
}
