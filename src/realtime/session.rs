//! Client streaming sessions.
//!
//! One session per open SSE request. Each session owns an unbounded queue
//! fed by its bus listeners, so a client stalling on backpressure never
//! blocks fan-out for anyone else. Dropping the stream (the client went
//! away) tears everything down through the guard: listeners removed,
//! heartbeat gone, idle scheduler notified.

use axum::response::sse::Event;
use chrono::Utc;
use futures_util::{stream, Stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use super::bus::ListenerHandle;
use super::channels::{self, DOMAIN_CHANNELS, LIFECYCLE_CHANNELS, LIFECYCLE_PREFIX};
use super::RealtimeHub;

/// Cadence of the literal `heartbeat` frame keeping proxies from timing
/// the stream out.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

const HEARTBEAT_FRAME: &str = "heartbeat";

/// Uniform client-facing frame: a domain channel name or lifecycle event
/// name plus its payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

pub struct ClientSession {
    id: Uuid,
    opened_at: i64,
    rx: mpsc::UnboundedReceiver<StreamEnvelope>,
    guard: SessionGuard,
}

impl ClientSession {
    /// Open a session: wake the upstream connection if needed and attach
    /// listeners for every domain and lifecycle channel.
    pub fn open(hub: &Arc<RealtimeHub>) -> Self {
        let id = Uuid::new_v4();
        hub.idle().on_session_opened();
        hub.upstream().ensure_connected();

        let (tx, rx) = mpsc::unbounded_channel();
        let mut handles = Vec::with_capacity(DOMAIN_CHANNELS.len() + LIFECYCLE_CHANNELS.len());

        for channel in DOMAIN_CHANNELS {
            let tx = tx.clone();
            handles.push(hub.bus().subscribe(channel, move |channel, raw| {
                let Some(normalized) = channels::normalize(channel, raw) else {
                    debug!(channel, "dropping malformed payload");
                    return;
                };
                match serde_json::to_value(&normalized) {
                    Ok(payload) => {
                        let _ = tx.send(StreamEnvelope {
                            kind: channel.to_string(),
                            payload,
                        });
                    }
                    Err(error) => {
                        warn!(channel, error = %error, "failed to encode normalized payload");
                    }
                }
            }));
        }

        for channel in LIFECYCLE_CHANNELS {
            let tx = tx.clone();
            handles.push(hub.bus().subscribe(channel, move |channel, raw| {
                let kind = channel
                    .strip_prefix(LIFECYCLE_PREFIX)
                    .unwrap_or(channel)
                    .to_string();
                let _ = tx.send(StreamEnvelope {
                    kind,
                    payload: raw.clone(),
                });
            }));
        }

        debug!(session = %id, "client session opened");
        Self {
            id,
            opened_at: Utc::now().timestamp_millis(),
            rx,
            guard: SessionGuard {
                hub: Arc::clone(hub),
                id,
                handles,
            },
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next queued envelope; `None` once the session is defunct.
    pub async fn recv(&mut self) -> Option<StreamEnvelope> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<StreamEnvelope> {
        self.rx.try_recv().ok()
    }

    /// Turn the session into the SSE body. The greeting frame goes first,
    /// then the queue and the heartbeat interval are raced until the
    /// client disconnects; dropping the stream drops the guard and tears
    /// the session down.
    pub fn into_sse_stream(self) -> impl Stream<Item = Result<Event, Infallible>> + Send {
        let greeting = StreamEnvelope {
            kind: "connected".to_string(),
            payload: json!({
                "channels": DOMAIN_CHANNELS,
                "sessionId": self.id,
                "timestamp": self.opened_at,
            }),
        };

        let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let ClientSession { rx, guard, .. } = self;

        stream::once(async move { Ok::<_, Infallible>(envelope_event(&greeting)) }).chain(stream::unfold(
            (rx, heartbeat, guard),
            |(mut rx, mut heartbeat, guard)| async move {
                let event = tokio::select! {
                    envelope = rx.recv() => match envelope {
                        Some(envelope) => envelope_event(&envelope),
                        None => return None,
                    },
                    _ = heartbeat.tick() => Event::default().data(HEARTBEAT_FRAME),
                };
                Some((Ok(event), (rx, heartbeat, guard)))
            },
        ))
    }
}

fn envelope_event(envelope: &StreamEnvelope) -> Event {
    let json = serde_json::to_string(envelope).unwrap_or_else(|_| "{}".to_string());
    Event::default().data(json)
}

struct SessionGuard {
    hub: Arc<RealtimeHub>,
    id: Uuid,
    handles: Vec<ListenerHandle>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            self.hub.bus().unsubscribe(handle);
        }
        self.hub.idle().on_session_closed();
        debug!(session = %self.id, "client session closed");
    }
}
