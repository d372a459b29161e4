//! Real-time event distribution layer.
//!
//! One resilient upstream broker connection, fanned out to any number of
//! concurrently open client streams:
//!
//! - [`upstream::UpstreamManager`] owns the broker connection and its
//!   reconnect state machine
//! - [`retry`] is the backoff policy driving all reconnect timing
//! - [`bus::EventBus`] dispatches incoming events to session listeners
//! - [`channels`] holds the channel registry and payload normalization
//! - [`session::ClientSession`] is one open SSE stream
//! - [`idle::IdleScheduler`] tears the connection down after the last
//!   session has been gone for a grace window

pub mod bus;
pub mod channels;
pub mod idle;
pub mod retry;
pub mod session;
pub mod upstream;

use std::sync::Arc;

use self::bus::EventBus;
use self::idle::IdleScheduler;
use self::upstream::UpstreamManager;

/// The injectable composition handed to the HTTP layer: one instance per
/// process, constructed in `main`, never a global.
pub struct RealtimeHub {
    bus: Arc<EventBus>,
    upstream: Arc<UpstreamManager>,
    idle: Arc<IdleScheduler>,
}

impl RealtimeHub {
    pub fn new(upstream_url: String) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let upstream = UpstreamManager::new(upstream_url, Arc::clone(&bus));
        let idle = IdleScheduler::new(Arc::clone(&upstream));
        Arc::new(Self { bus, upstream, idle })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn upstream(&self) -> &Arc<UpstreamManager> {
        &self.upstream
    }

    pub fn idle(&self) -> &Arc<IdleScheduler> {
        &self.idle
    }

    /// Process-shutdown path: suppress reconnection and close the
    /// upstream connection.
    pub fn shutdown(&self) {
        self.upstream.shutdown();
    }
}
