//! Idle teardown scheduling.
//!
//! Tracks the active session count and shuts the upstream connection down
//! once the process has been client-free for a grace window. The delay is
//! cancellable: a session opening inside the window aborts the pending
//! shutdown so rapid connect/disconnect cycles keep reusing the same
//! upstream connection.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};

use super::upstream::UpstreamManager;

/// Grace window after the last session closes.
pub const IDLE_SHUTDOWN_DELAY: Duration = Duration::from_secs(30);

pub struct IdleScheduler {
    upstream: Arc<UpstreamManager>,
    active: AtomicUsize,
    pending: Mutex<Option<JoinHandle<()>>>,
    // Handed to the delayed shutdown task; always upgradable while the
    // scheduler lives.
    weak_self: Weak<Self>,
}

impl IdleScheduler {
    pub fn new(upstream: Arc<UpstreamManager>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            upstream,
            active: AtomicUsize::new(0),
            pending: Mutex::new(None),
            weak_self: Weak::clone(weak_self),
        })
    }

    pub fn on_session_opened(&self) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(pending) = self.pending.lock().take() {
            pending.abort();
            debug!("cancelled pending idle shutdown");
        }
        debug!(active, "session opened");
    }

    pub fn on_session_closed(&self) {
        let previous = self.active.fetch_sub(1, Ordering::SeqCst);
        let active = previous.saturating_sub(1);
        debug!(active, "session closed");
        if active > 0 {
            return;
        }

        let Some(scheduler) = self.weak_self.upgrade() else {
            return;
        };
        let handle = tokio::spawn(async move {
            sleep(IDLE_SHUTDOWN_DELAY).await;
            scheduler.fire();
        });
        if let Some(superseded) = self.pending.lock().replace(handle) {
            superseded.abort();
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn fire(&self) {
        // A session may have raced the timer; the open path aborts the
        // task, but re-check the count in case we already woke up.
        if self.active.load(Ordering::SeqCst) > 0 {
            return;
        }
        info!(
            delay_secs = IDLE_SHUTDOWN_DELAY.as_secs(),
            "no active sessions, shutting down upstream connection"
        );
        self.upstream.shutdown();
    }
}
