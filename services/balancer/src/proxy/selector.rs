//! Backend selection.
//!
//! A backend is alive while its watchdog connection is registered. Selection
//! rotates over the alive set with a shared counter; when nothing is alive it
//! returns `None` and the caller drops the client immediately (fail fast, no
//! queueing).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::backend::BackendTarget;
use super::registry::OutboundRegistry;

pub struct BackendSelector {
    outbound: Arc<OutboundRegistry>,
    /// Rotation counter.
    counter: AtomicUsize,
}

impl BackendSelector {
    pub fn new(outbound: Arc<OutboundRegistry>) -> Self {
        Self {
            outbound,
            counter: AtomicUsize::new(0),
        }
    }

    /// Pick an alive backend for a new inbound connection.
    pub fn select_backend(&self) -> Option<BackendTarget> {
        let alive: Vec<_> = self
            .outbound
            .snapshot()
            .into_iter()
            .filter(|(_, connection)| connection.is_watchdog())
            .collect();

        if alive.is_empty() {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % alive.len();
        let (key, connection) = &alive[index];
        debug!(
            key = %key,
            alive = alive.len(),
            "Selected backend"
        );
        Some(connection.target().clone())
    }
}
