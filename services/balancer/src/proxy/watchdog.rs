//! Backend liveness.
//!
//! One watchdog-mode [`OutboundConnection`] per configured backend. A backend
//! is selectable exactly while its watchdog connection is registered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::backend::{BackendTarget, ConnectionMode};
use super::forward::ConnectionHandle;
use super::outbound::OutboundConnection;
use super::server::ProxyContext;

pub struct Watchdog {
    ctx: Arc<ProxyContext>,
    targets: Vec<BackendTarget>,
    connections: Mutex<Vec<Arc<OutboundConnection>>>,
    tasks: Mutex<JoinSet<()>>,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl Watchdog {
    pub fn new(ctx: Arc<ProxyContext>, targets: Vec<BackendTarget>) -> Self {
        Self {
            ctx,
            targets,
            connections: Mutex::new(Vec::new()),
            tasks: Mutex::new(JoinSet::new()),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Spawn a watchdog connection per target. Later calls are ignored.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) || self.disposed.load(Ordering::SeqCst) {
            return;
        }
        info!(backends = self.targets.len(), "Starting backend watchdogs");

        let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for target in &self.targets {
            let connection = OutboundConnection::new(
                target.clone(),
                ConnectionMode::Watchdog,
                Arc::clone(&self.ctx),
            );
            tasks.spawn(Arc::clone(&connection).monitor());
            connections.push(connection);
        }
    }

    /// Release every outbound connection and wait for the watchdog tasks.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        for (_, connection) in self.ctx.outbound.snapshot() {
            connection.release().await;
        }
        let connections =
            std::mem::take(&mut *self.connections.lock().unwrap_or_else(PoisonError::into_inner));
        for connection in connections {
            connection.release().await;
        }
        self.ctx.outbound.clear();

        debug!("Waiting for watchdog tasks to complete");
        let mut tasks =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Watchdog task failed");
            }
        }
        debug!("Watchdog tasks complete");
    }
}
