//! Listener, accept loop and shutdown orchestration.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::forward::ConnectionHandle;
use super::inbound::InboundConnection;
use super::registry::{InboundRegistry, OutboundRegistry};
use super::selector::BackendSelector;
use super::socket::SocketOptions;
use super::watchdog::Watchdog;
use crate::config::Config;

/// Pause after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by every connection manager of one server.
pub struct ProxyContext {
    /// Client-facing connections keyed by client remote endpoint.
    pub inbound: InboundRegistry,
    /// Backend-facing connections, watchdog and client-bound.
    pub outbound: Arc<OutboundRegistry>,
    pub selector: BackendSelector,
    /// Options applied to every accepted and dialed socket.
    pub socket: SocketOptions,
    /// Backoff between backend dial attempts.
    pub reconnect_wait: Duration,
    /// Parent of every connection's cancellation token.
    pub shutdown: CancellationToken,
}

impl ProxyContext {
    pub fn new(socket: SocketOptions, reconnect_wait: Duration) -> Arc<Self> {
        let outbound = Arc::new(OutboundRegistry::new("outbound"));
        Arc::new(Self {
            inbound: InboundRegistry::new("inbound"),
            selector: BackendSelector::new(Arc::clone(&outbound)),
            outbound,
            socket,
            reconnect_wait,
            shutdown: CancellationToken::new(),
        })
    }
}

/// Statistics for a server.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections whose task is still running.
    pub connections_active: AtomicU64,
    /// Connections whose task has finished.
    pub connections_closed: AtomicU64,
    /// Failed accept calls.
    pub accept_errors: AtomicU64,
}

/// The load balancer server.
pub struct Server {
    ctx: Arc<ProxyContext>,
    watchdog: Watchdog,
    /// Taken by `run`.
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    tasks: Mutex<JoinSet<()>>,
    stats: Arc<ServerStats>,
    running: AtomicBool,
    /// Cancelled once the accept loop has returned.
    accept_finished: CancellationToken,
    disposed: AtomicBool,
}

impl Server {
    /// Bind the listening socket. Connections are not accepted until `run`.
    pub async fn bind(config: &Config) -> io::Result<Self> {
        let ip: IpAddr = config
            .listen_interface
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let bind_addr = SocketAddr::new(ip, config.listen_port);

        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(bind_addr)?;
        let listener = socket.listen(config.connection_backlog)?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            backlog = config.connection_backlog,
            backends = config.backends.len(),
            "Server bound"
        );

        let ctx = ProxyContext::new(
            SocketOptions::from_config(config),
            config.backend_reconnect_wait(),
        );
        let watchdog = Watchdog::new(Arc::clone(&ctx), config.backends.clone());

        Ok(Self {
            ctx,
            watchdog,
            listener: Mutex::new(Some(listener)),
            local_addr,
            tasks: Mutex::new(JoinSet::new()),
            stats: Arc::new(ServerStats::default()),
            running: AtomicBool::new(false),
            accept_finished: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.ctx
    }

    pub fn inbound_registry(&self) -> &InboundRegistry {
        &self.ctx.inbound
    }

    pub fn outbound_registry(&self) -> &OutboundRegistry {
        &self.ctx.outbound
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Start the watchdog and accept connections until `shutdown` or `dispose`.
    pub async fn run(&self, shutdown: CancellationToken) -> io::Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| io::Error::other("server already started or disposed"))?;
        self.running.store(true, Ordering::SeqCst);

        self.watchdog.start();
        info!(bind_addr = %self.local_addr, "Server started");

        self.accept_loop(&listener, &shutdown).await;
        drop(listener);

        info!("Accept loop ended");
        self.accept_finished.cancel();
        Ok(())
    }

    async fn accept_loop(&self, listener: &TcpListener, shutdown: &CancellationToken) {
        let stop = &self.ctx.shutdown;

        loop {
            let accepted = tokio::select! {
                _ = stop.cancelled() => break,
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => self.spawn_connection(stream, peer_addr),
                Err(e) => {
                    if stop.is_cancelled() || shutdown.is_cancelled() {
                        break;
                    }
                    self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = self.ctx.socket.apply(&stream) {
            warn!(peer_addr = %peer_addr, error = %e, "Failed to apply socket options");
        }

        self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let connection = InboundConnection::new(Arc::clone(&self.ctx));
        let stats = Arc::clone(&self.stats);
        let serve = connection.serve(stream);

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(result) = tasks.try_join_next() {
            log_task_result(result);
        }
        tasks.spawn(async move {
            serve.await;
            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        });
    }

    /// Stop accepting, release every connection and wait for all tasks.
    ///
    /// Afterwards both registries are empty. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping server");

        self.ctx.shutdown.cancel();
        drop(self.listener.lock().unwrap_or_else(PoisonError::into_inner).take());
        if self.running.load(Ordering::SeqCst) {
            self.accept_finished.cancelled().await;
        }

        for (_, connection) in self.ctx.inbound.snapshot() {
            connection.release().await;
        }
        self.ctx.inbound.clear();

        self.watchdog.dispose().await;

        debug!("Waiting for connection tasks to complete");
        let mut tasks =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        while let Some(result) = tasks.join_next().await {
            log_task_result(result);
        }

        info!(
            accepted = self.stats.connections_accepted.load(Ordering::Relaxed),
            "Server stopped"
        );
    }
}

fn log_task_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Connection task panicked");
        }
    }
}
