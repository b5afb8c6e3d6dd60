//! Backend-facing connection manager.
//!
//! Owns one backend socket at a time. The monitor loop dials with indefinite
//! retry, registers the connection, forwards backend reads to the attached
//! client (or the discard sink), and on disconnect deregisters and dials again
//! unless cancelled:
//!
//! ```text
//! Idle -> Connecting -> Connected -> Closing -+-> Connecting   (watchdog)
//!            ^                                |
//!            +------------- (retry) ----------+-> Terminated   (cancelled)
//! ```
//!
//! Watchdog connections survive backend disconnects and redial; client-bound
//! connections terminate on backend close or forwarding failure.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::backend::{BackendTarget, ConnectionMode};
use super::forward::{forward_frames, send_all, ConnectionHandle, FrameState, SendState};
use super::server::ProxyContext;
use super::sink::ClientSlot;

pub struct OutboundConnection {
    target: BackendTarget,
    mode: ConnectionMode,
    ctx: Arc<ProxyContext>,
    /// Registry key of the current (or last) backend socket.
    key: ArcSwapOption<String>,
    /// Write half of the backend socket while connected.
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Raised once the socket is registered and writable, lowered on teardown.
    connected: watch::Sender<bool>,
    /// Destination for bytes read from the backend.
    client: ClientSlot,
    cancel: CancellationToken,
    finished: CancellationToken,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl OutboundConnection {
    /// Create a connection manager. Nothing is dialed until the monitor runs.
    pub fn new(target: BackendTarget, mode: ConnectionMode, ctx: Arc<ProxyContext>) -> Arc<Self> {
        let (connected, _) = watch::channel(false);
        Arc::new(Self {
            target,
            mode,
            cancel: ctx.shutdown.child_token(),
            ctx,
            key: ArcSwapOption::empty(),
            writer: Mutex::new(None),
            connected,
            client: ClientSlot::new(),
            finished: CancellationToken::new(),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn target(&self) -> &BackendTarget {
        &self.target
    }

    pub fn mode(&self) -> &ConnectionMode {
        &self.mode
    }

    pub fn is_watchdog(&self) -> bool {
        self.mode.is_watchdog()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Forward backend reads to `client` from now on.
    pub fn attach_client(&self, client: Weak<dyn ConnectionHandle>) {
        self.client.attach(client);
    }

    /// Forward backend reads to the discard sink from now on.
    pub fn detach_client(&self) -> Option<Arc<dyn ConnectionHandle>> {
        self.client.detach()
    }

    pub fn has_client(&self) -> bool {
        self.client.is_attached()
    }

    /// The monitor loop. Runs until the connection is cancelled.
    ///
    /// The connection counts as started as soon as this is called, so
    /// `release` waits for the returned future even before it is first polled.
    pub fn monitor(self: Arc<Self>) -> impl Future<Output = ()> + Send + 'static {
        self.started.store(true, Ordering::SeqCst);
        let span = info_span!("backend", backend = %self.target, mode = %self.mode);
        async move { self.run().await }.instrument(span)
    }

    async fn run(self: Arc<Self>) {
        while !self.cancel.is_cancelled() {
            let Some(stream) = self.connect_with_retry().await else {
                break;
            };
            self.serve(stream).await;

            // a backend that accepts and then drops us is retried no faster than a refused dial
            let wait = self.ctx.reconnect_wait;
            debug!(backoff = ?wait, "Backend connection lost, waiting before redial");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(wait) => {}
            }
        }

        debug!("Backend connection ending");
        self.finished.cancel();
    }

    async fn connect_with_retry(&self) -> Option<TcpStream> {
        let wait = self.ctx.reconnect_wait;

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = self.dial() => result,
            };

            match result {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    error!(
                        error = %e,
                        backoff = ?wait,
                        "Error connecting to backend"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = sleep(wait) => {}
                    }
                }
            }
        }
    }

    async fn dial(&self) -> io::Result<TcpStream> {
        let addr = self
            .target
            .socket_addr()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let stream = match timeout(self.ctx.socket.connect_timeout, TcpStream::connect(addr)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timeout",
                ))
            }
        };

        if let Err(e) = self.ctx.socket.apply(&stream) {
            warn!(error = %e, "Failed to apply socket options");
        }
        Ok(stream)
    }

    /// Run one connected backend socket from registration to teardown.
    async fn serve(self: &Arc<Self>, stream: TcpStream) {
        let local_port = stream.local_addr().map(|a| a.port()).unwrap_or_default();
        let key = self.mode.connection_key(local_port, &self.target);
        let (mut reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);

        if let Err(e) = self.ctx.outbound.add(key.clone(), Arc::clone(self)) {
            error!(error = %e, "Backend connection registration failed");
            self.cancel.cancel();
            self.shutdown_writer().await;
            return;
        }
        self.key.store(Some(Arc::new(key.clone())));
        self.connected.send_replace(true);
        info!(key = %key, "Connected to backend");

        let mut frame = FrameState::default();
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = forward_frames(&mut frame, &mut reader, &self.client) => {}
        }

        if frame.source_closed {
            match &frame.socket_error {
                Some(error) => warn!(error = %error, "Backend read failed"),
                None => info!("Backend connection closed"),
            }
            if !self.is_watchdog() {
                self.cancel.cancel();
            }
        } else if let Some(error) = &frame.socket_error {
            error!(
                error = %error,
                lost = frame.remaining,
                "Error sending bytes to client, remaining bytes lost"
            );
            if !self.is_watchdog() {
                error!("Backend connection cancelled");
                self.cancel.cancel();
            }
        }

        self.connected.send_replace(false);
        self.ctx.outbound.remove(&key);
        self.shutdown_writer().await;
        drop(reader);

        // a client still attached here has lost its backend
        if let Some(client) = self.client.detach() {
            info!(
                client = client.connection_key().unwrap_or_default(),
                "Closing client after backend connection ended"
            );
            client.close();
        }
    }

    async fn shutdown_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }

    /// Wait for the connected signal, bounded by cancellation and the send timeout.
    async fn wait_connected(&self) -> bool {
        let mut connected = self.connected.subscribe();
        let ready = async move { connected.wait_for(|up| *up).await.is_ok() };

        tokio::select! {
            _ = self.cancel.cancelled() => false,
            result = timeout(self.ctx.socket.send_timeout, ready) => result.unwrap_or(false),
        }
    }

    /// Give up on this backend: hand the client back to its own loop, then tear down.
    fn abandon(&self) {
        self.client.detach();
        self.close();
    }
}

#[async_trait]
impl ConnectionHandle for OutboundConnection {
    async fn send(&self, state: &mut SendState, buf: &[u8]) {
        state.reset();

        if !self.wait_connected().await {
            state.fail(io::Error::new(
                io::ErrorKind::NotConnected,
                "backend connection not available",
            ));
        } else {
            let mut writer = self.writer.lock().await;
            let cancelled = match writer.as_mut() {
                Some(writer) => tokio::select! {
                    _ = self.cancel.cancelled() => true,
                    _ = send_all(state, writer, buf, Some(self.ctx.socket.send_timeout)) => false,
                },
                None => {
                    state.fail(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "backend connection not available",
                    ));
                    false
                }
            };
            if cancelled {
                state.fail(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "backend connection cancelled",
                ));
            }
        }

        if let Some(error) = &state.error {
            error!(
                backend = %self.target,
                error = %error,
                "Error sending bytes to backend"
            );
            self.abandon();
        }
    }

    fn connection_key(&self) -> Option<String> {
        self.key.load_full().map(|key| key.as_ref().clone())
    }

    fn close(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            debug!(backend = %self.target, mode = %self.mode, "Disposing backend connection");
        }
        self.cancel.cancel();
    }

    async fn release(&self) {
        self.close();
        if self.started.load(Ordering::SeqCst) {
            self.finished.cancelled().await;
        }
    }
}
