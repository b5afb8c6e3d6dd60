//! Client-facing connection manager.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::backend::{BackendTarget, ConnectionMode};
use super::forward::{forward_frames, send_all, ConnectionHandle, FrameState, SendState};
use super::outbound::OutboundConnection;
use super::registry::RegistryError;
use super::server::ProxyContext;

#[derive(Debug, Error)]
pub enum InboundError {
    #[error("client socket unusable: {0}")]
    Socket(#[from] io::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Manages one accepted client socket.
///
/// Each iteration of the forwarding loop selects an alive backend, binds a
/// fresh client-bound [`OutboundConnection`] to it, and pumps client reads
/// into it. When a backend fails mid-stream the undelivered bytes are carried
/// over to the next backend; when the client closes, the loop ends.
pub struct InboundConnection {
    ctx: Arc<ProxyContext>,
    key: OnceLock<String>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    cancel: CancellationToken,
    finished: CancellationToken,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl InboundConnection {
    pub fn new(ctx: Arc<ProxyContext>) -> Arc<Self> {
        Arc::new(Self {
            cancel: ctx.shutdown.child_token(),
            ctx,
            key: OnceLock::new(),
            writer: Mutex::new(None),
            finished: CancellationToken::new(),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    /// Take ownership of an accepted socket and serve it until it closes.
    pub fn serve(self: Arc<Self>, stream: TcpStream) -> impl Future<Output = ()> + Send + 'static {
        self.started.store(true, Ordering::SeqCst);
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        async move {
            if let Err(e) = self.run(stream).await {
                error!(error = %e, "Problem processing client connection");
            }
            self.teardown().await;
            self.finished.cancel();
        }
        .instrument(info_span!("client", peer = %peer))
    }

    async fn run(self: &Arc<Self>, stream: TcpStream) -> Result<(), InboundError> {
        let remote = stream.peer_addr()?.to_string();
        let local = stream.local_addr()?.to_string();

        self.ctx.inbound.add(remote.clone(), Arc::clone(self))?;
        let _ = self.key.set(remote);
        info!("Client connected");

        let (mut reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);

        self.forward_loop(&mut reader, &local).await;
        Ok(())
    }

    async fn forward_loop(self: &Arc<Self>, reader: &mut OwnedReadHalf, local_endpoint: &str) {
        let mut frame = FrameState::default();
        let mut pending: Option<Vec<u8>> = None;

        while !self.cancel.is_cancelled() {
            let Some(target) = self.ctx.selector.select_backend() else {
                warn!("No backend connection(s) available, dropping incoming connection");
                break;
            };
            let backend = self.bind_backend(target, local_endpoint);
            let resubmit = pending.take();

            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = Self::forward_to(&mut frame, reader, &backend, resubmit) => {}
            }

            if frame.source_closed {
                match &frame.socket_error {
                    Some(error) => info!(error = %error, "Client read failed"),
                    None => info!("Client closed connection"),
                }
                self.cancel.cancel();
            } else if let Some(error) = frame.socket_error.take() {
                error!(
                    backend = %backend.target(),
                    error = %error,
                    pending = frame.remaining,
                    "Error forwarding to backend, selecting another"
                );
                pending = frame.undelivered.take();
            }

            backend.detach_client();
            backend.release().await;
        }

        if let Some(bytes) = pending {
            warn!(lost = bytes.len(), "Client connection ended with undelivered bytes");
        }
    }

    /// Resubmit bytes a previous backend failed to take, then forward client reads.
    async fn forward_to(
        frame: &mut FrameState,
        reader: &mut OwnedReadHalf,
        backend: &OutboundConnection,
        resubmit: Option<Vec<u8>>,
    ) {
        if let Some(bytes) = resubmit {
            let mut state = SendState::default();
            backend.send(&mut state, &bytes).await;
            if let Some(error) = state.error {
                let sent = state.bytes_sent.min(bytes.len());
                frame.reset();
                frame.remaining = bytes.len() - sent;
                frame.socket_error = Some(error.to_string());
                frame.undelivered = Some(bytes[sent..].to_vec());
                return;
            }
            debug!(bytes = bytes.len(), "Resubmitted undelivered bytes");
        }

        forward_frames(frame, reader, backend).await;
    }

    fn bind_backend(
        self: &Arc<Self>,
        target: BackendTarget,
        local_endpoint: &str,
    ) -> Arc<OutboundConnection> {
        let mode = ConnectionMode::ClientBound {
            client_endpoint: local_endpoint.to_string(),
        };
        let backend = OutboundConnection::new(target, mode, Arc::clone(&self.ctx));

        let client: Arc<dyn ConnectionHandle> = self.clone();
        backend.attach_client(Arc::downgrade(&client));
        tokio::spawn(Arc::clone(&backend).monitor());
        backend
    }

    async fn teardown(&self) {
        self.close();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
        if let Some(key) = self.key.get() {
            self.ctx.inbound.remove(key);
        }
        debug!("Client connection disposed");
    }
}

#[async_trait]
impl ConnectionHandle for InboundConnection {
    async fn send(&self, state: &mut SendState, buf: &[u8]) {
        state.reset();

        let cancelled = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => tokio::select! {
                    _ = self.cancel.cancelled() => true,
                    _ = send_all(state, writer, buf, Some(self.ctx.socket.send_timeout)) => false,
                },
                None => {
                    state.fail(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "client connection not available",
                    ));
                    false
                }
            }
        };
        if cancelled {
            state.fail(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "client connection cancelled",
            ));
        }

        if let Some(error) = &state.error {
            error!(
                client = self.key.get().map(String::as_str).unwrap_or_default(),
                error = %error,
                lost = buf.len().saturating_sub(state.bytes_sent),
                "Error sending bytes to client"
            );
            self.close();
        }
    }

    fn connection_key(&self) -> Option<String> {
        self.key.get().cloned()
    }

    fn close(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            debug!(
                client = self.key.get().map(String::as_str).unwrap_or_default(),
                "Disposing client connection"
            );
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

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::proxy::socket::SocketOptions;

    fn context() -> Arc<ProxyContext> {
        let socket = SocketOptions {
            send_timeout: Duration::from_millis(300),
            ..SocketOptions::default()
        };
        ProxyContext::new(socket, Duration::from_millis(50))
    }

    async fn accepted_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_no_backend_drops_client() {
        let ctx = context();
        let (mut client, accepted) = accepted_pair().await;

        let connection = InboundConnection::new(Arc::clone(&ctx));
        let task = tokio::spawn(Arc::clone(&connection).serve(accepted));

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("client should be closed")
            .unwrap_or(0);
        assert_eq!(n, 0);

        task.await.unwrap();
        assert!(ctx.inbound.is_empty());
    }

    #[tokio::test]
    async fn test_forwards_client_bytes_to_selected_backend() {
        let ctx = context();
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = backend.local_addr().unwrap();
        let target = BackendTarget::new(addr.ip().to_string(), addr.port());

        // an alive backend is one with a registered watchdog
        let watchdog = OutboundConnection::new(target, ConnectionMode::Watchdog, Arc::clone(&ctx));
        let watchdog_task = tokio::spawn(Arc::clone(&watchdog).monitor());
        let (_watchdog_peer, _) = backend.accept().await.unwrap();
        while ctx.selector.select_backend().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (mut client, accepted) = accepted_pair().await;
        let connection = InboundConnection::new(Arc::clone(&ctx));
        let task = tokio::spawn(Arc::clone(&connection).serve(accepted));

        let (mut bound_peer, _) = backend.accept().await.unwrap();
        client.write_all(b"Hello from client 1").await.unwrap();

        let mut buf = [0u8; 19];
        bound_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Hello from client 1");

        bound_peer.write_all(b"Hello from client 1 - response").await.unwrap();
        let mut reply = [0u8; 30];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"Hello from client 1 - response");

        assert_eq!(ctx.inbound.len(), 1);
        assert!(connection.connection_key().is_some());

        drop(client);
        task.await.unwrap();
        assert!(ctx.inbound.is_empty());

        watchdog.release().await;
        watchdog_task.await.unwrap();
        assert!(ctx.outbound.is_empty());
    }

    #[tokio::test]
    async fn test_failed_backend_bytes_resubmitted_to_next_backend() {
        let ctx = context();

        // unreachable backend whose watchdog entry sorts first, so it is selected first
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);
        let dead_target = BackendTarget::new(dead_addr.ip().to_string(), dead_addr.port());
        let stale = OutboundConnection::new(
            dead_target.clone(),
            ConnectionMode::Watchdog,
            Arc::clone(&ctx),
        );
        ctx.outbound
            .add(ConnectionMode::Watchdog.connection_key(0, &dead_target), stale)
            .unwrap();

        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap();
        let live_target = BackendTarget::new(live_addr.ip().to_string(), live_addr.port());
        let watchdog =
            OutboundConnection::new(live_target, ConnectionMode::Watchdog, Arc::clone(&ctx));
        let watchdog_task = tokio::spawn(Arc::clone(&watchdog).monitor());
        let (_watchdog_peer, _) = live.accept().await.unwrap();
        while ctx.outbound.len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (mut client, accepted) = accepted_pair().await;
        let connection = InboundConnection::new(Arc::clone(&ctx));
        let task = tokio::spawn(Arc::clone(&connection).serve(accepted));
        client.write_all(b"first-chunk").await.unwrap();

        // the dead backend never connects, its send times out and the chunk moves on
        let (mut bound_peer, _) = tokio::time::timeout(Duration::from_secs(3), live.accept())
            .await
            .expect("client should be rebound to the live backend")
            .unwrap();
        let mut buf = [0u8; 11];
        tokio::time::timeout(Duration::from_secs(3), bound_peer.read_exact(&mut buf))
            .await
            .expect("resubmitted bytes should arrive")
            .unwrap();
        assert_eq!(&buf, b"first-chunk");

        // the client survives the backend switch
        let mut pending = [0u8; 1];
        assert!(
            tokio::time::timeout(Duration::from_millis(100), client.read(&mut pending))
                .await
                .is_err(),
            "client should still be open"
        );
        assert_eq!(ctx.inbound.len(), 1);

        client.write_all(b"second").await.unwrap();
        let mut buf = [0u8; 6];
        bound_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"second");

        drop(client);
        task.await.unwrap();
        watchdog.release().await;
        watchdog_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_release_before_serve_returns() {
        let ctx = context();
        let connection = InboundConnection::new(ctx);
        connection.release().await;
        assert!(connection.connection_key().is_none());
    }

    #[tokio::test]
    async fn test_send_without_socket_fails() {
        let ctx = context();
        let connection = InboundConnection::new(ctx);

        let mut state = SendState::default();
        connection.send(&mut state, b"nobody").await;

        assert_eq!(state.error.unwrap().kind(), io::ErrorKind::NotConnected);
        assert!(connection.cancel.is_cancelled());
    }
}
