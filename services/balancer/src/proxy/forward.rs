//! Byte forwarding primitives shared by both connection managers.
//!
//! Transport failures on this path are captured as data in [`SendState`] and
//! [`FrameState`] rather than returned as errors, so the caller decides what a
//! failure means for its connection (reselect a backend, drop the client, ...).

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes read from a source per frame.
pub const FRAME_BUFFER_SIZE: usize = 16 * 1024;

/// Something frames can be forwarded to.
///
/// Implemented by both connection managers, so either can be the destination
/// of the other, and by the discard sink used when nothing is attached.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Send `buf` onward. Outcome is reported in `state`, never panics or returns early.
    async fn send(&self, state: &mut SendState, buf: &[u8]);

    /// Registry key, once the connection has one.
    fn connection_key(&self) -> Option<String>;

    /// Trigger teardown without waiting for it to finish.
    fn close(&self);

    /// Trigger teardown and wait until the connection's task has finished.
    async fn release(&self);
}

/// Outcome of a single send call.
///
/// After a send returns, either `bytes_sent` equals the requested length and
/// `error` is `None`, or `error` is set and `bytes_sent` is short.
#[derive(Debug, Default)]
pub struct SendState {
    pub bytes_sent: usize,
    pub error: Option<io::Error>,
}

impl SendState {
    pub fn reset(&mut self) {
        self.bytes_sent = 0;
        self.error = None;
    }

    pub fn fail(&mut self, error: io::Error) {
        self.error = Some(error);
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of one `forward_frames` call.
#[derive(Debug, Default)]
pub struct FrameState {
    /// Bytes of the current frame not yet delivered.
    pub remaining: usize,
    /// Transport error that ended forwarding.
    pub socket_error: Option<String>,
    /// Undelivered tail of the frame that failed.
    pub undelivered: Option<Vec<u8>>,
    /// The source reached EOF or failed to read.
    pub source_closed: bool,
}

impl FrameState {
    pub fn reset(&mut self) {
        self.remaining = 0;
        self.socket_error = None;
        self.undelivered = None;
        self.source_closed = false;
    }
}

/// Pump frames from `source` to `destination` until the source closes or a send fails.
///
/// A send failure records the error and the undelivered bytes and returns
/// immediately. A read error is recorded and treated as the source closing.
pub async fn forward_frames<R>(
    frame: &mut FrameState,
    source: &mut R,
    destination: &dyn ConnectionHandle,
) where
    R: AsyncRead + Unpin + ?Sized,
{
    frame.reset();
    let mut buf = vec![0u8; FRAME_BUFFER_SIZE];
    let mut send_state = SendState::default();

    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => {
                frame.source_closed = true;
                return;
            }
            Ok(n) => n,
            Err(e) => {
                frame.socket_error = Some(e.to_string());
                frame.source_closed = true;
                return;
            }
        };

        frame.remaining = n;
        destination.send(&mut send_state, &buf[..n]).await;
        let sent = send_state.bytes_sent.min(n);
        frame.remaining -= sent;

        if let Some(error) = send_state.error.take() {
            frame.socket_error = Some(error.to_string());
            frame.undelivered = Some(buf[sent..n].to_vec());
            return;
        }
    }
}

/// Write all of `buf`, accumulating across partial writes.
///
/// Each write must make progress within `send_timeout`.
pub async fn send_all<W>(
    state: &mut SendState,
    writer: &mut W,
    buf: &[u8],
    send_timeout: Option<Duration>,
) where
    W: AsyncWrite + Unpin + ?Sized,
{
    state.reset();

    while state.bytes_sent < buf.len() {
        let write = writer.write(&buf[state.bytes_sent..]);
        let result = match send_timeout {
            Some(limit) => match tokio::time::timeout(limit, write).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "send timeout")),
            },
            None => write.await,
        };

        match result {
            Ok(0) => {
                state.fail(io::ErrorKind::WriteZero.into());
                return;
            }
            Ok(n) => state.bytes_sent += n,
            Err(e) => {
                state.fail(e);
                return;
            }
        }
    }
}
