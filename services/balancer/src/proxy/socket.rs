//! Transport options applied to every accepted and dialed socket.

use std::io;
use std::time::Duration;

use socket2::SockRef;
use tokio::net::TcpStream;

use crate::config::Config;

/// Default connect timeout for backend dials.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub receive_timeout: Duration,
    pub send_timeout: Duration,
    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
    /// Favor latency over throughput for small messages.
    pub nodelay: bool,
    pub connect_timeout: Duration,
}

impl SocketOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            receive_timeout: config.receive_timeout(),
            send_timeout: config.send_timeout(),
            receive_buffer_size: config.receive_buffer_size,
            send_buffer_size: config.send_buffer_size,
            nodelay: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Apply the options to a connected stream.
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        let socket = SockRef::from(stream);
        socket.set_recv_buffer_size(self.receive_buffer_size)?;
        socket.set_send_buffer_size(self.send_buffer_size)?;
        socket.set_read_timeout(Some(self.receive_timeout))?;
        socket.set_write_timeout(Some(self.send_timeout))?;

        Ok(())
    }
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
