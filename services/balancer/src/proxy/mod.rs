//! L4 TCP load balancing.
//!
//! This module provides:
//! - Connection registries for client-facing and backend-facing sockets
//! - Persistent watchdog connections that define which backends are alive
//! - Backend selection across alive backends
//! - Byte-transparent forwarding in both directions
//!
//! ## Architecture
//!
//! ```text
//!                        +--> Watchdog --> OutboundConnection (watchdog) --> Backend
//!                        |                         | registers
//! Client -> Server ------+                  OutboundRegistry <-- BackendSelector
//!                        |                                            |
//!                        +--> InboundConnection ------ selects -------+
//!                                   |  owns
//!                                   +--> OutboundConnection (client-bound) --> Backend
//! ```
//!
//! Client bytes flow from the inbound connection into its client-bound
//! outbound connection; backend bytes flow back through the outbound
//! connection's attached-client slot.
//!
//! ## Usage
//!
//! ```ignore
//! let server = Arc::new(Server::bind(&config).await?);
//! let shutdown = CancellationToken::new();
//! tokio::spawn({
//!     let server = Arc::clone(&server);
//!     let shutdown = shutdown.clone();
//!     async move { server.run(shutdown).await }
//! });
//! // ...
//! server.dispose().await;
//! ```

mod backend;
mod forward;
mod inbound;
mod outbound;
mod registry;
mod selector;
mod server;
mod sink;
mod socket;
mod watchdog;

pub use backend::{BackendTarget, ConnectionMode, WATCHDOG_PREFIX};
pub use forward::{
    forward_frames, send_all, ConnectionHandle, FrameState, SendState, FRAME_BUFFER_SIZE,
};
pub use inbound::{InboundConnection, InboundError};
pub use outbound::OutboundConnection;
pub use registry::{ConnectionRegistry, InboundRegistry, OutboundRegistry, RegistryError};
pub use selector::BackendSelector;
pub use server::{ProxyContext, Server, ServerStats};
pub use sink::{ClientSlot, DiscardSink};
pub use socket::{SocketOptions, DEFAULT_CONNECT_TIMEOUT};
pub use watchdog::Watchdog;
