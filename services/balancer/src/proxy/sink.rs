//! Destinations for backend reads.
//!
//! An outbound connection always forwards into its [`ClientSlot`]. The slot
//! relays to the attached client, or to a [`DiscardSink`] when no client is
//! attached (or the attached client has already gone away), so the read loop
//! never special-cases "no destination".

use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::forward::{ConnectionHandle, SendState};

/// Logs and drops everything sent to it. Every send succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

#[async_trait]
impl ConnectionHandle for DiscardSink {
    async fn send(&self, state: &mut SendState, buf: &[u8]) {
        state.reset();
        warn!(
            bytes = buf.len(),
            message = %String::from_utf8_lossy(buf),
            "No client attached, message discarded"
        );
        state.bytes_sent = buf.len();
    }

    fn connection_key(&self) -> Option<String> {
        None
    }

    fn close(&self) {
        debug!("Close on discard sink ignored");
    }

    async fn release(&self) {}
}

enum Attachment {
    Detached,
    Client(Weak<dyn ConnectionHandle>),
}

/// Atomically swappable, non-owning handle to the attached client.
pub struct ClientSlot {
    current: ArcSwap<Attachment>,
    discard: DiscardSink,
}

impl ClientSlot {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Attachment::Detached),
            discard: DiscardSink,
        }
    }

    /// Route subsequent frames to `client`.
    pub fn attach(&self, client: Weak<dyn ConnectionHandle>) {
        self.current.store(Arc::new(Attachment::Client(client)));
    }

    /// Route subsequent frames to the discard sink.
    ///
    /// Returns the previously attached client if it is still alive.
    pub fn detach(&self) -> Option<Arc<dyn ConnectionHandle>> {
        let previous = self.current.swap(Arc::new(Attachment::Detached));
        match &*previous {
            Attachment::Client(client) => client.upgrade(),
            Attachment::Detached => None,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.client().is_some()
    }

    fn client(&self) -> Option<Arc<dyn ConnectionHandle>> {
        match &**self.current.load() {
            Attachment::Client(client) => client.upgrade(),
            Attachment::Detached => None,
        }
    }
}

impl Default for ClientSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionHandle for ClientSlot {
    async fn send(&self, state: &mut SendState, buf: &[u8]) {
        match self.client() {
            Some(client) => client.send(state, buf).await,
            None => self.discard.send(state, buf).await,
        }
    }

    fn connection_key(&self) -> Option<String> {
        self.client().and_then(|client| client.connection_key())
    }

    fn close(&self) {
        if let Some(client) = self.client() {
            client.close();
        }
    }

    async fn release(&self) {
        if let Some(client) = self.client() {
            client.release().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Client {
        received: Mutex<Vec<u8>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl ConnectionHandle for Client {
        async fn send(&self, state: &mut SendState, buf: &[u8]) {
            state.reset();
            self.received.lock().unwrap().extend_from_slice(buf);
            state.bytes_sent = buf.len();
        }

        fn connection_key(&self) -> Option<String> {
            Some("127.0.0.1:50000".to_string())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        async fn release(&self) {
            self.close();
        }
    }

    fn attach(slot: &ClientSlot, client: &Arc<Client>) {
        let handle: Arc<dyn ConnectionHandle> = client.clone();
        slot.attach(Arc::downgrade(&handle));
    }

    #[tokio::test]
    async fn test_discard_sink_reports_success() {
        let mut state = SendState::default();
        DiscardSink.send(&mut state, b"lost").await;
        assert!(state.is_ok());
        assert_eq!(state.bytes_sent, 4);
    }

    #[tokio::test]
    async fn test_detached_slot_discards() {
        let slot = ClientSlot::new();
        let mut state = SendState::default();

        slot.send(&mut state, b"nobody listening").await;

        assert!(state.is_ok());
        assert_eq!(state.bytes_sent, 16);
        assert!(!slot.is_attached());
        assert!(slot.connection_key().is_none());
    }

    #[tokio::test]
    async fn test_attach_and_detach() {
        let slot = ClientSlot::new();
        let client = Arc::new(Client::default());
        attach(&slot, &client);

        let mut state = SendState::default();
        slot.send(&mut state, b"to client").await;
        assert_eq!(client.received.lock().unwrap().as_slice(), b"to client");
        assert_eq!(slot.connection_key().as_deref(), Some("127.0.0.1:50000"));

        let previous = slot.detach().unwrap();
        assert_eq!(previous.connection_key().as_deref(), Some("127.0.0.1:50000"));
        assert!(slot.detach().is_none());

        slot.send(&mut state, b"after detach").await;
        assert!(state.is_ok());
        assert_eq!(client.received.lock().unwrap().as_slice(), b"to client");
    }

    #[tokio::test]
    async fn test_dropped_client_falls_back_to_discard() {
        let slot = ClientSlot::new();
        let client = Arc::new(Client::default());
        attach(&slot, &client);
        drop(client);

        let mut state = SendState::default();
        slot.send(&mut state, b"late").await;

        assert!(state.is_ok());
        assert!(!slot.is_attached());
        assert!(slot.detach().is_none());
    }

    #[tokio::test]
    async fn test_close_reaches_attached_client() {
        let slot = ClientSlot::new();
        let client = Arc::new(Client::default());
        attach(&slot, &client);

        slot.close();
        assert!(client.closed.load(Ordering::SeqCst));
    }
}
