//! Concurrent connection registries.
//!
//! A registry maps a connection key to its manager. It owns the lookup
//! relationship only: managers add themselves when they connect and remove
//! themselves during teardown, and the registry never disposes an entry.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, warn};

use super::inbound::InboundConnection;
use super::outbound::OutboundConnection;

/// Registry of client-facing connections, keyed by client remote endpoint.
pub type InboundRegistry = ConnectionRegistry<InboundConnection>;

/// Registry of backend-facing connections (watchdog and client-bound).
pub type OutboundRegistry = ConnectionRegistry<OutboundConnection>;

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A live entry already uses this key.
    #[error("{registry} connection with key {key} already exists")]
    DuplicateKey { registry: &'static str, key: String },
}

/// Concurrent map from connection key to manager.
pub struct ConnectionRegistry<M: ?Sized> {
    /// Registry name for logging.
    name: &'static str,
    connections: DashMap<String, Arc<M>>,
}

impl<M: ?Sized> ConnectionRegistry<M> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            connections: DashMap::new(),
        }
    }

    /// Register a connection. Fails without touching the map if the key is live.
    pub fn add(&self, key: impl Into<String>, connection: Arc<M>) -> Result<(), RegistryError> {
        let key = key.into();
        match self.connections.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(RegistryError::DuplicateKey {
                    registry: self.name,
                    key,
                })
            }
            Entry::Vacant(vacant) => {
                vacant.insert(connection);
            }
        }

        // count may already be stale, it is for diagnostics only
        info!(
            registry = self.name,
            key = %key,
            count = self.connections.len(),
            "Connection added"
        );
        Ok(())
    }

    /// Deregister a connection. Absent keys are a no-op.
    pub fn remove(&self, key: &str) -> Option<Arc<M>> {
        match self.connections.remove(key) {
            Some((_, connection)) => {
                info!(
                    registry = self.name,
                    key = %key,
                    count = self.connections.len(),
                    "Connection removed"
                );
                Some(connection)
            }
            None => {
                warn!(
                    registry = self.name,
                    key = %key,
                    "Attempted to remove non-existent connection"
                );
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<M>> {
        self.connections.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Point-in-time copy of all entries, sorted by key.
    pub fn snapshot(&self) -> Vec<(String, Arc<M>)> {
        let mut entries: Vec<_> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Empty the map. Callers release the entries first.
    pub fn clear(&self) {
        self.connections.clear();
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
