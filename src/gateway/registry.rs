//! Per-client registry of remote connections.
//!
//! Maps an opaque client identity to exactly one [`RemoteConnection`],
//! created lazily on first reference and destroyed explicitly or when the
//! client's transport connection drops. The registry is constructed once
//! by the composition root and injected wherever it is needed; there is no
//! process-global instance, which keeps parallel tests independent.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, info};

use crate::gateway::ssh::RemoteConnection;

/// Registry of one [`RemoteConnection`] per client identity.
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<RemoteConnection>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Get the client's connection, creating an unconnected instance on
    /// first reference. Never fails; one instance per client id for the
    /// registry's lifetime.
    pub fn get(&self, client_id: &str) -> Arc<RemoteConnection> {
        self.connections
            .entry(client_id.to_string())
            .or_insert_with(|| {
                debug!("created remote connection slot for client {}", client_id);
                Arc::new(RemoteConnection::new())
            })
            .clone()
    }

    /// Whether a connection instance exists for the client.
    pub fn contains(&self, client_id: &str) -> bool {
        self.connections.contains_key(client_id)
    }

    /// Disconnect and drop the client's connection, if present.
    ///
    /// The single teardown entry point, invoked on client transport loss
    /// and on an explicit disconnect request.
    pub async fn remove(&self, client_id: &str) {
        if let Some((_, connection)) = self.connections.remove(client_id) {
            connection.disconnect().await;
            info!("remote connection removed for client {}", client_id);
        }
    }

    /// Disconnect and drop every tracked connection. Server shutdown only.
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<RemoteConnection>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.connections.clear();

        join_all(connections.iter().map(|c| c.disconnect())).await;
        info!("connection registry shut down ({} connections)", connections.len());
    }

    /// Number of tracked client identities.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the registry tracks no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_twice_returns_same_instance() {
        let registry = ConnectionRegistry::new();
        let first = registry.get("client-1");
        let second = registry.get("client-1");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_distinct_clients_get_distinct_instances() {
        let registry = ConnectionRegistry::new();
        let a = registry.get("client-a");
        let b = registry.get("client-b");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_then_get_yields_fresh_unconnected_instance() {
        let registry = ConnectionRegistry::new();
        let first = registry.get("client-1");

        registry.remove("client-1").await;
        assert!(!registry.contains("client-1"));

        let second = registry.get("client-1");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_connected().await);
        assert!(second.active_shells().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_client_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        registry.remove("nobody").await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_contains_tracks_lifecycle() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.contains("client-1"));
        registry.get("client-1");
        assert!(registry.contains("client-1"));
        registry.remove("client-1").await;
        assert!(!registry.contains("client-1"));
    }

    #[tokio::test]
    async fn test_shutdown_drops_everything() {
        let registry = ConnectionRegistry::new();
        registry.get("client-a");
        registry.get("client-b");
        registry.get("client-c");

        registry.shutdown().await;
        assert!(registry.is_empty());
    }
}
