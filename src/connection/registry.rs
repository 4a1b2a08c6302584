//! Connection Registry
//!
//! The authoritative set of live connections. Every mutation goes through
//! a single mutex; the lock is never held across an `.await` or while
//! calling into a connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use super::stream::Connection;
use super::types::{ConnectionId, ConnectionState};

/// A tracked connection
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub connection: Arc<Connection>,
    pub host: String,
    pub state: ConnectionState,
    pub accepted_at: Instant,
}

impl ConnectionRecord {
    /// New active record for an accepted connection
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            id: connection.id(),
            host: connection.host().to_string(),
            connection,
            state: ConnectionState::Active,
            accepted_at: Instant::now(),
        }
    }
}

/// Lightweight view of a record, safe to hand out
#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub host: String,
    pub accepted_at: Instant,
}

/// Concurrent map of active connections keyed by id
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    records: Mutex<HashMap<ConnectionId, ConnectionRecord>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert an active record. Returns false if the id is already tracked.
    pub fn insert(&self, record: ConnectionRecord) -> bool {
        let mut records = self.lock();
        if records.contains_key(&record.id) {
            return false;
        }
        records.insert(record.id, record);
        true
    }

    /// Remove a record, marking it closed. `None` if it was not tracked.
    pub fn remove(&self, id: &ConnectionId) -> Option<ConnectionRecord> {
        let mut record = self.lock().remove(id)?;
        record.state = ConnectionState::Closed;
        Some(record)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.lock().get(id).map(|record| Arc::clone(&record.connection))
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove every record at once, marking each closed
    pub fn drain(&self) -> Vec<ConnectionRecord> {
        let drained: Vec<ConnectionRecord> = self.lock().drain().map(|(_, record)| record).collect();
        drained
            .into_iter()
            .map(|mut record| {
                record.state = ConnectionState::Closed;
                record
            })
            .collect()
    }

    /// Connections currently tracked, for inspection
    pub fn snapshot(&self) -> Vec<ConnectionSummary> {
        self.lock()
            .values()
            .map(|record| ConnectionSummary {
                id: record.id,
                host: record.host.clone(),
                accepted_at: record.accepted_at,
            })
            .collect()
    }

    /// Handles to every tracked connection
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.lock()
            .values()
            .map(|record| Arc::clone(&record.connection))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::loopback_pair;

    async fn new_connection() -> (Arc<Connection>, tokio::net::TcpStream) {
        let (server, client) = loopback_pair().await;
        (
            Arc::new(Connection::new(ConnectionId::new(), server, 1024)),
            client,
        )
    }

    #[tokio::test]
    async fn test_insert_and_remove() {
        let registry = ConnectionRegistry::new();
        let (connection, _client) = new_connection().await;
        let id = connection.id();

        assert!(registry.insert(ConnectionRecord::new(connection)));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&id));
        assert!(registry.get(&id).is_some());

        let removed = registry.remove(&id).unwrap();
        assert_eq!(removed.state, ConnectionState::Closed);
        assert_eq!(removed.host, "127.0.0.1");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let registry = ConnectionRegistry::new();
        let (connection, _client) = new_connection().await;

        assert!(registry.insert(ConnectionRecord::new(Arc::clone(&connection))));
        assert!(!registry.insert(ConnectionRecord::new(connection)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (connection, _client) = new_connection().await;
        let id = connection.id();
        registry.insert(ConnectionRecord::new(connection));

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.remove(&ConnectionId::new()).is_none());
    }

    #[tokio::test]
    async fn test_drain_and_snapshot() {
        let registry = ConnectionRegistry::new();
        let mut clients = Vec::new();
        for _ in 0..3 {
            let (connection, client) = new_connection().await;
            registry.insert(ConnectionRecord::new(connection));
            clients.push(client);
        }

        assert_eq!(registry.snapshot().len(), 3);
        assert_eq!(registry.connections().len(), 3);

        let drained = registry.drain();
        assert_eq!(drained.len(), 3);
        assert!(drained.iter().all(|r| r.state == ConnectionState::Closed));
        assert!(registry.is_empty());
    }
}
