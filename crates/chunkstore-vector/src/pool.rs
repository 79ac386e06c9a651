//! Connection pool keyed by connection alias
//!
//! Holds at most one live connection per alias. Concurrent opens of the
//! same alias share a single connection attempt; the pool map is only
//! locked to look up the alias slot, never across the handshake.

use crate::backend::{BackendHandle, Connector};
use chunkstore_core::{ConnectionInfo, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

type Slot = Arc<OnceCell<BackendHandle>>;

/// Live backend connections, shared by alias
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ConnectionPool {
    /// Create an empty pool
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Open a connection for `info`, reusing a live one with the same alias
    pub async fn open(&self, info: &ConnectionInfo) -> Result<BackendHandle> {
        self.get_or_create(info).await
    }

    /// Return the live connection for the alias or establish it
    pub async fn get_or_create(&self, info: &ConnectionInfo) -> Result<BackendHandle> {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.entry(info.alias.clone()).or_default().clone()
        };

        if let Some(handle) = slot.get() {
            debug!(
                host = %info.host,
                port = info.port,
                alias = %info.alias,
                "Reuse connection to Milvus server"
            );
            return Ok(handle.clone());
        }

        let handle = slot
            .get_or_try_init(|| async {
                let handle = self.connector.connect(info).await?;
                info!(
                    host = %info.host,
                    port = info.port,
                    alias = %info.alias,
                    "Created connection to Milvus server"
                );
                Ok::<_, chunkstore_core::StoreError>(handle)
            })
            .await?;

        Ok(handle.clone())
    }

    /// Live connection for an alias, if any
    pub async fn get(&self, alias: &str) -> Option<BackendHandle> {
        let slots = self.slots.lock().await;
        slots.get(alias).and_then(|slot| slot.get().cloned())
    }

    /// Number of live connections
    pub async fn len(&self) -> usize {
        let slots = self.slots.lock().await;
        slots.values().filter(|slot| slot.initialized()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close and forget every connection
    pub async fn close_all(&self) {
        let drained: Vec<(String, Slot)> = {
            let mut slots = self.slots.lock().await;
            slots.drain().collect()
        };

        for (alias, slot) in drained {
            if let Some(handle) = slot.get() {
                if let Err(e) = handle.close().await {
                    warn!(alias = %alias, error = %e, "Failed to close connection");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackend, MemoryConnector};

    fn info(host: &str) -> ConnectionInfo {
        ConnectionInfo::new(host, 19530, "default", "chunks")
    }

    #[tokio::test]
    async fn test_open_reuses_alias() {
        let connector = Arc::new(MemoryConnector::new(Arc::new(MemoryBackend::new())));
        let pool = ConnectionPool::new(connector.clone());

        let a = pool.open(&info("10.0.0.1")).await.unwrap();
        let b = pool.open(&info("10.0.0.1")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.connect_count(), 1);

        pool.open(&info("10.0.0.2")).await.unwrap();
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_open_connects_once() {
        let connector = Arc::new(MemoryConnector::new(Arc::new(MemoryBackend::new())));
        let pool = Arc::new(ConnectionPool::new(connector.clone()));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.open(&info("10.0.0.1")).await.is_ok() })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            assert!(task.unwrap());
        }
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_can_be_retried() {
        let connector = Arc::new(
            MemoryConnector::new(Arc::new(MemoryBackend::new())).with_unreachable_host("down"),
        );
        let pool = ConnectionPool::new(connector.clone());

        assert!(pool.open(&info("down")).await.is_err());
        assert!(pool.is_empty().await);
        assert!(pool.get(&info("down").alias).await.is_none());
    }

    #[tokio::test]
    async fn test_close_all_forgets_connections() {
        let connector = Arc::new(MemoryConnector::new(Arc::new(MemoryBackend::new())));
        let pool = ConnectionPool::new(connector.clone());

        pool.open(&info("10.0.0.1")).await.unwrap();
        pool.close_all().await;
        assert!(pool.is_empty().await);

        pool.open(&info("10.0.0.1")).await.unwrap();
        assert_eq!(connector.connect_count(), 2);
    }
}
