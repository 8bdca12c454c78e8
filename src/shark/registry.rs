//! Client Registry
//!
//! One `SharkClient` per storage node, shared process-wide. Creation is
//! first-write-wins so concurrent requests for the same node always end up
//! on the same keep-alive pool.

use super::client::SharkClient;
use crate::config::SharkConfig;
use crate::picker::StorageNode;
use dashmap::DashMap;
use std::sync::Arc;

/// Process-wide storage-node client registry
pub struct SharkRegistry {
    config: SharkConfig,
    clients: DashMap<String, Arc<SharkClient>>,
}

impl SharkRegistry {
    pub fn new(config: SharkConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            clients: DashMap::new(),
        })
    }

    /// Client for a node, creating it on first use
    pub fn client(&self, storage_id: &str, datacenter: &str) -> Arc<SharkClient> {
        self.clients
            .entry(storage_id.to_string())
            .or_insert_with(|| {
                Arc::new(SharkClient::new(storage_id, datacenter, self.config.clone()))
            })
            .clone()
    }

    /// Client for a node chosen by the picker
    pub fn client_for(&self, node: &StorageNode) -> Arc<SharkClient> {
        self.client(&node.storage_id, &node.datacenter)
    }

    /// Register a pre-built client (tests point these at mock nodes)
    pub fn insert(&self, client: SharkClient) {
        let client = Arc::new(client);
        self.clients
            .entry(client.storage_id().to_string())
            .or_insert(client);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
