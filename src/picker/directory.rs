//! Node Directory
//!
//! The discovery source for storage nodes. The production implementation
//! polls an HTTP directory service with cursor pagination; tests use the
//! in-memory implementation.

use super::snapshot::StorageNode;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Directory errors
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("directory returned status {0}")]
    Status(u16),
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// One page of the node listing
#[derive(Debug, Clone, Deserialize)]
pub struct NodePage {
    pub nodes: Vec<StorageNode>,
    /// Opaque continuation cursor; None when exhausted
    pub next: Option<String>,
}

/// Source of storage-node records
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    /// Fetch one page. `cursor` is the `next` value of the previous page.
    async fn page(&self, cursor: Option<&str>, limit: usize) -> DirectoryResult<NodePage>;
}

/// HTTP directory client. The service filters by utilization ceiling and
/// heartbeat staleness server-side; the snapshot build re-applies both.
pub struct HttpNodeDirectory {
    client: reqwest::Client,
    base_url: String,
    max_percent_used: u32,
    max_heartbeat_age_s: u64,
}

impl HttpNodeDirectory {
    pub fn new(base_url: impl Into<String>, max_percent_used: u32, max_heartbeat_age_s: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            max_percent_used,
            max_heartbeat_age_s,
        }
    }
}

#[async_trait]
impl NodeDirectory for HttpNodeDirectory {
    async fn page(&self, cursor: Option<&str>, limit: usize) -> DirectoryResult<NodePage> {
        let mut request = self
            .client
            .get(format!("{}/storage", self.base_url))
            .query(&[
                ("limit", limit.to_string()),
                ("max_percent_used", self.max_percent_used.to_string()),
                ("max_heartbeat_age_s", self.max_heartbeat_age_s.to_string()),
            ]);
        if let Some(marker) = cursor {
            request = request.query(&[("marker", marker)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }
        Ok(response.json::<NodePage>().await?)
    }
}

/// Fixed node list for tests and the dev server
pub struct StaticNodeDirectory {
    nodes: Vec<StorageNode>,
    page_size: usize,
}

impl StaticNodeDirectory {
    pub fn new(nodes: Vec<StorageNode>) -> Self {
        Self {
            nodes,
            page_size: 100,
        }
    }

    pub fn with_page_size(nodes: Vec<StorageNode>, page_size: usize) -> Self {
        Self { nodes, page_size }
    }
}

#[async_trait]
impl NodeDirectory for StaticNodeDirectory {
    async fn page(&self, cursor: Option<&str>, limit: usize) -> DirectoryResult<NodePage> {
        let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let limit = limit.min(self.page_size);
        let end = (start + limit).min(self.nodes.len());
        let next = if end < self.nodes.len() {
            Some(end.to_string())
        } else {
            None
        };
        Ok(NodePage {
            nodes: self.nodes[start..end].to_vec(),
            next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn node(id: &str) -> StorageNode {
        StorageNode {
            storage_id: id.to_string(),
            datacenter: "dc0".to_string(),
            available_bytes: 1_000,
            percent_used: 10,
            last_heartbeat: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_static_directory_paginates() {
        let nodes: Vec<StorageNode> = (0..7).map(|i| node(&format!("n{i}"))).collect();
        let directory = StaticNodeDirectory::with_page_size(nodes, 3);

        let mut collected = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = directory.page(cursor.as_deref(), 3).await.unwrap();
            collected.extend(page.nodes);
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(collected.len(), 7);
        assert_eq!(collected[6].storage_id, "n6");
    }
}
