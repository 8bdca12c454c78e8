//! Metadata Index
//!
//! The sharded index is an external system; this module defines the trait
//! the envelope consumes plus an in-memory implementation used by tests and
//! the dev server. Conditional writes ride on opaque etags: every stored
//! generation gets a fresh one, and a mismatched precondition fails the
//! write without touching the record.

use super::{EntryKind, ObjectMetadata};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Index-level errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional write lost the race
    #[error("etag precondition failed")]
    PreconditionFailed,
    #[error("no such entry")]
    NotFound,
    #[error("index failure: {0}")]
    Internal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Concurrency control for writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional; the index may transparently retry once on conflict
    None,
    /// Write only if the stored etag matches
    IfEtag(String),
    /// Write only if no entry exists
    IfAbsent,
}

/// A record plus the opaque etag of its stored generation
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub metadata: ObjectMetadata,
    pub etag: String,
}

/// Listing sort order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListSort {
    #[default]
    Name,
    Mtime,
    /// Index order; cheapest, operator-only at the HTTP layer
    None,
}

/// Directory listing parameters
#[derive(Debug, Clone)]
pub struct ListOptions {
    pub limit: usize,
    pub marker: Option<String>,
    pub sort: ListSort,
    pub reverse: bool,
    /// Restrict to one entry kind
    pub kind: Option<EntryKind>,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            limit: 256,
            marker: None,
            sort: ListSort::Name,
            reverse: false,
            kind: None,
        }
    }
}

/// The metadata index as the envelope sees it
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<StoredEntry>>;

    /// Store a record, returning the new generation's etag
    async fn put(&self, record: ObjectMetadata, precondition: Precondition) -> StoreResult<String>;

    async fn delete(&self, key: &str, precondition: Precondition) -> StoreResult<()>;

    /// Immediate children of `dir`
    async fn list(&self, dir: &str, options: ListOptions) -> StoreResult<Vec<StoredEntry>>;

    /// Number of immediate children of `dir`
    async fn count(&self, dir: &str) -> StoreResult<u64>;

    /// False until the index can serve requests
    async fn ready(&self) -> bool;
}

/// In-memory index. Correct under concurrency (single lock, fresh etag per
/// generation) but obviously not durable.
#[derive(Default)]
pub struct MemoryIndex {
    entries: RwLock<BTreeMap<String, StoredEntry>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(existing: Option<&StoredEntry>, precondition: &Precondition) -> StoreResult<()> {
        match precondition {
            Precondition::None => Ok(()),
            Precondition::IfAbsent => {
                if existing.is_some() {
                    Err(StoreError::PreconditionFailed)
                } else {
                    Ok(())
                }
            }
            Precondition::IfEtag(expect) => match existing {
                Some(entry) if &entry.etag == expect => Ok(()),
                _ => Err(StoreError::PreconditionFailed),
            },
        }
    }

    fn children<'a>(
        entries: &'a BTreeMap<String, StoredEntry>,
        dir: &str,
    ) -> impl Iterator<Item = &'a StoredEntry> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let prefix_len = prefix.len();
        let start = prefix.clone();
        entries
            .range(start..)
            .take_while(move |(key, _)| key.starts_with(&prefix))
            .filter(move |(key, _)| !key[prefix_len..].contains('/'))
            .map(|(_, entry)| entry)
    }
}

#[async_trait]
impl MetadataStore for MemoryIndex {
    async fn get(&self, key: &str) -> StoreResult<Option<StoredEntry>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, record: ObjectMetadata, precondition: Precondition) -> StoreResult<String> {
        let mut entries = self.entries.write();
        Self::check(entries.get(&record.key), &precondition)?;
        let etag = Uuid::new_v4().to_string();
        entries.insert(
            record.key.clone(),
            StoredEntry {
                metadata: record,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn delete(&self, key: &str, precondition: Precondition) -> StoreResult<()> {
        let mut entries = self.entries.write();
        match entries.get(key) {
            None => return Err(StoreError::NotFound),
            existing => Self::check(existing, &precondition)?,
        }
        entries.remove(key);
        Ok(())
    }

    async fn list(&self, dir: &str, options: ListOptions) -> StoreResult<Vec<StoredEntry>> {
        let entries = self.entries.read();
        let mut children: Vec<StoredEntry> = Self::children(&entries, dir)
            .filter(|entry| match options.kind {
                None => true,
                Some(kind) => entry.metadata.kind == kind,
            })
            .cloned()
            .collect();

        match options.sort {
            ListSort::Name | ListSort::None => {
                children.sort_by(|a, b| a.metadata.key.cmp(&b.metadata.key))
            }
            ListSort::Mtime => children.sort_by_key(|entry| entry.metadata.mtime),
        }
        if options.reverse {
            children.reverse();
        }

        if let Some(marker) = &options.marker {
            let position = children.iter().position(|entry| {
                let name = super::path::basename(&entry.metadata.key);
                match options.sort {
                    ListSort::Mtime => entry.metadata.mtime.to_string().as_str() > marker.as_str(),
                    _ => name > marker.as_str(),
                }
            });
            match position {
                Some(at) => {
                    children.drain(..at);
                }
                None => children.clear(),
            }
        }

        children.truncate(options.limit);
        Ok(children)
    }

    async fn count(&self, dir: &str) -> StoreResult<u64> {
        let entries = self.entries.read();
        Ok(Self::children(&entries, dir).count() as u64)
    }

    async fn ready(&self) -> bool {
        true
    }
}
