//! Metadata Envelope
//!
//! Everything between the HTTP surface and the metadata index: canonical
//! keys, the metadata record itself, header filtering, namespace guards,
//! conditional commits, and snaplink ordering.

pub mod envelope;
pub mod headers;
pub mod path;
pub mod snaplink;
pub mod store;

pub use envelope::{Envelope, LoadedPair, MetadataParams, DIRECTORY_ENTRY_LIMIT};
pub use store::{ListOptions, ListSort, MemoryIndex, MetadataStore, Precondition, StoredEntry};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a metadata record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    Object,
    Link,
}

/// One replica location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharkRef {
    pub datacenter: String,
    pub storage_id: String,
}

/// The unit stored in the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Canonical absolute key
    pub key: String,
    /// dirname of `key`
    pub parent: String,
    /// Account that owns the entry
    pub owner: String,
    /// Account whose namespace holds the bytes on the storage nodes;
    /// differs from `owner` only for cross-account links
    pub creator: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Stable id; doubles as the name on storage nodes and the public Etag
    pub object_id: String,
    pub content_length: u64,
    pub content_md5: String,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<String>,
    /// Replica locations; empty for directories and zero-byte objects
    pub sharks: Vec<SharkRef>,
    /// Milliseconds since the epoch
    pub mtime: i64,
    /// Whitelisted response headers plus custom `m-*` headers
    pub headers: BTreeMap<String, String>,
    /// Role ids tagged on the entry
    pub roles: Vec<String>,
    /// True while the object has never had a second reference; cleared
    /// before any link to it is written
    #[serde(default)]
    pub single_path: bool,
}

impl ObjectMetadata {
    /// The fixed per-account root directories are never stored in the
    /// index; reads see them as this synthetic record.
    pub fn implicit_directory(key: &str, owner: &str) -> Self {
        Self {
            key: key.to_string(),
            parent: path::dirname(key),
            owner: owner.to_string(),
            creator: String::new(),
            kind: EntryKind::Directory,
            object_id: key.to_string(),
            content_length: 0,
            content_md5: String::new(),
            content_type: "application/x-json-stream; type=directory".to_string(),
            content_disposition: None,
            sharks: Vec::new(),
            mtime: 0,
            headers: BTreeMap::new(),
            roles: Vec::new(),
            single_path: false,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_object(&self) -> bool {
        self.kind == EntryKind::Object
    }

    pub fn is_link(&self) -> bool {
        self.kind == EntryKind::Link
    }

    /// Replica count reported as Durability-Level
    pub fn durability(&self) -> usize {
        self.sharks.len()
    }

    /// Account under which the bytes live on the storage nodes
    pub fn shark_owner(&self) -> &str {
        if self.creator.is_empty() {
            &self.owner
        } else {
            &self.creator
        }
    }
}

/// A load result: the sentinel for "no entry" is `metadata: None`, not an
/// error, so writers can reason about creations uniformly. The index's
/// opaque `_etag` travels with the load for conditional commits.
#[derive(Debug, Clone)]
pub struct LoadedEntry {
    pub key: String,
    pub metadata: Option<ObjectMetadata>,
    pub etag: Option<String>,
}

impl LoadedEntry {
    pub fn missing(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            metadata: None,
            etag: None,
        }
    }

    pub fn exists(&self) -> bool {
        self.metadata.is_some()
    }
}

/// Resolves caller-supplied role names to role ids
pub trait RoleResolver: Send + Sync {
    /// Resolve `names` for `account`; any unknown name fails the whole set
    fn resolve(&self, account: &str, names: &[String]) -> Result<Vec<String>, String>;
}

/// Fixed name-to-id table; tests and the dev server use this
#[derive(Debug, Default)]
pub struct StaticRoleResolver {
    roles: BTreeMap<(String, String), String>,
}

impl StaticRoleResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, account: &str, name: &str, id: &str) {
        self.roles
            .insert((account.to_string(), name.to_string()), id.to_string());
    }
}

impl RoleResolver for StaticRoleResolver {
    fn resolve(&self, account: &str, names: &[String]) -> Result<Vec<String>, String> {
        names
            .iter()
            .map(|name| {
                self.roles
                    .get(&(account.to_string(), name.clone()))
                    .cloned()
                    .ok_or_else(|| name.clone())
            })
            .collect()
    }
}
