//! Envelope Operations
//!
//! The choreography around every index access: load the entry and its
//! parent in parallel, run the namespace guards in their fixed order, build
//! records with filtered headers and resolved roles, and commit with the
//! right concurrency semantics.
//!
//! Guard order is load-bearing and must not be rearranged:
//! `ensure_not_root` -> `ensure_not_directory` -> `ensure_parent` ->
//! `enforce_directory_count` -> (`ensure_directory_empty` on DELETE).

use super::headers::{build_stored_headers, validate_content_disposition};
use super::path;
use super::store::{ListOptions, ListSort, MetadataStore, Precondition, StoreError};
use super::{EntryKind, LoadedEntry, ObjectMetadata, RoleResolver, SharkRef};
use crate::error::{MuskieError, MuskieResult};
use http::{HeaderMap, Method};
use std::sync::Arc;

/// Hard ceiling on entries per directory
pub const DIRECTORY_ENTRY_LIMIT: u64 = 1_000_000;

/// Entry plus (optionally) its parent, loaded together
#[derive(Debug, Clone)]
pub struct LoadedPair {
    pub entry: LoadedEntry,
    pub parent: Option<LoadedEntry>,
}

/// Inputs for building a metadata record
pub struct MetadataParams<'a> {
    pub key: &'a str,
    pub owner: &'a str,
    /// Set only when the bytes live under another account's namespace
    pub creator: Option<&'a str>,
    pub kind: EntryKind,
    pub object_id: String,
    pub content_length: u64,
    pub content_md5: String,
    pub content_type: String,
    pub sharks: Vec<SharkRef>,
    pub incoming_headers: &'a HeaderMap,
    /// Role names the caller asked for explicitly; None inherits
    pub requested_roles: Option<Vec<String>>,
    /// The caller's active role ids
    pub caller_roles: &'a [String],
    pub resolver: Option<&'a dyn RoleResolver>,
    pub single_path: bool,
}

/// The metadata envelope
pub struct Envelope {
    store: Arc<dyn MetadataStore>,
}

impl Envelope {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Load `key` and, for writes on non-root keys, its parent, in
    /// parallel. A missing entry is a sentinel, not an error; GET/HEAD
    /// callers turn it into `ResourceNotFound` themselves.
    pub async fn load(&self, key: &str, with_parent: bool) -> MuskieResult<LoadedPair> {
        let parent_key = path::dirname(key);
        let load_parent = with_parent && !path::is_root(key);

        let entry_fut = self.load_one(key);
        if load_parent {
            let (entry, parent) = tokio::join!(entry_fut, self.load_one(&parent_key));
            Ok(LoadedPair {
                entry: entry?,
                parent: Some(parent?),
            })
        } else {
            Ok(LoadedPair {
                entry: entry_fut.await?,
                parent: None,
            })
        }
    }

    async fn load_one(&self, key: &str) -> MuskieResult<LoadedEntry> {
        match self.store.get(key).await {
            Ok(Some(stored)) => Ok(LoadedEntry {
                key: key.to_string(),
                metadata: Some(stored.metadata),
                etag: Some(stored.etag),
            }),
            Ok(None) => Ok(LoadedEntry::missing(key)),
            Err(err) => Err(store_error(err)),
        }
    }

    /// Guard 1: root paths cannot be deleted, and can only be "written"
    /// as directories (the idempotent-mkdir case).
    pub fn ensure_not_root(key: &str, method: &Method, content_type: Option<&str>) -> MuskieResult<()> {
        if !path::is_root(key) {
            return Ok(());
        }
        match *method {
            Method::DELETE => Err(MuskieError::RootDirectory(key.to_string())),
            Method::PUT => {
                if content_type.map(is_directory_content_type).unwrap_or(false) {
                    Ok(())
                } else {
                    Err(MuskieError::RootDirectory(key.to_string()))
                }
            }
            _ => Ok(()),
        }
    }

    /// Guard 2: an object PUT cannot overwrite a directory. Pure metadata
    /// updates are exempt; they only touch the record.
    pub fn ensure_not_directory(pair: &LoadedPair, metadata_only: bool) -> MuskieResult<()> {
        if metadata_only {
            return Ok(());
        }
        match &pair.entry.metadata {
            Some(existing) if existing.is_directory() => Err(MuskieError::DirectoryOperation(
                format!("{} is a directory", pair.entry.key),
            )),
            _ => Ok(()),
        }
    }

    /// Guard 3: the parent must exist and be a directory. Skipped when the
    /// key is a root or the parent is (roots are implicit directories).
    pub fn ensure_parent(pair: &LoadedPair) -> MuskieResult<()> {
        if path::is_root(&pair.entry.key) {
            return Ok(());
        }
        let parent_key = path::dirname(&pair.entry.key);
        if path::is_root(&parent_key) {
            return Ok(());
        }
        let Some(parent) = &pair.parent else {
            return Ok(());
        };
        match &parent.metadata {
            None => Err(MuskieError::DirectoryDoesNotExist(parent_key)),
            Some(meta) if !meta.is_directory() => Err(MuskieError::ParentNotDirectory(parent_key)),
            Some(_) => Ok(()),
        }
    }

    /// Guard 4: creating a new entry must not push the parent past the
    /// directory entry limit. Runs only for creations; overwrites do not
    /// change the count.
    pub async fn enforce_directory_count(&self, pair: &LoadedPair) -> MuskieResult<()> {
        if pair.entry.exists() {
            return Ok(());
        }
        let parent_key = path::dirname(&pair.entry.key);
        let count = self
            .store
            .count(&parent_key)
            .await
            .map_err(|err| store_error(err))?;
        if count >= DIRECTORY_ENTRY_LIMIT {
            return Err(MuskieError::DirectoryLimit(parent_key));
        }
        Ok(())
    }

    /// Guard 5 (DELETE only): a directory must be empty. A limit-1
    /// unsorted probe is all it takes.
    pub async fn ensure_directory_empty(&self, key: &str) -> MuskieResult<()> {
        let probe = self
            .store
            .list(
                key,
                ListOptions {
                    limit: 1,
                    sort: ListSort::None,
                    ..ListOptions::default()
                },
            )
            .await
            .map_err(|err| store_error(err))?;
        if probe.is_empty() {
            Ok(())
        } else {
            Err(MuskieError::DirectoryNotEmpty(key.to_string()))
        }
    }

    /// Build a record per the data model: filtered headers, validated
    /// disposition, resolved or inherited roles.
    pub fn build_metadata(&self, params: MetadataParams<'_>) -> MuskieResult<ObjectMetadata> {
        let stored_headers = build_stored_headers(params.incoming_headers)?;

        let content_disposition = match params
            .incoming_headers
            .get(http::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
        {
            Some(raw) => Some(validate_content_disposition(raw)?),
            None => None,
        };

        let roles = match params.requested_roles {
            Some(names) => {
                let resolver = params
                    .resolver
                    .ok_or_else(|| MuskieError::InvalidRoleTag(names.join(",")))?;
                resolver
                    .resolve(params.owner, &names)
                    .map_err(MuskieError::InvalidRoleTag)?
            }
            None => params.caller_roles.to_vec(),
        };

        Ok(ObjectMetadata {
            key: params.key.to_string(),
            parent: path::dirname(params.key),
            owner: params.owner.to_string(),
            creator: params.creator.unwrap_or_default().to_string(),
            kind: params.kind,
            object_id: params.object_id,
            content_length: params.content_length,
            content_md5: params.content_md5,
            content_type: params.content_type,
            content_disposition,
            sharks: params.sharks,
            mtime: chrono::Utc::now().timestamp_millis(),
            headers: stored_headers,
            roles,
            single_path: params.single_path,
        })
    }

    /// Commit a record. A conditional commit that loses the race surfaces
    /// as `ConcurrentRequest`; an unconditional one retries once before
    /// giving up the same way.
    pub async fn commit(
        &self,
        record: ObjectMetadata,
        precondition: Precondition,
    ) -> MuskieResult<String> {
        match self.store.put(record.clone(), precondition.clone()).await {
            Ok(etag) => Ok(etag),
            Err(StoreError::PreconditionFailed) if precondition == Precondition::None => self
                .store
                .put(record, precondition.clone())
                .await
                .map_err(store_error),
            Err(err) => Err(store_error(err)),
        }
    }

    /// Delete a record with the same conditional semantics as `commit`
    pub async fn remove(&self, key: &str, precondition: Precondition) -> MuskieResult<()> {
        self.store
            .delete(key, precondition.clone())
            .await
            .map_err(store_error)
    }
}

/// Accept both directory content types: the streaming listing type and
/// plain JSON with the directory type parameter.
pub fn is_directory_content_type(content_type: &str) -> bool {
    let mut parts = content_type.split(';');
    let base = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    if base != "application/json" && base != "application/x-json-stream" {
        return false;
    }
    parts.any(|p| p.trim().eq_ignore_ascii_case("type=directory"))
}

/// Same test for the snaplink content type
pub fn is_link_content_type(content_type: &str) -> bool {
    let mut parts = content_type.split(';');
    let base = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    if base != "application/json" && base != "application/x-json-stream" {
        return false;
    }
    parts.any(|p| p.trim().eq_ignore_ascii_case("type=link"))
}

/// Two directory records are interchangeable when their client-visible
/// fields match; a re-PUT of such a directory is a no-op.
pub fn same_directory(existing: &ObjectMetadata, candidate: &ObjectMetadata) -> bool {
    existing.is_directory()
        && existing.headers == candidate.headers
        && existing.roles == candidate.roles
}

fn store_error(err: StoreError) -> MuskieError {
    match err {
        // a lost race, whichever side noticed it
        StoreError::PreconditionFailed | StoreError::NotFound => MuskieError::ConcurrentRequest,
        StoreError::Internal(detail) => MuskieError::ServiceUnavailable(detail),
    }
}
