//! Snaplinks
//!
//! A link references another object's bytes without copying them. The one
//! delicate part is the write order: an object marked `single_path` must be
//! rewritten with the mark cleared *before* the link record exists. A crash
//! between the two writes leaves a single-reference object conservatively
//! marked multi-reference, which is harmless; the reverse order could let
//! accelerated deletion reclaim bytes a brand-new link still points at.

use super::envelope::{Envelope, MetadataParams};
use super::path;
use super::store::Precondition;
use super::{EntryKind, ObjectMetadata, RoleResolver};
use crate::error::{MuskieError, MuskieResult};
use crate::shark::SharkRegistry;
use http::HeaderMap;
use std::collections::HashSet;

/// Whether snaplink creation is allowed at all, and for whom
#[derive(Debug, Clone, Default)]
pub struct SnaplinkGate {
    /// Set when offline cleanup has not finished; creation is refused
    /// globally until it has
    pub cleanup_required: bool,
    /// Accounts that opted out of snaplinks entirely
    pub disabled_accounts: HashSet<String>,
}

impl SnaplinkGate {
    pub fn new(cleanup_required: bool, disabled_accounts: &[String]) -> Self {
        Self {
            cleanup_required,
            disabled_accounts: disabled_accounts.iter().cloned().collect(),
        }
    }

    /// May `account`'s objects be linked to?
    pub fn allows(&self, account: &str) -> bool {
        !self.cleanup_required && !self.disabled_accounts.contains(account)
    }

    /// Objects of such accounts are eligible for accelerated deletion
    pub fn account_disabled(&self, account: &str) -> bool {
        self.disabled_accounts.contains(account)
    }
}

/// Inputs for creating a link
pub struct LinkParams<'a> {
    /// Canonical key of the link being created
    pub link_key: &'a str,
    /// Account creating the link
    pub link_owner: &'a str,
    /// Canonical key of the source object (from the Location header)
    pub source_key: &'a str,
    pub incoming_headers: &'a HeaderMap,
    pub requested_roles: Option<Vec<String>>,
    pub caller_roles: &'a [String],
    pub resolver: Option<&'a dyn RoleResolver>,
    /// Etag precondition for the link write itself, when conditional
    pub precondition: Precondition,
    pub req_id: &'a str,
}

/// Create a link to an existing object. Returns the committed link record.
pub async fn create_link(
    envelope: &Envelope,
    gate: &SnaplinkGate,
    registry: Option<&SharkRegistry>,
    params: LinkParams<'_>,
) -> MuskieResult<ObjectMetadata> {
    let source_owner = path::account_of(params.source_key);
    if source_owner.is_empty() {
        return Err(MuskieError::InvalidLink(params.source_key.to_string()));
    }
    if !gate.allows(source_owner) {
        return Err(MuskieError::Authorization(format!(
            "snaplinks are not enabled for {source_owner}"
        )));
    }

    let source = envelope.load(params.source_key, false).await?;
    let (source_meta, source_etag) = match (source.entry.metadata, source.entry.etag) {
        (Some(meta), Some(etag)) => (meta, etag),
        _ => return Err(MuskieError::LinkNotFound(params.source_key.to_string())),
    };
    if source_meta.kind != EntryKind::Object {
        return Err(MuskieError::LinkNotObject(params.source_key.to_string()));
    }

    // Clear single_path on the source first. Conditional on the etag we
    // loaded, so racing link creators serialize through the index.
    if source_meta.single_path {
        let mut cleared = source_meta.clone();
        cleared.single_path = false;
        envelope
            .commit(cleared, Precondition::IfEtag(source_etag))
            .await?;
    }

    // Tell the nodes holding the bytes that a second reference exists.
    // Metadata stays authoritative; a node that misses the notification
    // only loses an optimization.
    if let Some(registry) = registry {
        for shark in &source_meta.sharks {
            let client = registry.client(&shark.storage_id, &shark.datacenter);
            let payload = serde_json::json!({
                "op": "link",
                "owner": params.link_owner,
            });
            if let Err(err) = client
                .post(
                    source_meta.shark_owner(),
                    &source_meta.object_id,
                    params.req_id,
                    payload,
                )
                .await
            {
                tracing::warn!(
                    storage_id = %shark.storage_id,
                    %err,
                    "link notification failed"
                );
            }
        }
    }

    let creator = if source_meta.creator.is_empty() {
        source_meta.owner.clone()
    } else {
        source_meta.creator.clone()
    };

    let record = envelope.build_metadata(MetadataParams {
        key: params.link_key,
        owner: params.link_owner,
        creator: Some(&creator),
        kind: EntryKind::Link,
        object_id: source_meta.object_id.clone(),
        content_length: source_meta.content_length,
        content_md5: source_meta.content_md5.clone(),
        content_type: source_meta.content_type.clone(),
        sharks: source_meta.sharks.clone(),
        incoming_headers: params.incoming_headers,
        requested_roles: params.requested_roles,
        caller_roles: params.caller_roles,
        resolver: params.resolver,
        single_path: false,
    })?;

    envelope.commit(record.clone(), params.precondition).await?;
    Ok(record)
}
