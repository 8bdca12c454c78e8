//! Directory Listing
//!
//! Directories read back as newline-delimited JSON, one entry per line,
//! with `Result-Set-Size` reporting the directory's total entry count.
//! Limits are small (at most 1024 entries per page), so one page is
//! buffered rather than streamed.

use crate::context::ProcessContext;
use crate::error::{MuskieError, MuskieResult};
use crate::meta::{EntryKind, ListOptions, ListSort, MetadataStore, StoredEntry};
use chrono::{TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Per-page entry bounds
pub const MAX_LIST_LIMIT: usize = 1024;
pub const DEFAULT_LIST_LIMIT: usize = 256;

/// One listing line
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub mtime: String,
    pub etag: String,
    pub size: u64,
    pub content_type: String,
    #[serde(rename = "contentMD5")]
    pub content_md5: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<String>,
    pub durability: usize,
}

/// A rendered page plus the directory's total entry count
pub struct ListingPage {
    pub result_set_size: u64,
    pub entries: Vec<DirectoryEntry>,
}

impl ListingPage {
    /// The newline-delimited JSON body
    pub fn to_ndjson(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            match serde_json::to_string(entry) {
                Ok(line) => {
                    out.push_str(&line);
                    out.push('\n');
                }
                Err(err) => {
                    tracing::error!(%err, name = %entry.name, "failed to render listing entry")
                }
            }
        }
        out
    }
}

/// Parse the listing query parameters. `sort=none` is operator-only, as is
/// `skip_owner_check`.
pub fn parse_list_options(
    query: &HashMap<String, String>,
    operator: bool,
) -> MuskieResult<ListOptions> {
    let limit = match query.get("limit") {
        None => DEFAULT_LIST_LIMIT,
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .filter(|n| (1..=MAX_LIST_LIMIT).contains(n))
            .ok_or_else(|| MuskieError::InvalidLimit(raw.clone()))?,
    };

    let sort = match query.get("sort").map(String::as_str) {
        None | Some("name") => ListSort::Name,
        Some("mtime") => ListSort::Mtime,
        Some("none") => {
            if !operator {
                return Err(MuskieError::InvalidParameter(
                    "sort=none is operator-only".to_string(),
                ));
            }
            ListSort::None
        }
        Some(other) => return Err(MuskieError::InvalidParameter(format!("sort={other}"))),
    };

    let reverse = match query.get("sort_order").map(String::as_str) {
        None => false,
        Some("reverse") => true,
        Some(other) => {
            return Err(MuskieError::InvalidParameter(format!("sort_order={other}")))
        }
    };

    if query.contains_key("skip_owner_check") && !operator {
        return Err(MuskieError::InvalidParameter(
            "skip_owner_check is operator-only".to_string(),
        ));
    }

    let kind = match (query.contains_key("dir"), query.contains_key("obj")) {
        (true, false) => Some(EntryKind::Directory),
        (false, true) => Some(EntryKind::Object),
        _ => None,
    };

    Ok(ListOptions {
        limit,
        marker: query.get("marker").cloned(),
        sort,
        reverse,
        kind,
    })
}

/// List one page of a directory
pub async fn list_directory(
    process: &ProcessContext,
    key: &str,
    options: ListOptions,
) -> MuskieResult<ListingPage> {
    let store = process.envelope.store();
    let (entries, total) = tokio::join!(store.list(key, options), store.count(key));
    let entries = entries
        .map_err(|err| MuskieError::ServiceUnavailable(err.to_string()))?;
    let total = total.map_err(|err| MuskieError::ServiceUnavailable(err.to_string()))?;

    Ok(ListingPage {
        result_set_size: total,
        entries: entries.iter().map(render_entry).collect(),
    })
}

fn render_entry(entry: &StoredEntry) -> DirectoryEntry {
    let metadata = &entry.metadata;
    let mtime = Utc
        .timestamp_millis_opt(metadata.mtime)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    DirectoryEntry {
        name: crate::meta::path::basename(&metadata.key).to_string(),
        kind: metadata.kind,
        mtime,
        etag: metadata.object_id.clone(),
        size: metadata.content_length,
        content_type: metadata.content_type.clone(),
        content_md5: metadata.content_md5.clone(),
        content_disposition: metadata.content_disposition.clone(),
        durability: metadata.durability(),
    }
}
