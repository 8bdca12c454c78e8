//! Stored Headers
//!
//! The subset of request headers that survives into a metadata record: a
//! whitelist of CORS/cache/disposition headers, plus arbitrary `m-*`
//! custom headers capped at 4 KiB aggregate. The cap truncates silently;
//! an invalid Content-Disposition is a hard 400.

use crate::error::{MuskieError, MuskieResult};
use http::HeaderMap;
use std::collections::BTreeMap;

/// Aggregate cap on custom `m-*` headers (names plus values)
pub const MAX_CUSTOM_HEADER_BYTES: usize = 4 * 1024;

/// Headers copied verbatim when present
const WHITELIST: &[&str] = &[
    "access-control-allow-headers",
    "access-control-allow-methods",
    "access-control-allow-origin",
    "access-control-expose-headers",
    "access-control-max-age",
    "cache-control",
    "surrogate-key",
];

/// Build the stored-header map for a new metadata record
pub fn build_stored_headers(incoming: &HeaderMap) -> MuskieResult<BTreeMap<String, String>> {
    let mut stored = BTreeMap::new();

    for name in WHITELIST {
        if let Some(value) = incoming.get(*name).and_then(|v| v.to_str().ok()) {
            stored.insert((*name).to_string(), value.to_string());
        }
    }

    let mut custom_bytes = 0usize;
    for (name, value) in incoming {
        let name = name.as_str();
        if !name.starts_with("m-") {
            continue;
        }
        let Ok(value) = value.to_str() else { continue };
        let cost = name.len() + value.len();
        if custom_bytes + cost > MAX_CUSTOM_HEADER_BYTES {
            break;
        }
        custom_bytes += cost;
        stored.insert(name.to_string(), value.to_string());
    }

    Ok(stored)
}

/// Validate a Content-Disposition value by parsing and reformatting it.
/// Returns the canonical form.
pub fn validate_content_disposition(value: &str) -> MuskieResult<String> {
    let parsed = parse_disposition(value)
        .ok_or_else(|| MuskieError::BadRequest(format!("invalid content-disposition: {value}")))?;
    Ok(format_disposition(&parsed))
}

#[derive(Debug, PartialEq, Eq)]
struct Disposition {
    kind: String,
    params: Vec<(String, String)>,
}

fn parse_disposition(value: &str) -> Option<Disposition> {
    let mut parts = value.split(';');
    let kind = parts.next()?.trim().to_ascii_lowercase();
    if kind.is_empty() || !kind.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return None;
    }

    let mut params = Vec::new();
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            return None;
        }
        let (name, raw) = part.split_once('=')?;
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return None;
        }
        let raw = raw.trim();
        let value = if let Some(inner) = raw.strip_prefix('"') {
            let inner = inner.strip_suffix('"')?;
            if inner.contains('"') {
                return None;
            }
            inner.to_string()
        } else {
            if raw.is_empty() || raw.chars().any(|c| c.is_whitespace() || c == '"') {
                return None;
            }
            raw.to_string()
        };
        params.push((name, value));
    }
    Some(Disposition { kind, params })
}

fn format_disposition(disposition: &Disposition) -> String {
    let mut out = disposition.kind.clone();
    for (name, value) in &disposition.params {
        out.push_str(&format!("; {name}=\"{value}\""));
    }
    out
}
