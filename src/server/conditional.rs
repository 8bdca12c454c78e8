//! Conditional Requests
//!
//! One evaluation point for If-Match, If-None-Match, If-Modified-Since and
//! If-Unmodified-Since, shared by reads and writes. The user-visible etag
//! is the object id; the index's opaque `_etag` never leaves the process.

use crate::error::{MuskieError, MuskieResult};
use crate::meta::ObjectMetadata;
use chrono::{DateTime, TimeZone, Utc};
use http::{HeaderMap, Method};

/// What the precondition evaluation decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Proceed,
    /// Reads only: the representation is unchanged
    NotModified,
}

/// True when the request carries an etag precondition; such writes commit
/// against the loaded index generation.
pub fn is_conditional(headers: &HeaderMap) -> bool {
    headers.contains_key(http::header::IF_MATCH) || headers.contains_key(http::header::IF_NONE_MATCH)
}

/// Evaluate all precondition headers against the loaded entry.
pub fn evaluate(
    headers: &HeaderMap,
    metadata: Option<&ObjectMetadata>,
    method: &Method,
) -> MuskieResult<Disposition> {
    let read = *method == Method::GET || *method == Method::HEAD;
    let etag = metadata.map(|m| m.object_id.as_str());
    let mtime = metadata.map(|m| m.mtime);

    if let Some(raw) = header_str(headers, http::header::IF_MATCH) {
        let matched = match etag {
            None => false,
            Some(etag) => etag_list_matches(raw, etag),
        };
        if !matched {
            return Err(MuskieError::PreconditionFailed(format!(
                "if-match {raw}"
            )));
        }
    }

    if let Some(raw) = header_str(headers, http::header::IF_NONE_MATCH) {
        let matched = match etag {
            None => false,
            Some(etag) => etag_list_matches(raw, etag),
        };
        if matched {
            return if read {
                Ok(Disposition::NotModified)
            } else {
                Err(MuskieError::PreconditionFailed(format!(
                    "if-none-match {raw}"
                )))
            };
        }
    }

    if let Some(raw) = header_str(headers, http::header::IF_UNMODIFIED_SINCE) {
        if let (Some(mtime), Some(since)) = (mtime, parse_http_date(raw)) {
            // HTTP dates have second precision
            if mtime / 1_000 > since.timestamp_millis() / 1_000 {
                return Err(MuskieError::PreconditionFailed(format!(
                    "if-unmodified-since {raw}"
                )));
            }
        }
    }

    if read {
        if let Some(raw) = header_str(headers, http::header::IF_MODIFIED_SINCE) {
            if let (Some(mtime), Some(since)) = (mtime, parse_http_date(raw)) {
                // HTTP dates have second precision
                if mtime / 1_000 <= since.timestamp_millis() / 1_000 {
                    return Ok(Disposition::NotModified);
                }
            }
        }
    }

    Ok(Disposition::Proceed)
}

fn header_str(headers: &HeaderMap, name: http::header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `*` matches anything; otherwise compare against each listed etag,
/// tolerating quotes and weak prefixes.
fn etag_list_matches(raw: &str, etag: &str) -> bool {
    raw.split(',').any(|candidate| {
        let candidate = candidate
            .trim()
            .trim_start_matches("W/")
            .trim_matches('"');
        candidate == "*" || candidate == etag
    })
}

/// RFC 7231 IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`
pub fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Format an mtime for Last-Modified
pub fn format_http_date(mtime_ms: i64) -> String {
    let when = Utc
        .timestamp_millis_opt(mtime_ms)
        .single()
        .unwrap_or_else(Utc::now);
    when.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
