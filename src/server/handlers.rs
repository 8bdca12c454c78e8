//! Route Handlers
//!
//! One handler per method on the object namespace, plus `/ping` and
//! `/metrics`. Handlers parse and normalize, run the namespace guards in
//! their fixed order, and hand off to the data plane. Every response is
//! tagged with its operation name for the metrics layer.

use super::conditional::{self, Disposition};
use super::middleware::{Operation, RequestId};
use crate::context::{ProcessContext, ReqCtx};
use crate::error::{MuskieError, MuskieResult};
use crate::meta::envelope::{is_directory_content_type, is_link_content_type, Envelope};
use crate::meta::snaplink::{self, LinkParams};
use crate::meta::{path, ObjectMetadata};
use crate::metrics;
use crate::ops::{self, write_precondition};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use std::collections::HashMap;
use std::sync::Arc;

/// Dependency-gated liveness: 200 only when both the metadata index and
/// the placement selector can serve.
pub async fn ping(State(process): State<Arc<ProcessContext>>) -> Response {
    let index_ready = process.envelope.store().ready().await;
    let picker_ready = process.picker.is_ready();
    let response = if index_ready && picker_ready {
        StatusCode::NO_CONTENT.into_response()
    } else {
        tracing::debug!(index_ready, picker_ready, "ping while not ready");
        MuskieError::ServiceUnavailable("dependencies are not ready".to_string()).into_response()
    };
    tag("ping", response)
}

/// Prometheus text exposition
pub async fn metrics_text() -> Response {
    let body = metrics::render();
    tag(
        "metrics",
        (
            StatusCode::OK,
            [(
                http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            body,
        )
            .into_response(),
    )
}

/// PUT: mkdir, snaplink, metadata update, or object store, dispatched on
/// content type and query.
pub async fn handle_put(
    State(process): State<Arc<ProcessContext>>,
    request: Request,
) -> Response {
    let (operation, result) = put_inner(&process, request).await;
    finish(operation, result)
}

async fn put_inner(
    process: &ProcessContext,
    request: Request,
) -> (&'static str, MuskieResult<Response>) {
    let (parts, body) = request.into_parts();
    let headers = parts.headers;
    let query = parse_query(&parts.uri);

    let (req, key) = match request_context(&parts.uri, &headers, &parts.extensions) {
        Ok(pair) => pair,
        Err(err) => return ("putobject", Err(err)),
    };

    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let metadata_only = query.get("metadata").map(String::as_str) == Some("true");

    let operation = if content_type.map(is_directory_content_type).unwrap_or(false) {
        "mkdir"
    } else if content_type.map(is_link_content_type).unwrap_or(false) {
        "putlink"
    } else if metadata_only {
        "putmetadata"
    } else {
        "putobject"
    };

    let result = async {
        let pair = process.envelope.load(&key, true).await?;
        conditional::evaluate(&headers, pair.entry.metadata.as_ref(), &Method::PUT)?;
        let is_conditional = conditional::is_conditional(&headers);

        Envelope::ensure_not_root(&key, &Method::PUT, content_type)?;

        match operation {
            "mkdir" => {
                Envelope::ensure_parent(&pair)?;
                process.envelope.enforce_directory_count(&pair).await?;
                let outcome =
                    ops::put::put_directory(process, &req, &key, &pair, &headers, is_conditional)
                        .await?;
                Ok(write_response(&outcome, false))
            }
            "putlink" => {
                let location = headers
                    .get(http::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        MuskieError::InvalidLink("missing Location header".to_string())
                    })?;
                let source_key = path::normalize(location)?;

                Envelope::ensure_not_directory(&pair, false)?;
                Envelope::ensure_parent(&pair)?;
                process.envelope.enforce_directory_count(&pair).await?;

                let record = snaplink::create_link(
                    &process.envelope,
                    &process.snaplinks,
                    Some(&process.sharks),
                    LinkParams {
                        link_key: &key,
                        link_owner: &req.account,
                        source_key: &source_key,
                        incoming_headers: &headers,
                        requested_roles: req.requested_roles.clone(),
                        caller_roles: &req.caller_roles,
                        resolver: Some(process.roles.as_ref()),
                        precondition: write_precondition(&pair, is_conditional),
                        req_id: &req.req_id,
                    },
                )
                .await?;
                let mut response = StatusCode::NO_CONTENT.into_response();
                set_header(&mut response, "etag", &record.object_id);
                set_header(
                    &mut response,
                    "last-modified",
                    &conditional::format_http_date(record.mtime),
                );
                Ok(response)
            }
            "putmetadata" => {
                Envelope::ensure_not_directory(&pair, true)?;
                let outcome =
                    ops::put::update_metadata(process, &req, &key, &pair, &headers, is_conditional)
                        .await?;
                Ok(write_response(&outcome, false))
            }
            _ => {
                Envelope::ensure_not_directory(&pair, false)?;
                Envelope::ensure_parent(&pair)?;
                process.envelope.enforce_directory_count(&pair).await?;
                let outcome = ops::put::put_object(
                    process,
                    &req,
                    &key,
                    &pair,
                    &headers,
                    is_conditional,
                    body.into_data_stream(),
                )
                .await?;
                if let Some(ttfb_ms) = outcome.ttfb_ms {
                    tracing::debug!(req_id = %req.req_id, ttfb_ms, "first client byte");
                }
                Ok(write_response(&outcome, true))
            }
        }
    }
    .await;

    (operation, result)
}

/// GET/HEAD: directory listings and object reads
pub async fn handle_read(
    State(process): State<Arc<ProcessContext>>,
    request: Request,
) -> Response {
    let (operation, result) = read_inner(&process, request).await;
    finish(operation, result)
}

async fn read_inner(
    process: &ProcessContext,
    request: Request,
) -> (&'static str, MuskieResult<Response>) {
    let (parts, _) = request.into_parts();
    let headers = parts.headers;
    let query = parse_query(&parts.uri);
    let head_only = parts.method == Method::HEAD;

    let (req, key) = match request_context(&parts.uri, &headers, &parts.extensions) {
        Ok(pair) => pair,
        Err(err) => return ("getobject", Err(err)),
    };

    let loaded = match process.envelope.load(&key, false).await {
        Ok(pair) => pair,
        Err(err) => return ("getobject", Err(err)),
    };
    // Root directories exist by construction, not as index records.
    let metadata = match loaded.entry.metadata {
        Some(metadata) => metadata,
        None if path::is_root(&key) => ObjectMetadata::implicit_directory(&key, &req.account),
        None => {
            return (
                "getobject",
                Err(MuskieError::ResourceNotFound(key.clone())),
            );
        }
    };

    let operation = if metadata.is_directory() {
        "listdirectory"
    } else {
        "getobject"
    };

    let result = async {
        match conditional::evaluate(&headers, Some(&metadata), &parts.method)? {
            Disposition::NotModified => {
                let mut response = StatusCode::NOT_MODIFIED.into_response();
                set_header(&mut response, "etag", &metadata.object_id);
                set_header(
                    &mut response,
                    "last-modified",
                    &conditional::format_http_date(metadata.mtime),
                );
                return Ok(response);
            }
            Disposition::Proceed => {}
        }

        if metadata.is_directory() {
            let options = ops::list::parse_list_options(&query, req.operator)?;
            let page = ops::list::list_directory(process, &key, options).await?;
            let body = if head_only {
                String::new()
            } else {
                page.to_ndjson()
            };
            let mut response = (StatusCode::OK, body).into_response();
            set_header(
                &mut response,
                "content-type",
                "application/x-json-stream; type=directory",
            );
            set_header(
                &mut response,
                "result-set-size",
                &page.result_set_size.to_string(),
            );
            set_header(&mut response, "etag", &metadata.object_id);
            set_header(
                &mut response,
                "last-modified",
                &conditional::format_http_date(metadata.mtime),
            );
            return Ok(response);
        }

        let range = headers
            .get(http::header::RANGE)
            .and_then(|v| v.to_str().ok());
        match ops::get::get_object(process, &req, &metadata, range, head_only).await? {
            ops::get::GetReply::HeadersOnly { metadata } => {
                let mut response = StatusCode::OK.into_response();
                apply_object_headers(&mut response, &metadata);
                set_header(
                    &mut response,
                    "content-length",
                    &metadata.content_length.to_string(),
                );
                Ok(response)
            }
            ops::get::GetReply::Stream {
                metadata,
                status,
                content_length,
                content_range,
                body,
            } => {
                let mut response = (
                    StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
                    Body::from_stream(body),
                )
                    .into_response();
                apply_object_headers(&mut response, &metadata);
                if let Some(len) = content_length {
                    set_header(&mut response, "content-length", &len.to_string());
                }
                if let Some(content_range) = content_range {
                    set_header(&mut response, "content-range", &content_range);
                }
                Ok(response)
            }
            ops::get::GetReply::NotSatisfiable { content_range } => {
                let mut response = MuskieError::RangeNotSatisfiable.into_response();
                if let Some(content_range) = content_range {
                    set_header(&mut response, "content-range", &content_range);
                }
                Ok(response)
            }
        }
    }
    .await;

    (operation, result)
}

/// DELETE: objects, links, and empty directories
pub async fn handle_delete(
    State(process): State<Arc<ProcessContext>>,
    request: Request,
) -> Response {
    let (operation, result) = delete_inner(&process, request).await;
    finish(operation, result)
}

async fn delete_inner(
    process: &ProcessContext,
    request: Request,
) -> (&'static str, MuskieResult<Response>) {
    let (parts, _) = request.into_parts();
    let headers = parts.headers;

    let (req, key) = match request_context(&parts.uri, &headers, &parts.extensions) {
        Ok(pair) => pair,
        Err(err) => return ("deleteobject", Err(err)),
    };

    let result: MuskieResult<(&'static str, Response)> = async {
        Envelope::ensure_not_root(&key, &Method::DELETE, None)?;

        let pair = process.envelope.load(&key, false).await?;
        conditional::evaluate(&headers, pair.entry.metadata.as_ref(), &Method::DELETE)?;
        let is_conditional = conditional::is_conditional(&headers);

        let operation = match &pair.entry.metadata {
            Some(metadata) if metadata.is_directory() => "deletedirectory",
            _ => "deleteobject",
        };
        ops::delete::delete_entry(process, &req, &pair, is_conditional).await?;
        Ok((operation, StatusCode::NO_CONTENT.into_response()))
    }
    .await;

    match result {
        Ok((operation, response)) => (operation, Ok(response)),
        Err(err) => ("deleteobject", Err(err)),
    }
}

/// Build the request context from the routed parts
fn request_context(
    uri: &Uri,
    headers: &HeaderMap,
    extensions: &http::Extensions,
) -> MuskieResult<(ReqCtx, String)> {
    let key = path::normalize(uri.path())?;
    let account = path::account_of(&key).to_string();

    let req_id = extensions
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut req = ReqCtx::new(req_id, account);
    // The fronting auth layer resolves the caller; it hands the results
    // over as trusted headers.
    req.caller_roles = split_header(headers, "x-caller-roles");
    let requested = split_header(headers, "role");
    req.requested_roles = (!requested.is_empty()).then_some(requested);
    req.operator = headers.contains_key("x-account-operator");
    Ok((req, key))
}

fn split_header(headers: &HeaderMap, name: &str) -> Vec<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_query(uri: &Uri) -> HashMap<String, String> {
    let Some(raw) = uri.query() else {
        return HashMap::new();
    };
    raw.split('&')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let name = urlencoding::decode(name).ok()?.into_owned();
            let value = urlencoding::decode(value).ok()?.into_owned();
            Some((name, value))
        })
        .collect()
}

/// 204 plus the write-result headers
fn write_response(outcome: &ops::PutOutcome, with_md5: bool) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    set_header(&mut response, "etag", &outcome.object_id);
    set_header(
        &mut response,
        "last-modified",
        &conditional::format_http_date(outcome.mtime),
    );
    if with_md5 {
        set_header(&mut response, "computed-md5", &outcome.computed_md5);
    }
    response
}

/// The object response headers: identity, caching, durability, plus the
/// stored whitelist and custom headers.
fn apply_object_headers(response: &mut Response, metadata: &ObjectMetadata) {
    set_header(response, "content-type", &metadata.content_type);
    if !metadata.content_md5.is_empty() {
        set_header(response, "content-md5", &metadata.content_md5);
    }
    set_header(
        response,
        "durability-level",
        &metadata.durability().to_string(),
    );
    set_header(response, "accept-ranges", "bytes");
    set_header(response, "etag", &metadata.object_id);
    set_header(
        response,
        "last-modified",
        &conditional::format_http_date(metadata.mtime),
    );
    if let Some(disposition) = &metadata.content_disposition {
        set_header(response, "content-disposition", disposition);
    }
    for (name, value) in &metadata.headers {
        set_header(response, name, value);
    }
}

fn set_header(response: &mut Response, name: &str, value: &str) {
    let Ok(name) = http::header::HeaderName::from_bytes(name.as_bytes()) else {
        return;
    };
    let Ok(value) = HeaderValue::from_str(value) else {
        tracing::debug!(header = %name, "dropping unencodable response header");
        return;
    };
    response.headers_mut().insert(name, value);
}

fn tag(operation: &'static str, mut response: Response) -> Response {
    response.extensions_mut().insert(Operation(operation));
    response
}

fn finish(operation: &'static str, result: MuskieResult<Response>) -> Response {
    match result {
        Ok(response) => tag(operation, response),
        Err(err) => {
            if err.status() >= 500 {
                tracing::error!(code = err.code(), %err, "request failed");
            } else {
                tracing::info!(code = err.code(), %err, "request rejected");
            }
            tag(operation, err.into_response())
        }
    }
}
