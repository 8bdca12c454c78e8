//! Request Middleware
//!
//! Request-id propagation, admission control, and request metrics. These
//! wrap every route, including `/ping` and `/metrics` for the id layer;
//! admission wraps only the object routes.

use crate::context::ProcessContext;
use crate::error::MuskieError;
use crate::metrics;
use crate::throttle::Permit;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::HeaderValue;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Propagated request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request id, taken from the client or generated here
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Label describing which operation a handler performed, for metrics
#[derive(Debug, Clone)]
pub struct Operation(pub &'static str);

/// Attach a request id and echo it (plus the server name) on the response
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let req_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request.extensions_mut().insert(RequestId(req_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&req_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    if let Ok(name) = std::env::var("HOSTNAME") {
        if let Ok(value) = HeaderValue::from_str(&name) {
            response.headers_mut().insert("x-server-name", value);
        }
    }
    response
}

/// Admission control around one request. The permit rides the response
/// extensions so the slot is held until the response (body included) is
/// dropped; `mark_responded` lets the reaper reclaim slots whose bodies
/// never finish.
pub async fn admission(
    State(process): State<Arc<ProcessContext>>,
    request: Request,
    next: Next,
) -> Response {
    let req_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let permit: Permit = match process.throttle.enter(&req_id).await {
        Ok(permit) => permit,
        Err(err @ MuskieError::Throttled { .. }) => {
            if let MuskieError::Throttled {
                queued,
                in_flight,
                concurrency,
            } = &err
            {
                tracing::warn!(
                    req_id = %req_id,
                    queued,
                    in_flight,
                    concurrency,
                    "request shed by admission control"
                );
            }
            return err.into_response();
        }
        Err(err) => return err.into_response(),
    };

    let mut response = next.run(request).await;
    process.throttle.mark_responded(&req_id);
    response.extensions_mut().insert(Arc::new(permit));
    response
}

/// Reject requests whose Date header is older than the configured age.
/// Replayed or badly delayed requests never reach the data plane.
pub async fn request_age(
    State(process): State<Arc<ProcessContext>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(date) = request
        .headers()
        .get(http::header::DATE)
        .and_then(|v| v.to_str().ok())
        .and_then(super::conditional::parse_http_date)
    {
        let age = chrono::Utc::now().signed_duration_since(date);
        if age.num_seconds() > process.config.max_request_age_s as i64 {
            return MuskieError::BadRequest(format!(
                "request is too old: {}s",
                age.num_seconds()
            ))
            .into_response();
        }
    }
    next.run(request).await
}

/// Record the per-request counters and latency histograms
pub async fn request_metrics(request: Request, next: Next) -> Response {
    let method = request.method().as_str().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let operation = response
        .extensions()
        .get::<Operation>()
        .map(|op| op.0)
        .unwrap_or("unknown");
    let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
    // headers are committed at this point; for streamed bodies this is the
    // time to first byte, for buffered ones it is close enough
    metrics::observe_ttfb(operation, &method, status, elapsed_ms);
    metrics::observe_request(operation, &method, status, elapsed_ms);
    response
}
