//! HTTP Surface
//!
//! The axum router over the object namespace plus the service endpoints.
//! Layer order (outermost first): request id, request metrics, CORS, then
//! admission control around the object routes only; `/ping` and
//! `/metrics` must answer even when the system is shedding load.
//!
//! Socket-level inactivity protection for streamed bodies rides on the
//! data-plane idle deadlines (`MUSKIE_DATA_TIMEOUT`); the configured
//! `SOCKET_TIMEOUT` is carried for the fronting load balancer's benefit.

pub mod conditional;
pub mod handlers;
pub mod middleware;

use crate::context::ProcessContext;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the full router
pub fn router(process: Arc<ProcessContext>) -> Router {
    let object_routes = Router::new()
        .route(
            "/:account",
            get(handlers::handle_read)
                .put(handlers::handle_put)
                .delete(handlers::handle_delete),
        )
        .route(
            "/:account/*path",
            get(handlers::handle_read)
                .put(handlers::handle_put)
                .delete(handlers::handle_delete),
        )
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&process),
            middleware::admission,
        ))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&process),
            middleware::request_age,
        ));

    Router::new()
        .route("/ping", get(handlers::ping))
        .route("/metrics", get(handlers::metrics_text))
        .merge(object_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(middleware::request_metrics))
        .layer(axum::middleware::from_fn(middleware::request_id))
        .with_state(process)
}

/// Bind and serve until the process is stopped
pub async fn serve(process: Arc<ProcessContext>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], process.config.port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, router(process)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fixtures;
    use axum::body::Body;
    use http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_ping_gates_on_picker() {
        // a context with no nodes never finishes a refresh
        let (process, _) = fixtures::process_context(&[]).await;
        let app = router(Arc::new(process));
        let response = app
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_ping_ready() {
        let mock = crate::testutil::mock_shark::MockShark::spawn().await;
        let (process, _) = fixtures::process_context(&[("1.stor", "dc0", mock.addr)]).await;
        let app = router(Arc::new(process));
        let response = app
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (process, _) = fixtures::process_context(&[]).await;
        let app = router(Arc::new(process));
        crate::metrics::INBOUND_BYTES.inc();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_root_delete_refused() {
        let (process, _) = fixtures::process_context(&[]).await;
        let app = router(Arc::new(process));
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/alice/stor")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["code"], "RootDirectory");
    }

    #[tokio::test]
    async fn test_durability_out_of_range() {
        let mock = crate::testutil::mock_shark::MockShark::spawn().await;
        let (process, _) = fixtures::process_context(&[("1.stor", "dc0", mock.addr)]).await;
        let app = router(Arc::new(process));
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/alice/stor/x")
                    .header("durability-level", "99")
                    .header("content-length", "2")
                    .body(Body::from("hi"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["code"], "InvalidDurabilityLevel");
    }

    #[tokio::test]
    async fn test_get_missing_is_404() {
        let (process, _) = fixtures::process_context(&[]).await;
        let app = router(Arc::new(process));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/alice/stor/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
