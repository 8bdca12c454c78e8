//! End-to-end object lifecycle over the HTTP surface, with in-memory
//! metadata and mock storage nodes.

use axum::body::Body;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::{Request, StatusCode};
use muskie::meta::MetadataStore;
use muskie::testutil::fixtures;
use muskie::testutil::mock_shark::MockShark;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap()
        .to_vec()
}

async fn error_code(response: axum::response::Response) -> String {
    let parsed: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    parsed["code"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn test_put_get_delete_round_trip() {
    let east = MockShark::spawn().await;
    let west = MockShark::spawn().await;
    let (process, _orphans) = fixtures::process_context(&[
        ("1.stor.east", "east", east.addr),
        ("1.stor.west", "west", west.addr),
    ])
    .await;
    let process = Arc::new(process);
    let app = muskie::server::router(Arc::clone(&process));

    let payload = b"hi\n";
    let md5 = BASE64.encode(md5::compute(payload).0);

    // PUT
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/alice/stor/hello")
                .header("content-type", "text/plain")
                .header("content-length", payload.len())
                .header("content-md5", md5.clone())
                .body(Body::from(&payload[..]))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers().get("computed-md5").unwrap().to_str().unwrap(),
        md5
    );
    let etag = response
        .headers()
        .get("etag")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(response.headers().contains_key("last-modified"));

    // stored metadata reflects the default durability
    let stored = process
        .envelope
        .store()
        .get("/alice/stor/hello")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.metadata.object_id, etag);
    assert_eq!(stored.metadata.sharks.len(), 2);
    assert_eq!(stored.metadata.content_length, 3);

    // GET
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/alice/stor/hello")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("etag").unwrap().to_str().unwrap(), etag);
    assert_eq!(
        response.headers().get("durability-level").unwrap(),
        "2"
    );
    assert_eq!(response.headers().get("accept-ranges").unwrap(), "bytes");
    assert_eq!(
        response.headers().get("content-md5").unwrap().to_str().unwrap(),
        md5
    );
    assert_eq!(body_bytes(response).await, payload.to_vec());

    // HEAD
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("HEAD")
                .uri("/alice/stor/hello")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-length").unwrap(), "3");
    assert!(body_bytes(response).await.is_empty());

    // conditional GET turns into 304
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/alice/stor/hello")
                .header("if-none-match", etag.clone())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

    // DELETE, then the entry is gone
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/alice/stor/hello")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/alice/stor/hello")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_directory_lifecycle() {
    let east = MockShark::spawn().await;
    let west = MockShark::spawn().await;
    let (process, _orphans) = fixtures::process_context(&[
        ("1.stor.east", "east", east.addr),
        ("1.stor.west", "west", west.addr),
    ])
    .await;
    let app = muskie::server::router(Arc::new(process));

    // mkdir
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/alice/stor/docs")
                .header("content-type", "application/x-json-stream; type=directory")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // idempotent mkdir
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/alice/stor/docs")
                .header("content-type", "application/x-json-stream; type=directory")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // an object inside
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/alice/stor/docs/a.txt")
                .header("content-length", "5")
                .body(Body::from("hello"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // list the directory
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/alice/stor/docs")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/x-json-stream; type=directory"
    );
    assert_eq!(response.headers().get("result-set-size").unwrap(), "1");
    let listing = String::from_utf8(body_bytes(response).await).unwrap();
    let entry: serde_json::Value = serde_json::from_str(listing.lines().next().unwrap()).unwrap();
    assert_eq!(entry["name"], "a.txt");
    assert_eq!(entry["type"], "object");
    assert_eq!(entry["size"], 5);

    // deleting a non-empty directory is refused
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/alice/stor/docs")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DirectoryNotEmpty");

    // empty it, then the delete goes through
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/alice/stor/docs/a.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/alice/stor/docs")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_missing_parent_rejected() {
    let east = MockShark::spawn().await;
    let west = MockShark::spawn().await;
    let (process, _orphans) = fixtures::process_context(&[
        ("1.stor.east", "east", east.addr),
        ("1.stor.west", "west", west.addr),
    ])
    .await;
    let app = muskie::server::router(Arc::new(process));

    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/alice/stor/no-such-dir/x")
                .header("content-length", "2")
                .body(Body::from("hi"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "DirectoryDoesNotExist");
}

#[tokio::test]
async fn test_snaplink_over_http() {
    let east = MockShark::spawn().await;
    let west = MockShark::spawn().await;
    let (process, _orphans) = fixtures::process_context(&[
        ("1.stor.east", "east", east.addr),
        ("1.stor.west", "west", west.addr),
    ])
    .await;
    let process = Arc::new(process);
    let app = muskie::server::router(Arc::clone(&process));

    // source object
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/alice/stor/src")
                .header("content-length", "6")
                .body(Body::from("shared"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // link to it from another account's namespace
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/bob/stor/lnk")
                .header("content-type", "application/json; type=link")
                .header("location", "/alice/stor/src")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // the source lost its single-path mark before the link was written
    let source = process
        .envelope
        .store()
        .get("/alice/stor/src")
        .await
        .unwrap()
        .unwrap();
    assert!(!source.metadata.single_path);

    // reading the link streams the source bytes from the source owner's
    // namespace on the storage nodes
    let response = app
        .oneshot(
            Request::builder()
                .uri("/bob/stor/lnk")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"shared".to_vec());
}

#[tokio::test]
async fn test_root_directory_lists_without_a_record() {
    let east = MockShark::spawn().await;
    let west = MockShark::spawn().await;
    let (process, _orphans) = fixtures::process_context(&[
        ("1.stor.east", "east", east.addr),
        ("1.stor.west", "west", west.addr),
    ])
    .await;
    let app = muskie::server::router(Arc::new(process));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/alice/stor/x")
                .header("content-length", "2")
                .body(Body::from("hi"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // /alice/stor was never created, yet it lists its child
    let response = app
        .oneshot(
            Request::builder()
                .uri("/alice/stor")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("result-set-size").unwrap(), "1");
    let listing = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(listing.contains("\"name\":\"x\""));
}

#[tokio::test]
async fn test_throttle_sheds_over_capacity() {
    let (mut process, _orphans) = fixtures::process_context(&[]).await;
    process.config.throttle = muskie::config::ThrottleConfig {
        enabled: true,
        concurrency: 1,
        queue_tolerance: 1,
        reap_interval_ms: 5_000,
    };
    process.throttle = muskie::throttle::Throttle::new(process.config.throttle.clone());
    let process = Arc::new(process);
    let app = muskie::server::router(Arc::clone(&process));

    // occupy the only slot
    let held = process.throttle.enter("held").await.unwrap();

    // the first request parks in the queue
    let queued = {
        let app = app.clone();
        tokio::spawn(async move {
            app.oneshot(
                Request::builder()
                    .uri("/alice/stor/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the second is shed immediately
    let response = app
        .oneshot(
            Request::builder()
                .uri("/alice/stor/ghost")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_code(response).await, "ThrottledError");

    // freeing the slot lets the queued request run to its real outcome
    drop(held);
    let response = queued.await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
