//! Per-Node HTTP Client
//!
//! Speaks HTTP/1.1 to one storage node over a small pool of keep-alive
//! connections. Uploads use `Expect: 100-continue` and expose the interim
//! response as a distinct event, so the data plane opens all streams before
//! committing a single client byte anywhere.
//!
//! The connect timeout measures liveness: it runs from request issuance
//! until the node proves it is processing the request (first response for
//! GET/HEAD/POST, the 100-continue or an early response for PUT). Merely
//! having a pooled socket proves nothing; the peer may be long dead.

use super::body::{self, BodySender};
use super::{
    SharkError, SharkResult, CHECKSUM_REJECT_STATUS, COMPUTED_MD5_HEADER, ERROR_BODY_CAP,
};
use crate::config::SharkConfig;
use crate::util::backoff::{self, Backoff};
use bytes::Bytes;
use futures::Stream;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, EXPECT, HOST};
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyDataStream, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

type OutBody = BoxBody<Bytes, Infallible>;
type IdlePool = Arc<Mutex<Vec<SendRequest<OutBody>>>>;

/// Headers plus status from a completed node request
#[derive(Debug)]
pub struct SharkResponse {
    pub status: u16,
    pub headers: HeaderMap,
    /// MD5 the node computed over a received upload, when reported
    pub computed_md5: Option<String>,
}

/// A streaming GET response from a node
#[derive(Debug)]
pub struct SharkGetResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: GetBody,
}

/// HTTP client for one storage node
pub struct SharkClient {
    storage_id: String,
    datacenter: String,
    authority: String,
    config: SharkConfig,
    idle: IdlePool,
}

impl SharkClient {
    pub fn new(
        storage_id: impl Into<String>,
        datacenter: impl Into<String>,
        config: SharkConfig,
    ) -> Self {
        let storage_id = storage_id.into();
        let authority = format!("{}:{}", storage_id, config.port);
        Self {
            storage_id,
            datacenter: datacenter.into(),
            authority,
            config,
            idle: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Client for an explicit address; tests point this at a mock node.
    pub fn with_authority(
        storage_id: impl Into<String>,
        datacenter: impl Into<String>,
        authority: impl Into<String>,
        config: SharkConfig,
    ) -> Self {
        Self {
            storage_id: storage_id.into(),
            datacenter: datacenter.into(),
            authority: authority.into(),
            config,
            idle: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn storage_id(&self) -> &str {
        &self.storage_id
    }

    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    /// Fetch an object's bytes, optionally a single range
    pub async fn get(
        &self,
        owner: &str,
        object_id: &str,
        req_id: &str,
        range: Option<&str>,
    ) -> SharkResult<SharkGetResponse> {
        let mut builder = self
            .request(Method::GET, owner, object_id, req_id)
            .header(http::header::ACCEPT, "*/*");
        if let Some(range) = range {
            builder = builder.header(http::header::RANGE, range);
        }
        let req = builder
            .body(Empty::<Bytes>::new().boxed())
            .map_err(|e| self.internal(e.to_string()))?;

        let mut sender = self.checkout().await?;
        let response = match tokio::time::timeout(
            self.config.connect_timeout(),
            sender.send_request(req),
        )
        .await
        {
            Err(_) => {
                return Err(SharkError::ConnectTimeout {
                    storage_id: self.storage_id.clone(),
                })
            }
            Ok(Err(source)) => {
                return Err(SharkError::Http {
                    storage_id: self.storage_id.clone(),
                    source,
                })
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        if status >= 400 {
            let (text, drained) = read_capped(response.into_body()).await;
            if drained && !sender.is_closed() {
                self.idle.lock().push(sender);
            }
            return Err(self.status_error(status, headers, text));
        }

        Ok(SharkGetResponse {
            status,
            headers,
            body: GetBody {
                storage_id: self.storage_id.clone(),
                inner: BodyDataStream::new(response.into_body()),
                sender: Some(sender),
                pool: Arc::clone(&self.idle),
            },
        })
    }

    /// Fetch an object's headers only
    pub async fn head(
        &self,
        owner: &str,
        object_id: &str,
        req_id: &str,
    ) -> SharkResult<SharkResponse> {
        let req = self
            .request(Method::HEAD, owner, object_id, req_id)
            .body(Empty::<Bytes>::new().boxed())
            .map_err(|e| self.internal(e.to_string()))?;

        let mut sender = self.checkout().await?;
        let response = match tokio::time::timeout(
            self.config.connect_timeout(),
            sender.send_request(req),
        )
        .await
        {
            Err(_) => {
                return Err(SharkError::ConnectTimeout {
                    storage_id: self.storage_id.clone(),
                })
            }
            Ok(Err(source)) => {
                return Err(SharkError::Http {
                    storage_id: self.storage_id.clone(),
                    source,
                })
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        // HEAD responses carry no body; the connection is immediately clean
        if !sender.is_closed() {
            self.idle.lock().push(sender);
        }
        if status >= 400 {
            return Err(self.status_error(status, headers, String::new()));
        }
        Ok(SharkResponse {
            status,
            headers,
            computed_md5: None,
        })
    }

    /// Open an upload. Resolves once the node has sent 100-continue (it is
    /// ready for bytes) or fails with whatever the node said instead. The
    /// returned handle streams chunks and yields the final response.
    pub async fn put(
        &self,
        owner: &str,
        object_id: &str,
        req_id: &str,
        content_type: &str,
        content_length: Option<u64>,
        content_md5: Option<&str>,
    ) -> SharkResult<UploadHandle> {
        let (tx, channel_body) = body::channel(content_length);

        let mut builder = self
            .request(Method::PUT, owner, object_id, req_id)
            .header(EXPECT, "100-continue")
            .header(CONTENT_TYPE, content_type);
        if let Some(len) = content_length {
            builder = builder.header(CONTENT_LENGTH, len);
        }
        if let Some(md5) = content_md5 {
            builder = builder.header("content-md5", md5);
        }
        let mut req = builder
            .body(channel_body.boxed())
            .map_err(|e| self.internal(e.to_string()))?;

        let (continue_tx, mut continue_rx) = watch::channel(false);
        hyper::ext::on_informational(&mut req, move |res| {
            if res.status() == StatusCode::CONTINUE {
                let _ = continue_tx.send(true);
            }
        });

        let mut sender = self.checkout().await?;
        let mut response_task: JoinHandle<(hyper::Result<http::Response<Incoming>>, SendRequest<OutBody>)> =
            tokio::spawn(async move {
                let result = sender.send_request(req).await;
                (result, sender)
            });

        tokio::select! {
            changed = continue_rx.changed() => {
                if changed.is_err() {
                    // The request machinery dropped the callback without a
                    // 100-continue; the final response has the real story.
                    return Err(self.early_response(response_task).await);
                }
            }
            joined = &mut response_task => {
                return Err(self.early_result(joined).await);
            }
            _ = tokio::time::sleep(self.config.connect_timeout()) => {
                response_task.abort();
                return Err(SharkError::ConnectTimeout {
                    storage_id: self.storage_id.clone(),
                });
            }
        }

        Ok(UploadHandle {
            storage_id: self.storage_id.clone(),
            datacenter: self.datacenter.clone(),
            tx,
            response_task,
            pool: Arc::clone(&self.idle),
        })
    }

    /// Notify a node about an operation on an object it stores. Used when a
    /// link is created to an object.
    pub async fn post(
        &self,
        owner: &str,
        object_id: &str,
        req_id: &str,
        payload: serde_json::Value,
    ) -> SharkResult<SharkResponse> {
        let raw = Bytes::from(payload.to_string());
        let req = self
            .request(Method::POST, owner, object_id, req_id)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_LENGTH, raw.len())
            .body(Full::new(raw).boxed())
            .map_err(|e| self.internal(e.to_string()))?;

        let mut sender = self.checkout().await?;
        let response = match tokio::time::timeout(
            self.config.connect_timeout(),
            sender.send_request(req),
        )
        .await
        {
            Err(_) => {
                return Err(SharkError::ConnectTimeout {
                    storage_id: self.storage_id.clone(),
                })
            }
            Ok(Err(source)) => {
                return Err(SharkError::Http {
                    storage_id: self.storage_id.clone(),
                    source,
                })
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let (text, drained) = read_capped(response.into_body()).await;
        if drained && !sender.is_closed() {
            self.idle.lock().push(sender);
        }
        if status >= 400 {
            return Err(self.status_error(status, headers, text));
        }
        Ok(SharkResponse {
            status,
            headers,
            computed_md5: None,
        })
    }

    fn request(
        &self,
        method: Method,
        owner: &str,
        object_id: &str,
        req_id: &str,
    ) -> http::request::Builder {
        Request::builder()
            .method(method)
            .uri(format!("/{}/{}", owner, object_id))
            .header(HOST, &self.authority)
            .header("x-request-id", req_id)
    }

    /// Reuse an idle keep-alive connection or dial a fresh one. Dialing is
    /// the only phase that retries.
    async fn checkout(&self) -> SharkResult<SendRequest<OutBody>> {
        loop {
            let pooled = self.idle.lock().pop();
            match pooled {
                Some(mut sender) => {
                    if sender.is_closed() || sender.ready().await.is_err() {
                        continue;
                    }
                    return Ok(sender);
                }
                None => break,
            }
        }
        self.dial().await
    }

    async fn dial(&self) -> SharkResult<SendRequest<OutBody>> {
        let retry = &self.config.retry;
        let policy = Backoff::for_connect(
            retry.retries,
            Duration::from_millis(retry.min_timeout_ms),
            Duration::from_millis(retry.max_timeout_ms),
        );
        backoff::retry(&policy, |attempt| async move {
            if attempt > 0 {
                tracing::debug!(
                    storage_id = %self.storage_id,
                    attempt,
                    "retrying shark connect"
                );
            }
            let stream = tokio::time::timeout(
                self.config.connect_timeout(),
                TcpStream::connect(&self.authority),
            )
            .await
            .map_err(|_| SharkError::ConnectTimeout {
                storage_id: self.storage_id.clone(),
            })?
            .map_err(|e| SharkError::Connect {
                storage_id: self.storage_id.clone(),
                detail: e.to_string(),
            })?;
            let _ = stream.set_nodelay(true);

            let (sender, conn) = http1::handshake::<_, OutBody>(TokioIo::new(stream))
                .await
                .map_err(|e| SharkError::Connect {
                    storage_id: self.storage_id.clone(),
                    detail: e.to_string(),
                })?;
            let storage_id = self.storage_id.clone();
            tokio::spawn(async move {
                if let Err(err) = conn.await {
                    tracing::debug!(%storage_id, %err, "shark connection ended");
                }
            });
            Ok(sender)
        })
        .await
    }

    /// Resolve an upload that finished before 100-continue
    async fn early_response(
        &self,
        response_task: JoinHandle<(hyper::Result<http::Response<Incoming>>, SendRequest<OutBody>)>,
    ) -> SharkError {
        match tokio::time::timeout(self.config.connect_timeout(), response_task).await {
            Err(_) => SharkError::ConnectTimeout {
                storage_id: self.storage_id.clone(),
            },
            Ok(joined) => self.early_result(joined).await,
        }
    }

    async fn early_result(
        &self,
        joined: Result<
            (hyper::Result<http::Response<Incoming>>, SendRequest<OutBody>),
            tokio::task::JoinError,
        >,
    ) -> SharkError {
        match joined {
            Err(join_err) => SharkError::StreamBroken {
                storage_id: self.storage_id.clone(),
                detail: join_err.to_string(),
            },
            Ok((Err(source), _)) => SharkError::Http {
                storage_id: self.storage_id.clone(),
                source,
            },
            Ok((Ok(response), sender)) => {
                let status = response.status().as_u16();
                let headers = response.headers().clone();
                let (text, drained) = read_capped(response.into_body()).await;
                if drained && !sender.is_closed() {
                    self.idle.lock().push(sender);
                }
                self.status_error(status, headers, text)
            }
        }
    }

    fn status_error(&self, status: u16, headers: HeaderMap, body: String) -> SharkError {
        if status == CHECKSUM_REJECT_STATUS {
            SharkError::ChecksumRejected {
                storage_id: self.storage_id.clone(),
            }
        } else {
            SharkError::BackendStatus {
                storage_id: self.storage_id.clone(),
                status,
                headers,
                body,
            }
        }
    }

    fn internal(&self, detail: String) -> SharkError {
        SharkError::Connect {
            storage_id: self.storage_id.clone(),
            detail,
        }
    }
}

/// An open upload stream to one node
#[derive(Debug)]
pub struct UploadHandle {
    storage_id: String,
    datacenter: String,
    tx: BodySender,
    response_task: JoinHandle<(hyper::Result<http::Response<Incoming>>, SendRequest<OutBody>)>,
    pool: IdlePool,
}

impl UploadHandle {
    pub fn storage_id(&self) -> &str {
        &self.storage_id
    }

    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    /// Stream one chunk. Backpressures until this node has taken it.
    pub async fn send(&self, chunk: Bytes) -> SharkResult<()> {
        self.tx.send(chunk).await.map_err(|_| SharkError::StreamBroken {
            storage_id: self.storage_id.clone(),
            detail: "connection dropped the request body".to_string(),
        })
    }

    /// Signal end of body and collect the node's final response.
    pub async fn finish(self, response_timeout: Duration) -> SharkResult<SharkResponse> {
        let UploadHandle {
            storage_id,
            tx,
            mut response_task,
            pool,
            ..
        } = self;
        drop(tx);

        let joined = match tokio::time::timeout(response_timeout, &mut response_task).await {
            Err(_) => {
                response_task.abort();
                return Err(SharkError::IdleTimeout { storage_id });
            }
            Ok(joined) => joined,
        };

        match joined {
            Err(join_err) => Err(SharkError::StreamBroken {
                storage_id,
                detail: join_err.to_string(),
            }),
            Ok((Err(source), _)) => Err(SharkError::Http { storage_id, source }),
            Ok((Ok(response), sender)) => {
                let status = response.status().as_u16();
                let headers = response.headers().clone();
                let computed_md5 = headers
                    .get(COMPUTED_MD5_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let (text, drained) = read_capped(response.into_body()).await;
                if drained && !sender.is_closed() {
                    pool.lock().push(sender);
                }
                if status == CHECKSUM_REJECT_STATUS {
                    return Err(SharkError::ChecksumRejected { storage_id });
                }
                if status >= 400 {
                    return Err(SharkError::BackendStatus {
                        storage_id,
                        status,
                        headers,
                        body: text,
                    });
                }
                Ok(SharkResponse {
                    status,
                    headers,
                    computed_md5,
                })
            }
        }
    }

    /// Abort the upload: close the body and stop waiting for the node.
    /// Whatever bytes the node already has are orphaned.
    pub fn abandon(self) {
        self.response_task.abort();
    }
}

/// Streaming GET body. On clean end-of-stream the connection returns to
/// the idle pool; any error discards it.
#[derive(Debug)]
pub struct GetBody {
    storage_id: String,
    inner: BodyDataStream<Incoming>,
    sender: Option<SendRequest<OutBody>>,
    pool: IdlePool,
}

impl Stream for GetBody {
    type Item = SharkResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(source))) => {
                this.sender = None;
                Poll::Ready(Some(Err(SharkError::Http {
                    storage_id: this.storage_id.clone(),
                    source,
                })))
            }
            Poll::Ready(None) => {
                if let Some(sender) = this.sender.take() {
                    if !sender.is_closed() {
                        this.pool.lock().push(sender);
                    }
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Read a response body, keeping at most `ERROR_BODY_CAP` bytes. Returns
/// the text and whether the body was fully consumed (a partially read
/// connection cannot be reused).
async fn read_capped(mut body: Incoming) -> (String, bool) {
    let mut collected: Vec<u8> = Vec::new();
    loop {
        match body.frame().await {
            None => break,
            Some(Err(_)) => return (String::from_utf8_lossy(&collected).into_owned(), false),
            Some(Ok(frame)) => {
                // past the cap we keep draining so the conn stays reusable
                if let Some(data) = frame.data_ref() {
                    if collected.len() < ERROR_BODY_CAP {
                        let take = (ERROR_BODY_CAP - collected.len()).min(data.len());
                        collected.extend_from_slice(&data[..take]);
                    }
                }
            }
        }
    }
    (String::from_utf8_lossy(&collected).into_owned(), true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SharkConfig, SharkRetryConfig};
    use crate::testutil::mock_shark::MockShark;

    fn test_config() -> SharkConfig {
        SharkConfig {
            port: 0,
            connect_timeout_ms: 500,
            retry: SharkRetryConfig {
                retries: 1,
                min_timeout_ms: 10,
                max_timeout_ms: 50,
            },
        }
    }

    fn client_for(mock: &MockShark) -> SharkClient {
        SharkClient::with_authority("1.stor.test", "dc0", mock.addr.to_string(), test_config())
    }

    #[tokio::test]
    async fn test_put_roundtrip() {
        let mock = MockShark::spawn().await;
        let client = client_for(&mock);

        let handle = client
            .put("alice", "obj-1", "req-1", "application/octet-stream", Some(5), None)
            .await
            .unwrap();
        handle.send(Bytes::from_static(b"hel")).await.unwrap();
        handle.send(Bytes::from_static(b"lo")).await.unwrap();
        let response = handle.finish(Duration::from_secs(2)).await.unwrap();

        assert_eq!(response.status, 201);
        let expect = {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode(md5::compute(b"hello").0)
        };
        assert_eq!(response.computed_md5.unwrap(), expect);
        assert_eq!(mock.stored("alice", "obj-1").unwrap(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_put_then_get_reuses_connection() {
        let mock = MockShark::spawn().await;
        let client = client_for(&mock);

        let handle = client
            .put("alice", "obj-2", "req-2", "text/plain", Some(2), None)
            .await
            .unwrap();
        handle.send(Bytes::from_static(b"hi")).await.unwrap();
        handle.finish(Duration::from_secs(2)).await.unwrap();

        let response = client.get("alice", "obj-2", "req-3", None).await.unwrap();
        assert_eq!(response.status, 200);
        let bytes = futures::StreamExt::collect::<Vec<_>>(response.body).await;
        let all: Vec<u8> = bytes
            .into_iter()
            .flat_map(|b| b.unwrap().to_vec())
            .collect();
        assert_eq!(all, b"hi".to_vec());
        assert_eq!(mock.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_head_reports_status_only() {
        let mock = MockShark::spawn().await;
        mock.put_object("alice", "obj-head", b"abcdef");
        let client = client_for(&mock);

        let response = client.head("alice", "obj-head", "req-h").await.unwrap();
        assert_eq!(response.status, 200);
        assert!(response.computed_md5.is_none());

        let err = client.head("alice", "missing", "req-h2").await.unwrap_err();
        assert!(matches!(err, SharkError::BackendStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_get_missing_is_backend_status() {
        let mock = MockShark::spawn().await;
        let client = client_for(&mock);
        let err = client.get("alice", "nope", "req-4", None).await.unwrap_err();
        match err {
            SharkError::BackendStatus { status, .. } => assert_eq!(status, 404),
            other => panic!("expected BackendStatus, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_checksum_rejection() {
        let mock = MockShark::spawn().await;
        mock.reject_checksums(true);
        let client = client_for(&mock);

        let handle = client
            .put("alice", "obj-3", "req-5", "text/plain", Some(2), Some("bogus=="))
            .await
            .unwrap();
        handle.send(Bytes::from_static(b"hi")).await.unwrap();
        let err = handle.finish(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, SharkError::ChecksumRejected { .. }));
    }

    #[tokio::test]
    async fn test_put_rejected_before_continue() {
        let mock = MockShark::spawn().await;
        mock.fail_uploads_with(507);
        let client = client_for(&mock);

        let err = client
            .put("alice", "obj-4", "req-6", "text/plain", Some(2), None)
            .await
            .unwrap_err();
        match err {
            SharkError::BackendStatus { status, .. } => assert_eq!(status, 507),
            other => panic!("expected BackendStatus, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_timeout_on_silent_peer() {
        let mock = MockShark::spawn().await;
        mock.hold_continue(true);
        let client = client_for(&mock);

        let err = client
            .put("alice", "obj-5", "req-7", "text/plain", Some(2), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SharkError::ConnectTimeout { .. }));
    }

    #[tokio::test]
    async fn test_dial_failure_is_connect_error() {
        // nothing listens on this port
        let client = SharkClient::with_authority(
            "1.stor.test",
            "dc0",
            "127.0.0.1:1".to_string(),
            test_config(),
        );
        let err = client.get("alice", "obj", "req-8", None).await.unwrap_err();
        assert!(err.is_connect_failure());
    }
}
