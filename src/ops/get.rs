//! GET/HEAD Pipeline
//!
//! Reads resolve metadata first; the interesting part is only the object
//! case: walk the replica list in order, stream from the first node that
//! answers, and verify the digest on the way through. Corruption found at
//! end-of-stream can no longer change the status line, so it is logged and
//! the stream ends normally; range requests skip verification since a
//! partial body never hashes to the stored MD5.

use crate::context::{ProcessContext, ReqCtx};
use crate::error::{MuskieError, MuskieResult};
use crate::meta::ObjectMetadata;
use crate::metrics;
use crate::shark::client::GetBody;
use crate::shark::SharkError;
use crate::stream::CheckStream;
use bytes::Bytes;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};

/// What a resolved read turns into
#[derive(Debug)]
pub enum GetReply {
    /// HEAD, or a zero-byte object: headers only
    HeadersOnly { metadata: ObjectMetadata },
    /// Stream the body from a storage node
    Stream {
        metadata: ObjectMetadata,
        /// 200, or 206 for a satisfied range
        status: u16,
        content_length: Option<u64>,
        content_range: Option<String>,
        body: VerifiedBody,
    },
    /// The backend said the range cannot be satisfied
    NotSatisfiable { content_range: Option<String> },
}

/// Multi-range requests are refused outright
pub fn is_multi_range(range: &str) -> bool {
    range.contains(',')
}

/// Resolve an object read against its replicas.
pub async fn get_object(
    process: &ProcessContext,
    req: &ReqCtx,
    metadata: &ObjectMetadata,
    range: Option<&str>,
    head_only: bool,
) -> MuskieResult<GetReply> {
    if let Some(range) = range {
        if is_multi_range(range) {
            return Err(MuskieError::NotImplemented(
                "multi-range requests".to_string(),
            ));
        }
    }

    if head_only || metadata.content_length == 0 {
        return Ok(GetReply::HeadersOnly {
            metadata: metadata.clone(),
        });
    }

    let mut last_err: Option<SharkError> = None;
    for shark in &metadata.sharks {
        let client = process.sharks.client(&shark.storage_id, &shark.datacenter);
        match client
            .get(metadata.shark_owner(), &metadata.object_id, &req.req_id, range)
            .await
        {
            Ok(response) => {
                let content_length = response
                    .headers
                    .get(http::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok());
                let content_range = response
                    .headers
                    .get(http::header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);

                // Only a whole-object read can be checked against the
                // stored digest.
                let expected_md5 = if range.is_none() {
                    Some(metadata.content_md5.clone())
                } else {
                    None
                };

                let idle = process.config.data_timeout();
                return Ok(GetReply::Stream {
                    metadata: metadata.clone(),
                    status: response.status,
                    content_length,
                    content_range,
                    body: VerifiedBody::new(
                        response.body,
                        shark.storage_id.clone(),
                        expected_md5,
                        idle,
                    ),
                });
            }
            Err(SharkError::BackendStatus {
                status: 416,
                headers,
                ..
            }) => {
                let content_range = headers
                    .get(http::header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                return Ok(GetReply::NotSatisfiable { content_range });
            }
            Err(err) => {
                tracing::warn!(
                    storage_id = %shark.storage_id,
                    %err,
                    "replica read failed; trying next"
                );
                last_err = Some(err);
            }
        }
    }

    tracing::error!(
        key = %metadata.key,
        object_id = %metadata.object_id,
        last = last_err.as_ref().map(|e| e.to_string()).unwrap_or_default(),
        "no replica could serve the object"
    );
    Err(MuskieError::ServiceUnavailable(
        "object data is currently unavailable".to_string(),
    ))
}

/// The outbound half of a read: passes chunks through, hashes whole-object
/// reads, enforces the idle deadline, and logs what it finds at the end.
#[derive(Debug)]
pub struct VerifiedBody {
    inner: GetBody,
    check: Option<CheckStream>,
    expected_md5: Option<String>,
    storage_id: String,
    idle: Duration,
    sleep: Pin<Box<Sleep>>,
    done: bool,
}

impl VerifiedBody {
    fn new(
        inner: GetBody,
        storage_id: String,
        expected_md5: Option<String>,
        idle: Duration,
    ) -> Self {
        Self {
            inner,
            check: expected_md5
                .is_some()
                .then(|| CheckStream::verifier(idle)),
            expected_md5,
            storage_id,
            idle,
            sleep: Box::pin(tokio::time::sleep(idle)),
            done: false,
        }
    }
}

impl Stream for VerifiedBody {
    type Item = Result<Bytes, MuskieError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if this.sleep.as_mut().poll(cx).is_ready() {
            this.done = true;
            tracing::warn!(
                storage_id = %this.storage_id,
                "storage node went idle mid-download"
            );
            return Poll::Ready(Some(Err(MuskieError::Internal(
                "storage node went idle mid-download".to_string(),
            ))));
        }

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(check) = this.check.as_mut() {
                    let _ = check.write(&chunk);
                }
                metrics::OUTBOUND_BYTES.inc_by(chunk.len() as u64);
                this.sleep.as_mut().reset(Instant::now() + this.idle);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.done = true;
                tracing::warn!(storage_id = %this.storage_id, %err, "replica stream failed");
                Poll::Ready(Some(Err(MuskieError::Internal(err.to_string()))))
            }
            Poll::Ready(None) => {
                this.done = true;
                if let (Some(check), Some(expected)) =
                    (this.check.take(), this.expected_md5.as_ref())
                {
                    let (computed, bytes) = check.finish();
                    if &computed != expected {
                        // headers are long gone; all that is left is the
                        // corrupted-body record in the log
                        tracing::error!(
                            storage_id = %this.storage_id,
                            status = 469,
                            expected = %expected,
                            computed = %computed,
                            bytes,
                            "object bytes did not match stored content-md5"
                        );
                    }
                }
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for VerifiedBody {
    fn drop(&mut self) {
        if !self.done {
            tracing::info!(
                storage_id = %self.storage_id,
                status = 499,
                "client closed mid-download; aborting replica read"
            );
        }
    }
}
