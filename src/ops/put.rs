//! PUT Pipeline
//!
//! One client body, `copies` storage nodes, all-or-nothing. The flow:
//! parse durability and size, pick three candidate tuples, open every
//! stream in the first tuple that fully opens, then pump the client body
//! through a CheckStream into all nodes at once. Metadata commits only
//! after every node acknowledged the full payload with a matching MD5.
//!
//! The client body is not polled until every node has sent 100-continue,
//! which is also what delays the server's own interim response to a client
//! that sent `Expect: 100-continue`. Tuple failover is legal exactly while
//! that holds: no client byte has been committed anywhere yet.

use super::{map_upload_error, write_precondition, OrphanRecord, DEFAULT_DURABILITY};
use crate::context::{ProcessContext, ReqCtx};
use crate::error::{MuskieError, MuskieResult};
use crate::meta::envelope::{LoadedPair, MetadataParams};
use crate::meta::{EntryKind, ObjectMetadata, SharkRef};
use crate::metrics;
use crate::shark::UploadHandle;
use crate::stream::{CheckStream, ZERO_BYTE_MD5};
use bytes::Bytes;
use futures::future::join_all;
use futures::{Stream, StreamExt};
use http::HeaderMap;
use uuid::Uuid;

/// What a successful PUT reports back to the HTTP layer
#[derive(Debug)]
pub struct PutOutcome {
    pub object_id: String,
    pub computed_md5: String,
    pub content_length: u64,
    pub mtime: i64,
    pub durability: usize,
    /// Milliseconds from request start to the first body byte, when any
    pub ttfb_ms: Option<f64>,
}

/// Requested durability, from `Durability-Level` / `X-Durability-Level`
pub fn parse_durability(headers: &HeaderMap, max_copies: u32) -> MuskieResult<u32> {
    let raw = headers
        .get("durability-level")
        .or_else(|| headers.get("x-durability-level"));
    let Some(raw) = raw else {
        return Ok(DEFAULT_DURABILITY.min(max_copies));
    };
    raw.to_str()
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .filter(|n| (1..=max_copies).contains(n))
        .ok_or_else(|| {
            MuskieError::InvalidDurabilityLevel(format!(
                "{} (allowed range: 1..={})",
                raw.to_str().unwrap_or("?"),
                max_copies
            ))
        })
}

/// Upload size: the declared Content-Length when present, otherwise the
/// byte budget a chunked request must stay under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeSpec {
    pub declared: Option<u64>,
    pub bound: u64,
}

pub fn parse_size(headers: &HeaderMap, default_bound: u64) -> MuskieResult<SizeSpec> {
    if let Some(raw) = headers.get(http::header::CONTENT_LENGTH) {
        let declared = raw
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| MuskieError::BadRequest("unparseable content-length".to_string()))?;
        return Ok(SizeSpec {
            declared: Some(declared),
            bound: declared,
        });
    }
    if let Some(raw) = headers.get("max-content-length") {
        let bound = raw
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or(MuskieError::MaxContentLength)?;
        return Ok(SizeSpec {
            declared: None,
            bound,
        });
    }
    Ok(SizeSpec {
        declared: None,
        bound: default_bound,
    })
}

/// Store an object. `pair` is the already-guarded load of `key`.
pub async fn put_object<S>(
    process: &ProcessContext,
    req: &ReqCtx,
    key: &str,
    pair: &LoadedPair,
    headers: &HeaderMap,
    conditional: bool,
    body: S,
) -> MuskieResult<PutOutcome>
where
    S: Stream<Item = Result<Bytes, axum::Error>> + Unpin,
{
    let copies = parse_durability(headers, process.config.max_object_copies)?;
    let size = parse_size(headers, process.config.storage.default_max_streaming_size())?;
    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let client_md5 = headers
        .get("content-md5")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let object_id = Uuid::new_v4().to_string();
    let precondition = write_precondition(pair, conditional);

    // Zero-byte objects never touch the storage tier.
    if size.declared == Some(0) {
        let record = build_object(
            process,
            req,
            key,
            headers,
            object_id.clone(),
            0,
            ZERO_BYTE_MD5.to_string(),
            content_type,
            Vec::new(),
        )?;
        let mtime = record.mtime;
        process.envelope.commit(record, precondition).await?;
        return Ok(PutOutcome {
            object_id,
            computed_md5: ZERO_BYTE_MD5.to_string(),
            content_length: 0,
            mtime,
            durability: 0,
            ttfb_ms: None,
        });
    }

    let tuples = process
        .picker
        .choose(size.bound, copies as usize, req.operator)?;

    // Open phase: the first tuple where every node sends 100-continue
    // wins. A partial tuple is fully abandoned before moving on.
    let mut handles: Option<Vec<UploadHandle>> = None;
    for tuple in &tuples {
        let opens = tuple.iter().map(|node| {
            let client = process.sharks.client_for(node);
            let object_id = object_id.clone();
            let content_type = content_type.clone();
            let client_md5 = client_md5.clone();
            let account = req.account.clone();
            let req_id = req.req_id.clone();
            async move {
                client
                    .put(
                        &account,
                        &object_id,
                        &req_id,
                        &content_type,
                        size.declared,
                        client_md5.as_deref(),
                    )
                    .await
            }
        });

        let mut opened = Vec::with_capacity(tuple.len());
        let mut failed = false;
        for result in join_all(opens).await {
            match result {
                Ok(handle) => opened.push(handle),
                Err(err) => {
                    tracing::warn!(
                        storage_id = %err.storage_id(),
                        %err,
                        "shark open failed; trying next placement tuple"
                    );
                    failed = true;
                }
            }
        }
        if failed {
            for handle in opened {
                handle.abandon();
            }
            continue;
        }
        handles = Some(opened);
        break;
    }
    let handles = handles.ok_or(MuskieError::SharksExhausted)?;

    let sharks: Vec<SharkRef> = handles
        .iter()
        .map(|h| SharkRef {
            datacenter: h.datacenter().to_string(),
            storage_id: h.storage_id().to_string(),
        })
        .collect();

    match stream_and_commit(
        process,
        req,
        key,
        headers,
        precondition,
        object_id.clone(),
        content_type,
        client_md5,
        size,
        handles,
        &sharks,
        body,
    )
    .await
    {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            process.orphans.record(OrphanRecord {
                object_id,
                owner: req.account.clone(),
                sharks: sharks.clone(),
            });
            Err(err)
        }
    }
}

/// Pump the body into all nodes, verify MD5 convergence, commit metadata.
#[allow(clippy::too_many_arguments)]
async fn stream_and_commit<S>(
    process: &ProcessContext,
    req: &ReqCtx,
    key: &str,
    headers: &HeaderMap,
    precondition: crate::meta::Precondition,
    object_id: String,
    content_type: String,
    client_md5: Option<String>,
    size: SizeSpec,
    handles: Vec<UploadHandle>,
    sharks: &[SharkRef],
    mut body: S,
) -> MuskieResult<PutOutcome>
where
    S: Stream<Item = Result<Bytes, axum::Error>> + Unpin,
{
    let data_timeout = process.config.data_timeout();
    let mut check = CheckStream::new(size.bound, data_timeout);
    let mut ttfb_ms: Option<f64> = None;

    let pump_result: MuskieResult<()> = loop {
        let chunk = match tokio::time::timeout_at(check.deadline(), body.next()).await {
            Err(_) => {
                check.mark_timed_out();
                break Err(MuskieError::UploadTimeout);
            }
            Ok(None) => break Ok(()),
            Ok(Some(Err(err))) => {
                tracing::info!(%err, "client body failed mid-upload");
                break Err(MuskieError::UploadAbandoned);
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        if ttfb_ms.is_none() {
            ttfb_ms = Some(req.elapsed_ms());
        }
        if let Err(err) = check.write(&chunk) {
            break Err(match err {
                crate::stream::CheckStreamError::LengthExceeded(max) => {
                    MuskieError::MaxSizeExceeded(max)
                }
                crate::stream::CheckStreamError::TimedOut => MuskieError::UploadTimeout,
            });
        }
        metrics::INBOUND_BYTES.inc_by(chunk.len() as u64);

        let sends = handles.iter().map(|h| h.send(chunk.clone()));
        let mut send_err = None;
        for result in join_all(sends).await {
            if let Err(err) = result {
                send_err = Some(map_upload_error(err, client_md5.is_some()));
            }
        }
        if let Some(err) = send_err {
            break Err(err);
        }
    };

    if let Err(err) = pump_result {
        check.abandon();
        for handle in handles {
            handle.abandon();
        }
        return Err(err);
    }

    let (computed_md5, content_length) = check.finish();

    if let Some(client_md5) = &client_md5 {
        if client_md5 != &computed_md5 {
            for handle in handles {
                handle.abandon();
            }
            return Err(MuskieError::Checksum);
        }
    }

    // Close every stream and collect the nodes' own digests.
    let finishes = handles.into_iter().map(|h| h.finish(data_timeout));
    let mut failure = None;
    let mut responses = Vec::new();
    for result in join_all(finishes).await {
        match result {
            Ok(response) => responses.push(response),
            Err(err) => failure = Some(map_upload_error(err, client_md5.is_some())),
        }
    }
    if let Some(err) = failure {
        return Err(err);
    }

    // Every node must agree with the digest computed here. A divergence
    // means some replica holds different bytes than we hashed; that is not
    // retryable, it is a reconciliation problem.
    for (response, shark) in responses.iter().zip(sharks) {
        if let Some(reported) = &response.computed_md5 {
            if reported != &computed_md5 {
                tracing::error!(
                    storage_id = %shark.storage_id,
                    local = %computed_md5,
                    reported = %reported,
                    "md5 divergence between gateway and storage node"
                );
                return Err(MuskieError::Internal("replica digest divergence".to_string()));
            }
        }
    }

    let record = build_object(
        process,
        req,
        key,
        headers,
        object_id.clone(),
        content_length,
        computed_md5.clone(),
        content_type,
        sharks.to_vec(),
    )?;
    let mtime = record.mtime;
    let durability = record.sharks.len();
    process.envelope.commit(record, precondition).await?;

    Ok(PutOutcome {
        object_id,
        computed_md5,
        content_length,
        mtime,
        durability,
        ttfb_ms,
    })
}

/// Directory PUT. Idempotent: re-creating a directory whose client-visible
/// fields already match is a no-op that still reports success.
pub async fn put_directory(
    process: &ProcessContext,
    req: &ReqCtx,
    key: &str,
    pair: &LoadedPair,
    headers: &HeaderMap,
    conditional: bool,
) -> MuskieResult<PutOutcome> {
    let record = process.envelope.build_metadata(MetadataParams {
        key,
        owner: &req.account,
        creator: None,
        kind: EntryKind::Directory,
        object_id: Uuid::new_v4().to_string(),
        content_length: 0,
        content_md5: String::new(),
        content_type: "application/x-json-stream; type=directory".to_string(),
        sharks: Vec::new(),
        incoming_headers: headers,
        requested_roles: req.requested_roles.clone(),
        caller_roles: &req.caller_roles,
        resolver: Some(process.roles.as_ref()),
        single_path: false,
    })?;

    if let Some(existing) = &pair.entry.metadata {
        if crate::meta::envelope::same_directory(existing, &record) {
            return Ok(PutOutcome {
                object_id: existing.object_id.clone(),
                computed_md5: String::new(),
                content_length: 0,
                mtime: existing.mtime,
                durability: 0,
                ttfb_ms: None,
            });
        }
    }

    let precondition = write_precondition(pair, conditional);
    let object_id = record.object_id.clone();
    let mtime = record.mtime;
    process.envelope.commit(record, precondition).await?;
    Ok(PutOutcome {
        object_id,
        computed_md5: String::new(),
        content_length: 0,
        mtime,
        durability: 0,
        ttfb_ms: None,
    })
}

/// Metadata-only update: keep the stored bytes (sharks, digest, length),
/// replace the client-controlled fields.
pub async fn update_metadata(
    process: &ProcessContext,
    req: &ReqCtx,
    key: &str,
    pair: &LoadedPair,
    headers: &HeaderMap,
    conditional: bool,
) -> MuskieResult<PutOutcome> {
    let Some(previous) = &pair.entry.metadata else {
        return Err(MuskieError::ResourceNotFound(key.to_string()));
    };

    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| previous.content_type.clone());

    let mut record = process.envelope.build_metadata(MetadataParams {
        key,
        owner: &previous.owner,
        creator: Some(&previous.creator),
        kind: previous.kind,
        object_id: previous.object_id.clone(),
        content_length: previous.content_length,
        content_md5: previous.content_md5.clone(),
        content_type,
        sharks: previous.sharks.clone(),
        incoming_headers: headers,
        requested_roles: req.requested_roles.clone(),
        caller_roles: &req.caller_roles,
        resolver: Some(process.roles.as_ref()),
        single_path: previous.single_path,
    })?;
    record.content_disposition = record
        .content_disposition
        .or_else(|| previous.content_disposition.clone());

    let precondition = write_precondition(pair, conditional);
    let object_id = record.object_id.clone();
    let mtime = record.mtime;
    let durability = record.sharks.len();
    process.envelope.commit(record, precondition).await?;
    Ok(PutOutcome {
        object_id,
        computed_md5: previous.content_md5.clone(),
        content_length: previous.content_length,
        mtime,
        durability,
        ttfb_ms: None,
    })
}

#[allow(clippy::too_many_arguments)]
fn build_object(
    process: &ProcessContext,
    req: &ReqCtx,
    key: &str,
    headers: &HeaderMap,
    object_id: String,
    content_length: u64,
    content_md5: String,
    content_type: String,
    sharks: Vec<SharkRef>,
) -> MuskieResult<ObjectMetadata> {
    process.envelope.build_metadata(MetadataParams {
        key,
        owner: &req.account,
        creator: None,
        kind: EntryKind::Object,
        object_id,
        content_length,
        content_md5,
        content_type,
        sharks,
        incoming_headers: headers,
        requested_roles: req.requested_roles.clone(),
        caller_roles: &req.caller_roles,
        resolver: Some(process.roles.as_ref()),
        single_path: true,
    })
}
