//! Mock Storage Node
//!
//! A minimal HTTP/1.1 server that behaves like a storage node: it answers
//! PUT with 100-continue before reading the body, stores bytes under
//! `/owner/object_id`, reports the MD5 it computed, and serves GET/HEAD
//! back out. Failure modes are switchable per test: reject checksums,
//! refuse uploads with a fixed status, or go silent instead of sending
//! 100-continue.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Default)]
struct MockState {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    reject_checksums: AtomicBool,
    fail_uploads_with: AtomicU16,
    fail_next_uploads: AtomicUsize,
    hold_continue: AtomicBool,
    connections: AtomicUsize,
}

/// A running mock node
pub struct MockShark {
    pub addr: SocketAddr,
    state: Arc<MockState>,
    _task: JoinHandle<()>,
}

impl MockShark {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock shark");
        let addr = listener.local_addr().expect("mock shark addr");
        let state = Arc::new(MockState::default());
        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let conn_state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = serve_connection(stream, conn_state).await;
                });
            }
        });
        Self {
            addr,
            state,
            _task: task,
        }
    }

    /// Bytes stored for an object, if any
    pub fn stored(&self, owner: &str, object_id: &str) -> Option<Vec<u8>> {
        self.state
            .objects
            .lock()
            .get(&format!("/{owner}/{object_id}"))
            .cloned()
    }

    /// Preload an object for GET/HEAD tests
    pub fn put_object(&self, owner: &str, object_id: &str, bytes: &[u8]) {
        self.state
            .objects
            .lock()
            .insert(format!("/{owner}/{object_id}"), bytes.to_vec());
    }

    /// Respond 469 to every upload
    pub fn reject_checksums(&self, on: bool) {
        self.state.reject_checksums.store(on, Ordering::SeqCst);
    }

    /// Refuse uploads with `status` before sending 100-continue
    pub fn fail_uploads_with(&self, status: u16) {
        self.state.fail_uploads_with.store(status, Ordering::SeqCst);
    }

    /// Refuse only the next `n` uploads with 507, then recover
    pub fn fail_next_uploads(&self, n: usize) {
        self.state.fail_next_uploads.store(n, Ordering::SeqCst);
    }

    /// Never send 100-continue (exercises the connect timeout)
    pub fn hold_continue(&self, on: bool) {
        self.state.hold_continue.store(on, Ordering::SeqCst);
    }

    /// Total TCP connections accepted (keep-alive reuse keeps this at 1)
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

struct ParsedRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
}

async fn serve_connection(mut stream: TcpStream, state: Arc<MockState>) -> std::io::Result<()> {
    let mut leftover: Vec<u8> = Vec::new();
    loop {
        let Some((request, rest)) = read_head(&mut stream, leftover).await? else {
            return Ok(());
        };
        leftover = rest;

        match request.method.as_str() {
            "PUT" => {
                let mut fail = state.fail_uploads_with.load(Ordering::SeqCst);
                if fail == 0
                    && state
                        .fail_next_uploads
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                {
                    fail = 507;
                }
                if fail != 0 {
                    // refuse before 100-continue; drop the conn so the
                    // unread body cannot poison the next request
                    write_response(&mut stream, fail, &[], &[]).await?;
                    return Ok(());
                }
                if state.hold_continue.load(Ordering::SeqCst) {
                    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                    return Ok(());
                }
                stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;

                let body = read_body(&mut stream, &request.headers, &mut leftover).await?;
                if state.reject_checksums.load(Ordering::SeqCst) {
                    write_response(&mut stream, 469, &[], b"checksum mismatch").await?;
                    continue;
                }
                let digest = md5::compute(&body);
                let md5_b64 = BASE64.encode(digest.0);
                state.objects.lock().insert(request.path.clone(), body);
                write_response(
                    &mut stream,
                    201,
                    &[("x-computed-content-md5", md5_b64.as_str())],
                    &[],
                )
                .await?;
            }
            "GET" | "HEAD" => {
                let head_only = request.method == "HEAD";
                let stored = state.objects.lock().get(&request.path).cloned();
                match stored {
                    None => {
                        write_response(&mut stream, 404, &[], b"no such object").await?;
                    }
                    Some(bytes) => match request.headers.get("range") {
                        None => {
                            let body = if head_only { &[] } else { bytes.as_slice() };
                            write_response(&mut stream, 200, &[], body).await?;
                        }
                        Some(range) => match parse_range(range, bytes.len()) {
                            Some((start, end)) => {
                                let slice = &bytes[start..=end];
                                let content_range =
                                    format!("bytes {}-{}/{}", start, end, bytes.len());
                                let body = if head_only { &[] } else { slice };
                                write_response(
                                    &mut stream,
                                    206,
                                    &[("content-range", content_range.as_str())],
                                    body,
                                )
                                .await?;
                            }
                            None => {
                                let content_range = format!("bytes */{}", bytes.len());
                                write_response(
                                    &mut stream,
                                    416,
                                    &[("content-range", content_range.as_str())],
                                    &[],
                                )
                                .await?;
                            }
                        },
                    },
                }
            }
            "POST" => {
                let _ = read_body(&mut stream, &request.headers, &mut leftover).await?;
                write_response(&mut stream, 204, &[], &[]).await?;
            }
            _ => {
                write_response(&mut stream, 405, &[], &[]).await?;
            }
        }
    }
}

/// Read until the blank line, returning the parsed head and any body bytes
/// already pulled off the socket.
async fn read_head(
    stream: &mut TcpStream,
    mut buf: Vec<u8>,
) -> std::io::Result<Option<(ParsedRequest, Vec<u8>)>> {
    loop {
        if let Some(pos) = find_blank_line(&buf) {
            let head = String::from_utf8_lossy(&buf[..pos]).into_owned();
            let rest = buf[pos + 4..].to_vec();
            let Some(request) = parse_head(&head) else {
                return Ok(None);
            };
            return Ok(Some((request, rest)));
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(head: &str) -> Option<ParsedRequest> {
    let mut lines = head.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Some(ParsedRequest {
        method,
        path,
        headers,
    })
}

/// Read a request body, honoring Content-Length or chunked framing.
/// `leftover` holds bytes already read past the previous head and is left
/// holding anything past this body.
async fn read_body(
    stream: &mut TcpStream,
    headers: &HashMap<String, String>,
    leftover: &mut Vec<u8>,
) -> std::io::Result<Vec<u8>> {
    if let Some(len) = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        let mut body = std::mem::take(leftover);
        while body.len() < len {
            let mut chunk = [0u8; 8192];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        *leftover = body.split_off(len.min(body.len()));
        return Ok(body);
    }

    // chunked
    let mut raw = std::mem::take(leftover);
    let mut body = Vec::new();
    let mut offset = 0usize;
    loop {
        // find the size line
        let line_end = loop {
            if let Some(pos) = raw[offset..].windows(2).position(|w| w == b"\r\n") {
                break offset + pos;
            }
            let mut chunk = [0u8; 8192];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(body);
            }
            raw.extend_from_slice(&chunk[..n]);
        };
        let size_line = String::from_utf8_lossy(&raw[offset..line_end]).into_owned();
        let size = usize::from_str_radix(size_line.trim(), 16).unwrap_or(0);
        let chunk_start = line_end + 2;
        let chunk_end = chunk_start + size + 2; // data + CRLF
        while raw.len() < chunk_end {
            let mut chunk = [0u8; 8192];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(body);
            }
            raw.extend_from_slice(&chunk[..n]);
        }
        if size == 0 {
            *leftover = raw.split_off(chunk_end.min(raw.len()));
            return Ok(body);
        }
        body.extend_from_slice(&raw[chunk_start..chunk_start + size]);
        offset = chunk_end;
    }
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    headers: &[(&str, &str)],
    body: &[u8],
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        404 => "Not Found",
        405 => "Method Not Allowed",
        416 => "Range Not Satisfiable",
        469 => "Checksum Mismatch",
        _ => "Error",
    };
    let mut response = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str(&format!("content-length: {}\r\n\r\n", body.len()));
    stream.write_all(response.as_bytes()).await?;
    if !body.is_empty() {
        stream.write_all(body).await?;
    }
    stream.flush().await
}

fn parse_range(raw: &str, len: usize) -> Option<(usize, usize)> {
    let spec = raw.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = if end.is_empty() {
        len.checked_sub(1)?
    } else {
        end.parse().ok()?
    };
    if start > end || start >= len {
        return None;
    }
    Some((start, end.min(len - 1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("bytes=0-4", 10), Some((0, 4)));
        assert_eq!(parse_range("bytes=5-", 10), Some((5, 9)));
        assert_eq!(parse_range("bytes=3-100", 10), Some((3, 9)));
        assert_eq!(parse_range("bytes=10-12", 10), None);
        assert_eq!(parse_range("items=0-4", 10), None);
    }

    #[test]
    fn test_parse_head() {
        let parsed =
            parse_head("PUT /alice/obj HTTP/1.1\r\nContent-Length: 5\r\nExpect: 100-continue")
                .unwrap();
        assert_eq!(parsed.method, "PUT");
        assert_eq!(parsed.path, "/alice/obj");
        assert_eq!(parsed.headers.get("content-length").unwrap(), "5");
    }
}
