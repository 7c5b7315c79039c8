//! HTTP/1.1 wire-form serialization and parsing
//!
//! The tunnel moves whole HTTP messages as opaque byte streams, so both ends
//! need a small wire codec: the hub writes requests in *proxy form* (absolute
//! URL in the request line) and incrementally parses the response byte stream
//! the edge sends back; the edge parses the inbound request and re-serializes
//! the upstream response head plus body framing.
//!
//! Body framing follows RFC 9112: `Transfer-Encoding: chunked` wins over
//! `Content-Length`, and a response with neither is delimited by end of
//! stream. When the parser decodes chunked framing itself, the
//! `Transfer-Encoding` header is removed from the surfaced head so callers
//! never double-decode.

use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{Method, Request, StatusCode, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::{Error, Result};

/// Upper bound on the serialized head (request or status line plus headers)
const MAX_HEAD_BYTES: usize = 1024 * 1024;

const MAX_HEADERS: usize = 128;

// =============================================================================
// Request serialization (hub side)
// =============================================================================

/// Serialize a request in proxy wire form.
///
/// The request line carries the absolute URL, the way a client speaks to a
/// forward proxy. The URI must therefore have a scheme and authority.
pub fn write_request_proxy(req: &Request<Bytes>) -> Result<Vec<u8>> {
    let uri = req.uri();
    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(Error::wire(format!(
            "proxy-form serialization requires an absolute URL, got {uri}"
        )));
    }

    let mut out = Vec::with_capacity(256 + req.body().len());
    out.extend_from_slice(req.method().as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(uri.to_string().as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    // Host comes from the header map when the caller set one, otherwise from
    // the URL authority.
    match req.headers().get(HOST) {
        Some(host) => {
            out.extend_from_slice(b"Host: ");
            out.extend_from_slice(host.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        None => {
            out.extend_from_slice(b"Host: ");
            out.extend_from_slice(uri.authority().unwrap().as_str().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    for (name, value) in req.headers() {
        if name == HOST {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    if !req.body().is_empty() && !req.headers().contains_key(CONTENT_LENGTH) {
        out.extend_from_slice(format!("Content-Length: {}\r\n", req.body().len()).as_bytes());
    }

    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(req.body());
    Ok(out)
}

// =============================================================================
// Request parsing (edge side)
// =============================================================================

/// Parse a proxy-form request from a complete byte buffer.
pub fn read_request(raw: &[u8]) -> Result<Request<Bytes>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let head_len = match parsed
        .parse(raw)
        .map_err(|e| Error::wire(format!("malformed request: {e}")))?
    {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => {
            return Err(Error::wire("truncated request head"));
        }
    };

    let method = Method::from_bytes(parsed.method.unwrap_or_default().as_bytes())
        .map_err(|e| Error::wire(format!("bad method: {e}")))?;
    let uri: Uri = parsed
        .path
        .unwrap_or_default()
        .parse()
        .map_err(|e| Error::wire(format!("bad request URL: {e}")))?;
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut builder = Request::builder().method(method).uri(uri).version(version);
    let header_map = builder
        .headers_mut()
        .ok_or_else(|| Error::wire("invalid request head"))?;
    copy_headers(parsed.headers, header_map)?;

    let body = &raw[head_len..];
    let body = match content_length(header_map)? {
        Some(n) if n as usize <= body.len() => Bytes::copy_from_slice(&body[..n as usize]),
        Some(n) => {
            return Err(Error::wire(format!(
                "request body truncated: Content-Length {n}, got {}",
                body.len()
            )));
        }
        None => Bytes::copy_from_slice(body),
    };

    builder
        .body(body)
        .map_err(|e| Error::wire(format!("invalid request: {e}")))
}

// =============================================================================
// Response head
// =============================================================================

/// Parsed status line and headers of a response
#[derive(Clone, Debug)]
pub struct ResponseHead {
    /// Response status code
    pub status: StatusCode,
    /// HTTP protocol version
    pub version: Version,
    /// Response headers
    pub headers: HeaderMap,
}

/// Serialize a response status line and headers, terminated by the blank line.
pub fn write_response_head(head: &ResponseHead) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    let version = match head.version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let reason = head.status.canonical_reason().unwrap_or("");
    out.extend_from_slice(
        format!("{version} {} {reason}\r\n", head.status.as_u16()).as_bytes(),
    );
    for (name, value) in &head.headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Incrementally read a response head from a byte stream.
///
/// Consumes exactly the head (through the blank line), leaving the reader
/// positioned at the first body byte.
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::with_capacity(512);
    loop {
        let before = raw.len();
        let n = reader
            .read_until(b'\n', &mut raw)
            .await
            .map_err(|e| Error::stream(format!("reading response head: {e}")))?;
        if n == 0 {
            return Err(Error::stream("response stream ended before headers"));
        }
        if raw.len() > MAX_HEAD_BYTES {
            return Err(Error::wire("response head exceeds 1 MiB"));
        }
        // A bare CR LF (or LF) line terminates the head.
        let line = &raw[before..];
        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    match parsed
        .parse(&raw)
        .map_err(|e| Error::wire(format!("malformed response: {e}")))?
    {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => {
            return Err(Error::wire("truncated response head"));
        }
    }

    let status = StatusCode::from_u16(parsed.code.unwrap_or(0))
        .map_err(|e| Error::wire(format!("bad status code: {e}")))?;
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut header_map = HeaderMap::with_capacity(parsed.headers.len());
    copy_headers(parsed.headers, &mut header_map)?;

    Ok(ResponseHead {
        status,
        version,
        headers: header_map,
    })
}

// =============================================================================
// Body framing
// =============================================================================

/// How the message body is delimited on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyFraming {
    /// Exactly this many raw bytes follow the head
    Length(u64),
    /// Chunked transfer coding
    Chunked,
    /// Delimited by the end of the stream
    Eof,
}

/// Determine the body framing for a response head, per RFC 9112 §6.
///
/// When the framing is [`BodyFraming::Chunked`] the `Transfer-Encoding`
/// header is removed from the head, since the caller will receive the body
/// already de-framed.
pub fn response_framing(head: &mut ResponseHead) -> Result<BodyFraming> {
    if head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
        || head.status.is_informational()
    {
        return Ok(BodyFraming::Length(0));
    }

    if let Some(te) = head.headers.get(TRANSFER_ENCODING) {
        let te = te
            .to_str()
            .map_err(|_| Error::wire("non-ascii Transfer-Encoding"))?;
        if te
            .split(',')
            .any(|tok| tok.trim().eq_ignore_ascii_case("chunked"))
        {
            head.headers.remove(TRANSFER_ENCODING);
            return Ok(BodyFraming::Chunked);
        }
        return Err(Error::wire(format!("unsupported transfer encoding {te:?}")));
    }

    match content_length(&head.headers)? {
        Some(n) => Ok(BodyFraming::Length(n)),
        None => Ok(BodyFraming::Eof),
    }
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
    match headers.get(CONTENT_LENGTH) {
        Some(v) => {
            let n = v
                .to_str()
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or_else(|| Error::wire(format!("bad Content-Length {v:?}")))?;
            Ok(Some(n))
        }
        None => Ok(None),
    }
}

fn copy_headers(parsed: &[httparse::Header<'_>], out: &mut HeaderMap) -> Result<()> {
    for h in parsed {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| Error::wire(format!("bad header name {:?}: {e}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|e| Error::wire(format!("bad header value for {}: {e}", h.name)))?;
        out.append(name, value);
    }
    Ok(())
}

// =============================================================================
// Body decoding
// =============================================================================

/// Incremental body decoder driving an [`AsyncBufRead`].
///
/// Yields de-framed body chunks until the framing says the body is complete.
pub struct BodyDecoder<R> {
    reader: R,
    state: DecodeState,
}

#[derive(Clone, Copy)]
enum DecodeState {
    Length(u64),
    /// Bytes remaining in the current chunk; `None` means "at a size line"
    Chunked(Option<u64>),
    Eof,
    Done,
}

impl<R: AsyncBufRead + Unpin> BodyDecoder<R> {
    /// Create a decoder for the given framing over a reader positioned at the
    /// first body byte
    pub fn new(reader: R, framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::Length(0) => DecodeState::Done,
            BodyFraming::Length(n) => DecodeState::Length(n),
            BodyFraming::Chunked => DecodeState::Chunked(None),
            BodyFraming::Eof => DecodeState::Eof,
        };
        Self { reader, state }
    }

    /// Read the next de-framed body chunk; `None` when the body is complete.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                DecodeState::Done => return Ok(None),
                DecodeState::Length(remaining) => {
                    let want = remaining.min(crate::EDGE_WRITE_BUFFER as u64) as usize;
                    let data = self.read_up_to(want).await?;
                    if data.is_empty() {
                        return Err(Error::stream(format!(
                            "response body truncated with {remaining} bytes left"
                        )));
                    }
                    let left = remaining - data.len() as u64;
                    self.state = if left == 0 {
                        DecodeState::Done
                    } else {
                        DecodeState::Length(left)
                    };
                    return Ok(Some(data));
                }
                DecodeState::Eof => {
                    let data = self.read_up_to(crate::EDGE_WRITE_BUFFER).await?;
                    if data.is_empty() {
                        self.state = DecodeState::Done;
                        return Ok(None);
                    }
                    return Ok(Some(data));
                }
                DecodeState::Chunked(None) => {
                    let size = self.read_chunk_size().await?;
                    if size == 0 {
                        self.discard_trailers().await?;
                        self.state = DecodeState::Done;
                        return Ok(None);
                    }
                    self.state = DecodeState::Chunked(Some(size));
                }
                DecodeState::Chunked(Some(remaining)) => {
                    let want = remaining.min(crate::EDGE_WRITE_BUFFER as u64) as usize;
                    let data = self.read_up_to(want).await?;
                    if data.is_empty() {
                        return Err(Error::stream("response stream ended mid-chunk"));
                    }
                    let left = remaining - data.len() as u64;
                    if left == 0 {
                        self.read_chunk_terminator().await?;
                        self.state = DecodeState::Chunked(None);
                    } else {
                        self.state = DecodeState::Chunked(Some(left));
                    }
                    return Ok(Some(data));
                }
            }
        }
    }

    async fn read_up_to(&mut self, want: usize) -> Result<Bytes> {
        let mut buf = BytesMut::zeroed(want);
        let n = self
            .reader
            .read(&mut buf)
            .await
            .map_err(|e| Error::stream(format!("reading response body: {e}")))?;
        buf.truncate(n);
        Ok(buf.freeze())
    }

    async fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::with_capacity(16);
        let n = self
            .reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| Error::stream(format!("reading chunk framing: {e}")))?;
        if n == 0 {
            return Err(Error::stream("response stream ended inside chunk framing"));
        }
        while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(line)
    }

    async fn read_chunk_size(&mut self) -> Result<u64> {
        let line = self.read_line().await?;
        // Chunk extensions after ';' are ignored.
        let size_part = line.split(|&b| b == b';').next().unwrap_or(&[]);
        let text = std::str::from_utf8(size_part)
            .map_err(|_| Error::wire("non-ascii chunk size"))?
            .trim();
        u64::from_str_radix(text, 16)
            .map_err(|_| Error::wire(format!("bad chunk size {text:?}")))
    }

    async fn read_chunk_terminator(&mut self) -> Result<()> {
        let line = self.read_line().await?;
        if !line.is_empty() {
            return Err(Error::wire("missing CRLF after chunk data"));
        }
        Ok(())
    }

    async fn discard_trailers(&mut self) -> Result<()> {
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                return Ok(());
            }
        }
    }
}

// =============================================================================
// Chunked encoding (edge side)
// =============================================================================

/// Encode body slices as chunked transfer coding.
pub struct ChunkedEncoder;

impl ChunkedEncoder {
    /// Frame one non-empty body slice
    pub fn encode(data: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(data.len() + 16);
        out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");
        out.freeze()
    }

    /// The terminal zero-length chunk
    pub fn finish() -> Bytes {
        Bytes::from_static(b"0\r\n\r\n")
    }
}
