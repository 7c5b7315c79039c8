//! Edge-side responder
//!
//! The edge agent subscribes to its link's handler subject, reconstructs each
//! inbound HTTP request, performs it against the local upstream (normally the
//! cluster's API server) with the TLS material the hub supplied, and streams
//! the raw response bytes back to the per-call reply subject. The final bus
//! message of every stream carries the `Done` header: empty on success, the
//! error text on failure.
//!
//! A second subscription answers `PING` with `PONG`; the hub's link service
//! uses it to prove an agent is alive before accepting a callback.
//!
//! Subscriptions join a queue group derived from the agent's deployment
//! identity, so replicas share the load and each request is delivered to
//! exactly one of them. One subscription processes its messages sequentially;
//! the agent installs several subscription instances to serve concurrent
//! requests.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use async_nats::{Client, HeaderMap, Subject};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{Request, StatusCode, Uri, Version};
use tracing::{debug, error, warn};

use crate::http_wire::{write_response_head, ChunkedEncoder, ResponseHead};
use crate::wire::{Envelope, PersistableTlsConfig, DONE_HEADER, PING, PONG};
use crate::{
    Error, Result, DEFAULT_CALL_TIMEOUT, EDGE_WRITE_BUFFER, UPSTREAM_DIAL_TIMEOUT,
    UPSTREAM_IDLE_CONNS_PER_HOST,
};

/// Fallback queue group when the agent runs outside an orchestrator
const DEFAULT_QUEUE_GROUP: &str = "tether";

/// Install one request subscription and one liveness subscription for the
/// link, both in the given queue group.
///
/// Each subscription is driven by its own task and handles messages
/// sequentially; call this several times to serve concurrent requests.
pub async fn subscribe(
    nc: &Client,
    names: &crate::subjects::SubjectNames,
    queue_group: &str,
) -> Result<()> {
    let (_, handler_subject) = names.proxy_handler_subjects();
    let mut requests = nc
        .queue_subscribe(handler_subject.clone(), queue_group.to_string())
        .await
        .map_err(|e| Error::subscribe(format!("{handler_subject}: {e}")))?;

    let (_, status_subject) = names.proxy_status_subjects();
    let mut pings = nc
        .queue_subscribe(status_subject.clone(), queue_group.to_string())
        .await
        .map_err(|e| Error::subscribe(format!("{status_subject}: {e}")))?;

    let client = nc.clone();
    tokio::spawn(async move {
        while let Some(msg) = requests.next().await {
            let Some(reply) = msg.reply.clone() else {
                warn!(subject = %msg.subject, "dropping proxied request without reply subject");
                continue;
            };
            handle_request(&client, reply, &msg.payload).await;
        }
    });

    let client = nc.clone();
    tokio::spawn(async move {
        while let Some(msg) = pings.next().await {
            let Some(reply) = msg.reply else {
                continue;
            };
            if msg.payload.as_ref() == PING {
                if let Err(e) = client.publish(reply, Bytes::from_static(PONG)).await {
                    warn!(error = %e, "failed to answer liveness ping");
                }
            }
        }
    });

    Ok(())
}

/// Queue group for this agent's subscriptions.
///
/// Inside an orchestrator the group is `<namespace>.<controller>` so all
/// replicas of one deployment share it; standalone agents fall back to a
/// fixed name.
pub fn queue_group() -> String {
    derive_queue_group(
        std::env::var("POD_NAMESPACE").ok().as_deref(),
        std::env::var("POD_NAME").ok().as_deref(),
    )
}

fn derive_queue_group(pod_namespace: Option<&str>, pod_name: Option<&str>) -> String {
    match (pod_namespace, pod_name) {
        (Some(ns), Some(pod)) if !ns.is_empty() && !pod.is_empty() => {
            // Strip the replica hash so every pod of the controller lands in
            // the same group.
            let controller = match pod.rfind('-') {
                Some(idx) => &pod[..idx],
                None => pod,
            };
            format!("{ns}.{controller}")
        }
        _ => DEFAULT_QUEUE_GROUP.to_string(),
    }
}

// =============================================================================
// Request handling
// =============================================================================

async fn handle_request(nc: &Client, reply: Subject, payload: &[u8]) {
    let mut writer = BusResponseWriter::new(nc, reply);

    match respond(payload).await {
        Ok(upstream) => {
            if let Err(e) = stream_upstream(upstream, &mut writer).await {
                error!(error = %e, "failed streaming upstream response");
                let _ = writer.finish(Some(e.to_string())).await;
            }
        }
        Err(synth) => {
            debug!(status = synth.status.as_u16(), "answering with synthesized response");
            if let Err(e) = stream_synthesized(synth, &mut writer).await {
                error!(error = %e, "failed streaming synthesized response");
                let _ = writer.finish(Some(e.to_string())).await;
            }
        }
    }
}

/// Decode the envelope and perform the upstream call.
///
/// Any failure short of streaming comes back as a [`SynthesizedResponse`] so
/// the hub still observes a well-formed HTTP response.
async fn respond(payload: &[u8]) -> std::result::Result<reqwest::Response, SynthesizedResponse> {
    let envelope: Envelope = match serde_json::from_slice(payload) {
        Ok(env) => env,
        Err(e) => {
            return Err(SynthesizedResponse::new(
                StatusCode::BAD_REQUEST,
                Version::HTTP_11,
                format!("failed to decode proxy envelope: {e}"),
            ));
        }
    };

    let request = match crate::http_wire::read_request(&envelope.request) {
        Ok(req) => req,
        Err(e) => {
            return Err(SynthesizedResponse::new(
                StatusCode::BAD_REQUEST,
                Version::HTTP_11,
                format!("failed to parse proxied request: {e}"),
            ));
        }
    };
    let version = request.version();

    match execute_upstream(envelope, request).await {
        Ok(resp) => Ok(resp),
        Err(e) => Err(SynthesizedResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            version,
            e.to_string(),
        )),
    }
}

async fn execute_upstream(
    envelope: Envelope,
    mut request: Request<Bytes>,
) -> Result<reqwest::Response> {
    let timeout = envelope.timeout().unwrap_or(DEFAULT_CALL_TIMEOUT);
    let mut builder = reqwest::Client::builder()
        .connect_timeout(UPSTREAM_DIAL_TIMEOUT)
        .tcp_keepalive(UPSTREAM_DIAL_TIMEOUT)
        .pool_max_idle_per_host(UPSTREAM_IDLE_CONNS_PER_HOST)
        .timeout(timeout);

    if let Some(ref tls) = envelope.tls {
        tls.validate()?;
        builder = apply_tls(builder, tls)?;

        if !tls.server_name.is_empty() {
            if let Some((uri, pinned)) = rewrite_for_server_name(request.uri(), &tls.server_name) {
                builder = builder.resolve(&tls.server_name, pinned);
                *request.uri_mut() = uri;
            }
        }
    }

    let client = builder
        .build()
        .map_err(|e| Error::tls(format!("building upstream client: {e}")))?;

    let request = reqwest::Request::try_from(request)
        .map_err(|e| Error::wire(format!("converting proxied request: {e}")))?;

    client
        .execute(request)
        .await
        .map_err(|e| Error::transport(format!("upstream request failed: {e}")))
}

fn apply_tls(
    mut builder: reqwest::ClientBuilder,
    tls: &PersistableTlsConfig,
) -> Result<reqwest::ClientBuilder> {
    if tls.has_ca() {
        let certs = reqwest::Certificate::from_pem_bundle(&tls.ca_data)
            .map_err(|e| Error::tls(format!("parsing CA bundle: {e}")))?;
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
    }

    if tls.has_cert_auth() {
        let mut pem = tls.cert_data.clone();
        pem.extend_from_slice(b"\n");
        pem.extend_from_slice(&tls.key_data);
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| Error::tls(format!("parsing client identity: {e}")))?;
        builder = builder.identity(identity);
    }

    if tls.insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }

    if tls.next_protos.first().map(String::as_str) == Some("http/1.1") {
        builder = builder.http1_only();
    }

    Ok(builder)
}

/// SNI / verification-name override for upstreams dialed by IP.
///
/// A kubeconfig frequently points at the API server by IP while its
/// certificate only names `kubernetes.default`; the override only applies
/// when the request host is an IP literal, since a DNS host would need
/// re-resolution.
fn rewrite_for_server_name(uri: &Uri, server_name: &str) -> Option<(Uri, SocketAddr)> {
    let host = uri.host()?;
    let ip = IpAddr::from_str(host.trim_start_matches('[').trim_end_matches(']')).ok()?;
    let port = uri.port_u16().or(match uri.scheme_str() {
        Some("https") => Some(443),
        Some("http") => Some(80),
        _ => None,
    })?;

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let rewritten = Uri::builder()
        .scheme(uri.scheme_str().unwrap_or("https"))
        .authority(format!("{server_name}:{port}"))
        .path_and_query(path_and_query)
        .build()
        .ok()?;

    Some((rewritten, SocketAddr::new(ip, port)))
}

// =============================================================================
// Response streaming
// =============================================================================

/// A locally fabricated response, used when the envelope cannot be decoded or
/// the upstream call fails outright. The hub sees it as a normal HTTP
/// response; the stream still ends with an empty `Done`.
struct SynthesizedResponse {
    status: StatusCode,
    version: Version,
    message: String,
}

impl SynthesizedResponse {
    fn new(status: StatusCode, version: Version, message: String) -> Self {
        Self {
            status,
            version,
            message,
        }
    }
}

async fn stream_synthesized(
    synth: SynthesizedResponse,
    writer: &mut BusResponseWriter<'_>,
) -> Result<()> {
    let body = serde_json::to_vec(&serde_json::json!({ "message": synth.message }))?;

    let mut head = ResponseHead {
        status: synth.status,
        version: synth.version,
        headers: http::HeaderMap::new(),
    };
    head.headers
        .insert(CONTENT_TYPE, "application/json".parse().expect("static header"));
    head.headers.insert(
        CONTENT_LENGTH,
        body.len().to_string().parse().expect("numeric header"),
    );

    writer.write(&write_response_head(&head)).await?;
    writer.write(&body).await?;
    writer.finish(None).await
}

async fn stream_upstream(
    upstream: reqwest::Response,
    writer: &mut BusResponseWriter<'_>,
) -> Result<()> {
    let mut head = ResponseHead {
        status: upstream.status(),
        version: upstream.version(),
        headers: upstream.headers().clone(),
    };

    // The body is re-framed below, so the upstream's own framing headers
    // must not survive into the serialized head.
    head.headers.remove(TRANSFER_ENCODING);
    head.headers.remove(CONTENT_LENGTH);

    let chunked = match upstream.content_length() {
        Some(len) => {
            head.headers.insert(
                CONTENT_LENGTH,
                len.to_string().parse().expect("numeric header"),
            );
            false
        }
        None => {
            head.headers
                .insert(TRANSFER_ENCODING, "chunked".parse().expect("static header"));
            true
        }
    };

    writer.write(&write_response_head(&head)).await?;

    let mut body = upstream.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| Error::stream(format!("reading upstream body: {e}")))?;
        if chunk.is_empty() {
            continue;
        }
        if chunked {
            writer.write(&ChunkedEncoder::encode(&chunk)).await?;
        } else {
            writer.write(&chunk).await?;
        }
    }
    if chunked {
        writer.write(&ChunkedEncoder::finish()).await?;
    }

    writer.finish(None).await
}

/// Buffered writer that publishes response bytes as bus messages.
///
/// Data is flushed in slices of at most [`EDGE_WRITE_BUFFER`] bytes. The
/// buffer is reused across flushes; the terminal message is always
/// zero-length and carries the `Done` header.
struct BusResponseWriter<'a> {
    nc: &'a Client,
    subject: Subject,
    buf: BytesMut,
    finished: bool,
}

impl<'a> BusResponseWriter<'a> {
    fn new(nc: &'a Client, subject: Subject) -> Self {
        Self {
            nc,
            subject,
            buf: BytesMut::with_capacity(EDGE_WRITE_BUFFER),
            finished: false,
        }
    }

    async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let room = EDGE_WRITE_BUFFER - self.buf.len();
            let take = room.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == EDGE_WRITE_BUFFER {
                self.flush().await?;
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let payload = self.buf.split().freeze();
        self.nc
            .publish(self.subject.clone(), payload)
            .await
            .map_err(|e| Error::publish(format!("{}: {e}", self.subject)))
    }

    async fn finish(&mut self, error: Option<String>) -> Result<()> {
        // A stream carries at most one Done marker, even if an earlier
        // finish attempt failed partway.
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        self.flush().await?;

        let mut headers = HeaderMap::new();
        headers.insert(DONE_HEADER, error.unwrap_or_default().as_str());
        self.nc
            .publish_with_headers(self.subject.clone(), headers, Bytes::new())
            .await
            .map_err(|e| Error::publish(format!("{}: {e}", self.subject)))?;
        self.nc
            .flush()
            .await
            .map_err(|e| Error::publish(format!("flush: {e}")))
    }
}
