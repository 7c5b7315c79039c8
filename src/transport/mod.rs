//! Hub-side HTTP round-tripper over the bus
//!
//! [`BusTransport`] adapts the standard HTTP request/response contract to the
//! bus: a request is serialized whole into an [`Envelope`](crate::wire::Envelope)
//! and published on the link's handler subject; the response comes back as an
//! ordered stream of chunk messages on a per-call response subject, ending
//! with the `Done` marker. The caller gets a live [`http::Response`] whose
//! body yields bytes as chunks arrive, so multi-gigabyte log follows and
//! watch streams never buffer in memory.
//!
//! The transport implements [`tower::Service`], which is how it plugs into
//! `kube::Client` for proxied Kubernetes access.

mod cache;

pub use cache::{transport_for, IdentityProvider, TlsCacheKey, TlsSource, TransportConfig};

use std::io;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_nats::Client;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::StreamExt;
use http::{Request, Response};
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::{debug, trace};

use crate::http_wire::{self, BodyDecoder};
use crate::subjects::SubjectNames;
use crate::wire::{Envelope, PersistableTlsConfig, DONE_HEADER};
use crate::{Error, Result, DEFAULT_CALL_TIMEOUT, EDGE_TIMEOUT_SLACK};

/// Streaming response body fed by the chunk decoder
pub type ProxyBody = StreamBody<ReceiverStream<std::result::Result<Frame<Bytes>, io::Error>>>;

/// Per-request deadline, carried in the request extensions.
///
/// The effective round-trip timeout is the minimum of the transport's
/// configured timeout and the remaining time until this deadline.
#[derive(Clone, Copy, Debug)]
pub struct CallDeadline(
    /// The absolute instant after which the caller no longer wants an answer
    pub Instant,
);

/// HTTP round-tripper that carries requests over the bus to one link's edge
/// agent.
///
/// Cloning is cheap and clones share the same identity for caching purposes.
#[derive(Clone)]
pub struct BusTransport {
    inner: Arc<Inner>,
}

struct Inner {
    nc: Client,
    names: SubjectNames,
    timeout: Duration,
    tls: Option<PersistableTlsConfig>,
    disable_compression: bool,
}

impl BusTransport {
    /// Create a transport bound to a link.
    ///
    /// Prefer [`transport_for`], which shares instances across callers with
    /// equal configurations.
    pub fn new(
        nc: Client,
        names: SubjectNames,
        timeout: Duration,
        tls: Option<PersistableTlsConfig>,
        disable_compression: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                nc,
                names,
                timeout,
                tls,
                disable_compression,
            }),
        }
    }

    /// The link this transport proxies to
    pub fn names(&self) -> &SubjectNames {
        &self.inner.names
    }

    /// Whether two handles share one cached transport instance
    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Perform one HTTP round trip through the bus.
    ///
    /// Returns as soon as the response head has been reassembled; the body
    /// streams through the returned response as the edge publishes chunks.
    pub async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<ProxyBody>> {
        let timeout = self.effective_timeout(&req);

        let mut envelope = Envelope {
            request: http_wire::write_request_proxy(&req)?,
            tls: self.inner.tls.clone(),
            timeout_ns: 0,
            disable_compression: self.inner.disable_compression,
        };
        envelope.set_timeout(timeout.saturating_sub(EDGE_TIMEOUT_SLACK));
        let payload = serde_json::to_vec(&envelope)?;

        // Subscribe to the response subject before publishing, so the first
        // chunk cannot race the subscription.
        let (hub_resp, edge_reply) = self.inner.names.proxy_response_subjects();
        let sub = self
            .inner
            .nc
            .subscribe(hub_resp.clone())
            .await
            .map_err(|e| Error::subscribe(format!("{hub_resp}: {e}")))?;

        let (handler_subject, _) = self.inner.names.proxy_handler_subjects();
        self.inner
            .nc
            .publish_with_reply(handler_subject.clone(), edge_reply, payload.into())
            .await
            .map_err(|e| Error::publish(format!("{handler_subject}: {e}")))?;
        self.inner
            .nc
            .flush()
            .await
            .map_err(|e| Error::publish(format!("flush: {e}")))?;

        trace!(
            link_id = %self.inner.names.link_id(),
            method = %req.method(),
            uri = %req.uri(),
            timeout_secs = timeout.as_secs(),
            "published proxied request"
        );

        let raw_rx = drain_chunks(sub, timeout);
        let mut reader = BufReader::new(StreamReader::new(ReceiverStream::new(raw_rx)));

        let mut head = tokio::time::timeout(timeout, http_wire::read_response_head(&mut reader))
            .await
            .map_err(|_| Error::transport("timed out waiting for response headers"))??;
        let framing = http_wire::response_framing(&mut head)?;

        debug!(
            link_id = %self.inner.names.link_id(),
            status = head.status.as_u16(),
            ?framing,
            "proxied response headers received"
        );

        let (frame_tx, frame_rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut decoder = BodyDecoder::new(reader, framing);
            loop {
                match decoder.next_chunk().await {
                    Ok(Some(chunk)) => {
                        if frame_tx.send(Ok(Frame::data(chunk))).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = frame_tx.send(Err(e.into())).await;
                        break;
                    }
                }
            }
        });

        let mut resp = Response::new(StreamBody::new(ReceiverStream::new(frame_rx)));
        *resp.status_mut() = head.status;
        *resp.version_mut() = head.version;
        *resp.headers_mut() = head.headers;
        Ok(resp)
    }

    fn effective_timeout<B>(&self, req: &Request<B>) -> Duration {
        let deadline = req.extensions().get::<CallDeadline>().map(|d| d.0);
        effective_timeout(self.inner.timeout, deadline, Instant::now())
    }
}

/// Effective round-trip timeout: the minimum of the configured timeout and
/// the remaining time until the request deadline, defaulting when neither is
/// set.
fn effective_timeout(configured: Duration, deadline: Option<Instant>, now: Instant) -> Duration {
    let mut timeout = (configured > Duration::ZERO).then_some(configured);
    if let Some(at) = deadline {
        let remaining = at.saturating_duration_since(now);
        timeout = Some(timeout.map_or(remaining, |t| t.min(remaining)));
    }
    timeout.unwrap_or(DEFAULT_CALL_TIMEOUT)
}

/// Drain chunk messages from the response subscription into a byte stream.
///
/// The task ends when the `Done` marker arrives, the subscription closes, or
/// the reading side is dropped. Gaps longer than `gap` between chunks are
/// treated as benign keep-alives: long-running responses (log follows, watch
/// streams) legitimately go quiet.
fn drain_chunks(
    mut sub: async_nats::Subscriber,
    gap: Duration,
) -> mpsc::Receiver<io::Result<Bytes>> {
    let (raw_tx, raw_rx) = mpsc::channel::<io::Result<Bytes>>(64);

    tokio::spawn(async move {
        loop {
            let msg = match tokio::time::timeout(gap, sub.next()).await {
                Err(_) => {
                    if raw_tx.is_closed() {
                        break;
                    }
                    continue;
                }
                Ok(None) => {
                    let _ = raw_tx
                        .send(Err(io::Error::other("response subject closed")))
                        .await;
                    break;
                }
                Ok(Some(msg)) => msg,
            };

            if !msg.payload.is_empty() && raw_tx.send(Ok(msg.payload)).await.is_err() {
                break;
            }

            if let Some(done) = msg.headers.as_ref().and_then(|h| h.get(DONE_HEADER)) {
                let done = done.as_str();
                if !done.is_empty() {
                    let _ = raw_tx.send(Err(io::Error::other(done.to_string()))).await;
                }
                break;
            }
        }
        let _ = sub.unsubscribe().await;
    });

    raw_rx
}

// =============================================================================
// tower::Service adapter
// =============================================================================
// `kube::Client::new` accepts any tower service over HTTP parts, which is how
// callers get a fully featured Kubernetes client whose every request rides
// the bus.

impl tower::Service<Request<kube::client::Body>> for BusTransport {
    type Response = Response<ProxyBody>;
    type Error = tower::BoxError;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<kube::client::Body>) -> Self::Future {
        let transport = self.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let bytes = body
                .collect()
                .await
                .map_err(|e| tower::BoxError::from(format!("collecting request body: {e}")))?
                .to_bytes();
            let req = Request::from_parts(parts, bytes);
            transport.round_trip(req).await.map_err(Into::into)
        })
    }
}
