//! End-to-end tunnel tests against a local bus
//!
//! These tests exercise the real hub transport and edge responder through a
//! running NATS server at `localhost:4222`, with a local axum server standing
//! in for the remote cluster's API. They skip themselves when no bus is
//! available, so `cargo test` stays green on machines without one.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use http::{Request, StatusCode};
use http_body_util::BodyExt;

use tether::edge;
use tether::link::{BusVerifier, ClusterVerifier};
use tether::subjects::SubjectNames;
use tether::transport::{transport_for, TransportConfig};

const NATS_URL: &str = "nats://localhost:4222";

/// One byte more than an exact multiple of the edge write buffer, so large
/// responses provably span several bus messages.
const BIG_BODY_LEN: usize = 3 * 1024 * 1024 + 1;

async fn try_connect() -> Option<async_nats::Client> {
    async_nats::ConnectOptions::new()
        .connect(NATS_URL)
        .await
        .ok()
}

/// Serve a stand-in upstream API on an ephemeral port.
async fn spawn_upstream() -> SocketAddr {
    let app = Router::new()
        .route("/x", get(|| async { "hello" }))
        .route(
            "/big",
            get(|| async { vec![0xabu8; BIG_BODY_LEN] }),
        )
        .route(
            "/stream",
            get(|| async {
                // No Content-Length: forces chunked framing through the
                // whole tunnel.
                let chunks = futures::stream::iter(
                    (0u8..10).map(|i| Ok::<_, std::io::Error>(Bytes::from(vec![i; 1000]))),
                );
                axum::body::Body::from_stream(chunks)
            }),
        )
        .route(
            "/echo-header",
            get(|headers: http::HeaderMap| async move {
                headers
                    .get("x-probe")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("missing")
                    .to_string()
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Fresh link namespace per test so runs never interfere.
fn unique_names(prefix: &str) -> SubjectNames {
    SubjectNames::same_account(format!("{prefix}-{}", ulid::Ulid::new()))
}

async fn edge_online(nc: &async_nats::Client, names: &SubjectNames) {
    edge::subscribe(nc, names, "e2e-tests").await.unwrap();
    // Queue subscriptions are installed; flush so the server knows.
    nc.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_roundtrip() {
    let Some(nc) = try_connect().await else {
        eprintln!("SKIP: NATS not available");
        return;
    };
    let upstream = spawn_upstream().await;
    let names = unique_names("happy");
    edge_online(&nc, &names).await;

    // The plain-HTTP constructor downstream hub code uses.
    let transport = tether::client::proxied_http_transport(&nc, &names).unwrap();

    let req = Request::builder()
        .uri(format!("http://{upstream}/x"))
        .body(Bytes::new())
        .unwrap();
    let resp = transport.round_trip(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), b"hello");
}

#[tokio::test(flavor = "multi_thread")]
async fn request_headers_reach_the_upstream() {
    let Some(nc) = try_connect().await else {
        eprintln!("SKIP: NATS not available");
        return;
    };
    let upstream = spawn_upstream().await;
    let names = unique_names("headers");
    edge_online(&nc, &names).await;

    let transport = transport_for(
        &nc,
        &names,
        Duration::from_secs(10),
        &TransportConfig::default(),
    )
    .unwrap();

    let req = Request::builder()
        .uri(format!("http://{upstream}/echo-header"))
        .header("x-probe", "proxied-value")
        .body(Bytes::new())
        .unwrap();
    let resp = transport.round_trip(req).await.unwrap();

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), b"proxied-value");
}

#[tokio::test(flavor = "multi_thread")]
async fn streamed_response_spans_many_chunks() {
    let Some(nc) = try_connect().await else {
        eprintln!("SKIP: NATS not available");
        return;
    };
    let upstream = spawn_upstream().await;
    let names = unique_names("big");
    edge_online(&nc, &names).await;

    let transport = transport_for(
        &nc,
        &names,
        Duration::from_secs(60),
        &TransportConfig::default(),
    )
    .unwrap();

    let req = Request::builder()
        .uri(format!("http://{upstream}/big"))
        .body(Bytes::new())
        .unwrap();
    let resp = transport.round_trip(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.len(), BIG_BODY_LEN);
    assert!(body.iter().all(|&b| b == 0xab));
}

#[tokio::test(flavor = "multi_thread")]
async fn chunked_upstream_body_is_reassembled() {
    let Some(nc) = try_connect().await else {
        eprintln!("SKIP: NATS not available");
        return;
    };
    let upstream = spawn_upstream().await;
    let names = unique_names("chunked");
    edge_online(&nc, &names).await;

    let transport = transport_for(
        &nc,
        &names,
        Duration::from_secs(10),
        &TransportConfig::default(),
    )
    .unwrap();

    let req = Request::builder()
        .uri(format!("http://{upstream}/stream"))
        .body(Bytes::new())
        .unwrap();
    let resp = transport.round_trip(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    // The tunnel de-frames chunked bodies; callers see plain bytes.
    assert!(resp.headers().get("transfer-encoding").is_none());

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.len(), 10_000);
    for (i, window) in body.chunks(1000).enumerate() {
        assert!(window.iter().all(|&b| b == i as u8));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_upstream_surfaces_as_http_500() {
    let Some(nc) = try_connect().await else {
        eprintln!("SKIP: NATS not available");
        return;
    };
    let names = unique_names("down");
    edge_online(&nc, &names).await;

    let transport = transport_for(
        &nc,
        &names,
        Duration::from_secs(10),
        &TransportConfig::default(),
    )
    .unwrap();

    // TEST-NET-1: nothing listens there.
    let req = Request::builder()
        .uri("http://192.0.2.1:9/unreachable")
        .body(Bytes::new())
        .unwrap();
    let resp = transport.round_trip(req).await.unwrap();

    // The edge synthesizes the error as a regular HTTP response; the tunnel
    // itself succeeds.
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json["message"].as_str().unwrap().contains("upstream request failed"));
}

#[tokio::test(flavor = "multi_thread")]
async fn done_marker_appears_exactly_once_and_last() {
    use futures::StreamExt;

    let Some(nc) = try_connect().await else {
        eprintln!("SKIP: NATS not available");
        return;
    };
    let upstream = spawn_upstream().await;
    let names = unique_names("done");
    edge_online(&nc, &names).await;

    // Drive the edge directly: publish an envelope with our own reply
    // subject and inspect the raw chunk stream.
    let reply = format!("e2e.done.{}", ulid::Ulid::new());
    let mut chunks = nc.subscribe(reply.clone()).await.unwrap();

    let req = Request::builder()
        .uri(format!("http://{upstream}/big"))
        .body(Bytes::new())
        .unwrap();
    let envelope = serde_json::json!({
        "Request": base64_encode(&tether::http_wire::write_request_proxy(&req).unwrap()),
        "Timeout": 10_000_000_000i64,
        "DisableCompression": false,
    });
    let (handler_subject, _) = names.proxy_handler_subjects();
    nc.publish_with_reply(
        handler_subject,
        reply,
        serde_json::to_vec(&envelope).unwrap().into(),
    )
    .await
    .unwrap();
    nc.flush().await.unwrap();

    let mut messages = 0;
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(30), chunks.next())
            .await
            .expect("stream stalled")
            .expect("subscription closed");
        messages += 1;
        let done = msg
            .headers
            .as_ref()
            .and_then(|h| h.get("Done"))
            .map(|v| v.as_str().to_string());
        if let Some(done) = done {
            assert_eq!(done, "", "successful stream must carry an empty Done");
            assert!(msg.payload.is_empty(), "terminal chunk is zero-length");
            break;
        }
    }

    // Nothing may follow the terminal marker.
    let extra = tokio::time::timeout(Duration::from_millis(500), chunks.next()).await;
    assert!(extra.is_err(), "no messages may follow the Done marker");

    // A multi-megabyte body cannot fit one bus message.
    assert!(messages > 2, "expected a chunked stream, got {messages} messages");
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

#[tokio::test(flavor = "multi_thread")]
async fn equal_configs_share_one_cached_transport() {
    let Some(nc) = try_connect().await else {
        eprintln!("SKIP: NATS not available");
        return;
    };
    let names = unique_names("cache");

    let config = TransportConfig {
        ca_data: b"-----BEGIN CERTIFICATE-----".to_vec(),
        server_name: "kubernetes.default".into(),
        ..Default::default()
    };
    let t1 = transport_for(&nc, &names, Duration::from_secs(10), &config).unwrap();
    let t2 = transport_for(&nc, &names, Duration::from_secs(10), &config).unwrap();
    assert!(t1.same_instance(&t2));

    // A different link with the same TLS material gets its own instance.
    let other = unique_names("cache-other");
    let t3 = transport_for(&nc, &other, Duration::from_secs(10), &config).unwrap();
    assert!(!t1.same_instance(&t3));
}

#[tokio::test(flavor = "multi_thread")]
async fn edge_answers_liveness_ping() {
    let Some(nc) = try_connect().await else {
        eprintln!("SKIP: NATS not available");
        return;
    };
    let names = unique_names("ping");
    edge_online(&nc, &names).await;

    let verifier = BusVerifier::new(nc.clone());
    verifier.ping(&names).await.unwrap();

    // No agent listens for this link: the ping must fail as a liveness
    // error.
    let absent = unique_names("absent");
    let err = verifier.ping(&absent).await.unwrap_err();
    assert!(matches!(err, tether::Error::Liveness(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_roundtrips_do_not_interleave() {
    let Some(nc) = try_connect().await else {
        eprintln!("SKIP: NATS not available");
        return;
    };
    let upstream = spawn_upstream().await;
    let names = unique_names("concurrent");
    // Several handler instances, as the agent installs in production.
    for _ in 0..4 {
        edge_online(&nc, &names).await;
    }

    let transport = transport_for(
        &nc,
        &names,
        Duration::from_secs(60),
        &TransportConfig::default(),
    )
    .unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let transport = transport.clone();
        let path = if i % 2 == 0 { "/x" } else { "/big" };
        let url = format!("http://{upstream}{path}");
        tasks.push(tokio::spawn(async move {
            let req = Request::builder().uri(url).body(Bytes::new()).unwrap();
            let resp = transport.round_trip(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let body = resp.into_body().collect().await.unwrap().to_bytes();
            (path, body.len())
        }));
    }

    for task in tasks {
        let (path, len) = task.await.unwrap();
        match path {
            "/x" => assert_eq!(len, 5),
            _ => assert_eq!(len, BIG_BODY_LEN),
        }
    }
}
