//! End-to-end probe tests against local canned-response servers.
//!
//! Every server here is a plain TCP listener speaking just enough HTTP/1.1
//! for one exchange, so the tests cover the real pipeline (dial, request,
//! drain, statistics snapshot) without leaving the loopback interface.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use htping::{ProbeError, ProbeOptions, TcpStats};

async fn serve_once(response: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(&response).await;
            let _ = stream.shutdown().await;
        }
    });
    addr
}

fn no_ping() -> ProbeOptions {
    ProbeOptions {
        ping: false,
        ..ProbeOptions::default()
    }
}

#[tokio::test]
async fn plain_get_with_content_length() {
    let mut response =
        b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nConnection: close\r\n\r\n".to_vec();
    response.extend_from_slice(&[0x42u8; 1000]);
    let addr = serve_once(response).await;

    let report = htping::run(&format!("http://{addr}/"), no_ping())
        .await
        .expect("probe");

    assert!(!report.is_partial(), "unexpected error: {}", report.error);
    assert_eq!(report.code, 200);
    assert_eq!(report.total_size, 1000);
    assert!(report.server.is_none());
    assert_eq!(report.domain, "127.0.0.1");
    assert_eq!(report.port, addr.port());
    assert_eq!(report.scheme, "http");
    assert_eq!(report.tls_handshake_time_ms, 0);
    assert!(report.total_time_ms >= u64::from(report.connect_time_ms));
    assert!(report.speed >= 0.0 && report.speed.is_finite());
    assert!(report.ping_error.is_empty());
}

#[tokio::test]
async fn server_statistics_ride_the_body_tail() {
    let stats = TcpStats {
        rtt_ms: 12,
        rtt_var_ms: 3,
        snd_mss: 1460,
        snd_cwnd: 10,
        total_packets: 1000,
        retransmit_packets: 50,
    };
    let mut body = vec![0x5au8; 64];
    body.extend_from_slice(&stats.encode());
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nx-htping-tcpinfo: 1\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(&body);
    let addr = serve_once(response).await;

    let report = htping::run(
        &format!("http://{addr}/"),
        ProbeOptions {
            server_stats: true,
            ..no_ping()
        },
    )
    .await
    .expect("probe");

    assert!(!report.is_partial(), "unexpected error: {}", report.error);
    assert_eq!(report.total_size, 64);
    assert_eq!(report.server, Some(stats));
    assert_eq!(report.loss, 5.0);
}

#[tokio::test]
async fn acknowledgment_without_content_length_falls_back_to_plain_drain() {
    // Close-delimited body: the sub-protocol needs a known length, so the
    // acknowledgment header alone must not trigger a decode.
    let mut response =
        b"HTTP/1.1 200 OK\r\nx-htping-tcpinfo: 1\r\nConnection: close\r\n\r\n".to_vec();
    response.extend_from_slice(&[0x11u8; 500]);
    let addr = serve_once(response).await;

    let report = htping::run(
        &format!("http://{addr}/"),
        ProbeOptions {
            server_stats: true,
            ..no_ping()
        },
    )
    .await
    .expect("probe");

    assert!(!report.is_partial(), "unexpected error: {}", report.error);
    assert_eq!(report.total_size, 500);
    assert!(report.server.is_none());
    assert_eq!(report.loss, 0.0);
}

#[tokio::test]
async fn acknowledgment_with_tiny_body_falls_back_to_plain_drain() {
    // The declared length cannot even hold a statistics record, so the
    // decoder is bypassed and the whole body counts as payload.
    let mut response = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nx-htping-tcpinfo: 1\r\nConnection: close\r\n\r\n"
        .to_vec();
    response.extend_from_slice(&[0x22u8; 10]);
    let addr = serve_once(response).await;

    let report = htping::run(
        &format!("http://{addr}/"),
        ProbeOptions {
            server_stats: true,
            ..no_ping()
        },
    )
    .await
    .expect("probe");

    assert!(!report.is_partial(), "unexpected error: {}", report.error);
    assert_eq!(report.total_size, 10);
    assert!(report.server.is_none());
}

#[tokio::test]
async fn unacknowledged_statistics_request_drains_normally() {
    // Client opts in but the server stays silent: the body is all payload.
    let mut response =
        b"HTTP/1.1 200 OK\r\nContent-Length: 200\r\nConnection: close\r\n\r\n".to_vec();
    response.extend_from_slice(&[0x33u8; 200]);
    let addr = serve_once(response).await;

    let report = htping::run(
        &format!("http://{addr}/"),
        ProbeOptions {
            server_stats: true,
            ..no_ping()
        },
    )
    .await
    .expect("probe");

    assert!(!report.is_partial(), "unexpected error: {}", report.error);
    assert_eq!(report.total_size, 200);
    assert!(report.server.is_none());
}

#[tokio::test]
async fn non_success_status_is_still_a_full_report() {
    let response = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    let addr = serve_once(response.to_vec()).await;

    let report = htping::run(&format!("http://{addr}/missing"), no_ping())
        .await
        .expect("probe");

    assert!(!report.is_partial(), "unexpected error: {}", report.error);
    assert_eq!(report.code, 404);
    assert_eq!(report.total_size, 0);
}

#[tokio::test]
async fn dial_failure_yields_partial_report() {
    // Bind then drop to find a port that refuses connections. The target is
    // a hostname, not an IP literal, so the resolution leg runs for real and
    // its result must survive into the partial report.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);

    let report = htping::run(&format!("http://localhost:{port}/"), no_ping())
        .await
        .expect("dial failure must not be a hard error");

    assert!(report.is_partial());
    assert_eq!(report.code, 0);
    assert_eq!(report.domain, "localhost");
    assert_eq!(report.ip, "127.0.0.1");
    assert_eq!(report.total_size, 0);
}

#[tokio::test]
async fn connect_timeout_is_honored() {
    // RFC 5737 TEST-NET-1 does not answer; the configured deadline applies.
    let report = htping::run(
        "http://192.0.2.1/",
        ProbeOptions {
            connect_timeout: Duration::from_millis(200),
            ..no_ping()
        },
    )
    .await
    .expect("timeout must not be a hard error");

    assert!(report.is_partial());
    assert!(report.error.contains("connect"));
    assert_eq!(report.code, 0);
}

#[tokio::test]
async fn unresolvable_host_is_a_hard_error() {
    let err = htping::run("http://host.invalid/", no_ping())
        .await
        .unwrap_err();
    assert!(matches!(err, ProbeError::DnsResolution { .. }));
}

#[tokio::test]
async fn ping_leg_never_fails_the_http_measurement() {
    let mut response =
        b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: close\r\n\r\n".to_vec();
    response.extend_from_slice(&[0u8; 10]);
    let addr = serve_once(response).await;

    let report = htping::run(
        &format!("http://{addr}/"),
        ProbeOptions {
            ping: true,
            ping_timeout: Duration::from_secs(1),
            ..ProbeOptions::default()
        },
    )
    .await
    .expect("probe");

    // Whether the echo works (loopback TTL 64 maps to zero hops) or the raw
    // socket is denied (ping_error set), the HTTP leg must be untouched.
    assert!(!report.is_partial(), "unexpected error: {}", report.error);
    assert_eq!(report.code, 200);
    assert_eq!(report.hops, 0);
}
