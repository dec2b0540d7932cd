//! The probe pipeline: resolve, dial, exchange, drain, derive.
//!
//! Strictly linear, one request per invocation, no retries. Failures before
//! the first connection attempt are hard errors; the dial, the HTTP
//! exchange, the body drain and the statistics snapshot degrade gracefully
//! instead, producing a partial report with the `error` field set. The hop
//! probe runs alongside and is joined exactly once before any report is
//! returned.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::{CONTENT_LENGTH, HOST, HeaderMap, HeaderValue};
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use trust_dns_resolver::TokioAsyncResolver;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use url::Url;

use crate::net::ping::{self, PingError};
use crate::net::tcp_info::{TcpStatsProbe, WIRE_SIZE};
use crate::probe::error::ProbeError;
use crate::probe::report::{self, HttpPingReport};
use crate::probe::transport::{self, InstrumentedStream};
use crate::probe::wire;

/// Knobs for one probe run. Every blocking stage has an explicit deadline.
#[derive(Clone, Debug)]
pub struct ProbeOptions {
    pub method: Method,
    /// Extra request headers (e.g. `Range`).
    pub headers: HeaderMap,
    /// Run the concurrent ICMP hop probe.
    pub ping: bool,
    /// Local source address for both the TCP and ICMP legs.
    pub local_addr: Option<String>,
    /// Ask the server to append its TCP statistics to the response body.
    pub server_stats: bool,
    pub connect_timeout: Duration,
    /// Deadline for sending the request and receiving the response head.
    /// Body draining is not covered: a long download is the measurement.
    pub request_timeout: Duration,
    pub ping_timeout: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            ping: true,
            local_addr: None,
            server_stats: false,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            ping_timeout: ping::DEFAULT_PING_TIMEOUT,
        }
    }
}

/// GET the URL with default options (hop probe enabled).
pub async fn http_ping(url: &str) -> Result<HttpPingReport, ProbeError> {
    run(url, ProbeOptions::default()).await
}

/// GET the URL, choosing the hop probe and the local source address.
pub async fn http_ping_with(
    url: &str,
    ping: bool,
    local_addr: Option<String>,
) -> Result<HttpPingReport, ProbeError> {
    run(
        url,
        ProbeOptions {
            ping,
            local_addr,
            ..ProbeOptions::default()
        },
    )
    .await
}

/// Execute one instrumented request and derive the report.
pub async fn run(raw_url: &str, opts: ProbeOptions) -> Result<HttpPingReport, ProbeError> {
    let url = normalize_url(raw_url)?;
    let scheme = url.scheme().to_string();
    if scheme != "http" && scheme != "https" {
        return Err(ProbeError::UnsupportedScheme(scheme));
    }
    let host = url.host_str().ok_or(ProbeError::MissingHost)?.to_string();

    let mut report = HttpPingReport {
        domain: host.trim_matches(['[', ']']).to_string(),
        scheme: scheme.clone(),
        ..Default::default()
    };

    let dns_start = Instant::now();
    let ip = resolve_host(&report.domain).await?;
    report.dns_time_ms = dns_start.elapsed().as_millis() as u32;
    report.ip = ip.to_string();
    log::debug!("resolved {} to {} in {}ms", report.domain, ip, report.dns_time_ms);

    let local_ip = match opts.local_addr.as_deref() {
        Some(addr) if !addr.is_empty() => Some(
            addr.parse::<IpAddr>()
                .map_err(|_| ProbeError::InvalidLocalAddr(addr.to_string()))?,
        ),
        _ => None,
    };

    let ping_task: Option<JoinHandle<Result<u32, PingError>>> = opts
        .ping
        .then(|| tokio::spawn(ping::probe_hops(ip, local_ip, opts.ping_timeout)));

    let port = url
        .port_or_known_default()
        .unwrap_or(if scheme == "https" { 443 } else { 80 });
    report.port = port;

    let remote = SocketAddr::new(ip, port);
    let connect_start = Instant::now();
    let stream = match dial(remote, local_ip, opts.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            report.error = format!("connect {remote}: {e}");
            return finish(report, ping_task).await;
        }
    };
    report.connect_time_ms = connect_start.elapsed().as_millis() as u32;
    log::debug!("connected to {remote} in {}ms", report.connect_time_ms);

    let stats_probe = TcpStatsProbe::new(&stream);
    let stream = InstrumentedStream::new(stream);
    let metrics = stream.metrics();

    let request = match build_request(&url, &host, &opts) {
        Ok(request) => request,
        Err(msg) => {
            report.error = msg;
            return finish(report, ping_task).await;
        }
    };

    let response = if scheme == "https" {
        match transport::connect_tls(stream, &report.domain).await {
            Ok(tls) => exchange(tls, request, opts.request_timeout).await,
            Err(e) => Err(format!("tls handshake: {e}")),
        }
    } else {
        exchange(stream, request, opts.request_timeout).await
    };
    let response = match response {
        Ok(response) => response,
        Err(msg) => {
            report.error = msg;
            return finish(report, ping_task).await;
        }
    };

    report.code = response.status().as_u16();
    let negotiated = opts.server_stats
        && response
            .headers()
            .get(wire::ACK_HEADER)
            .is_some_and(|v| !v.as_bytes().is_empty());
    let content_length = parse_content_length(response.headers());
    let mut body = response.into_body();

    let drained = match content_length {
        Some(len) if negotiated && len >= WIRE_SIZE as u64 => {
            match wire::drain_with_server_stats(&mut body, len).await {
                Ok((payload, stats)) => {
                    report.total_size = payload;
                    report.server = Some(stats);
                    Ok(())
                }
                Err(e) => Err(format!("server statistics decode: {e}")),
            }
        }
        _ => match wire::drain_plain(&mut body).await {
            Ok(n) => {
                report.total_size = n;
                Ok(())
            }
            Err(e) => Err(format!("body read: {e}")),
        },
    };
    if let Err(msg) = drained {
        report.error = msg;
        return finish(report, ping_task).await;
    }

    let end = Instant::now();
    match stats_probe.and_then(|probe| probe.snapshot()) {
        Ok(stats) => report.client = stats,
        // Collected fields stay; only the error is recorded.
        Err(e) => report.error = format!("tcp statistics: {e}"),
    }

    report.ttfb_ms = metrics.ttfb().map_or(0, |d| d.as_millis() as u32);
    report.total_time_ms = end.duration_since(connect_start).as_millis() as u64;
    if scheme == "https" {
        report.tls_handshake_time_ms = metrics
            .tls_handshake()
            .map_or(0, |d| d.as_millis() as u32);
    }

    // Speed counts every byte the socket moved (headers and TLS framing
    // included), measured from the last request byte written so that tiny
    // responses arriving with the first read still get a sane window.
    let bytes_moved = metrics.bytes_received();
    let wall_ms = metrics
        .last_write()
        .map_or(0, |w| end.duration_since(w).as_millis() as i64);
    report.speed = report::download_speed(bytes_moved, wall_ms, report.client.rtt_ms);

    if let Some(server) = report.server.as_mut() {
        if server.total_packets == 0 {
            server.total_packets = report::estimate_total_packets(bytes_moved);
        }
        report.loss = report::loss_percentage(server.retransmit_packets, server.total_packets);
    }

    finish(report, ping_task).await
}

/// Join the hop probe (when it was started) and hand the report back.
/// Every report-producing path funnels through here, so the background task
/// never outlives the call.
async fn finish(
    mut report: HttpPingReport,
    ping_task: Option<JoinHandle<Result<u32, PingError>>>,
) -> Result<HttpPingReport, ProbeError> {
    if let Some(task) = ping_task {
        match task.await {
            Ok(Ok(hops)) => report.hops = hops,
            Ok(Err(e)) => report.ping_error = e.to_string(),
            Err(e) => report.ping_error = format!("ping task: {e}"),
        }
    }
    Ok(report)
}

fn normalize_url(raw: &str) -> Result<Url, ProbeError> {
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    Url::parse(&candidate).map_err(|source| ProbeError::InvalidUrl {
        url: raw.to_string(),
        source,
    })
}

async fn resolve_host(host: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
        TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
    });
    let lookup = resolver
        .lookup_ip(host)
        .await
        .map_err(|source| ProbeError::DnsResolution {
            host: host.to_string(),
            source,
        })?;
    // Prefer IPv4: most edges answer it and the hop probe needs it.
    lookup
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| lookup.iter().next())
        .ok_or_else(|| ProbeError::EmptyResolution(host.to_string()))
}

async fn dial(
    remote: SocketAddr,
    local: Option<IpAddr>,
    timeout: Duration,
) -> std::io::Result<TcpStream> {
    let socket = match remote {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if let Some(ip) = local {
        socket.bind(SocketAddr::new(ip, 0))?;
    }
    match tokio::time::timeout(timeout, socket.connect(remote)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("timed out after {timeout:?}"),
        )),
    }
}

fn build_request(
    url: &Url,
    host: &str,
    opts: &ProbeOptions,
) -> Result<Request<Empty<Bytes>>, String> {
    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    let mut request = Request::builder()
        .method(opts.method.clone())
        .uri(path)
        .body(Empty::<Bytes>::new())
        .map_err(|e| format!("build request: {e}"))?;

    let host_header = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let host_value =
        HeaderValue::from_str(&host_header).map_err(|e| format!("host header: {e}"))?;
    request.headers_mut().insert(HOST, host_value);
    for (name, value) in opts.headers.iter() {
        request.headers_mut().insert(name, value.clone());
    }
    if opts.server_stats {
        request.headers_mut().insert(
            wire::REQUIRE_HEADER,
            HeaderValue::from_static(wire::REQUIRE_VALUE),
        );
    }
    Ok(request)
}

/// Drive one HTTP/1.1 exchange over the given stream and return the
/// response with its body still pending. Failures come back as the
/// report-facing error string.
async fn exchange<T>(
    io: T,
    request: Request<Empty<Bytes>>,
    timeout: Duration,
) -> Result<Response<Incoming>, String>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| format!("http handshake: {e}"))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            log::debug!("connection task ended: {e}");
        }
    });
    match tokio::time::timeout(timeout, sender.send_request(request)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(format!("http request: {e}")),
        Err(_) => Err(format!("http request timed out after {timeout:?}")),
    }
}

fn parse_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalizes_bare_hosts_to_http() {
        let url = normalize_url("example.com/path").expect("parse");
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.host_str(), Some("example.com"));
        assert_eq!(url.path(), "/path");

        let url = normalize_url("https://example.com").expect("parse");
        assert_eq!(url.scheme(), "https");
    }

    #[test]
    fn rejects_garbage_urls() {
        assert!(normalize_url("http://").is_err());
    }

    #[tokio::test]
    async fn rejects_unsupported_schemes() {
        let err = run("ftp://example.com", ProbeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::UnsupportedScheme(s) if s == "ftp"));
    }

    #[tokio::test]
    async fn rejects_bad_local_address() {
        let err = run(
            "http://127.0.0.1",
            ProbeOptions {
                local_addr: Some("not-an-ip".into()),
                ping: false,
                ..ProbeOptions::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProbeError::InvalidLocalAddr(_)));
    }

    #[test]
    fn request_carries_negotiation_header_when_opted_in() {
        let url = normalize_url("http://example.com/data?x=1").expect("parse");
        let opts = ProbeOptions {
            server_stats: true,
            ..ProbeOptions::default()
        };
        let request = build_request(&url, "example.com", &opts).expect("build");
        assert_eq!(request.uri(), "/data?x=1");
        assert_eq!(request.headers()[HOST], "example.com");
        assert_eq!(request.headers()[wire::REQUIRE_HEADER], wire::REQUIRE_VALUE);

        let opts = ProbeOptions::default();
        let request = build_request(&url, "example.com", &opts).expect("build");
        assert!(!request.headers().contains_key(wire::REQUIRE_HEADER));
    }

    #[test]
    fn host_header_keeps_explicit_port() {
        let url = normalize_url("http://example.com:8080/").expect("parse");
        let request =
            build_request(&url, "example.com", &ProbeOptions::default()).expect("build");
        assert_eq!(request.headers()[HOST], "example.com:8080");
    }

    #[test]
    fn content_length_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_content_length(&headers), None);
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("1000"));
        assert_eq!(parse_content_length(&headers), Some(1000));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("junk"));
        assert_eq!(parse_content_length(&headers), None);
    }
}
