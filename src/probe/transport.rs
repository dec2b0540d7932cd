//! Byte- and time-level instrumentation of a live connection.
//!
//! [`InstrumentedStream`] decorates the raw socket an HTTP client is driven
//! over: every read bumps a running byte counter and the first read stamps a
//! timestamp, every write stamps the most recent write time. The counters
//! live behind a shared [`TransportMetrics`] handle because the stream itself
//! is moved into the connection driver while the pipeline still needs the
//! numbers afterwards.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_native_tls::TlsStream;

#[derive(Debug, Default)]
struct Counters {
    bytes_received: u64,
    first_read: Option<Instant>,
    last_write: Option<Instant>,
    tls_handshake: Option<Duration>,
}

/// Shared view of an [`InstrumentedStream`]'s counters.
#[derive(Clone, Debug, Default)]
pub struct TransportMetrics {
    shared: Arc<Mutex<Counters>>,
}

impl TransportMetrics {
    pub fn bytes_received(&self) -> u64 {
        self.lock().bytes_received
    }

    /// Time to first byte: first read minus the most recent write before it.
    ///
    /// `None` until at least one read and one write have been observed.
    pub fn ttfb(&self) -> Option<Duration> {
        let counters = self.lock();
        let first_read = counters.first_read?;
        let last_write = counters.last_write?;
        Some(first_read.saturating_duration_since(last_write))
    }

    pub fn last_write(&self) -> Option<Instant> {
        self.lock().last_write
    }

    pub fn tls_handshake(&self) -> Option<Duration> {
        self.lock().tls_handshake
    }

    fn record_read(&self, n: usize) {
        let mut counters = self.lock();
        counters.bytes_received += n as u64;
        if counters.first_read.is_none() {
            counters.first_read = Some(Instant::now());
        }
    }

    fn record_write(&self) {
        self.lock().last_write = Some(Instant::now());
    }

    fn record_tls_handshake(&self, elapsed: Duration) {
        self.lock().tls_handshake = Some(elapsed);
    }

    fn reset_first_read(&self) {
        self.lock().first_read = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.shared.lock().expect("transport metrics lock poisoned")
    }
}

/// Connection decorator that feeds [`TransportMetrics`].
///
/// Generic over the wrapped stream so tests can run it over in-memory pipes;
/// the probe wraps the freshly dialed `TcpStream`. I/O errors pass through
/// unchanged, nothing is retried here.
pub struct InstrumentedStream<S> {
    inner: S,
    metrics: TransportMetrics,
}

impl<S> InstrumentedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            metrics: TransportMetrics::default(),
        }
    }

    pub fn metrics(&self) -> TransportMetrics {
        self.metrics.clone()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for InstrumentedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = buf.filled().len() - before;
            if n > 0 {
                this.metrics.record_read(n);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for InstrumentedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(_)) = &poll {
            this.metrics.record_write();
        }
        poll
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(_)) = &poll {
            this.metrics.record_write();
        }
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// TLS handshake over an instrumented stream.
///
/// Certificate and hostname verification are deliberately disabled: this
/// tool measures reachability and performance, and it must be able to probe
/// endpoints with broken or mismatched certificates. Do not reuse this
/// connector for anything that carries real traffic.
///
/// Handshake bytes are counted by the wrapper like any other I/O. Once the
/// handshake completes the first-read timestamp is reset, so TTFB is
/// measured against decrypted application data rather than handshake
/// records.
pub async fn connect_tls<S>(
    stream: InstrumentedStream<S>,
    domain: &str,
) -> Result<TlsStream<InstrumentedStream<S>>, native_tls::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut builder = native_tls::TlsConnector::builder();
    builder.danger_accept_invalid_certs(true);
    builder.danger_accept_invalid_hostnames(true);
    let connector = tokio_native_tls::TlsConnector::from(builder.build()?);

    let metrics = stream.metrics();
    let start = Instant::now();
    let tls = connector.connect(domain, stream).await?;
    metrics.record_tls_handshake(start.elapsed());
    metrics.reset_first_read();
    Ok(tls)
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn counts_bytes_and_stamps_first_read() {
        let (near, mut far) = tokio::io::duplex(256);
        let mut stream = InstrumentedStream::new(near);
        let metrics = stream.metrics();

        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        assert!(metrics.last_write().is_some());
        assert_eq!(metrics.bytes_received(), 0);
        assert!(metrics.ttfb().is_none());

        far.write_all(b"HTTP/1.1 200 OK\r\n").await.unwrap();
        let mut buf = [0u8; 8];
        stream.read_exact(&mut buf).await.unwrap();
        stream.read_exact(&mut buf).await.unwrap();

        assert_eq!(metrics.bytes_received(), 16);
        let ttfb = metrics.ttfb().expect("first read recorded");
        assert!(ttfb >= Duration::ZERO);
    }

    #[tokio::test]
    async fn first_read_is_recorded_once() {
        let (near, mut far) = tokio::io::duplex(256);
        let mut stream = InstrumentedStream::new(near);
        let metrics = stream.metrics();

        stream.write_all(b"x").await.unwrap();
        far.write_all(b"ab").await.unwrap();
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await.unwrap();
        let first = metrics.lock().first_read;

        far.write_all(b"cd").await.unwrap();
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(metrics.lock().first_read, first);
    }

    #[tokio::test]
    async fn read_errors_pass_through() {
        let (near, far) = tokio::io::duplex(64);
        let mut stream = InstrumentedStream::new(near);
        drop(far);

        let mut buf = [0u8; 4];
        // Peer gone: a clean EOF, not a retry or a panic.
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert_eq!(stream.metrics().bytes_received(), 0);
    }
}
