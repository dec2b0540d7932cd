//! Server-side statistics sub-protocol and body draining.
//!
//! A client that wants the server's own TCP counters sets the require
//! header; a compatible server acknowledges with the response header and
//! appends the encoded [`TcpStats`] record to the end of the body. The
//! record rides inside the declared content length, so the tail has to be
//! stripped before the transfer size is reported.
//!
//! Wire layout when negotiated:
//! `[contentLength - WIRE_SIZE payload bytes][WIRE_SIZE record bytes]`.
//! The sub-protocol is unusable when the content length is unknown (chunked)
//! or smaller than the record; callers fall back to the plain drain.

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use thiserror::Error;

use crate::net::tcp_info::{TcpStats, WIRE_SIZE};

/// Request header signaling that the client understands the sub-protocol.
pub const REQUIRE_HEADER: &str = "x-htping-require";
pub const REQUIRE_VALUE: &str = "tcpinfo";

/// Response header whose presence (any non-empty value) acknowledges that
/// the body tail carries the statistics record.
pub const ACK_HEADER: &str = "x-htping-tcpinfo";

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("body stream: {0}")]
    Stream(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("short body: expected {expected} bytes, got {got}")]
    ShortBody { expected: u64, got: u64 },
}

/// Drain the body to end-of-stream, returning the number of bytes read.
///
/// A normal end-of-stream is success regardless of any declared length.
pub async fn drain_plain<B>(body: &mut B) -> Result<u64, DrainError>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let mut total = 0u64;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| DrainError::Stream(e.into()))?;
        if let Some(data) = frame.data_ref() {
            total += data.len() as u64;
        }
    }
    Ok(total)
}

/// Drain a negotiated body and split off the trailing statistics record.
///
/// Returns the payload size (body minus the record) and the decoded record.
/// The payload itself is discarded; only its length matters for the report.
/// A body shorter than `content_length` truncates the record and is an
/// error; end-of-stream exactly at the declared boundary is success.
///
/// Callers must ensure `content_length >= WIRE_SIZE`.
pub async fn drain_with_server_stats<B>(
    body: &mut B,
    content_length: u64,
) -> Result<(u64, TcpStats), DrainError>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    debug_assert!(content_length >= WIRE_SIZE as u64);

    let mut total = 0u64;
    let mut tail: Vec<u8> = Vec::with_capacity(WIRE_SIZE * 2);
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| DrainError::Stream(e.into()))?;
        if let Some(data) = frame.data_ref() {
            total += data.len() as u64;
            // Only the last WIRE_SIZE bytes can be the record; the rest of
            // the payload is measured, not kept.
            tail.extend_from_slice(data);
            if tail.len() > WIRE_SIZE {
                tail.drain(..tail.len() - WIRE_SIZE);
            }
        }
    }

    if total < content_length {
        return Err(DrainError::ShortBody {
            expected: content_length,
            got: total,
        });
    }

    let mut raw = [0u8; WIRE_SIZE];
    raw.copy_from_slice(&tail);
    Ok((total - WIRE_SIZE as u64, TcpStats::decode(&raw)))
}
