//! The probe's output record and the derived-metric arithmetic.

use serde::Serialize;

use crate::net::tcp_info::TcpStats;

/// Typical Ethernet TCP segment payload. Used as a labeled heuristic to
/// estimate the server's packet count when it does not report one; it is not
/// authoritative for any particular path MTU.
const TYPICAL_MSS_BYTES: u64 = 1460;

/// Everything one probe run learned about the target.
///
/// `error` being non-empty marks the report as partial: the pipeline stopped
/// early and the remaining fields are best-effort or zero. `ping_error` is
/// independent of it; a failed hop probe never fails the HTTP measurement.
#[derive(Debug, Default, Serialize)]
pub struct HttpPingReport {
    pub domain: String,
    pub ip: String,
    pub port: u16,
    pub scheme: String,
    /// HTTP status code, 0 when no response was received.
    pub code: u16,
    /// ICMP-derived hop estimate, 0 when unknown.
    pub hops: u32,
    pub dns_time_ms: u32,
    pub connect_time_ms: u32,
    /// 0 for plaintext probes.
    pub tls_handshake_time_ms: u32,
    pub ttfb_ms: u32,
    pub total_time_ms: u64,
    /// Response payload bytes (the server statistics record, if any, is
    /// stripped before counting).
    pub total_size: u64,
    /// Bytes moved per millisecond of transfer time, i.e. roughly kB/s.
    pub speed: f32,
    /// Retransmit-derived packet loss percentage, from the server's counters.
    pub loss: f32,
    pub client: TcpStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<TcpStats>,
    pub error: String,
    pub ping_error: String,
}

impl HttpPingReport {
    /// True when the pipeline stopped early and only some fields are set.
    pub fn is_partial(&self) -> bool {
        !self.error.is_empty()
    }

    /// Pretty-printed JSON, the tool's canonical rendering.
    pub fn render(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Download speed in bytes per millisecond.
///
/// `wall_ms` is measured from the last request byte written; the local RTT
/// estimate is subtracted to turn the wall-clock wait into transfer-only
/// time. Small or fast transfers can drive that at or below zero, so the
/// divisor is clamped to 1 ms. The result is always finite and >= 0.
pub(crate) fn download_speed(bytes: u64, wall_ms: i64, rtt_ms: u32) -> f32 {
    let transfer_ms = (wall_ms - i64::from(rtt_ms)).max(1);
    (bytes as f64 / transfer_ms as f64) as f32
}

/// Loss percentage from retransmit counters; 0 whenever either counter is 0.
pub(crate) fn loss_percentage(retransmit_packets: u32, total_packets: u32) -> f32 {
    if retransmit_packets == 0 || total_packets == 0 {
        return 0.0;
    }
    retransmit_packets as f32 / total_packets as f32 * 100.0
}

/// Estimate a packet count from bytes moved when the server omits its own.
pub(crate) fn estimate_total_packets(bytes: u64) -> u32 {
    (bytes / TYPICAL_MSS_BYTES) as u32
}
