//! Single-shot instrumented HTTP probe.
//!
//! One invocation performs one HTTP request over a raw (optionally TLS)
//! connection and reports fine-grained timing and transport-quality
//! metrics: DNS, connect and TLS handshake latency, time to first byte,
//! download speed, kernel TCP counters from both ends of the connection
//! (when the server cooperates), retransmit-derived packet loss and an
//! ICMP-derived hop estimate.

pub mod net;
pub mod probe;

pub use net::tcp_info::TcpStats;
pub use probe::{HttpPingReport, ProbeError, ProbeOptions, http_ping, http_ping_with, run};
