//! Hard failures: nothing was measured, no report exists.
//!
//! Everything that happens after the first connection attempt degrades
//! gracefully instead — the pipeline returns a report with its `error`
//! field populated. Callers therefore check both this error and
//! [`HttpPingReport::is_partial`](super::report::HttpPingReport::is_partial).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported scheme {0:?}, expected http or https")]
    UnsupportedScheme(String),
    #[error("url has no host")]
    MissingHost,
    #[error("dns resolution for {host:?} failed: {source}")]
    DnsResolution {
        host: String,
        #[source]
        source: trust_dns_resolver::error::ResolveError,
    },
    #[error("no address records for {0:?}")]
    EmptyResolution(String),
    #[error("invalid local address {0:?}")]
    InvalidLocalAddr(String),
}
