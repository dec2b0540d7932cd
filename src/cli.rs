use clap::Parser;

/// Single-shot HTTP probe with transport-level timings, kernel TCP counters
/// and an ICMP hop estimate. Prints one JSON report per invocation.
#[derive(Parser, Debug, Clone)]
#[command(name = "htping")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Target URL (scheme defaults to http://)
    pub url: String,

    /// HTTP method
    #[arg(short = 'X', long = "method", default_value = "GET")]
    pub method: String,

    /// Byte range to request, sent as `Range: bytes=<RANGE>`
    #[arg(short = 'r', long = "range")]
    pub range: Option<String>,

    /// Extra request header as `name: value` (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Local source address for both the TCP and ICMP legs
    #[arg(short = 'l', long = "local")]
    pub local: Option<String>,

    /// Skip the concurrent ICMP hop probe
    #[arg(long = "no-ping")]
    pub no_ping: bool,

    /// Ask the server to append its TCP statistics to the response body
    #[arg(long = "server-stats")]
    pub server_stats: bool,

    /// TCP connect timeout in seconds
    #[arg(long = "connect-timeout", default_value = "10")]
    pub connect_timeout: u64,

    /// Timeout for sending the request and receiving the response head,
    /// in seconds
    #[arg(long = "timeout", default_value = "30")]
    pub request_timeout: u64,

    /// ICMP echo timeout in seconds
    #[arg(long = "ping-timeout", default_value = "5")]
    pub ping_timeout: u64,
}
