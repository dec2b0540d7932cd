use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use hyper::Method;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, RANGE};

use htping::ProbeOptions;

mod cli;
use cli::Args;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let opts = match probe_options(&args) {
        Ok(opts) => opts,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::from(2);
        }
    };

    match htping::run(&args.url, opts).await {
        Ok(report) => {
            if report.is_partial() {
                log::warn!("partial report: {}", report.error);
            }
            println!("{}", report.render());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn probe_options(args: &Args) -> Result<ProbeOptions, String> {
    let method = args
        .method
        .parse::<Method>()
        .map_err(|_| format!("invalid method: {}", args.method))?;

    let mut headers = HeaderMap::new();
    if let Some(range) = &args.range {
        let value = HeaderValue::from_str(&format!("bytes={range}"))
            .map_err(|e| format!("invalid range: {e}"))?;
        headers.insert(RANGE, value);
    }
    for raw in &args.headers {
        let (name, value) = raw
            .split_once(':')
            .ok_or_else(|| format!("invalid header (expected `name: value`): {raw}"))?;
        let name = name
            .trim()
            .parse::<HeaderName>()
            .map_err(|e| format!("invalid header name: {e}"))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| format!("invalid header value: {e}"))?;
        headers.insert(name, value);
    }

    Ok(ProbeOptions {
        method,
        headers,
        ping: !args.no_ping,
        local_addr: args.local.clone(),
        server_stats: args.server_stats,
        connect_timeout: Duration::from_secs(args.connect_timeout),
        request_timeout: Duration::from_secs(args.request_timeout),
        ping_timeout: Duration::from_secs(args.ping_timeout),
    })
}
