pub mod error;
pub mod report;
pub mod runner;
pub mod transport;
pub mod wire;

pub use error::ProbeError;
pub use report::HttpPingReport;
pub use runner::{ProbeOptions, http_ping, http_ping_with, run};
