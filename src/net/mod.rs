pub mod ping;
pub mod tcp_info;
