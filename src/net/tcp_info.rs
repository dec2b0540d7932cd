//! Kernel TCP statistics for a live connection.
//!
//! The kernel-facing side (`TcpStatsProbe`) reads per-connection counters via
//! `getsockopt` (`TCP_INFO` on Linux, `TCP_CONNECTION_INFO` on macOS). The
//! wire-facing side is `TcpStats`, a fixed-layout record a cooperating server
//! can append to a response body. Its encoding is defined field by field in a
//! single byte order rather than as a raw struct dump, because client and
//! server must agree byte-for-byte: there is no endianness negotiation, so a
//! mixed-architecture deployment must run this exact codec on both ends.

use std::io;

use serde::Serialize;

/// Size of the encoded [`TcpStats`] record on the wire.
pub const WIRE_SIZE: usize = 24;

/// Per-connection counters as reported by the kernel.
///
/// One instance is captured from the local socket on every probe; a second
/// may be decoded from the response body when the server supports the
/// statistics sub-protocol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TcpStats {
    /// Smoothed round-trip time, milliseconds.
    pub rtt_ms: u32,
    /// RTT variance, milliseconds.
    pub rtt_var_ms: u32,
    /// Maximum segment size for sends.
    pub snd_mss: u32,
    /// Congestion window, in segments.
    pub snd_cwnd: u32,
    /// Segments sent over the connection's lifetime.
    pub total_packets: u32,
    /// Segments retransmitted over the connection's lifetime.
    pub retransmit_packets: u32,
}

impl TcpStats {
    /// Encode as little-endian `u32`s in declaration order.
    pub fn encode(&self) -> [u8; WIRE_SIZE] {
        let mut out = [0u8; WIRE_SIZE];
        for (chunk, field) in out.chunks_exact_mut(4).zip([
            self.rtt_ms,
            self.rtt_var_ms,
            self.snd_mss,
            self.snd_cwnd,
            self.total_packets,
            self.retransmit_packets,
        ]) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        out
    }

    pub fn decode(raw: &[u8; WIRE_SIZE]) -> Self {
        let field = |i: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&raw[i * 4..i * 4 + 4]);
            u32::from_le_bytes(b)
        };
        Self {
            rtt_ms: field(0),
            rtt_var_ms: field(1),
            snd_mss: field(2),
            snd_cwnd: field(3),
            total_packets: field(4),
            retransmit_packets: field(5),
        }
    }
}

/// Snapshot handle for a connected TCP socket.
///
/// Duplicates the socket's file descriptor at construction time, so the
/// snapshot still works after the HTTP connection driver has taken ownership
/// of the stream. The duplicate shares the underlying socket; the kernel
/// keeps the counters alive until every descriptor is closed.
#[cfg(unix)]
pub struct TcpStatsProbe {
    fd: std::os::fd::OwnedFd,
}

#[cfg(unix)]
impl TcpStatsProbe {
    pub fn new<S: std::os::fd::AsRawFd>(socket: &S) -> io::Result<Self> {
        use std::os::fd::{FromRawFd, OwnedFd};

        let fd = unsafe { libc::dup(socket.as_raw_fd()) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Read the current counters from the kernel.
    pub fn snapshot(&self) -> io::Result<TcpStats> {
        use std::os::fd::AsRawFd;

        sys::tcp_stats(self.fd.as_raw_fd())
    }
}

#[cfg(not(unix))]
pub struct TcpStatsProbe;

#[cfg(not(unix))]
impl TcpStatsProbe {
    pub fn new<S>(_socket: &S) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "TCP statistics are only available on unix platforms",
        ))
    }

    pub fn snapshot(&self) -> io::Result<TcpStats> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "TCP statistics are only available on unix platforms",
        ))
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use super::TcpStats;
    use std::{io, mem};

    /// `struct tcp_info` from the kernel uapi, through `tcpi_segs_in`
    /// (kernel 4.2). Older kernels copy a shorter prefix and the trailing
    /// fields stay zero. Unused fields exist to keep the layout exact.
    #[repr(C)]
    #[derive(Default, Clone, Copy)]
    #[allow(dead_code)]
    struct TcpInfo {
        tcpi_state: u8,
        tcpi_ca_state: u8,
        tcpi_retransmits: u8,
        tcpi_probes: u8,
        tcpi_backoff: u8,
        tcpi_options: u8,
        tcpi_snd_rcv_wscale: u8,
        tcpi_delivery_rate_app_limited: u8,

        tcpi_rto: u32,
        tcpi_ato: u32,
        tcpi_snd_mss: u32,
        tcpi_rcv_mss: u32,

        tcpi_unacked: u32,
        tcpi_sacked: u32,
        tcpi_lost: u32,
        tcpi_retrans: u32,
        tcpi_fackets: u32,

        tcpi_last_data_sent: u32,
        tcpi_last_ack_sent: u32,
        tcpi_last_data_recv: u32,
        tcpi_last_ack_recv: u32,

        tcpi_pmtu: u32,
        tcpi_rcv_ssthresh: u32,
        tcpi_rtt: u32,
        tcpi_rttvar: u32,
        tcpi_snd_ssthresh: u32,
        tcpi_snd_cwnd: u32,
        tcpi_advmss: u32,
        tcpi_reordering: u32,

        tcpi_rcv_rtt: u32,
        tcpi_rcv_space: u32,

        tcpi_total_retrans: u32,

        tcpi_pacing_rate: u64,
        tcpi_max_pacing_rate: u64,
        tcpi_bytes_acked: u64,
        tcpi_bytes_received: u64,
        tcpi_segs_out: u32,
        tcpi_segs_in: u32,
    }

    pub fn tcp_stats(fd: libc::c_int) -> io::Result<TcpStats> {
        let mut info = TcpInfo::default();
        let mut len = mem::size_of::<TcpInfo>() as libc::socklen_t;

        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                &mut info as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(TcpStats {
            // tcpi_rtt / tcpi_rttvar are microseconds
            rtt_ms: info.tcpi_rtt / 1000,
            rtt_var_ms: info.tcpi_rttvar / 1000,
            snd_mss: info.tcpi_snd_mss,
            snd_cwnd: info.tcpi_snd_cwnd,
            total_packets: info.tcpi_segs_out,
            retransmit_packets: info.tcpi_total_retrans,
        })
    }
}

#[cfg(target_os = "macos")]
mod sys {
    use super::TcpStats;
    use std::{io, mem};

    const TCP_CONNECTION_INFO: libc::c_int = 0x106;

    #[repr(C)]
    #[derive(Default, Clone, Copy)]
    #[allow(dead_code)]
    struct TcpConnectionInfo {
        tcpi_state: u8,
        tcpi_snd_wscale: u8,
        tcpi_rcv_wscale: u8,
        __pad1: u8,
        tcpi_options: u32,
        tcpi_flags: u32,
        tcpi_rto: u32,
        tcpi_maxseg: u32,
        tcpi_snd_ssthresh: u32,
        tcpi_snd_cwnd: u32,
        tcpi_snd_wnd: u32,
        tcpi_snd_sbbytes: u32,
        tcpi_rcv_wnd: u32,
        tcpi_rttcur: u32,
        tcpi_srtt: u32,
        tcpi_rttvar: u32,
        tcpi_tfo_cookie_req: u32,
        tcpi_tfo_cookie_rcv: u32,
        tcpi_tfo_syn_loss: u32,
        tcpi_tfo_syn_data_sent: u32,
        tcpi_tfo_syn_data_acked: u32,
        tcpi_tfo_syn_data_rcv: u32,
        tcpi_tfo_cookie_wrong: u32,
        tcpi_tfo_no_cookie_rcv: u32,
        tcpi_tfo_heuristics_disable: u32,
        tcpi_tfo_send_blackhole: u32,
        tcpi_tfo_recv_blackhole: u32,
        tcpi_tfo_onebyte_proxy: u32,
        tcpi_txpackets: u64,
        tcpi_txbytes: u64,
        tcpi_txretransmitbytes: u64,
        tcpi_rxpackets: u64,
        tcpi_rxbytes: u64,
        tcpi_rxoutoforderbytes: u64,
        tcpi_txretransmitpackets: u64,
    }

    pub fn tcp_stats(fd: libc::c_int) -> io::Result<TcpStats> {
        let mut info = TcpConnectionInfo::default();
        let mut len = mem::size_of::<TcpConnectionInfo>() as libc::socklen_t;

        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_TCP,
                TCP_CONNECTION_INFO,
                &mut info as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(TcpStats {
            // tcpi_srtt / tcpi_rttvar are milliseconds on macOS
            rtt_ms: info.tcpi_srtt,
            rtt_var_ms: info.tcpi_rttvar,
            snd_mss: info.tcpi_maxseg,
            snd_cwnd: info.tcpi_snd_cwnd,
            total_packets: info.tcpi_txpackets as u32,
            retransmit_packets: info.tcpi_txretransmitpackets as u32,
        })
    }
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "macos"))))]
mod sys {
    use super::TcpStats;
    use std::io;

    pub fn tcp_stats(_fd: libc::c_int) -> io::Result<TcpStats> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "TCP statistics are not available on this platform",
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let stats = TcpStats {
            rtt_ms: 42,
            rtt_var_ms: 7,
            snd_mss: 1460,
            snd_cwnd: 10,
            total_packets: 1000,
            retransmit_packets: 50,
        };
        let raw = stats.encode();
        assert_eq!(TcpStats::decode(&raw), stats);
    }

    #[test]
    fn wire_layout_is_stable() {
        // Field order and byte order must never drift: the server encodes
        // with the same layout and there is no negotiation.
        let stats = TcpStats {
            rtt_ms: 1,
            rtt_var_ms: 2,
            snd_mss: 3,
            snd_cwnd: 4,
            total_packets: 0x0102_0304,
            retransmit_packets: 6,
        };
        let raw = stats.encode();
        assert_eq!(raw.len(), WIRE_SIZE);
        assert_eq!(&raw[..4], &[1, 0, 0, 0]);
        assert_eq!(&raw[16..20], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&raw[20..24], &[6, 0, 0, 0]);
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn snapshot_on_live_loopback_socket() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let client = std::net::TcpStream::connect(addr).expect("connect");
        let _server = listener.accept().expect("accept");

        let probe = TcpStatsProbe::new(&client).expect("dup fd");
        let stats = probe.snapshot().expect("snapshot");
        assert!(stats.snd_mss > 0);

        // The duplicate must outlive the original stream.
        drop(client);
        probe.snapshot().expect("snapshot after close");
    }
}
