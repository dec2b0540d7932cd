//! ICMP hop-count probe.
//!
//! Sends exactly one echo request and converts the reply's TTL into a hop
//! estimate. The probe runs concurrently with the HTTP exchange and its
//! failures are reported separately; they never abort the main measurement.

use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpPacket, IcmpTypes, checksum};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

const ICMP_HEADER_SIZE: usize = 8;
const PAYLOAD_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum PingError {
    #[error("icmp socket: {0}")]
    Socket(#[source] io::Error),
    #[error("no echo reply within {0:?}")]
    Timeout(Duration),
    #[error("hop estimation over IPv6 is not supported")]
    Ipv6Unsupported,
}

/// Estimate the hop count from an observed reply TTL.
///
/// Senders start from a handful of common initial TTLs (64 on most unixes,
/// 128 on Windows, 255 on some network gear), so the distance is the gap to
/// the next bucket boundary. The final branch is a defensive catch-all.
pub fn hops_from_ttl(ttl: u32) -> u32 {
    if ttl <= 64 {
        64 - ttl
    } else if ttl <= 128 {
        128 - ttl
    } else if ttl <= 256 {
        256 - ttl
    } else {
        512_u32.saturating_sub(ttl)
    }
}

/// Send one echo request to `target` and return the estimated hop count.
///
/// The blocking socket work runs on the blocking pool so the caller's async
/// pipeline is never stalled; the overall wait is bounded by `timeout`.
pub async fn probe_hops(
    target: IpAddr,
    source: Option<IpAddr>,
    timeout: Duration,
) -> Result<u32, PingError> {
    let IpAddr::V4(dst) = target else {
        return Err(PingError::Ipv6Unsupported);
    };
    let src = match source {
        Some(IpAddr::V4(s)) => Some(s),
        _ => None,
    };
    tokio::task::spawn_blocking(move || ping_once(dst, src, timeout))
        .await
        .map_err(|e| PingError::Socket(io::Error::other(e)))?
}

fn ping_once(dst: Ipv4Addr, src: Option<Ipv4Addr>, timeout: Duration) -> Result<u32, PingError> {
    let socket =
        Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).map_err(PingError::Socket)?;
    if let Some(src) = src {
        socket
            .bind(&SocketAddr::new(src.into(), 0).into())
            .map_err(PingError::Socket)?;
    }

    let identifier = std::process::id() as u16;
    let sequence = 1u16;
    let request = build_echo_request(identifier, sequence);
    socket
        .send_to(&request, &SocketAddr::new(dst.into(), 0).into())
        .map_err(PingError::Socket)?;

    let deadline = Instant::now() + timeout;
    let mut buf = [MaybeUninit::<u8>::uninit(); 512];
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(PingError::Timeout(timeout))?;
        socket
            .set_read_timeout(Some(receive_window(remaining)))
            .map_err(PingError::Socket)?;

        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Err(PingError::Timeout(timeout));
            }
            Err(e) => return Err(PingError::Socket(e)),
        };

        // recv initialized the first n bytes
        let data = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, n) };
        if let Some(ttl) = match_echo_reply(data, identifier, sequence) {
            return Ok(hops_from_ttl(u32::from(ttl)));
        }
        // Not our reply (raw sockets see all ICMP traffic); keep waiting.
    }
}

/// Clamp the remaining wait to the socket timeout's granularity.
///
/// SO_RCVTIMEO treats zero as "block forever", so a remainder that rounds
/// down to nothing must still set a positive timeout or the receive loop
/// could hang past its deadline on a stray ICMP packet.
fn receive_window(remaining: Duration) -> Duration {
    remaining.max(Duration::from_millis(1))
}

fn build_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + PAYLOAD_SIZE];
    {
        let mut packet =
            MutableEchoRequestPacket::new(&mut buffer).expect("buffer sized for echo request");
        packet.set_icmp_type(IcmpTypes::EchoRequest);
        packet.set_icmp_code(IcmpCode::new(0));
        packet.set_identifier(identifier);
        packet.set_sequence_number(sequence);
    }
    for (i, byte) in buffer[ICMP_HEADER_SIZE..].iter_mut().enumerate() {
        *byte = (i & 0xff) as u8;
    }
    let cksum = checksum(&IcmpPacket::new(&buffer).expect("buffer holds icmp packet"));
    let mut packet =
        MutableEchoRequestPacket::new(&mut buffer).expect("buffer sized for echo request");
    packet.set_checksum(cksum);
    buffer
}

/// Extract the IP-header TTL if `data` is the echo reply we sent for.
///
/// A raw ICMP socket delivers the full IP datagram, so the ICMP message
/// starts after the variable-length IP header.
fn match_echo_reply(data: &[u8], identifier: u16, sequence: u16) -> Option<u8> {
    if data.len() < 20 {
        return None;
    }
    let header_len = usize::from(data[0] & 0x0f) * 4;
    let ttl = data[8];
    let reply = EchoReplyPacket::new(data.get(header_len..)?)?;
    if reply.get_icmp_type() != IcmpTypes::EchoReply
        || reply.get_identifier() != identifier
        || reply.get_sequence_number() != sequence
    {
        return None;
    }
    Some(ttl)
}
