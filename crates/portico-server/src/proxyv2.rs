//! PROXY-protocol v2 adapter.
//!
//! An upstream load balancer prepends the binary v2 header to each DoT
//! connection to convey the original client address. The adapter buffers
//! until the header is complete (it need not arrive in the first segment),
//! parses it, forwards any trailing bytes, and then splices the client
//! socket to the local DoT listener. After the splice the adapter is out of
//! the data path entirely.
//!
//! Wire format: 12-byte signature, version/command byte, family/transport
//! byte, 2-byte address length, then the address block.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::tracker::ConnGuard;

/// PROXY protocol v2 signature.
const SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Fixed prologue: signature + version/command + family + address length.
const PROLOGUE_LEN: usize = 16;

/// Largest possible v2 header (the address length field is 16-bit).
pub const MAX_HEADER_LEN: usize = PROLOGUE_LEN + u16::MAX as usize;

const CMD_LOCAL: u8 = 0x20;
const CMD_PROXY: u8 = 0x21;

const FAM_UNSPEC: u8 = 0x00;
const FAM_TCP4: u8 = 0x11;
const FAM_TCP6: u8 = 0x21;

/// Header violation; both sockets must be closed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProxyError {
    #[error("missing PROXYv2 signature")]
    BadSignature,

    #[error("unsupported PROXYv2 version/command {0:#04x}")]
    BadCommand(u8),

    #[error("unsupported PROXYv2 address family {0:#04x}")]
    BadFamily(u8),

    #[error("PROXYv2 address block truncated")]
    ShortAddressBlock,

    #[error("PROXYv2 header exceeds maximum size")]
    Oversized,
}

/// Parsed v2 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Original client address; `None` for LOCAL or UNSPEC headers.
    pub source: Option<SocketAddr>,
    /// Address the client dialled; `None` for LOCAL or UNSPEC headers.
    pub destination: Option<SocketAddr>,
    /// Total header length in bytes.
    pub len: usize,
}

/// Outcome of an incremental parse attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum HeaderStatus {
    /// The buffer does not yet hold the whole header.
    NeedMore,
    /// Header parsed; bytes past `header.len` belong to the spliced stream.
    Complete(ProxyHeader),
}

/// Attempts to parse a v2 header from the front of `data`.
pub fn parse_header(data: &[u8]) -> Result<HeaderStatus, ProxyError> {
    if data.len() < PROLOGUE_LEN {
        // Reject early once the signature can no longer match.
        let check = std::cmp::min(data.len(), SIGNATURE.len());
        if data[..check] != SIGNATURE[..check] {
            return Err(ProxyError::BadSignature);
        }
        return Ok(HeaderStatus::NeedMore);
    }

    if data[..12] != SIGNATURE {
        return Err(ProxyError::BadSignature);
    }

    let ver_cmd = data[12];
    if ver_cmd != CMD_PROXY && ver_cmd != CMD_LOCAL {
        return Err(ProxyError::BadCommand(ver_cmd));
    }

    let family = data[13];
    let addr_len = u16::from_be_bytes([data[14], data[15]]) as usize;
    let total = PROLOGUE_LEN + addr_len;

    if data.len() < total {
        return Ok(HeaderStatus::NeedMore);
    }

    let addrs = &data[PROLOGUE_LEN..total];
    let (source, destination) = match (ver_cmd, family) {
        (CMD_LOCAL, _) | (_, FAM_UNSPEC) => (None, None),
        (_, FAM_TCP4) => {
            if addr_len < 12 {
                return Err(ProxyError::ShortAddressBlock);
            }
            let src_ip = Ipv4Addr::new(addrs[0], addrs[1], addrs[2], addrs[3]);
            let dst_ip = Ipv4Addr::new(addrs[4], addrs[5], addrs[6], addrs[7]);
            let src_port = u16::from_be_bytes([addrs[8], addrs[9]]);
            let dst_port = u16::from_be_bytes([addrs[10], addrs[11]]);
            (
                Some(SocketAddr::new(IpAddr::V4(src_ip), src_port)),
                Some(SocketAddr::new(IpAddr::V4(dst_ip), dst_port)),
            )
        }
        (_, FAM_TCP6) => {
            if addr_len < 36 {
                return Err(ProxyError::ShortAddressBlock);
            }
            let src_octets: [u8; 16] = addrs[..16].try_into().unwrap_or_else(|_| unreachable!());
            let dst_octets: [u8; 16] = addrs[16..32].try_into().unwrap_or_else(|_| unreachable!());
            let src_port = u16::from_be_bytes([addrs[32], addrs[33]]);
            let dst_port = u16::from_be_bytes([addrs[34], addrs[35]]);
            (
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src_octets)), src_port)),
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst_octets)), dst_port)),
            )
        }
        (_, other) => return Err(ProxyError::BadFamily(other)),
    };

    Ok(HeaderStatus::Complete(ProxyHeader {
        source,
        destination,
        len: total,
    }))
}

/// Serves one proxied connection: header parse, then splice.
///
/// The connection moves through exactly one transition, from awaiting the
/// header to spliced; once spliced, bytes flow between client and the DoT
/// backend without further inspection. Any failure closes both sockets
/// (both are dropped on return).
pub async fn serve(
    mut client: TcpStream,
    peer: SocketAddr,
    backend: SocketAddr,
    io_timeout: Duration,
    guard: ConnGuard,
) -> std::io::Result<()> {
    let mut upstream = timeout(io_timeout, TcpStream::connect(backend))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "backend dial timed out"))??;

    // AwaitHeader: buffer until the v2 header is complete.
    let mut buf = Vec::with_capacity(256);
    let header = loop {
        match parse_header(&buf) {
            Ok(HeaderStatus::Complete(header)) => break header,
            Ok(HeaderStatus::NeedMore) => {
                if buf.len() >= MAX_HEADER_LEN {
                    return Err(proto_err(ProxyError::Oversized));
                }
            }
            Err(e) => return Err(proto_err(e)),
        }

        let mut chunk = [0u8; 1024];
        let n = tokio::select! {
            read = timeout(io_timeout, tokio::io::AsyncReadExt::read(&mut client, &mut chunk)) => {
                read.map_err(|_| std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "header read timed out",
                ))??
            }
            _ = guard.killed() => return Ok(()),
        };
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before PROXYv2 header",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    trace!(
        client = %peer,
        source = ?header.source,
        "PROXYv2 header parsed"
    );

    // Bytes past the header already belong to the TLS stream.
    if buf.len() > header.len {
        upstream.write_all(&buf[header.len..]).await?;
    }

    // Spliced: full-duplex pipe until either side closes or drain kills us.
    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut client, &mut upstream) => {
            let (up, down) = result?;
            debug!(client = %peer, up, down, "PROXYv2 splice finished");
        }
        _ = guard.killed() => {
            debug!(client = %peer, "PROXYv2 splice force-closed");
        }
    }

    Ok(())
}

fn proto_err(e: ProxyError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_header(src: &str, dst: &str) -> Vec<u8> {
        let src: SocketAddr = src.parse().unwrap();
        let dst: SocketAddr = dst.parse().unwrap();
        let mut out = Vec::new();
        out.extend_from_slice(&SIGNATURE);
        out.push(CMD_PROXY);
        out.push(FAM_TCP4);
        out.extend_from_slice(&12u16.to_be_bytes());
        match (src.ip(), dst.ip()) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                out.extend_from_slice(&s.octets());
                out.extend_from_slice(&d.octets());
            }
            _ => unreachable!(),
        }
        out.extend_from_slice(&src.port().to_be_bytes());
        out.extend_from_slice(&dst.port().to_be_bytes());
        out
    }

    #[test]
    fn test_parse_v4() {
        let wire = v4_header("192.0.2.1:5353", "198.51.100.2:853");
        let status = parse_header(&wire).unwrap();
        match status {
            HeaderStatus::Complete(h) => {
                assert_eq!(h.len, 28);
                assert_eq!(h.source.unwrap(), "192.0.2.1:5353".parse::<SocketAddr>().unwrap());
                assert_eq!(
                    h.destination.unwrap(),
                    "198.51.100.2:853".parse::<SocketAddr>().unwrap()
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_v6() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&SIGNATURE);
        wire.push(CMD_PROXY);
        wire.push(FAM_TCP6);
        wire.extend_from_slice(&36u16.to_be_bytes());
        wire.extend_from_slice(&"2001:db8::1".parse::<Ipv6Addr>().unwrap().octets());
        wire.extend_from_slice(&"2001:db8::2".parse::<Ipv6Addr>().unwrap().octets());
        wire.extend_from_slice(&1234u16.to_be_bytes());
        wire.extend_from_slice(&853u16.to_be_bytes());

        match parse_header(&wire).unwrap() {
            HeaderStatus::Complete(h) => {
                assert_eq!(h.len, 52);
                assert_eq!(
                    h.source.unwrap(),
                    "[2001:db8::1]:1234".parse::<SocketAddr>().unwrap()
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_incremental_parse() {
        // The header may arrive split across segments.
        let wire = v4_header("192.0.2.1:5353", "198.51.100.2:853");
        for cut in 0..wire.len() {
            let status = parse_header(&wire[..cut]).unwrap();
            assert_eq!(status, HeaderStatus::NeedMore, "cut={cut}");
        }
        assert!(matches!(
            parse_header(&wire).unwrap(),
            HeaderStatus::Complete(_)
        ));
    }

    #[test]
    fn test_trailing_bytes_ignored_by_parser() {
        let mut wire = v4_header("192.0.2.1:5353", "198.51.100.2:853");
        wire.extend_from_slice(&[0x16, 0x03, 0x01]); // TLS record start
        match parse_header(&wire).unwrap() {
            HeaderStatus::Complete(h) => assert_eq!(h.len, 28),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_bad_signature_rejected_early() {
        // A wrong first byte fails before the full prologue arrives.
        assert_eq!(parse_header(&[0x16]).unwrap_err(), ProxyError::BadSignature);

        let mut wire = v4_header("192.0.2.1:1", "198.51.100.2:853");
        wire[0] = 0x00;
        assert_eq!(parse_header(&wire).unwrap_err(), ProxyError::BadSignature);
    }

    #[test]
    fn test_local_command_has_no_addresses() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&SIGNATURE);
        wire.push(CMD_LOCAL);
        wire.push(FAM_UNSPEC);
        wire.extend_from_slice(&0u16.to_be_bytes());

        match parse_header(&wire).unwrap() {
            HeaderStatus::Complete(h) => {
                assert_eq!(h.len, 16);
                assert!(h.source.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_bad_command_and_family() {
        let mut wire = v4_header("192.0.2.1:1", "198.51.100.2:2");
        wire[12] = 0x31; // version 3
        assert_eq!(parse_header(&wire).unwrap_err(), ProxyError::BadCommand(0x31));

        let mut wire = v4_header("192.0.2.1:1", "198.51.100.2:2");
        wire[13] = 0x41; // AF_UNIX stream
        assert_eq!(parse_header(&wire).unwrap_err(), ProxyError::BadFamily(0x41));
    }

    #[test]
    fn test_short_address_block() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&SIGNATURE);
        wire.push(CMD_PROXY);
        wire.push(FAM_TCP4);
        wire.extend_from_slice(&4u16.to_be_bytes());
        wire.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(
            parse_header(&wire).unwrap_err(),
            ProxyError::ShortAddressBlock
        );
    }
}
