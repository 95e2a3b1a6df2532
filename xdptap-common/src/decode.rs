//! Bounds-checked Ethernet / IPv4 / TCP / UDP header decoding.
//!
//! Every stage checks that the whole header it is about to read lies inside
//! the frame.  A frame that fails any check simply produces no event; the
//! decoder never signals an error and never influences forwarding.

use crate::XdpEvent;

pub const ETH_HDR_LEN: usize = 14;
pub const IPV4_HDR_LEN: usize = 20;
pub const TCP_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;

pub const ETH_P_IPV4: u16 = 0x0800;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// A received frame and its arrival metadata.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub data: &'a [u8],
    /// Ingress interface index.
    pub ifindex: u32,
    /// Monotonic arrival time in nanoseconds.
    pub timestamp: u64,
}

impl<'a> Frame<'a> {
    pub fn new(data: &'a [u8], ifindex: u32, timestamp: u64) -> Self {
        Self {
            data,
            ifindex,
            timestamp,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Fields extracted from an Ethernet + IPv4 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedHeaders {
    /// Raw big-endian Ethernet type.
    pub eth_proto: [u8; 2],
    pub protocol: u8,
    /// Network byte order.
    pub src_ip: u32,
    /// Network byte order.
    pub dst_ip: u32,
    /// Host order, 0 unless TCP or UDP.
    pub src_port: u16,
    /// Host order, 0 unless TCP or UDP.
    pub dst_port: u16,
}

/// Borrow the `len` bytes starting at `offset`, or `None` if any of them
/// would lie past the end of the frame.
#[inline(always)]
fn header(data: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    let end = offset.checked_add(len)?;
    data.get(offset..end)
}

/// Source and destination port of a TCP or UDP header; both start with the
/// same two 16-bit big-endian fields.
#[inline(always)]
fn ports(hdr: &[u8]) -> (u16, u16) {
    (
        u16::from_be_bytes([hdr[0], hdr[1]]),
        u16::from_be_bytes([hdr[2], hdr[3]]),
    )
}

/// Walk the header chain of `data`.
///
/// Returns `None` for frames that are not Ethernet + IPv4, or whose IPv4 or
/// TCP/UDP header is truncated.  A truncated transport header drops the whole
/// frame rather than yielding an IPv4-only result.  Protocols other than TCP
/// and UDP yield zero ports.
pub fn parse_headers(data: &[u8]) -> Option<ParsedHeaders> {
    // -- Ethernet ----------------------------------------------------------
    let eth = header(data, 0, ETH_HDR_LEN)?;
    let eth_proto = [eth[12], eth[13]];
    if u16::from_be_bytes(eth_proto) != ETH_P_IPV4 {
        return None;
    }

    // -- IPv4 --------------------------------------------------------------
    let ip = header(data, ETH_HDR_LEN, IPV4_HDR_LEN)?;
    let ihl = usize::from(ip[0] & 0x0f);
    let protocol = ip[9];
    let src_ip = u32::from_ne_bytes([ip[12], ip[13], ip[14], ip[15]]);
    let dst_ip = u32::from_ne_bytes([ip[16], ip[17], ip[18], ip[19]]);

    // -- Transport ---------------------------------------------------------
    let transport = ETH_HDR_LEN + ihl * 4;
    let (src_port, dst_port) = match protocol {
        IPPROTO_TCP => ports(header(data, transport, TCP_HDR_LEN)?),
        IPPROTO_UDP => ports(header(data, transport, UDP_HDR_LEN)?),
        _ => (0, 0),
    };

    Some(ParsedHeaders {
        eth_proto,
        protocol,
        src_ip,
        dst_ip,
        src_port,
        dst_port,
    })
}

/// Decode `frame` into a telemetry event, or `None` if it carries nothing
/// worth reporting.
pub fn decode(frame: &Frame<'_>) -> Option<XdpEvent> {
    let hdrs = parse_headers(frame.data)?;
    Some(XdpEvent {
        timestamp: frame.timestamp,
        ifindex: frame.ifindex,
        protocol: u32::from(hdrs.protocol),
        src_ip: hdrs.src_ip,
        dst_ip: hdrs.dst_ip,
        src_port: hdrs.src_port,
        dst_port: hdrs.dst_port,
        pkt_len: u32::try_from(frame.len()).unwrap_or(u32::MAX),
        eth_proto: hdrs.eth_proto,
        _pad: [0; 6],
    })
}
