#![cfg_attr(not(test), no_std)]

use core::net::Ipv4Addr;

pub mod decode;

pub use decode::{decode, parse_headers, Frame, ParsedHeaders};

/// One parsed frame, as handed from a producer (the XDP program or the
/// user-space pipeline) to the telemetry consumer through a ring buffer.
///
/// This is the binary contract between producer and consumer: field order,
/// sizes and offsets must not change.  Integers are in host byte order except
/// the two addresses, which hold the wire bytes unchanged, and `eth_proto`,
/// which is the raw big-endian Ethernet type.
///
/// | field     | offset | size |
/// |-----------|--------|------|
/// | timestamp | 0      | 8    |
/// | ifindex   | 8      | 4    |
/// | protocol  | 12     | 4    |
/// | src_ip    | 16     | 4    |
/// | dst_ip    | 20     | 4    |
/// | src_port  | 24     | 2    |
/// | dst_port  | 26     | 2    |
/// | pkt_len   | 28     | 4    |
/// | eth_proto | 32     | 2    |
/// | _pad      | 34     | 6    |
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct XdpEvent {
    /// Monotonic arrival time in nanoseconds.
    pub timestamp: u64,
    /// Ingress interface index.
    pub ifindex: u32,
    /// IP protocol number (6 = TCP, 17 = UDP), 0 for non-IPv4.
    pub protocol: u32,
    /// Source IPv4 address in network byte order.
    pub src_ip: u32,
    /// Destination IPv4 address in network byte order.
    pub dst_ip: u32,
    /// Source port in host byte order, 0 when the protocol has none.
    pub src_port: u16,
    /// Destination port in host byte order, 0 when the protocol has none.
    pub dst_port: u16,
    /// Total frame length in bytes.
    pub pkt_len: u32,
    /// Ethernet type exactly as it appears on the wire.
    pub eth_proto: [u8; 2],
    /// Always zero.
    pub _pad: [u8; 6],
}

/// Size of one encoded [`XdpEvent`].
pub const RECORD_SIZE: usize = core::mem::size_of::<XdpEvent>();

const _: () = assert!(RECORD_SIZE == 40);

/// Byte size of the `EVENTS` ring the XDP program writes to, also the
/// default capacity of the user-space ring.
pub const EVENTS_RING_BYTES: u32 = 8192;

const _: () = assert!(EVENTS_RING_BYTES.is_power_of_two());

/// Entries in the `DROPPED` per-CPU array: a single counter of events the
/// XDP program could not reserve ring space for.
pub const DROPPED_ENTRIES: u32 = 1;

impl XdpEvent {
    /// Encode into the fixed wire layout.
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.timestamp.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.ifindex.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.protocol.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.src_ip.to_ne_bytes());
        buf[20..24].copy_from_slice(&self.dst_ip.to_ne_bytes());
        buf[24..26].copy_from_slice(&self.src_port.to_ne_bytes());
        buf[26..28].copy_from_slice(&self.dst_port.to_ne_bytes());
        buf[28..32].copy_from_slice(&self.pkt_len.to_ne_bytes());
        buf[32..34].copy_from_slice(&self.eth_proto);
        buf
    }

    /// Decode a record produced by [`XdpEvent::to_bytes`] or by the kernel
    /// program.  Returns `None` if `buf` is shorter than [`RECORD_SIZE`];
    /// trailing bytes are ignored.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        let buf: &[u8; RECORD_SIZE] = buf.get(..RECORD_SIZE)?.try_into().ok()?;
        Some(Self {
            timestamp: u64::from_ne_bytes(field(buf, 0)),
            ifindex: u32::from_ne_bytes(field(buf, 8)),
            protocol: u32::from_ne_bytes(field(buf, 12)),
            src_ip: u32::from_ne_bytes(field(buf, 16)),
            dst_ip: u32::from_ne_bytes(field(buf, 20)),
            src_port: u16::from_ne_bytes(field(buf, 24)),
            dst_port: u16::from_ne_bytes(field(buf, 26)),
            pkt_len: u32::from_ne_bytes(field(buf, 28)),
            eth_proto: field(buf, 32),
            _pad: [0; 6],
        })
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_ip.to_ne_bytes())
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_ip.to_ne_bytes())
    }

    /// Ethernet type in host order.
    pub fn ether_type(&self) -> u16 {
        u16::from_be_bytes(self.eth_proto)
    }
}

fn field<const N: usize>(buf: &[u8; RECORD_SIZE], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[offset..offset + N]);
    out
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for XdpEvent {}
