#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::xdp_action::XDP_PASS,
    helpers::bpf_ktime_get_ns,
    macros::{map, xdp},
    maps::{PerCpuArray, RingBuf},
    programs::XdpContext,
};
use core::ptr;
use network_types::{
    eth::{EthHdr, EtherType},
    ip::{IpProto, Ipv4Hdr},
    tcp::TcpHdr,
    udp::UdpHdr,
};
use xdptap_common::{XdpEvent, DROPPED_ENTRIES, EVENTS_RING_BYTES};

#[no_mangle]
#[link_section = "license"]
pub static _license: [u8; 4] = *b"GPL\0";

#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(EVENTS_RING_BYTES, 0);

/// Events lost because `EVENTS` had no room, per CPU.
#[map]
static DROPPED: PerCpuArray<u64> = PerCpuArray::with_max_entries(DROPPED_ENTRIES, 0);

/// XDP entry point.  Every path returns `XDP_PASS`: parsing failures and a
/// full ring only mean the frame goes unreported.
///
/// Struct writes are done field-by-field to avoid compiler-generated
/// `memcpy` / `memset` calls landing in the `.text` section.
#[xdp]
pub fn xdptap(ctx: XdpContext) -> u32 {
    // -- Ethernet ----------------------------------------------------------
    let data = ctx.data();
    let data_end = ctx.data_end();

    let eth_end = data + EthHdr::LEN;
    if eth_end > data_end {
        return XDP_PASS;
    }
    // Raw integers, not the enums: wire values outside the enum are common.
    let eth_hdr = data as *const EthHdr;
    let ether_type =
        unsafe { ptr::read_unaligned(ptr::addr_of!((*eth_hdr).ether_type) as *const u16) };
    if ether_type != EtherType::Ipv4 as u16 {
        return XDP_PASS;
    }

    // -- IPv4 --------------------------------------------------------------
    let ip_start = eth_end;
    if ip_start + Ipv4Hdr::LEN > data_end {
        return XDP_PASS;
    }
    let ip_hdr = ip_start as *const Ipv4Hdr;
    let version_ihl = unsafe { ptr::read_unaligned(ip_start as *const u8) };
    let proto = unsafe { ptr::read_unaligned(ptr::addr_of!((*ip_hdr).proto) as *const u8) };
    // Addresses stay in network byte order.
    let src_addr = unsafe { ptr::read_unaligned(ptr::addr_of!((*ip_hdr).src_addr)) };
    let dst_addr = unsafe { ptr::read_unaligned(ptr::addr_of!((*ip_hdr).dst_addr)) };

    // -- Transport ---------------------------------------------------------
    let transport_start = ip_start + ((version_ihl & 0x0f) as usize) * 4;
    let (src_port, dst_port) = match proto {
        p if p == IpProto::Tcp as u8 => {
            if transport_start + TcpHdr::LEN > data_end {
                return XDP_PASS;
            }
            let tcp_hdr = transport_start as *const TcpHdr;
            (
                u16::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*tcp_hdr).source)) }),
                u16::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*tcp_hdr).dest)) }),
            )
        }
        p if p == IpProto::Udp as u8 => {
            if transport_start + UdpHdr::LEN > data_end {
                return XDP_PASS;
            }
            let udp_hdr = transport_start as *const UdpHdr;
            (
                u16::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*udp_hdr).source)) }),
                u16::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*udp_hdr).dest)) }),
            )
        }
        _ => (0, 0),
    };

    // -- Emit event --------------------------------------------------------
    // Ring memory is not zeroed, so every field including padding is written.
    if let Some(mut buf) = EVENTS.reserve::<XdpEvent>(0) {
        let p = buf.as_mut_ptr();
        let ifindex = unsafe { (*ctx.ctx).ingress_ifindex };
        let timestamp = unsafe { bpf_ktime_get_ns() };
        unsafe {
            ptr::write(ptr::addr_of_mut!((*p).timestamp), timestamp);
            ptr::write(ptr::addr_of_mut!((*p).ifindex), ifindex);
            ptr::write(ptr::addr_of_mut!((*p).protocol), proto as u32);
            ptr::write(ptr::addr_of_mut!((*p).src_ip), src_addr);
            ptr::write(ptr::addr_of_mut!((*p).dst_ip), dst_addr);
            ptr::write(ptr::addr_of_mut!((*p).src_port), src_port);
            ptr::write(ptr::addr_of_mut!((*p).dst_port), dst_port);
            ptr::write(ptr::addr_of_mut!((*p).pkt_len), (data_end - data) as u32);
            ptr::write(ptr::addr_of_mut!((*p).eth_proto), ether_type.to_ne_bytes());
            ptr::write(ptr::addr_of_mut!((*p)._pad), [0u8; 6]);
        }
        buf.submit(0);
    } else if let Some(dropped) = DROPPED.get_ptr_mut(0) {
        // Per-CPU slot: no other context updates it concurrently.
        unsafe { *dropped += 1 };
    }

    XDP_PASS
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
