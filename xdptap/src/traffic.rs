//! Synthetic ingress for `simulate` mode: builds Ethernet frames and feeds
//! them through the per-frame pipeline from several threads at once, the way
//! a NIC hands packets to one handler per receive queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use xdptap_common::decode::{
    ETH_HDR_LEN, ETH_P_IPV4, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP, IPV4_HDR_LEN, TCP_HDR_LEN,
    UDP_HDR_LEN,
};
use xdptap_common::Frame;

use crate::pipeline::{handle_frame, monotonic_ns, Verdict};
use crate::ring::Producer;

const ETH_P_ARP: u16 = 0x0806;

/// Builds well-formed test and simulation frames.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    bytes: Vec<u8>,
}

impl FrameBuilder {
    pub fn tcp(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16) -> Self {
        let mut tcp = ports(src_port, dst_port, TCP_HDR_LEN);
        tcp[12] = 5 << 4; // data offset
        tcp[13] = 0x02; // SYN
        Self::ipv4(IPPROTO_TCP, src, dst, &tcp)
    }

    pub fn udp(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16) -> Self {
        let mut udp = ports(src_port, dst_port, UDP_HDR_LEN);
        udp[4..6].copy_from_slice(&(UDP_HDR_LEN as u16).to_be_bytes());
        Self::ipv4(IPPROTO_UDP, src, dst, &udp)
    }

    /// ICMP echo request.
    pub fn icmp(src: [u8; 4], dst: [u8; 4]) -> Self {
        Self::ipv4(IPPROTO_ICMP, src, dst, &[8, 0, 0, 0, 0, 1, 0, 1])
    }

    /// ARP request; not IPv4, so it never yields an event.
    pub fn arp() -> Self {
        let mut bytes = ethernet(ETH_P_ARP);
        bytes.extend_from_slice(&[0, 1, 8, 0, 6, 4, 0, 1]);
        bytes.resize(ETH_HDR_LEN + 28, 0);
        Self { bytes }
    }

    /// IPv4 header with `proto` followed by `payload`.
    pub fn ipv4(proto: u8, src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Self {
        let mut bytes = ethernet(ETH_P_IPV4);
        let mut ip = [0u8; IPV4_HDR_LEN];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&((IPV4_HDR_LEN + payload.len()) as u16).to_be_bytes());
        ip[8] = 64;
        ip[9] = proto;
        ip[12..16].copy_from_slice(&src);
        ip[16..20].copy_from_slice(&dst);
        bytes.extend_from_slice(&ip);
        bytes.extend_from_slice(payload);
        Self { bytes }
    }

    /// Zero-pad up to `len` bytes, like a NIC padding to the Ethernet minimum.
    pub fn pad_to(mut self, len: usize) -> Self {
        if self.bytes.len() < len {
            self.bytes.resize(len, 0);
        }
        self
    }

    /// Cut the frame to `len` bytes, as a short capture would.
    pub fn truncate(mut self, len: usize) -> Self {
        self.bytes.truncate(len);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

fn ethernet(ether_type: u16) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(64);
    bytes.extend_from_slice(&[0xff; 6]);
    bytes.extend_from_slice(&[0x02, 0x00, 0x5e, 0x00, 0x00, 0x01]);
    bytes.extend_from_slice(&ether_type.to_be_bytes());
    bytes
}

fn ports(src: u16, dst: u16, len: usize) -> Vec<u8> {
    let mut hdr = vec![0u8; len];
    hdr[0..2].copy_from_slice(&src.to_be_bytes());
    hdr[2..4].copy_from_slice(&dst.to_be_bytes());
    hdr
}

/// The `seq`-th frame seen by simulated receive queue `worker`.
///
/// Half TCP, a quarter UDP, the rest split between ICMP, ARP and TCP frames
/// cut short inside the transport header.
pub fn synth_frame(worker: u32, seq: u64) -> Vec<u8> {
    let host = (seq % 250) as u8 + 1;
    let src = [10, 0, worker as u8, host];
    let dst = [192, 168, 1, (seq % 7) as u8 + 10];
    let ephemeral = 32768 + (seq % 28000) as u16;

    let frame = match seq % 8 {
        0..=3 => {
            let service = [80, 443, 22, 5432][(seq % 4) as usize];
            FrameBuilder::tcp(src, dst, ephemeral, service)
        }
        4 | 5 => FrameBuilder::udp(src, [8, 8, 8, 8], ephemeral, 53),
        6 => FrameBuilder::icmp(src, dst),
        _ if seq % 16 == 7 => FrameBuilder::arp(),
        // Not padded: padding would complete the TCP header again.
        _ => {
            return FrameBuilder::tcp(src, dst, ephemeral, 443)
                .truncate(ETH_HDR_LEN + IPV4_HDR_LEN + TCP_HDR_LEN / 2)
                .build()
        }
    };
    frame.pad_to(60).build()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub frames: u64,
    pub passed: u64,
}

/// Feed `frames` synthetic frames (0 = until `running` clears) through the
/// pipeline, one every `interval`.
pub fn run_worker(
    worker: u32,
    ifindex: u32,
    frames: u64,
    interval: Duration,
    events: Producer,
    running: Arc<AtomicBool>,
) -> WorkerReport {
    let mut report = WorkerReport::default();
    while running.load(Ordering::Relaxed) && (frames == 0 || report.frames < frames) {
        let bytes = synth_frame(worker, report.frames);
        let frame = Frame::new(&bytes, ifindex, monotonic_ns());
        if handle_frame(&frame, &events) == Verdict::Pass {
            report.passed += 1;
        }
        report.frames += 1;
        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }
    tracing::debug!(worker, frames = report.frames, "ingress worker finished");
    report
}
