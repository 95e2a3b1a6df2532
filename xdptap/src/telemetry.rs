//! Consumer side: drains event records from a ring, logs them, folds them
//! into [`TrafficState`] and fans them out to `/api/stream` subscribers.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Duration;

use aya::maps::{MapData, PerCpuArray, RingBuf};
use xdptap_common::XdpEvent;

use crate::ring::Consumer;
use crate::state::TrafficState;

/// An [`XdpEvent`] decoded for humans and JSON consumers.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    /// Monotonic arrival time (ns) taken by the producer.
    pub timestamp: u64,
    /// Wall-clock time (ms since the Unix epoch) the consumer saw the event.
    pub received_at: i64,
    pub ifindex: u32,
    pub protocol: String,
    pub protocol_number: u32,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub pkt_len: u32,
    pub eth_proto: String,
}

impl EventRecord {
    pub fn from_event(event: &XdpEvent) -> Self {
        Self {
            timestamp: event.timestamp,
            received_at: chrono::Utc::now().timestamp_millis(),
            ifindex: event.ifindex,
            protocol: protocol_name(event.protocol),
            protocol_number: event.protocol,
            src_ip: event.src_addr().to_string(),
            dst_ip: event.dst_addr().to_string(),
            src_port: event.src_port,
            dst_port: event.dst_port,
            pkt_len: event.pkt_len,
            eth_proto: format!("0x{:04x}", event.ether_type()),
        }
    }

    pub fn flow_key(&self) -> String {
        format!(
            "{}:{} -> {}:{}/{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.protocol
        )
    }
}

pub fn protocol_name(protocol: u32) -> String {
    match protocol {
        1 => "ICMP".to_string(),
        6 => "TCP".to_string(),
        17 => "UDP".to_string(),
        other => format!("IP({})", other),
    }
}

/// Message pushed to WebSocket subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: EventRecord,
}

/// Shared handle the drain loops report into.
#[derive(Clone)]
pub struct Telemetry {
    state: Arc<TrafficState>,
    stream: broadcast::Sender<StreamMessage>,
}

impl Telemetry {
    pub fn new(state: Arc<TrafficState>, stream: broadcast::Sender<StreamMessage>) -> Self {
        Self { state, stream }
    }

    pub fn record(&self, event: &XdpEvent) {
        let record = EventRecord::from_event(event);
        tracing::debug!(
            "IPv4 packet: {}:{} -> {}:{} ({}, {} bytes)",
            record.src_ip,
            record.src_port,
            record.dst_ip,
            record.dst_port,
            record.protocol,
            record.pkt_len
        );
        self.state.update(&record);
        // No subscribers is the common case.
        let _ = self.stream.send(StreamMessage {
            kind: "network_event",
            data: record,
        });
    }

    fn report_dropped(&self, total: u64) {
        let new = self.state.set_dropped(total);
        if new > 0 {
            tracing::warn!("event ring full: dropped {} events ({} total)", new, total);
        }
    }

    /// Report the kernel drop counter, given one value per CPU.
    fn report_dropped_per_cpu(&self, per_cpu: &[u64]) {
        self.report_dropped(sum_per_cpu(per_cpu));
    }
}

fn sum_per_cpu(values: &[u64]) -> u64 {
    values.iter().fold(0u64, |acc, v| acc.saturating_add(*v))
}

/// Drain the user-space ring until `running` clears and every reserved
/// record has been consumed.  Returns the number of events drained.
pub async fn drain_user_ring(
    mut consumer: Consumer,
    telemetry: Telemetry,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
) -> u64 {
    let mut drained = 0u64;
    loop {
        while let Some(event) = consumer.poll() {
            telemetry.record(&event);
            drained += 1;
        }
        telemetry.report_dropped(consumer.dropped());

        if !running.load(Ordering::Acquire) && consumer.pending_bytes() == 0 {
            break;
        }
        // Yield briefly to avoid busy-spinning when the ring is empty.
        tokio::time::sleep(poll_interval).await;
    }
    tracing::debug!("user-space ring drained, {} events", drained);
    drained
}

/// Continuously poll the kernel `EVENTS` ring buffer filled by the XDP
/// program, along with its `DROPPED` counter.
pub async fn drain_kernel_ring(
    mut ring_buf: RingBuf<MapData>,
    dropped: PerCpuArray<MapData, u64>,
    telemetry: Telemetry,
    poll_interval: Duration,
) {
    loop {
        while let Some(item) = ring_buf.next() {
            match XdpEvent::from_bytes(&item) {
                Some(event) => telemetry.record(&event),
                None => tracing::warn!("skipping short ring record ({} bytes)", item.len()),
            }
        }
        match dropped.get(&0, 0) {
            Ok(per_cpu) => telemetry.report_dropped_per_cpu(&per_cpu),
            Err(e) => tracing::debug!("failed to read DROPPED counter: {}", e),
        }
        tokio::time::sleep(poll_interval).await;
    }
}
