use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::time::Instant;

use crate::telemetry::EventRecord;

#[derive(Debug, Serialize, Clone)]
pub struct FlowStats {
    pub protocol: String,
    pub packets: u64,
    pub bytes: u64,
    #[serde(skip)]
    pub last_seen: Instant,
}

impl FlowStats {
    fn first(event: &EventRecord) -> Self {
        Self {
            protocol: event.protocol.clone(),
            packets: 1,
            bytes: u64::from(event.pkt_len),
            last_seen: Instant::now(),
        }
    }
}

/// Live aggregates over every event the consumer has drained.
pub struct TrafficState {
    pub flows: DashMap<String, FlowStats>,
    pub protocols: DashMap<String, u64>,
    pub total_events: AtomicU64,
    pub total_bytes: AtomicU64,
    pub active_flows: AtomicUsize,
    /// Events the producers could not queue because the ring was full.
    pub dropped_events: AtomicU64,
}

impl Default for TrafficState {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficState {
    pub fn new() -> Self {
        Self {
            flows: DashMap::new(),
            protocols: DashMap::new(),
            total_events: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            active_flows: AtomicUsize::new(0),
            dropped_events: AtomicU64::new(0),
        }
    }

    pub fn update(&self, event: &EventRecord) {
        self.flows
            .entry(event.flow_key())
            .and_modify(|stats| {
                stats.packets += 1;
                stats.bytes += u64::from(event.pkt_len);
                stats.last_seen = Instant::now();
            })
            .or_insert_with(|| {
                self.active_flows.fetch_add(1, Ordering::Relaxed);
                FlowStats::first(event)
            });

        *self.protocols.entry(event.protocol.clone()).or_insert(0) += 1;

        self.total_events.fetch_add(1, Ordering::Relaxed);
        self.total_bytes
            .fetch_add(u64::from(event.pkt_len), Ordering::Relaxed);
    }

    /// Record the ring's cumulative drop counter.  Returns the increase
    /// since the previous call.
    pub fn set_dropped(&self, total: u64) -> u64 {
        let prev = self.dropped_events.swap(total, Ordering::Relaxed);
        total.saturating_sub(prev)
    }

    pub fn cleanup_stale_flows(&self, timeout: tokio::time::Duration) {
        let now = Instant::now();
        // Counted per entry: flows inserted concurrently must not offset it.
        let mut removed = 0;
        self.flows.retain(|_, stats| {
            let keep = now.duration_since(stats.last_seen) <= timeout;
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            self.active_flows.fetch_sub(removed, Ordering::Relaxed);
            tracing::debug!("expired {} idle flows", removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;
    use xdptap_common::XdpEvent;

    fn record(src_port: u16, protocol: u32, pkt_len: u32) -> EventRecord {
        EventRecord::from_event(&XdpEvent {
            src_ip: u32::from_ne_bytes([127, 0, 0, 1]),
            dst_ip: u32::from_ne_bytes([127, 0, 0, 1]),
            src_port,
            dst_port: 1234,
            protocol,
            pkt_len,
            eth_proto: [0x08, 0x00],
            ..Default::default()
        })
    }

    #[test]
    fn test_traffic_state_update() {
        let state = TrafficState::new();
        let packet = record(80, 6, 100);

        state.update(&packet);
        assert_eq!(state.total_events.load(Ordering::Relaxed), 1);
        assert_eq!(state.total_bytes.load(Ordering::Relaxed), 100);
        assert_eq!(state.active_flows.load(Ordering::Relaxed), 1);

        state.update(&packet);
        assert_eq!(state.total_events.load(Ordering::Relaxed), 2);
        assert_eq!(state.total_bytes.load(Ordering::Relaxed), 200);
        assert_eq!(state.active_flows.load(Ordering::Relaxed), 1);

        state.update(&record(81, 17, 60));
        assert_eq!(state.active_flows.load(Ordering::Relaxed), 2);
        assert_eq!(*state.protocols.get("TCP").unwrap(), 2);
        assert_eq!(*state.protocols.get("UDP").unwrap(), 1);
    }

    #[test]
    fn test_same_ports_different_protocol_are_distinct_flows() {
        let state = TrafficState::new();
        state.update(&record(53, 6, 60));
        state.update(&record(53, 17, 60));
        assert_eq!(state.flows.len(), 2);
    }

    #[test]
    fn test_set_dropped_reports_delta() {
        let state = TrafficState::new();
        assert_eq!(state.set_dropped(5), 5);
        assert_eq!(state.set_dropped(5), 0);
        assert_eq!(state.set_dropped(8), 3);
        assert_eq!(state.dropped_events.load(Ordering::Relaxed), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_stale_flows() {
        let state = TrafficState::new();
        state.update(&record(80, 6, 100));
        tokio::time::advance(Duration::from_secs(30)).await;
        state.update(&record(81, 6, 100));

        tokio::time::advance(Duration::from_secs(45)).await;
        state.cleanup_stale_flows(Duration::from_secs(60));

        assert_eq!(state.flows.len(), 1);
        assert_eq!(state.active_flows.load(Ordering::Relaxed), 1);
        // Totals are cumulative and survive expiry.
        assert_eq!(state.total_events.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_active_flows_tracks_concurrent_inserts_during_cleanup() {
        let state = std::sync::Arc::new(TrafficState::new());
        let writer = {
            let state = state.clone();
            std::thread::spawn(move || {
                for port in 0..50_000 {
                    state.update(&record(port, 6, 64));
                }
            })
        };

        while !writer.is_finished() {
            state.cleanup_stale_flows(Duration::ZERO);
        }
        writer.join().unwrap();
        assert_eq!(
            state.active_flows.load(Ordering::Relaxed),
            state.flows.len()
        );

        std::thread::sleep(std::time::Duration::from_millis(5));
        state.cleanup_stale_flows(Duration::ZERO);
        assert_eq!(state.flows.len(), 0);
        assert_eq!(state.active_flows.load(Ordering::Relaxed), 0);
    }
}
