use crate::state::TrafficState;
use crate::telemetry::StreamMessage;
use axum::{
    extract::{ws::{Message, WebSocket}, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

pub struct AppState {
    pub traffic: Arc<TrafficState>,
    pub stream: broadcast::Sender<StreamMessage>,
    pub start_time: Instant,
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

struct Metrics {
    registry: Registry,
    packets_total: Counter,
    bytes_total: Counter,
    dropped_total: Counter,
    active_flows: Gauge,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();
        let packets_total = Counter::default();
        let bytes_total = Counter::default();
        let dropped_total = Counter::default();
        let active_flows = Gauge::default();

        registry.register(
            "xdptap_packets",
            "Total number of reported packets",
            packets_total.clone(),
        );
        registry.register(
            "xdptap_bytes",
            "Total bytes of reported packets",
            bytes_total.clone(),
        );
        registry.register(
            "xdptap_dropped_events",
            "Events dropped because the ring was full",
            dropped_total.clone(),
        );
        registry.register(
            "xdptap_active_flows",
            "Flows seen within the idle timeout",
            active_flows.clone(),
        );

        Self {
            registry,
            packets_total,
            bytes_total,
            dropped_total,
            active_flows,
        }
    }

    /// Counters are monotonic, so catch them up by the delta.
    fn sync(&self, traffic: &TrafficState) {
        catch_up(&self.packets_total, traffic.total_events.load(Ordering::Relaxed));
        catch_up(&self.bytes_total, traffic.total_bytes.load(Ordering::Relaxed));
        catch_up(&self.dropped_total, traffic.dropped_events.load(Ordering::Relaxed));
        self.active_flows
            .set(traffic.active_flows.load(Ordering::Relaxed) as i64);
    }
}

fn catch_up(counter: &Counter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    active_flows: usize,
    total_packets: u64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    uptime_seconds: u64,
    total_packets: u64,
    total_bytes: u64,
    dropped_events: u64,
    active_flows: usize,
    packets_per_second: f64,
    bytes_per_second: f64,
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>) -> Router {
    let metrics = Arc::new(Metrics::new());

    Router::new()
        .route("/api/live", get(get_live_stats))
        .route("/api/health", get(get_health))
        .route("/api/stats", get(get_stats))
        .route("/api/stream", get(ws_handler))
        .route("/metrics", get({
            let m = metrics.clone();
            let s = state.clone();
            move || get_metrics(s.clone(), m.clone())
        }))
        .with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_flows: state.traffic.active_flows.load(Ordering::Relaxed),
        total_packets: state.traffic.total_events.load(Ordering::Relaxed),
    })
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let uptime = state.start_time.elapsed().as_secs();
    let total_packets = state.traffic.total_events.load(Ordering::Relaxed);
    let total_bytes = state.traffic.total_bytes.load(Ordering::Relaxed);

    let per_second = |n: u64| if uptime > 0 { n as f64 / uptime as f64 } else { 0.0 };

    Json(StatsResponse {
        uptime_seconds: uptime,
        total_packets,
        total_bytes,
        dropped_events: state.traffic.dropped_events.load(Ordering::Relaxed),
        active_flows: state.traffic.active_flows.load(Ordering::Relaxed),
        packets_per_second: per_second(total_packets),
        bytes_per_second: per_second(total_bytes),
    })
}

async fn get_live_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut flows: Vec<_> = state
        .traffic
        .flows
        .iter()
        .map(|entry| {
            let (key, stats) = entry.pair();
            serde_json::json!({
                "flow": key,
                "stats": stats
            })
        })
        .collect();

    flows.sort_by(|a, b| {
        let count_a = a["stats"]["packets"].as_u64().unwrap_or(0);
        let count_b = b["stats"]["packets"].as_u64().unwrap_or(0);
        count_b.cmp(&count_a)
    });

    flows.truncate(50);

    let protocols: serde_json::Map<String, serde_json::Value> = state
        .traffic
        .protocols
        .iter()
        .map(|entry| (entry.key().clone(), serde_json::json!(*entry.value())))
        .collect();

    Json(serde_json::json!({
        "flows": flows,
        "protocols": protocols,
        "total_packets": state.traffic.total_events.load(Ordering::Relaxed),
        "total_bytes": state.traffic.total_bytes.load(Ordering::Relaxed),
    }))
}

async fn get_metrics(state: Arc<AppState>, metrics: Arc<Metrics>) -> impl IntoResponse {
    metrics.sync(&state.traffic);

    let mut buf = String::new();
    if let Err(e) = encode(&mut buf, &metrics.registry) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let events = state.stream.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, events))
}

/// Forward every drained event to the client as JSON.
async fn handle_socket(mut socket: WebSocket, mut events: broadcast::Receiver<StreamMessage>) {
    loop {
        let msg = match events.recv().await {
            Ok(msg) => msg,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("stream subscriber lagged, skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to serialize stream event: {}", e);
                continue;
            }
        };

        if socket.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{EventRecord, Telemetry};
    use xdptap_common::XdpEvent;

    #[test]
    fn test_metrics_catch_up_to_state() {
        let state = TrafficState::new();
        let (tx, _rx) = broadcast::channel(4);
        let shared = Arc::new(state);
        let telemetry = Telemetry::new(shared.clone(), tx);
        telemetry.record(&XdpEvent {
            protocol: 6,
            pkt_len: 100,
            eth_proto: [0x08, 0x00],
            ..Default::default()
        });
        shared.set_dropped(3);

        let metrics = Metrics::new();
        metrics.sync(&shared);
        metrics.sync(&shared);
        assert_eq!(metrics.packets_total.get(), 1);
        assert_eq!(metrics.bytes_total.get(), 100);
        assert_eq!(metrics.dropped_total.get(), 3);
        assert_eq!(metrics.active_flows.get(), 1);

        let mut buf = String::new();
        encode(&mut buf, &metrics.registry).unwrap();
        assert!(buf.contains("xdptap_dropped_events_total 3"));
    }

    #[tokio::test]
    async fn test_health_handler() {
        let traffic = Arc::new(TrafficState::new());
        let record = EventRecord::from_event(&XdpEvent {
            protocol: 17,
            pkt_len: 60,
            ..Default::default()
        });
        traffic.update(&record);
        let (stream, _rx) = broadcast::channel(4);
        let state = Arc::new(AppState {
            traffic,
            stream,
            start_time: Instant::now(),
        });

        let Json(health) = get_health(State(state)).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.total_packets, 1);
        assert_eq!(health.active_flows, 1);
    }
}
