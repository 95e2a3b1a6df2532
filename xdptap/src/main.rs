use anyhow::Context;
use clap::Parser;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aya::maps::{PerCpuArray, RingBuf};
use aya::programs::{Xdp, XdpFlags};
use aya::Ebpf;

mod api;
mod config;
mod pipeline;
mod ring;
mod state;
mod telemetry;
mod traffic;

use config::{CliArgs, Config, Mode};
use telemetry::Telemetry;
use traffic::WorkerReport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))
            .with_context(|| format!("failed to load config {}", config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);
    config.validate()?;

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // ── State & Telemetry ─────────────────────────────────────────────
    let traffic_state = Arc::new(state::TrafficState::new());
    let (stream_tx, _) = broadcast::channel(config.event_buffer);
    let telemetry = Telemetry::new(traffic_state.clone(), stream_tx.clone());

    // ── Flow Cleanup Task ─────────────────────────────────────────────
    let traffic_state_cleanup = traffic_state.clone();
    let flow_timeout = config.flow_timeout;
    tokio::spawn(async move {
        let mut cleanup_interval = interval(Duration::from_secs(10));
        loop {
            cleanup_interval.tick().await;
            traffic_state_cleanup.cleanup_stale_flows(Duration::from_secs(flow_timeout));
        }
    });

    // ── HTTP API ──────────────────────────────────────────────────────
    let app_state = Arc::new(api::AppState {
        traffic: traffic_state.clone(),
        stream: stream_tx,
        start_time: std::time::Instant::now(),
    });
    let app = api::router(app_state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("failed to bind API port {}", config.port))?;
    tracing::info!("Server running on http://0.0.0.0:{}", config.port);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("API server error: {}", e);
        }
    });

    match config.mode {
        Mode::Attach => run_attach(&config, telemetry).await,
        Mode::Simulate => run_simulate(&config, telemetry).await,
    }
}

/// Attach the XDP program and report what it emits until Ctrl-C.
async fn run_attach(config: &Config, telemetry: Telemetry) -> anyhow::Result<()> {
    let mut bpf = Ebpf::load_file(&config.ebpf_object).with_context(|| {
        format!(
            "failed to load eBPF object {} (build it with `cargo xtask build-ebpf --release`)",
            config.ebpf_object
        )
    })?;

    let events_map = bpf
        .take_map("EVENTS")
        .context("EVENTS map missing from eBPF object")?;
    let ring_buf = RingBuf::try_from(events_map)?;
    let dropped_map = bpf
        .take_map("DROPPED")
        .context("DROPPED map missing from eBPF object")?;
    let dropped = PerCpuArray::try_from(dropped_map)?;

    let iface = config.interface.as_deref().unwrap_or("eth0");
    let program: &mut Xdp = bpf
        .program_mut("xdptap")
        .context("xdptap program missing from eBPF object")?
        .try_into()?;
    program.load()?;
    let link = program
        .attach(iface, XdpFlags::default())
        .with_context(|| format!("failed to attach XDP program to {}", iface))?;
    tracing::info!("XDP program attached to {}", iface);

    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let poller = tokio::spawn(telemetry::drain_kernel_ring(
        ring_buf,
        dropped,
        telemetry,
        poll_interval,
    ));

    tracing::info!("Press Ctrl-C to detach and exit");
    tokio::signal::ctrl_c().await?;

    poller.abort();
    program
        .detach(link)
        .with_context(|| format!("failed to detach XDP program from {}", iface))?;
    tracing::info!("XDP program detached from {}", iface);
    Ok(())
}

/// Run synthetic ingress threads against the user-space ring until they
/// finish or Ctrl-C, then drain what is left.
async fn run_simulate(config: &Config, telemetry: Telemetry) -> anyhow::Result<()> {
    let (producer, consumer) = ring::channel(config.ring_capacity)?;
    tracing::info!(
        "simulating {} ingress contexts into a {}-byte event ring",
        config.workers,
        producer.capacity()
    );

    let running = Arc::new(AtomicBool::new(true));
    let drain = tokio::spawn(telemetry::drain_user_ring(
        consumer,
        telemetry,
        Duration::from_millis(config.poll_interval_ms),
        running.clone(),
    ));

    let frame_interval = Duration::from_micros(config.frame_interval_us);
    let mut workers = Vec::with_capacity(config.workers as usize);
    for worker in 0..config.workers {
        let events = producer.clone();
        let running = running.clone();
        let frames = config.frames_per_worker;
        let handle = thread::Builder::new()
            .name(format!("ingress-{}", worker))
            .spawn(move || {
                traffic::run_worker(worker, worker + 1, frames, frame_interval, events, running)
            })
            .context("failed to spawn ingress worker")?;
        workers.push(handle);
    }

    let mut ingress = tokio::task::spawn_blocking(move || {
        workers
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow::anyhow!("ingress worker panicked")))
            .collect::<anyhow::Result<Vec<WorkerReport>>>()
    });

    let reports = tokio::select! {
        joined = &mut ingress => joined?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("stopping ingress workers");
            running.store(false, Ordering::Release);
            ingress.await?
        }
    }?;

    running.store(false, Ordering::Release);
    let drained = drain.await?;

    let frames: u64 = reports.iter().map(|r| r.frames).sum();
    let passed: u64 = reports.iter().map(|r| r.passed).sum();
    tracing::info!(
        "simulation done: {} frames, {} passed, {} events reported, {} dropped",
        frames,
        passed,
        drained,
        producer.dropped()
    );
    Ok(())
}
