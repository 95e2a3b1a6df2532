use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::ring;

/// Where frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Load the XDP program and drain the kernel ring buffer.
    Attach,
    /// Feed synthetic frames through the user-space pipeline.
    #[default]
    Simulate,
}

/// Application configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mode: Mode,

    /// Network interface to attach the XDP program to.
    #[serde(default)]
    pub interface: Option<String>,

    /// Compiled eBPF object loaded in attach mode.
    #[serde(default = "default_ebpf_object")]
    pub ebpf_object: String,

    /// API server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Event ring size in bytes (power of two).
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Simulated ingress contexts (one thread each).
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// Frames each simulated context receives. 0 = until Ctrl-C.
    #[serde(default = "default_frames_per_worker")]
    pub frames_per_worker: u64,

    /// Pause between simulated frames, in microseconds.
    #[serde(default = "default_frame_interval_us")]
    pub frame_interval_us: u64,

    /// Sleep between empty ring polls, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Idle seconds before a flow is forgotten.
    #[serde(default = "default_flow_timeout")]
    pub flow_timeout: u64,

    /// Events buffered per `/api/stream` subscriber.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,
}

fn default_ebpf_object() -> String {
    "xdptap-ebpf/target/bpfel-unknown-none/release/xdptap".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_ring_capacity() -> usize {
    ring::DEFAULT_CAPACITY
}

fn default_workers() -> u32 {
    4
}

fn default_frames_per_worker() -> u64 {
    10_000
}

fn default_frame_interval_us() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    1
}

fn default_flow_timeout() -> u64 {
    60
}

fn default_event_buffer() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            interface: None,
            ebpf_object: default_ebpf_object(),
            port: default_port(),
            ring_capacity: default_ring_capacity(),
            workers: default_workers(),
            frames_per_worker: default_frames_per_worker(),
            frame_interval_us: default_frame_interval_us(),
            poll_interval_ms: default_poll_interval_ms(),
            flow_timeout: default_flow_timeout(),
            event_buffer: default_event_buffer(),
            quiet: false,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if let Some(mode) = cli.mode {
            self.mode = mode;
        }
        if cli.interface.is_some() {
            self.interface = cli.interface.clone();
        }
        if let Some(ref path) = cli.ebpf_object {
            self.ebpf_object = path.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(capacity) = cli.ring_capacity {
            self.ring_capacity = capacity;
        }
        if let Some(workers) = cli.workers {
            self.workers = workers;
        }
        if let Some(frames) = cli.frames_per_worker {
            self.frames_per_worker = frames;
        }
        if let Some(interval) = cli.frame_interval_us {
            self.frame_interval_us = interval;
        }
        if let Some(timeout) = cli.flow_timeout {
            self.flow_timeout = timeout;
        }
        if cli.quiet {
            self.quiet = true;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.ring_capacity.is_power_of_two() && self.ring_capacity >= ring::MIN_CAPACITY,
            "ring_capacity must be a power of two of at least {} bytes, got {}",
            ring::MIN_CAPACITY,
            self.ring_capacity
        );
        anyhow::ensure!(self.workers > 0, "workers must be at least 1");
        anyhow::ensure!(self.event_buffer > 0, "event_buffer must be at least 1");
        anyhow::ensure!(self.poll_interval_ms > 0, "poll_interval_ms must be at least 1");
        Ok(())
    }
}

use clap::Parser;

/// xdptap: XDP packet telemetry with a lock-free event ring
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Frame source: attach the XDP program or simulate traffic.
    #[arg(short, long, value_enum)]
    pub mode: Option<Mode>,

    /// Network interface to attach the XDP program to (e.g., eth0).
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Path of the compiled eBPF object.
    #[arg(long)]
    pub ebpf_object: Option<String>,

    /// Port to serve the API on [default: 3000].
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Event ring size in bytes, a power of two [default: 8192].
    #[arg(long)]
    pub ring_capacity: Option<usize>,

    /// Simulated ingress contexts [default: 4].
    #[arg(short, long)]
    pub workers: Option<u32>,

    /// Frames per simulated context, 0 = until Ctrl-C [default: 10000].
    #[arg(long)]
    pub frames_per_worker: Option<u64>,

    /// Microseconds between simulated frames [default: 100].
    #[arg(long)]
    pub frame_interval_us: Option<u64>,

    /// Flow idle timeout in seconds [default: 60].
    #[arg(long)]
    pub flow_timeout: Option<u64>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.mode, Mode::Simulate);
        assert_eq!(config.ring_capacity, 8192);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = Config::from_yaml("mode: attach\ninterface: enp3s0\n").unwrap();
        assert_eq!(config.mode, Mode::Attach);
        assert_eq!(config.interface.as_deref(), Some("enp3s0"));
        assert_eq!(config.port, 3000);
        assert_eq!(config.ring_capacity, 8192);
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        assert!(Config::from_yaml("mode: mirror\n").is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let yaml = "ring_capacity: 4096\nworkers: 2\nport: 8080\n";
        let mut config = Config::from_yaml(yaml).unwrap();
        let cli = CliArgs::parse_from(["xdptap", "--workers", "8", "-m", "attach"]);
        config.merge_cli(&cli);

        assert_eq!(config.workers, 8);
        assert_eq!(config.mode, Mode::Attach);
        // Not given on the command line, so the file wins.
        assert_eq!(config.ring_capacity, 4096);
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_cli_value_equal_to_default_still_overrides_file() {
        let yaml = "ring_capacity: 4096\nworkers: 2\nflow_timeout: 30\n";
        let mut config = Config::from_yaml(yaml).unwrap();
        let cli = CliArgs::parse_from([
            "xdptap",
            "--ring-capacity",
            "8192",
            "--workers",
            "4",
            "--flow-timeout",
            "60",
        ]);
        config.merge_cli(&cli);

        assert_eq!(config.ring_capacity, 8192);
        assert_eq!(config.workers, 4);
        assert_eq!(config.flow_timeout, 60);
    }

    #[test]
    fn test_cli_without_flags_keeps_defaults() {
        let mut config = Config::default();
        config.merge_cli(&CliArgs::parse_from(["xdptap"]));
        assert_eq!(config.port, 3000);
        assert_eq!(config.ring_capacity, ring::DEFAULT_CAPACITY);
        assert_eq!(config.frame_interval_us, 100);
    }

    #[test]
    fn test_validate_rejects_bad_ring() {
        let mut config = Config::default();
        config.ring_capacity = 5000;
        assert!(config.validate().is_err());
        config.ring_capacity = 64;
        assert!(config.validate().is_err());
        config.ring_capacity = 128;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = Config {
            workers: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
