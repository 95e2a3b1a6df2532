use std::process::Command;

use anyhow::Context as _;
use clap::Parser;

const EBPF_TARGET: &str = "bpfel-unknown-none";

#[derive(Parser)]
enum Cli {
    /// Build the XDP program for bpfel-unknown-none.
    BuildEbpf {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build everything: XDP program first, then the agent.
    Build {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build everything and attach to an interface with sudo.
    Run {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
        /// Extra arguments passed to the agent.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run the agent against synthetic traffic; needs neither the XDP
    /// program nor root.
    Simulate {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
        /// Extra arguments passed to the agent.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    match Cli::parse() {
        Cli::BuildEbpf { release } => build_ebpf(release),
        Cli::Build { release } => {
            build_ebpf(release)?;
            build_agent(release)
        }
        Cli::Run { release, args } => {
            build_ebpf(release)?;
            build_agent(release)?;
            let object = format!("xdptap-ebpf/target/{EBPF_TARGET}/{}/xdptap", profile(release));
            let mut agent_args = vec![
                "--mode".to_string(),
                "attach".to_string(),
                "--ebpf-object".to_string(),
                object,
            ];
            agent_args.extend(args);
            run_agent(release, true, &agent_args)
        }
        Cli::Simulate { release, args } => {
            build_agent(release)?;
            let mut agent_args = vec!["--mode".to_string(), "simulate".to_string()];
            agent_args.extend(args);
            run_agent(release, false, &agent_args)
        }
    }
}

fn profile(release: bool) -> &'static str {
    if release {
        "release"
    } else {
        "debug"
    }
}

fn build_ebpf(release: bool) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/../xdptap-ebpf"));
    cmd.args([
        "+nightly",
        "build",
        "--target",
        EBPF_TARGET,
        "-Z",
        "build-std=core",
    ]);
    if release {
        cmd.arg("--release");
    }
    let status = cmd
        .status()
        .context("failed to run cargo build for the XDP program")?;
    anyhow::ensure!(status.success(), "XDP program build failed");
    Ok(())
}

fn build_agent(release: bool) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.args(["build", "--package", "xdptap"]);
    if release {
        cmd.arg("--release");
    }
    let status = cmd.status().context("failed to run cargo build for xdptap")?;
    anyhow::ensure!(status.success(), "xdptap build failed");
    Ok(())
}

fn run_agent(release: bool, as_root: bool, args: &[String]) -> anyhow::Result<()> {
    let bin = format!("target/{}/xdptap", profile(release));

    let mut cmd = if as_root {
        let mut sudo = Command::new("sudo");
        sudo.arg(&bin);
        sudo
    } else {
        Command::new(&bin)
    };
    cmd.args(args);
    let status = cmd.status().context("failed to run xdptap")?;
    anyhow::ensure!(status.success(), "xdptap exited with error");
    Ok(())
}
