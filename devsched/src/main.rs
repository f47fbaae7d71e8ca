/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use devsched::command::ArgsConfigurationFactory;
use devsched::config::SchedulerConfig;
use devsched::runner::HostCommandRunner;
use devsched::scheduler::CommandScheduler;

// ── CLI argument definition ───────────────────────────────────────────────────

/// devsched – device test command scheduler.
///
/// Example:
///   devsched --config devsched.yaml --cmdfile nightly.txt --shutdown-on-empty
///   devsched --remote-port 30103 -- smoke --loop --min-loop-time 600000
#[derive(Debug, Parser)]
#[command(
    name = "devsched",
    about = "Device test command scheduler",
    long_about = None,
)]
struct Cli {
    /// Path to the YAML daemon configuration file.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Command file to load at startup (may be repeated).
    #[arg(short = 'f', long = "cmdfile")]
    cmdfiles: Vec<PathBuf>,

    /// Extra arguments appended to every command of every command file.
    #[arg(long = "cmdfile-arg", allow_hyphen_values = true)]
    cmdfile_args: Vec<String>,

    /// Exit once every queued command has run.
    #[arg(long = "shutdown-on-empty", default_value_t = false)]
    shutdown_on_empty: bool,

    /// Start the remote control channel on this port (overrides the config file).
    #[arg(short = 'p', long = "remote-port")]
    remote_port: Option<u16>,

    /// Take over from an instance already listening on the remote port.
    #[arg(long = "auto-handover", default_value_t = false)]
    auto_handover: bool,

    /// Hand this daemon's devices and commands to the instance listening on
    /// this port, then exit once running invocations finish.
    #[arg(long = "handover-port", conflicts_with = "shutdown_on_empty")]
    handover_port: Option<u16>,

    /// Program that launches each command; receives the configuration name first.
    #[arg(short = 'l', long = "launcher")]
    launcher: Option<PathBuf>,

    /// Command to queue at startup: configuration name followed by its options.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Level is controlled by the RUST_LOG env-var (e.g. RUST_LOG=debug).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("devsched starting up...");

    let cli = Cli::parse();

    info!(
        config       = ?cli.config,
        cmdfiles     = ?cli.cmdfiles,
        remote_port  = ?cli.remote_port,
        auto_handover = cli.auto_handover,
        shutdown_on_empty = cli.shutdown_on_empty,
        "Configuration"
    );

    // ── Load daemon configuration ─────────────────────────────────────────────
    let mut config = match &cli.config {
        Some(path) => match SchedulerConfig::load_from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load scheduler configuration: {:#}", e);
                process::exit(1);
            }
        },
        None => {
            warn!("No configuration file provided, using defaults (no devices)");
            SchedulerConfig::default()
        }
    };
    if let Some(port) = cli.remote_port {
        config.remote.port = port;
        config.remote.start_on_boot = true;
    }
    if cli.auto_handover {
        config.remote.auto_handover = true;
    }

    // ── Assemble the scheduler ────────────────────────────────────────────────
    let pool = Arc::new(config.build_device_pool());
    let factory = Arc::new(ArgsConfigurationFactory::new().allow_leftovers(true));
    let runner = match &cli.launcher {
        Some(launcher) => HostCommandRunner::new().with_launcher(launcher),
        None => HostCommandRunner::new(),
    };
    let scheduler = CommandScheduler::new(pool, factory, Arc::new(runner), config);

    if let Err(e) = scheduler.start().await {
        error!("Failed to start scheduler: {e}");
        process::exit(1);
    }
    scheduler.await_running().await;
    if let Some(port) = scheduler.remote_port() {
        info!(port, "remote control channel listening");
    }

    // ── Initial work ──────────────────────────────────────────────────────────
    for file in &cli.cmdfiles {
        if let Err(e) = scheduler.add_command_file(file, &cli.cmdfile_args) {
            error!("Failed to load command file {}: {e}", file.display());
            if scheduler.should_shutdown_on_cmdfile_error() {
                scheduler.shutdown();
            }
        }
    }
    if !cli.command.is_empty() {
        match scheduler.add_command(&cli.command) {
            Ok(true) => {}
            Ok(false) => warn!("command was not queued: {}", cli.command.join(" ")),
            Err(e) => error!("Invalid command: {e}"),
        }
    }
    if cli.shutdown_on_empty {
        scheduler.shutdown_on_empty();
    }
    if let Some(port) = cli.handover_port {
        info!(port, "handing over to peer instance");
        if let Err(e) = scheduler.handover_shutdown(port).await {
            error!("Handover to port {port} failed: {e}");
            scheduler.shutdown();
        }
    }

    // ── Signals ───────────────────────────────────────────────────────────────
    // First Ctrl-C drains running invocations, the second stops them.
    let signals = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            info!("interrupt received, shutting down after running invocations");
            scheduler.shutdown();
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            warn!("second interrupt received, stopping running invocations");
            scheduler.shutdown_hard();
        })
    };

    scheduler.join().await;
    signals.abort();
    info!("devsched stopped");
}
