/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use devsched::config::DEFAULT_REMOTE_PORT;
use devsched::remote::RemoteClient;

// ── CLI argument definition ───────────────────────────────────────────────────

/// devsched-ctl – talk to a running devsched daemon.
///
/// Example:
///   devsched-ctl add-command -- smoke --serial emulator-5554
///   devsched-ctl --port 30104 handover 30103
#[derive(Debug, Parser)]
#[command(
    name = "devsched-ctl",
    about = "Remote control client for a running devsched daemon",
    long_about = None,
)]
struct Cli {
    /// Remote control port of the daemon.
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_REMOTE_PORT)]
    port: u16,

    #[command(subcommand)]
    command: CtlCommand,
}

#[derive(Debug, Subcommand)]
enum CtlCommand {
    /// Queue a command.
    AddCommand {
        /// Accumulated execution time to credit the command with, in milliseconds.
        #[arg(long = "exec-time-ms", default_value_t = 0)]
        exec_time_ms: u64,

        /// Configuration name followed by its options.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },

    /// Load a command file on the daemon host.
    AddCommandFile {
        path: PathBuf,

        /// Extra arguments appended to every command in the file.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        extra_args: Vec<String>,
    },

    /// Lease a device so the daemon will not schedule on it.
    Allocate { serial: String },

    /// Return a leased device; `*` returns every leased device.
    Free { serial: String },

    /// Ask the daemon to hand its devices and commands to the instance
    /// listening on PEER_PORT, then shut down.
    Handover {
        #[arg(value_name = "PEER_PORT")]
        peer_port: u16,
    },

    /// Show the daemon's devices.
    ListDevices,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    debug!(?cli, "parsed arguments");

    let client = RemoteClient::connect(cli.port)
        .await
        .with_context(|| format!("Cannot reach devsched on port {}", cli.port))?;

    match cli.command {
        CtlCommand::AddCommand { exec_time_ms, args } => {
            let queued = client
                .send_add_command(Duration::from_millis(exec_time_ms), &args)
                .await
                .context("add-command failed")?;
            if !queued {
                bail!("command was not queued: {}", args.join(" "));
            }
            println!("queued: {}", args.join(" "));
        }
        CtlCommand::AddCommandFile { path, extra_args } => {
            let path = std::path::absolute(&path)
                .with_context(|| format!("Cannot resolve {}", path.display()))?;
            client
                .send_add_command_file(&path, &extra_args)
                .await
                .context("add-command-file failed")?;
            println!("loaded: {}", path.display());
        }
        CtlCommand::Allocate { serial } => {
            client
                .send_allocate_device(&serial)
                .await
                .with_context(|| format!("Cannot allocate {serial}"))?;
            println!("allocated: {serial}");
        }
        CtlCommand::Free { serial } => {
            client
                .send_free_device(&serial)
                .await
                .with_context(|| format!("Cannot free {serial}"))?;
            println!("freed: {serial}");
        }
        CtlCommand::Handover { peer_port } => {
            client
                .send_start_handover(peer_port)
                .await
                .context("handover request failed")?;
            println!("handover to port {peer_port} started");
        }
        CtlCommand::ListDevices => {
            let devices = client.list_devices().await.context("list-devices failed")?;
            println!("{:<20}  {:<16}  {:<12}  {:<5}  Battery", "Serial", "Product", "State", "Stub");
            for d in devices {
                let battery = d.battery.map_or_else(|| "N/A".to_string(), |b| format!("{b}%"));
                println!(
                    "{:<20}  {:<16}  {:<12}  {:<5}  {}",
                    d.serial, d.product, d.state, d.stub, battery
                );
            }
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
