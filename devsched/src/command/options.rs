/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Per-command option declarations.
//!
//! A command line looks like a shell invocation: the first token names the
//! configuration, the rest are flags declared here plus optional positional
//! arguments that are passed through to the invocation.
//!
//! ```text
//! instrument-suite --loop --min-loop-time 0 -s emulator-5554 com.example.Test
//! └─ config name ┘ └────────── CommandOptions / DeviceSelectionArgs ───┘ └ args ┘
//! ```

use std::time::Duration;

use clap::{Args, Parser};
use rand::Rng;

/// Default delay between loop iterations: one minute.
pub const DEFAULT_MIN_LOOP_TIME_MS: u64 = 60_000;

// ── Command options ───────────────────────────────────────────────────────────

/// Scheduling-related options every command accepts.
#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct CommandOptions {
    /// Print the important options of this configuration and exit.
    #[arg(long = "help")]
    pub help: bool,

    /// Print every option of this configuration and exit.
    #[arg(long = "help-all")]
    pub help_all: bool,

    /// Print the options of this configuration as JSON and exit.
    #[arg(long = "json-help")]
    pub json_help: bool,

    /// Validate the command without queueing it.
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Like --dry-run, and echo the command line to stdout.
    #[arg(long = "noisy-dry-run")]
    pub noisy_dry_run: bool,

    /// Re-queue a new run of this command every time it is dispatched.
    #[arg(long = "loop")]
    pub loop_mode: bool,

    /// Minimum delay in ms before the next loop iteration becomes ready.
    #[arg(long = "min-loop-time", value_name = "MS", default_value_t = DEFAULT_MIN_LOOP_TIME_MS)]
    pub min_loop_time_ms: u64,

    /// Upper bound in ms of a random delay added on top of --min-loop-time.
    #[arg(long = "max-random-loop-time", value_name = "MS")]
    pub max_random_loop_time_ms: Option<u64>,

    /// Fan the command out to every connected (non-stub) device.
    #[arg(long = "all-devices")]
    pub all_devices: bool,

    /// Ask the runner to capture a bugreport when the invocation ends.
    #[arg(long = "bugreport-on-invocation-ended")]
    pub bugreport_on_invocation_ended: bool,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            help: false,
            help_all: false,
            json_help: false,
            dry_run: false,
            noisy_dry_run: false,
            loop_mode: false,
            min_loop_time_ms: DEFAULT_MIN_LOOP_TIME_MS,
            max_random_loop_time_ms: None,
            all_devices: false,
            bugreport_on_invocation_ended: false,
        }
    }
}

impl CommandOptions {
    /// `--noisy-dry-run` implies `--dry-run`.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run || self.noisy_dry_run
    }

    /// Delay before the next loop iteration of this command becomes ready.
    ///
    /// `min_loop_time` plus, when `--max-random-loop-time` is set, a uniform
    /// random extra in `[0, max_random_loop_time]`.
    pub fn loop_time(&self) -> Duration {
        let extra = match self.max_random_loop_time_ms {
            Some(max) if max > 0 => rand::thread_rng().gen_range(0..=max),
            _ => 0,
        };
        Duration::from_millis(self.min_loop_time_ms.saturating_add(extra))
    }
}

// ── Device selection ──────────────────────────────────────────────────────────

/// Device-selection flags, folded into
/// [`DeviceRequirements`](crate::device::DeviceRequirements) and
/// [`DeviceOptions`](crate::device::DeviceOptions).
#[derive(Debug, Clone, Default, PartialEq, Eq, Args)]
#[command(next_help_heading = "Device selection")]
pub struct DeviceSelectionArgs {
    /// Run only on the device with this serial (repeatable).
    #[arg(short = 's', long = "serial", value_name = "SERIAL")]
    pub serials: Vec<String>,

    /// Never run on the device with this serial (repeatable).
    #[arg(long = "exclude-serial", value_name = "SERIAL")]
    pub exclude_serials: Vec<String>,

    /// Run only on devices of this product type.
    #[arg(long = "product-type", value_name = "PRODUCT")]
    pub product_type: Option<String>,

    /// Only allocate devices whose battery is at least this level (percent).
    #[arg(long = "min-battery", value_name = "PERCENT")]
    pub min_battery: Option<u8>,

    /// Stop a running invocation when the battery drops below this level.
    #[arg(long = "cutoff-battery", value_name = "PERCENT")]
    pub cutoff_battery: Option<u8>,
}

// ── Full command line ─────────────────────────────────────────────────────────

/// The parsed shape of one command line.
///
/// clap consumes the configuration name as the "binary name", so callers pass
/// the whole argument vector unchanged.
#[derive(Debug, Parser)]
#[command(
    name = "command",
    disable_help_flag = true,
    disable_version_flag = true,
    about = "Queue a test run against an available device"
)]
pub(crate) struct ParsedArgs {
    #[command(flatten)]
    pub command: CommandOptions,

    #[command(flatten)]
    pub device: DeviceSelectionArgs,

    /// Arguments passed through to the invocation.
    #[arg(value_name = "ARGS")]
    pub extra: Vec<String>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
