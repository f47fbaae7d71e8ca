/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Command bookkeeping: one [`CommandTracker`] per distinct command, one
//! [`ExecutableCommand`] per schedulable run of it.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::command::Configuration;

// ── CommandTracker ────────────────────────────────────────────────────────────

/// A command as submitted, plus the run time it has consumed so far.
///
/// Shared (`Arc`) by every [`ExecutableCommand`] created from it, including
/// loop iterations and rescheduled runs.
#[derive(Debug)]
pub struct CommandTracker {
    id: u32,
    args: Vec<String>,
    /// Absolute path of the command file this command came from.
    command_file: Option<PathBuf>,
    /// Cumulative execution time in nanoseconds.
    total_exec_time: AtomicU64,
}

impl CommandTracker {
    pub fn new(id: u32, args: Vec<String>, command_file: Option<PathBuf>) -> Self {
        Self {
            id,
            args,
            command_file,
            total_exec_time: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Configuration name (first argument).
    pub fn config_name(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or_default()
    }

    pub fn command_file(&self) -> Option<&Path> {
        self.command_file.as_deref()
    }

    pub fn total_exec_time(&self) -> Duration {
        Duration::from_nanos(self.total_exec_time.load(AtomicOrdering::SeqCst))
    }

    pub fn increment_exec_time(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        // fetch_update never fails with a closure that always returns Some
        let _ = self
            .total_exec_time
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |t| {
                Some(t.saturating_add(nanos))
            });
    }
}

/// Fairness order: least cumulative execution time first.
pub fn by_exec_time(a: &CommandTracker, b: &CommandTracker) -> Ordering {
    a.total_exec_time
        .load(AtomicOrdering::SeqCst)
        .cmp(&b.total_exec_time.load(AtomicOrdering::SeqCst))
}

/// Display order.
pub fn by_id(a: &CommandTracker, b: &CommandTracker) -> Ordering {
    a.id.cmp(&b.id)
}

// ── ExecutableCommand ─────────────────────────────────────────────────────────

/// Where an [`ExecutableCommand`] currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    WaitingForDevice,
    Executing,
    Sleeping,
}

impl CommandState {
    pub fn display_name(self) -> &'static str {
        match self {
            CommandState::WaitingForDevice => "Wait_for_device",
            CommandState::Executing => "Executing",
            CommandState::Sleeping => "Sleeping",
        }
    }
}

/// One schedulable run of a [`CommandTracker`].
///
/// Lives in exactly one of the scheduler's ready, sleeping or executing sets
/// (or none, before its first enqueue and after it finishes).
#[derive(Debug, Clone)]
pub struct ExecutableCommand {
    /// Scheduler-unique instance id; trackers can have several instances.
    pub(crate) exec_id: u64,
    tracker: Arc<CommandTracker>,
    config: Configuration,
    rescheduled: bool,
    created: Instant,
    sleep_until: Option<Instant>,
}

impl ExecutableCommand {
    pub(crate) fn new(
        exec_id: u64,
        tracker: Arc<CommandTracker>,
        config: Configuration,
        rescheduled: bool,
    ) -> Self {
        Self {
            exec_id,
            tracker,
            config,
            rescheduled,
            created: Instant::now(),
            sleep_until: None,
        }
    }

    pub fn tracker(&self) -> &Arc<CommandTracker> {
        &self.tracker
    }

    pub fn command_id(&self) -> u32 {
        self.tracker.id
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    pub fn is_rescheduled(&self) -> bool {
        self.rescheduled
    }

    pub fn is_loop_mode(&self) -> bool {
        self.config.command_options.loop_mode
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Time left before a sleeping command becomes ready.
    pub fn sleep_time(&self) -> Option<Duration> {
        self.sleep_until
            .map(|t| t.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn set_sleep_until(&mut self, until: Option<Instant>) {
        self.sleep_until = until;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
