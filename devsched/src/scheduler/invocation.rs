/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Invocation lifecycle.
//!
//! An [`InvocationThread`] binds one [`ExecutableCommand`] to one leased
//! device for the duration of a run:
//!
//! ```text
//! created ──► running ──► completed (Available | Unresponsive | Unavailable)
//!                │
//!                └─ stop_invocation(): `am kill-all` on the device, then the
//!                   cancellation token fires; the runner is expected to
//!                   return InvocationError::Interrupted soon after.
//! ```
//!
//! What actually runs is delegated to an [`InvocationRunner`]; this module
//! only classifies how the run ended.  Completion bookkeeping (registry,
//! listeners, device release, exec time) is done by the scheduler in a fixed
//! order once [`InvocationThread::run`] returns.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::InvocationError;
use super::tracker::ExecutableCommand;
use crate::command::Configuration;
use crate::device::{DeviceHandle, FreeDeviceState, TestDevice};

/// Shell command that stops every app process on the device.
const KILL_ALL_COMMAND: &str = "am kill-all";

// ── Collaborator traits ───────────────────────────────────────────────────────

/// Lets a running invocation queue follow-up runs of its own command.
pub trait Rescheduler: Send + Sync {
    /// Queue `config` as a new run of the same command, ready immediately.
    /// Loop mode is forced off on the queued copy.
    fn schedule_config(&self, config: Configuration) -> bool;

    /// Re-parse the command's arguments and queue it after its loop delay.
    fn reschedule_command(&self) -> bool;
}

/// Everything a runner needs for one invocation.
pub struct InvocationContext {
    pub command_id: u32,
    pub device: DeviceHandle,
    pub config: Configuration,
    pub rescheduler: Arc<dyn Rescheduler>,
    /// Fires on `stop_invocation`, `shutdown_hard` and battery cutoff.
    pub cancel: CancellationToken,
}

impl InvocationContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("command_id", &self.command_id)
            .field("device", &self.device.serial())
            .field("config", &self.config.name)
            .finish_non_exhaustive()
    }
}

/// Executes the test workload of one invocation.
///
/// Called on a blocking worker thread; may block for as long as the run
/// takes.  Should poll [`InvocationContext::cancel`] and return
/// [`InvocationError::Interrupted`] once it fires.
pub trait InvocationRunner: Send + Sync {
    fn invoke(&self, ctx: InvocationContext) -> Result<(), InvocationError>;
}

/// Observer told about every finished invocation, in registration order.
pub trait ScheduledInvocationListener: Send + Sync {
    fn invocation_complete(&self, device: &dyn TestDevice, state: FreeDeviceState);
}

impl<F> ScheduledInvocationListener for F
where
    F: Fn(&dyn TestDevice, FreeDeviceState) + Send + Sync,
{
    fn invocation_complete(&self, device: &dyn TestDevice, state: FreeDeviceState) {
        self(device, state)
    }
}

// ── InvocationThread ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStatus {
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvocationStatus::Starting => "Starting",
            InvocationStatus::Running => "Running",
            InvocationStatus::Stopping => "Stopping",
        };
        f.write_str(s)
    }
}

/// Who returns the device once the invocation is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceRelease {
    /// The scheduler allocated it and frees it back to the pool.
    ReturnToPool,
    /// The caller supplied an already-allocated device and keeps ownership.
    CallerOwned,
}

/// How [`InvocationThread::run`] ended.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InvocationOutcome {
    pub state: FreeDeviceState,
    pub fatal: bool,
    pub elapsed: Duration,
}

/// One running invocation.
pub struct InvocationThread {
    command: ExecutableCommand,
    device: DeviceHandle,
    cancel: CancellationToken,
    started: Instant,
    status: Mutex<InvocationStatus>,
    pub(crate) release: DeviceRelease,
    pub(crate) listeners: Vec<Arc<dyn ScheduledInvocationListener>>,
}

impl InvocationThread {
    pub(crate) fn new(
        command: ExecutableCommand,
        device: DeviceHandle,
        release: DeviceRelease,
        listeners: Vec<Arc<dyn ScheduledInvocationListener>>,
    ) -> Self {
        Self {
            command,
            device,
            cancel: CancellationToken::new(),
            started: Instant::now(),
            status: Mutex::new(InvocationStatus::Starting),
            release,
            listeners,
        }
    }

    pub fn command(&self) -> &ExecutableCommand {
        &self.command
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn status(&self) -> InvocationStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: InvocationStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Ask the invocation to stop: kill on-device processes (best effort)
    /// and fire the cancellation token.
    pub fn stop_invocation(&self, reason: &str) {
        let serial = self.device.serial();
        info!(serial, command_id = self.command.command_id(), reason, "stopping invocation");
        if self.device.is_online() {
            if let Err(e) = self.device.execute_shell_command(KILL_ALL_COMMAND) {
                warn!(serial, error = %e, "failed to kill processes on device");
            }
        }
        self.set_status(InvocationStatus::Stopping);
        self.cancel.cancel();
    }

    /// Stop the invocation when the device battery fell below the command's
    /// cutoff.  Returns whether it was stopped.
    ///
    /// A level of 0 or no reading at all means the device has no usable
    /// battery information and never triggers the cutoff.
    pub fn check_device_battery_level(&self) -> bool {
        let Some(cutoff) = self.command.configuration().device_options.cutoff_battery else {
            return false;
        };
        if self.cancel.is_cancelled() {
            return false;
        }
        let level = self.device.battery_level();
        debug!(serial = self.device.serial(), ?level, "battery level");
        match level {
            Some(level) if 0 < level && level < cutoff => {
                self.stop_invocation(&format!("battery too low ({level}% < {cutoff}%)"));
                true
            }
            _ => false,
        }
    }

    /// Run the invocation to completion on the current (blocking) thread.
    ///
    /// Never panics: a panicking runner is treated as a failed invocation.
    pub(crate) fn run(
        &self,
        runner: &dyn InvocationRunner,
        rescheduler: Arc<dyn Rescheduler>,
    ) -> InvocationOutcome {
        self.set_status(InvocationStatus::Running);
        let serial = self.device.serial();
        let ctx = InvocationContext {
            command_id: self.command.command_id(),
            device: Arc::clone(&self.device),
            config: self.command.configuration().clone(),
            rescheduler,
            cancel: self.cancel.clone(),
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| runner.invoke(ctx)));

        let mut fatal = false;
        let mut state = match result {
            Ok(Ok(())) => FreeDeviceState::Available,
            Ok(Err(InvocationError::DeviceUnresponsive { reason, .. })) => {
                warn!(serial, reason = %reason, "device is unresponsive");
                FreeDeviceState::Unresponsive
            }
            Ok(Err(InvocationError::DeviceNotAvailable { reason, .. })) => {
                warn!(serial, reason = %reason, "device is not available");
                FreeDeviceState::Unavailable
            }
            Ok(Err(InvocationError::FatalHost(msg))) => {
                error!(serial, "fatal error occurred: {msg}, shutting down");
                fatal = true;
                FreeDeviceState::Available
            }
            Ok(Err(InvocationError::Interrupted)) => {
                info!(serial, "invocation interrupted");
                FreeDeviceState::Available
            }
            Ok(Err(e)) => {
                error!(serial, error = %e, "invocation failed");
                FreeDeviceState::Available
            }
            Err(_) => {
                error!(serial, "invocation panicked");
                FreeDeviceState::Available
            }
        };

        if !self.device.is_online() {
            state = FreeDeviceState::Unavailable;
        }
        let elapsed = self.started.elapsed();
        info!(
            command_id = self.command.command_id(),
            elapsed_ms = elapsed.as_millis() as u64,
            "updating command with elapsed time"
        );
        InvocationOutcome {
            state,
            fatal,
            elapsed,
        }
    }
}

impl fmt::Debug for InvocationThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationThread")
            .field("command_id", &self.command.command_id())
            .field("device", &self.device.serial())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
