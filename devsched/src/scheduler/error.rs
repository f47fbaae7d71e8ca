/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Structured error types for the command scheduler.
//!
//! Two error enums model the two failure layers:
//!
//! * [`InvocationError`] - how a single invocation ended badly.  Reported by
//!   the [`InvocationRunner`](super::InvocationRunner) and translated into a
//!   [`FreeDeviceState`](crate::device::FreeDeviceState); only
//!   [`InvocationError::FatalHost`] escalates beyond its own invocation.
//! * [`SchedulerError`] - failure of a public scheduler operation, returned
//!   synchronously to the caller.
//!
//! Both are matched by the remote control service to pick a `tonic::Status`
//! code, so every variant carries the data needed for a useful message.

use thiserror::Error;

use crate::command::ConfigError;
use crate::remote::RemoteError;

// ── Invocation ────────────────────────────────────────────────────────────────

/// Why an invocation did not complete normally.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// The device stopped responding; it goes back to the pool as
    /// `Unresponsive`.
    #[error("device {serial} is unresponsive: {reason}")]
    DeviceUnresponsive { serial: String, reason: String },

    /// The device went away; it goes back to the pool as `Unavailable`.
    #[error("device {serial} is not available: {reason}")]
    DeviceNotAvailable { serial: String, reason: String },

    /// The host itself is broken; the whole scheduler shuts down.
    #[error("fatal host error: {0}")]
    FatalHost(String),

    /// The invocation observed its cancellation token and stopped early.
    #[error("invocation interrupted")]
    Interrupted,

    /// Any other failure of the run.  Logged; no escalation.
    #[error("invocation failed: {0}")]
    Failed(String),
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

/// Failure of a public [`CommandScheduler`](super::CommandScheduler) operation.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The operation requires [`start`](super::CommandScheduler::start) first.
    #[error("scheduler has not been started")]
    NotStarted,

    #[error("scheduler has already been started")]
    AlreadyStarted,

    /// `start` was called outside a tokio runtime.
    #[error("no tokio runtime available to drive the scheduler")]
    NoRuntime,

    /// The command (or command file) is malformed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Direct execution found no device matching the command.
    #[error("no device is available for command: {command}")]
    NoDeviceAvailable { command: String },

    /// An invocation is already running on this device.
    #[error("an invocation is already running on device {serial}")]
    DeviceBusy { serial: String },

    /// The device pool does not know this serial, or it is not held remotely.
    #[error("device {serial} not found")]
    DeviceNotFound { serial: String },

    /// A handover was already initiated from this instance.
    #[error("a handover has already been initiated")]
    HandoverInProgress,

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The scheduler no longer accepts work.
    #[error("scheduler is shutting down")]
    ShuttingDown,

    /// A diagnostics filter is not a valid regular expression.
    #[error("invalid command filter: {0}")]
    InvalidFilter(#[from] regex::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SchedulerError> for tonic::Status {
    fn from(err: SchedulerError) -> Self {
        let msg = err.to_string();
        match err {
            SchedulerError::Config(_) | SchedulerError::InvalidFilter(_) => {
                tonic::Status::invalid_argument(msg)
            }
            SchedulerError::DeviceNotFound { .. } => tonic::Status::not_found(msg),
            SchedulerError::DeviceBusy { .. } | SchedulerError::HandoverInProgress => {
                tonic::Status::failed_precondition(msg)
            }
            SchedulerError::NotStarted
            | SchedulerError::ShuttingDown
            | SchedulerError::NoDeviceAvailable { .. } => tonic::Status::unavailable(msg),
            _ => tonic::Status::internal(msg),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
