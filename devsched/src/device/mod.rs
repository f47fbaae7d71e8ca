//! Device abstraction used by the scheduler.
//!
//! The scheduler never builds devices itself: it leases them from a
//! [`DevicePool`] by [`DeviceRequirements`], hands them to one invocation at a
//! time and returns them with a [`FreeDeviceState`] describing how the run
//! ended.
//!
//! ```text
//!   DevicePool::allocate(req) ──► DeviceHandle ──► invocation
//!        ▲                                            │
//!        └──────────── free(handle, FreeDeviceState) ◄┘
//! ```

pub mod pool;

pub use pool::{LocalDevice, StaticDevicePool};

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::command::options::DeviceSelectionArgs;

// ── Device handle ─────────────────────────────────────────────────────────────

/// Failure of a device-level operation.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device is not reachable (unplugged, rebooting …).
    #[error("device {serial} is offline")]
    Offline { serial: String },

    /// A shell command could not be run on the device.
    #[error("shell command '{command}' failed on {serial}: {reason}")]
    ShellFailed {
        serial: String,
        command: String,
        reason: String,
    },
}

/// A test target that can be leased to exactly one invocation at a time.
pub trait TestDevice: Send + Sync + fmt::Debug {
    fn serial(&self) -> &str;

    fn product_type(&self) -> &str;

    /// Stub devices are placeholders (e.g. "no device needed" runs); they are
    /// skipped by `--all-devices` fan-out.
    fn is_stub(&self) -> bool;

    fn is_online(&self) -> bool;

    /// Battery level in percent, `None` when the device cannot report one.
    fn battery_level(&self) -> Option<u8>;

    /// Run `command` in the device shell and return its output.
    fn execute_shell_command(&self, command: &str) -> Result<String, DeviceError>;
}

/// Shared handle to a leased device.
pub type DeviceHandle = Arc<dyn TestDevice>;

// ── Pool-side state ───────────────────────────────────────────────────────────

/// Allocation state of a device as seen by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    Available,
    Allocated,
    /// Known but not usable (offline or returned as unavailable).
    Unavailable,
}

impl fmt::Display for AllocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AllocationState::Available => "Available",
            AllocationState::Allocated => "Allocated",
            AllocationState::Unavailable => "Unavailable",
        };
        f.write_str(s)
    }
}

/// Snapshot of one device for listings and handover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub serial: String,
    pub product_type: String,
    pub stub: bool,
    pub state: AllocationState,
    pub battery: Option<u8>,
}

/// How an invocation left the device when it handed it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeDeviceState {
    /// Healthy; can be allocated again.
    Available,
    /// Did not respond during the run; the pool may try to recover it.
    Unresponsive,
    /// Gone (offline at end of run or explicitly lost).
    Unavailable,
    /// Return the lease without changing how the pool tracks the device.
    Ignore,
}

/// Callback invoked with the serial of a device that just became available.
pub type DeviceMonitor = Arc<dyn Fn(&str) + Send + Sync>;

// ── Requirements ──────────────────────────────────────────────────────────────

/// Filter a device must pass to be allocated for a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRequirements {
    /// Empty means "any serial".
    pub serials: Vec<String>,
    pub exclude_serials: Vec<String>,
    pub product_type: Option<String>,
    pub min_battery: Option<u8>,
}

impl DeviceRequirements {
    /// Returns `true` when `device` satisfies every constraint.
    ///
    /// A device that cannot report its battery passes a `min_battery` check.
    pub fn matches(&self, device: &dyn TestDevice) -> bool {
        let serial = device.serial();
        if !self.serials.is_empty() && !self.serials.iter().any(|s| s == serial) {
            return false;
        }
        if self.exclude_serials.iter().any(|s| s == serial) {
            return false;
        }
        if let Some(product) = &self.product_type {
            if product != device.product_type() {
                return false;
            }
        }
        match (self.min_battery, device.battery_level()) {
            (Some(min), Some(level)) => level >= min,
            _ => true,
        }
    }

    /// Pin these requirements to a single device.
    pub fn set_serial(&mut self, serial: impl Into<String>) {
        self.serials = vec![serial.into()];
    }
}

impl From<&DeviceSelectionArgs> for DeviceRequirements {
    fn from(args: &DeviceSelectionArgs) -> Self {
        Self {
            serials: args.serials.clone(),
            exclude_serials: args.exclude_serials.clone(),
            product_type: args.product_type.clone(),
            min_battery: args.min_battery,
        }
    }
}

/// Device-related options that act while the invocation is running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceOptions {
    /// Stop the invocation when the battery drops below this level.
    pub cutoff_battery: Option<u8>,
}

impl From<&DeviceSelectionArgs> for DeviceOptions {
    fn from(args: &DeviceSelectionArgs) -> Self {
        Self {
            cutoff_battery: args.cutoff_battery,
        }
    }
}

// ── Pool ──────────────────────────────────────────────────────────────────────

/// Source of devices for the scheduler.
///
/// Implementations must be safe to call from the scheduler loop and from
/// invocation threads concurrently.
pub trait DevicePool: Send + Sync {
    /// Lease the first available device matching `requirements`.
    fn allocate(&self, requirements: &DeviceRequirements) -> Option<DeviceHandle>;

    /// Mark `serial` allocated regardless of its current state, creating a
    /// placeholder entry when the pool has never seen it.
    ///
    /// Returns `None` when the device is already allocated.
    fn force_allocate(&self, serial: &str) -> Option<DeviceHandle>;

    /// Return a leased device.
    fn free(&self, device: DeviceHandle, state: FreeDeviceState);

    /// Snapshot of every device the pool knows about.
    fn list_devices(&self) -> Vec<DeviceDescriptor>;

    /// Register a callback fired whenever a device becomes available.
    fn add_monitor(&self, monitor: DeviceMonitor);

    /// Stop handing out devices.
    fn terminate(&self);

    /// Stop handing out devices and drop every connection immediately.
    fn terminate_hard(&self);
}

// ── Tests ─────────────────────────────────────────────────────────────────────
