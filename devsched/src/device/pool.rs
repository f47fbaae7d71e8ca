/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! In-memory device pool.
//!
//! [`StaticDevicePool`] owns a fixed (but growable) set of devices, typically
//! the `devices:` list of the daemon YAML.  [`LocalDevice`] is the device
//! type it creates for those entries: it records every shell command it is
//! asked to run and lets callers flip its online state and battery level.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use super::{
    AllocationState, DeviceDescriptor, DeviceError, DeviceHandle, DeviceMonitor, DevicePool,
    DeviceRequirements, FreeDeviceState, TestDevice,
};

/// Product type given to devices the pool creates on `force_allocate`.
const UNKNOWN_PRODUCT: &str = "unknown";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── LocalDevice ───────────────────────────────────────────────────────────────

/// A device described by configuration rather than discovered on a bus.
#[derive(Debug)]
pub struct LocalDevice {
    serial: String,
    product_type: String,
    stub: bool,
    online: AtomicBool,
    battery: Mutex<Option<u8>>,
    shell_history: Mutex<Vec<String>>,
}

impl LocalDevice {
    pub fn new(serial: impl Into<String>, product_type: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            product_type: product_type.into(),
            stub: false,
            online: AtomicBool::new(true),
            battery: Mutex::new(None),
            shell_history: Mutex::new(Vec::new()),
        }
    }

    pub fn with_stub(mut self, stub: bool) -> Self {
        self.stub = stub;
        self
    }

    pub fn with_battery(self, level: Option<u8>) -> Self {
        *lock(&self.battery) = level;
        self
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_battery(&self, level: Option<u8>) {
        *lock(&self.battery) = level;
    }

    /// Every shell command run on this device so far, oldest first.
    pub fn shell_history(&self) -> Vec<String> {
        lock(&self.shell_history).clone()
    }
}

impl TestDevice for LocalDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn product_type(&self) -> &str {
        &self.product_type
    }

    fn is_stub(&self) -> bool {
        self.stub
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn battery_level(&self) -> Option<u8> {
        *lock(&self.battery)
    }

    fn execute_shell_command(&self, command: &str) -> Result<String, DeviceError> {
        if !self.is_online() {
            return Err(DeviceError::Offline {
                serial: self.serial.clone(),
            });
        }
        debug!(serial = %self.serial, command, "shell");
        lock(&self.shell_history).push(command.to_string());
        Ok(String::new())
    }
}

// ── StaticDevicePool ──────────────────────────────────────────────────────────

struct PoolEntry {
    device: DeviceHandle,
    state: AllocationState,
}

#[derive(Default)]
struct PoolInner {
    /// Keyed by serial so allocation order is deterministic.
    devices: BTreeMap<String, PoolEntry>,
    terminated: bool,
}

/// Device pool over a set of devices registered up front or via
/// [`add_device`](Self::add_device).
#[derive(Default)]
pub struct StaticDevicePool {
    inner: Mutex<PoolInner>,
    monitors: Mutex<Vec<DeviceMonitor>>,
}

impl StaticDevicePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool that starts out with `devices`.
    pub fn from_devices(devices: impl IntoIterator<Item = DeviceHandle>) -> Self {
        let pool = Self::new();
        {
            let mut inner = lock(&pool.inner);
            for device in devices {
                let state = initial_state(device.as_ref());
                inner
                    .devices
                    .insert(device.serial().to_string(), PoolEntry { device, state });
            }
        }
        pool
    }

    /// Register (or re-register) a device.
    ///
    /// An online device becomes available immediately and the monitors are
    /// told about it.  Re-adding an allocated device is ignored.
    pub fn add_device(&self, device: DeviceHandle) {
        let serial = device.serial().to_string();
        let state = initial_state(device.as_ref());
        {
            let mut inner = lock(&self.inner);
            if let Some(existing) = inner.devices.get(&serial) {
                if existing.state == AllocationState::Allocated {
                    warn!(serial = %serial, "ignoring re-add of allocated device");
                    return;
                }
            }
            inner.devices.insert(serial.clone(), PoolEntry { device, state });
        }
        info!(serial = %serial, %state, "device added to pool");
        if state == AllocationState::Available {
            self.notify_available(&serial);
        }
    }

    /// Current allocation state of `serial`, if the pool knows it.
    pub fn state_of(&self, serial: &str) -> Option<AllocationState> {
        lock(&self.inner).devices.get(serial).map(|e| e.state)
    }

    // Monitors run outside the pool lock; they typically call back into the
    // scheduler, which may in turn allocate.
    fn notify_available(&self, serial: &str) {
        let monitors: Vec<DeviceMonitor> = lock(&self.monitors).clone();
        for monitor in monitors {
            monitor(serial);
        }
    }
}

fn initial_state(device: &dyn TestDevice) -> AllocationState {
    if device.is_online() {
        AllocationState::Available
    } else {
        AllocationState::Unavailable
    }
}

impl DevicePool for StaticDevicePool {
    fn allocate(&self, requirements: &DeviceRequirements) -> Option<DeviceHandle> {
        let mut inner = lock(&self.inner);
        if inner.terminated {
            return None;
        }
        let entry = inner.devices.values_mut().find(|e| {
            e.state == AllocationState::Available
                && e.device.is_online()
                && requirements.matches(e.device.as_ref())
        })?;
        entry.state = AllocationState::Allocated;
        debug!(serial = %entry.device.serial(), "device allocated");
        Some(Arc::clone(&entry.device))
    }

    fn force_allocate(&self, serial: &str) -> Option<DeviceHandle> {
        let mut inner = lock(&self.inner);
        let entry = inner
            .devices
            .entry(serial.to_string())
            .or_insert_with(|| PoolEntry {
                device: Arc::new(LocalDevice::new(serial, UNKNOWN_PRODUCT)),
                state: AllocationState::Unavailable,
            });
        if entry.state == AllocationState::Allocated {
            return None;
        }
        entry.state = AllocationState::Allocated;
        debug!(serial, "device force-allocated");
        Some(Arc::clone(&entry.device))
    }

    fn free(&self, device: DeviceHandle, state: FreeDeviceState) {
        let serial = device.serial().to_string();
        let became_available = {
            let mut inner = lock(&self.inner);
            let terminated = inner.terminated;
            let Some(entry) = inner.devices.get_mut(&serial) else {
                warn!(serial = %serial, "freeing device unknown to the pool");
                return;
            };
            if entry.state != AllocationState::Allocated {
                warn!(serial = %serial, state = %entry.state, "freeing device that is not allocated");
            }
            match state {
                FreeDeviceState::Ignore => {
                    inner.devices.remove(&serial);
                    false
                }
                FreeDeviceState::Unavailable => {
                    entry.state = AllocationState::Unavailable;
                    false
                }
                FreeDeviceState::Available | FreeDeviceState::Unresponsive => {
                    if device.is_online() {
                        entry.state = AllocationState::Available;
                        !terminated
                    } else {
                        entry.state = AllocationState::Unavailable;
                        false
                    }
                }
            }
        };
        debug!(serial = %serial, ?state, "device freed");
        if became_available {
            self.notify_available(&serial);
        }
    }

    fn list_devices(&self) -> Vec<DeviceDescriptor> {
        lock(&self.inner)
            .devices
            .values()
            .map(|e| DeviceDescriptor {
                serial: e.device.serial().to_string(),
                product_type: e.device.product_type().to_string(),
                stub: e.device.is_stub(),
                state: e.state,
                battery: e.device.battery_level(),
            })
            .collect()
    }

    fn add_monitor(&self, monitor: DeviceMonitor) {
        lock(&self.monitors).push(monitor);
    }

    fn terminate(&self) {
        lock(&self.inner).terminated = true;
        info!("device pool terminated");
    }

    fn terminate_hard(&self) {
        let mut inner = lock(&self.inner);
        inner.terminated = true;
        for entry in inner.devices.values_mut() {
            if entry.state == AllocationState::Available {
                entry.state = AllocationState::Unavailable;
            }
        }
        warn!("device pool terminated forcefully");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
