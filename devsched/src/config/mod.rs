//! Daemon configuration loading.
//!
//! The expected YAML structure is (every key optional):
//! ```yaml
//! scheduler:
//!   max_poll_time_ms: 30000
//!   reload_cmdfiles: true
//!   cmdfile_poll_interval_ms: 20000
//!   shutdown_on_cmdfile_error: false
//! remote:
//!   start_on_boot: true
//!   port: 30103
//!   auto_handover: false
//!   handover_init_timeout_ms: 120000
//!   rebind_attempts: 10
//!   rebind_delay_ms: 2000
//! devices:
//!   - serial: emulator-5554
//!     product: sdk_phone
//!     battery: 80
//!   - serial: stub-0
//!     stub: true
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::device::{DeviceHandle, LocalDevice, StaticDevicePool};

/// Default port of the remote control channel.
pub const DEFAULT_REMOTE_PORT: u16 = 30103;

// ── Sections ──────────────────────────────────────────────────────────────────

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub scheduler: SchedulerSection,
    pub remote: RemoteSection,
    pub devices: Vec<DeviceEntry>,
}

/// Main-loop and command-file behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSection {
    /// Upper bound on how long the main loop sleeps without being signalled.
    pub max_poll_time_ms: u64,
    /// Watch command files and re-add their commands when they change.
    pub reload_cmdfiles: bool,
    pub cmdfile_poll_interval_ms: u64,
    /// Shut the scheduler down when a command file fails to load.
    pub shutdown_on_cmdfile_error: bool,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_poll_time_ms: 30_000,
            reload_cmdfiles: false,
            cmdfile_poll_interval_ms: 20_000,
            shutdown_on_cmdfile_error: false,
        }
    }
}

impl SchedulerSection {
    pub fn max_poll_time(&self) -> Duration {
        Duration::from_millis(self.max_poll_time_ms)
    }

    pub fn cmdfile_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cmdfile_poll_interval_ms)
    }
}

/// Remote control channel and handover.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteSection {
    /// Start the remote manager together with the scheduler.
    pub start_on_boot: bool,
    pub port: u16,
    /// When the port is taken, ask the instance holding it to hand over.
    pub auto_handover: bool,
    pub handover_init_timeout_ms: u64,
    /// Attempts to bind `port` after a handover completes.
    pub rebind_attempts: u32,
    pub rebind_delay_ms: u64,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            start_on_boot: false,
            port: DEFAULT_REMOTE_PORT,
            auto_handover: false,
            handover_init_timeout_ms: 120_000,
            rebind_attempts: 10,
            rebind_delay_ms: 2_000,
        }
    }
}

impl RemoteSection {
    pub fn handover_init_timeout(&self) -> Duration {
        Duration::from_millis(self.handover_init_timeout_ms)
    }

    pub fn rebind_delay(&self) -> Duration {
        Duration::from_millis(self.rebind_delay_ms)
    }
}

/// One statically configured device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceEntry {
    pub serial: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub stub: bool,
    #[serde(default)]
    pub battery: Option<u8>,
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SchedulerConfig {
    /// Parses `path` into a configuration.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or if the YAML does not
    /// match the expected layout.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading scheduler configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open configuration file: {}", path.display()))?;

        // An empty document deserialises as unit, not as an empty map.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: SchedulerConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML file: {}", path.display()))?;

        for device in &config.devices {
            debug!(
                "  Device: {} | product: {} | stub: {}",
                device.serial, device.product, device.stub
            );
        }
        info!(
            devices = config.devices.len(),
            remote_on_boot = config.remote.start_on_boot,
            reload_cmdfiles = config.scheduler.reload_cmdfiles,
            "scheduler configuration loaded"
        );
        Ok(config)
    }

    /// Build the in-memory pool described by the `devices:` section.
    pub fn build_device_pool(&self) -> StaticDevicePool {
        StaticDevicePool::from_devices(self.devices.iter().map(|d| {
            Arc::new(
                LocalDevice::new(d.serial.clone(), d.product.clone())
                    .with_stub(d.stub)
                    .with_battery(d.battery),
            ) as DeviceHandle
        }))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DevicePool;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn yaml_tempfile(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn load_full_yaml() {
        let yaml = r#"
scheduler:
  max_poll_time_ms: 500
  reload_cmdfiles: true
remote:
  start_on_boot: true
  port: 40000
  auto_handover: true
devices:
  - serial: emulator-5554
    product: sdk_phone
    battery: 80
  - serial: stub-0
    stub: true
"#;
        let f = yaml_tempfile(yaml);
        let cfg = SchedulerConfig::load_from_file(f.path()).unwrap();

        assert_eq!(cfg.scheduler.max_poll_time(), Duration::from_millis(500));
        assert!(cfg.scheduler.reload_cmdfiles);
        assert_eq!(cfg.scheduler.cmdfile_poll_interval_ms, 20_000);
        assert!(cfg.remote.start_on_boot);
        assert_eq!(cfg.remote.port, 40000);
        assert!(cfg.remote.auto_handover);
        assert_eq!(cfg.remote.rebind_attempts, 10);
        assert_eq!(cfg.devices.len(), 2);
        assert_eq!(cfg.devices[0].battery, Some(80));
        assert!(cfg.devices[1].stub);
        assert_eq!(cfg.devices[1].product, "");
    }

    #[test]
    fn empty_file_yields_defaults() {
        let f = yaml_tempfile("");
        let cfg = SchedulerConfig::load_from_file(f.path()).unwrap();
        assert_eq!(cfg, SchedulerConfig::default());
        assert_eq!(cfg.remote.port, DEFAULT_REMOTE_PORT);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let f = yaml_tempfile("scheduler:\n  max_poll: 1\n");
        assert!(SchedulerConfig::load_from_file(f.path()).is_err());
    }

    #[test]
    fn missing_file_returns_error() {
        let result = SchedulerConfig::load_from_file(Path::new("/nonexistent/devsched.yaml"));
        assert!(result.is_err());
    }

    #[test]
    fn malformed_yaml_returns_error() {
        let f = yaml_tempfile("this is: not: valid: yaml: content:::");
        assert!(SchedulerConfig::load_from_file(f.path()).is_err());
    }

    #[test]
    fn device_pool_is_built_from_device_list() {
        let f = yaml_tempfile("devices:\n  - serial: a\n  - serial: b\n    stub: true\n");
        let cfg = SchedulerConfig::load_from_file(f.path()).unwrap();
        let pool = cfg.build_device_pool();
        let devices = pool.list_devices();
        assert_eq!(devices.len(), 2);
        assert!(!devices[0].stub);
        assert!(devices[1].stub);
    }
}
