/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Invocation runner that executes each command as a host process.
//!
//! The configuration name is the program (or, with a launcher, its first
//! argument) and the pass-through arguments follow it.  The leased device is
//! exported through the environment so the workload can address it.

use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::scheduler::{InvocationContext, InvocationError, InvocationRunner};

/// Environment variable carrying the serial of the leased device.
pub const SERIAL_ENV: &str = "ANDROID_SERIAL";

/// Environment variable carrying the scheduler's command id.
pub const COMMAND_ID_ENV: &str = "DEVSCHED_COMMAND_ID";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default)]
pub struct HostCommandRunner {
    /// Run `<launcher> <name> <args...>` instead of `<name> <args...>`.
    launcher: Option<PathBuf>,
}

impl HostCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_launcher(mut self, launcher: impl Into<PathBuf>) -> Self {
        self.launcher = Some(launcher.into());
        self
    }

    fn command_for(&self, ctx: &InvocationContext) -> Command {
        let mut cmd = match &self.launcher {
            Some(launcher) => {
                let mut cmd = Command::new(launcher);
                cmd.arg(&ctx.config.name);
                cmd
            }
            None => Command::new(&ctx.config.name),
        };
        cmd.args(&ctx.config.test_args)
            .env(SERIAL_ENV, ctx.device.serial())
            .env(COMMAND_ID_ENV, ctx.command_id.to_string())
            .stdin(Stdio::null());
        cmd
    }
}

fn check_exit(name: &str, status: ExitStatus) -> Result<(), InvocationError> {
    if status.success() {
        Ok(())
    } else {
        Err(InvocationError::Failed(format!("{name} exited with {status}")))
    }
}

impl InvocationRunner for HostCommandRunner {
    fn invoke(&self, ctx: InvocationContext) -> Result<(), InvocationError> {
        let name = ctx.config.name.clone();
        let mut child = self
            .command_for(&ctx)
            .spawn()
            .map_err(|e| InvocationError::Failed(format!("cannot start {name}: {e}")))?;
        info!(
            command_id = ctx.command_id,
            serial = ctx.device.serial(),
            pid = child.id(),
            "started {name}"
        );

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(command_id = ctx.command_id, %status, "{name} exited");
                    return check_exit(&name, status);
                }
                Ok(None) if ctx.is_cancelled() => {
                    warn!(command_id = ctx.command_id, "killing {name}");
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(InvocationError::Interrupted);
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    let _ = child.kill();
                    return Err(InvocationError::Failed(format!("cannot poll {name}: {e}")));
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
