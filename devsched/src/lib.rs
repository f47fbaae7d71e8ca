/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! devsched – device test command scheduler
//!
//! Module layout:
//!
//! ```text
//! lib.rs
//! ├── command/     – argument vectors → Configuration, command files
//! ├── config/      – YAML daemon configuration
//! ├── device/      – test device model and the device pool
//! ├── scheduler/   – command queue, invocations, shutdown, handover
//! ├── runner.rs    – host-process invocation runner
//! └── remote/      – gRPC remote control / handover channel
//! ```

pub mod command;
pub mod config;
pub mod device;
pub mod remote;
pub mod runner;
pub mod scheduler;
