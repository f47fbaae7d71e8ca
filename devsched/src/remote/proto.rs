/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Wire messages of the `devsched.v1.RemoteControl` service and the
//! generated client / server stubs (see `build.rs`).

use crate::device::DeviceDescriptor;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceRequest {
    /// Device serial; `"*"` in a free request means every remote device.
    #[prost(string, tag = "1")]
    pub serial: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddCommandRequest {
    /// Execution time the command already accrued on the sender.
    #[prost(uint64, tag = "1")]
    pub exec_time_ms: u64,
    #[prost(string, repeated, tag = "2")]
    pub args: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddCommandFileRequest {
    #[prost(string, tag = "1")]
    pub path: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "2")]
    pub extra_args: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartHandoverRequest {
    /// Port of the requesting instance's temporary remote manager.
    #[prost(uint32, tag = "1")]
    pub port: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Empty {}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Ack {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceInfo {
    #[prost(string, tag = "1")]
    pub serial: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub product: ::prost::alloc::string::String,
    /// `Available`, `Allocated` or `Unavailable`.
    #[prost(string, tag = "3")]
    pub state: ::prost::alloc::string::String,
    #[prost(bool, tag = "4")]
    pub stub: bool,
    #[prost(uint32, optional, tag = "5")]
    pub battery: ::core::option::Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListDevicesResponse {
    #[prost(message, repeated, tag = "1")]
    pub devices: ::prost::alloc::vec::Vec<DeviceInfo>,
}

impl From<&DeviceDescriptor> for DeviceInfo {
    fn from(d: &DeviceDescriptor) -> Self {
        Self {
            serial: d.serial.clone(),
            product: d.product_type.clone(),
            state: d.state.to_string(),
            stub: d.stub,
            battery: d.battery.map(u32::from),
        }
    }
}

include!(concat!(env!("OUT_DIR"), "/devsched.v1.RemoteControl.rs"));
