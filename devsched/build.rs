/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

/// Build script – generates the `RemoteControl` gRPC service stubs.
///
/// The message types are plain `prost::Message` derives living in
/// `src/remote/proto.rs`, so no `.proto` file (and no `protoc`) is involved:
/// tonic-build's manual service builder emits the client and server code
/// straight from the method table below.  The generated file is written to
/// `OUT_DIR` and pulled into the crate by `src/remote/proto.rs`.

use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic::codec::ProstCodec";
const TYPES: &str = "crate::remote::proto";

fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("{TYPES}::{input}"))
        .output_type(format!("{TYPES}::{output}"))
        .codec_path(CODEC)
        .build()
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let service = Service::builder()
        .name("RemoteControl")
        .package("devsched.v1")
        .method(unary("allocate_device", "AllocateDevice", "DeviceRequest", "Ack"))
        .method(unary("free_device", "FreeDevice", "DeviceRequest", "Ack"))
        .method(unary("add_command", "AddCommand", "AddCommandRequest", "Ack"))
        .method(unary(
            "add_command_file",
            "AddCommandFile",
            "AddCommandFileRequest",
            "Ack",
        ))
        .method(unary(
            "start_handover",
            "StartHandover",
            "StartHandoverRequest",
            "Ack",
        ))
        .method(unary(
            "handover_init_complete",
            "HandoverInitComplete",
            "Empty",
            "Ack",
        ))
        .method(unary("handover_complete", "HandoverComplete", "Empty", "Ack"))
        .method(unary(
            "list_devices",
            "ListDevices",
            "Empty",
            "ListDevicesResponse",
        ))
        .build();

    // Both the client (handover initiator, devsched-ctl) and the server
    // (RemoteManager) live in this crate.
    Builder::new().compile(&[service]);
}
