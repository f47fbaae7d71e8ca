/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Calling side of the remote control channel.

use std::path::Path;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use super::proto::remote_control_client::RemoteControlClient;
use super::proto::{
    AddCommandFileRequest, AddCommandRequest, DeviceInfo, DeviceRequest, Empty,
    StartHandoverRequest,
};
use super::RemoteError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection to the remote manager of another instance on this host.
///
/// Cheap to clone; clones share the underlying HTTP/2 channel.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    inner: RemoteControlClient<Channel>,
    port: u16,
}

impl RemoteClient {
    /// # Errors
    /// [`RemoteError::Connect`] when nothing listens on `port`.
    pub async fn connect(port: u16) -> Result<Self, RemoteError> {
        let endpoint = Endpoint::from_shared(format!("http://127.0.0.1:{port}"))
            .map_err(|e| RemoteError::Endpoint(e.to_string()))?
            .connect_timeout(CONNECT_TIMEOUT);
        let channel = endpoint
            .connect()
            .await
            .map_err(|source| RemoteError::Connect { port, source })?;
        Ok(Self {
            inner: RemoteControlClient::new(channel),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn client(&self) -> RemoteControlClient<Channel> {
        self.inner.clone()
    }

    pub async fn send_allocate_device(&self, serial: &str) -> Result<(), RemoteError> {
        self.client()
            .allocate_device(DeviceRequest {
                serial: serial.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn send_free_device(&self, serial: &str) -> Result<(), RemoteError> {
        self.client()
            .free_device(DeviceRequest {
                serial: serial.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Returns whether the peer queued the command (help and dry-run
    /// commands are accepted but not queued).
    pub async fn send_add_command(
        &self,
        exec_time: Duration,
        args: &[String],
    ) -> Result<bool, RemoteError> {
        let exec_time_ms = u64::try_from(exec_time.as_millis()).unwrap_or(u64::MAX);
        let ack = self
            .client()
            .add_command(AddCommandRequest {
                exec_time_ms,
                args: args.to_vec(),
            })
            .await?;
        Ok(ack.into_inner().success)
    }

    pub async fn send_add_command_file(
        &self,
        path: &Path,
        extra_args: &[String],
    ) -> Result<(), RemoteError> {
        self.client()
            .add_command_file(AddCommandFileRequest {
                path: path.to_string_lossy().into_owned(),
                extra_args: extra_args.to_vec(),
            })
            .await?;
        Ok(())
    }

    pub async fn send_start_handover(&self, port: u16) -> Result<(), RemoteError> {
        self.client()
            .start_handover(StartHandoverRequest {
                port: u32::from(port),
            })
            .await?;
        Ok(())
    }

    pub async fn send_handover_init_complete(&self) -> Result<(), RemoteError> {
        self.client().handover_init_complete(Empty {}).await?;
        Ok(())
    }

    pub async fn send_handover_complete(&self) -> Result<(), RemoteError> {
        self.client().handover_complete(Empty {}).await?;
        Ok(())
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>, RemoteError> {
        let resp = self.client().list_devices(Empty {}).await?;
        Ok(resp.into_inner().devices)
    }
}
