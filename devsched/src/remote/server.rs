/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Serving side of the remote control channel.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use super::proto::remote_control_server::{RemoteControl, RemoteControlServer};
use super::proto::{
    Ack, AddCommandFileRequest, AddCommandRequest, DeviceInfo, DeviceRequest, Empty,
    ListDevicesResponse, StartHandoverRequest,
};
use super::RemoteError;
use crate::device::DeviceDescriptor;
use crate::scheduler::SchedulerError;

/// How long a stopping server may take to drain its connections.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ── Handler ───────────────────────────────────────────────────────────────────

/// What the remote control service does for each call.
#[tonic::async_trait]
pub trait RemoteCommandHandler: Send + Sync {
    /// Take `serial` out of the local pool on behalf of the peer.
    fn allocate_device(&self, serial: &str) -> Result<(), SchedulerError>;

    /// Return a device taken by [`allocate_device`](Self::allocate_device);
    /// `"*"` returns all of them.
    fn free_device(&self, serial: &str) -> Result<(), SchedulerError>;

    /// Queue a command that already ran for `exec_time` elsewhere.
    fn add_command(&self, exec_time: Duration, args: Vec<String>) -> Result<bool, SchedulerError>;

    fn add_command_file(&self, path: &Path, extra_args: Vec<String>) -> Result<(), SchedulerError>;

    /// Hand everything over to the instance whose remote manager listens on
    /// `port`, then shut down.
    async fn start_handover(&self, port: u16) -> Result<(), SchedulerError>;

    fn handover_init_complete(&self);

    /// The peer has exited; take over its port.
    fn handover_complete(&self);

    fn list_devices(&self) -> Vec<DeviceDescriptor>;
}

// ── gRPC service ──────────────────────────────────────────────────────────────

struct RemoteControlService {
    handler: Arc<dyn RemoteCommandHandler>,
}

fn ack() -> Response<Ack> {
    Response::new(Ack { success: true })
}

#[tonic::async_trait]
impl RemoteControl for RemoteControlService {
    async fn allocate_device(
        &self,
        request: Request<DeviceRequest>,
    ) -> Result<Response<Ack>, Status> {
        let serial = request.into_inner().serial;
        debug!(serial = %serial, "remote: allocate device");
        self.handler.allocate_device(&serial)?;
        Ok(ack())
    }

    async fn free_device(&self, request: Request<DeviceRequest>) -> Result<Response<Ack>, Status> {
        let serial = request.into_inner().serial;
        debug!(serial = %serial, "remote: free device");
        self.handler.free_device(&serial)?;
        Ok(ack())
    }

    async fn add_command(
        &self,
        request: Request<AddCommandRequest>,
    ) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        debug!(args = req.args.len(), exec_time_ms = req.exec_time_ms, "remote: add command");
        let added = self
            .handler
            .add_command(Duration::from_millis(req.exec_time_ms), req.args)?;
        Ok(Response::new(Ack { success: added }))
    }

    async fn add_command_file(
        &self,
        request: Request<AddCommandFileRequest>,
    ) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        debug!(path = %req.path, "remote: add command file");
        self.handler
            .add_command_file(&PathBuf::from(req.path), req.extra_args)?;
        Ok(ack())
    }

    async fn start_handover(
        &self,
        request: Request<StartHandoverRequest>,
    ) -> Result<Response<Ack>, Status> {
        let port = request.into_inner().port;
        let port = u16::try_from(port)
            .map_err(|_| Status::invalid_argument(format!("invalid handover port {port}")))?;
        info!(port, "remote: handover requested");
        self.handler.start_handover(port).await?;
        Ok(ack())
    }

    async fn handover_init_complete(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Ack>, Status> {
        self.handler.handover_init_complete();
        Ok(ack())
    }

    async fn handover_complete(&self, _request: Request<Empty>) -> Result<Response<Ack>, Status> {
        self.handler.handover_complete();
        Ok(ack())
    }

    async fn list_devices(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<ListDevicesResponse>, Status> {
        let devices = self
            .handler
            .list_devices()
            .iter()
            .map(DeviceInfo::from)
            .collect();
        Ok(Response::new(ListDevicesResponse { devices }))
    }
}

// ── RemoteManager ─────────────────────────────────────────────────────────────

/// A running remote control server.
#[derive(Debug)]
pub struct RemoteManager {
    port: u16,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RemoteManager {
    /// Serve `handler` on `127.0.0.1:port`; port `0` picks a free one.
    ///
    /// # Errors
    /// [`RemoteError::Bind`] when the port is taken.
    pub async fn bind(
        handler: Arc<dyn RemoteCommandHandler>,
        port: u16,
    ) -> Result<Self, RemoteError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|source| RemoteError::Bind { port, source })?;
        let port = listener
            .local_addr()
            .map_err(|source| RemoteError::Bind { port, source })?
            .port();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let service = RemoteControlServer::new(RemoteControlService { handler });
        let task = tokio::spawn(async move {
            let incoming = TcpListenerStream::new(listener);
            let result = Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(incoming, async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(port, error = %e, "remote manager failed");
            }
            debug!(port, "remote manager stopped");
        });
        Ok(Self { port, cancel, task })
    }

    /// Actual listening port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting calls; in-flight calls are allowed to finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// [`cancel`](Self::cancel) and wait until the port is released.
    pub async fn cancel_and_wait(self) {
        self.cancel();
        let abort = self.task.abort_handle();
        match tokio::time::timeout(SHUTDOWN_GRACE, self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(port = self.port, error = %e, "remote manager task failed"),
            Err(_) => {
                warn!(port = self.port, "remote manager did not drain in time, aborting");
                abort.abort();
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
