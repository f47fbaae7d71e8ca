//! Remote control channel between scheduler instances.
//!
//! A [`RemoteManager`] serves the `devsched.v1.RemoteControl` gRPC service
//! on localhost and forwards every call to a [`RemoteCommandHandler`] (the
//! scheduler).  A [`RemoteClient`] is the calling side, used by an instance
//! that hands its work over and by `devsched-ctl`.
//!
//! # Handover
//!
//! ```text
//!  old instance (A, default port)          new instance (B)
//!  ─────────────────────────────          ─────────────────
//!                                  ◄────  StartHandover(tmp port)
//!  AllocateDevice(serial) × n      ────►
//!  AddCommandFile / AddCommand × n ────►
//!  HandoverInitComplete            ────►
//!  FreeDevice(serial) as runs end  ────►
//!  HandoverComplete (on exit)      ────►  rebinds the default port
//! ```

pub mod client;
pub mod proto;
pub mod server;

pub use client::RemoteClient;
pub use server::{RemoteCommandHandler, RemoteManager};

use thiserror::Error;

/// Failure on the remote control channel.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("invalid remote endpoint: {0}")]
    Endpoint(String),

    #[error("cannot connect to remote manager on port {port}: {source}")]
    Connect {
        port: u16,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("cannot bind remote manager to port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The peer answered with an error status.
    #[error("remote call failed: {0}")]
    Status(#[from] tonic::Status),
}
