//! Protocol listeners.

pub mod forward;
pub mod http;
pub mod tcp;
pub mod udp;

use crate::config::Protocol;
use crate::Result;
use async_trait::async_trait;
use std::net::SocketAddr;

pub use forward::{ListenerContext, ListenerSnapshot, SessionLimits, Transfer};

/// Fires once when the engine shuts down.
pub type ShutdownSignal = tokio::sync::broadcast::Receiver<()>;

/// A bound listener ready to serve.
#[async_trait]
pub trait Proxy: Send {
    fn protocol(&self) -> Protocol;

    /// Address actually bound, useful when the configured port is 0.
    fn local_addr(&self) -> SocketAddr;

    /// Accept and forward until `shutdown` fires.
    async fn run(self: Box<Self>, shutdown: ShutdownSignal) -> Result<()>;
}

pub(crate) fn bind_error(addr: SocketAddr, err: std::io::Error) -> crate::Error {
    crate::Error::Bind {
        address: addr.to_string(),
        reason: err.to_string(),
    }
}
