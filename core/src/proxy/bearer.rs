//! Point-to-point bearer abstraction
//!
//! The bearer is the link-layer connection to a proxy node (a GATT
//! connection in practice). Platform code implements [`ProxyBearer`]; the
//! session only needs open/write/close and a stream of inbound frames.

use crate::address::HardwareAddress;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by a bearer implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BearerError {
    #[error("Bearer unavailable on this host")]
    Unavailable,
    #[error("Device {0} not found")]
    DeviceNotFound(HardwareAddress),
    #[error("Connect timed out")]
    Timeout,
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Proxy service missing on {0}")]
    ServiceMissing(HardwareAddress),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Not connected")]
    NotConnected,
}

/// Events delivered from the bearer to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BearerEvent {
    /// One notification from the proxy's data-out characteristic
    Frame(Vec<u8>),
    /// The link went down without the session asking for it
    Disconnected { reason: String },
}

/// An opened bearer link
#[derive(Debug)]
pub struct BearerLink {
    /// Negotiated maximum transfer size (ATT MTU)
    pub max_transfer_size: usize,
    /// Inbound frames and link loss notifications
    pub events: mpsc::UnboundedReceiver<BearerEvent>,
}

/// Platform bearer used by the proxy session
#[async_trait]
pub trait ProxyBearer: Send + Sync {
    /// False when the host has no usable adapter at all
    fn is_available(&self) -> bool;

    /// Open a link to `address`, negotiate the transfer size and enable
    /// inbound delivery.
    async fn open(
        &self,
        address: HardwareAddress,
        timeout: Duration,
    ) -> Result<BearerLink, BearerError>;

    /// Write one frame to the proxy's data-in characteristic
    async fn write(&self, frame: &[u8]) -> Result<(), BearerError>;

    /// Release the link
    async fn close(&self);
}
