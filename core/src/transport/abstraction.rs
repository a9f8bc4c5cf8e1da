//! Transport abstraction layer
//!
//! A transport delivers one outbound on/off message to its destination. The
//! router holds a primary transport (the proxy session) and optionally a
//! fallback (direct GATT control) used only when the primary reports itself
//! unavailable.

use crate::events::StatusEvent;
use crate::message::OnOffMessage;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Transports the router can deliver through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Mesh network PDUs over the proxy session
    Proxy,
    /// Per-device characteristic writes
    GattFallback,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Proxy => write!(f, "Proxy"),
            TransportKind::GattFallback => write!(f, "GattFallback"),
        }
    }
}

/// Whether a transport can be used right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Usable immediately
    Ready,
    /// Usable after a connection is (re)established
    Idle,
    /// Cannot be used on this host at all
    Unavailable,
}

/// An on/off message ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Local identity address
    pub source: u16,
    pub destination: u16,
    /// Sequence number reserved for this message
    pub seq: u32,
    pub ttl: u8,
    pub message: OnOffMessage,
}

impl fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} 0x{:04X} -> 0x{:04X} (seq {})",
            self.message, self.source, self.destination, self.seq
        )
    }
}

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Definite: this transport cannot be used on this host
    #[error("Transport not available: {0}")]
    Unavailable(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Encoding failed: {0}")]
    Encoding(String),

    /// Missing key material or identity; never retried
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl TransportError {
    /// Only a definite unavailability justifies switching transports
    pub fn is_unavailable(&self) -> bool {
        matches!(self, TransportError::Unavailable(_))
    }
}

/// Delivery capability shared by the proxy and the GATT fallback
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn availability(&self) -> Availability;

    /// Deliver one message. Returns any statuses observed synchronously
    /// while delivering (the fallback reads state back directly).
    async fn deliver(&self, message: &OutboundMessage) -> Result<Vec<StatusEvent>, TransportError>;
}
