// Transport module: delivery capability, proxy transport and GATT fallback

pub mod abstraction;
pub mod gatt;
pub mod proxy;

pub use abstraction::{Availability, OutboundMessage, Transport, TransportError, TransportKind};
pub use gatt::{choose_characteristic, CharacteristicInfo, GattError, GattFallbackController, GattLink};
pub use proxy::ProxyTransport;
