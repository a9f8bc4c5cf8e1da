// Proxy module: bearer abstraction, SAR framing, session and filter

pub mod bearer;
pub mod filter;
pub mod pdu;
pub mod session;

pub use bearer::{BearerError, BearerEvent, BearerLink, ProxyBearer};
pub use filter::{FilterManager, FilterState};
pub use pdu::{segment, ProxyPdu, ProxyPduType, Reassembler, SarError, SarMarker};
pub use session::{ProxySession, SessionError, SessionState};
