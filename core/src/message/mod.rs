// Message module: access layer, network codec and routing

pub mod codec;
pub mod echo;
pub mod onoff;
pub mod router;

pub use codec::{ClearCodec, CodecError, MeshCodec, NetworkMessage, PduHeader};
pub use echo::EchoFilter;
pub use onoff::{FilterType, OnOffMessage, ProxyConfigMessage, TidCounter};
pub use router::{Delivery, MessageRouter, RouterParts};
