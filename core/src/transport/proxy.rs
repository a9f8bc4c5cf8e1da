//! Primary transport: network PDUs over the proxy session

use crate::events::StatusEvent;
use crate::message::{CodecError, EchoFilter, MeshCodec, PduHeader};
use crate::proxy::{FilterManager, ProxyPduType, ProxySession, SessionError};
use crate::transport::abstraction::{Availability, OutboundMessage, Transport, TransportError, TransportKind};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

/// Delivers messages through the connected proxy
pub struct ProxyTransport {
    session: ProxySession,
    filter: FilterManager,
    codec: Arc<dyn MeshCodec>,
    echo: Arc<EchoFilter>,
}

impl ProxyTransport {
    pub fn new(
        session: ProxySession,
        filter: FilterManager,
        codec: Arc<dyn MeshCodec>,
        echo: Arc<EchoFilter>,
    ) -> Self {
        Self {
            session,
            filter,
            codec,
            echo,
        }
    }
}

#[async_trait]
impl Transport for ProxyTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Proxy
    }

    fn availability(&self) -> Availability {
        if !self.session.bearer_available() {
            Availability::Unavailable
        } else if self.session.is_ready() {
            Availability::Ready
        } else {
            Availability::Idle
        }
    }

    async fn deliver(&self, outbound: &OutboundMessage) -> Result<Vec<StatusEvent>, TransportError> {
        match self.availability() {
            Availability::Unavailable => {
                return Err(TransportError::Unavailable("proxy bearer".into()))
            }
            Availability::Idle => return Err(TransportError::NotConnected),
            Availability::Ready => {}
        }

        if !self.filter.ensure_configured().await {
            debug!("Sending without a configured proxy filter");
        }

        self.codec.ensure_node_record(outbound.destination);
        let header = PduHeader {
            ctl: false,
            ttl: outbound.ttl,
            seq: outbound.seq,
            src: outbound.source,
            dst: outbound.destination,
        };
        let pdu = self
            .codec
            .encode_access(&header, &outbound.message.encode())
            .map_err(|e| match e {
                CodecError::Configuration(e) => TransportError::Configuration(e.to_string()),
                other => TransportError::Encoding(other.to_string()),
            })?;

        self.echo.record(&pdu);
        trace!("Proxy send {}", outbound);
        self.session
            .try_send(ProxyPduType::Network, &pdu)
            .await
            .map_err(|e| match e {
                SessionError::NotReady => TransportError::NotConnected,
                other => TransportError::SendFailed(other.to_string()),
            })?;
        Ok(Vec::new())
    }
}
