//! Message router
//!
//! Turns on/off intents into access messages, consuming one sequence number
//! per send, and turns inbound proxy PDUs into status events. Acknowledged
//! unicast operations are watched; when one silently fails on an otherwise
//! healthy link the replay-repair heuristic may jump the sequence counter and
//! resubmit it once with the same TID.

use crate::address::{format_address, is_group, is_unicast};
use crate::config::RouterSettings;
use crate::events::{CoreEvent, EventBus, StatusEvent};
use crate::message::codec::{CodecError, MeshCodec};
use crate::message::echo::EchoFilter;
use crate::message::onoff::{OnOffMessage, ProxyConfigMessage, TidCounter};
use crate::proxy::{FilterManager, ProxyPdu, ProxyPduType};
use crate::sequence::{
    LinkHealth, PendingRequest, PendingUnicastOp, RepairDecision, ReplayRepair, SequenceAuthority,
};
use crate::transport::{OutboundMessage, Transport, TransportError, TransportKind};
use crate::MeshError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// How a send went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to a transport
    Sent(TransportKind),
    /// Every transport failed; already logged
    Failed,
    /// The primary transport is unavailable and there is no fallback
    Unavailable,
}

impl Delivery {
    pub fn is_sent(&self) -> bool {
        matches!(self, Delivery::Sent(_))
    }
}

struct RouterInner {
    identity: u16,
    settings: RouterSettings,
    sequence: SequenceAuthority,
    codec: Arc<dyn MeshCodec>,
    primary: Arc<dyn Transport>,
    fallback: Option<Arc<dyn Transport>>,
    filter: Option<FilterManager>,
    echo: Arc<EchoFilter>,
    link_health: Arc<LinkHealth>,
    events: EventBus,
    tids: TidCounter,
    pending: Mutex<HashMap<u64, PendingUnicastOp>>,
    next_op: AtomicU64,
    repair: Mutex<ReplayRepair>,
    fallback_engaged: AtomicBool,
}

/// Outbound encoding and inbound demultiplexing
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

/// Router construction parameters
pub struct RouterParts {
    pub identity: u16,
    pub settings: RouterSettings,
    pub sequence: SequenceAuthority,
    pub codec: Arc<dyn MeshCodec>,
    pub primary: Arc<dyn Transport>,
    pub fallback: Option<Arc<dyn Transport>>,
    pub filter: Option<FilterManager>,
    pub echo: Arc<EchoFilter>,
    pub link_health: Arc<LinkHealth>,
    pub repair: ReplayRepair,
    pub events: EventBus,
}

impl MessageRouter {
    pub fn new(parts: RouterParts) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                identity: parts.identity,
                settings: parts.settings,
                sequence: parts.sequence,
                codec: parts.codec,
                primary: parts.primary,
                fallback: parts.fallback,
                filter: parts.filter,
                echo: parts.echo,
                link_health: parts.link_health,
                events: parts.events,
                tids: TidCounter::new(),
                pending: Mutex::new(HashMap::new()),
                next_op: AtomicU64::new(1),
                repair: Mutex::new(parts.repair),
                fallback_engaged: AtomicBool::new(false),
            }),
        }
    }

    pub fn identity(&self) -> u16 {
        self.inner.identity
    }

    /// Acknowledged unicast operations still waiting for a status
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Replay repairs performed so far
    pub fn repairs(&self) -> u64 {
        self.inner.repair.lock().total_repairs()
    }

    /// Set on/off state. `acknowledged` defaults to true for unicast and
    /// false for groups.
    pub async fn set_state(
        &self,
        destination: u16,
        on: bool,
        acknowledged: Option<bool>,
    ) -> Result<Delivery, MeshError> {
        check_destination(destination)?;
        let acknowledged = acknowledged.unwrap_or_else(|| is_unicast(destination));
        let tid = self.inner.tids.next();
        let message = OnOffMessage::Set {
            on,
            tid,
            acknowledged,
        };
        let request = PendingRequest::Set { on, tid };
        self.dispatch(destination, message, request).await
    }

    /// Ask for the current state. The answer arrives as a status event.
    pub async fn get_state(&self, destination: u16) -> Result<Delivery, MeshError> {
        check_destination(destination)?;
        self.dispatch(destination, OnOffMessage::Get, PendingRequest::Get)
            .await
    }

    async fn dispatch(
        &self,
        destination: u16,
        message: OnOffMessage,
        request: PendingRequest,
    ) -> Result<Delivery, MeshError> {
        let delivery = self.inner.send_once(destination, message).await?;

        if delivery == Delivery::Sent(TransportKind::Proxy)
            && message.expects_status()
            && is_unicast(destination)
        {
            let id = self.inner.next_op.fetch_add(1, Ordering::Relaxed);
            self.inner.pending.lock().insert(
                id,
                PendingUnicastOp {
                    id,
                    destination,
                    request,
                    created_at: Instant::now(),
                    attempts: 0,
                },
            );
            tokio::spawn(watch_acknowledgement(Arc::clone(&self.inner), id));
        }
        Ok(delivery)
    }

    /// Demultiplex one reassembled inbound PDU
    pub async fn handle_inbound(&self, pdu: ProxyPdu) {
        let inner = &self.inner;
        if inner.echo.is_echo(&pdu.payload) {
            trace!("Dropping proxy echo ({} bytes)", pdu.payload.len());
            return;
        }

        match pdu.pdu_type {
            ProxyPduType::Network => inner.handle_network(&pdu.payload),
            ProxyPduType::ProxyConfiguration => {
                let message = inner
                    .codec
                    .decode_proxy_config(&pdu.payload)
                    .and_then(|m| ProxyConfigMessage::decode(&m.payload));
                match message {
                    Ok(ProxyConfigMessage::FilterStatus {
                        filter_type,
                        list_size,
                    }) => {
                        if let Some(filter) = &inner.filter {
                            filter.record_status(filter_type, list_size).await;
                        }
                    }
                    Ok(other) => debug!("Ignoring proxy configuration {:?}", other),
                    Err(e) => inner.note_decode_failure("proxy configuration", &e),
                }
            }
            ProxyPduType::MeshBeacon => trace!("Dropping mesh beacon"),
            other => debug!("Dropping {:?} PDU ({} bytes)", other, pdu.payload.len()),
        }
    }
}

fn check_destination(destination: u16) -> Result<(), MeshError> {
    if is_unicast(destination) || is_group(destination) {
        Ok(())
    } else {
        Err(MeshError::InvalidAddress(format_address(destination)))
    }
}

impl RouterInner {
    /// Reserve a sequence number and deliver once, primary first
    async fn send_once(&self, destination: u16, message: OnOffMessage) -> Result<Delivery, MeshError> {
        let seq = self.sequence.reserve_next("onoff");
        let outbound = OutboundMessage {
            source: self.identity,
            destination,
            seq,
            ttl: self.settings.default_ttl,
            message,
        };

        let error = match self.primary.deliver(&outbound).await {
            Ok(statuses) => {
                self.publish_statuses(statuses);
                return Ok(Delivery::Sent(self.primary.kind()));
            }
            Err(e) => e,
        };

        match error {
            TransportError::Configuration(reason) => Err(MeshError::Configuration(reason)),
            TransportError::Unavailable(reason) => {
                let fallback = match &self.fallback {
                    Some(fallback) => fallback,
                    None => {
                        warn!("{} unavailable ({}) and no fallback", self.primary.kind(), reason);
                        return Ok(Delivery::Unavailable);
                    }
                };
                if !self.fallback_engaged.swap(true, Ordering::SeqCst) {
                    info!("{} unavailable ({}), using {}", self.primary.kind(), reason, fallback.kind());
                    self.events.publish(CoreEvent::FallbackEngaged);
                }
                match fallback.deliver(&outbound).await {
                    Ok(statuses) => {
                        self.publish_statuses(statuses);
                        Ok(Delivery::Sent(fallback.kind()))
                    }
                    Err(TransportError::Configuration(reason)) => {
                        Err(MeshError::Configuration(reason))
                    }
                    Err(TransportError::Unavailable(reason)) => {
                        warn!("Fallback unavailable too: {}", reason);
                        Ok(Delivery::Unavailable)
                    }
                    Err(e) => {
                        warn!("Fallback delivery of {} failed: {}", outbound, e);
                        Ok(Delivery::Failed)
                    }
                }
            }
            other => {
                warn!("Delivery of {} failed: {}", outbound, other);
                Ok(Delivery::Failed)
            }
        }
    }

    fn publish_statuses(&self, statuses: Vec<StatusEvent>) {
        for status in statuses {
            self.clear_pending(status.source);
            self.events.publish(CoreEvent::Status(status));
        }
    }

    fn clear_pending(&self, source: u16) {
        self.pending.lock().retain(|_, op| op.destination != source);
    }

    fn note_decode_failure(&self, what: &str, error: &CodecError) {
        if error.is_authentication() {
            self.link_health.note_decrypt_failure();
        }
        debug!("Dropping undecodable {}: {}", what, error);
    }

    fn handle_network(&self, pdu: &[u8]) {
        let message = match self.codec.decode_network(pdu) {
            Ok(message) => message,
            Err(e) => return self.note_decode_failure("network PDU", &e),
        };
        let source = message.header.src;
        if source == self.identity {
            trace!("Dropping own traffic relayed by the proxy");
            return;
        }

        match OnOffMessage::decode(&message.payload) {
            Ok(Some(OnOffMessage::Status {
                present, target, ..
            })) => {
                debug!(
                    "Status from {}: {} (target {:?})",
                    format_address(source),
                    if present { "on" } else { "off" },
                    target
                );
                self.clear_pending(source);
                self.events
                    .publish(CoreEvent::Status(StatusEvent::new(source, present, target)));
            }
            Ok(Some(other)) => debug!("Dropping {:?} from {}", other, format_address(source)),
            Ok(None) => debug!(
                "Dropping message for another model from {} ({} bytes)",
                format_address(source),
                message.payload.len()
            ),
            Err(e) => debug!("Dropping malformed access message from {}: {}", format_address(source), e),
        }
    }
}

/// Wait for the status of one acknowledged operation; on silence, consult
/// the replay-repair heuristic and resubmit while it allows.
async fn watch_acknowledgement(inner: Arc<RouterInner>, id: u64) {
    loop {
        tokio::time::sleep(inner.settings.ack_timeout()).await;

        let mut op = match inner.pending.lock().remove(&id) {
            Some(op) => op,
            None => return,
        };

        let decision = inner
            .repair
            .lock()
            .evaluate(&op, &inner.link_health, Instant::now());
        let (step, attempt) = match decision {
            RepairDecision::Repair { step, attempt } => (step, attempt),
            RepairDecision::Skip(reason) => {
                debug!(
                    "No status from {} after {:?}; repair skipped: {:?}",
                    format_address(op.destination),
                    op.created_at.elapsed(),
                    reason
                );
                return;
            }
        };

        let jumped_to = inner.sequence.bump(step);
        warn!(
            "Suspected replay rejection by {}: sequence jumped by {} to {}, resubmitting (repair {})",
            format_address(op.destination),
            step,
            jumped_to,
            attempt
        );

        let message = match op.request {
            PendingRequest::Set { on, tid } => OnOffMessage::Set {
                on,
                tid,
                acknowledged: true,
            },
            PendingRequest::Get => OnOffMessage::Get,
        };
        op.attempts = attempt;
        let destination = op.destination;
        inner.pending.lock().insert(id, op);

        match inner.send_once(destination, message).await {
            Ok(Delivery::Sent(TransportKind::Proxy)) => {}
            Ok(_) | Err(_) => {
                inner.pending.lock().remove(&id);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KeyMaterial, RepairSettings};
    use crate::message::codec::{ClearCodec, PduHeader};
    use crate::store::MemoryStorage;
    use crate::transport::Availability;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Transport that records deliveries and fails on demand
    struct RecordingTransport {
        kind: TransportKind,
        result: Mutex<Result<Vec<StatusEvent>, TransportError>>,
        sent: Mutex<Vec<OutboundMessage>>,
    }

    impl RecordingTransport {
        fn new(kind: TransportKind, result: Result<Vec<StatusEvent>, TransportError>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                result: Mutex::new(result),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn availability(&self) -> Availability {
            Availability::Ready
        }

        async fn deliver(
            &self,
            message: &OutboundMessage,
        ) -> Result<Vec<StatusEvent>, TransportError> {
            self.sent.lock().push(message.clone());
            self.result.lock().clone()
        }
    }

    fn keys() -> KeyMaterial {
        KeyMaterial::new([3; 16], [4; 16], 0)
    }

    struct Fixture {
        router: MessageRouter,
        primary: Arc<RecordingTransport>,
        sequence: SequenceAuthority,
        link: Arc<LinkHealth>,
        bus: EventBus,
        codec: Arc<ClearCodec>,
    }

    fn fixture(
        primary: Arc<RecordingTransport>,
        fallback: Option<Arc<RecordingTransport>>,
    ) -> Fixture {
        let bus = EventBus::default();
        let sequence = SequenceAuthority::load(
            Arc::new(MemoryStorage::new()),
            "test",
            0x0001,
            Duration::from_millis(750),
        )
        .unwrap();
        let link = Arc::new(LinkHealth::new());
        let codec = Arc::new(ClearCodec::new(&keys()).unwrap());
        let router = MessageRouter::new(RouterParts {
            identity: 0x0001,
            settings: RouterSettings::default(),
            sequence: sequence.clone(),
            codec: codec.clone(),
            primary: primary.clone(),
            fallback: fallback.map(|f| f as Arc<dyn Transport>),
            filter: None,
            echo: Arc::new(EchoFilter::new(Duration::from_secs(2))),
            link_health: link.clone(),
            repair: ReplayRepair::new(RepairSettings::default()),
            events: bus.clone(),
        });
        Fixture {
            router,
            primary,
            sequence,
            link,
            bus,
            codec,
        }
    }

    fn status_pdu(codec: &ClearCodec, src: u16, on: bool) -> ProxyPdu {
        let header = PduHeader {
            ctl: false,
            ttl: 4,
            seq: 100,
            src,
            dst: 0x0001,
        };
        let access = OnOffMessage::Status {
            present: on,
            target: None,
            remaining: None,
        }
        .encode();
        ProxyPdu::new(
            ProxyPduType::Network,
            codec.encode_access(&header, &access).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_ack_defaults_by_destination() {
        let f = fixture(RecordingTransport::new(TransportKind::Proxy, Ok(vec![])), None);
        f.router.set_state(0xC000, true, None).await.unwrap();
        f.router.set_state(0x0010, true, None).await.unwrap();

        let sent = f.primary.sent.lock().clone();
        assert!(matches!(
            sent[0].message,
            OnOffMessage::Set {
                acknowledged: false,
                ..
            }
        ));
        assert!(matches!(
            sent[1].message,
            OnOffMessage::Set {
                acknowledged: true,
                ..
            }
        ));
        assert!(sent[1].seq > sent[0].seq);
    }

    #[tokio::test]
    async fn test_every_send_consumes_a_sequence_number() {
        let f = fixture(RecordingTransport::new(TransportKind::Proxy, Ok(vec![])), None);
        let before = f.sequence.current();
        f.router.get_state(0xC000).await.unwrap();
        f.router.set_state(0xC001, false, None).await.unwrap();
        assert_eq!(f.sequence.current(), before + 2);
    }

    #[tokio::test]
    async fn test_invalid_destination() {
        let f = fixture(RecordingTransport::new(TransportKind::Proxy, Ok(vec![])), None);
        assert!(matches!(
            f.router.set_state(0x8001, true, None).await,
            Err(MeshError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_configuration_error_is_hard_failure() {
        let f = fixture(
            RecordingTransport::new(
                TransportKind::Proxy,
                Err(TransportError::Configuration("no keys".into())),
            ),
            None,
        );
        assert!(matches!(
            f.router.get_state(0x0010).await,
            Err(MeshError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_fallback_only_on_unavailable() {
        let fallback = RecordingTransport::new(
            TransportKind::GattFallback,
            Ok(vec![StatusEvent::new(0x0010, true, None)]),
        );
        let f = fixture(
            RecordingTransport::new(TransportKind::Proxy, Err(TransportError::NotConnected)),
            Some(fallback.clone()),
        );
        assert_eq!(
            f.router.set_state(0x0010, true, None).await.unwrap(),
            Delivery::Failed
        );
        assert!(fallback.sent.lock().is_empty());

        *f.primary.result.lock() = Err(TransportError::Unavailable("no adapter".into()));
        let mut events = f.bus.subscribe();
        assert_eq!(
            f.router.set_state(0x0010, true, None).await.unwrap(),
            Delivery::Sent(TransportKind::GattFallback)
        );
        assert_eq!(fallback.sent.lock().len(), 1);
        assert!(matches!(events.recv().await, Ok(CoreEvent::FallbackEngaged)));
        assert!(matches!(events.recv().await, Ok(CoreEvent::Status(_))));
        assert_eq!(f.router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_without_fallback() {
        let f = fixture(
            RecordingTransport::new(
                TransportKind::Proxy,
                Err(TransportError::Unavailable("off".into())),
            ),
            None,
        );
        assert_eq!(
            f.router.get_state(0xC000).await.unwrap(),
            Delivery::Unavailable
        );
    }

    #[tokio::test]
    async fn test_inbound_status_becomes_event() {
        let f = fixture(RecordingTransport::new(TransportKind::Proxy, Ok(vec![])), None);
        let mut events = f.bus.subscribe();
        f.router.handle_inbound(status_pdu(&f.codec, 0x0010, true)).await;
        match events.recv().await {
            Ok(CoreEvent::Status(status)) => {
                assert_eq!(status.source, 0x0010);
                assert!(status.state);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_echo_is_dropped() {
        let f = fixture(RecordingTransport::new(TransportKind::Proxy, Ok(vec![])), None);
        let pdu = status_pdu(&f.codec, 0x0010, true);
        f.router.inner.echo.record(&pdu.payload);

        let mut events = f.bus.subscribe();
        f.router.handle_inbound(pdu).await;
        f.bus.publish(CoreEvent::ProxyDisconnected);
        assert!(matches!(events.recv().await, Ok(CoreEvent::ProxyDisconnected)));
    }

    #[tokio::test]
    async fn test_foreign_pdu_marks_decrypt_failure() {
        let f = fixture(RecordingTransport::new(TransportKind::Proxy, Ok(vec![])), None);
        let foreign = ClearCodec::new(&KeyMaterial::new([9; 16], [4; 16], 0)).unwrap();
        assert!(f.link.last_decrypt_failure().is_none());
        f.router.handle_inbound(status_pdu(&foreign, 0x0010, true)).await;
        assert!(f.link.last_decrypt_failure().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_failure_on_healthy_link_is_repaired() {
        let f = fixture(RecordingTransport::new(TransportKind::Proxy, Ok(vec![])), None);
        f.link.note_inbound();

        f.router.set_state(0x0010, true, None).await.unwrap();
        let first_seq = f.sequence.current();

        // First ack timeout -> repair with the first step
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(f.router.repairs(), 1);
        let sent = f.primary.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].seq > first_seq + 50_000);
        assert_eq!(sent[0].message, sent[1].message);

        // Status arrives: nothing more happens
        f.router.handle_inbound(status_pdu(&f.codec, 0x0010, true)).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.primary.sent.lock().len(), 2);
        assert_eq!(f.router.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_link_is_not_repaired() {
        let f = fixture(RecordingTransport::new(TransportKind::Proxy, Ok(vec![])), None);
        f.router.set_state(0x0010, true, None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.router.repairs(), 0);
        assert_eq!(f.primary.sent.lock().len(), 1);
    }
}
