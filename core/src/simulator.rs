//! In-process mesh simulator
//!
//! A [`SimulatedMesh`] plays every platform collaborator at once: the proxy
//! bearer, the advertisement scanner, the configuration database and direct
//! GATT access. Nodes keep on/off state, answer OnOff messages addressed to
//! them or to a group they subscribe to, and drop anything their replay
//! protection has already seen. Failures can be injected at runtime.

use crate::address::{derive_unicast, HardwareAddress};
use crate::config::KeyMaterial;
use crate::discovery::{DatabaseError, MeshDatabase, NodeSubscriptions};
use crate::message::{
    ClearCodec, CodecError, FilterType, MeshCodec, OnOffMessage, PduHeader, ProxyConfigMessage,
};
use crate::proxy::{
    segment, BearerError, BearerEvent, BearerLink, ProxyBearer, ProxyPdu, ProxyPduType,
    Reassembler,
};
use crate::scan::{
    sig_uuid, AdvertisementRecord, AdvertisementScanner, ScanError, BATTERY_SERVICE,
    MESH_PROXY_SERVICE,
};
use crate::transport::{CharacteristicInfo, GattError, GattLink};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// On/off characteristic exposed by simulated nodes over direct GATT
pub const SIMULATED_ONOFF_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x5a0e_0001_6d65_7368_6c69_6768_7400_0000);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScenarioError {
    #[error("Scenario I/O: {0}")]
    Io(String),
    #[error("Scenario malformed: {0}")]
    Malformed(String),
}

fn default_true() -> bool {
    true
}

fn default_rssi() -> i16 {
    -60
}

/// One node in a scenario file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioNode {
    pub address: HardwareAddress,
    #[serde(default)]
    pub name: Option<String>,
    /// Runs the proxy feature and advertises the proxy service
    #[serde(default = "default_true")]
    pub proxy: bool,
    #[serde(default)]
    pub subscriptions: Vec<u16>,
    #[serde(default)]
    pub on: bool,
    /// Switches itself off this long after being switched on
    #[serde(default)]
    pub momentary_ms: Option<u64>,
    #[serde(default = "default_rssi")]
    pub rssi: i16,
    #[serde(default)]
    pub battery: Option<u8>,
    /// Receives but never answers
    #[serde(default)]
    pub silent: bool,
    /// Never advertises
    #[serde(default)]
    pub hidden: bool,
}

impl ScenarioNode {
    pub fn new(address: HardwareAddress) -> Self {
        Self {
            address,
            name: None,
            proxy: true,
            subscriptions: Vec::new(),
            on: false,
            momentary_ms: None,
            rssi: default_rssi(),
            battery: None,
            silent: false,
            hidden: false,
        }
    }

    pub fn subscribed(mut self, groups: &[u16]) -> Self {
        self.subscriptions = groups.to_vec();
        self
    }
}

/// A simulated mesh, usually loaded from JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub nodes: Vec<ScenarioNode>,
    /// Negotiated transfer size of proxy links
    pub mtu: usize,
    /// The proxy reflects client traffic back to the client
    pub echo: bool,
    /// Number of connect attempts refused before one succeeds
    pub refuse_connects: u32,
    /// Delay from the first scan start until nodes become visible
    pub advertise_delay_ms: u64,
    pub connect_delay_ms: u64,
    /// Base delay before a node answers; each further responder adds a bit
    pub response_delay_ms: u64,
    /// Highest sequence number every node has already seen from any source
    pub replay_floor: u32,
    pub bearer_available: bool,
    pub gatt_available: bool,
    pub database_available: bool,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            mtu: 23,
            echo: false,
            refuse_connects: 0,
            advertise_delay_ms: 200,
            connect_delay_ms: 50,
            response_delay_ms: 30,
            replay_floor: 0,
            bearer_available: true,
            gatt_available: true,
            database_available: true,
        }
    }
}

impl Scenario {
    pub fn from_json(json: &str) -> Result<Self, ScenarioError> {
        serde_json::from_str(json).map_err(|e| ScenarioError::Malformed(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let json = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ScenarioError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json(&json)
    }
}

struct SimNode {
    setup: ScenarioNode,
    unicast: u16,
    on: bool,
    seq: u32,
    /// Highest sequence number accepted per source
    seen: HashMap<u16, u32>,
    /// Source that last switched the node on
    last_controller: Option<u16>,
}

impl SimNode {
    fn accepts(&mut self, src: u16, seq: u32, floor: u32) -> bool {
        let last = self.seen.get(&src).copied().unwrap_or(floor);
        if seq <= last {
            return false;
        }
        self.seen.insert(src, seq);
        true
    }

    fn addressed_by(&self, dst: u16) -> bool {
        dst == self.unicast || self.setup.subscriptions.contains(&dst)
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = (self.seq + 1) & 0x00FF_FFFF;
        self.seq
    }
}

struct ProxyLink {
    proxy: HardwareAddress,
    events: mpsc::UnboundedSender<BearerEvent>,
    reassembler: Reassembler,
    filter_type: FilterType,
    accept_list: HashSet<u16>,
}

struct SimState {
    scenario: Scenario,
    nodes: Vec<SimNode>,
    link: Option<ProxyLink>,
    scan_started: Option<Instant>,
    scanning: bool,
    corrupt_nid: bool,
    connect_attempts: u32,
    client_pdus: u64,
    gatt_connected: HashSet<HardwareAddress>,
}

struct SimInner {
    codec: ClearCodec,
    state: Mutex<SimState>,
}

/// Simulated proxy, nodes and radio environment
#[derive(Clone)]
pub struct SimulatedMesh {
    inner: Arc<SimInner>,
}

/// A reply scheduled for delivery to the proxy client
struct Reply {
    delay: Duration,
    pdu_type: ProxyPduType,
    pdu: Vec<u8>,
    dst: u16,
}

impl SimulatedMesh {
    pub fn new(scenario: Scenario, keys: &KeyMaterial) -> Result<Self, CodecError> {
        let codec = ClearCodec::new(keys)?;
        let nodes = scenario
            .nodes
            .iter()
            .map(|setup| SimNode {
                unicast: derive_unicast(&setup.address),
                on: setup.on,
                seq: 0,
                seen: HashMap::new(),
                last_controller: None,
                setup: setup.clone(),
            })
            .collect();
        info!("Simulated mesh with {} node(s)", scenario.nodes.len());
        Ok(Self {
            inner: Arc::new(SimInner {
                codec,
                state: Mutex::new(SimState {
                    scenario,
                    nodes,
                    link: None,
                    scan_started: None,
                    scanning: false,
                    corrupt_nid: false,
                    connect_attempts: 0,
                    client_pdus: 0,
                    gatt_connected: HashSet::new(),
                }),
            }),
        })
    }

    // ------------------------------------------------------------------
    // Failure injection
    // ------------------------------------------------------------------

    pub fn refuse_next_connects(&self, count: u32) {
        self.inner.state.lock().scenario.refuse_connects = count;
    }

    /// Drop the proxy link as if the radio went away
    pub fn drop_link(&self, reason: &str) {
        if let Some(link) = self.inner.state.lock().link.take() {
            info!("Simulated link to {} dropped: {}", link.proxy, reason);
            let _ = link.events.send(BearerEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    /// Stop or resume advertising for a node
    pub fn set_hidden(&self, unicast: u16, hidden: bool) {
        let mut state = self.inner.state.lock();
        if let Some(node) = state.nodes.iter_mut().find(|n| n.unicast == unicast) {
            node.setup.hidden = hidden;
        }
    }

    pub fn set_silent(&self, unicast: u16, silent: bool) {
        let mut state = self.inner.state.lock();
        if let Some(node) = state.nodes.iter_mut().find(|n| n.unicast == unicast) {
            node.setup.silent = silent;
        }
    }

    /// Make every outgoing network PDU carry a foreign NID
    pub fn corrupt_nid(&self, corrupt: bool) {
        self.inner.state.lock().corrupt_nid = corrupt;
    }

    pub fn set_bearer_available(&self, available: bool) {
        let mut state = self.inner.state.lock();
        state.scenario.bearer_available = available;
        if !available {
            if let Some(link) = state.link.take() {
                let _ = link.events.send(BearerEvent::Disconnected {
                    reason: "adapter off".into(),
                });
            }
        }
    }

    pub fn set_echo(&self, echo: bool) {
        self.inner.state.lock().scenario.echo = echo;
    }

    /// Pretend every node has seen `seq` from every source
    pub fn set_replay_floor(&self, seq: u32) {
        let mut state = self.inner.state.lock();
        state.scenario.replay_floor = seq;
        for node in &mut state.nodes {
            node.seen.clear();
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn node_state(&self, unicast: u16) -> Option<bool> {
        let state = self.inner.state.lock();
        state.nodes.iter().find(|n| n.unicast == unicast).map(|n| n.on)
    }

    pub fn unicasts(&self) -> Vec<u16> {
        self.inner.state.lock().nodes.iter().map(|n| n.unicast).collect()
    }

    pub fn connected_proxy(&self) -> Option<HardwareAddress> {
        self.inner.state.lock().link.as_ref().map(|l| l.proxy)
    }

    /// The proxy's accept list, sorted
    pub fn accept_list(&self) -> Vec<u16> {
        let state = self.inner.state.lock();
        let mut list: Vec<u16> = state
            .link
            .as_ref()
            .map(|l| l.accept_list.iter().copied().collect())
            .unwrap_or_default();
        list.sort_unstable();
        list
    }

    pub fn connect_attempts(&self) -> u32 {
        self.inner.state.lock().connect_attempts
    }

    /// Network PDUs received from the client
    pub fn client_pdus(&self) -> u64 {
        self.inner.state.lock().client_pdus
    }

    // ------------------------------------------------------------------
    // Proxy server
    // ------------------------------------------------------------------

    fn handle_client_pdu(&self, pdu: ProxyPdu) {
        let replies = match pdu.pdu_type {
            ProxyPduType::Network => self.handle_network(&pdu.payload),
            ProxyPduType::ProxyConfiguration => self.handle_proxy_config(&pdu.payload),
            other => {
                debug!("Simulated proxy ignoring {:?} PDU", other);
                Vec::new()
            }
        };
        for reply in replies {
            self.schedule(reply);
        }
    }

    fn handle_network(&self, pdu: &[u8]) -> Vec<Reply> {
        let message = match self.inner.codec.decode_network(pdu) {
            Ok(message) => message,
            Err(e) => {
                warn!("Simulated proxy dropping client PDU: {}", e);
                return Vec::new();
            }
        };
        let header = message.header;
        let request = match OnOffMessage::decode(&message.payload) {
            Ok(Some(request)) => request,
            Ok(None) | Err(_) => {
                debug!("Simulated nodes ignore access payload {}", hex::encode(&message.payload));
                return Vec::new();
            }
        };

        let mut state = self.inner.state.lock();
        state.client_pdus += 1;
        let mut replies = Vec::new();
        if state.scenario.echo {
            replies.push(Reply {
                delay: Duration::from_millis(1),
                pdu_type: ProxyPduType::Network,
                pdu: pdu.to_vec(),
                dst: header.dst,
            });
        }

        let floor = state.scenario.replay_floor;
        let base_delay = state.scenario.response_delay_ms;
        let corrupt = state.corrupt_nid;
        let mut responders = 0u64;
        let mut momentary = Vec::new();
        for node in state.nodes.iter_mut() {
            if !node.addressed_by(header.dst) {
                continue;
            }
            if !node.accepts(header.src, header.seq, floor) {
                trace!(
                    "Node 0x{:04X} rejects replayed seq {} from 0x{:04X}",
                    node.unicast,
                    header.seq,
                    header.src
                );
                continue;
            }

            let respond = match request {
                OnOffMessage::Get => true,
                OnOffMessage::Set {
                    on, acknowledged, ..
                } => {
                    node.on = on;
                    if on {
                        node.last_controller = Some(header.src);
                        if let Some(ms) = node.setup.momentary_ms {
                            momentary.push((node.unicast, Duration::from_millis(ms)));
                        }
                    }
                    acknowledged
                }
                OnOffMessage::Status { .. } => false,
            };
            if !respond || node.setup.silent {
                continue;
            }

            let seq = node.next_seq();
            let status = OnOffMessage::Status {
                present: node.on,
                target: None,
                remaining: None,
            };
            if let Some(pdu) = self.encode_status(node.unicast, header.src, seq, status, corrupt) {
                replies.push(Reply {
                    delay: Duration::from_millis(base_delay + responders * 7),
                    pdu_type: ProxyPduType::Network,
                    pdu,
                    dst: header.src,
                });
                responders += 1;
            }
        }
        drop(state);

        for (unicast, after) in momentary {
            self.schedule_auto_off(unicast, after);
        }
        replies
    }

    fn handle_proxy_config(&self, pdu: &[u8]) -> Vec<Reply> {
        let message = self
            .inner
            .codec
            .decode_proxy_config(pdu)
            .and_then(|m| ProxyConfigMessage::decode(&m.payload));
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!("Simulated proxy dropping configuration: {}", e);
                return Vec::new();
            }
        };

        let mut state = self.inner.state.lock();
        let proxy_unicast = match state.link.as_ref() {
            Some(link) => derive_unicast(&link.proxy),
            None => return Vec::new(),
        };
        let (filter_type, list_size) = {
            let link = match state.link.as_mut() {
                Some(link) => link,
                None => return Vec::new(),
            };
            match message {
                ProxyConfigMessage::SetFilterType(filter_type) => {
                    link.filter_type = filter_type;
                    link.accept_list.clear();
                }
                ProxyConfigMessage::AddAddresses(addresses) => link.accept_list.extend(addresses),
                ProxyConfigMessage::RemoveAddresses(addresses) => {
                    for address in addresses {
                        link.accept_list.remove(&address);
                    }
                }
                ProxyConfigMessage::FilterStatus { .. } => return Vec::new(),
            }
            (link.filter_type, link.accept_list.len() as u16)
        };

        let node = state.nodes.iter_mut().find(|n| n.unicast == proxy_unicast);
        let seq = node.map(|n| n.next_seq()).unwrap_or(1);
        let status = ProxyConfigMessage::FilterStatus {
            filter_type,
            list_size,
        };
        match self
            .inner
            .codec
            .encode_proxy_config(seq, proxy_unicast, &status.encode())
        {
            Ok(pdu) => vec![Reply {
                delay: Duration::from_millis(1),
                pdu_type: ProxyPduType::ProxyConfiguration,
                pdu,
                dst: crate::address::UNASSIGNED_ADDRESS,
            }],
            Err(e) => {
                warn!("Simulated proxy could not encode filter status: {}", e);
                Vec::new()
            }
        }
    }

    fn encode_status(
        &self,
        src: u16,
        dst: u16,
        seq: u32,
        status: OnOffMessage,
        corrupt: bool,
    ) -> Option<Vec<u8>> {
        let header = PduHeader {
            ctl: false,
            ttl: 4,
            seq,
            src,
            dst,
        };
        match self.inner.codec.encode_access(&header, &status.encode()) {
            Ok(mut pdu) => {
                if corrupt {
                    pdu[0] ^= 0x01;
                }
                Some(pdu)
            }
            Err(e) => {
                warn!("Simulated node 0x{:04X} could not encode status: {}", src, e);
                None
            }
        }
    }

    fn schedule(&self, reply: Reply) {
        let mesh = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(reply.delay).await;
            mesh.deliver_to_client(reply);
        });
    }

    fn schedule_auto_off(&self, unicast: u16, after: Duration) {
        let mesh = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let reply = {
                let mut state = mesh.inner.state.lock();
                let corrupt = state.corrupt_nid;
                let node = match state.nodes.iter_mut().find(|n| n.unicast == unicast) {
                    Some(node) if node.on => node,
                    _ => return,
                };
                node.on = false;
                debug!("Node 0x{:04X} switched itself off", unicast);
                let dst = match node.last_controller {
                    Some(dst) if !node.setup.silent => dst,
                    _ => return,
                };
                let seq = node.next_seq();
                let status = OnOffMessage::Status {
                    present: false,
                    target: None,
                    remaining: None,
                };
                mesh.encode_status(unicast, dst, seq, status, corrupt)
                    .map(|pdu| Reply {
                        delay: Duration::ZERO,
                        pdu_type: ProxyPduType::Network,
                        pdu,
                        dst,
                    })
            };
            if let Some(reply) = reply {
                mesh.deliver_to_client(reply);
            }
        });
    }

    /// Forward one PDU to the client, subject to the accept list
    fn deliver_to_client(&self, reply: Reply) {
        let state = self.inner.state.lock();
        let link = match state.link.as_ref() {
            Some(link) => link,
            None => return,
        };
        if reply.pdu_type == ProxyPduType::Network {
            let passes = match link.filter_type {
                FilterType::AcceptList => link.accept_list.contains(&reply.dst),
                FilterType::RejectList => !link.accept_list.contains(&reply.dst),
            };
            if !passes {
                trace!("Proxy filter drops PDU for 0x{:04X}", reply.dst);
                return;
            }
        }
        let frames = match segment(reply.pdu_type, &reply.pdu, state.scenario.mtu) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("Simulated proxy could not segment reply: {}", e);
                return;
            }
        };
        for frame in frames {
            if link.events.send(BearerEvent::Frame(frame)).is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl ProxyBearer for SimulatedMesh {
    fn is_available(&self) -> bool {
        self.inner.state.lock().scenario.bearer_available
    }

    async fn open(
        &self,
        address: HardwareAddress,
        timeout: Duration,
    ) -> Result<BearerLink, BearerError> {
        let delay = {
            let mut state = self.inner.state.lock();
            state.connect_attempts += 1;
            if !state.scenario.bearer_available {
                return Err(BearerError::Unavailable);
            }
            if state.scenario.refuse_connects > 0 {
                state.scenario.refuse_connects -= 1;
                return Err(BearerError::ConnectFailed("GATT error 133".into()));
            }
            let node = state
                .nodes
                .iter()
                .find(|n| n.setup.address == address)
                .ok_or(BearerError::DeviceNotFound(address))?;
            if !node.setup.proxy {
                return Err(BearerError::ServiceMissing(address));
            }
            Duration::from_millis(state.scenario.connect_delay_ms)
        };

        if delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(BearerError::Timeout);
        }
        tokio::time::sleep(delay).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock();
        if let Some(previous) = state.link.take() {
            debug!("Simulated proxy replacing link to {}", previous.proxy);
        }
        state.link = Some(ProxyLink {
            proxy: address,
            events: tx,
            reassembler: Reassembler::new(),
            filter_type: FilterType::AcceptList,
            accept_list: HashSet::new(),
        });
        info!("Simulated proxy link to {} open", address);
        Ok(BearerLink {
            max_transfer_size: state.scenario.mtu,
            events: rx,
        })
    }

    async fn write(&self, frame: &[u8]) -> Result<(), BearerError> {
        let pdu = {
            let mut state = self.inner.state.lock();
            let link = state.link.as_mut().ok_or(BearerError::NotConnected)?;
            match link.reassembler.push(frame) {
                Ok(pdu) => pdu,
                Err(e) => {
                    warn!("Simulated proxy reassembly: {}", e);
                    None
                }
            }
        };
        if let Some(pdu) = pdu {
            self.handle_client_pdu(pdu);
        }
        Ok(())
    }

    async fn close(&self) {
        if let Some(link) = self.inner.state.lock().link.take() {
            debug!("Simulated proxy link to {} closed", link.proxy);
        }
    }
}

#[async_trait]
impl AdvertisementScanner for SimulatedMesh {
    async fn start(&self) -> Result<(), ScanError> {
        let mut state = self.inner.state.lock();
        if !state.scenario.bearer_available && !state.scenario.gatt_available {
            return Err(ScanError::Unavailable("radio off".into()));
        }
        state.scanning = true;
        state.scan_started.get_or_insert_with(Instant::now);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ScanError> {
        self.inner.state.lock().scanning = false;
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        self.inner.state.lock().scanning
    }

    fn discovered(&self) -> Vec<AdvertisementRecord> {
        let state = self.inner.state.lock();
        let visible = match state.scan_started {
            Some(started) => {
                started.elapsed() >= Duration::from_millis(state.scenario.advertise_delay_ms)
            }
            None => false,
        };
        if !visible {
            return Vec::new();
        }
        state
            .nodes
            .iter()
            .filter(|n| !n.setup.hidden)
            .map(|n| {
                let mut record = AdvertisementRecord::new(n.setup.address, n.setup.rssi);
                record.local_name = n.setup.name.clone();
                record.last_seen = Some(Instant::now());
                if n.setup.proxy {
                    record.service_uuids.push(sig_uuid(MESH_PROXY_SERVICE));
                }
                if let Some(level) = n.setup.battery {
                    record
                        .service_data
                        .insert(sig_uuid(BATTERY_SERVICE), vec![level]);
                }
                record
            })
            .collect()
    }
}

#[async_trait]
impl MeshDatabase for SimulatedMesh {
    async fn node_subscriptions(&self) -> Result<Vec<NodeSubscriptions>, DatabaseError> {
        let state = self.inner.state.lock();
        if !state.scenario.database_available {
            return Err(DatabaseError::Unavailable("simulated database offline".into()));
        }
        Ok(state
            .nodes
            .iter()
            .map(|n| NodeSubscriptions {
                unicast_address: n.unicast,
                subscriptions: n.setup.subscriptions.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl GattLink for SimulatedMesh {
    fn is_available(&self) -> bool {
        self.inner.state.lock().scenario.gatt_available
    }

    async fn connect(&self, device: HardwareAddress) -> Result<(), GattError> {
        let mut state = self.inner.state.lock();
        if !state.scenario.gatt_available {
            return Err(GattError::Unavailable);
        }
        let reachable = state
            .nodes
            .iter()
            .any(|n| n.setup.address == device && !n.setup.silent);
        if !reachable {
            return Err(GattError::ConnectFailed(device, "no response".into()));
        }
        state.gatt_connected.insert(device);
        Ok(())
    }

    async fn discover(&self, device: HardwareAddress) -> Result<Vec<CharacteristicInfo>, GattError> {
        if !self.inner.state.lock().gatt_connected.contains(&device) {
            return Err(GattError::DiscoveryFailed(format!("{} not connected", device)));
        }
        Ok(vec![CharacteristicInfo {
            uuid: SIMULATED_ONOFF_CHARACTERISTIC,
            readable: true,
            writable: true,
        }])
    }

    async fn read(&self, device: HardwareAddress, characteristic: Uuid) -> Result<Vec<u8>, GattError> {
        let state = self.inner.state.lock();
        if characteristic != SIMULATED_ONOFF_CHARACTERISTIC || !state.gatt_connected.contains(&device) {
            return Err(GattError::ReadFailed(format!("{} on {}", characteristic, device)));
        }
        state
            .nodes
            .iter()
            .find(|n| n.setup.address == device)
            .map(|n| vec![n.on as u8])
            .ok_or_else(|| GattError::ReadFailed(device.to_string()))
    }

    async fn write(
        &self,
        device: HardwareAddress,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Result<(), GattError> {
        let momentary = {
            let mut state = self.inner.state.lock();
            if characteristic != SIMULATED_ONOFF_CHARACTERISTIC
                || !state.gatt_connected.contains(&device)
            {
                return Err(GattError::WriteFailed(format!("{} on {}", characteristic, device)));
            }
            let node = state
                .nodes
                .iter_mut()
                .find(|n| n.setup.address == device)
                .ok_or_else(|| GattError::WriteFailed(device.to_string()))?;
            node.on = value.first().map(|b| *b != 0).unwrap_or(false);
            node.last_controller = None;
            match node.setup.momentary_ms {
                Some(ms) if node.on => Some((node.unicast, Duration::from_millis(ms))),
                _ => None,
            }
        };
        if let Some((unicast, after)) = momentary {
            self.schedule_auto_off(unicast, after);
        }
        Ok(())
    }

    async fn disconnect(&self, device: HardwareAddress) {
        self.inner.state.lock().gatt_connected.remove(&device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> KeyMaterial {
        KeyMaterial::new([0x11; 16], [0x22; 16], 0)
    }

    fn hw(last: u8) -> HardwareAddress {
        HardwareAddress::new([0xC0, 0xFF, 0xEE, 0, 0, last])
    }

    fn scenario() -> Scenario {
        Scenario {
            nodes: vec![
                ScenarioNode::new(hw(0x10)).subscribed(&[0xC000]),
                ScenarioNode::new(hw(0x11)).subscribed(&[0xC000, 0xC001]),
            ],
            advertise_delay_ms: 0,
            connect_delay_ms: 0,
            ..Scenario::default()
        }
    }

    async fn next_pdu(
        link: &mut BearerLink,
        reassembler: &mut Reassembler,
    ) -> Option<ProxyPdu> {
        while let Some(event) = link.events.recv().await {
            if let BearerEvent::Frame(frame) = event {
                if let Some(pdu) = reassembler.push(&frame).expect("reassemble") {
                    return Some(pdu);
                }
            }
        }
        None
    }

    async fn write_pdu(mesh: &SimulatedMesh, pdu_type: ProxyPduType, pdu: &[u8]) {
        for frame in segment(pdu_type, pdu, 23).expect("segment") {
            ProxyBearer::write(mesh, &frame).await.expect("write");
        }
    }

    #[test]
    fn test_scenario_json_defaults() {
        let scenario = Scenario::from_json(
            r#"{"nodes": [{"address": "C0:FF:EE:00:00:10", "subscriptions": [49152]}], "echo": true}"#,
        )
        .expect("parse");
        assert_eq!(scenario.mtu, 23);
        assert!(scenario.echo);
        assert!(scenario.nodes[0].proxy);
        assert_eq!(scenario.nodes[0].rssi, -60);
        assert!(Scenario::from_json("[").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertisements_after_delay() {
        let mut scenario = scenario();
        scenario.advertise_delay_ms = 500;
        scenario.nodes[1].battery = Some(80);
        let mesh = SimulatedMesh::new(scenario, &keys()).expect("mesh");

        assert!(mesh.discovered().is_empty());
        mesh.start().await.expect("start");
        assert!(mesh.discovered().is_empty());
        tokio::time::sleep(Duration::from_millis(600)).await;

        let records = mesh.discovered();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.is_proxy_capable()));
        assert_eq!(records[1].battery_hint(), Some(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_get_answered_through_accept_list() {
        let mesh = SimulatedMesh::new(scenario(), &keys()).expect("mesh");
        let codec = ClearCodec::new(&keys()).expect("codec");
        let mut link = mesh
            .open(hw(0x10), Duration::from_secs(1))
            .await
            .expect("open");
        let mut reassembler = Reassembler::new();

        let add = ProxyConfigMessage::AddAddresses(vec![0x0001]).encode();
        let pdu = codec.encode_proxy_config(1, 0x0001, &add).expect("encode");
        write_pdu(&mesh, ProxyPduType::ProxyConfiguration, &pdu).await;
        let status = next_pdu(&mut link, &mut reassembler).await.expect("status");
        assert_eq!(status.pdu_type, ProxyPduType::ProxyConfiguration);
        assert_eq!(mesh.accept_list(), vec![0x0001]);

        let header = PduHeader {
            ctl: false,
            ttl: 5,
            seq: 2,
            src: 0x0001,
            dst: 0xC000,
        };
        let get = codec
            .encode_access(&header, &OnOffMessage::Get.encode())
            .expect("encode");
        write_pdu(&mesh, ProxyPduType::Network, &get).await;

        let mut sources = Vec::new();
        for _ in 0..2 {
            let pdu = next_pdu(&mut link, &mut reassembler).await.expect("reply");
            let message = codec.decode_network(&pdu.payload).expect("decode");
            sources.push(message.header.src);
        }
        sources.sort_unstable();
        assert_eq!(sources, vec![0x0010, 0x0011]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_floor_silences_nodes() {
        let mesh = SimulatedMesh::new(scenario(), &keys()).expect("mesh");
        mesh.set_replay_floor(1000);
        let codec = ClearCodec::new(&keys()).expect("codec");
        let _link = mesh
            .open(hw(0x10), Duration::from_secs(1))
            .await
            .expect("open");

        let set = OnOffMessage::Set {
            on: true,
            tid: 1,
            acknowledged: true,
        };
        let mut header = PduHeader {
            ctl: false,
            ttl: 5,
            seq: 500,
            src: 0x0001,
            dst: 0x0010,
        };
        let pdu = codec.encode_access(&header, &set.encode()).expect("encode");
        write_pdu(&mesh, ProxyPduType::Network, &pdu).await;
        assert_eq!(mesh.node_state(0x0010), Some(false));

        header.seq = 1001;
        let pdu = codec.encode_access(&header, &set.encode()).expect("encode");
        write_pdu(&mesh, ProxyPduType::Network, &pdu).await;
        assert_eq!(mesh.node_state(0x0010), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_refusal_and_missing_service() {
        let mut scenario = scenario();
        scenario.refuse_connects = 1;
        scenario.nodes[1].proxy = false;
        let mesh = SimulatedMesh::new(scenario, &keys()).expect("mesh");

        assert!(matches!(
            mesh.open(hw(0x10), Duration::from_secs(1)).await,
            Err(BearerError::ConnectFailed(_))
        ));
        assert!(matches!(
            mesh.open(hw(0x11), Duration::from_secs(1)).await,
            Err(BearerError::ServiceMissing(_))
        ));
        assert!(mesh.open(hw(0x10), Duration::from_secs(1)).await.is_ok());
        assert_eq!(mesh.connect_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gatt_momentary_switch() {
        let mut scenario = scenario();
        scenario.nodes[0].momentary_ms = Some(300);
        let mesh = SimulatedMesh::new(scenario, &keys()).expect("mesh");

        GattLink::connect(&mesh, hw(0x10)).await.expect("connect");
        GattLink::write(&mesh, hw(0x10), SIMULATED_ONOFF_CHARACTERISTIC, vec![1])
            .await
            .expect("write");
        assert_eq!(mesh.node_state(0x0010), Some(true));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(mesh.node_state(0x0010), Some(false));
    }
}
