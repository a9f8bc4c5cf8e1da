//! Device and group registry
//!
//! Devices are created from advertisements or status messages and are never
//! removed, only marked absent. Group membership is derived: a device's
//! assigned group plus confirmed-membership sets keyed by group id.

use crate::address::{is_group, HardwareAddress};
use crate::events::StatusEvent;
use crate::model::device::{Device, LinkStatus};
use crate::model::group::Group;
use crate::scan::AdvertisementRecord;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Records are slots in `devices` and are never removed. Advertised devices
/// are indexed by hardware address; every record is indexed by unicast, and
/// one unicast may map to several records when derived addresses collide.
#[derive(Debug, Default)]
struct RegistryState {
    devices: Vec<Device>,
    by_hardware: HashMap<HardwareAddress, usize>,
    by_unicast: BTreeMap<u16, Vec<usize>>,
    groups: BTreeMap<u16, Group>,
    confirmed: HashMap<u16, BTreeSet<u16>>,
    active_discovery: Option<(u16, Instant)>,
}

impl RegistryState {
    fn slots(&self, unicast: u16) -> Vec<usize> {
        self.by_unicast.get(&unicast).cloned().unwrap_or_default()
    }

    fn insert(&mut self, device: Device) -> usize {
        let slot = self.devices.len();
        if let Some(hardware) = device.hardware {
            self.by_hardware.insert(hardware, slot);
        }
        self.by_unicast.entry(device.unicast).or_default().push(slot);
        self.devices.push(device);
        slot
    }

    /// Records for `unicast`, creating a mesh-only one when none exists
    fn slots_or_insert(&mut self, unicast: u16) -> Vec<usize> {
        let slots = self.slots(unicast);
        if slots.is_empty() {
            vec![self.insert(Device::from_unicast(unicast))]
        } else {
            slots
        }
    }

    /// Slot for an advertised hardware address. A mesh-only record with the
    /// same unicast adopts the address; otherwise a new record is created.
    fn slot_for_hardware(&mut self, hardware: HardwareAddress) -> usize {
        if let Some(slot) = self.by_hardware.get(&hardware) {
            return *slot;
        }
        let unicast = hardware.unicast();
        let slots = self.slots(unicast);
        if let Some(slot) = slots
            .iter()
            .copied()
            .find(|s| self.devices[*s].hardware.is_none())
        {
            self.devices[slot].hardware = Some(hardware);
            self.by_hardware.insert(hardware, slot);
            return slot;
        }
        if let Some(other) = slots.iter().find_map(|s| self.devices[*s].hardware) {
            warn!(
                "Unicast collision: {} and {} both derive 0x{:04X}",
                other, hardware, unicast
            );
        } else {
            debug!("New device {} -> 0x{:04X}", hardware, unicast);
        }
        self.insert(Device::from_hardware(hardware))
    }

    fn confirm(&mut self, group: u16, unicast: u16) -> bool {
        self.groups.entry(group).or_insert_with(|| Group::new(group));
        let inserted = self.confirmed.entry(group).or_default().insert(unicast);
        for slot in self.slots(unicast) {
            let device = &mut self.devices[slot];
            if device.group.is_none() {
                device.group = Some(group);
            }
        }
        inserted
    }
}

/// Shared device/group model
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an advertisement. Returns the device's unicast address.
    ///
    /// An absent device only comes back when the record is newer than the
    /// last advertisement merged for it.
    pub fn upsert_advertisement(&self, record: &AdvertisementRecord) -> u16 {
        let mut state = self.state.write();
        let slot = state.slot_for_hardware(record.address);
        let device = &mut state.devices[slot];
        let fresh = match (record.last_seen, device.last_advertised) {
            (Some(heard), Some(previous)) => heard > previous,
            _ => true,
        };
        if let Some(heard) = record.last_seen {
            if fresh {
                device.last_advertised = Some(heard);
            }
        }
        device.rssi = Some(record.rssi);
        device.proxy_capable |= record.is_proxy_capable();
        if let Some(level) = record.battery_hint() {
            device.battery = Some(level);
        }
        if record.local_name.is_some() {
            device.name = record.local_name.clone();
        }
        if device.link == LinkStatus::Absent && fresh {
            device.link = LinkStatus::Connected;
        }
        device.touch();
        device.unicast
    }

    /// Apply a status report to every record with the source unicast. While
    /// a group discovery window is active the source is confirmed as a
    /// member of that group.
    pub fn apply_status(&self, event: &StatusEvent) {
        let mut state = self.state.write();
        for slot in state.slots_or_insert(event.source) {
            let device = &mut state.devices[slot];
            device.state = Some(event.target_state.unwrap_or(event.state));
            device.last_seen = Some(event.at);
        }

        if let Some((group, deadline)) = state.active_discovery {
            if event.at <= deadline && state.confirm(group, event.source) {
                debug!(
                    "0x{:04X} confirmed in group 0x{:04X} by status",
                    event.source, group
                );
            }
        }
    }

    /// Ensure a group record exists. Returns true when it was created.
    pub fn ensure_group(&self, id: u16) -> bool {
        if !is_group(id) {
            return false;
        }
        let mut state = self.state.write();
        if state.groups.contains_key(&id) {
            return false;
        }
        info!("Group 0x{:04X} created", id);
        state.groups.insert(id, Group::new(id));
        true
    }

    /// Assign every device with `unicast` to a group, creating records as
    /// needed
    pub fn assign_group(&self, unicast: u16, group: u16) {
        let mut state = self.state.write();
        state.groups.entry(group).or_insert_with(|| Group::new(group));
        for slot in state.slots_or_insert(unicast) {
            state.devices[slot].group = Some(group);
        }
    }

    /// Record confirmed membership; unassigned devices adopt the group
    pub fn confirm_member(&self, group: u16, unicast: u16) -> bool {
        self.state.write().confirm(group, unicast)
    }

    pub fn confirmed_members(&self, group: u16) -> Vec<u16> {
        self.state
            .read()
            .confirmed
            .get(&group)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Devices assigned to or confirmed in `group`
    pub fn members_of(&self, group: u16) -> Vec<Device> {
        let state = self.state.read();
        let confirmed = state.confirmed.get(&group);
        let mut members: Vec<Device> = state
            .devices
            .iter()
            .filter(|d| {
                d.group == Some(group) || confirmed.map_or(false, |c| c.contains(&d.unicast))
            })
            .cloned()
            .collect();
        members.sort_by_key(|d| d.unicast);
        members
    }

    /// Set the group whose statuses count as membership until `deadline`
    pub fn begin_group_discovery(&self, group: u16, deadline: Instant) {
        self.state.write().active_discovery = Some((group, deadline));
    }

    pub fn end_group_discovery(&self) {
        self.state.write().active_discovery = None;
    }

    pub fn active_discovery_group(&self) -> Option<u16> {
        self.state.read().active_discovery.map(|(g, _)| g)
    }

    /// First record known under `unicast`
    pub fn device(&self, unicast: u16) -> Option<Device> {
        let state = self.state.read();
        state
            .by_unicast
            .get(&unicast)
            .and_then(|slots| slots.first())
            .map(|slot| state.devices[*slot].clone())
    }

    /// Every record known under `unicast`; more than one on a collision
    pub fn devices_with_unicast(&self, unicast: u16) -> Vec<Device> {
        let state = self.state.read();
        state
            .slots(unicast)
            .into_iter()
            .map(|slot| state.devices[slot].clone())
            .collect()
    }

    pub fn device_by_hardware(&self, hardware: &HardwareAddress) -> Option<Device> {
        let state = self.state.read();
        state
            .by_hardware
            .get(hardware)
            .map(|slot| state.devices[*slot].clone())
    }

    /// All devices ordered by unicast, then by first sighting
    pub fn devices(&self) -> Vec<Device> {
        let state = self.state.read();
        state
            .by_unicast
            .values()
            .flatten()
            .map(|slot| state.devices[*slot].clone())
            .collect()
    }

    pub fn groups(&self) -> Vec<Group> {
        self.state.read().groups.values().cloned().collect()
    }

    pub fn group_ids(&self) -> Vec<u16> {
        self.state.read().groups.keys().copied().collect()
    }

    pub fn set_link(&self, hardware: &HardwareAddress, link: LinkStatus) {
        let mut state = self.state.write();
        if let Some(slot) = state.by_hardware.get(hardware).copied() {
            state.devices[slot].link = link;
        }
    }

    /// Mark advertised devices missing from `seen` as absent. The connected
    /// proxy and mesh-only records are left alone.
    pub fn mark_absent_except(&self, seen: &[HardwareAddress]) -> usize {
        let mut state = self.state.write();
        let mut marked = 0;
        for device in state.devices.iter_mut() {
            let Some(hardware) = device.hardware else {
                continue;
            };
            if !seen.contains(&hardware)
                && device.link != LinkStatus::Ready
                && device.link != LinkStatus::Absent
            {
                device.link = LinkStatus::Absent;
                marked += 1;
            }
        }
        if marked > 0 {
            debug!("{} device(s) no longer advertising", marked);
        }
        marked
    }

    pub fn len(&self) -> usize {
        self.state.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
