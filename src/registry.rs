//! Devices tracked across polling ticks.
//!
//! Identity is the MAC address when ARP knows it, the IP otherwise, or the
//! virtual tag for addresses inside a configured VPN/proxy range. Virtual
//! membership wins over ARP.

use crate::attribution::{DeviceShare, TickAllocation, VirtualRanges};
use crate::model::{ArpTable, Connection, ConnectionKey, Device, DeviceKey, RawConnection};
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

/// A device dropped after staying unseen for too long
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalEvent {
    pub key: DeviceKey,
    pub display_name: String,
    pub idle_ticks: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// An IP-keyed device folded into the MAC-keyed device ARP resolved it to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeEvent {
    pub from: DeviceKey,
    pub into: DeviceKey,
}

/// What changed in one registry update
#[derive(Debug, Default)]
pub struct RegistryUpdate {
    /// This tick's connections, each with its owning device
    pub connections: Vec<Connection>,
    pub created: Vec<DeviceKey>,
    pub merged: Vec<MergeEvent>,
    pub removed: Vec<RemovalEvent>,
}

pub struct DeviceRegistry {
    devices: BTreeMap<DeviceKey, Device>,
    /// IPs that ARP has resolved to a MAC-keyed device
    ip_index: HashMap<IpAddr, DeviceKey>,
    first_seen: HashMap<ConnectionKey, DateTime<Utc>>,
    virtual_ranges: VirtualRanges,
    prune_after_ticks: u64,
}

impl DeviceRegistry {
    pub fn new(virtual_ranges: VirtualRanges, prune_after_ticks: u64) -> Self {
        DeviceRegistry {
            devices: BTreeMap::new(),
            ip_index: HashMap::new(),
            first_seen: HashMap::new(),
            virtual_ranges,
            prune_after_ticks,
        }
    }

    /// Fold the latest ARP table and connection list into the registry
    pub fn update(
        &mut self,
        arp: &ArpTable,
        connections: &[RawConnection],
        tick: u64,
        now: DateTime<Utc>,
    ) -> RegistryUpdate {
        let mut update = RegistryUpdate::default();

        for device in self.devices.values_mut() {
            device.connection_count = 0;
        }

        self.resolve_identities(arp, tick, now, &mut update);
        update.connections = self.attach_connections(connections, tick, now, &mut update);
        update.removed = self.prune(tick);

        update
    }

    fn resolve_identities(&mut self, arp: &ArpTable, tick: u64, now: DateTime<Utc>, update: &mut RegistryUpdate) {
        // Only this tick's ARP table owns IPs; a MAC that moved stops owning its old address
        self.ip_index.retain(|ip, key| match (&*key, arp.get(ip)) {
            (DeviceKey::Mac(owner), Some(current)) => owner == current,
            _ => false,
        });

        let mut entries: Vec<(&IpAddr, &String)> = arp.iter().collect();
        entries.sort();

        for (ip, mac) in entries {
            if self.virtual_ranges.tag_for(*ip).is_some() {
                continue;
            }
            let mac_key = DeviceKey::Mac(mac.clone());
            let ip_key = DeviceKey::Ip(*ip);

            if let Some(ip_device) = self.devices.remove(&ip_key) {
                match self.devices.get_mut(&mac_key) {
                    Some(mac_device) => {
                        info!("Merging {} into {}", ip_key, mac_key);
                        mac_device.absorb(ip_device);
                        update.merged.push(MergeEvent {
                            from: ip_key,
                            into: mac_key.clone(),
                        });
                    }
                    None => {
                        debug!("{} resolved to {}", ip_key, mac_key);
                        let mut device = ip_device;
                        device.key = mac_key.clone();
                        device.mac = Some(mac.clone());
                        self.devices.insert(mac_key.clone(), device);
                    }
                }
            }

            self.ip_index.insert(*ip, mac_key.clone());

            let device = self.devices.entry(mac_key.clone()).or_insert_with(|| {
                update.created.push(mac_key.clone());
                Device::physical(mac_key.clone(), Some(*ip), Some(mac.clone()), tick, now)
            });
            device.ip = Some(*ip);
            device.last_seen_tick = tick;
        }
    }

    fn key_for(&self, ip: IpAddr) -> DeviceKey {
        if let Some(tag) = self.virtual_ranges.tag_for(ip) {
            return DeviceKey::Virtual(tag.to_string());
        }
        match self.ip_index.get(&ip) {
            Some(key) if self.devices.contains_key(key) => key.clone(),
            _ => DeviceKey::Ip(ip),
        }
    }

    fn attach_connections(
        &mut self,
        connections: &[RawConnection],
        tick: u64,
        now: DateTime<Utc>,
        update: &mut RegistryUpdate,
    ) -> Vec<Connection> {
        let mut first_seen = HashMap::with_capacity(connections.len());
        let mut attached = Vec::with_capacity(connections.len());

        for raw in connections {
            let ip = raw.local.ip();
            let key = self.key_for(ip);

            let device = self.devices.entry(key.clone()).or_insert_with(|| {
                update.created.push(key.clone());
                match &key {
                    DeviceKey::Virtual(tag) => Device::virtual_device(tag, tick, now),
                    _ => Device::physical(key.clone(), Some(ip), None, tick, now),
                }
            });
            device.connection_count = device.connection_count.saturating_add(1);
            device.last_seen_tick = tick;

            let conn_key = raw.key();
            let since = self.first_seen.get(&conn_key).copied().unwrap_or(now);
            first_seen.insert(conn_key, since);

            attached.push(Connection {
                local: raw.local,
                remote: raw.remote,
                protocol: raw.protocol,
                state: raw.state.clone(),
                first_seen: since,
                last_seen: now,
                device: key,
                service: None,
            });
        }

        // Connections that disappeared are forgotten
        self.first_seen = first_seen;
        attached
    }

    fn prune(&mut self, tick: u64) -> Vec<RemovalEvent> {
        let limit = self.prune_after_ticks;
        let stale: Vec<DeviceKey> = self
            .devices
            .values()
            .filter(|d| tick.saturating_sub(d.last_seen_tick) > limit)
            .map(|d| d.key.clone())
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some(device) = self.devices.remove(&key) {
                let event = RemovalEvent {
                    key: device.key.clone(),
                    display_name: device.display_name.clone(),
                    idle_ticks: tick.saturating_sub(device.last_seen_tick),
                    bytes_in: device.bytes_in,
                    bytes_out: device.bytes_out,
                };
                crate::log_removal!(event);
                removed.push(event);
            }
        }
        if !removed.is_empty() {
            self.ip_index.retain(|_, key| self.devices.contains_key(key));
        }
        removed
    }

    /// Every device's weight for this tick, in key order
    pub fn shares(&self) -> Vec<DeviceShare> {
        self.devices
            .values()
            .map(|d| DeviceShare::new(d.key.clone(), d.connection_count))
            .collect()
    }

    /// Add a tick's allocation to the devices' running totals
    pub fn apply(&mut self, allocation: &TickAllocation) {
        for (key, bytes) in &allocation.allocations {
            if let Some(device) = self.devices.get_mut(key) {
                device.add_traffic(bytes.bytes_in, bytes.bytes_out);
            }
        }
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn get(&self, key: &DeviceKey) -> Option<&Device> {
        self.devices.get(key)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::Allocation;
    use crate::config::VirtualRange;
    use crate::model::Protocol;
    use std::net::SocketAddr;

    fn conn(local: &str, remote: &str) -> RawConnection {
        RawConnection {
            local: local.parse::<SocketAddr>().unwrap(),
            remote: remote.parse::<SocketAddr>().unwrap(),
            protocol: Protocol::Tcp,
            state: "ESTABLISHED".to_string(),
        }
    }

    fn registry() -> DeviceRegistry {
        let ranges = VirtualRanges::from_config(&[VirtualRange {
            tag: "Clash".to_string(),
            ranges: vec!["28.0.0.0/24".to_string()],
        }]);
        DeviceRegistry::new(ranges, 3)
    }

    fn allocation(key: DeviceKey, bytes_in: u64, bytes_out: u64) -> TickAllocation {
        let mut alloc = TickAllocation::default();
        alloc.allocations.insert(key, Allocation { bytes_in, bytes_out });
        alloc
    }

    #[test]
    fn test_connections_are_counted_per_device() {
        let mut reg = registry();
        let now = Utc::now();
        let update = reg.update(
            &ArpTable::new(),
            &[
                conn("192.168.1.5:50000", "8.8.8.8:443"),
                conn("192.168.1.5:50001", "1.1.1.1:443"),
                conn("192.168.1.6:50002", "1.1.1.1:443"),
            ],
            1,
            now,
        );
        assert_eq!(update.connections.len(), 3);
        assert_eq!(update.created.len(), 2);
        let ip5 = DeviceKey::Ip("192.168.1.5".parse().unwrap());
        assert_eq!(reg.get(&ip5).unwrap().connection_count, 2);
        assert_eq!(update.connections[0].device, ip5);
    }

    #[test]
    fn test_virtual_range_aggregates_under_tag() {
        let mut reg = registry();
        let mut arp = ArpTable::new();
        // Virtual membership wins over ARP identity
        arp.insert("28.0.0.1".parse().unwrap(), "AA:BB:CC:00:00:01".to_string());
        reg.update(
            &arp,
            &[conn("28.0.0.1:1000", "142.250.1.1:443"), conn("28.0.0.2:1001", "142.250.1.2:443")],
            1,
            Utc::now(),
        );
        let tag = DeviceKey::Virtual("Clash".to_string());
        let device = reg.get(&tag).unwrap();
        assert!(device.is_virtual);
        assert_eq!(device.connection_count, 2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_arp_merge_sums_counters() {
        let mut reg = registry();
        let now = Utc::now();
        let ip: IpAddr = "192.168.1.20".parse().unwrap();
        let mac = "AA:BB:CC:DD:EE:20".to_string();
        let mac_key = DeviceKey::Mac(mac.clone());

        // Known by MAC under another IP
        let mut arp = ArpTable::new();
        arp.insert("192.168.1.21".parse().unwrap(), mac.clone());
        reg.update(&arp, &[], 1, now);
        reg.apply(&allocation(mac_key.clone(), 100, 10));

        // Unresolved IP with traffic of its own
        reg.update(&ArpTable::new(), &[conn("192.168.1.20:4000", "1.1.1.1:443")], 2, now);
        reg.apply(&allocation(DeviceKey::Ip(ip), 40, 4));

        // ARP now resolves that IP to the same MAC
        let mut arp = ArpTable::new();
        arp.insert(ip, mac.clone());
        let update = reg.update(&arp, &[conn("192.168.1.20:4000", "1.1.1.1:443")], 3, now);

        assert_eq!(
            update.merged,
            vec![MergeEvent {
                from: DeviceKey::Ip(ip),
                into: mac_key.clone()
            }]
        );
        assert!(reg.get(&DeviceKey::Ip(ip)).is_none());
        let device = reg.get(&mac_key).unwrap();
        assert_eq!((device.bytes_in, device.bytes_out), (140, 14));
        assert_eq!(device.connection_count, 1);
        assert_eq!(update.connections[0].device, mac_key);
    }

    #[test]
    fn test_ip_device_is_rekeyed_when_mac_is_new() {
        let mut reg = registry();
        let now = Utc::now();
        let ip: IpAddr = "192.168.1.30".parse().unwrap();
        reg.update(&ArpTable::new(), &[conn("192.168.1.30:4000", "1.1.1.1:443")], 1, now);
        reg.apply(&allocation(DeviceKey::Ip(ip), 7, 3));

        let mut arp = ArpTable::new();
        arp.insert(ip, "AA:BB:CC:DD:EE:30".to_string());
        let update = reg.update(&arp, &[], 2, now);
        assert!(update.merged.is_empty());

        let device = reg.get(&DeviceKey::Mac("AA:BB:CC:DD:EE:30".to_string())).unwrap();
        assert_eq!(device.bytes_in, 7);
        assert_eq!(device.mac.as_deref(), Some("AA:BB:CC:DD:EE:30"));
    }

    #[test]
    fn test_moved_mac_releases_old_address() {
        let mut reg = registry();
        let now = Utc::now();
        let old_ip: IpAddr = "192.168.1.10".parse().unwrap();
        let new_ip: IpAddr = "192.168.1.11".parse().unwrap();
        let mac_key = DeviceKey::Mac("AA:AA:AA:AA:AA:01".to_string());

        let mut arp = ArpTable::new();
        arp.insert(old_ip, "AA:AA:AA:AA:AA:01".to_string());
        reg.update(&arp, &[], 1, now);

        // DHCP handed the phone a new lease; something else now talks from the old address
        let mut arp = ArpTable::new();
        arp.insert(new_ip, "AA:AA:AA:AA:AA:01".to_string());
        let update = reg.update(&arp, &[conn("192.168.1.10:5000", "1.1.1.1:443")], 2, now);

        assert_eq!(update.connections[0].device, DeviceKey::Ip(old_ip));
        let phone = reg.get(&mac_key).unwrap();
        assert_eq!(phone.ip, Some(new_ip));
        assert_eq!(phone.connection_count, 0);
        assert_eq!(reg.get(&DeviceKey::Ip(old_ip)).unwrap().connection_count, 1);
    }

    #[test]
    fn test_prune_after_idle_ticks() {
        let mut reg = registry();
        let now = Utc::now();
        reg.update(&ArpTable::new(), &[conn("192.168.1.40:4000", "1.1.1.1:443")], 1, now);

        for tick in 2..=4 {
            let update = reg.update(&ArpTable::new(), &[], tick, now);
            assert!(update.removed.is_empty(), "removed too early at tick {}", tick);
        }
        let update = reg.update(&ArpTable::new(), &[], 5, now);
        assert_eq!(update.removed.len(), 1);
        assert_eq!(update.removed[0].idle_ticks, 4);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_connection_first_seen_survives_ticks() {
        let mut reg = registry();
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(2);
        let c = conn("192.168.1.50:4000", "1.1.1.1:443");

        reg.update(&ArpTable::new(), &[c.clone()], 1, t1);
        let update = reg.update(&ArpTable::new(), &[c], 2, t2);
        assert_eq!(update.connections[0].first_seen, t1);
        assert_eq!(update.connections[0].last_seen, t2);
    }
}
