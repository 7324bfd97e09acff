//! Per-device traffic estimation from interface counters.
//!
//! Only interface-level cumulative counters are observable, so each tick's
//! delta is split across devices in proportion to their connection counts.
//! The split is exact: integer shares are floored and the remainder is
//! handed out one byte at a time by descending connection count, then
//! ascending device key.

use crate::config::VirtualRange;
use crate::errors::{CollectionError, CounterAnomaly, CounterDirection};
use crate::model::{DeviceKey, InterfaceCounterSample};
use ipnetwork::IpNetwork;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Local address ranges routed through a VPN/proxy, each mapped to a tag
#[derive(Debug, Clone, Default)]
pub struct VirtualRanges {
    entries: Vec<(IpNetwork, String)>,
}

impl VirtualRanges {
    pub fn from_config(ranges: &[VirtualRange]) -> Self {
        let mut entries = Vec::new();
        for range in ranges {
            for cidr in &range.ranges {
                match cidr.parse::<IpNetwork>() {
                    Ok(net) => entries.push((net, range.tag.clone())),
                    Err(e) => warn!("Ignoring virtual range '{}' for '{}': {}", cidr, range.tag, e),
                }
            }
        }
        VirtualRanges { entries }
    }

    /// Tag of the first range containing `ip`
    pub fn tag_for(&self, ip: IpAddr) -> Option<&str> {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(ip))
            .map(|(_, tag)| tag.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A device's weight in this tick's split
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceShare {
    pub key: DeviceKey,
    pub connections: u32,
}

impl DeviceShare {
    pub fn new(key: DeviceKey, connections: u32) -> Self {
        DeviceShare { key, connections }
    }
}

/// Bytes attributed to one device for one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Allocation {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Clamped counter delta between two consecutive samples
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub anomalies: Vec<CounterAnomaly>,
}

impl CounterDelta {
    pub fn between(previous: &InterfaceCounterSample, current: &InterfaceCounterSample) -> Self {
        let mut anomalies = Vec::new();
        let bytes_in = clamped(previous.bytes_in, current.bytes_in, CounterDirection::In, &mut anomalies);
        let bytes_out = clamped(previous.bytes_out, current.bytes_out, CounterDirection::Out, &mut anomalies);
        CounterDelta {
            bytes_in,
            bytes_out,
            anomalies,
        }
    }
}

fn clamped(previous: u64, current: u64, direction: CounterDirection, anomalies: &mut Vec<CounterAnomaly>) -> u64 {
    if current < previous {
        let anomaly = CounterAnomaly {
            direction,
            previous,
            current,
        };
        warn!("Counter anomaly, delta clamped to 0: {}", anomaly);
        anomalies.push(anomaly);
        0
    } else {
        current - previous
    }
}

/// Why a tick produced no allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// First sample after start or after a failed tick
    Baseline,
    /// The collector failed; the message is the error text
    CollectionFailed(String),
}

/// Result of attributing one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickAllocation {
    pub allocations: BTreeMap<DeviceKey, Allocation>,
    pub total_in: u64,
    pub total_out: u64,
    pub anomalies: Vec<CounterAnomaly>,
    pub skipped: Option<SkipReason>,
}

impl TickAllocation {
    fn zero(devices: &[DeviceShare], skipped: Option<SkipReason>) -> Self {
        TickAllocation {
            allocations: devices.iter().map(|d| (d.key.clone(), Allocation::default())).collect(),
            total_in: 0,
            total_out: 0,
            anomalies: Vec::new(),
            skipped,
        }
    }

    pub fn get(&self, key: &DeviceKey) -> Allocation {
        self.allocations.get(key).copied().unwrap_or_default()
    }

    pub fn has_anomaly(&self) -> bool {
        !self.anomalies.is_empty()
    }
}

/// Split `total` across `devices` proportionally to connection count.
///
/// The returned parts line up with `devices` and always sum to `total`
/// when at least one device has a connection; otherwise all parts are 0.
pub fn split_exact(total: u64, devices: &[DeviceShare]) -> Vec<u64> {
    let total_connections: u64 = devices.iter().map(|d| d.connections as u64).sum();
    if total_connections == 0 || total == 0 {
        return vec![0; devices.len()];
    }

    let mut parts: Vec<u64> = devices
        .iter()
        .map(|d| ((total as u128 * d.connections as u128) / total_connections as u128) as u64)
        .collect();

    let mut remainder = total - parts.iter().sum::<u64>();

    let mut order: Vec<usize> = (0..devices.len()).filter(|&i| devices[i].connections > 0).collect();
    order.sort_by(|&a, &b| {
        devices[b]
            .connections
            .cmp(&devices[a].connections)
            .then_with(|| devices[a].key.cmp(&devices[b].key))
    });

    for &i in order.iter().cycle() {
        if remainder == 0 {
            break;
        }
        parts[i] += 1;
        remainder -= 1;
    }
    parts
}

/// Holds the previous/current counter pair and turns each new sample into
/// a per-device allocation.
#[derive(Debug, Default)]
pub struct TrafficAttributor {
    previous: Option<InterfaceCounterSample>,
    current: Option<InterfaceCounterSample>,
}

impl TrafficAttributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split the clamped delta between two samples across `devices`
    pub fn allocate(
        previous: &InterfaceCounterSample,
        current: &InterfaceCounterSample,
        devices: &[DeviceShare],
    ) -> TickAllocation {
        let delta = CounterDelta::between(previous, current);
        let ins = split_exact(delta.bytes_in, devices);
        let outs = split_exact(delta.bytes_out, devices);

        let allocations: BTreeMap<DeviceKey, Allocation> = devices
            .iter()
            .zip(ins.iter().zip(outs.iter()))
            .map(|(d, (bytes_in, bytes_out))| {
                (
                    d.key.clone(),
                    Allocation {
                        bytes_in: *bytes_in,
                        bytes_out: *bytes_out,
                    },
                )
            })
            .collect();

        let has_connections = devices.iter().any(|d| d.connections > 0);
        TickAllocation {
            allocations,
            total_in: if has_connections { delta.bytes_in } else { 0 },
            total_out: if has_connections { delta.bytes_out } else { 0 },
            anomalies: delta.anomalies,
            skipped: None,
        }
    }

    /// Record a new sample and allocate the delta from the one before it
    pub fn observe(&mut self, sample: InterfaceCounterSample, devices: &[DeviceShare]) -> TickAllocation {
        self.previous = self.current.replace(sample);
        match &self.previous {
            Some(previous) => {
                let result = Self::allocate(previous, &sample, devices);
                debug!(
                    "Allocated in={} out={} across {} devices",
                    result.total_in,
                    result.total_out,
                    devices.len()
                );
                result
            }
            None => {
                debug!("Counter baseline established (in={}, out={})", sample.bytes_in, sample.bytes_out);
                TickAllocation::zero(devices, Some(SkipReason::Baseline))
            }
        }
    }

    /// Skip this tick after a collector failure. Both samples are dropped so
    /// the next allocation never spans more than one tick.
    pub fn skip(&mut self, error: &CollectionError, devices: &[DeviceShare]) -> TickAllocation {
        warn!("Skipping allocation this tick: {}", error);
        self.previous = None;
        self.current = None;
        TickAllocation::zero(devices, Some(SkipReason::CollectionFailed(error.to_string())))
    }

    pub fn current_sample(&self) -> Option<&InterfaceCounterSample> {
        self.current.as_ref()
    }
}
