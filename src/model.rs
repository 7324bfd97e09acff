use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Service name given to an IP whose reverse lookup failed or matched nothing
pub const UNKNOWN_SERVICE: &str = "unknown";

/// Service name shown while an IP has no completed classification yet
pub const UNRESOLVED_SERVICE: &str = "unresolved";

/// ARP table as reported by the collector: IP -> normalized MAC
pub type ArpTable = HashMap<IpAddr, String>;

/// Stable identity of a tracked device.
///
/// Ordering is part of the allocation contract: remainder bytes go to
/// devices in ascending key order when connection counts tie.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKey {
    Mac(String),
    Ip(IpAddr),
    Virtual(String),
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKey::Mac(mac) => write!(f, "{}", mac),
            DeviceKey::Ip(ip) => write!(f, "{}", ip),
            DeviceKey::Virtual(tag) => write!(f, "{}", tag),
        }
    }
}

/// A local or virtual device tracked across polling ticks
#[derive(Debug, Clone)]
pub struct Device {
    pub key: DeviceKey,
    pub display_name: String,
    pub ip: Option<IpAddr>,
    pub mac: Option<String>,
    pub is_virtual: bool,
    pub vpn_tag: Option<String>,
    /// Aggregate estimated bytes; never decreases during a run
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Connections attributed to this device in the current tick
    pub connection_count: u32,
    pub last_seen_tick: u64,
    pub first_seen: DateTime<Utc>,
}

impl Device {
    pub fn physical(key: DeviceKey, ip: Option<IpAddr>, mac: Option<String>, tick: u64, now: DateTime<Utc>) -> Self {
        let display_name = match (&ip, &key) {
            (Some(ip), _) => format!("Device {}", ip),
            (None, key) => format!("Device {}", key),
        };
        Device {
            key,
            display_name,
            ip,
            mac,
            is_virtual: false,
            vpn_tag: None,
            bytes_in: 0,
            bytes_out: 0,
            connection_count: 0,
            last_seen_tick: tick,
            first_seen: now,
        }
    }

    pub fn virtual_device(tag: &str, tick: u64, now: DateTime<Utc>) -> Self {
        Device {
            key: DeviceKey::Virtual(tag.to_string()),
            display_name: tag.to_string(),
            ip: None,
            mac: None,
            is_virtual: true,
            vpn_tag: Some(tag.to_string()),
            bytes_in: 0,
            bytes_out: 0,
            connection_count: 0,
            last_seen_tick: tick,
            first_seen: now,
        }
    }

    pub fn add_traffic(&mut self, bytes_in: u64, bytes_out: u64) {
        self.bytes_in = self.bytes_in.saturating_add(bytes_in);
        self.bytes_out = self.bytes_out.saturating_add(bytes_out);
    }

    /// Fold another record of the same physical device into this one.
    /// Historical counters are summed, never reset.
    pub fn absorb(&mut self, other: Device) {
        self.add_traffic(other.bytes_in, other.bytes_out);
        self.connection_count = self.connection_count.saturating_add(other.connection_count);
        self.last_seen_tick = self.last_seen_tick.max(other.last_seen_tick);
        self.first_seen = self.first_seen.min(other.first_seen);
        if self.ip.is_none() {
            self.ip = other.ip;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Connection tuple exactly as the collector reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawConnection {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub protocol: Protocol,
    pub state: String,
}

impl RawConnection {
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            local: self.local,
            remote: self.remote,
            protocol: self.protocol,
        }
    }
}

/// Identity used to diff connections between ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub protocol: Protocol,
}

/// A connection for the current tick, annotated with its owner and service
#[derive(Debug, Clone)]
pub struct Connection {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub protocol: Protocol,
    pub state: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub device: DeviceKey,
    pub service: Option<ServiceMatch>,
}

impl Connection {
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            local: self.local,
            remote: self.remote,
            protocol: self.protocol,
        }
    }
}

/// One reading of the monitored interface's cumulative byte counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceCounterSample {
    pub timestamp: DateTime<Utc>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Stage of the classification pipeline that produced a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Tier {
    Range = 1,
    Asn = 2,
    Pattern = 3,
    ReverseDns = 4,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Range, Tier::Asn, Tier::Pattern, Tier::ReverseDns];

    /// Fixed confidence of a positive match at this tier
    pub fn confidence(self) -> f64 {
        match self {
            Tier::Range => 0.95,
            Tier::Asn => 0.85,
            Tier::Pattern => 0.75,
            Tier::ReverseDns => 0.60,
        }
    }

    pub fn number(self) -> u8 {
        self as u8
    }

    pub(crate) fn index(self) -> usize {
        self as usize - 1
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Tier::Range),
            2 => Ok(Tier::Asn),
            3 => Ok(Tier::Pattern),
            4 => Ok(Tier::ReverseDns),
            other => Err(format!("invalid tier {}", other)),
        }
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> u8 {
        tier.number()
    }
}

/// Classification of a remote IP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMatch {
    pub ip: IpAddr,
    pub service_name: String,
    pub tier: Tier,
    pub confidence: f64,
    pub resolved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl ServiceMatch {
    pub fn matched(ip: IpAddr, service_name: impl Into<String>, tier: Tier, resolved_at: DateTime<Utc>) -> Self {
        ServiceMatch {
            ip,
            service_name: service_name.into(),
            tier,
            confidence: tier.confidence(),
            resolved_at,
            hostname: None,
        }
    }

    /// Reverse lookup failed, timed out, or matched no keyword
    pub fn unknown(ip: IpAddr, hostname: Option<String>, resolved_at: DateTime<Utc>) -> Self {
        ServiceMatch {
            ip,
            service_name: UNKNOWN_SERVICE.to_string(),
            tier: Tier::ReverseDns,
            confidence: 0.0,
            resolved_at,
            hostname,
        }
    }

    /// Placeholder while the first reverse lookup is still in flight; never cached
    pub fn unresolved(ip: IpAddr, now: DateTime<Utc>) -> Self {
        ServiceMatch {
            ip,
            service_name: UNRESOLVED_SERVICE.to_string(),
            tier: Tier::ReverseDns,
            confidence: 0.0,
            resolved_at: now,
            hostname: None,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn is_unknown(&self) -> bool {
        self.service_name == UNKNOWN_SERVICE
    }

    pub fn is_unresolved(&self) -> bool {
        self.service_name == UNRESOLVED_SERVICE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_tier_confidence_strictly_decreasing() {
        let confidences: Vec<f64> = Tier::ALL.iter().map(|t| t.confidence()).collect();
        assert!(confidences.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(Tier::Range.confidence(), 0.95);
        assert_eq!(Tier::ReverseDns.confidence(), 0.60);
    }

    #[test]
    fn test_tier_rejects_out_of_range() {
        assert_eq!(Tier::try_from(3), Ok(Tier::Pattern));
        assert!(Tier::try_from(0).is_err());
        assert!(Tier::try_from(5).is_err());
    }

    #[test]
    fn test_device_key_order_and_display() {
        let a = DeviceKey::Ip(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)));
        let b = DeviceKey::Ip(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)));
        assert!(a < b);
        assert_eq!(b.to_string(), "192.168.1.10");
        assert_eq!(DeviceKey::Virtual("VPN".into()).to_string(), "VPN");
    }

    #[test]
    fn test_absorb_sums_counters() {
        let now = Utc::now();
        let mut mac_dev = Device::physical(DeviceKey::Mac("AA:BB:CC:DD:EE:FF".into()), None, None, 3, now);
        mac_dev.add_traffic(100, 10);
        let mut ip_dev = Device::physical(
            DeviceKey::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))),
            None,
            7,
            now,
        );
        ip_dev.add_traffic(50, 5);

        mac_dev.absorb(ip_dev);
        assert_eq!(mac_dev.bytes_in, 150);
        assert_eq!(mac_dev.bytes_out, 15);
        assert_eq!(mac_dev.last_seen_tick, 7);
        assert_eq!(mac_dev.ip, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))));
    }

    #[test]
    fn test_unknown_match_has_zero_confidence() {
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));
        let m = ServiceMatch::unknown(ip, None, Utc::now());
        assert!(m.is_unknown());
        assert_eq!(m.tier, Tier::ReverseDns);
        assert_eq!(m.confidence, 0.0);
    }
}
