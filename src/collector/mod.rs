//! Platform data acquisition.
//!
//! The core only ever talks to [`DataCollector`]; one implementation is
//! picked at startup from the target OS.

use crate::errors::CollectionError;
use crate::model::{ArpTable, InterfaceCounterSample, RawConnection};
use ipnetwork::IpNetwork;
use std::collections::HashMap;

pub mod darwin;
pub mod linux;

pub use darwin::DarwinCollector;
pub use linux::LinuxCollector;

/// Source of one host's ARP table, connection list and interface counters
pub trait DataCollector: Send {
    /// Human-readable name of this collector
    fn name(&self) -> &'static str;

    fn get_arp_table(&self) -> Result<ArpTable, CollectionError>;

    /// Active (established) connections
    fn get_connections(&self) -> Result<Vec<RawConnection>, CollectionError>;

    /// Cumulative counters of the monitored interface
    fn get_interface_counters(&self) -> Result<InterfaceCounterSample, CollectionError>;

    fn detect_local_network(&self) -> Result<IpNetwork, CollectionError>;
}

/// Collector used on platforms without an implementation
#[derive(Debug, Default)]
pub struct UnsupportedCollector {
    os: String,
}

impl UnsupportedCollector {
    pub fn new(os: impl Into<String>) -> Self {
        UnsupportedCollector { os: os.into() }
    }

    fn unsupported(&self) -> CollectionError {
        CollectionError::Unsupported(self.os.clone())
    }
}

impl DataCollector for UnsupportedCollector {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn get_arp_table(&self) -> Result<ArpTable, CollectionError> {
        Err(self.unsupported())
    }

    fn get_connections(&self) -> Result<Vec<RawConnection>, CollectionError> {
        Err(self.unsupported())
    }

    fn get_interface_counters(&self) -> Result<InterfaceCounterSample, CollectionError> {
        Err(self.unsupported())
    }

    fn detect_local_network(&self) -> Result<IpNetwork, CollectionError> {
        Err(self.unsupported())
    }
}

/// Pick the collector for the running platform
pub fn create_data_collector(interface: Option<String>) -> Box<dyn DataCollector> {
    if cfg!(target_os = "linux") {
        Box::new(LinuxCollector::new(interface))
    } else if cfg!(target_os = "macos") {
        Box::new(DarwinCollector::new(interface))
    } else {
        Box::new(UnsupportedCollector::new(std::env::consts::OS))
    }
}

/// Normalize a MAC address to upper-case colon form (`AA:BB:CC:DD:EE:FF`).
///
/// Accepts `:`/`-` separated octets (single-digit octets are padded, as
/// printed by BSD `arp`), Cisco dotted form and bare 12-digit hex. Returns
/// None for malformed, all-zero and broadcast addresses.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let trimmed = mac.trim();
    let octets: Vec<String> = if trimmed.contains(':') || trimmed.contains('-') {
        let parts: Vec<&str> = trimmed.split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return None;
        }
        parts
            .iter()
            .map(|p| {
                if p.is_empty() || p.len() > 2 || !p.chars().all(|c| c.is_ascii_hexdigit()) {
                    None
                } else {
                    Some(format!("{:0>2}", p.to_uppercase()))
                }
            })
            .collect::<Option<Vec<String>>>()?
    } else {
        let clean = trimmed.replace('.', "");
        if clean.len() != 12 || !clean.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        clean
            .as_bytes()
            .chunks(2)
            .map(|chunk| String::from_utf8_lossy(chunk).to_uppercase())
            .collect()
    };

    let joined = octets.join(":");
    if joined == "00:00:00:00:00:00" || joined == "FF:FF:FF:FF:FF:FF" {
        return None;
    }
    Some(joined)
}

/// Per-interface cumulative counters before interface selection
pub(crate) type CounterTable = HashMap<String, (u64, u64)>;

/// Reduce a per-interface table to the monitored interface (or all non-loopback ones)
pub(crate) fn select_counters(
    table: &CounterTable,
    interface: Option<&str>,
) -> Result<(u64, u64), CollectionError> {
    match interface {
        Some(name) => table
            .get(name)
            .copied()
            .ok_or_else(|| CollectionError::InterfaceNotFound(name.to_string())),
        None => {
            let mut totals = (0u64, 0u64);
            let mut any = false;
            for (name, (bytes_in, bytes_out)) in table {
                if name.starts_with("lo") {
                    continue;
                }
                any = true;
                totals.0 = totals.0.saturating_add(*bytes_in);
                totals.1 = totals.1.saturating_add(*bytes_out);
            }
            if !any {
                return Err(CollectionError::unparseable("interface counters", "no non-loopback interface"));
            }
            Ok(totals)
        }
    }
}
