use crate::config::AsnPrefix;
use crate::errors::LookupError;
use ipnetwork::IpNetwork;
use log::warn;
use std::net::IpAddr;

/// Resolves the autonomous system announcing an address.
///
/// Called inline on the polling tick, so implementations must answer from
/// local data.
pub trait AsnLookup: Send + Sync {
    /// `Ok(None)` when the address is not announced by any known AS
    fn lookup_asn(&self, ip: IpAddr) -> Result<Option<u32>, LookupError>;
}

/// Longest-prefix match over a static prefix -> AS table
#[derive(Debug, Default)]
pub struct PrefixAsnLookup {
    prefixes: Vec<(IpNetwork, u32)>,
}

impl PrefixAsnLookup {
    pub fn from_config(prefixes: &[AsnPrefix]) -> Self {
        let mut table = Vec::with_capacity(prefixes.len());
        for entry in prefixes {
            match entry.network.parse::<IpNetwork>() {
                Ok(net) => table.push((net, entry.asn)),
                Err(e) => warn!("Failed to parse AS prefix '{}' (AS{}): {}", entry.network, entry.asn, e),
            }
        }
        // Most specific first so the first hit is the longest match
        table.sort_by(|a, b| b.0.prefix().cmp(&a.0.prefix()));
        PrefixAsnLookup { prefixes: table }
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

impl AsnLookup for PrefixAsnLookup {
    fn lookup_asn(&self, ip: IpAddr) -> Result<Option<u32>, LookupError> {
        Ok(self
            .prefixes
            .iter()
            .find(|(net, _)| net.contains(ip))
            .map(|(_, asn)| *asn))
    }
}
