//! V2Ray `geosite.dat` / `geoip.dat` readers.
//!
//! Both files are protobuf-encoded lists (`GeoSiteList`, `GeoIPList`). Only
//! the handful of fields the service tables need are decoded; everything
//! else is skipped by wire type. Lists whose code is mapped in
//! [`GeoDataConfig::categories`] are merged into the service tables: domains
//! become tier-4 hostname rules and CIDRs become tier-1 ranges.

use crate::config::{DomainRule, GeoDataConfig, KeywordRule, ServiceRange, ServiceTablesConfig};
use crate::errors::GeoDataError;
use ipnetwork::IpNetwork;
use log::{debug, info, warn};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

/// How a geosite entry matches a hostname
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKind {
    /// Substring of the hostname
    Plain,
    Regex,
    /// The domain and all its subdomains
    RootDomain,
    /// Exactly this hostname
    Full,
}

impl DomainKind {
    fn from_wire(value: u64) -> Option<Self> {
        match value {
            0 => Some(DomainKind::Plain),
            1 => Some(DomainKind::Regex),
            2 => Some(DomainKind::RootDomain),
            3 => Some(DomainKind::Full),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoDomain {
    pub kind: DomainKind,
    pub value: String,
}

/// One named domain list (`GOOGLE`, `NETFLIX`, ...)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoSite {
    pub code: String,
    pub domains: Vec<GeoDomain>,
}

/// One named address list (`TELEGRAM`, `CN`, ...)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoIp {
    pub code: String,
    pub networks: Vec<IpNetwork>,
    /// The list matches everything *outside* `networks`
    pub reverse_match: bool,
}

enum WireValue<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
    Fixed,
}

/// Minimal protobuf wire-format reader over one message
struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        WireReader { buf, pos: 0 }
    }

    fn malformed(&self, detail: &'static str) -> GeoDataError {
        GeoDataError::Malformed {
            offset: self.pos,
            detail,
        }
    }

    fn varint(&mut self) -> Result<u64, GeoDataError> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = *self.buf.get(self.pos).ok_or_else(|| self.malformed("truncated varint"))?;
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(self.malformed("varint longer than ten bytes"))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], GeoDataError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| self.malformed("field runs past the end of its message"))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Next `(field number, value)`, or None at the end of the message
    fn next_field(&mut self) -> Result<Option<(u64, WireValue<'a>)>, GeoDataError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let tag = self.varint()?;
        let value = match tag & 0x7 {
            0 => WireValue::Varint(self.varint()?),
            1 => {
                self.take(8)?;
                WireValue::Fixed
            }
            2 => {
                let len = self.varint()?;
                let len = usize::try_from(len).map_err(|_| self.malformed("length does not fit in memory"))?;
                WireValue::Bytes(self.take(len)?)
            }
            5 => {
                self.take(4)?;
                WireValue::Fixed
            }
            _ => return Err(self.malformed("unsupported wire type")),
        };
        Ok(Some((tag >> 3, value)))
    }
}

fn text(bytes: &[u8]) -> Result<String, GeoDataError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| GeoDataError::Malformed {
            offset: e.valid_up_to(),
            detail: "string is not UTF-8",
        })
}

/// Decode a `GeoSiteList`
pub fn parse_geosite_list(data: &[u8]) -> Result<Vec<GeoSite>, GeoDataError> {
    let mut sites = Vec::new();
    let mut reader = WireReader::new(data);
    while let Some((field, value)) = reader.next_field()? {
        if let (1, WireValue::Bytes(entry)) = (field, value) {
            sites.push(parse_geosite(entry)?);
        }
    }
    Ok(sites)
}

fn parse_geosite(data: &[u8]) -> Result<GeoSite, GeoDataError> {
    let mut site = GeoSite::default();
    let mut reader = WireReader::new(data);
    while let Some((field, value)) = reader.next_field()? {
        match (field, value) {
            (1, WireValue::Bytes(code)) => site.code = text(code)?,
            (2, WireValue::Bytes(domain)) => {
                if let Some(domain) = parse_domain(domain)? {
                    site.domains.push(domain);
                }
            }
            _ => {}
        }
    }
    Ok(site)
}

fn parse_domain(data: &[u8]) -> Result<Option<GeoDomain>, GeoDataError> {
    // proto3 omits the zero enum value, so a missing type is Plain
    let mut kind = Some(DomainKind::Plain);
    let mut value = String::new();
    let mut reader = WireReader::new(data);
    while let Some((field, wire)) = reader.next_field()? {
        match (field, wire) {
            (1, WireValue::Varint(raw)) => kind = DomainKind::from_wire(raw),
            (2, WireValue::Bytes(bytes)) => value = text(bytes)?,
            _ => {}
        }
    }
    Ok(kind.filter(|_| !value.is_empty()).map(|kind| GeoDomain { kind, value }))
}

/// Decode a `GeoIPList`
pub fn parse_geoip_list(data: &[u8]) -> Result<Vec<GeoIp>, GeoDataError> {
    let mut lists = Vec::new();
    let mut reader = WireReader::new(data);
    while let Some((field, value)) = reader.next_field()? {
        if let (1, WireValue::Bytes(entry)) = (field, value) {
            lists.push(parse_geoip(entry)?);
        }
    }
    Ok(lists)
}

fn parse_geoip(data: &[u8]) -> Result<GeoIp, GeoDataError> {
    let mut list = GeoIp::default();
    let mut reader = WireReader::new(data);
    while let Some((field, value)) = reader.next_field()? {
        match (field, value) {
            (1, WireValue::Bytes(code)) => list.code = text(code)?,
            (2, WireValue::Bytes(cidr)) => list.networks.push(parse_cidr(cidr)?),
            (3, WireValue::Varint(flag)) => list.reverse_match = flag != 0,
            _ => {}
        }
    }
    Ok(list)
}

fn parse_cidr(data: &[u8]) -> Result<IpNetwork, GeoDataError> {
    let mut addr = None;
    let mut prefix = 0u64;
    let mut reader = WireReader::new(data);
    while let Some((field, value)) = reader.next_field()? {
        match (field, value) {
            (1, WireValue::Bytes(bytes)) => {
                addr = match bytes.len() {
                    4 => <[u8; 4]>::try_from(bytes).ok().map(|b| IpAddr::V4(Ipv4Addr::from(b))),
                    16 => <[u8; 16]>::try_from(bytes).ok().map(|b| IpAddr::V6(Ipv6Addr::from(b))),
                    _ => return Err(reader.malformed("address is neither 4 nor 16 bytes")),
                };
            }
            (2, WireValue::Varint(raw)) => prefix = raw,
            _ => {}
        }
    }
    let addr = addr.ok_or_else(|| reader.malformed("CIDR without an address"))?;
    let prefix = u8::try_from(prefix).map_err(|_| reader.malformed("prefix out of range"))?;
    IpNetwork::new(addr, prefix).map_err(|_| reader.malformed("prefix out of range"))
}

pub fn load_geosite(path: &Path) -> Result<Vec<GeoSite>, GeoDataError> {
    parse_geosite_list(&fs::read(path)?)
}

pub fn load_geoip(path: &Path) -> Result<Vec<GeoIp>, GeoDataError> {
    parse_geoip_list(&fs::read(path)?)
}

/// Append the mapped domain lists to the hostname tables. Returns the number of rules added.
pub fn merge_geosite(tables: &mut ServiceTablesConfig, geo: &GeoDataConfig, sites: &[GeoSite]) -> usize {
    let mut added = 0;
    let mut skipped_regex = 0;
    for site in sites {
        let Some(name) = geo.service_for(&site.code) else {
            continue;
        };
        for domain in &site.domains {
            let value = domain.value.trim().to_lowercase();
            match domain.kind {
                DomainKind::Plain => tables.keywords.push(KeywordRule {
                    keyword: value,
                    name: name.to_string(),
                }),
                DomainKind::RootDomain | DomainKind::Full => tables.domains.push(DomainRule {
                    domain: value,
                    name: name.to_string(),
                    exact: domain.kind == DomainKind::Full,
                }),
                DomainKind::Regex => {
                    skipped_regex += 1;
                    continue;
                }
            }
            added += 1;
        }
    }
    if skipped_regex > 0 {
        debug!("Skipped {} regex geosite entries", skipped_regex);
    }
    added
}

/// Append the mapped address lists as service ranges. Returns the number of networks added.
pub fn merge_geoip(tables: &mut ServiceTablesConfig, geo: &GeoDataConfig, lists: &[GeoIp]) -> usize {
    let mut added = 0;
    for list in lists {
        let Some(name) = geo.service_for(&list.code) else {
            continue;
        };
        if list.reverse_match {
            warn!("Ignoring reverse-match geoip list '{}'", list.code);
            continue;
        }
        added += list.networks.len();
        tables.ranges.push(ServiceRange {
            name: name.to_string(),
            networks: list.networks.iter().map(|n| n.to_string()).collect(),
        });
    }
    added
}

/// Load the configured geodata files into `tables`. Unreadable files are logged and skipped.
pub fn merge_configured(tables: &mut ServiceTablesConfig) {
    let geo = tables.geodata.clone();

    if let Some(path) = &geo.geosite_file {
        match load_geosite(path) {
            Ok(sites) => {
                let added = merge_geosite(tables, &geo, &sites);
                info!("Loaded {} hostname rules from {} ({} lists)", added, path.display(), sites.len());
            }
            Err(e) => warn!("Failed to load geosite data from {}: {}", path.display(), e),
        }
    }

    if let Some(path) = &geo.geoip_file {
        match load_geoip(path) {
            Ok(lists) => {
                let added = merge_geoip(tables, &geo, &lists);
                info!("Loaded {} networks from {} ({} lists)", added, path.display(), lists.len());
            }
            Err(e) => warn!("Failed to load geoip data from {}: {}", path.display(), e),
        }
    }
}
