use crate::config::ServiceTablesConfig;
use ipnetwork::IpNetwork;
use log::{debug, info, warn};
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;

/// Compiled lookup tables for tiers 1 to 4. Read-only after construction.
#[derive(Debug, Default)]
pub struct ServiceTables {
    ranges: Vec<(IpNetwork, String)>,
    providers: HashMap<u32, String>,
    patterns: Vec<(Regex, String)>,
    keywords: Vec<(String, String)>,
    /// domain -> (service, exact only)
    domains: HashMap<String, (String, bool)>,
}

impl ServiceTables {
    /// Compile the configured tables. Bad CIDRs and regexes are logged and skipped.
    pub fn from_config(config: &ServiceTablesConfig) -> Self {
        let mut ranges = Vec::new();
        for service in &config.ranges {
            for network in &service.networks {
                match network.parse::<IpNetwork>() {
                    Ok(net) => {
                        ranges.push((net, service.name.clone()));
                        debug!("Added range {} for '{}'", net, service.name);
                    }
                    Err(e) => warn!("Failed to parse range '{}' for '{}': {}", network, service.name, e),
                }
            }
        }

        let providers = config
            .asn_providers
            .iter()
            .map(|p| (p.asn, p.name.clone()))
            .collect::<HashMap<_, _>>();

        let mut patterns = Vec::new();
        for rule in &config.patterns {
            for pattern in &rule.patterns {
                match Regex::new(pattern) {
                    Ok(re) => patterns.push((re, rule.name.clone())),
                    Err(e) => warn!("Failed to compile pattern '{}' for '{}': {}", pattern, rule.name, e),
                }
            }
        }

        let keywords = config
            .keywords
            .iter()
            .filter(|k| !k.keyword.trim().is_empty())
            .map(|k| (k.keyword.trim().to_lowercase(), k.name.clone()))
            .collect::<Vec<_>>();

        let mut domains = HashMap::with_capacity(config.domains.len());
        for rule in &config.domains {
            let domain = rule.domain.trim().trim_matches('.').to_lowercase();
            if domain.is_empty() {
                continue;
            }
            // First rule for a domain wins
            domains.entry(domain).or_insert_with(|| (rule.name.clone(), rule.exact));
        }

        info!(
            "Loaded {} service ranges, {} AS providers, {} patterns, {} keywords and {} domains",
            ranges.len(),
            providers.len(),
            patterns.len(),
            keywords.len(),
            domains.len()
        );

        ServiceTables {
            ranges,
            providers,
            patterns,
            keywords,
            domains,
        }
    }

    /// Tier 1: first configured range containing `ip`
    pub fn match_range(&self, ip: IpAddr) -> Option<&str> {
        self.ranges
            .iter()
            .find(|(net, _)| net.contains(ip))
            .map(|(_, name)| name.as_str())
    }

    /// Tier 2: provider name of a known autonomous system
    pub fn provider_for(&self, asn: u32) -> Option<&str> {
        self.providers.get(&asn).map(String::as_str)
    }

    /// Tier 3: first pattern matching the textual address
    pub fn match_pattern(&self, ip: IpAddr) -> Option<&str> {
        let text = ip.to_string();
        self.patterns
            .iter()
            .find(|(re, _)| re.is_match(&text))
            .map(|(_, name)| name.as_str())
    }

    /// Tier 4: the most specific domain rule covering the hostname, else the
    /// first keyword it contains. Case-insensitive.
    pub fn match_hostname(&self, hostname: &str) -> Option<&str> {
        let host = hostname.trim_end_matches('.').to_lowercase();
        self.match_domain(&host).or_else(|| {
            self.keywords
                .iter()
                .find(|(keyword, _)| host.contains(keyword.as_str()))
                .map(|(_, name)| name.as_str())
        })
    }

    fn match_domain(&self, host: &str) -> Option<&str> {
        if self.domains.is_empty() {
            return None;
        }
        let mut suffix = host;
        let mut whole = true;
        loop {
            if let Some((name, exact)) = self.domains.get(suffix) {
                if whole || !exact {
                    return Some(name.as_str());
                }
            }
            let (_, rest) = suffix.split_once('.')?;
            suffix = rest;
            whole = false;
        }
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }
}
