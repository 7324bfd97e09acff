//! Reverse DNS (PTR) lookups for tier 4.
//!
//! Caching and timeouts live in the identifier; a resolver only answers
//! one question per call.

use crate::errors::LookupError;
use async_trait::async_trait;
use log::debug;
use std::net::IpAddr;
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

#[async_trait]
pub trait ReverseResolver: Send + Sync {
    /// First PTR name for `ip` without the trailing dot, `Ok(None)` when there is none
    async fn reverse_lookup(&self, ip: IpAddr) -> Result<Option<String>, LookupError>;
}

/// System resolver backed by trust-dns
#[derive(Clone)]
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
}

impl DnsResolver {
    pub fn new() -> Self {
        // Create a DNS resolver with system config
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            debug!("System resolver config unavailable ({}), using Google DNS", e);
            use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
            TokioAsyncResolver::tokio(ResolverConfig::google(), ResolverOpts::default())
        });
        DnsResolver { resolver }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReverseResolver for DnsResolver {
    async fn reverse_lookup(&self, ip: IpAddr) -> Result<Option<String>, LookupError> {
        match self.resolver.reverse_lookup(ip).await {
            Ok(lookup) => {
                let names: Vec<_> = lookup.into_iter().collect();
                Ok(names.first().map(|name| {
                    let domain = name.to_string().trim_end_matches('.').to_string();
                    debug!("DNS resolved {} -> {}", ip, domain);
                    domain
                }))
            }
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => {
                    debug!("No PTR record for {}", ip);
                    Ok(None)
                }
                _ => Err(LookupError(format!("reverse lookup failed for {}: {}", ip, e))),
            },
        }
    }
}
