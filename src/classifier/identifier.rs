//! Four-tier remote service classification.
//!
//! Tiers run strictly in order and stop at the first hit:
//! 1. curated network ranges
//! 2. autonomous system -> provider
//! 3. address patterns
//! 4. reverse DNS + hostname domain and keyword rules
//!
//! Tiers 1 to 3 are local table lookups and run inline. Tier 4 can be run
//! in the background so a tick never waits on DNS; its result lands in the
//! shared cache and is picked up by a later tick.

use super::asn::AsnLookup;
use super::cache::ServiceCache;
use super::dns_resolver::ReverseResolver;
use super::tables::ServiceTables;
use crate::clock::Clock;
use crate::config::ClassificationConfig;
use crate::errors::{CacheError, ClassificationTimeout};
use crate::model::{ServiceMatch, Tier};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Snapshot of classifier counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierStats {
    /// Indexed by tier number minus one
    pub tier_attempts: [u64; 4],
    pub tier_hits: [u64; 4],
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub dns_timeouts: u64,
    pub cache_entries: usize,
    pub pending_lookups: usize,
}

impl IdentifierStats {
    pub fn attempts(&self, tier: Tier) -> u64 {
        self.tier_attempts[tier.index()]
    }

    pub fn hits(&self, tier: Tier) -> u64 {
        self.tier_hits[tier.index()]
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    tier_attempts: [AtomicU64; 4],
    tier_hits: [AtomicU64; 4],
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    dns_timeouts: AtomicU64,
}

impl Counters {
    fn attempt(&self, tier: Tier) {
        self.tier_attempts[tier.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn hit(&self, tier: Tier) {
        self.tier_hits[tier.index()].fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared with background tier-4 tasks
struct Shared {
    tables: ServiceTables,
    resolver: Arc<dyn ReverseResolver>,
    clock: Arc<dyn Clock>,
    cache: RwLock<ServiceCache>,
    counters: Counters,
    ttl: chrono::Duration,
    unknown_ttl: chrono::Duration,
    dns_timeout: Duration,
}

impl Shared {
    fn ttl_for(&self, service: &ServiceMatch) -> chrono::Duration {
        if service.is_unknown() {
            self.unknown_ttl
        } else {
            self.ttl
        }
    }

    async fn store(&self, service: &ServiceMatch) {
        let ttl = self.ttl_for(service);
        let mut cache = self.cache.write().await;
        cache.insert(service.clone(), ttl);
    }

    /// Tier 4: bounded reverse lookup then keyword match
    async fn reverse_dns(&self, ip: IpAddr) -> ServiceMatch {
        self.counters.attempt(Tier::ReverseDns);
        let outcome = tokio::time::timeout(self.dns_timeout, self.resolver.reverse_lookup(ip)).await;
        let now = self.clock.now();

        match outcome {
            Err(_) => {
                self.counters.dns_timeouts.fetch_add(1, Ordering::Relaxed);
                let timeout = ClassificationTimeout {
                    ip,
                    timeout: self.dns_timeout,
                };
                debug!("{}", timeout);
                ServiceMatch::unknown(ip, None, now)
            }
            Ok(Err(e)) => {
                debug!("Reverse lookup error for {}: {}", ip, e);
                ServiceMatch::unknown(ip, None, now)
            }
            Ok(Ok(None)) => ServiceMatch::unknown(ip, None, now),
            Ok(Ok(Some(hostname))) => match self.tables.match_hostname(&hostname) {
                Some(name) => {
                    self.counters.hit(Tier::ReverseDns);
                    ServiceMatch::matched(ip, name, Tier::ReverseDns, now).with_hostname(hostname)
                }
                None => {
                    debug!("No rule matched hostname {} ({})", hostname, ip);
                    ServiceMatch::unknown(ip, Some(hostname), now)
                }
            },
        }
    }

    async fn resolve_and_store(&self, ip: IpAddr) -> ServiceMatch {
        let service = self.reverse_dns(ip).await;
        self.store(&service).await;
        crate::log_classification!(service);
        service
    }
}

pub struct ServiceIdentifier {
    shared: Arc<Shared>,
    asn: Arc<dyn AsnLookup>,
    pending: Mutex<HashMap<IpAddr, JoinHandle<()>>>,
}

impl ServiceIdentifier {
    pub fn new(
        tables: ServiceTables,
        asn: Arc<dyn AsnLookup>,
        resolver: Arc<dyn ReverseResolver>,
        clock: Arc<dyn Clock>,
        config: &ClassificationConfig,
    ) -> Self {
        let cache = ServiceCache::new(config.max_cache_entries);
        Self::with_cache(tables, asn, resolver, clock, config, cache)
    }

    /// Start from a pre-warmed cache (e.g. one loaded from disk)
    pub fn with_cache(
        tables: ServiceTables,
        asn: Arc<dyn AsnLookup>,
        resolver: Arc<dyn ReverseResolver>,
        clock: Arc<dyn Clock>,
        config: &ClassificationConfig,
        cache: ServiceCache,
    ) -> Self {
        ServiceIdentifier {
            shared: Arc::new(Shared {
                tables,
                resolver,
                clock,
                cache: RwLock::new(cache),
                counters: Counters::default(),
                ttl: config.cache_ttl(),
                unknown_ttl: config.unknown_ttl(),
                dns_timeout: config.dns_timeout(),
            }),
            asn,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Tiers 1 to 3, in order, stopping at the first hit
    fn classify_local(&self, ip: IpAddr) -> Option<ServiceMatch> {
        let shared = &self.shared;
        let counters = &shared.counters;

        counters.attempt(Tier::Range);
        if let Some(name) = shared.tables.match_range(ip) {
            counters.hit(Tier::Range);
            return Some(ServiceMatch::matched(ip, name, Tier::Range, shared.clock.now()));
        }

        counters.attempt(Tier::Asn);
        match self.asn.lookup_asn(ip) {
            Ok(Some(asn)) => {
                if let Some(name) = shared.tables.provider_for(asn) {
                    counters.hit(Tier::Asn);
                    return Some(ServiceMatch::matched(ip, name, Tier::Asn, shared.clock.now()));
                }
                debug!("AS{} for {} has no known provider", asn, ip);
            }
            Ok(None) => {}
            Err(e) => debug!("ASN lookup failed for {}: {}", ip, e),
        }

        counters.attempt(Tier::Pattern);
        if let Some(name) = shared.tables.match_pattern(ip) {
            counters.hit(Tier::Pattern);
            return Some(ServiceMatch::matched(ip, name, Tier::Pattern, shared.clock.now()));
        }

        None
    }

    async fn fresh(&self, ip: IpAddr) -> Option<ServiceMatch> {
        let now = self.shared.clock.now();
        let cache = self.shared.cache.read().await;
        let found = cache.get_fresh(ip, now).cloned();
        let counters = &self.shared.counters;
        if found.is_some() {
            counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Run the full pipeline, waiting for tier 4 if it is reached
    pub async fn classify(&self, ip: IpAddr) -> ServiceMatch {
        if let Some(cached) = self.fresh(ip).await {
            return cached;
        }
        if let Some(service) = self.classify_local(ip) {
            self.shared.store(&service).await;
            crate::log_classification!(service);
            return service;
        }
        self.shared.resolve_and_store(ip).await
    }

    /// Like [`ServiceIdentifier::classify`], but tier 4 is dispatched to a
    /// background task. Until it completes, the previous (possibly stale)
    /// classification is returned, or "unresolved" when there is none.
    pub async fn classify_background(&self, ip: IpAddr) -> ServiceMatch {
        if let Some(cached) = self.fresh(ip).await {
            return cached;
        }
        if let Some(service) = self.classify_local(ip) {
            self.shared.store(&service).await;
            crate::log_classification!(service);
            return service;
        }

        self.dispatch(ip);

        let previous = self.shared.cache.read().await.get(ip).cloned();
        previous.unwrap_or_else(|| ServiceMatch::unresolved(ip, self.shared.clock.now()))
    }

    /// Spawn a tier-4 lookup for `ip` unless one is already in flight
    fn dispatch(&self, ip: IpAddr) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|_, handle| !handle.is_finished());
        if pending.contains_key(&ip) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            shared.resolve_and_store(ip).await;
        });
        pending.insert(ip, handle);
    }

    /// Wait for every in-flight tier-4 lookup to finish
    pub async fn settle(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background lookup task failed: {}", e);
            }
        }
    }

    /// Abandon in-flight tier-4 lookups. Their IPs stay uncached (or keep
    /// their stale entry) and are retried on the next run.
    pub fn shutdown(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut aborted = 0;
        for (_, handle) in pending.drain() {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            info!("Abandoned {} in-flight reverse lookups", aborted);
        }
        aborted
    }

    pub fn pending_lookups(&self) -> usize {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.values().filter(|handle| !handle.is_finished()).count()
    }

    /// Cached entry for `ip`, fresh or not
    pub async fn cached(&self, ip: IpAddr) -> Option<ServiceMatch> {
        self.shared.cache.read().await.get(ip).cloned()
    }

    /// Persist the cache to `path`
    pub async fn save_cache(&self, path: &Path) -> Result<usize, CacheError> {
        let cache = self.shared.cache.read().await;
        cache.save(path, self.shared.clock.now())
    }

    pub async fn stats(&self) -> IdentifierStats {
        let counters = &self.shared.counters;
        let (cache_entries, evictions) = {
            let cache = self.shared.cache.read().await;
            (cache.len(), cache.evictions())
        };
        IdentifierStats {
            tier_attempts: std::array::from_fn(|i| counters.tier_attempts[i].load(Ordering::Relaxed)),
            tier_hits: std::array::from_fn(|i| counters.tier_hits[i].load(Ordering::Relaxed)),
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: counters.cache_misses.load(Ordering::Relaxed),
            evictions,
            dns_timeouts: counters.dns_timeouts.load(Ordering::Relaxed),
            cache_entries,
            pending_lookups: self.pending_lookups(),
        }
    }
}

impl Drop for ServiceIdentifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}
