//! Polling loop that drives collection, the registry, classification and
//! attribution once per tick.

use crate::attribution::{SkipReason, TickAllocation, TrafficAttributor, VirtualRanges};
use crate::classifier::{geodata, DnsResolver, IdentifierStats, PrefixAsnLookup, ServiceCache, ServiceIdentifier, ServiceTables};
use crate::clock::{Clock, SystemClock};
use crate::collector::{create_data_collector, DataCollector};
use crate::config::Config;
use crate::errors::{CollectionError, CounterAnomaly, MonitorError};
use crate::model::{ArpTable, Connection, Device, InterfaceCounterSample, RawConnection, ServiceMatch};
use crate::registry::{DeviceRegistry, MergeEvent, RemovalEvent};
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;

/// A device as shown for one tick
#[derive(Debug, Clone)]
pub struct DeviceReport {
    pub device: Device,
    pub tick_in: u64,
    pub tick_out: u64,
}

/// Everything one tick produced, handed to rendering
#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
    pub devices: Vec<DeviceReport>,
    pub connections: Vec<Connection>,
    pub removed: Vec<RemovalEvent>,
    pub merged: Vec<MergeEvent>,
    pub total_in: u64,
    pub total_out: u64,
    pub anomalies: Vec<CounterAnomaly>,
    pub skipped: Option<SkipReason>,
}

impl TickReport {
    pub fn has_anomaly(&self) -> bool {
        !self.anomalies.is_empty()
    }

    /// Connection count per service name, busiest first
    pub fn services(&self) -> Vec<(String, usize)> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for service in self.connections.iter().filter_map(|c| c.service.as_ref()) {
            *counts.entry(service.service_name.as_str()).or_insert(0) += 1;
        }
        let mut services: Vec<(String, usize)> = counts.into_iter().map(|(name, n)| (name.to_string(), n)).collect();
        services.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        services
    }
}

struct Snapshot {
    arp: ArpTable,
    connections: Vec<RawConnection>,
    counters: InterfaceCounterSample,
}

/// Addresses that never leave the local network and are not classified
pub fn is_local_peer(ip: IpAddr, local_network: Option<&IpNetwork>) -> bool {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return true;
    }
    if local_network.map_or(false, |net| net.contains(ip)) {
        return true;
    }
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local() || v4.is_broadcast(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            // fc00::/7 unique local, fe80::/10 link local
            (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

pub struct Monitor {
    config: Config,
    collector: Box<dyn DataCollector>,
    registry: DeviceRegistry,
    attributor: TrafficAttributor,
    identifier: ServiceIdentifier,
    clock: Arc<dyn Clock>,
    local_network: Option<IpNetwork>,
    last_connections: Vec<Connection>,
    tick: u64,
    consecutive_failures: u32,
}

impl Monitor {
    pub fn new(
        config: Config,
        collector: Box<dyn DataCollector>,
        identifier: ServiceIdentifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let virtual_ranges = VirtualRanges::from_config(&config.virtual_ranges);
        let registry = DeviceRegistry::new(virtual_ranges, config.monitoring.prune_after_ticks);
        Monitor {
            config,
            collector,
            registry,
            attributor: TrafficAttributor::new(),
            identifier,
            clock,
            local_network: None,
            last_connections: Vec::new(),
            tick: 0,
            consecutive_failures: 0,
        }
    }

    /// Build a monitor with the platform collector, the system resolver and
    /// the persisted cache (when configured)
    pub fn from_config(config: Config) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let classification = &config.classification;

        let cache = match &classification.cache_file {
            Some(path) => ServiceCache::load_or_empty(path, classification.max_cache_entries, clock.now()),
            None => ServiceCache::new(classification.max_cache_entries),
        };

        let mut services = config.services.clone();
        geodata::merge_configured(&mut services);

        let identifier = ServiceIdentifier::with_cache(
            ServiceTables::from_config(&services),
            Arc::new(PrefixAsnLookup::from_config(&config.services.asn_prefixes)),
            Arc::new(DnsResolver::new()),
            clock.clone(),
            classification,
            cache,
        );

        let collector = create_data_collector(config.monitoring.interface.clone());
        info!("Using {} collector", collector.name());
        Monitor::new(config, collector, identifier, clock)
    }

    pub fn identifier(&self) -> &ServiceIdentifier {
        &self.identifier
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn local_network(&self) -> Option<IpNetwork> {
        self.local_network
    }

    pub fn ticks(&self) -> u64 {
        self.tick
    }

    fn recheck_network(&mut self) {
        let every = self.config.monitoring.network_recheck_ticks;
        let due = self.tick == 1 || (every > 0 && self.tick % every == 0);
        if !due {
            return;
        }
        match self.collector.detect_local_network() {
            Ok(network) => {
                if self.local_network != Some(network) {
                    match self.local_network {
                        Some(previous) => info!("Local network changed: {} -> {}", previous, network),
                        None => info!("Local network: {}", network),
                    }
                    self.local_network = Some(network);
                }
            }
            Err(e) => warn!("Local network detection failed: {}", e),
        }
    }

    fn collect(&self) -> Result<Snapshot, CollectionError> {
        let counters = self.collector.get_interface_counters()?;
        let arp = self.collector.get_arp_table()?;
        let connections = self.collector.get_connections()?;
        Ok(Snapshot {
            arp,
            connections,
            counters,
        })
    }

    /// Run one polling tick.
    ///
    /// A collection failure skips this tick's allocation and keeps the
    /// previous devices and connections. A failure streak longer than
    /// `max_consecutive_failures` is returned as an error.
    pub async fn tick(&mut self) -> Result<TickReport, MonitorError> {
        self.tick += 1;
        let now = self.clock.now();
        self.recheck_network();

        let snapshot = match self.collect() {
            Ok(snapshot) => {
                if self.consecutive_failures > 0 {
                    info!("Data collection recovered after {} failures", self.consecutive_failures);
                }
                self.consecutive_failures = 0;
                snapshot
            }
            Err(e) => {
                self.consecutive_failures += 1;
                let limit = self.config.monitoring.max_consecutive_failures;
                if limit > 0 && self.consecutive_failures > limit {
                    error!("Data collection failed {} times in a row: {}", self.consecutive_failures, e);
                    return Err(MonitorError::CollectionEscalated {
                        failures: self.consecutive_failures,
                        last: e,
                    });
                }
                let allocation = self.attributor.skip(&e, &self.registry.shares());
                return Ok(self.report(now, allocation, self.last_connections.clone(), Vec::new(), Vec::new()));
            }
        };

        let update = self
            .registry
            .update(&snapshot.arp, &snapshot.connections, self.tick, now);

        let mut connections = update.connections;
        self.classify(&mut connections).await;

        let allocation = self.attributor.observe(snapshot.counters, &self.registry.shares());
        self.registry.apply(&allocation);

        self.checkpoint().await;

        self.last_connections = connections.clone();
        Ok(self.report(now, allocation, connections, update.removed, update.merged))
    }

    /// Attach a classification to every connection with a public remote
    async fn classify(&self, connections: &mut [Connection]) {
        let mut seen: HashMap<IpAddr, ServiceMatch> = HashMap::new();
        for conn in connections.iter_mut() {
            let ip = conn.remote.ip();
            if is_local_peer(ip, self.local_network.as_ref()) {
                continue;
            }
            let service = match seen.get(&ip) {
                Some(service) => service.clone(),
                None => {
                    let service = self.identifier.classify_background(ip).await;
                    seen.insert(ip, service.clone());
                    service
                }
            };
            conn.service = Some(service);
        }
        debug!("Classified {} remote endpoints", seen.len());
    }

    async fn checkpoint(&self) {
        let every = self.config.classification.checkpoint_every_ticks;
        let Some(path) = &self.config.classification.cache_file else {
            return;
        };
        if every == 0 || self.tick % every != 0 {
            return;
        }
        match self.identifier.save_cache(path).await {
            Ok(count) => debug!("Checkpointed {} cache entries to {}", count, path.display()),
            Err(e) => warn!("Cache checkpoint failed: {}", e),
        }
    }

    fn report(
        &self,
        now: DateTime<Utc>,
        allocation: TickAllocation,
        connections: Vec<Connection>,
        removed: Vec<RemovalEvent>,
        merged: Vec<MergeEvent>,
    ) -> TickReport {
        let devices = self
            .registry
            .devices()
            .map(|device| {
                let bytes = allocation.get(&device.key);
                DeviceReport {
                    device: device.clone(),
                    tick_in: bytes.bytes_in,
                    tick_out: bytes.bytes_out,
                }
            })
            .collect();

        TickReport {
            tick: self.tick,
            timestamp: now,
            devices,
            connections,
            removed,
            merged,
            total_in: allocation.total_in,
            total_out: allocation.total_out,
            anomalies: allocation.anomalies,
            skipped: allocation.skipped,
        }
    }

    /// Poll until Ctrl-C or an escalated collection failure, handing every
    /// report to `on_report`. Stops after one tick when `once` is set.
    pub async fn run<F>(&mut self, once: bool, mut on_report: F) -> Result<(), MonitorError>
    where
        F: FnMut(&TickReport),
    {
        let mut interval = tokio::time::interval(self.config.monitoring.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Monitoring started (interval {}s)",
            self.config.monitoring.poll_interval_secs
        );

        let outcome = loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(report) => {
                            on_report(&report);
                            if once {
                                break Ok(());
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received, stopping...");
                    break Ok(());
                }
            }
        };

        match outcome {
            Ok(()) => self.shutdown().await,
            Err(e) => {
                // Not a clean exit: abandon lookups without touching the cache file
                self.identifier.shutdown();
                Err(e)
            }
        }
    }

    /// Abandon in-flight lookups, flush the cache and log a summary
    pub async fn shutdown(&mut self) -> Result<(), MonitorError> {
        self.identifier.shutdown();

        if let Some(path) = &self.config.classification.cache_file {
            let count = self.identifier.save_cache(path).await?;
            info!("Saved {} cache entries to {}", count, path.display());
        }

        let stats = self.identifier.stats().await;
        log_summary(self.tick, self.registry.len(), &stats);
        Ok(())
    }
}

fn log_summary(ticks: u64, devices: usize, stats: &IdentifierStats) {
    info!(
        "Stopped after {} ticks: {} devices, {} cached services, cache hit rate {:.1}%",
        ticks,
        devices,
        stats.cache_entries,
        stats.cache_hit_rate() * 100.0
    );
    info!(
        "Tier hits {:?} of attempts {:?}, {} DNS timeouts, {} evictions",
        stats.tier_hits, stats.tier_attempts, stats.dns_timeouts, stats.evictions
    );
}
