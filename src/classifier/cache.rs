//! Bounded IP -> ServiceMatch cache.
//!
//! Every entry carries its own TTL (confirmed matches and "unknown" results
//! expire at different rates). When the cache is full the entry with the
//! oldest `resolved_at` goes first; ties are broken by insertion order.

use crate::config::ttl_duration;
use crate::errors::CacheError;
use crate::model::ServiceMatch;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;

const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone)]
struct Slot {
    service: ServiceMatch,
    ttl: Duration,
    seq: u64,
}

impl Slot {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now - self.service.resolved_at < self.ttl
    }

    fn order_key(&self) -> (DateTime<Utc>, u64, IpAddr) {
        (self.service.resolved_at, self.seq, self.service.ip)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    service: ServiceMatch,
    ttl_secs: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCache {
    version: u32,
    entries: Vec<PersistedEntry>,
}

#[derive(Debug)]
pub struct ServiceCache {
    slots: HashMap<IpAddr, Slot>,
    order: BTreeSet<(DateTime<Utc>, u64, IpAddr)>,
    next_seq: u64,
    max_entries: usize,
    evictions: u64,
}

impl ServiceCache {
    pub fn new(max_entries: usize) -> Self {
        ServiceCache {
            slots: HashMap::new(),
            order: BTreeSet::new(),
            next_seq: 0,
            max_entries: max_entries.max(1),
            evictions: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total entries evicted for capacity since creation
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Entry for `ip` only if it is still within its TTL
    pub fn get_fresh(&self, ip: IpAddr, now: DateTime<Utc>) -> Option<&ServiceMatch> {
        self.slots
            .get(&ip)
            .filter(|slot| slot.is_fresh(now))
            .map(|slot| &slot.service)
    }

    /// Entry for `ip` regardless of age
    pub fn get(&self, ip: IpAddr) -> Option<&ServiceMatch> {
        self.slots.get(&ip).map(|slot| &slot.service)
    }

    /// Store `service` for `ttl`, replacing any previous entry for its IP.
    /// Returns the IPs evicted to stay within `max_entries`. The
    /// "unresolved" placeholder is never stored.
    pub fn insert(&mut self, service: ServiceMatch, ttl: Duration) -> Vec<IpAddr> {
        if service.is_unresolved() {
            debug!("Not caching unresolved placeholder for {}", service.ip);
            return Vec::new();
        }

        self.remove(service.ip);

        let slot = Slot {
            service,
            ttl,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.order.insert(slot.order_key());
        self.slots.insert(slot.service.ip, slot);

        let mut evicted = Vec::new();
        while self.slots.len() > self.max_entries {
            let Some((_, _, ip)) = self.order.pop_first() else {
                break;
            };
            if self.slots.remove(&ip).is_some() {
                debug!("Evicted {} from service cache", ip);
                self.evictions += 1;
                evicted.push(ip);
            }
        }
        evicted
    }

    pub fn remove(&mut self, ip: IpAddr) -> Option<ServiceMatch> {
        let slot = self.slots.remove(&ip)?;
        self.order.remove(&slot.order_key());
        Some(slot.service)
    }

    /// Drop every entry whose TTL has elapsed
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<IpAddr> = self
            .slots
            .values()
            .filter(|slot| !slot.is_fresh(now))
            .map(|slot| slot.service.ip)
            .collect();
        for ip in &expired {
            self.remove(*ip);
        }
        expired.len()
    }

    /// Read a persisted cache. Entries already expired at `now` are dropped.
    pub fn load(path: &Path, max_entries: usize, now: DateTime<Utc>) -> Result<Self, CacheError> {
        let content = fs::read_to_string(path)?;
        let persisted: PersistedCache = serde_json::from_str(&content)?;
        if persisted.version != CACHE_FORMAT_VERSION {
            warn!(
                "Cache file {} has format version {}, expected {}; ignoring it",
                path.display(),
                persisted.version,
                CACHE_FORMAT_VERSION
            );
            return Ok(ServiceCache::new(max_entries));
        }

        let mut cache = ServiceCache::new(max_entries);
        let mut stale = 0usize;
        let mut entries = persisted.entries;
        // Oldest first so capacity eviction on load drops the oldest entries
        entries.sort_by_key(|e| e.service.resolved_at);
        for entry in entries {
            let ttl = ttl_duration(entry.ttl_secs.max(0) as u64);
            if now - entry.service.resolved_at >= ttl {
                stale += 1;
                continue;
            }
            cache.insert(entry.service, ttl);
        }
        // Load-time trimming is not a runtime eviction
        cache.evictions = 0;
        info!(
            "Loaded {} cached classifications from {} ({} expired)",
            cache.len(),
            path.display(),
            stale
        );
        Ok(cache)
    }

    /// Like [`ServiceCache::load`], but a missing or corrupt file yields an empty cache
    pub fn load_or_empty(path: &Path, max_entries: usize, now: DateTime<Utc>) -> Self {
        if !path.exists() {
            info!("No service cache at {}, starting empty", path.display());
            return ServiceCache::new(max_entries);
        }
        match ServiceCache::load(path, max_entries, now) {
            Ok(cache) => cache,
            Err(e) => {
                warn!("Discarding service cache {}: {}", path.display(), e);
                ServiceCache::new(max_entries)
            }
        }
    }

    /// Write all fresh entries to `path` through a temp file and rename.
    /// Returns the number of entries written.
    pub fn save(&self, path: &Path, now: DateTime<Utc>) -> Result<usize, CacheError> {
        let entries: Vec<PersistedEntry> = self
            .order
            .iter()
            .filter_map(|(_, _, ip)| self.slots.get(ip))
            .filter(|slot| slot.is_fresh(now))
            .map(|slot| PersistedEntry {
                service: slot.service.clone(),
                ttl_secs: slot.ttl.num_seconds(),
            })
            .collect();
        let count = entries.len();
        let document = PersistedCache {
            version: CACHE_FORMAT_VERSION,
            entries,
        };
        let json = serde_json::to_string_pretty(&document)?;

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = Path::new(&tmp_name);
        {
            let mut file = fs::File::create(tmp_path)?;
            restrict_permissions(&file)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(tmp_path, path)?;
        debug!("Saved {} cached classifications to {}", count, path.display());
        Ok(count)
    }
}

#[cfg(unix)]
fn restrict_permissions(file: &fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &fs::File) -> std::io::Result<()> {
    Ok(())
}
