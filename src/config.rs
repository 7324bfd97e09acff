use crate::errors::MonitorError;
use ipnetwork::IpNetwork;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "netlens.yaml";

/// Longest accepted cache TTL (ten years); keeps TTL arithmetic on timestamps in range
pub const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 3600;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub monitoring: MonitoringConfig,
    pub classification: ClassificationConfig,
    pub virtual_ranges: Vec<VirtualRange>,
    pub services: ServiceTablesConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Interface whose counters are sampled; None sums every non-loopback interface
    pub interface: Option<String>,
    pub poll_interval_secs: u64,
    /// Devices unseen for more than this many consecutive ticks are pruned
    pub prune_after_ticks: u64,
    /// Collection failures tolerated in a row; the next one ends the run with
    /// an error. 0 never escalates.
    pub max_consecutive_failures: u32,
    pub network_recheck_ticks: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ClassificationConfig {
    /// TTL of a confirmed (tier 1-4) match
    pub cache_ttl_secs: u64,
    /// TTL of an "unknown" result so the IP is retried sooner
    pub unknown_ttl_secs: u64,
    pub max_cache_entries: usize,
    pub dns_timeout_ms: u64,
    pub cache_file: Option<PathBuf>,
    pub checkpoint_every_ticks: u64,
}

/// Local address ranges whose traffic is aggregated under one synthetic device
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VirtualRange {
    pub tag: String,
    pub ranges: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceTablesConfig {
    pub ranges: Vec<ServiceRange>,
    pub asn_prefixes: Vec<AsnPrefix>,
    pub asn_providers: Vec<AsnProvider>,
    pub patterns: Vec<PatternRule>,
    pub keywords: Vec<KeywordRule>,
    /// Hostname suffix rules, consulted before `keywords`
    pub domains: Vec<DomainRule>,
    pub geodata: GeoDataConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceRange {
    pub name: String,
    pub networks: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AsnPrefix {
    pub network: String,
    pub asn: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AsnProvider {
    pub asn: u32,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PatternRule {
    pub name: String,
    pub patterns: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KeywordRule {
    pub keyword: String,
    pub name: String,
}

/// Matches `domain` itself and any subdomain of it, or only `domain` when `exact`
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DomainRule {
    pub domain: String,
    pub name: String,
    #[serde(default)]
    pub exact: bool,
}

/// V2Ray `geosite.dat` / `geoip.dat` files merged into the service tables at startup.
/// Only categories listed in `categories` are used.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeoDataConfig {
    pub geosite_file: Option<PathBuf>,
    pub geoip_file: Option<PathBuf>,
    pub categories: Vec<GeoCategory>,
}

/// Maps a geosite/geoip list code (case-insensitive) to a service name
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeoCategory {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_file: Option<PathBuf>,
    pub log_level: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, MonitorError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config path: explicit argument, next to the executable, then cwd
    pub fn locate(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }

        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()));

        match exe_dir {
            Some(dir) if dir.join(CONFIG_FILE_NAME).exists() => dir.join(CONFIG_FILE_NAME),
            _ => PathBuf::from(CONFIG_FILE_NAME),
        }
    }

    /// Load from `path`, falling back to defaults with a warning
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            warn!("Config not found at {}, using defaults", path.display());
            return Config::default();
        }

        match Config::load(path) {
            Ok(cfg) => {
                info!(
                    "Configuration loaded from {} ({} service ranges, {} virtual ranges)",
                    path.display(),
                    cfg.services.ranges.len(),
                    cfg.virtual_ranges.len()
                );
                cfg
            }
            Err(e) => {
                warn!("Failed to load config ({}), using defaults", e);
                Config::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.monitoring.poll_interval_secs == 0 {
            return Err(MonitorError::Config("poll_interval_secs must be at least 1".to_string()));
        }
        if self.monitoring.prune_after_ticks == 0 {
            return Err(MonitorError::Config("prune_after_ticks must be at least 1".to_string()));
        }
        if self.classification.max_cache_entries == 0 {
            return Err(MonitorError::Config("max_cache_entries must be at least 1".to_string()));
        }
        if self.classification.dns_timeout_ms == 0 {
            return Err(MonitorError::Config("dns_timeout_ms must be at least 1".to_string()));
        }
        for (field, secs) in [
            ("cache_ttl_secs", self.classification.cache_ttl_secs),
            ("unknown_ttl_secs", self.classification.unknown_ttl_secs),
        ] {
            if secs > MAX_TTL_SECS {
                return Err(MonitorError::Config(format!(
                    "{} must be at most {} ({} given)",
                    field, MAX_TTL_SECS, secs
                )));
            }
        }
        if self.classification.unknown_ttl_secs > self.classification.cache_ttl_secs {
            warn!(
                "unknown_ttl_secs ({}) exceeds cache_ttl_secs ({}); unknown IPs will be retried later than confirmed ones",
                self.classification.unknown_ttl_secs, self.classification.cache_ttl_secs
            );
        }
        for range in &self.virtual_ranges {
            if range.tag.trim().is_empty() {
                return Err(MonitorError::Config("virtual range tag must not be empty".to_string()));
            }
            for cidr in &range.ranges {
                cidr.parse::<IpNetwork>().map_err(|e| {
                    MonitorError::Config(format!("virtual range '{}' has bad CIDR '{}': {}", range.tag, cidr, e))
                })?;
            }
        }
        for category in &self.services.geodata.categories {
            if category.code.trim().is_empty() || category.name.trim().is_empty() {
                return Err(MonitorError::Config("geodata categories need a code and a name".to_string()));
            }
        }
        Ok(())
    }
}

impl MonitoringConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            interface: None,
            poll_interval_secs: 2,
            prune_after_ticks: 30,
            max_consecutive_failures: 5,
            network_recheck_ticks: 30,
        }
    }
}

impl ClassificationConfig {
    pub fn cache_ttl(&self) -> chrono::Duration {
        ttl_duration(self.cache_ttl_secs)
    }

    pub fn unknown_ttl(&self) -> chrono::Duration {
        ttl_duration(self.unknown_ttl_secs)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }
}

/// Seconds to a chrono duration, capped at [`MAX_TTL_SECS`]
pub fn ttl_duration(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_TTL_SECS) as i64)
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        ClassificationConfig {
            cache_ttl_secs: 3600,
            unknown_ttl_secs: 300,
            max_cache_entries: 4096,
            dns_timeout_ms: 2000,
            cache_file: None,
            checkpoint_every_ticks: 150,
        }
    }
}

impl GeoDataConfig {
    /// Service name configured for a list code, if any
    pub fn service_for(&self, code: &str) -> Option<&str> {
        self.categories
            .iter()
            .find(|c| c.code.eq_ignore_ascii_case(code))
            .map(|c| c.name.as_str())
    }
}

impl Default for GeoDataConfig {
    fn default() -> Self {
        let categories = [
            ("youtube", "YouTube"),
            ("google", "Google"),
            ("facebook", "Facebook"),
            ("twitter", "Twitter"),
            ("telegram", "Telegram"),
            ("amazon", "Amazon"),
            ("apple", "Apple"),
            ("microsoft", "Microsoft"),
            ("netflix", "Netflix"),
            ("spotify", "Spotify"),
            ("github", "GitHub"),
            ("cloudflare", "Cloudflare"),
            ("baidu", "Baidu"),
            ("tencent", "Tencent"),
            ("alibaba", "Alibaba"),
            ("bytedance", "ByteDance"),
            ("bilibili", "Bilibili"),
        ]
        .iter()
        .map(|(code, name)| GeoCategory {
            code: code.to_string(),
            name: name.to_string(),
        })
        .collect();

        GeoDataConfig {
            geosite_file: None,
            geoip_file: None,
            categories,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_file: None,
            log_level: "info".to_string(),
        }
    }
}

fn range(name: &str, networks: &[&str]) -> ServiceRange {
    ServiceRange {
        name: name.to_string(),
        networks: networks.iter().map(|n| n.to_string()).collect(),
    }
}

fn pattern(name: &str, patterns: &[&str]) -> PatternRule {
    PatternRule {
        name: name.to_string(),
        patterns: patterns.iter().map(|p| p.to_string()).collect(),
    }
}

impl Default for ServiceTablesConfig {
    fn default() -> Self {
        let ranges = vec![
            range("Google DNS", &["8.8.8.0/24", "8.8.4.0/24"]),
            range("Cloudflare DNS", &["1.1.1.0/24", "1.0.0.0/24"]),
            range("Google", &["173.194.0.0/16", "74.125.0.0/16", "172.217.0.0/16", "216.58.192.0/19", "142.250.0.0/15"]),
            range("Cloudflare", &["104.16.0.0/12", "172.64.0.0/13"]),
            range("Amazon CloudFront", &["13.32.0.0/15", "54.230.0.0/15", "99.84.0.0/16"]),
            range("Microsoft Teams", &["13.107.42.0/24"]),
            range("Microsoft Azure", &["40.76.0.0/14"]),
            range("Facebook", &["31.13.24.0/21", "157.240.0.0/17", "173.252.64.0/18"]),
            range("Netflix", &["23.246.0.0/18", "37.77.184.0/21", "45.57.0.0/17"]),
            range("Telegram", &["149.154.160.0/20", "91.108.4.0/22", "91.108.56.0/22"]),
            range("Apple", &["17.0.0.0/8"]),
            range("Niconico", &["210.129.120.0/21", "125.6.144.0/20", "202.248.110.0/23"]),
            range("Alibaba Cloud", &["47.88.0.0/13"]),
            range("Tencent Cloud", &["129.226.0.0/16"]),
            range("Baidu", &["220.181.0.0/16"]),
        ];

        let asn_prefixes = vec![
            AsnPrefix { network: "8.8.0.0/16".to_string(), asn: 15169 },
            AsnPrefix { network: "1.1.0.0/16".to_string(), asn: 13335 },
            AsnPrefix { network: "210.129.0.0/16".to_string(), asn: 2914 },
            AsnPrefix { network: "210.155.0.0/16".to_string(), asn: 2914 },
            AsnPrefix { network: "47.88.0.0/13".to_string(), asn: 37963 },
            AsnPrefix { network: "162.158.0.0/15".to_string(), asn: 13335 },
            AsnPrefix { network: "31.13.64.0/18".to_string(), asn: 32934 },
        ];

        let providers: &[(u32, &str)] = &[
            (2914, "NTT Communications"),
            (17673, "DWANGO/Niconico"),
            (15169, "Google"),
            (36040, "YouTube"),
            (32934, "Facebook"),
            (8075, "Microsoft"),
            (8068, "Microsoft"),
            (16509, "Amazon AWS"),
            (14618, "Amazon"),
            (13335, "Cloudflare"),
            (13414, "Twitter"),
            (714, "Apple"),
            (2906, "Netflix"),
            (40027, "Netflix"),
            (62041, "Telegram"),
            (37963, "Alibaba Cloud"),
            (45090, "Tencent Cloud"),
            (38365, "Baidu"),
            (2516, "KDDI"),
            (2497, "Internet Initiative Japan"),
        ];
        let asn_providers = providers
            .iter()
            .map(|(asn, name)| AsnProvider { asn: *asn, name: name.to_string() })
            .collect();

        let patterns = vec![
            pattern("YouTube", &[r"^172\.217\.", r"^216\.58\.", r"^64\.233\.", r"^108\.177\."]),
            pattern("Google", &[r"^8\.(8|34|35)\.", r"^74\.125\.", r"^142\.250\.", r"^173\.194\."]),
            pattern("Amazon AWS", &[r"^54\.(46|174|194|230|254|255)\.", r"^52\.", r"^3\.", r"^18\."]),
            pattern("Alibaba Cloud", &[r"^118\.178\.", r"^139\.196\.", r"^8\.131\.", r"^101\.36\."]),
            pattern("Tencent Cloud", &[r"^183\.(192|84)\.", r"^221\.181\.", r"^120\.(204|232)\.", r"^129\.211\.", r"^1\.12\."]),
            pattern("Apple", &[r"^17\.(57|142|172|188|248|249|250|251|252|253|254|255)\."]),
            pattern("Microsoft", &[r"^20\.", r"^40\.", r"^104\.(40|42|44|46|47|208|209|210|211|214|215)\."]),
        ];

        let keyword_pairs: &[(&str, &str)] = &[
            ("googlevideo", "YouTube"),
            ("youtube", "YouTube"),
            ("ytimg", "YouTube"),
            ("1e100", "Google"),
            ("googleusercontent", "Google"),
            ("google", "Google"),
            ("cloudfront", "Amazon CloudFront"),
            ("amazonaws", "Amazon AWS"),
            ("amazon", "Amazon"),
            ("fbcdn", "Facebook"),
            ("facebook", "Facebook"),
            ("cloudflare", "Cloudflare"),
            ("icloud", "Apple"),
            ("apple", "Apple"),
            ("azure", "Microsoft Azure"),
            ("microsoft", "Microsoft"),
            ("akamai", "Akamai"),
            ("aliyun", "Alibaba Cloud"),
            ("alibaba", "Alibaba Cloud"),
            ("tencent", "Tencent Cloud"),
            ("nicovideo", "Niconico"),
            ("dwango", "DWANGO"),
            ("digitalocean", "DigitalOcean"),
            ("linode", "Linode"),
            ("ovh", "OVH"),
        ];
        let keywords = keyword_pairs
            .iter()
            .map(|(keyword, name)| KeywordRule {
                keyword: keyword.to_string(),
                name: name.to_string(),
            })
            .collect();

        ServiceTablesConfig {
            ranges,
            asn_prefixes,
            asn_providers,
            patterns,
            keywords,
            domains: Vec::new(),
            geodata: GeoDataConfig::default(),
        }
    }
}
