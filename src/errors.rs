use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Failure of the platform data source (ARP table, connection list, counters)
#[derive(Error, Debug)]
pub enum CollectionError {
    #[error("command `{command}` is unavailable: {source}")]
    CommandUnavailable {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command `{command}` exited with status {status}")]
    CommandFailed { command: String, status: String },

    #[error("unparseable {what}: {detail}")]
    Unparseable { what: &'static str, detail: String },

    #[error("interface `{0}` not found in counter table")]
    InterfaceNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("data collection is not supported on {0}")]
    Unsupported(String),
}

impl CollectionError {
    pub fn unparseable(what: &'static str, detail: impl Into<String>) -> Self {
        CollectionError::Unparseable {
            what,
            detail: detail.into(),
        }
    }
}

/// Persisted service cache could not be read or written
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache file is corrupt: {0}")]
    Corruption(#[from] serde_json::Error),

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A V2Ray geosite/geoip file could not be read or decoded
#[derive(Error, Debug)]
pub enum GeoDataError {
    #[error("geodata I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed geodata at byte {offset}: {detail}")]
    Malformed { offset: usize, detail: &'static str },
}

/// Reverse lookup did not finish within the configured bound
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("reverse lookup for {ip} timed out after {timeout:?}")]
pub struct ClassificationTimeout {
    pub ip: IpAddr,
    pub timeout: Duration,
}

/// Error reported by an external lookup collaborator (ASN or reverse DNS)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct LookupError(pub String);

/// Which cumulative counter went backwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterDirection {
    In,
    Out,
}

impl std::fmt::Display for CounterDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterDirection::In => write!(f, "bytes_in"),
            CounterDirection::Out => write!(f, "bytes_out"),
        }
    }
}

/// A cumulative interface counter decreased between two samples (reset/restart)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("counter {direction} went backwards: {previous} -> {current}")]
pub struct CounterAnomaly {
    pub direction: CounterDirection,
    pub previous: u64,
    pub current: u64,
}

/// Top-level error for the monitor and its binary
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Collection Error: {0}")]
    Collection(#[from] CollectionError),

    #[error("data collection failed {failures} times in a row (last: {last}); restart required")]
    CollectionEscalated {
        failures: u32,
        last: CollectionError,
    },

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("YAML Error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Cache Error: {0}")]
    Cache(#[from] CacheError),

    #[error("Logging Error: {0}")]
    Logging(String),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),
}
