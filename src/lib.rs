//! Per-device traffic attribution and remote service classification.
//!
//! A [`monitor::Monitor`] polls a [`collector::DataCollector`] once per tick,
//! keeps the [`registry::DeviceRegistry`] current, classifies remote
//! endpoints with the [`classifier::ServiceIdentifier`] and splits the
//! interface counter delta across devices with the
//! [`attribution::TrafficAttributor`].

pub mod attribution;
pub mod classifier;
pub mod clock;
pub mod collector;
pub mod config;
pub mod errors;
pub mod logging;
pub mod model;
pub mod monitor;
pub mod registry;
pub mod render;

pub use attribution::{TickAllocation, TrafficAttributor};
pub use classifier::ServiceIdentifier;
pub use config::Config;
pub use errors::{CollectionError, MonitorError};
pub use monitor::{Monitor, TickReport};
pub use registry::DeviceRegistry;
