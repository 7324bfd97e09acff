//! Remote endpoint classification: service tables, ASN lookup, reverse DNS,
//! the bounded service cache and the [`ServiceIdentifier`] that ties them
//! together.

pub mod asn;
pub mod cache;
pub mod dns_resolver;
pub mod geodata;
pub mod identifier;
pub mod tables;

pub use asn::{AsnLookup, PrefixAsnLookup};
pub use cache::ServiceCache;
pub use dns_resolver::{DnsResolver, ReverseResolver};
pub use identifier::{IdentifierStats, ServiceIdentifier};
pub use tables::ServiceTables;
