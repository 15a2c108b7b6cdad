//! Client-side service location.
//!
//! Given the URL of one server, finds the URL of any service in the
//! deployment: services hosted by that server come from its (cached)
//! topology, everything else is located through delegation to the server that
//! hosts it.

pub mod client;
pub mod codec;
pub mod config;
pub mod document_file;
pub mod errors;
pub mod identity_store;
pub mod metrics_defs;
pub mod provider;
pub mod resolver;
pub mod staleness;
pub mod topology_cache;
pub mod types;

#[cfg(test)]
mod testutils;

pub use client::{ClientError, ClientSettings, HttpLocationClient, LocationClient};
pub use config::Config;
pub use errors::LocationError;
pub use identity_store::ServerIdentityStore;
pub use provider::ConnectionProvider;
pub use resolver::{HttpProviderFactory, ProviderFactory, ServiceLocationResolver};
pub use topology_cache::{CacheLookup, CacheSettings, TopologyCache};
pub use types::{AccessMapping, ConnectScope, RelativeTo, ServerIdentity, ServiceDefinition};
