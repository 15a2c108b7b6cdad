use crate::client::ClientSettings;
use crate::topology_cache::CacheSettings;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Per-user default: `<user cache dir>/location-cache`.
pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("location-cache"))
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    /// The server this client is connected to.
    pub server_url: Url,
    pub cache_dir: Option<PathBuf>,
    /// Overrides the cache lifetime servers ask for.
    pub client_cache_ttl_secs: Option<u64>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Config {
    pub fn new(server_url: Url) -> Self {
        Config {
            server_url,
            cache_dir: None,
            client_cache_ttl_secs: None,
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            cache_dir: self.cache_dir.clone().or_else(default_cache_dir),
            client_cache_ttl_secs: self.client_cache_ttl_secs,
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}
