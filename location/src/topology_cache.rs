//! Two-tier cache of one server's topology.
//!
//! Memory is authoritative while it is fresh. The on-disk document is shared
//! with other processes talking to the same server, so every access first
//! checks whether the file changed and reloads it if so. Expiration is only
//! enforced while the disk copy is usable; a memory-only cache never expires
//! and relies on change ids alone.

use crate::codec::{CacheDocumentCodec, DocumentError};
use crate::counter;
use crate::document_file::{self, WriteOutcome};
use crate::errors::LocationError;
use crate::metrics_defs::{
    CACHE_HIT, CACHE_MISS, DISK_FAILURE, FULL_INVALIDATION, NEGATIVE_CACHE_HIT, RECONCILE,
};
use crate::staleness::{ModifiedTimePoll, NeverStale, StalenessSignal};
use crate::types::{
    AccessMapping, CacheState, ServerIdentity, ServiceDefinition, TopologySnapshot,
    UNKNOWN_CHANGE_ID, cached_miss_key, fold_key,
};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

pub const CACHE_FILE_NAME: &str = "LocationServiceData.json";

/// Settings shared by every cache a provider creates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheSettings {
    /// `None` keeps all caches in memory.
    pub cache_dir: Option<PathBuf>,
    /// Overrides the time to live the server asks for.
    pub client_cache_ttl_secs: Option<u64>,
}

/// Where the cache for `identity` lives under `cache_dir`. Unknown servers
/// have no file.
pub fn cache_path(cache_dir: &Path, identity: ServerIdentity) -> Option<PathBuf> {
    identity.is_known().then(|| {
        cache_dir
            .join(identity.server_id.to_string())
            .join(identity.service_owner.to_string())
            .join(CACHE_FILE_NAME)
    })
}

#[derive(Clone, Debug, PartialEq)]
pub enum CacheLookup {
    Hit(ServiceDefinition),
    /// Recorded as missing at the current change id.
    NegativeHit,
    Miss,
}

struct CacheInner {
    state: CacheState,
    client_access_mapping: Option<AccessMapping>,
    default_access_mapping: Option<AccessMapping>,
    locally_fresh: bool,
    disk_available: bool,
}

impl CacheInner {
    fn is_expired(&self) -> bool {
        self.disk_available && self.locally_fresh && Utc::now() >= self.state.expires_at
    }

    fn clear(&mut self) {
        self.state.reset();
        self.client_access_mapping = None;
        self.default_access_mapping = None;
    }
}

pub struct TopologyCache {
    path: Option<PathBuf>,
    connection_base_url: String,
    client_cache_ttl_secs: Option<u64>,
    codec: CacheDocumentCodec,
    staleness: Arc<dyn StalenessSignal>,
    inner: RwLock<CacheInner>,
}

impl fmt::Debug for TopologyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologyCache")
            .field("path", &self.path)
            .field("connection_base_url", &self.connection_base_url)
            .finish_non_exhaustive()
    }
}

impl TopologyCache {
    pub fn new(settings: &CacheSettings, identity: ServerIdentity, connection_base_url: &str) -> Self {
        let path = settings
            .cache_dir
            .as_deref()
            .and_then(|dir| cache_path(dir, identity));

        let staleness: Arc<dyn StalenessSignal> = match &path {
            Some(path) => Arc::new(ModifiedTimePoll::new(path.clone())),
            None => Arc::new(NeverStale),
        };

        TopologyCache {
            inner: RwLock::new(CacheInner {
                state: CacheState::default(),
                client_access_mapping: None,
                default_access_mapping: None,
                locally_fresh: false,
                disk_available: path.is_some(),
            }),
            path,
            connection_base_url: connection_base_url.to_string(),
            client_cache_ttl_secs: settings.client_cache_ttl_secs,
            codec: CacheDocumentCodec,
            staleness,
        }
    }

    pub fn with_staleness_signal(mut self, signal: Arc<dyn StalenessSignal>) -> Self {
        self.staleness = signal;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Loads the disk copy if this cache has not seen it yet or it changed.
    pub fn ensure_loaded(&self) {
        {
            let inner = self.inner.read();
            if !inner.disk_available || (inner.locally_fresh && !self.staleness.is_stale()) {
                return;
            }
        }

        let mut inner = self.inner.write();
        self.load_if_needed(&mut inner);
    }

    pub fn is_disk_available(&self) -> bool {
        self.ensure_loaded();
        self.inner.read().disk_available
    }

    pub fn is_expired(&self) -> bool {
        self.ensure_loaded();
        self.inner.read().is_expired()
    }

    pub fn change_id(&self) -> i32 {
        self.ensure_loaded();
        self.inner.read().state.last_change_id
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.ensure_loaded();
        self.inner.read().state.expires_at
    }

    pub fn web_application_relative_directory(&self) -> String {
        self.inner
            .read()
            .state
            .web_application_relative_directory
            .clone()
    }

    /// Empty values are ignored.
    pub fn set_web_application_relative_directory(&self, directory: &str) {
        if !directory.is_empty() {
            self.inner.write().state.web_application_relative_directory = directory.to_string();
        }
    }

    /// The mapping the connection's base URL goes through. `None` once expired.
    pub fn client_access_mapping(&self) -> Option<AccessMapping> {
        self.ensure_loaded();
        let inner = self.inner.read();
        if inner.is_expired() {
            return None;
        }
        inner.client_access_mapping.clone()
    }

    /// The server's default mapping. `None` once expired.
    pub fn default_access_mapping(&self) -> Option<AccessMapping> {
        self.ensure_loaded();
        let inner = self.inner.read();
        if inner.is_expired() {
            return None;
        }
        inner.default_access_mapping.clone()
    }

    pub fn access_mapping(&self, moniker: &str) -> Option<AccessMapping> {
        self.ensure_loaded();
        self.inner.read().state.access_mapping(moniker).cloned()
    }

    pub fn access_mappings(&self) -> Vec<AccessMapping> {
        self.ensure_loaded();
        self.inner
            .read()
            .state
            .access_mappings
            .values()
            .cloned()
            .collect()
    }

    pub fn try_find_service_definition(&self, service_type: &str, identifier: Uuid) -> CacheLookup {
        self.ensure_loaded();
        let inner = self.inner.read();
        if inner.is_expired() {
            counter!(CACHE_MISS).increment(1);
            return CacheLookup::Miss;
        }

        if let Some(definition) = inner.state.service(service_type, identifier) {
            counter!(CACHE_HIT).increment(1);
            return CacheLookup::Hit(definition.clone());
        }

        if inner.state.is_cached_miss(service_type, identifier) {
            counter!(NEGATIVE_CACHE_HIT).increment(1);
            return CacheLookup::NegativeHit;
        }

        tracing::debug!(
            service_type,
            %identifier,
            change_id = inner.state.last_change_id,
            "Service definition not cached"
        );
        counter!(CACHE_MISS).increment(1);
        CacheLookup::Miss
    }

    /// All cached definitions, or those of one type. The cache holds either
    /// every service or none, so `None` means "ask the server".
    pub fn find_service_definitions(&self, service_type: Option<&str>) -> Option<Vec<ServiceDefinition>> {
        self.ensure_loaded();
        let inner = self.inner.read();
        if inner.is_expired() || inner.state.service_count() == 0 {
            return None;
        }

        match service_type.filter(|service_type| !service_type.is_empty()) {
            None => Some(
                inner
                    .state
                    .services_by_type
                    .values()
                    .flat_map(|services| services.values().cloned())
                    .collect(),
            ),
            Some(service_type) => inner
                .state
                .services_by_type
                .get(&fold_key(service_type))
                .map(|services| services.values().cloned().collect()),
        }
    }

    /// Records that the server had no such definition at `observed_change_id`.
    /// Dropped if the cache moved on since the observation.
    pub fn add_cached_miss(&self, service_type: &str, identifier: Uuid, observed_change_id: i32) {
        if observed_change_id < 0 {
            return;
        }

        self.ensure_loaded();
        let mut inner = self.inner.write();
        if observed_change_id == inner.state.last_change_id
            && inner
                .state
                .cached_misses
                .insert(cached_miss_key(service_type, identifier))
        {
            self.write_locked(&mut inner);
        }
    }

    /// Merges a server snapshot into the cache and persists the result. The
    /// merge is staged and only applied once the snapshot's zones resolve.
    pub fn reconcile(&self, snapshot: &TopologySnapshot, all_services_included: bool) -> Result<(), LocationError> {
        let mut inner = self.inner.write();
        counter!(RECONCILE).increment(1);

        let invalidate = !snapshot.client_cache_fresh && snapshot.last_change_id != inner.state.last_change_id;
        if !invalidate {
            self.load_if_needed(&mut inner);
        }

        let mut state = inner.state.clone();
        if invalidate {
            state.reset();
        } else if snapshot.last_change_id != state.last_change_id {
            // Misses only hold for the change id they were observed at.
            state.cached_misses.clear();
        }

        // A partial update must never validate a cache that was invalid before it.
        if state.last_change_id != UNKNOWN_CHANGE_ID || all_services_included {
            state.last_change_id = snapshot.last_change_id;
        }

        let ttl = self
            .client_cache_ttl_secs
            .map(|secs| i64::try_from(secs).unwrap_or(i64::MAX))
            .unwrap_or(snapshot.client_cache_time_to_live);
        state.expires_at = expiry_after(ttl);

        if let Some(directory) = snapshot.web_application_relative_directory.as_deref()
            && !directory.is_empty()
        {
            state.web_application_relative_directory = directory.to_string();
        }

        let zones = if snapshot.access_mappings.is_empty() {
            None
        } else {
            let relative_directory = state.web_application_relative_directory.clone();
            for mapping in &snapshot.access_mappings {
                state.upsert_access_mapping(trim_legacy_access_point(mapping.clone(), &relative_directory));
            }
            state.default_access_mapping_moniker = snapshot.default_access_mapping_moniker.clone();
            Some(determine_zones(&state, &self.connection_base_url)?)
        };

        if let Some(definitions) = &snapshot.service_definitions {
            for definition in definitions {
                state.insert_service(definition.clone());
            }
        }

        if invalidate {
            tracing::debug!(
                server_url = %self.connection_base_url,
                cached_change_id = inner.state.last_change_id,
                change_id = snapshot.last_change_id,
                "Discarding topology cache"
            );
            counter!(FULL_INVALIDATION).increment(1);
            inner.clear();
        }
        inner.state = state;
        if let Some((client, default)) = zones {
            inner.client_access_mapping = Some(client);
            inner.default_access_mapping = Some(default);
        }

        tracing::debug!(
            server_url = %self.connection_base_url,
            change_id = inner.state.last_change_id,
            services = inner.state.service_count(),
            "Reconciled topology cache"
        );

        self.write_locked(&mut inner);
        Ok(())
    }

    fn load_if_needed(&self, inner: &mut CacheInner) {
        if self.staleness.is_stale() {
            inner.locally_fresh = false;
        }
        if inner.locally_fresh || !inner.disk_available {
            return;
        }
        let Some(path) = &self.path else {
            return;
        };

        let loaded = document_file::read_shared::<_, DocumentError, _>(path, |reader| {
            self.codec.decode(reader)
        });

        match loaded {
            Ok(Some(state)) if state.access_mappings.is_empty() => {
                self.disable_disk(inner, &"cache document has no access mappings");
            }
            Ok(Some(mut state)) => {
                if state.web_application_relative_directory.is_empty() {
                    state.web_application_relative_directory =
                        inner.state.web_application_relative_directory.clone();
                }
                match determine_zones(&state, &self.connection_base_url) {
                    Ok((client, default)) => {
                        tracing::debug!(
                            path = %path.display(),
                            change_id = state.last_change_id,
                            "Loaded topology cache from disk"
                        );
                        inner.state = state;
                        inner.client_access_mapping = Some(client);
                        inner.default_access_mapping = Some(default);
                    }
                    Err(e) => self.disable_disk(inner, &e),
                }
            }
            Ok(None) => {}
            Err(e) => self.disable_disk(inner, &e),
        }

        inner.locally_fresh = true;
        self.staleness.observe();
    }

    fn disable_disk(&self, inner: &mut CacheInner, reason: &dyn fmt::Display) {
        tracing::warn!(
            server_url = %self.connection_base_url,
            error = %reason,
            "Topology cache on disk is unusable, continuing in memory"
        );
        counter!(DISK_FAILURE).increment(1);
        inner.disk_available = false;
        inner.clear();
    }

    fn write_locked(&self, inner: &mut CacheInner) {
        if !inner.disk_available {
            return;
        }
        let Some(path) = &self.path else {
            return;
        };
        if inner.state.access_mappings.is_empty() {
            tracing::debug!(path = %path.display(), "No access mappings, skipping cache write");
            return;
        }

        let state = &inner.state;
        let written = document_file::update_exclusive::<DocumentError, _>(path, |_| {
            self.codec.encode_to_vec(state)
        });

        match written {
            Ok(WriteOutcome::Written) => {
                inner.locally_fresh = true;
                self.staleness.observe();
            }
            Ok(WriteOutcome::Contended) => {
                tracing::debug!(path = %path.display(), "Topology cache busy, skipping write");
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to write topology cache, continuing in memory"
                );
                counter!(DISK_FAILURE).increment(1);
                inner.disk_available = false;
            }
        }
    }
}

fn expiry_after(ttl_secs: i64) -> DateTime<Utc> {
    TimeDelta::try_seconds(ttl_secs)
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

fn strip_suffix_ignore_case<'a>(value: &'a str, suffix: &str) -> Option<&'a str> {
    let split = value.len().checked_sub(suffix.len())?;
    let tail = value.get(split..)?;
    tail.eq_ignore_ascii_case(suffix).then(|| &value[..split])
}

/// Servers that predate virtual directories report the web application
/// directory as part of the access point.
fn trim_legacy_access_point(mut mapping: AccessMapping, relative_directory: &str) -> AccessMapping {
    if mapping.virtual_directory.is_none() && !relative_directory.is_empty() {
        let access_point = mapping.access_point.trim_end_matches('/');
        if let Some(trimmed) =
            strip_suffix_ignore_case(access_point, relative_directory.trim_end_matches('/'))
        {
            mapping.access_point = trimmed.to_string();
        }
    }
    mapping
}

/// Picks the access mapping the base URL goes through (the longest matching
/// access point) and the server's default. A base URL under no registered
/// mapping gets a synthesized one.
fn determine_zones(
    state: &CacheState,
    connection_base_url: &str,
) -> Result<(AccessMapping, AccessMapping), LocationError> {
    let relative_directory = state.web_application_relative_directory.trim_end_matches('/');

    let client = state
        .access_mappings
        .values()
        .filter(|mapping| {
            starts_with_ignore_case(connection_base_url, mapping.access_point.trim_end_matches('/'))
                && mapping
                    .virtual_directory
                    .as_deref()
                    .is_none_or(|directory| directory.eq_ignore_ascii_case(relative_directory))
        })
        .max_by_key(|mapping| mapping.access_point.trim_end_matches('/').len())
        .cloned();

    let default = state
        .access_mapping(&state.default_access_mapping_moniker)
        .cloned()
        .ok_or_else(|| {
            LocationError::MissingDefaultAccessMapping(state.default_access_mapping_moniker.clone())
        })?;

    let client = client.unwrap_or_else(|| {
        let mut access_point = connection_base_url.trim_end_matches('/');
        let mut virtual_directory = "";
        if !state.web_application_relative_directory.is_empty()
            && let Some(trimmed) = strip_suffix_ignore_case(access_point, relative_directory)
        {
            access_point = trimmed;
            virtual_directory = relative_directory;
        }

        AccessMapping {
            moniker: access_point.to_string(),
            display_name: access_point.to_string(),
            access_point: access_point.to_string(),
            virtual_directory: Some(virtual_directory.to_string()),
        }
    });

    Ok((client, default))
}
