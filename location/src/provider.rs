//! One live connection to one server.
//!
//! A provider owns the connect handshake and a [`TopologyCache`] for the server
//! it talks to, and turns service definitions into URLs. Connects are
//! single-flight: concurrent callers either wait for the connect in progress
//! or find that it already gave them what they need.

use crate::client::{ClientError, LocationClient};
use crate::errors::LocationError;
use crate::identity_store::ServerIdentityStore;
use crate::metrics_defs::{CONNECT, CONNECT_DURATION, CONNECT_TIMEOUT_RETRY};
use crate::topology_cache::{CacheLookup, CacheSettings, TopologyCache};
use crate::types::{
    APPLICATION_IDENTIFIER, AccessMapping, ConnectScope, ConnectionData, Identity,
    LOCATION_SERVICE, ON_PREMISES_INSTANCE_TYPE, ROOT_IDENTIFIER, RelativeTo,
    SELF_REFERENCE_IDENTIFIER, ServerIdentity, ServiceDefinition, UNKNOWN_CHANGE_ID,
};
use crate::{counter, histogram};
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

#[derive(Default)]
struct ConnectionState {
    connected: bool,
    /// Everything the connects since the last reset have fetched.
    valid_scope: ConnectScope,
    instance_id: Uuid,
    service_owner: Uuid,
    authenticated_user: Option<Identity>,
    authorized_user: Option<Identity>,
}

pub struct ConnectionProvider {
    base_url: Url,
    client: Arc<dyn LocationClient>,
    identity_store: Arc<ServerIdentityStore>,
    cache_settings: CacheSettings,
    cache: ArcSwap<TopologyCache>,
    connection: RwLock<ConnectionState>,
    connect_lock: tokio::sync::Mutex<()>,
    resource_locations: RwLock<Option<Vec<ServiceDefinition>>>,
}

/// Runs `future` unless `cancel` fires first.
async fn cancellable<T, F>(cancel: &CancellationToken, future: F) -> Result<T, LocationError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LocationError::Cancelled),
        result = future => result.map_err(LocationError::from),
    }
}

/// Joins two URL pieces with exactly one slash.
fn combine_path(base: &str, relative: &str) -> String {
    if base.is_empty() {
        return relative.to_string();
    }
    if relative.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches(['/', '\\']),
        relative.trim_start_matches(['/', '\\'])
    )
}

impl ConnectionProvider {
    /// Starts from whatever the identity store remembers about `base_url`, so
    /// a known server can be served from its disk cache without connecting.
    pub fn new(
        base_url: Url,
        client: Arc<dyn LocationClient>,
        identity_store: Arc<ServerIdentityStore>,
        cache_settings: CacheSettings,
    ) -> Self {
        let identity = identity_store.read_identity(base_url.as_str());
        let cache = TopologyCache::new(&cache_settings, identity, base_url.as_str());

        ConnectionProvider {
            base_url,
            client,
            identity_store,
            cache_settings,
            cache: ArcSwap::from_pointee(cache),
            connection: RwLock::new(ConnectionState::default()),
            connect_lock: tokio::sync::Mutex::new(()),
            resource_locations: RwLock::new(None),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn cache(&self) -> Arc<TopologyCache> {
        self.cache.load_full()
    }

    pub fn has_connected(&self) -> bool {
        self.connection.read().connected
    }

    /// Forgets the connection. The topology cache is kept.
    pub fn disconnect(&self) {
        let mut state = self.connection.write();
        state.connected = false;
        state.valid_scope = ConnectScope::None;
        state.authenticated_user = None;
        state.authorized_user = None;
    }

    /// Connects unless a previous connect already covers `scope`.
    pub async fn connect(&self, scope: ConnectScope, cancel: &CancellationToken) -> Result<(), LocationError> {
        self.ensure_connected(scope, cancel).await?;
        Ok(())
    }

    pub async fn instance_id(&self, cancel: &CancellationToken) -> Result<Uuid, LocationError> {
        if !self.need_to_connect(ConnectScope::None) {
            return Ok(self.connection.read().instance_id);
        }

        let stored = self.identity_store.read_identity(self.base_url.as_str());
        if stored.is_known() {
            return Ok(stored.server_id);
        }

        self.ensure_connected(ConnectScope::None, cancel).await?;
        Ok(self.connection.read().instance_id)
    }

    pub async fn instance_type(&self, cancel: &CancellationToken) -> Result<Uuid, LocationError> {
        if !self.need_to_connect(ConnectScope::None) {
            return Ok(self.connection.read().service_owner);
        }

        let stored = self.identity_store.read_identity(self.base_url.as_str());
        if !stored.service_owner.is_nil() {
            return Ok(stored.service_owner);
        }

        self.ensure_connected(ConnectScope::None, cancel).await?;
        Ok(self.connection.read().service_owner)
    }

    pub async fn authenticated_identity(&self, cancel: &CancellationToken) -> Result<Option<Identity>, LocationError> {
        self.ensure_connected(ConnectScope::None, cancel).await?;
        Ok(self.connection.read().authenticated_user.clone())
    }

    pub async fn authorized_identity(&self, cancel: &CancellationToken) -> Result<Option<Identity>, LocationError> {
        self.ensure_connected(ConnectScope::None, cancel).await?;
        Ok(self.connection.read().authorized_user.clone())
    }

    pub async fn access_mapping(
        &self,
        moniker: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<AccessMapping>, LocationError> {
        self.ensure_connected(ConnectScope::IncludeServices, cancel).await?;
        Ok(self.cache.load().access_mapping(moniker))
    }

    pub async fn access_mappings(&self, cancel: &CancellationToken) -> Result<Vec<AccessMapping>, LocationError> {
        self.ensure_connected(ConnectScope::IncludeServices, cancel).await?;
        Ok(self.cache.load().access_mappings())
    }

    pub async fn client_access_mapping(&self, cancel: &CancellationToken) -> Result<AccessMapping, LocationError> {
        if let Some(mapping) = self.cache.load().client_access_mapping() {
            return Ok(mapping);
        }

        self.ensure_connected(ConnectScope::IncludeServices, cancel).await?;
        self.cache
            .load()
            .client_access_mapping()
            .ok_or(LocationError::MissingAccessMapping("client"))
    }

    pub async fn default_access_mapping(&self, cancel: &CancellationToken) -> Result<AccessMapping, LocationError> {
        if let Some(mapping) = self.cache.load().default_access_mapping() {
            return Ok(mapping);
        }

        self.ensure_connected(ConnectScope::IncludeServices, cancel).await?;
        self.cache
            .load()
            .default_access_mapping()
            .ok_or(LocationError::MissingAccessMapping("default"))
    }

    pub async fn find_service_definition(
        &self,
        service_type: &str,
        identifier: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<ServiceDefinition>, LocationError> {
        // A miss may only be recorded against the change id it was observed at.
        let observed_change_id = self.cache.load().change_id();

        match self.cache.load().try_find_service_definition(service_type, identifier) {
            CacheLookup::Hit(definition) => return Ok(Some(definition)),
            CacheLookup::NegativeHit => return Ok(None),
            CacheLookup::Miss => {}
        }

        self.check_for_server_updates(cancel).await?;

        let cache = self.cache.load_full();
        match cache.try_find_service_definition(service_type, identifier) {
            CacheLookup::Hit(definition) => return Ok(Some(definition)),
            CacheLookup::NegativeHit => return Ok(None),
            CacheLookup::Miss => {}
        }

        if service_type.eq_ignore_ascii_case(LOCATION_SERVICE)
            && identifier != ROOT_IDENTIFIER
            && identifier != APPLICATION_IDENTIFIER
            && self.instance_type(cancel).await? == ROOT_IDENTIFIER
        {
            tracing::debug!(server_url = %self.base_url, %identifier, "Asking root server for location");
            return cancellable(cancel, self.client.service_definition(service_type, identifier)).await;
        }

        cache.add_cached_miss(service_type, identifier, observed_change_id);
        Ok(None)
    }

    /// All definitions, or all of one type. `None` if the server has none.
    pub async fn find_service_definitions(
        &self,
        service_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<ServiceDefinition>>, LocationError> {
        if let Some(definitions) = self.cache.load().find_service_definitions(service_type) {
            return Ok(Some(definitions));
        }

        self.check_for_server_updates(cancel).await?;
        Ok(self.cache.load().find_service_definitions(service_type))
    }

    /// Definitions that describe versioned REST resources.
    pub async fn resource_locations(&self, cancel: &CancellationToken) -> Result<Vec<ServiceDefinition>, LocationError> {
        if let Some(locations) = self.resource_locations.read().as_ref() {
            return Ok(locations.clone());
        }

        let locations: Vec<ServiceDefinition> = self
            .find_service_definitions(None, cancel)
            .await?
            .unwrap_or_default()
            .into_iter()
            .filter(|definition| definition.resource_version > 0)
            .collect();

        if !locations.is_empty() {
            *self.resource_locations.write() = Some(locations.clone());
        }
        Ok(locations)
    }

    /// URL of a service as reached through this connection's access mapping.
    pub async fn resolve_url_for_current_connection(
        &self,
        service_type: &str,
        identifier: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, LocationError> {
        if service_type.eq_ignore_ascii_case(LOCATION_SERVICE) && identifier == SELF_REFERENCE_IDENTIFIER {
            return Ok(Some(self.base_url.to_string()));
        }

        match self.find_service_definition(service_type, identifier, cancel).await? {
            Some(definition) => Ok(Some(self.location_for_current_connection(&definition, cancel).await?)),
            None => Ok(None),
        }
    }

    pub async fn resolve_url_for_access_mapping(
        &self,
        service_type: &str,
        identifier: Uuid,
        access_mapping: &AccessMapping,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, LocationError> {
        let definition = self
            .find_service_definition(service_type, identifier, cancel)
            .await?
            .ok_or_else(|| LocationError::ServiceDefinitionDoesNotExist {
                service_type: service_type.to_string(),
                identifier,
            })?;

        self.location_for_access_mapping(&definition, access_mapping)
    }

    /// Tries the client mapping, then the default mapping, then whatever the
    /// definition registered first.
    pub async fn location_for_current_connection(
        &self,
        definition: &ServiceDefinition,
        cancel: &CancellationToken,
    ) -> Result<String, LocationError> {
        let client = self.client_access_mapping(cancel).await?;
        if let Some(location) = self.location_for_access_mapping(definition, &client)? {
            return Ok(location);
        }

        let default = self.default_access_mapping(cancel).await?;
        if let Some(location) = self.location_for_access_mapping(definition, &default)? {
            return Ok(location);
        }

        definition
            .location_mappings
            .first()
            .map(|mapping| mapping.location.clone())
            .ok_or_else(|| LocationError::InvalidServiceDefinition {
                service_type: definition.service_type.clone(),
            })
    }

    /// URL of `definition` under `access_mapping`. `None` when a fully
    /// qualified definition has no location for that mapping.
    pub fn location_for_access_mapping(
        &self,
        definition: &ServiceDefinition,
        access_mapping: &AccessMapping,
    ) -> Result<Option<String>, LocationError> {
        if definition.relative_to == RelativeTo::FullyQualified {
            return Ok(definition
                .location_mapping(&access_mapping.moniker)
                .map(|mapping| mapping.location.clone()));
        }

        let invalid = || LocationError::InvalidAccessPoint {
            moniker: access_mapping.moniker.clone(),
        };
        if access_mapping.access_point.is_empty() {
            return Err(invalid());
        }

        let root = match definition.relative_to {
            RelativeTo::Context => {
                let access_point = Url::parse(&access_mapping.access_point).map_err(|_| invalid())?;
                let relative_directory = access_mapping
                    .virtual_directory
                    .clone()
                    .unwrap_or_else(|| self.cache.load().web_application_relative_directory());
                combine_path(access_point.as_str(), &relative_directory)
            }
            _ => access_mapping.access_point.clone(),
        };

        Ok(Some(combine_path(
            &root,
            definition.relative_path.as_deref().unwrap_or_default(),
        )))
    }

    /// Makes sure the cache reflects the server's latest change id.
    async fn check_for_server_updates(&self, cancel: &CancellationToken) -> Result<(), LocationError> {
        let connected = self.ensure_connected(ConnectScope::IncludeServices, cancel).await?;

        // Connected earlier, but the cache was invalidated since (for example by
        // an unreadable rewrite from another process).
        if !connected && self.cache.load().change_id() == UNKNOWN_CHANGE_ID {
            let _guard = self.lock_connect(cancel).await?;
            if self.cache.load().change_id() == UNKNOWN_CHANGE_ID {
                self.connect_locked(ConnectScope::IncludeServices, cancel).await?;
            }
        }
        Ok(())
    }

    /// Resets the connection when the cache expired, then reports whether a
    /// connect is needed to satisfy `needed`.
    fn need_to_connect(&self, needed: ConnectScope) -> bool {
        let expired = self.cache.load().is_expired();
        let mut state = self.connection.write();
        if expired {
            state.connected = false;
            state.valid_scope = ConnectScope::None;
        }
        !state.connected || !state.valid_scope.satisfies(needed)
    }

    /// Returns true if this call performed a connect.
    async fn ensure_connected(&self, needed: ConnectScope, cancel: &CancellationToken) -> Result<bool, LocationError> {
        if !self.need_to_connect(needed) {
            return Ok(false);
        }

        let _guard = self.lock_connect(cancel).await?;
        if !self.need_to_connect(needed) {
            return Ok(false);
        }

        self.connect_locked(needed, cancel).await?;
        Ok(true)
    }

    async fn lock_connect(&self, cancel: &CancellationToken) -> Result<tokio::sync::MutexGuard<'_, ()>, LocationError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LocationError::Cancelled),
            guard = self.connect_lock.lock() => Ok(guard),
        }
    }

    async fn connect_locked(&self, scope: ConnectScope, cancel: &CancellationToken) -> Result<(), LocationError> {
        let started = Instant::now();
        let mut cache = self.cache.load_full();
        let last_change_id = cache.change_id();

        // Nothing usable cached: ask for everything.
        let scope = if last_change_id == UNKNOWN_CHANGE_ID || cache.access_mappings().is_empty() {
            ConnectScope::IncludeServices
        } else {
            scope
        };
        let include_services = scope == ConnectScope::IncludeServices;

        let mut data = self.fetch_connection_data(scope, last_change_id, cancel).await?;
        self.check_identity(&data)?;

        let service_owner = match &data.location_service_data {
            Some(snapshot) if snapshot.service_owner.is_nil() => ON_PREMISES_INSTANCE_TYPE,
            Some(snapshot) => snapshot.service_owner,
            None => self.connection.read().service_owner,
        };
        let identity = ServerIdentity::new(data.instance_id, service_owner);

        if self
            .identity_store
            .ensure_mapping_exists(self.base_url.as_str(), identity)
        {
            // The delta was computed against a cache for another identity.
            let has_definitions = data
                .location_service_data
                .as_ref()
                .and_then(|snapshot| snapshot.service_definitions.as_ref())
                .is_some_and(|definitions| !definitions.is_empty());
            if include_services && !has_definitions {
                data = self
                    .fetch_connection_data(ConnectScope::IncludeServices, UNKNOWN_CHANGE_ID, cancel)
                    .await?;
            }

            tracing::debug!(
                server_url = %self.base_url,
                server_id = %identity.server_id,
                service_owner = %identity.service_owner,
                "Server identity recorded, switching topology cache"
            );
            cache = Arc::new(TopologyCache::new(
                &self.cache_settings,
                identity,
                self.base_url.as_str(),
            ));
            self.cache.store(cache.clone());
        }

        match data.location_service_data.take() {
            Some(mut snapshot) => {
                if snapshot.web_application_relative_directory.is_none() {
                    snapshot.web_application_relative_directory =
                        data.web_application_relative_directory.clone();
                }
                cache.reconcile(&snapshot, include_services)?;
            }
            None => {
                if let Some(directory) = data.web_application_relative_directory.as_deref() {
                    cache.set_web_application_relative_directory(directory);
                }
            }
        }

        {
            let mut state = self.connection.write();
            state.authenticated_user = data.authenticated_user;
            state.authorized_user = data.authorized_user;
            state.instance_id = data.instance_id;
            state.service_owner = service_owner;
            state.valid_scope = state.valid_scope.max(scope);
            state.connected = true;
        }

        histogram!(CONNECT_DURATION).record(started.elapsed().as_secs_f64());
        tracing::info!(
            server_url = %self.base_url,
            scope = scope.as_str(),
            change_id = cache.change_id(),
            "Connected to server"
        );
        Ok(())
    }

    /// One connect round trip. A timeout is retried once.
    async fn fetch_connection_data(
        &self,
        scope: ConnectScope,
        last_change_id: i32,
        cancel: &CancellationToken,
    ) -> Result<ConnectionData, LocationError> {
        let mut retried = false;
        loop {
            counter!(CONNECT).increment(1);
            match cancellable(cancel, self.client.connection_data(scope, last_change_id)).await {
                Err(LocationError::Client(ClientError::Timeout)) if !retried => {
                    tracing::warn!(server_url = %self.base_url, "Connect timed out, retrying");
                    counter!(CONNECT_TIMEOUT_RETRY).increment(1);
                    retried = true;
                }
                result => return result,
            }
        }
    }

    fn check_identity(&self, data: &ConnectionData) -> Result<(), LocationError> {
        let state = self.connection.read();
        if let (Some(previous), Some(current)) = (&state.authenticated_user, &data.authenticated_user)
            && !previous.same_descriptor(current)
        {
            return Err(LocationError::IdentityMismatch {
                expected: previous.descriptor.clone(),
                actual: current.descriptor.clone(),
            });
        }
        Ok(())
    }
}
