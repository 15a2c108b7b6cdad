//! Finds the provider responsible for a service area.
//!
//! Areas hosted by the server the client is connected to are answered by the
//! local provider. Anything else is located through the local server's
//! location entries, falling back to the root server, and gets its own
//! provider. Providers are kept for reuse, keyed both by area and by URL so
//! areas hosted together share one connection.

use crate::client::{ClientError, ClientSettings, HttpLocationClient};
use crate::config::Config;
use crate::counter;
use crate::errors::LocationError;
use crate::identity_store::ServerIdentityStore;
use crate::metrics_defs::PROVIDER_CREATED;
use crate::provider::ConnectionProvider;
use crate::topology_cache::CacheSettings;
use crate::types::{
    APPLICATION_IDENTIFIER, AccessMapping, ConnectScope, LOCATION_SERVICE,
    ON_PREMISES_INSTANCE_TYPE, PUBLIC_ACCESS_MAPPING_MONIKER, ROOT_IDENTIFIER,
    SELF_REFERENCE_IDENTIFIER, ServiceDefinition, normalize_location,
};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

/// Root lookups only ever go one server up; this bounds a misconfigured chain.
const MAX_DELEGATION_DEPTH: usize = 2;

type ResolveFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Arc<ConnectionProvider>>, LocationError>> + Send + 'a>>;

/// Builds providers for servers other than the local one.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn create(&self, location: &Url) -> Result<Arc<ConnectionProvider>, LocationError>;
}

/// Talks to remote servers over HTTP, sharing the local identity store and cache settings.
pub struct HttpProviderFactory {
    identity_store: Arc<ServerIdentityStore>,
    cache_settings: CacheSettings,
    client_settings: ClientSettings,
}

impl HttpProviderFactory {
    pub fn new(
        identity_store: Arc<ServerIdentityStore>,
        cache_settings: CacheSettings,
        client_settings: ClientSettings,
    ) -> Self {
        HttpProviderFactory {
            identity_store,
            cache_settings,
            client_settings,
        }
    }
}

#[async_trait]
impl ProviderFactory for HttpProviderFactory {
    async fn create(&self, location: &Url) -> Result<Arc<ConnectionProvider>, LocationError> {
        let client = HttpLocationClient::new(location, &self.client_settings)?;
        Ok(Arc::new(ConnectionProvider::new(
            location.clone(),
            Arc::new(client),
            self.identity_store.clone(),
            self.cache_settings.clone(),
        )))
    }
}

#[derive(Default)]
struct ProviderRegistry {
    by_area: RwLock<HashMap<Uuid, Arc<ConnectionProvider>>>,
    /// Keyed by normalized location.
    by_location: RwLock<HashMap<String, Arc<ConnectionProvider>>>,
}

impl ProviderRegistry {
    fn by_area(&self, area_id: Uuid) -> Option<Arc<ConnectionProvider>> {
        self.by_area.read().get(&area_id).cloned()
    }

    fn by_location(&self, location: &str) -> Option<Arc<ConnectionProvider>> {
        self.by_location
            .read()
            .get(&normalize_location(location))
            .cloned()
    }

    /// Registers `provider` unless another one got there first, and returns the one kept.
    fn get_or_add_location(&self, location: &str, provider: Arc<ConnectionProvider>) -> Arc<ConnectionProvider> {
        self.by_location
            .write()
            .entry(normalize_location(location))
            .or_insert(provider)
            .clone()
    }

    fn add_area(&self, area_id: Uuid, provider: Arc<ConnectionProvider>) {
        self.by_area.write().insert(area_id, provider);
    }
}

pub struct ServiceLocationResolver {
    local: Arc<ConnectionProvider>,
    factory: Arc<dyn ProviderFactory>,
    registry: ArcSwapOption<ProviderRegistry>,
}

impl ServiceLocationResolver {
    pub fn new(local: Arc<ConnectionProvider>, factory: Arc<dyn ProviderFactory>) -> Self {
        ServiceLocationResolver {
            local,
            factory,
            registry: ArcSwapOption::empty(),
        }
    }

    /// Wires a resolver for `config.server_url` that talks HTTP and caches under the configured directory.
    pub fn from_config(config: &Config) -> Result<Self, LocationError> {
        let cache_settings = config.cache_settings();
        let client_settings = config.client_settings();
        let identity_store = Arc::new(match &cache_settings.cache_dir {
            Some(dir) => ServerIdentityStore::new(dir),
            None => ServerIdentityStore::memory_only(),
        });

        let client = HttpLocationClient::new(&config.server_url, &client_settings)?;
        let local = Arc::new(ConnectionProvider::new(
            config.server_url.clone(),
            Arc::new(client),
            identity_store.clone(),
            cache_settings.clone(),
        ));
        let factory = Arc::new(HttpProviderFactory::new(
            identity_store,
            cache_settings,
            client_settings,
        ));

        Ok(ServiceLocationResolver::new(local, factory))
    }

    pub fn local(&self) -> &Arc<ConnectionProvider> {
        &self.local
    }

    /// The provider serving `area_id`, or `None` if no server knows where it lives.
    pub async fn resolve_provider(
        &self,
        area_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<ConnectionProvider>>, LocationError> {
        if area_id.is_nil() || area_id == SELF_REFERENCE_IDENTIFIER {
            return Ok(Some(self.local.clone()));
        }

        let instance_id = self.local.instance_id(cancel).await?;
        let instance_type = self.local.instance_type(cancel).await?;
        if area_id == instance_id || area_id == instance_type || instance_type == ON_PREMISES_INSTANCE_TYPE {
            return Ok(Some(self.local.clone()));
        }

        self.resolve_remote(area_id, 0, cancel).await
    }

    /// Base URL of the server hosting `area_id`, as reached through the given
    /// access mapping (the public one by default, else the client's own).
    pub async fn service_url(
        &self,
        area_id: Uuid,
        access_mapping_moniker: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, LocationError> {
        let Some(provider) = self.resolve_provider(area_id, cancel).await? else {
            return Ok(None);
        };

        let moniker = access_mapping_moniker.unwrap_or(PUBLIC_ACCESS_MAPPING_MONIKER);
        let access_mapping = match provider.access_mapping(moniker, cancel).await? {
            Some(mapping) => mapping,
            None => provider.client_access_mapping(cancel).await?,
        };

        provider
            .resolve_url_for_access_mapping(LOCATION_SERVICE, SELF_REFERENCE_IDENTIFIER, &access_mapping, cancel)
            .await
    }

    pub async fn find_service_definition(
        &self,
        service_type: &str,
        identifier: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<ServiceDefinition>, LocationError> {
        self.local
            .find_service_definition(service_type, identifier, cancel)
            .await
    }

    pub async fn find_service_definitions(
        &self,
        service_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<ServiceDefinition>>, LocationError> {
        self.local.find_service_definitions(service_type, cancel).await
    }

    pub async fn access_mappings(&self, cancel: &CancellationToken) -> Result<Vec<AccessMapping>, LocationError> {
        self.local.access_mappings(cancel).await
    }

    fn resolve_remote<'a>(&'a self, area_id: Uuid, depth: usize, cancel: &'a CancellationToken) -> ResolveFuture<'a> {
        Box::pin(async move {
            let registry = self.registry(cancel).await?;
            if let Some(provider) = registry.by_area(area_id) {
                return Ok(Some(provider));
            }

            let mut location = self
                .local
                .resolve_url_for_current_connection(LOCATION_SERVICE, area_id, cancel)
                .await?;

            if location.is_none() && area_id != ROOT_IDENTIFIER && area_id != APPLICATION_IDENTIFIER {
                if depth >= MAX_DELEGATION_DEPTH {
                    tracing::warn!(%area_id, depth, "Giving up on root delegation");
                } else if let Some(root) = self.resolve_remote(ROOT_IDENTIFIER, depth + 1, cancel).await?
                    && !Arc::ptr_eq(&root, &self.local)
                {
                    location = root
                        .resolve_url_for_current_connection(LOCATION_SERVICE, area_id, cancel)
                        .await?;
                }
            }

            let Some(location) = location else {
                tracing::debug!(%area_id, "No server hosts area");
                return Ok(None);
            };

            let provider = match registry.by_location(&location) {
                Some(provider) => provider,
                None => {
                    let created = self.create_provider(&location, cancel).await?;
                    registry.get_or_add_location(&location, created)
                }
            };

            registry.add_area(area_id, provider.clone());
            Ok(Some(provider))
        })
    }

    async fn create_provider(
        &self,
        location: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<ConnectionProvider>, LocationError> {
        let url = Url::parse(location)
            .map_err(|e| ClientError::InvalidUrl(format!("{location}: {e}")))?;

        tracing::info!(location, "Creating provider for delegated server");
        counter!(PROVIDER_CREATED).increment(1);
        let provider = self.factory.create(&url).await?;

        if self.local.has_connected() {
            provider.connect(ConnectScope::None, cancel).await?;
        }
        Ok(provider)
    }

    /// Built on first use and seeded with the local provider. Concurrent
    /// first uses race to publish; losers adopt the winner's registry.
    async fn registry(&self, cancel: &CancellationToken) -> Result<Arc<ProviderRegistry>, LocationError> {
        if let Some(registry) = self.registry.load_full() {
            return Ok(registry);
        }

        let fresh = Arc::new(ProviderRegistry::default());
        if let Some(location) = self
            .local
            .resolve_url_for_current_connection(LOCATION_SERVICE, SELF_REFERENCE_IDENTIFIER, cancel)
            .await?
        {
            fresh.get_or_add_location(&location, self.local.clone());
        }

        let previous = self
            .registry
            .compare_and_swap(&None::<Arc<ProviderRegistry>>, Some(fresh.clone()));
        Ok(match &*previous {
            Some(winner) => winner.clone(),
            None => fresh,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{FakeLocationClient, access_mapping, connection_data, context_service, location_service, snapshot};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LOCAL_URL: &str = "https://dev.example/org/";

    /// Serves each location from a fake server and counts constructions.
    #[derive(Default)]
    struct FakeProviderFactory {
        servers: RwLock<HashMap<String, Arc<FakeLocationClient>>>,
        created: AtomicUsize,
    }

    impl FakeProviderFactory {
        fn add_server(&self, location: &str, client: Arc<FakeLocationClient>) {
            self.servers.write().insert(normalize_location(location), client);
        }

        fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderFactory for FakeProviderFactory {
        async fn create(&self, location: &Url) -> Result<Arc<ConnectionProvider>, LocationError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let client = self
                .servers
                .read()
                .get(&normalize_location(location.as_str()))
                .cloned()
                .unwrap_or_else(|| Arc::new(FakeLocationClient::new(Default::default())));
            Ok(Arc::new(ConnectionProvider::new(
                location.clone(),
                client,
                Arc::new(ServerIdentityStore::memory_only()),
                CacheSettings::default(),
            )))
        }
    }

    fn public(access_point: &str) -> AccessMapping {
        access_mapping(PUBLIC_ACCESS_MAPPING_MONIKER, access_point)
    }

    fn fake_server(
        instance_id: Uuid,
        owner: Uuid,
        access_point: &str,
        definitions: Vec<ServiceDefinition>,
    ) -> Arc<FakeLocationClient> {
        Arc::new(FakeLocationClient::new(connection_data(
            instance_id,
            owner,
            snapshot(1, vec![public(access_point)], definitions),
        )))
    }

    fn resolver(local: Arc<FakeLocationClient>, factory: Arc<FakeProviderFactory>) -> ServiceLocationResolver {
        let local = Arc::new(ConnectionProvider::new(
            Url::parse(LOCAL_URL).unwrap(),
            local,
            Arc::new(ServerIdentityStore::memory_only()),
            CacheSettings::default(),
        ));
        ServiceLocationResolver::new(local, factory)
    }

    #[tokio::test]
    async fn test_local_areas_resolve_to_local_provider() {
        let instance_id = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let factory = Arc::new(FakeProviderFactory::default());
        let local = fake_server(instance_id, owner, "https://dev.example/org", vec![]);
        let resolver = resolver(local, factory.clone());
        let cancel = CancellationToken::new();

        for area_id in [Uuid::nil(), SELF_REFERENCE_IDENTIFIER, instance_id, owner] {
            let provider = resolver.resolve_provider(area_id, &cancel).await.unwrap().unwrap();
            assert!(Arc::ptr_eq(&provider, resolver.local()));
        }
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn test_on_premises_server_never_delegates() {
        let factory = Arc::new(FakeProviderFactory::default());
        let local = fake_server(Uuid::new_v4(), Uuid::nil(), "https://dev.example/org", vec![]);
        let resolver = resolver(local, factory.clone());

        let provider = resolver
            .resolve_provider(Uuid::new_v4(), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&provider, resolver.local()));
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn test_remote_area_gets_one_provider() {
        let area = Uuid::new_v4();
        let factory = Arc::new(FakeProviderFactory::default());
        let local = fake_server(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "https://dev.example/org",
            vec![location_service(area, PUBLIC_ACCESS_MAPPING_MONIKER, "https://svc.example/")],
        );
        let resolver = resolver(local, factory.clone());
        let cancel = CancellationToken::new();

        let first = resolver.resolve_provider(area, &cancel).await.unwrap().unwrap();
        let second = resolver.resolve_provider(area, &cancel).await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.base_url().as_str(), "https://svc.example/");
        assert_eq!(factory.created(), 1);

        let registry = resolver.registry.load_full().unwrap();
        assert!(registry.by_location("HTTPS://SVC.example").is_some());
        assert!(registry.by_area(area).is_some());
        // Seeded with the local server.
        assert!(Arc::ptr_eq(&registry.by_location(LOCAL_URL).unwrap(), resolver.local()));
    }

    #[tokio::test]
    async fn test_areas_on_same_server_share_provider() {
        let first_area = Uuid::new_v4();
        let second_area = Uuid::new_v4();
        let factory = Arc::new(FakeProviderFactory::default());
        let local = fake_server(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "https://dev.example/org",
            vec![
                location_service(first_area, PUBLIC_ACCESS_MAPPING_MONIKER, "https://svc.example/"),
                location_service(second_area, PUBLIC_ACCESS_MAPPING_MONIKER, "https://svc.example"),
            ],
        );
        let resolver = resolver(local, factory.clone());
        let cancel = CancellationToken::new();

        let first = resolver.resolve_provider(first_area, &cancel).await.unwrap().unwrap();
        let second = resolver.resolve_provider(second_area, &cancel).await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_unknown_area_delegates_to_root() {
        let area = Uuid::new_v4();
        let factory = Arc::new(FakeProviderFactory::default());
        let local = fake_server(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "https://dev.example/org",
            vec![location_service(ROOT_IDENTIFIER, PUBLIC_ACCESS_MAPPING_MONIKER, "https://root.example/")],
        );
        let root = fake_server(
            Uuid::new_v4(),
            ROOT_IDENTIFIER,
            "https://root.example",
            vec![location_service(area, PUBLIC_ACCESS_MAPPING_MONIKER, "https://area.example/")],
        );
        factory.add_server("https://root.example/", root);
        let resolver = resolver(local, factory.clone());

        let provider = resolver
            .resolve_provider(area, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(provider.base_url().as_str(), "https://area.example/");
        // Root plus the area's own server.
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn test_unresolvable_area() {
        let factory = Arc::new(FakeProviderFactory::default());
        let local = fake_server(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "https://dev.example/org",
            vec![context_service("A", Uuid::new_v4(), "/a")],
        );
        let resolver = resolver(local, factory.clone());

        let provider = resolver
            .resolve_provider(Uuid::new_v4(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(provider.is_none());
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn test_remote_provider_warmed_up_when_local_connected() {
        let area = Uuid::new_v4();
        let factory = Arc::new(FakeProviderFactory::default());
        let local = fake_server(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "https://dev.example/org",
            vec![location_service(area, PUBLIC_ACCESS_MAPPING_MONIKER, "https://svc.example/")],
        );
        let remote = fake_server(Uuid::new_v4(), Uuid::new_v4(), "https://svc.example", vec![]);
        factory.add_server("https://svc.example/", remote.clone());
        let resolver = resolver(local, factory);

        let provider = resolver
            .resolve_provider(area, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert!(provider.has_connected());
        assert!(remote.connect_count() >= 1);
    }

    #[tokio::test]
    async fn test_service_url() {
        let area = Uuid::new_v4();
        let factory = Arc::new(FakeProviderFactory::default());
        let local = fake_server(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "https://dev.example/org",
            vec![location_service(area, PUBLIC_ACCESS_MAPPING_MONIKER, "https://svc.example/")],
        );
        let remote = fake_server(
            area,
            Uuid::new_v4(),
            "https://svc.example",
            vec![location_service(
                SELF_REFERENCE_IDENTIFIER,
                PUBLIC_ACCESS_MAPPING_MONIKER,
                "https://public.svc.example/",
            )],
        );
        factory.add_server("https://svc.example/", remote);
        let resolver = resolver(local, factory);
        let cancel = CancellationToken::new();

        let url = resolver.service_url(area, None, &cancel).await.unwrap();
        assert_eq!(url.as_deref(), Some("https://public.svc.example/"));

        assert!(resolver.service_url(Uuid::new_v4(), None, &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_first_use_builds_one_registry() {
        let area = Uuid::new_v4();
        let factory = Arc::new(FakeProviderFactory::default());
        let local = fake_server(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "https://dev.example/org",
            vec![location_service(area, PUBLIC_ACCESS_MAPPING_MONIKER, "https://svc.example/")],
        );
        let resolver = Arc::new(resolver(local, factory));
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(resolver.registry(&cancel), resolver.registry(&cancel));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &resolver.registry.load_full().unwrap()));
    }
}
