use crate::client::{ClientError, LocationClient};
use crate::types::{
    AccessMapping, ConnectScope, ConnectionData, Identity, LOCATION_SERVICE, LocationMapping,
    RelativeTo, ServiceDefinition, TopologySnapshot,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

pub fn access_mapping(moniker: &str, access_point: &str) -> AccessMapping {
    let mut mapping = AccessMapping::new(moniker, access_point);
    mapping.virtual_directory = Some(String::new());
    mapping
}

/// A fully qualified location service entry pointing at `location` under `moniker`.
pub fn location_service(identifier: Uuid, moniker: &str, location: &str) -> ServiceDefinition {
    let mut definition = ServiceDefinition::new(
        LOCATION_SERVICE,
        identifier,
        "Location Service",
        RelativeTo::FullyQualified,
        None,
    );
    definition
        .location_mappings
        .push(LocationMapping::new(moniker, location));
    definition
}

pub fn context_service(service_type: &str, identifier: Uuid, relative_path: &str) -> ServiceDefinition {
    ServiceDefinition::new(
        service_type,
        identifier,
        service_type,
        RelativeTo::Context,
        Some(relative_path.to_string()),
    )
}

/// A stale-client snapshot whose default access mapping is the first one given.
pub fn snapshot(
    last_change_id: i32,
    access_mappings: Vec<AccessMapping>,
    service_definitions: Vec<ServiceDefinition>,
) -> TopologySnapshot {
    TopologySnapshot {
        service_owner: Uuid::nil(),
        default_access_mapping_moniker: access_mappings
            .first()
            .map(|mapping| mapping.moniker.clone())
            .unwrap_or_default(),
        access_mappings,
        client_cache_fresh: false,
        client_cache_time_to_live: 3600,
        last_change_id,
        service_definitions: Some(service_definitions),
        web_application_relative_directory: None,
    }
}

pub fn user(descriptor: &str) -> Identity {
    Identity {
        id: Uuid::new_v4(),
        descriptor: descriptor.to_string(),
        provider_display_name: descriptor.to_string(),
    }
}

pub fn connection_data(instance_id: Uuid, service_owner: Uuid, mut snapshot: TopologySnapshot) -> ConnectionData {
    snapshot.service_owner = service_owner;
    ConnectionData {
        authenticated_user: Some(user("alice@example.com")),
        authorized_user: Some(user("alice@example.com")),
        instance_id,
        deployment_id: Uuid::new_v4(),
        location_service_data: Some(snapshot),
        web_application_relative_directory: None,
    }
}

/// In-memory server. Answers every connect with the configured data and
/// records what was asked.
pub struct FakeLocationClient {
    connection_data: Mutex<ConnectionData>,
    definitions: Mutex<HashMap<(String, Uuid), ServiceDefinition>>,
    connect_requests: Mutex<Vec<(ConnectScope, i32)>>,
    definition_requests: AtomicUsize,
    timeouts: AtomicUsize,
    latency: Option<Duration>,
}

impl FakeLocationClient {
    pub fn new(connection_data: ConnectionData) -> Self {
        FakeLocationClient {
            connection_data: Mutex::new(connection_data),
            definitions: Mutex::new(HashMap::new()),
            connect_requests: Mutex::new(Vec::new()),
            definition_requests: AtomicUsize::new(0),
            timeouts: AtomicUsize::new(0),
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// The next `count` connect calls time out.
    pub fn fail_with_timeouts(&self, count: usize) {
        self.timeouts.store(count, Ordering::SeqCst);
    }

    pub fn update_connection_data(&self, update: impl FnOnce(&mut ConnectionData)) {
        update(&mut self.connection_data.lock());
    }

    /// Served by the single-definition endpoint only.
    pub fn add_definition(&self, definition: ServiceDefinition) {
        self.definitions.lock().insert(
            (definition.service_type.to_lowercase(), definition.identifier),
            definition,
        );
    }

    pub fn connect_count(&self) -> usize {
        self.connect_requests.lock().len()
    }

    pub fn connect_requests(&self) -> Vec<(ConnectScope, i32)> {
        self.connect_requests.lock().clone()
    }

    pub fn definition_request_count(&self) -> usize {
        self.definition_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocationClient for FakeLocationClient {
    async fn connection_data(
        &self,
        scope: ConnectScope,
        last_change_id: i32,
    ) -> Result<ConnectionData, ClientError> {
        self.connect_requests.lock().push((scope, last_change_id));
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let timed_out = self
            .timeouts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if timed_out {
            return Err(ClientError::Timeout);
        }

        let mut data = self.connection_data.lock().clone();
        if scope == ConnectScope::None
            && let Some(snapshot) = data.location_service_data.as_mut()
        {
            snapshot.service_definitions = None;
        }
        Ok(data)
    }

    async fn service_definition(
        &self,
        service_type: &str,
        identifier: Uuid,
    ) -> Result<Option<ServiceDefinition>, ClientError> {
        self.definition_requests.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .definitions
            .lock()
            .get(&(service_type.to_lowercase(), identifier))
            .cloned())
    }
}
