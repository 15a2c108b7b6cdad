//! Service-topology data model.
//!
//! The structs here double as the wire representation returned by a server's
//! connection-data endpoint (camelCase JSON). The on-disk cache document has its
//! own schema, see [`crate::codec`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::{Uuid, uuid};

/// Service type under which every server registers its location services.
pub const LOCATION_SERVICE: &str = "LocationService2";

/// Identifier a server uses for its own location service.
pub const SELF_REFERENCE_IDENTIFIER: Uuid = uuid!("464ccb5b-7ab9-4eb3-9b5e-79ec6d3e53c6");

/// The root of the delegation hierarchy. Also the instance type of the root server.
pub const ROOT_IDENTIFIER: Uuid = uuid!("951917ac-a960-4999-8464-e3f0aa25b381");

pub const APPLICATION_IDENTIFIER: Uuid = uuid!("8d299418-9467-402b-a171-9165e2f703e2");

/// Instance type of an on-premises server. These servers never delegate.
pub const ON_PREMISES_INSTANCE_TYPE: Uuid = uuid!("87966eaa-cb2a-443f-be3c-47bd3b5bf3cb");

pub const PUBLIC_ACCESS_MAPPING_MONIKER: &str = "PublicAccessMapping";

/// Change id meaning "no valid cache".
pub const UNKNOWN_CHANGE_ID: i32 = -1;

/// One network zone through which a server is reachable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessMapping {
    pub moniker: String,
    pub access_point: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_directory: Option<String>,
}

impl AccessMapping {
    pub fn new<M, A>(moniker: M, access_point: A) -> Self
    where
        M: Into<String>,
        A: Into<String>,
    {
        let moniker = moniker.into();
        AccessMapping {
            display_name: moniker.clone(),
            moniker,
            access_point: access_point.into(),
            virtual_directory: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelativeTo {
    #[serde(alias = "Context")]
    Context,
    #[serde(alias = "WebApplication")]
    WebApplication,
    #[serde(alias = "FullyQualified")]
    FullyQualified,
}

impl RelativeTo {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelativeTo::Context => "Context",
            RelativeTo::WebApplication => "WebApplication",
            RelativeTo::FullyQualified => "FullyQualified",
        }
    }
}

impl fmt::Display for RelativeTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelativeTo {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            RelativeTo::Context,
            RelativeTo::WebApplication,
            RelativeTo::FullyQualified,
        ]
        .into_iter()
        .find(|setting| setting.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| s.to_string())
    }
}

/// A concrete URL for one access mapping of a fully qualified service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationMapping {
    pub access_mapping_moniker: String,
    pub location: String,
}

impl LocationMapping {
    pub fn new<M, L>(access_mapping_moniker: M, location: L) -> Self
    where
        M: Into<String>,
        L: Into<String>,
    {
        LocationMapping {
            access_mapping_moniker: access_mapping_moniker.into(),
            location: location.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    pub service_type: String,
    pub identifier: Uuid,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "relativeToSetting")]
    pub relative_to: RelativeTo,
    #[serde(default)]
    pub relative_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_service_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_identifier: Option<Uuid>,
    /// Only meaningful for [`RelativeTo::FullyQualified`].
    #[serde(default)]
    pub location_mappings: Vec<LocationMapping>,
    #[serde(default)]
    pub resource_version: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_version: Option<String>,
}

impl ServiceDefinition {
    pub fn new<T, N>(
        service_type: T,
        identifier: Uuid,
        display_name: N,
        relative_to: RelativeTo,
        relative_path: Option<String>,
    ) -> Self
    where
        T: Into<String>,
        N: Into<String>,
    {
        ServiceDefinition {
            service_type: service_type.into(),
            identifier,
            display_name: display_name.into(),
            description: None,
            relative_to,
            relative_path,
            parent_service_type: None,
            parent_identifier: None,
            location_mappings: Vec::new(),
            resource_version: 0,
            min_version: None,
            max_version: None,
            released_version: None,
        }
    }

    /// Location registered for the given access mapping. Always `None` unless
    /// the definition is fully qualified.
    pub fn location_mapping(&self, moniker: &str) -> Option<&LocationMapping> {
        if self.relative_to != RelativeTo::FullyQualified {
            return None;
        }

        self.location_mappings
            .iter()
            .find(|mapping| mapping.access_mapping_moniker.eq_ignore_ascii_case(moniker))
    }
}

/// Stable identity of a server: which instance it is, and what kind of service owns it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ServerIdentity {
    pub server_id: Uuid,
    pub service_owner: Uuid,
}

impl ServerIdentity {
    pub fn new(server_id: Uuid, service_owner: Uuid) -> Self {
        ServerIdentity {
            server_id,
            service_owner,
        }
    }

    pub fn is_known(&self) -> bool {
        !self.server_id.is_nil()
    }
}

/// How much of the topology a connect call asks for. `IncludeServices` subsumes `None`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectScope {
    #[default]
    None,
    IncludeServices,
}

impl ConnectScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectScope::None => "None",
            ConnectScope::IncludeServices => "IncludeServices",
        }
    }

    pub fn satisfies(&self, needed: ConnectScope) -> bool {
        *self >= needed
    }
}

fn default_time_to_live() -> i64 {
    3600
}

/// Location data carried by a connect response.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologySnapshot {
    #[serde(default)]
    pub service_owner: Uuid,
    #[serde(default)]
    pub access_mappings: Vec<AccessMapping>,
    #[serde(default)]
    pub client_cache_fresh: bool,
    #[serde(default = "default_time_to_live")]
    pub client_cache_time_to_live: i64,
    #[serde(default)]
    pub default_access_mapping_moniker: String,
    #[serde(default)]
    pub last_change_id: i32,
    #[serde(default)]
    pub service_definitions: Option<Vec<ServiceDefinition>>,
    /// Filled from the enclosing [`ConnectionData`] when the server sends it there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_application_relative_directory: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: Uuid,
    #[serde(default)]
    pub descriptor: String,
    #[serde(default)]
    pub provider_display_name: String,
}

impl Identity {
    pub fn same_descriptor(&self, other: &Identity) -> bool {
        self.descriptor.eq_ignore_ascii_case(&other.descriptor)
    }
}

/// Response of the connect handshake.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionData {
    #[serde(default)]
    pub authenticated_user: Option<Identity>,
    #[serde(default)]
    pub authorized_user: Option<Identity>,
    #[serde(default)]
    pub instance_id: Uuid,
    #[serde(default)]
    pub deployment_id: Uuid,
    #[serde(default)]
    pub location_service_data: Option<TopologySnapshot>,
    #[serde(default)]
    pub web_application_relative_directory: Option<String>,
}

/// Case-insensitive key for monikers and service types.
pub fn fold_key(value: &str) -> String {
    value.to_lowercase()
}

/// Key under which a server URL is remembered: case-insensitive, trailing
/// slash ignored.
pub fn normalize_location(url: &str) -> String {
    url.trim_end_matches('/').to_lowercase()
}

/// Opaque token recorded for a known-missing service definition.
pub fn cached_miss_key(service_type: &str, identifier: Uuid) -> String {
    format!("{}_{}", fold_key(service_type), identifier)
}

/// Persisted and in-memory topology of one server.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheState {
    pub last_change_id: i32,
    pub expires_at: DateTime<Utc>,
    pub default_access_mapping_moniker: String,
    pub web_application_relative_directory: String,
    /// Keyed by folded moniker.
    pub access_mappings: BTreeMap<String, AccessMapping>,
    /// Keyed by folded service type, then identifier.
    pub services_by_type: BTreeMap<String, BTreeMap<Uuid, ServiceDefinition>>,
    pub cached_misses: BTreeSet<String>,
}

impl Default for CacheState {
    fn default() -> Self {
        CacheState {
            last_change_id: UNKNOWN_CHANGE_ID,
            expires_at: DateTime::<Utc>::UNIX_EPOCH,
            default_access_mapping_moniker: String::new(),
            web_application_relative_directory: String::new(),
            access_mappings: BTreeMap::new(),
            services_by_type: BTreeMap::new(),
            cached_misses: BTreeSet::new(),
        }
    }
}

impl CacheState {
    /// Drops all topology. The web application directory is connection
    /// metadata and survives.
    pub fn reset(&mut self) {
        self.last_change_id = UNKNOWN_CHANGE_ID;
        self.expires_at = DateTime::<Utc>::UNIX_EPOCH;
        self.access_mappings.clear();
        self.services_by_type.clear();
        self.cached_misses.clear();
    }

    pub fn access_mapping(&self, moniker: &str) -> Option<&AccessMapping> {
        self.access_mappings.get(&fold_key(moniker))
    }

    /// Updates an existing mapping field by field, or inserts it.
    pub fn upsert_access_mapping(&mut self, mapping: AccessMapping) {
        match self.access_mappings.get_mut(&fold_key(&mapping.moniker)) {
            Some(existing) => {
                existing.display_name = mapping.display_name;
                existing.access_point = mapping.access_point;
                existing.virtual_directory = mapping.virtual_directory;
            }
            None => {
                self.access_mappings
                    .insert(fold_key(&mapping.moniker), mapping);
            }
        }
    }

    pub fn service(&self, service_type: &str, identifier: Uuid) -> Option<&ServiceDefinition> {
        self.services_by_type
            .get(&fold_key(service_type))
            .and_then(|services| services.get(&identifier))
    }

    pub fn insert_service(&mut self, definition: ServiceDefinition) {
        self.services_by_type
            .entry(fold_key(&definition.service_type))
            .or_default()
            .insert(definition.identifier, definition);
    }

    pub fn service_count(&self) -> usize {
        self.services_by_type.values().map(BTreeMap::len).sum()
    }

    pub fn is_cached_miss(&self, service_type: &str, identifier: Uuid) -> bool {
        self.cached_misses
            .contains(&cached_miss_key(service_type, identifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_access_mapping_updates_in_place() {
        let mut state = CacheState::default();
        state.upsert_access_mapping(AccessMapping::new("Public", "https://old.example"));
        state.upsert_access_mapping(AccessMapping::new("PUBLIC", "https://new.example"));

        assert_eq!(state.access_mappings.len(), 1);
        let mapping = state.access_mapping("public").unwrap();
        assert_eq!(mapping.access_point, "https://new.example");
        // The first writer's moniker spelling is kept.
        assert_eq!(mapping.moniker, "Public");
    }

    #[test]
    fn test_service_lookup_is_case_insensitive_on_type() {
        let id = Uuid::new_v4();
        let mut state = CacheState::default();
        state.insert_service(ServiceDefinition::new(
            "LocationService2",
            id,
            "Location",
            RelativeTo::Context,
            Some("/".into()),
        ));

        assert!(state.service("locationservice2", id).is_some());
        assert!(state.service("LocationService2", Uuid::new_v4()).is_none());
        assert_eq!(state.service_count(), 1);
    }

    #[test]
    fn test_location_mapping_only_for_fully_qualified() {
        let mut definition = ServiceDefinition::new(
            "Type",
            Uuid::new_v4(),
            "Name",
            RelativeTo::Context,
            Some("/x".into()),
        );
        definition
            .location_mappings
            .push(LocationMapping::new("Public", "https://a.example/"));
        assert!(definition.location_mapping("Public").is_none());

        definition.relative_to = RelativeTo::FullyQualified;
        assert_eq!(
            definition.location_mapping("public").unwrap().location,
            "https://a.example/"
        );
    }

    #[test]
    fn test_normalize_location() {
        assert_eq!(
            normalize_location("HTTPS://Dev.Example/Org/"),
            normalize_location("https://dev.example/org")
        );
    }

    #[test]
    fn test_connect_scope_ordering() {
        assert!(ConnectScope::IncludeServices.satisfies(ConnectScope::None));
        assert!(!ConnectScope::None.satisfies(ConnectScope::IncludeServices));
    }

    #[test]
    fn test_relative_to_parsing() {
        assert_eq!("fullyqualified".parse(), Ok(RelativeTo::FullyQualified));
        assert!("Authority".parse::<RelativeTo>().is_err());

        let json = r#"{"serviceType":"T","identifier":"951917ac-a960-4999-8464-e3f0aa25b381","relativeToSetting":"webApplication"}"#;
        let definition: ServiceDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(definition.relative_to, RelativeTo::WebApplication);
        assert_eq!(definition.identifier, ROOT_IDENTIFIER);
    }
}
