//! Encoding of the per-server cache document.
//!
//! The document is JSON with PascalCase element names. Optional elements are
//! omitted rather than written empty, and location mappings are only written
//! for fully qualified definitions. Decoding is strict about required fields so
//! a half-written or foreign file is rejected instead of partially loaded.

use crate::types::{
    AccessMapping, CacheState, LocationMapping, RelativeTo, ServiceDefinition, UNKNOWN_CHANGE_ID,
    fold_key,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum DocumentError {
    #[error("malformed cache document: {0}")]
    Malformed(String),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CacheDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_change_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cache_expiration_date: Option<DateTime<Utc>>,
    #[serde(default)]
    default_access_mapping_moniker: Option<String>,
    #[serde(default)]
    virtual_directory: Option<String>,
    #[serde(default)]
    access_mappings: Vec<AccessMappingNode>,
    #[serde(default)]
    services: Vec<ServiceNode>,
    #[serde(default)]
    cached_misses: Vec<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AccessMappingNode {
    #[serde(default)]
    moniker: Option<String>,
    #[serde(default)]
    access_point: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    virtual_directory: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RelativePathNode {
    #[serde(default)]
    relative_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LocationMappingNode {
    #[serde(default)]
    access_mapping: Option<String>,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceNode {
    #[serde(default)]
    service_type: Option<String>,
    #[serde(default)]
    identifier: Option<Uuid>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default)]
    relative_path: Option<RelativePathNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_service_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_identifier: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    location_mappings: Option<Vec<LocationMappingNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource_version: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    released_version: Option<String>,
}

fn required(value: Option<String>, name: &str, parent: &str) -> Result<String, DocumentError> {
    match value {
        Some(value) if !value.is_empty() => Ok(value),
        Some(_) => Err(DocumentError::Malformed(format!(
            "{name} is empty in {parent}"
        ))),
        None => Err(DocumentError::Malformed(format!(
            "{name} is missing from {parent}"
        ))),
    }
}

impl From<&AccessMapping> for AccessMappingNode {
    fn from(mapping: &AccessMapping) -> Self {
        AccessMappingNode {
            moniker: Some(mapping.moniker.clone()),
            access_point: Some(mapping.access_point.clone()),
            display_name: Some(mapping.display_name.clone()),
            virtual_directory: mapping.virtual_directory.clone(),
        }
    }
}

impl TryFrom<AccessMappingNode> for AccessMapping {
    type Error = DocumentError;

    fn try_from(node: AccessMappingNode) -> Result<Self, Self::Error> {
        Ok(AccessMapping {
            moniker: required(node.moniker, "Moniker", "AccessMapping")?,
            access_point: required(node.access_point, "AccessPoint", "AccessMapping")?,
            display_name: node.display_name.unwrap_or_default(),
            virtual_directory: node.virtual_directory,
        })
    }
}

impl From<&ServiceDefinition> for ServiceNode {
    fn from(definition: &ServiceDefinition) -> Self {
        let location_mappings = (definition.relative_to == RelativeTo::FullyQualified).then(|| {
            definition
                .location_mappings
                .iter()
                .map(|mapping| LocationMappingNode {
                    access_mapping: Some(mapping.access_mapping_moniker.clone()),
                    location: Some(mapping.location.clone()),
                })
                .collect()
        });

        ServiceNode {
            service_type: Some(definition.service_type.clone()),
            identifier: Some(definition.identifier),
            display_name: Some(definition.display_name.clone()),
            description: definition.description.clone(),
            relative_path: Some(RelativePathNode {
                relative_to: Some(definition.relative_to.as_str().to_string()),
                path: definition.relative_path.clone(),
            }),
            parent_service_type: definition.parent_service_type.clone(),
            parent_identifier: definition.parent_identifier,
            location_mappings,
            resource_version: (definition.resource_version > 0)
                .then_some(definition.resource_version),
            min_version: definition.min_version.clone(),
            max_version: definition.max_version.clone(),
            released_version: definition.released_version.clone(),
        }
    }
}

impl TryFrom<ServiceNode> for ServiceDefinition {
    type Error = DocumentError;

    fn try_from(node: ServiceNode) -> Result<Self, Self::Error> {
        let service_type = required(node.service_type, "ServiceType", "ServiceDefinition")?;
        let identifier = node.identifier.ok_or_else(|| {
            DocumentError::Malformed("Identifier is missing from ServiceDefinition".into())
        })?;
        let display_name = required(node.display_name, "DisplayName", "ServiceDefinition")?;

        let relative_path = node.relative_path.ok_or_else(|| {
            DocumentError::Malformed("RelativePath is missing from ServiceDefinition".into())
        })?;
        let relative_to: RelativeTo = required(relative_path.relative_to, "RelativeTo", "RelativePath")?
            .parse()
            .map_err(|value| DocumentError::Malformed(format!("unknown RelativeTo value {value}")))?;

        let mut path = relative_path.path;
        if relative_to == RelativeTo::FullyQualified && path.as_deref() == Some("") {
            path = None;
        }

        let mut location_mappings = Vec::new();
        if relative_to == RelativeTo::FullyQualified {
            for mapping in node.location_mappings.unwrap_or_default() {
                location_mappings.push(LocationMapping {
                    access_mapping_moniker: required(
                        mapping.access_mapping,
                        "AccessMapping",
                        "LocationMapping",
                    )?,
                    location: required(mapping.location, "Location", "LocationMapping")?,
                });
            }
        }

        Ok(ServiceDefinition {
            service_type,
            identifier,
            display_name,
            description: node.description,
            relative_to,
            relative_path: path,
            parent_service_type: node.parent_service_type,
            parent_identifier: node.parent_identifier,
            location_mappings,
            resource_version: node.resource_version.unwrap_or(0),
            min_version: node.min_version,
            max_version: node.max_version,
            released_version: node.released_version,
        })
    }
}

/// Stateless. Callers serialize access to the underlying file.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheDocumentCodec;

impl CacheDocumentCodec {
    pub fn encode<W: Write>(&self, writer: &mut W, state: &CacheState) -> Result<(), DocumentError> {
        let document = CacheDocument {
            last_change_id: Some(state.last_change_id),
            cache_expiration_date: Some(state.expires_at),
            default_access_mapping_moniker: Some(state.default_access_mapping_moniker.clone()),
            virtual_directory: Some(state.web_application_relative_directory.clone()),
            access_mappings: state.access_mappings.values().map(Into::into).collect(),
            services: state
                .services_by_type
                .values()
                .flat_map(|services| services.values())
                .map(Into::into)
                .collect(),
            cached_misses: state.cached_misses.iter().cloned().collect(),
        };

        serde_json::to_writer_pretty(&mut *writer, &document)?;
        writer.flush()?;
        Ok(())
    }

    pub fn decode<R: Read>(&self, reader: R) -> Result<CacheState, DocumentError> {
        let document: CacheDocument = serde_json::from_reader(reader)?;

        let mut state = CacheState {
            last_change_id: document.last_change_id.unwrap_or(UNKNOWN_CHANGE_ID),
            expires_at: document
                .cache_expiration_date
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            default_access_mapping_moniker: required(
                document.default_access_mapping_moniker,
                "DefaultAccessMappingMoniker",
                "document",
            )?,
            web_application_relative_directory: document.virtual_directory.ok_or_else(|| {
                DocumentError::Malformed("VirtualDirectory is missing from document".into())
            })?,
            ..CacheState::default()
        };

        for node in document.access_mappings {
            let mapping = AccessMapping::try_from(node)?;
            state
                .access_mappings
                .insert(fold_key(&mapping.moniker), mapping);
        }

        for node in document.services {
            state.insert_service(ServiceDefinition::try_from(node)?);
        }

        state.cached_misses.extend(document.cached_misses);

        Ok(state)
    }

    pub fn encode_to_vec(&self, state: &CacheState) -> Result<Vec<u8>, DocumentError> {
        let mut buffer = Vec::new();
        self.encode(&mut buffer, state)?;
        Ok(buffer)
    }
}
