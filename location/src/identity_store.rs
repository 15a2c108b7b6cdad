//! Remembers which server instance answers at which URL.
//!
//! One document per cache directory maps each server location to its
//! `(server_id, service_owner)`. It is shared by every process on the machine,
//! so reads are re-done whenever the file changes on disk. If the document
//! cannot be read or written the store keeps working from memory for the rest
//! of its life.

use crate::counter;
use crate::document_file::{self, WriteOutcome};
use crate::metrics_defs::DISK_FAILURE;
use crate::staleness::{ModifiedTimePoll, NeverStale, StalenessSignal};
use crate::types::{ON_PREMISES_INSTANCE_TYPE, ServerIdentity, normalize_location};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

pub const IDENTITY_FILE_NAME: &str = "LocationServerMap.json";

#[derive(thiserror::Error, Debug)]
enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IdentityDocument {
    #[serde(default)]
    servers: Vec<ServerRecord>,
}

/// An on-premises owner is written as an absent `ServiceOwner`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServerRecord {
    location: String,
    server_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    service_owner: Option<Uuid>,
}

impl ServerRecord {
    fn new(location: &str, identity: ServerIdentity) -> Self {
        let service_owner = (!identity.service_owner.is_nil()
            && identity.service_owner != ON_PREMISES_INSTANCE_TYPE)
            .then_some(identity.service_owner);

        ServerRecord {
            location: location.to_string(),
            server_id: identity.server_id,
            service_owner,
        }
    }

    fn identity(&self) -> ServerIdentity {
        ServerIdentity::new(
            self.server_id,
            self.service_owner.unwrap_or(ON_PREMISES_INSTANCE_TYPE),
        )
    }
}

struct Entry {
    location: String,
    identity: ServerIdentity,
}

#[derive(Default)]
struct StoreInner {
    /// Keyed by normalized location.
    servers: HashMap<String, Entry>,
    locally_fresh: bool,
    disk_available: bool,
}

pub struct ServerIdentityStore {
    path: Option<PathBuf>,
    staleness: Arc<dyn StalenessSignal>,
    inner: RwLock<StoreInner>,
}

impl ServerIdentityStore {
    pub fn new(cache_dir: &Path) -> Self {
        let path = cache_dir.join(IDENTITY_FILE_NAME);
        ServerIdentityStore {
            staleness: Arc::new(ModifiedTimePoll::new(path.clone())),
            path: Some(path),
            inner: RwLock::new(StoreInner {
                disk_available: true,
                ..StoreInner::default()
            }),
        }
    }

    /// A store that never touches disk.
    pub fn memory_only() -> Self {
        ServerIdentityStore {
            path: None,
            staleness: Arc::new(NeverStale),
            inner: RwLock::new(StoreInner::default()),
        }
    }

    pub fn with_staleness_signal(mut self, signal: Arc<dyn StalenessSignal>) -> Self {
        self.staleness = signal;
        self
    }

    pub fn is_disk_available(&self) -> bool {
        self.inner.read().disk_available
    }

    /// Identity last recorded for `location`. The nil identity if none.
    pub fn read_identity(&self, location: &str) -> ServerIdentity {
        self.ensure_loaded();
        self.inner
            .read()
            .servers
            .get(&normalize_location(location))
            .map(|entry| entry.identity)
            .unwrap_or_default()
    }

    /// Reverse lookup: a location recorded for the given identity.
    pub fn read_location(&self, server_id: Uuid, service_owner: Uuid) -> Option<String> {
        self.ensure_loaded();
        let wanted = ServerIdentity::new(server_id, service_owner);
        self.inner
            .read()
            .servers
            .values()
            .find(|entry| entry.identity == wanted)
            .map(|entry| entry.location.clone())
    }

    /// Records `identity` for `location`. Returns true if the mapping changed.
    pub fn ensure_mapping_exists(&self, location: &str, identity: ServerIdentity) -> bool {
        self.ensure_loaded();

        let key = normalize_location(location);
        {
            let mut inner = self.inner.write();
            if inner
                .servers
                .get(&key)
                .is_some_and(|entry| entry.identity == identity)
            {
                return false;
            }

            inner.servers.insert(
                key,
                Entry {
                    location: location.to_string(),
                    identity,
                },
            );
        }

        self.persist(location, identity);
        true
    }

    fn ensure_loaded(&self) {
        {
            let inner = self.inner.read();
            if !inner.disk_available || (inner.locally_fresh && !self.staleness.is_stale()) {
                return;
            }
        }

        let mut inner = self.inner.write();
        if !inner.disk_available {
            return;
        }
        let Some(path) = &self.path else {
            return;
        };

        let loaded = document_file::read_shared::<_, StoreError, _>(path, |reader| {
            Ok(serde_json::from_reader::<_, IdentityDocument>(reader)?)
        });

        match loaded {
            Ok(Some(document)) => {
                for record in document.servers {
                    inner.servers.insert(
                        normalize_location(&record.location),
                        Entry {
                            identity: record.identity(),
                            location: record.location,
                        },
                    );
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Server identity map unreadable, continuing in memory");
                counter!(DISK_FAILURE).increment(1);
                inner.disk_available = false;
            }
        }

        inner.locally_fresh = true;
        self.staleness.observe();
    }

    fn persist(&self, location: &str, identity: ServerIdentity) {
        if !self.is_disk_available() {
            return;
        }
        let Some(path) = &self.path else {
            return;
        };

        let written = document_file::update_exclusive::<StoreError, _>(path, |current| {
            let mut document: IdentityDocument = match current {
                Some(bytes) => serde_json::from_slice(bytes)?,
                None => IdentityDocument::default(),
            };

            let key = normalize_location(location);
            document
                .servers
                .retain(|record| normalize_location(&record.location) != key);
            document.servers.push(ServerRecord::new(location, identity));

            Ok(serde_json::to_vec_pretty(&document)?)
        });

        match written {
            Ok(WriteOutcome::Written) => self.staleness.observe(),
            Ok(WriteOutcome::Contended) => {
                tracing::debug!(path = %path.display(), "Server identity map busy, skipping write");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to write server identity map, continuing in memory");
                counter!(DISK_FAILURE).increment(1);
                self.inner.write().disk_available = false;
            }
        }
    }
}
