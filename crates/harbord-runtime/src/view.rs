//! Read-only snapshots of containers for inspect and list.
//!
//! Readers never take a container lock; they see the last checkpointed
//! snapshot instead.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use harbord_common::error::{HarbordError, Result};
use harbord_common::types::ContainerId;
use serde::{Deserialize, Serialize};

use crate::container::{ContainerDoc, HostConfig};

/// Deep copy of a container's persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    /// The container document.
    #[serde(flatten)]
    pub doc: ContainerDoc,
    /// Its host configuration.
    #[serde(rename = "HostConfig")]
    pub host_config: HostConfig,
}

/// Snapshot store keyed by container ID.
#[derive(Debug, Default)]
pub struct ViewDb {
    snapshots: RwLock<HashMap<ContainerId, ContainerSnapshot>>,
}

impl ViewDb {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the snapshot of a container.
    pub fn save(&self, snapshot: ContainerSnapshot) {
        let _ = self
            .snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snapshot.doc.id.clone(), snapshot);
    }

    /// Drops the snapshot of a container.
    pub fn delete(&self, id: &ContainerId) {
        let _ = self
            .snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Returns the snapshot of a container.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no snapshot exists.
    pub fn get(&self, id: &ContainerId) -> Result<ContainerSnapshot> {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| HarbordError::no_such_container(id.as_str()))
    }

    /// All snapshots, newest first.
    #[must_use]
    pub fn list(&self) -> Vec<ContainerSnapshot> {
        let mut all: Vec<ContainerSnapshot> = self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| {
            b.doc
                .created
                .cmp(&a.doc.created)
                .then_with(|| a.doc.id.cmp(&b.doc.id))
        });
        all
    }
}
