//! In-memory registry of live containers and the name reservations.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use harbord_common::error::{HarbordError, Result};
use harbord_common::types::ContainerId;

use crate::container::Container;

#[derive(Debug, Default)]
struct Registry {
    containers: HashMap<ContainerId, Arc<Container>>,
    names: HashMap<String, ContainerId>,
}

/// Maps IDs and names to containers.
///
/// The registry lock is never held while a container lock is taken.
#[derive(Debug, Default)]
pub struct Store {
    registry: RwLock<Registry>,
}

/// Strips the leading `/` and checks the name's alphabet.
///
/// # Errors
///
/// Returns `InvalidParameter` for names outside `[a-zA-Z0-9][a-zA-Z0-9_.-]+`.
pub fn normalize_name(name: &str) -> Result<String> {
    let trimmed = name.strip_prefix('/').unwrap_or(name);
    let mut chars = trimmed.chars();
    let valid = trimmed.len() >= 2
        && chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(trimmed.to_string())
    } else {
        Err(HarbordError::invalid(format!(
            "invalid container name ({name}), only [a-zA-Z0-9][a-zA-Z0-9_.-] are allowed"
        )))
    }
}

impl Store {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a container.
    pub fn add(&self, container: Arc<Container>) {
        let _ = self
            .write()
            .containers
            .insert(container.id().clone(), container);
    }

    /// Looks up a container by full ID.
    #[must_use]
    pub fn get(&self, id: &ContainerId) -> Option<Arc<Container>> {
        self.read().containers.get(id).cloned()
    }

    /// Unregisters a container.
    pub fn delete(&self, id: &ContainerId) {
        let _ = self.write().containers.remove(id);
    }

    /// Every registered container.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<Container>> {
        self.read().containers.values().cloned().collect()
    }

    /// Number of registered containers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.read().containers.len()
    }

    /// Reserves `name` for `id`. Reserving a name twice for the same ID is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns `NameConflict` if another container holds the name.
    pub fn reserve_name(&self, name: &str, id: &ContainerId) -> Result<()> {
        let mut registry = self.write();
        match registry.names.get(name) {
            Some(holder) if holder == id => Ok(()),
            Some(holder) => Err(HarbordError::NameConflict {
                name: name.to_string(),
                holder: holder.to_string(),
            }),
            None => {
                let _ = registry.names.insert(name.to_string(), id.clone());
                Ok(())
            }
        }
    }

    /// Releases a name reservation.
    pub fn release_name(&self, name: &str) {
        let _ = self.write().names.remove(name);
    }

    /// Looks up a container by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the name is not reserved or its holder is gone.
    pub fn get_by_name(&self, name: &str) -> Result<Arc<Container>> {
        let name = name.strip_prefix('/').unwrap_or(name);
        let registry = self.read();
        registry
            .names
            .get(name)
            .and_then(|id| registry.containers.get(id))
            .cloned()
            .ok_or_else(|| HarbordError::no_such_container(name))
    }

    /// Looks up a container by unique ID prefix.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` for an empty prefix, `NotFound` without
    /// matches and `Ambiguous` with more than one.
    pub fn get_by_prefix(&self, prefix: &str) -> Result<Arc<Container>> {
        if prefix.is_empty() {
            return Err(HarbordError::invalid("prefix can't be empty"));
        }
        let registry = self.read();
        let mut matches = registry
            .containers
            .iter()
            .filter(|(id, _)| id.as_str().starts_with(prefix))
            .map(|(_, container)| container);
        match (matches.next(), matches.count()) {
            (None, _) => Err(HarbordError::no_such_container(prefix)),
            (Some(container), 0) => Ok(Arc::clone(container)),
            (Some(_), rest) => Err(HarbordError::Ambiguous {
                prefix: prefix.to_string(),
                matches: rest + 1,
            }),
        }
    }

    /// Resolves a user reference: full ID, then name, then ID prefix.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `Ambiguous` if nothing resolves uniquely.
    pub fn resolve(&self, reference: &str) -> Result<Arc<Container>> {
        if reference.is_empty() {
            return Err(HarbordError::invalid("container reference can't be empty"));
        }
        if let Some(container) = self.get(&ContainerId::new(reference)) {
            return Ok(container);
        }
        match self.get_by_name(reference) {
            Ok(container) => Ok(container),
            Err(e) if e.is_not_found() => self.get_by_prefix(reference),
            Err(e) => Err(e),
        }
    }
}
