//! Host config updates and renames.

use harbord_common::error::{HarbordError, Result};
use harbord_common::types::{ContainerStatus, ResourceLimits, RestartPolicy};

use super::Daemon;
use crate::store::normalize_name;

/// Fields an update may change. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// New restart policy.
    pub restart_policy: Option<RestartPolicy>,
    /// New resource limits, applied at the next start.
    pub resources: Option<ResourceLimits>,
}

impl Daemon {
    /// Changes the restart policy or resource limits of a container.
    ///
    /// A new policy takes effect on the live restart manager at once.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` for an invalid policy or one that
    /// contradicts auto-remove, `Conflict` for a container being removed,
    /// and the write error if `hostconfig.json` cannot be written; the
    /// previous host config is then kept.
    pub async fn update(&self, reference: &str, options: UpdateOptions) -> Result<()> {
        if let Some(policy) = &options.restart_policy {
            policy.validate()?;
        }
        let container = self.container(reference)?;
        let mut inner = container.lock().await;
        if inner.state().removal_in_progress || inner.state().status == ContainerStatus::Dead {
            return Err(HarbordError::conflict(format!(
                "container {} is marked for removal and cannot be updated",
                container.id()
            )));
        }
        if let Some(policy) = &options.restart_policy {
            if inner.host_config.auto_remove && !policy.is_none() {
                return Err(HarbordError::invalid(
                    "restart policy cannot be updated because AutoRemove is enabled for the container",
                ));
            }
        }

        let previous = inner.host_config.clone();
        if let Some(policy) = options.restart_policy {
            inner.host_config.restart_policy = policy;
        }
        if let Some(resources) = options.resources {
            inner.host_config.resources = resources;
        }
        if let Err(e) = inner.write_host_config() {
            inner.host_config = previous;
            return Err(e);
        }

        if let Some(policy) = options.restart_policy {
            if inner.state().is_active() {
                inner.update_monitor(policy);
            } else {
                inner.reset_restart_manager(false);
            }
        }
        inner.commit_in_memory(&self.views);
        tracing::info!(id = %container.id(), policy = %inner.host_config.restart_policy, "container updated");
        Ok(())
    }

    /// Renames a container.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` for an invalid or unchanged name,
    /// `NameConflict` if the name is taken, and the checkpoint error if the
    /// new name cannot be persisted; the old name is then kept.
    pub async fn rename(&self, reference: &str, new_name: &str) -> Result<()> {
        let new_name = normalize_name(new_name)?;
        let container = self.container(reference)?;
        let current = self.views.get(container.id())?.doc.name;
        if current == new_name {
            return Err(HarbordError::invalid(
                "renaming a container with the same name as its current name",
            ));
        }
        self.store.reserve_name(&new_name, container.id())?;

        let mut inner = container.lock().await;
        if inner.state().removal_in_progress {
            drop(inner);
            self.store.release_name(&new_name);
            return Err(HarbordError::conflict(format!(
                "container {} is marked for removal and cannot be renamed",
                container.id()
            )));
        }
        let old_name = std::mem::replace(&mut inner.doc.name, new_name.clone());
        if let Err(e) = container.checkpoint(&inner, &self.views) {
            inner.doc.name = old_name;
            inner.commit_in_memory(&self.views);
            drop(inner);
            self.store.release_name(&new_name);
            return Err(e);
        }
        drop(inner);
        self.store.release_name(&old_name);
        tracing::info!(id = %container.id(), old = %old_name, new = %new_name, "container renamed");
        Ok(())
    }
}
