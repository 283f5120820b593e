//! Container removal.

use std::sync::Arc;

use harbord_common::error::{HarbordError, Result};

use super::{Daemon, wait_status};
use crate::container::{Container, ContainerInner};
use crate::signal::Signal;

/// Parameters of a remove request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Kill a running container instead of refusing.
    pub force: bool,
    /// Also delete the container's named volumes.
    pub remove_volumes: bool,
}

impl Daemon {
    /// Removes a container: its directory, its name, and its entries in the
    /// store and the view.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` for an active container without `force` or a
    /// removal already in progress. If the directory cannot be deleted the
    /// container is marked `dead` and a `System` error is returned.
    pub async fn remove(&self, reference: &str, options: RemoveOptions) -> Result<()> {
        let container = self.container(reference)?;
        let mut rx = container.subscribe();
        let must_wait = {
            let mut inner = container.lock().await;
            if inner.state().is_active() && !options.force {
                return Err(HarbordError::conflict(format!(
                    "cannot remove container {}: container is {}, stop the container before removing or force remove",
                    container.id(),
                    inner.state().status
                )));
            }
            inner.state_mut().set_removal_in_progress(container.id())?;
            if inner.state().is_restarting() {
                self.cancel_restart(&container, &mut inner);
                false
            } else if inner.state().is_running() {
                if let Err(e) = self.kill_locked(&container, &mut inner, Signal::SIGKILL).await {
                    inner.state_mut().reset_removal_in_progress();
                    inner.commit_in_memory(&self.views);
                    return Err(e);
                }
                true
            } else {
                false
            }
        };

        if must_wait
            && !wait_status(&mut rx, Some(self.config.runtime_timeout()), |event| {
                event.is_stopped()
            })
            .await
        {
            let mut inner = container.lock().await;
            inner.state_mut().reset_removal_in_progress();
            inner.commit_in_memory(&self.views);
            return Err(HarbordError::system(format!(
                "could not kill running container {}, cannot remove",
                container.id()
            )));
        }

        let inner = container.lock().await;
        self.finish_removal(&container, inner, options.remove_volumes)
            .await
    }

    /// Deletes a stopped container whose lock the caller holds, consuming
    /// the lock.
    pub(super) async fn finish_removal(
        &self,
        container: &Arc<Container>,
        mut inner: tokio::sync::MutexGuard<'_, ContainerInner>,
        remove_volumes: bool,
    ) -> Result<()> {
        inner.state_mut().set_removing();
        if let Err(e) = container.checkpoint(&inner, &self.views) {
            tracing::warn!(id = %container.id(), error = %e, "failed to checkpoint removal");
        }
        if let Err(e) = inner.unmount_volumes(self.volumes.as_deref()).await {
            tracing::warn!(id = %container.id(), error = %e, "failed to release volumes");
        }

        if let Err(e) = std::fs::remove_dir_all(inner.root()) {
            let error = HarbordError::io(inner.root(), e);
            tracing::error!(id = %container.id(), error = %error, "failed to remove container directory");
            inner
                .state_mut()
                .set_dead(error.redacted(container.id().as_str()));
            inner.state_mut().reset_removal_in_progress();
            inner.commit_in_memory(&self.views);
            container.publish(inner.state());
            return Err(error);
        }

        let name = inner.name().to_string();
        let volumes = inner.volumes();
        drop(inner);

        self.views.delete(container.id());
        self.store.release_name(&name);
        self.store.delete(container.id());

        if remove_volumes {
            if let Some(driver) = &self.volumes {
                for volume in volumes {
                    if let Err(e) = driver.remove(&volume).await {
                        tracing::warn!(id = %container.id(), volume = %volume, error = %e, "failed to remove volume");
                    }
                }
            }
        }
        tracing::info!(id = %container.id(), name = %name, "container removed");
        Ok(())
    }
}
