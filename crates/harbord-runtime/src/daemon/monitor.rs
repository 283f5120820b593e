//! Runtime events, policy restarts and daemon-start recovery.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use harbord_common::constants::LOST_TASK_EXIT_CODE;
use harbord_common::error::Result;
use harbord_common::types::{ContainerId, ContainerStatus, HealthStatus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Daemon;
use super::remove::RemoveOptions;
use crate::backend::RuntimeEvent;
use crate::container::{Container, ContainerInner};
use crate::reload::load_containers;
use crate::restart::RestartTimer;
use crate::state::ExitStatus;

impl Daemon {
    /// Applies runtime events until the sender side closes.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<RuntimeEvent>,
    ) -> JoinHandle<()> {
        let daemon = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                daemon.handle_event(event).await;
            }
            tracing::debug!("runtime event stream closed");
        })
    }

    /// Applies one runtime event.
    pub async fn handle_event(self: &Arc<Self>, event: RuntimeEvent) {
        match event {
            RuntimeEvent::Exit {
                id,
                exit_code,
                exited_at,
            } => self.handle_exit(&id, exit_code, exited_at).await,
            RuntimeEvent::Oom { id } => self.handle_oom(&id).await,
        }
    }

    async fn handle_oom(&self, id: &ContainerId) {
        let Some(container) = self.store.get(id) else {
            tracing::debug!(id = %id, "OOM event for unknown container");
            return;
        };
        let mut inner = container.lock().await;
        inner.state_mut().oom_killed = true;
        if let Err(e) = container.checkpoint(&inner, &self.views) {
            tracing::error!(id = %id, error = %e, "failed to checkpoint OOM kill");
        }
        tracing::warn!(id = %id, "container hit its memory limit");
    }

    async fn handle_exit(self: &Arc<Self>, id: &ContainerId, exit_code: i32, exited_at: DateTime<Utc>) {
        let Some(container) = self.store.get(id) else {
            tracing::debug!(id = %id, "exit event for unknown container");
            return;
        };
        let mut inner = container.lock().await;
        if !inner.state().is_running() {
            tracing::debug!(id = %id, status = %inner.state().status, "stale exit event ignored");
            return;
        }
        let exit = ExitStatus {
            exit_code,
            exited_at,
        };
        self.release_run(&container, &mut inner).await;

        inner.state_mut().set_stopped(&exit);
        if inner.state().health != HealthStatus::None {
            inner.state_mut().health = HealthStatus::Unhealthy;
        }

        let manually_restarted = inner.has_been_manually_restarted;
        let timer = if manually_restarted {
            None
        } else {
            let manager = inner.restart_manager();
            match manager.should_restart(
                exit_code,
                inner.doc.has_been_manually_stopped,
                inner.state().execution_duration(),
            ) {
                Ok(timer) => {
                    inner.doc.restart_count = manager.restart_count();
                    timer
                }
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "restart manager refused, not restarting");
                    None
                }
            }
        };
        if timer.is_some() {
            inner.state_mut().set_restarting(&exit);
        }
        if let Err(e) = container.checkpoint(&inner, &self.views) {
            tracing::error!(id = %id, error = %e, "failed to checkpoint exit");
        }
        tracing::info!(
            id = %id,
            exit_code,
            restarting = timer.is_some(),
            restart_count = inner.doc.restart_count,
            "container exited"
        );
        let auto_remove = inner.host_config.auto_remove && !manually_restarted;
        drop(inner);

        match timer {
            Some(timer) => self.schedule_restart(container, timer),
            None if auto_remove => self.spawn_auto_remove(container),
            None => {}
        }
    }

    /// Tears down what a finished run left behind: the task, the stdio and
    /// log pipeline, and the volume mounts.
    async fn release_run(&self, container: &Container, inner: &mut ContainerInner) {
        if let Some(task) = inner.take_task() {
            if let Err(e) = self.runtime_call("force_delete", task.force_delete()).await {
                tracing::warn!(id = %container.id(), error = %e, "failed to delete exited task");
            }
        }
        inner
            .reset(container.streams(), self.config.copier_drain_timeout())
            .await;
        if let Err(e) = inner.unmount_volumes(self.volumes.as_deref()).await {
            tracing::warn!(id = %container.id(), error = %e, "failed to release volumes");
        }
    }

    fn schedule_restart(self: &Arc<Self>, container: Arc<Container>, timer: RestartTimer) {
        tracing::info!(
            id = %container.id(),
            delay_ms = u64::try_from(timer.delay().as_millis()).unwrap_or(u64::MAX),
            "restart scheduled"
        );
        let daemon = Arc::clone(self);
        drop(tokio::spawn(async move {
            let fired = timer.wait().await.is_ok();
            let mut inner = container.lock().await;
            let proceed = fired
                && inner.state().is_restarting()
                && !inner.doc.has_been_manually_stopped
                && !inner.restart_manager().is_canceled();
            if !proceed {
                tracing::debug!(id = %container.id(), fired, "restart abandoned");
                if inner.state().is_restarting() {
                    inner.state_mut().cancel_restart();
                    if let Err(e) = container.checkpoint(&inner, &daemon.views) {
                        tracing::error!(id = %container.id(), error = %e, "failed to checkpoint abandoned restart");
                    }
                }
                return;
            }
            if let Err(e) = daemon.container_start(&container, &mut inner, false).await {
                tracing::error!(id = %container.id(), error = %e, "policy restart failed");
            }
        }));
    }

    fn spawn_auto_remove(self: &Arc<Self>, container: Arc<Container>) {
        let daemon = Arc::clone(self);
        drop(tokio::spawn(async move {
            let options = RemoveOptions {
                force: false,
                remove_volumes: true,
            };
            if let Err(e) = daemon.remove(container.id().as_str(), options).await {
                tracing::error!(id = %container.id(), error = %e, "auto-remove failed");
            }
        }));
    }

    /// Loads every persisted container and brings it back in line with the
    /// runtime.
    ///
    /// Containers that were running are reattached; if the runtime lost
    /// their task they are marked exited and, under `always` or
    /// `unless-stopped`, started again. Interrupted removals are finished.
    ///
    /// # Errors
    ///
    /// Returns an error only if the containers root cannot be read.
    pub async fn restore(self: &Arc<Self>) -> Result<()> {
        let loaded = load_containers(
            &self.config.containers_root(),
            &self.store,
            &self.views,
            self.config.restart_backoff,
        )?;
        for container in loaded {
            self.restore_container(&container).await;
        }
        Ok(())
    }

    async fn restore_container(&self, container: &Arc<Container>) {
        let mut inner = container.lock().await;
        let status = inner.state().status;
        if status == ContainerStatus::Removing || inner.state().removal_in_progress {
            inner.state_mut().reset_removal_in_progress();
            if let Err(e) = self.finish_removal(container, inner, false).await {
                tracing::error!(id = %container.id(), error = %e, "failed to finish interrupted removal");
            }
            return;
        }

        let lost = match status {
            ContainerStatus::Running | ContainerStatus::Paused => {
                match self.reattach(container, &mut inner).await {
                    Ok(()) => false,
                    Err(e) => {
                        tracing::warn!(id = %container.id(), error = %e, "task lost while the daemon was down");
                        inner
                            .state_mut()
                            .set_stopped(&ExitStatus::now(LOST_TASK_EXIT_CODE));
                        true
                    }
                }
            }
            ContainerStatus::Restarting => {
                inner.state_mut().cancel_restart();
                true
            }
            _ => false,
        };
        if !lost {
            return;
        }
        if let Err(e) = container.checkpoint(&inner, &self.views) {
            tracing::error!(id = %container.id(), error = %e, "failed to checkpoint restored container");
        }
        if inner.should_restart_on_daemon_start() {
            tracing::info!(id = %container.id(), "restarting container after daemon start");
            if let Err(e) = self.container_start(container, &mut inner, true).await {
                tracing::error!(id = %container.id(), error = %e, "failed to restart container after daemon start");
            }
        }
    }

    async fn reattach(&self, container: &Container, inner: &mut ContainerInner) -> Result<()> {
        let handle = self
            .runtime_call("load_container", self.runtime.load_container(container.id()))
            .await?;
        let (task, io) = self
            .runtime_call("attach_task", handle.attach_task())
            .await?;
        inner.set_task(&task);
        if let Err(e) = inner.start_logging(&self.log_drivers, container.streams()) {
            tracing::warn!(id = %container.id(), error = %e, "logging not restored");
        }
        container.streams().copy_to_pipe(io);
        inner.commit_in_memory(&self.views);
        tracing::info!(id = %container.id(), pid = task.pid(), "container reattached");
        Ok(())
    }
}
