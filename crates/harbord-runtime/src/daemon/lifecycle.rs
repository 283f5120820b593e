//! Start, stop, kill, restart, pause and wait.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use harbord_common::constants::START_FAILURE_EXIT_CODE;
use harbord_common::error::{HarbordError, Result};
use harbord_common::types::{ContainerStatus, HealthStatus};

use super::{Daemon, stop_wait, wait_status};
use crate::container::{Container, ContainerInner};
use crate::signal::Signal;
use crate::state::ExitStatus;

/// What [`Daemon::wait`] waits for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WaitCondition {
    /// Resolve as soon as the container is not running, possibly at once.
    #[default]
    NotRunning,
    /// Resolve on the next exit, even if the container is stopped now.
    NextExit,
}

impl Daemon {
    /// Starts a created or exited container.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the phase forbids starting, and the underlying
    /// error if the start failed; the container is then left `created` or
    /// `exited` with the error recorded.
    pub async fn start(&self, reference: &str) -> Result<()> {
        let container = self.container(reference)?;
        let mut inner = container.lock().await;
        inner.state().check_startable(container.id())?;
        self.container_start(&container, &mut inner, true).await
    }

    /// Starts a container whose lock the caller holds.
    ///
    /// `reset` marks an explicit start: the restart manager and counter are
    /// reset and the manual stop flag cleared. Policy restarts pass `false`.
    pub(super) async fn container_start(
        &self,
        container: &Container,
        inner: &mut ContainerInner,
        reset: bool,
    ) -> Result<()> {
        if reset {
            inner.reset_restart_manager(true);
            inner.doc.has_been_manually_stopped = false;
        }
        match self.start_task(container, inner).await {
            Ok(pid) => {
                inner.state_mut().set_running(pid, Utc::now());
                inner.state_mut().health = inner.initial_health();
                inner.doc.has_been_started_before = true;
                inner.has_been_manually_restarted = false;
                if let Err(e) = container.checkpoint(inner, &self.views) {
                    tracing::error!(id = %container.id(), error = %e, "failed to checkpoint started container");
                }
                tracing::info!(id = %container.id(), pid, restart_count = inner.doc.restart_count, "container started");
                Ok(())
            }
            Err(e) => {
                tracing::error!(id = %container.id(), error = %e, "failed to start container");
                if let Some(task) = inner.take_task() {
                    if let Err(cleanup) = self.runtime_call("force_delete", task.force_delete()).await {
                        tracing::warn!(id = %container.id(), error = %cleanup, "failed to delete orphaned task");
                    }
                }
                if let Err(cleanup) = inner.unmount_volumes(self.volumes.as_deref()).await {
                    tracing::warn!(id = %container.id(), error = %cleanup, "failed to release volumes");
                }
                inner
                    .reset(container.streams(), self.config.copier_drain_timeout())
                    .await;
                let exit_code = if inner.state().exit_code == 0 {
                    START_FAILURE_EXIT_CODE
                } else {
                    inner.state().exit_code
                };
                inner
                    .state_mut()
                    .set_start_failed(exit_code, e.redacted(container.id().as_str()));
                if let Err(persist) = container.checkpoint(inner, &self.views) {
                    tracing::error!(id = %container.id(), error = %persist, "failed to checkpoint failed start");
                }
                Err(e)
            }
        }
    }

    async fn start_task(&self, container: &Container, inner: &mut ContainerInner) -> Result<u32> {
        let secret_mounts = inner.setup_secret_mounts(self.secrets.as_deref()).await?;
        inner.mount_volumes(self.volumes.as_deref()).await?;
        inner.start_logging(&self.log_drivers, container.streams())?;

        let spec = inner.task_spec(secret_mounts);
        let (task, io) = self
            .runtime_call("create_task", self.runtime.create_task(container.id(), &spec))
            .await?;
        inner.set_task(&task);
        container.streams().copy_to_pipe(io);
        self.runtime_call("start", task.start()).await
    }

    /// Stops a container: the stop signal first, `SIGKILL` after `timeout`
    /// seconds. `None` uses the container's or the daemon's default; a
    /// negative timeout waits forever.
    ///
    /// Stopping a restarting container cancels the pending restart. Stopping
    /// a container that is not running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the signals cannot be delivered or the task does
    /// not exit even after `SIGKILL`.
    pub async fn stop(&self, reference: &str, timeout: Option<i64>) -> Result<()> {
        let container = self.container(reference)?;
        self.container_stop(&container, timeout).await
    }

    pub(super) async fn container_stop(
        &self,
        container: &Arc<Container>,
        timeout: Option<i64>,
    ) -> Result<()> {
        let mut rx = container.subscribe();
        let wait = {
            let mut inner = container.lock().await;
            if inner.state().is_restarting() {
                self.cancel_restart(container, &mut inner);
                return Ok(());
            }
            if !inner.state().is_running() {
                tracing::debug!(id = %container.id(), "stop on a container that is not running");
                return Ok(());
            }
            let wait = timeout.unwrap_or_else(|| {
                inner.stop_timeout(self.config.default_stop_timeout_secs)
            });
            let signal = inner.stop_signal();
            match self.kill_locked(container, &mut inner, signal).await {
                Ok(()) => stop_wait(wait),
                Err(e) => {
                    tracing::warn!(id = %container.id(), %signal, error = %e, "failed to send stop signal");
                    Some(Duration::ZERO)
                }
            }
        };

        if wait_status(&mut rx, wait, |event| event.is_stopped()).await {
            return Ok(());
        }
        tracing::info!(id = %container.id(), "container did not exit in time, killing");
        {
            let mut inner = container.lock().await;
            if !inner.state().is_running() {
                return Ok(());
            }
            self.kill_locked(container, &mut inner, Signal::SIGKILL).await?;
        }
        if wait_status(&mut rx, Some(self.config.runtime_timeout()), |event| {
            event.is_stopped()
        })
        .await
        {
            Ok(())
        } else {
            Err(HarbordError::system(format!(
                "container {} did not exit after SIGKILL",
                container.id()
            )))
        }
    }

    /// Abandons a pending policy restart, leaving the container exited.
    pub(super) fn cancel_restart(&self, container: &Container, inner: &mut ContainerInner) {
        inner.doc.has_been_manually_stopped = true;
        inner.exit_on_next();
        inner.state_mut().cancel_restart();
        if let Err(e) = container.checkpoint(inner, &self.views) {
            tracing::error!(id = %container.id(), error = %e, "failed to checkpoint canceled restart");
        }
        tracing::info!(id = %container.id(), "pending restart canceled");
    }

    /// Sends a signal to a running container.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the container is not running.
    pub async fn kill(&self, reference: &str, signal: Signal) -> Result<()> {
        let container = self.container(reference)?;
        let mut inner = container.lock().await;
        if inner.state().is_restarting() {
            self.cancel_restart(&container, &mut inner);
            return Ok(());
        }
        if !inner.state().is_running() {
            return Err(HarbordError::conflict(format!(
                "container {} is not running",
                container.id()
            )));
        }
        self.kill_locked(&container, &mut inner, signal).await
    }

    /// Delivers `signal` to the task of a running container whose lock the
    /// caller holds.
    pub(super) async fn kill_locked(
        &self,
        container: &Container,
        inner: &mut ContainerInner,
        signal: Signal,
    ) -> Result<()> {
        inner.doc.has_been_manually_stopped = true;
        if signal == Signal::SIGKILL || signal == inner.stop_signal() {
            inner.exit_on_next();
        }
        if let Err(e) = container.checkpoint(inner, &self.views) {
            tracing::error!(id = %container.id(), error = %e, "failed to checkpoint manual stop");
        }

        let task = inner.running_task()?;
        match self.runtime_call("kill", task.kill(signal)).await {
            Ok(()) => tracing::info!(id = %container.id(), %signal, "signal sent"),
            Err(e) if e.is_not_found() => {
                tracing::debug!(id = %container.id(), %signal, "process already exited");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if inner.state().is_paused() {
            self.runtime_call("resume", task.resume()).await?;
            inner.state_mut().set_unpaused();
            container.publish(inner.state());
        }
        Ok(())
    }

    /// Stops then starts a container. The exit this causes is never treated
    /// as a policy exit.
    ///
    /// # Errors
    ///
    /// Returns the stop or start error.
    pub async fn restart(&self, reference: &str, timeout: Option<i64>) -> Result<()> {
        let container = self.container(reference)?;
        {
            let mut inner = container.lock().await;
            if inner.state().is_running() {
                inner.has_been_manually_restarted = true;
            }
        }
        self.container_stop(&container, timeout).await?;

        let mut inner = container.lock().await;
        inner.state().check_startable(container.id())?;
        self.container_start(&container, &mut inner, true).await
    }

    /// Freezes a running container.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` unless the container is running and not paused.
    pub async fn pause(&self, reference: &str) -> Result<()> {
        let container = self.container(reference)?;
        let mut inner = container.lock().await;
        if inner.state().is_paused() {
            return Err(HarbordError::conflict(format!(
                "container {} is already paused",
                container.id()
            )));
        }
        let task = inner.running_task()?;
        self.runtime_call("pause", task.pause()).await?;
        inner.state_mut().set_paused();
        container.checkpoint(&inner, &self.views)?;
        tracing::info!(id = %container.id(), "container paused");
        Ok(())
    }

    /// Thaws a paused container.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` unless the container is paused.
    pub async fn unpause(&self, reference: &str) -> Result<()> {
        let container = self.container(reference)?;
        let mut inner = container.lock().await;
        if !inner.state().is_paused() {
            return Err(HarbordError::conflict(format!(
                "container {} is not paused",
                container.id()
            )));
        }
        let task = inner.running_task()?;
        self.runtime_call("resume", task.resume()).await?;
        inner.state_mut().set_unpaused();
        container.checkpoint(&inner, &self.views)?;
        tracing::info!(id = %container.id(), "container unpaused");
        Ok(())
    }

    /// Waits for a container to stop and returns how its last run ended.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `Ambiguous` if the reference does not resolve.
    pub async fn wait(&self, reference: &str, condition: WaitCondition) -> Result<ExitStatus> {
        let container = self.container(reference)?;
        let mut rx = container.subscribe();
        let last_exit = rx.borrow().finished_at;
        let _ = match condition {
            WaitCondition::NotRunning => {
                wait_status(&mut rx, None, |event| event.is_stopped()).await
            }
            WaitCondition::NextExit => {
                wait_status(&mut rx, None, |event| {
                    matches!(event.status, ContainerStatus::Removing | ContainerStatus::Dead)
                        || (event.finished_at != last_exit && !event.status.has_task())
                })
                .await
            }
        };
        let event = container.status();
        Ok(ExitStatus {
            exit_code: event.exit_code,
            exited_at: event.finished_at.unwrap_or_else(Utc::now),
        })
    }

    /// Records the health sub-status reported by a prober.
    ///
    /// The value is transient: it is published to the view but not written
    /// to disk.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the container is not running.
    pub async fn set_health(&self, reference: &str, health: HealthStatus) -> Result<()> {
        let container = self.container(reference)?;
        let mut inner = container.lock().await;
        if !inner.state().is_running() {
            return Err(HarbordError::conflict(format!(
                "container {} is not running",
                container.id()
            )));
        }
        if inner.state().health != health {
            tracing::debug!(id = %container.id(), %health, "health changed");
        }
        inner.state_mut().health = health;
        inner.commit_in_memory(&self.views);
        Ok(())
    }
}
