//! Container lifecycle state machine.
//!
//! [`State`] is the serializable runtime state of a container. It carries no
//! lock of its own: it lives inside the container's document and every
//! transition happens while the container lock is held.

use std::time::Duration;

use chrono::{DateTime, Utc};
use harbord_common::error::{HarbordError, Result};
use harbord_common::types::{ContainerId, ContainerStatus, HealthStatus};
use serde::{Deserialize, Serialize};

/// How and when a task exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Process exit code.
    pub exit_code: i32,
    /// Time the runtime observed the exit.
    pub exited_at: DateTime<Utc>,
}

impl ExitStatus {
    /// Builds an exit status stamped with the current time.
    #[must_use]
    pub fn now(exit_code: i32) -> Self {
        Self {
            exit_code,
            exited_at: Utc::now(),
        }
    }
}

/// Mutable runtime state of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct State {
    /// Current lifecycle phase.
    pub status: ContainerStatus,
    /// PID of the task's init process; 0 when no task is alive.
    pub pid: u32,
    /// Exit code of the last run.
    pub exit_code: i32,
    /// Last start or removal error.
    pub error: String,
    /// Start of the last run.
    pub started_at: Option<DateTime<Utc>>,
    /// End of the last run.
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether the last run was killed by the OOM killer.
    #[serde(rename = "OOMKilled")]
    pub oom_killed: bool,
    /// Health sub-status.
    pub health: HealthStatus,
    /// Set while a removal holds the container.
    pub removal_in_progress: bool,
}

impl State {
    /// Returns `true` while a task is alive (running or paused).
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.status.has_task()
    }

    /// Returns `true` while the task is frozen.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.status == ContainerStatus::Paused
    }

    /// Returns `true` while a policy restart is pending.
    #[must_use]
    pub fn is_restarting(&self) -> bool {
        self.status == ContainerStatus::Restarting
    }

    /// Returns `true` if the container is alive or about to be.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self.status,
            ContainerStatus::Running | ContainerStatus::Paused | ContainerStatus::Restarting
        )
    }

    /// Marks the task as started.
    pub fn set_running(&mut self, pid: u32, started_at: DateTime<Utc>) {
        self.status = ContainerStatus::Running;
        self.pid = pid;
        self.exit_code = 0;
        self.error.clear();
        self.oom_killed = false;
        self.started_at = Some(started_at);
    }

    /// Records a task exit.
    pub fn set_stopped(&mut self, exit: &ExitStatus) {
        self.status = ContainerStatus::Exited;
        self.pid = 0;
        self.exit_code = exit.exit_code;
        self.finished_at = Some(exit.exited_at);
    }

    /// Records a task exit that the restart policy will follow up on.
    pub fn set_restarting(&mut self, exit: &ExitStatus) {
        self.set_stopped(exit);
        self.status = ContainerStatus::Restarting;
    }

    /// Abandons a pending restart, keeping the exit of the last run.
    pub fn cancel_restart(&mut self) {
        if self.status == ContainerStatus::Restarting {
            self.status = ContainerStatus::Exited;
        }
    }

    /// Records a start attempt that failed before the task ran.
    ///
    /// A container that never ran stays `created`.
    pub fn set_start_failed(&mut self, exit_code: i32, error: impl Into<String>) {
        self.status = if self.started_at.is_some() {
            ContainerStatus::Exited
        } else {
            ContainerStatus::Created
        };
        self.pid = 0;
        self.exit_code = exit_code;
        self.error = error.into();
        if self.started_at.is_some() {
            self.finished_at = Some(Utc::now());
        }
    }

    /// Freezes the task.
    pub fn set_paused(&mut self) {
        self.status = ContainerStatus::Paused;
    }

    /// Thaws the task.
    pub fn set_unpaused(&mut self) {
        self.status = ContainerStatus::Running;
    }

    /// Claims the container for removal.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if another removal already holds it.
    pub fn set_removal_in_progress(&mut self, id: &ContainerId) -> Result<()> {
        if self.removal_in_progress {
            return Err(HarbordError::conflict(format!(
                "removal of container {id} is already in progress"
            )));
        }
        self.removal_in_progress = true;
        Ok(())
    }

    /// Releases a removal claim.
    pub fn reset_removal_in_progress(&mut self) {
        self.removal_in_progress = false;
    }

    /// Enters the `removing` phase.
    pub fn set_removing(&mut self) {
        self.status = ContainerStatus::Removing;
    }

    /// Marks the container dead after an unrecoverable failure.
    pub fn set_dead(&mut self, error: impl Into<String>) {
        self.status = ContainerStatus::Dead;
        self.pid = 0;
        self.error = error.into();
    }

    /// Records an error without changing phase.
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = error.into();
    }

    /// How long the last run lasted; zero when it never finished.
    #[must_use]
    pub fn execution_duration(&self) -> Duration {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    /// Checks that a start request is allowed in the current phase.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` naming the blocking phase.
    pub fn check_startable(&self, id: &ContainerId) -> Result<()> {
        if self.removal_in_progress || self.status == ContainerStatus::Removing {
            return Err(HarbordError::conflict(format!(
                "container {id} is marked for removal and cannot be started"
            )));
        }
        match self.status {
            ContainerStatus::Paused => Err(HarbordError::conflict(format!(
                "cannot start a paused container {id}, try unpause instead"
            ))),
            ContainerStatus::Running => Err(HarbordError::conflict(format!(
                "container {id} is already running"
            ))),
            ContainerStatus::Dead => Err(HarbordError::conflict(format!(
                "container {id} is marked for removal and cannot be started"
            ))),
            _ => Ok(()),
        }
    }

    /// Short human summary, e.g. `Up`, `Exited (1)`, `Restarting (1)`.
    #[must_use]
    pub fn summary(&self) -> String {
        match self.status {
            ContainerStatus::Created => "Created".into(),
            ContainerStatus::Running if self.health == HealthStatus::None => "Up".into(),
            ContainerStatus::Running => format!("Up ({})", self.health),
            ContainerStatus::Paused => "Up (Paused)".into(),
            ContainerStatus::Restarting => format!("Restarting ({})", self.exit_code),
            ContainerStatus::Removing => "Removal In Progress".into(),
            ContainerStatus::Exited => format!("Exited ({})", self.exit_code),
            ContainerStatus::Dead => "Dead".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn id() -> ContainerId {
        ContainerId::new("abc")
    }

    #[test]
    fn run_then_exit_records_timestamps() {
        let mut state = State::default();
        let start = Utc::now();
        state.set_running(42, start);
        assert!(state.is_running());
        assert_eq!(state.pid, 42);

        let exit = ExitStatus {
            exit_code: 3,
            exited_at: start + TimeDelta::seconds(5),
        };
        state.set_stopped(&exit);
        assert_eq!(state.status, ContainerStatus::Exited);
        assert_eq!(state.pid, 0);
        assert_eq!(state.exit_code, 3);
        assert_eq!(state.execution_duration(), Duration::from_secs(5));
    }

    #[test]
    fn restart_can_be_abandoned() {
        let mut state = State::default();
        state.set_running(1, Utc::now());
        state.set_restarting(&ExitStatus::now(1));
        assert!(state.is_restarting());
        assert!(state.is_active());
        state.cancel_restart();
        assert_eq!(state.status, ContainerStatus::Exited);
        assert_eq!(state.exit_code, 1);
    }

    #[test]
    fn failed_first_start_stays_created() {
        let mut state = State::default();
        state.set_start_failed(128, "boom");
        assert_eq!(state.status, ContainerStatus::Created);
        assert_eq!(state.exit_code, 128);

        state.set_running(7, Utc::now());
        state.set_stopped(&ExitStatus::now(0));
        state.set_start_failed(128, "boom again");
        assert_eq!(state.status, ContainerStatus::Exited);
        assert_eq!(state.error, "boom again");
    }

    #[test]
    fn removal_claim_is_exclusive() {
        let mut state = State::default();
        state.set_removal_in_progress(&id()).unwrap();
        let err = state.set_removal_in_progress(&id()).unwrap_err();
        assert_eq!(err.kind(), harbord_common::error::ErrorKind::Conflict);
        assert!(state.check_startable(&id()).is_err());
        state.reset_removal_in_progress();
        assert!(state.check_startable(&id()).is_ok());
    }

    #[test]
    fn start_is_rejected_for_live_phases() {
        let mut state = State::default();
        state.set_running(1, Utc::now());
        assert!(state.check_startable(&id()).is_err());
        state.set_paused();
        let err = state.check_startable(&id()).unwrap_err();
        assert!(err.to_string().contains("unpause"));
    }

    #[test]
    fn serializes_with_pascal_case_field_names() {
        let mut state = State::default();
        state.oom_killed = true;
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["OOMKilled"], true);
        assert_eq!(json["Status"], "created");
        let back: State = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
