//! Collaborator interfaces: the container runtime and image store.
//!
//! The lifecycle core never spawns processes itself. It hands a
//! [`TaskSpec`] to a [`Runtime`] and drives the returned [`Task`]; exits and
//! OOM kills come back asynchronously as [`RuntimeEvent`]s.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harbord_common::error::{HarbordError, Result};
use harbord_common::types::{ContainerId, ImageId, Platform, ResourceLimits};

use crate::signal::Signal;
use crate::stats::ResourceUsage;
use crate::stream::ProcessIo;

/// A filesystem mount handed to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Host path.
    pub source: PathBuf,
    /// Absolute path inside the container.
    pub destination: PathBuf,
    /// Mount read-only.
    pub read_only: bool,
}

/// Everything the runtime needs to create a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSpec {
    /// Executable and arguments.
    pub args: Vec<String>,
    /// Environment in `KEY=value` form.
    pub env: Vec<String>,
    /// Working directory.
    pub working_dir: String,
    /// Hostname inside the container.
    pub hostname: String,
    /// User to run as.
    pub user: String,
    /// Allocate a terminal.
    pub tty: bool,
    /// Keep stdin open.
    pub open_stdin: bool,
    /// Mounts, including materialized secrets and configs.
    pub mounts: Vec<MountSpec>,
    /// Resource limits.
    pub resources: ResourceLimits,
}

/// A process tree managed by the runtime.
///
/// The runtime owns tasks; the lifecycle core only keeps weak handles and
/// resolves them on use. A task handle stays valid until it is force-deleted.
#[async_trait]
pub trait Task: Send + Sync {
    /// ID of the container this task belongs to.
    fn id(&self) -> &ContainerId;

    /// PID of the init process; 0 before start.
    fn pid(&self) -> u32;

    /// Starts the created task, returning its PID.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started.
    async fn start(&self) -> Result<u32>;

    /// Sends a signal to the init process.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    async fn kill(&self, signal: Signal) -> Result<()>;

    /// Freezes the task.
    ///
    /// # Errors
    ///
    /// Returns an error if the task cannot be frozen.
    async fn pause(&self) -> Result<()>;

    /// Thaws the task.
    ///
    /// # Errors
    ///
    /// Returns an error if the task cannot be thawed.
    async fn resume(&self) -> Result<()>;

    /// Deletes the task regardless of its state.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime failed to clean up.
    async fn force_delete(&self) -> Result<()>;

    /// Samples resource usage.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the task is not running.
    async fn stats(&self) -> Result<ResourceUsage>;
}

/// A runtime-side container that survived a daemon restart.
#[async_trait]
pub trait ContainerHandle: Send + Sync {
    /// Reconnects to the container's live task and its stdio.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the task no longer exists.
    async fn attach_task(&self) -> Result<(Arc<dyn Task>, ProcessIo)>;
}

/// The low-level container runtime.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Creates a task for a container. The task is not started.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime rejects the spec.
    async fn create_task(
        &self,
        id: &ContainerId,
        spec: &TaskSpec,
    ) -> Result<(Arc<dyn Task>, ProcessIo)>;

    /// Looks up a container the runtime already knows about.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the runtime has no such container.
    async fn load_container(&self, id: &ContainerId) -> Result<Arc<dyn ContainerHandle>>;
}

/// Asynchronous notifications from the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// A task's init process exited.
    Exit {
        /// Container whose task exited.
        id: ContainerId,
        /// Exit code of the init process.
        exit_code: i32,
        /// Time the runtime observed the exit.
        exited_at: DateTime<Utc>,
    },
    /// The kernel OOM killer hit a task.
    Oom {
        /// Affected container.
        id: ContainerId,
    },
}

/// Result of an image lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Resolved image ID.
    pub id: ImageId,
    /// Platform the image was built for.
    pub platform: Platform,
}

/// Image store collaborator.
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Resolves an image reference.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the image does not exist.
    async fn resolve(&self, reference: &str) -> Result<ImageInfo>;
}

/// Runs a runtime call under a deadline.
///
/// # Errors
///
/// Returns the call's own error, or `System` if the deadline passed first.
pub async fn with_deadline<T>(
    timeout: Duration,
    operation: &str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(HarbordError::system(format!(
            "runtime call {operation} did not complete within {}s",
            timeout.as_secs_f64()
        ))),
    }
}
