//! The container record and its lock.
//!
//! A [`Container`] pairs an immutable identity with a [`ContainerInner`]
//! behind an async mutex. Everything mutable (state, host config, the log
//! pipeline, the restart manager and the task handle) lives in the inner
//! record, so holding the lock is both necessary and sufficient to read or
//! change it. Persistence (see [`crate::persist`]) also runs under the lock.

use std::collections::{BTreeMap, HashMap};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use harbord_common::config::BackoffConfig;
use harbord_common::constants::{
    CHECKPOINTS_DIR, CONFIG_FILE_NAME, CONTAINER_DIR_MODE, DEFAULT_PATH_ENV,
    HOST_CONFIG_FILE_NAME, MOUNTS_DIR,
};
use harbord_common::error::{HarbordError, Result};
use harbord_common::types::{
    ContainerId, ContainerStatus, HealthStatus, ImageId, LogConfig, Platform, ResourceLimits,
    RestartPolicy,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, watch};

use crate::backend::{MountSpec, Task, TaskSpec};
use crate::logs::cache::{CachingLogger, LocalLogCacheMeta, cache_enabled, cache_path};
use crate::logs::copier::Copier;
use crate::logs::ring::RingLogger;
use crate::logs::{
    DeliveryMode, JSON_FILE_DRIVER, LogDriverRegistry, Logger, LoggerInfo, NONE_DRIVER,
    delivery_mode,
};
use crate::mounts::{ConfigReference, MountPoint, SecretProvider, SecretReference, VolumeDriver};
use crate::restart::RestartManager;
use crate::signal::{Signal, stop_signal_or_default};
use crate::state::State;
use crate::stream::{StreamConfig, StreamKind};

/// Healthcheck definition. Probing itself is done by an external prober.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct HealthConfig {
    /// Probe command.
    pub test: Vec<String>,
    /// Seconds between probes.
    pub interval_secs: u64,
    /// Consecutive failures before the container is unhealthy.
    pub retries: u32,
}

/// User configuration of a container, immutable after create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ContainerConfig {
    /// Hostname; defaults to the short ID.
    pub hostname: String,
    /// Domain name.
    pub domainname: String,
    /// User the process runs as.
    pub user: String,
    /// Environment in `KEY=value` form.
    pub env: Vec<String>,
    /// Command.
    pub cmd: Vec<String>,
    /// Entrypoint, prepended to the command.
    pub entrypoint: Vec<String>,
    /// Working directory.
    pub working_dir: String,
    /// Image reference.
    pub image: String,
    /// Free-form labels.
    pub labels: BTreeMap<String, String>,
    /// Allocate a terminal.
    pub tty: bool,
    /// Keep stdin open.
    pub open_stdin: bool,
    /// Stop signal override.
    pub stop_signal: String,
    /// Stop timeout override in seconds; -1 waits forever.
    pub stop_timeout: Option<i64>,
    /// Healthcheck.
    pub healthcheck: Option<HealthConfig>,
}

/// Host-side configuration, persisted in its own file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct HostConfig {
    /// Bind and volume specifications.
    pub binds: Vec<String>,
    /// Log driver selection.
    pub log_config: LogConfig,
    /// Restart policy.
    pub restart_policy: RestartPolicy,
    /// Remove the container once it exits for good.
    pub auto_remove: bool,
    /// Network mode name, passed through to the runtime.
    pub network_mode: String,
    /// Resource limits.
    pub resources: ResourceLimits,
    /// Mount the root filesystem read-only.
    pub readonly_rootfs: bool,
    /// DNS servers.
    pub dns: Option<Vec<String>>,
    /// DNS search domains.
    pub dns_search: Option<Vec<String>>,
    /// DNS resolver options.
    pub dns_options: Option<Vec<String>>,
}

impl HostConfig {
    /// Replaces absent DNS lists with empty ones.
    pub fn init_dns(&mut self) {
        for list in [&mut self.dns, &mut self.dns_search, &mut self.dns_options] {
            if list.is_none() {
                *list = Some(Vec::new());
            }
        }
    }
}

/// The serialized container document (`config.v2.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerDoc {
    /// Container ID.
    #[serde(rename = "ID")]
    pub id: ContainerId,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Executable.
    #[serde(default)]
    pub path: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// User configuration.
    #[serde(default)]
    pub config: ContainerConfig,
    /// Resolved image ID.
    #[serde(default)]
    pub image: ImageId,
    /// Platform of the image.
    #[serde(default)]
    pub image_platform: Platform,
    /// Legacy operating system field.
    #[serde(rename = "OS", default)]
    pub os: String,
    /// Container name without leading slash.
    #[serde(default)]
    pub name: String,
    /// Path of the `json-file` log.
    #[serde(default)]
    pub log_path: String,
    /// Runtime state.
    #[serde(default)]
    pub state: State,
    /// Policy restarts since the last explicit start.
    #[serde(default)]
    pub restart_count: u32,
    /// Whether the container ever started.
    #[serde(default)]
    pub has_been_started_before: bool,
    /// Whether the last stop was requested by a user.
    #[serde(default)]
    pub has_been_manually_stopped: bool,
    /// Mounts by destination.
    #[serde(default)]
    pub mount_points: BTreeMap<String, MountPoint>,
    /// Secrets to materialize before start.
    #[serde(default)]
    pub secret_references: Vec<SecretReference>,
    /// Configs to materialize before start.
    #[serde(default)]
    pub config_references: Vec<ConfigReference>,
    /// Local log cache bookkeeping.
    #[serde(default)]
    pub local_log_cache_meta: LocalLogCacheMeta,
}

impl ContainerDoc {
    /// Creates a document for a new container.
    #[must_use]
    pub fn new(id: ContainerId, name: String, config: ContainerConfig) -> Self {
        let mut command = config.entrypoint.clone();
        command.extend(config.cmd.iter().cloned());
        let mut command = command.into_iter();
        let path = command.next().unwrap_or_default();
        Self {
            id,
            created: Utc::now(),
            path,
            args: command.collect(),
            config,
            image: ImageId::default(),
            image_platform: Platform::default(),
            os: String::new(),
            name,
            log_path: String::new(),
            state: State::default(),
            restart_count: 0,
            has_been_started_before: false,
            has_been_manually_stopped: false,
            mount_points: BTreeMap::new(),
            secret_references: Vec::new(),
            config_references: Vec::new(),
            local_log_cache_meta: LocalLogCacheMeta::default(),
        }
    }
}

/// Latest lifecycle status, published on every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEvent {
    /// Current phase.
    pub status: ContainerStatus,
    /// Exit code of the last run.
    pub exit_code: i32,
    /// End of the last run.
    pub finished_at: Option<DateTime<Utc>>,
}

impl StatusEvent {
    fn from_state(state: &State) -> Self {
        Self {
            status: state.status,
            exit_code: state.exit_code,
            finished_at: state.finished_at,
        }
    }

    /// Returns `true` once no task is alive and no restart is pending.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        !matches!(
            self.status,
            ContainerStatus::Running | ContainerStatus::Paused | ContainerStatus::Restarting
        )
    }
}

/// Lock guard over a container's mutable record.
pub type ContainerGuard<'a> = MutexGuard<'a, ContainerInner>;

/// A container: immutable identity plus its locked mutable record.
pub struct Container {
    id: ContainerId,
    root: PathBuf,
    streams: StreamConfig,
    events: watch::Sender<StatusEvent>,
    inner: Mutex<ContainerInner>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("status", &self.events.borrow().status)
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Wraps a fully constructed record.
    #[must_use]
    pub fn new(inner: ContainerInner) -> Self {
        let (events, _) = watch::channel(StatusEvent::from_state(&inner.doc.state));
        Self {
            id: inner.doc.id.clone(),
            root: inner.root.clone(),
            streams: StreamConfig::new(),
            events,
            inner: Mutex::new(inner),
        }
    }

    /// Container ID.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Container root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The container's stdio.
    #[must_use]
    pub const fn streams(&self) -> &StreamConfig {
        &self.streams
    }

    /// Acquires the container lock.
    pub async fn lock(&self) -> ContainerGuard<'_> {
        self.inner.lock().await
    }

    /// Subscribes to status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Most recently published status.
    #[must_use]
    pub fn status(&self) -> StatusEvent {
        *self.events.borrow()
    }

    /// Publishes the current state to status subscribers.
    pub fn publish(&self, state: &State) {
        let _ = self.events.send_replace(StatusEvent::from_state(state));
    }

    /// Persists the record, updates the view, and publishes the new status.
    ///
    /// The caller must hold the lock and pass the guarded record.
    ///
    /// # Errors
    ///
    /// Returns an error if the documents cannot be written.
    pub fn checkpoint(&self, inner: &ContainerInner, views: &crate::view::ViewDb) -> Result<()> {
        let result = inner.checkpoint_to(views);
        self.publish(&inner.doc.state);
        result
    }
}

/// The mutable record of a container, only reachable through its lock.
pub struct ContainerInner {
    pub(crate) root: PathBuf,
    /// Serialized document.
    pub doc: ContainerDoc,
    /// Host configuration.
    pub host_config: HostConfig,
    /// Set by an explicit restart so the exit it causes is not a policy exit.
    pub has_been_manually_restarted: bool,
    backoff: BackoffConfig,
    restart_manager: Option<Arc<RestartManager>>,
    log_driver: Option<Arc<dyn Logger>>,
    log_copier: Option<Copier>,
    task: Option<Weak<dyn Task>>,
}

impl std::fmt::Debug for ContainerInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerInner")
            .field("root", &self.root)
            .field("doc", &self.doc)
            .field("host_config", &self.host_config)
            .field("log_driver", &self.log_driver.as_ref().map(|l| l.name().to_string()))
            .field("has_task", &self.task.is_some())
            .finish_non_exhaustive()
    }
}

impl ContainerInner {
    /// Creates a record rooted at `root`.
    #[must_use]
    pub fn new(root: PathBuf, doc: ContainerDoc, host_config: HostConfig) -> Self {
        Self {
            root,
            doc,
            host_config,
            has_been_manually_restarted: false,
            backoff: BackoffConfig::default(),
            restart_manager: None,
            log_driver: None,
            log_copier: None,
            task: None,
        }
    }

    /// Sets the backoff curve used by the restart manager.
    pub fn set_backoff(&mut self, backoff: BackoffConfig) {
        self.backoff = backoff;
    }

    /// Container ID.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.doc.id
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.doc.name
    }

    /// Runtime state.
    #[must_use]
    pub const fn state(&self) -> &State {
        &self.doc.state
    }

    /// Mutable runtime state.
    pub fn state_mut(&mut self) -> &mut State {
        &mut self.doc.state
    }

    /// Container root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of `config.v2.json`.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    /// Path of `hostconfig.json`.
    #[must_use]
    pub fn host_config_path(&self) -> PathBuf {
        self.root.join(HOST_CONFIG_FILE_NAME)
    }

    /// Directory for checkpoint data.
    #[must_use]
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.root.join(CHECKPOINTS_DIR)
    }

    fn secrets_dir(&self) -> PathBuf {
        self.root.join(MOUNTS_DIR).join("secrets")
    }

    fn configs_dir(&self) -> PathBuf {
        self.root.join(MOUNTS_DIR).join("configs")
    }

    // --- restart policy -------------------------------------------------

    /// Returns the restart manager, creating it on first use.
    pub fn restart_manager(&mut self) -> Arc<RestartManager> {
        let manager = self.restart_manager.get_or_insert_with(|| {
            Arc::new(RestartManager::new(
                self.host_config.restart_policy,
                self.doc.restart_count,
                self.backoff,
            ))
        });
        Arc::clone(manager)
    }

    /// Drops the restart manager so the next exit starts a fresh one.
    ///
    /// `reset_count` also clears the restart counter, as an explicit start
    /// does.
    pub fn reset_restart_manager(&mut self, reset_count: bool) {
        if let Some(manager) = self.restart_manager.take() {
            manager.cancel();
        }
        if reset_count {
            self.doc.restart_count = 0;
        }
    }

    /// Applies a new restart policy to the live manager.
    pub fn update_monitor(&mut self, policy: RestartPolicy) {
        if let Some(manager) = &self.restart_manager {
            manager.set_policy(policy);
        }
    }

    /// Cancels any pending restart and prevents future policy restarts until
    /// the next explicit start.
    pub fn exit_on_next(&mut self) {
        self.restart_manager().cancel();
    }

    /// Whether a container whose task was lost while the daemon was down
    /// should come back, judged by its restart policy against the recorded
    /// exit.
    pub fn should_restart_on_daemon_start(&mut self) -> bool {
        let exit_code = self.state().exit_code;
        let manually_stopped = self.doc.has_been_manually_stopped;
        self.restart_manager().would_restart(exit_code, manually_stopped)
    }

    // --- stop parameters ------------------------------------------------

    /// Signal sent by a graceful stop.
    #[must_use]
    pub fn stop_signal(&self) -> Signal {
        stop_signal_or_default(&self.doc.config.stop_signal)
    }

    /// Seconds a graceful stop waits before killing.
    #[must_use]
    pub fn stop_timeout(&self, default: i64) -> i64 {
        self.doc.config.stop_timeout.unwrap_or(default)
    }

    // --- task handle ----------------------------------------------------

    /// The live task, if the runtime still holds it.
    #[must_use]
    pub fn task(&self) -> Option<Arc<dyn Task>> {
        self.task.as_ref().and_then(Weak::upgrade)
    }

    /// The live task of a running container.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the container is not running and `System` if it
    /// is but the runtime lost its task.
    pub fn running_task(&self) -> Result<Arc<dyn Task>> {
        if !self.state().is_running() {
            return Err(HarbordError::conflict(format!(
                "container {} is not running",
                self.id()
            )));
        }
        self.task().ok_or_else(|| {
            HarbordError::system(format!(
                "container {} is in running state but has no task",
                self.id()
            ))
        })
    }

    /// Records the task handle.
    pub fn set_task(&mut self, task: &Arc<dyn Task>) {
        self.task = Some(Arc::downgrade(task));
    }

    /// Forgets the task handle, returning the task if it is still alive.
    pub fn take_task(&mut self) -> Option<Arc<dyn Task>> {
        self.task.take().and_then(|weak| weak.upgrade())
    }

    // --- environment and task spec -------------------------------------

    /// Builds the process environment: daemon defaults, then linked
    /// environment, then the user's values replacing or appending by key.
    #[must_use]
    pub fn create_daemon_environment(&self, linked_env: &[String]) -> Vec<String> {
        let mut env = vec![
            format!("PATH={DEFAULT_PATH_ENV}"),
            format!("HOSTNAME={}", self.doc.config.hostname),
        ];
        if self.doc.config.tty {
            env.push("TERM=xterm".to_string());
        }
        env.extend(linked_env.iter().cloned());
        replace_or_append_env_values(env, &self.doc.config.env)
    }

    /// Builds the runtime spec from the document and resolved mounts.
    #[must_use]
    pub fn task_spec(&self, mut mounts: Vec<MountSpec>) -> TaskSpec {
        for mount in self.doc.mount_points.values() {
            if mount.source.is_empty() {
                continue;
            }
            mounts.push(MountSpec {
                source: PathBuf::from(&mount.source),
                destination: PathBuf::from(&mount.destination),
                read_only: !mount.rw,
            });
        }
        let mut args = vec![self.doc.path.clone()];
        args.extend(self.doc.args.iter().cloned());
        TaskSpec {
            args,
            env: self.create_daemon_environment(&[]),
            working_dir: self.doc.config.working_dir.clone(),
            hostname: self.doc.config.hostname.clone(),
            user: self.doc.config.user.clone(),
            tty: self.doc.config.tty,
            open_stdin: self.doc.config.open_stdin,
            mounts,
            resources: self.host_config.resources.clone(),
        }
    }

    /// Health sub-status for a freshly started task.
    #[must_use]
    pub const fn initial_health(&self) -> HealthStatus {
        if self.doc.config.healthcheck.is_some() {
            HealthStatus::Starting
        } else {
            HealthStatus::None
        }
    }

    // --- secrets, configs and volumes ----------------------------------

    /// Writes secret and config material under the private mounts directory
    /// and returns the mounts exposing it.
    ///
    /// # Errors
    ///
    /// Returns an error if material cannot be resolved or written, or if
    /// references exist but no provider is configured.
    pub async fn setup_secret_mounts(
        &self,
        provider: Option<&dyn SecretProvider>,
    ) -> Result<Vec<MountSpec>> {
        if self.doc.secret_references.is_empty() && self.doc.config_references.is_empty() {
            return Ok(Vec::new());
        }
        let provider = provider.ok_or_else(|| {
            HarbordError::system(format!(
                "container {} references secrets but no secret provider is configured",
                self.id()
            ))
        })?;
        let mut mounts = Vec::new();
        for reference in &self.doc.secret_references {
            let data = provider.secret(&reference.secret_id).await?;
            let path = self.secrets_dir().join(&reference.secret_id);
            write_private_file(&path, &data, reference.file.mode)?;
            mounts.push(MountSpec {
                source: path,
                destination: reference.target_path(),
                read_only: true,
            });
        }
        for reference in &self.doc.config_references {
            let data = provider.config(&reference.config_id).await?;
            let path = self.configs_dir().join(&reference.config_id);
            write_private_file(&path, &data, reference.file.mode)?;
            mounts.push(MountSpec {
                source: path,
                destination: reference.target_path(),
                read_only: true,
            });
        }
        tracing::debug!(id = %self.id(), count = mounts.len(), "secrets and configs materialized");
        Ok(mounts)
    }

    fn volume_names(&self) -> Vec<(String, String)> {
        self.doc
            .mount_points
            .iter()
            .filter(|(_, mount)| mount.is_volume())
            .map(|(destination, mount)| (destination.clone(), mount.name.clone()))
            .collect()
    }

    /// Mounts every named volume, recording the host paths.
    ///
    /// On failure the volumes mounted so far are released again.
    ///
    /// # Errors
    ///
    /// Returns an error if a volume cannot be mounted or no driver is
    /// configured while volumes are referenced.
    pub async fn mount_volumes(&mut self, driver: Option<&dyn VolumeDriver>) -> Result<()> {
        let volumes = self.volume_names();
        if volumes.is_empty() {
            return Ok(());
        }
        let driver = driver.ok_or_else(|| {
            HarbordError::system(format!(
                "container {} uses volumes but no volume driver is configured",
                self.id()
            ))
        })?;
        let mut mounted = Vec::new();
        for (destination, name) in volumes {
            match driver.mount(&name, self.id()).await {
                Ok(path) => {
                    if let Some(mount) = self.doc.mount_points.get_mut(&destination) {
                        mount.source = path.display().to_string();
                    }
                    mounted.push(name);
                }
                Err(e) => {
                    for name in mounted {
                        if let Err(undo) = driver.unmount(&name, self.id()).await {
                            tracing::warn!(id = %self.id(), volume = %name, error = %undo, "failed to release volume");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Names of the named volumes this container references.
    #[must_use]
    pub fn volumes(&self) -> Vec<String> {
        self.volume_names().into_iter().map(|(_, name)| name).collect()
    }

    /// Releases every mounted named volume.
    ///
    /// # Errors
    ///
    /// Returns a `System` error listing every volume that failed.
    pub async fn unmount_volumes(&mut self, driver: Option<&dyn VolumeDriver>) -> Result<()> {
        let Some(driver) = driver else {
            return Ok(());
        };
        let mounted: Vec<(String, String)> = self
            .volume_names()
            .into_iter()
            .filter(|(destination, _)| {
                self.doc
                    .mount_points
                    .get(destination)
                    .is_some_and(|mount| !mount.source.is_empty())
            })
            .collect();
        let mut failures = Vec::new();
        for (destination, name) in mounted {
            if let Err(e) = driver.unmount(&name, self.id()).await {
                failures.push(format!("{name}: {e}"));
            } else if let Some(mount) = self.doc.mount_points.get_mut(&destination) {
                mount.source.clear();
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(HarbordError::system(format!(
                "error while unmounting volumes for container {}: {}",
                self.id(),
                failures.join("; ")
            )))
        }
    }

    // --- logging --------------------------------------------------------

    fn logger_info(&self) -> LoggerInfo {
        LoggerInfo {
            config: self.host_config.log_config.config.clone(),
            container_id: self.doc.id.clone(),
            container_name: self.doc.name.clone(),
            container_image_name: self.doc.config.image.clone(),
            container_image_id: self.doc.image.clone(),
            container_created: self.doc.created,
            container_env: self.doc.config.env.clone(),
            container_labels: self.doc.config.labels.clone(),
            container_root: self.root.clone(),
        }
    }

    /// Builds the configured log driver, wrapped in a ring buffer for
    /// non-blocking mode and in the local cache when it cannot be read.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver is unknown, its options are invalid, or
    /// its factory fails.
    pub fn start_logger(&mut self, registry: &LogDriverRegistry) -> Result<Arc<dyn Logger>> {
        let config = self.host_config.log_config.clone();
        let factory = registry.factory(&config.driver)?;
        let mut logger = factory(&self.logger_info())?;

        if config.driver == JSON_FILE_DRIVER {
            if let Some(path) = logger.log_path() {
                self.doc.log_path = path.display().to_string();
            }
        }
        let mode = delivery_mode(&config)?;
        if logger.reader().is_none() && cache_enabled(&config)? {
            logger = Arc::new(CachingLogger::new(logger, cache_path(&self.root)));
            if !self.doc.local_log_cache_meta.have_notify_enabled {
                tracing::info!(
                    id = %self.doc.id,
                    driver = %config.driver,
                    "log driver does not support reading, enabling local file cache for container logs"
                );
                self.doc.local_log_cache_meta.have_notify_enabled = true;
            }
        }
        if let DeliveryMode::NonBlocking { max_buffer_size } = mode {
            logger = Arc::new(RingLogger::new(logger, max_buffer_size));
        }
        Ok(logger)
    }

    /// Starts the log driver and the copier for a new run.
    ///
    /// # Errors
    ///
    /// Returns "failed to initialize logging driver" wrapping the cause.
    pub fn start_logging(
        &mut self,
        registry: &LogDriverRegistry,
        streams: &StreamConfig,
    ) -> Result<()> {
        if self.host_config.log_config.driver == NONE_DRIVER {
            return Ok(());
        }
        let logger = self.start_logger(registry).map_err(logging_init_error)?;
        let mut copier = Copier::new(
            vec![
                (StreamKind::Stdout, streams.pipe(StreamKind::Stdout)),
                (StreamKind::Stderr, streams.pipe(StreamKind::Stderr)),
            ],
            Arc::clone(&logger),
        );
        copier.run();
        self.log_driver = Some(logger);
        self.log_copier = Some(copier);
        Ok(())
    }

    /// The active log driver.
    #[must_use]
    pub fn log_driver(&self) -> Option<&Arc<dyn Logger>> {
        self.log_driver.as_ref()
    }

    /// Tears down the stdio and log pipeline of a finished run.
    ///
    /// Output already produced is drained into the driver, bounded by
    /// `drain_timeout`, before the driver is closed.
    pub async fn reset(&mut self, streams: &StreamConfig, drain_timeout: Duration) {
        streams.close_stdin();
        if !streams.wait(drain_timeout).await {
            tracing::warn!(id = %self.doc.id, "stdio did not reach end of stream in time");
        }
        if let Some(mut copier) = self.log_copier.take() {
            if !copier.wait(drain_timeout).await {
                tracing::warn!(id = %self.doc.id, "log copier did not drain in time");
            }
        }
        if let Some(logger) = self.log_driver.take() {
            if let Err(e) = logger.close().await {
                tracing::warn!(id = %self.doc.id, error = %e, "failed to close log driver");
            }
        }
    }
}

fn logging_init_error(error: HarbordError) -> HarbordError {
    let detail = match &error {
        HarbordError::InvalidParameter { message }
        | HarbordError::System { message }
        | HarbordError::Conflict { message } => message.clone(),
        other => other.to_string(),
    };
    let message = format!("failed to initialize logging driver: {detail}");
    match error {
        HarbordError::InvalidParameter { .. } => HarbordError::invalid(message),
        _ => HarbordError::system(message),
    }
}

fn write_private_file(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(CONTAINER_DIR_MODE)
            .create(dir)
            .map_err(|e| HarbordError::io(dir, e))?;
    }
    crate::persist::atomic_write(path, data, mode)
}

/// Merges `overrides` into `defaults` by key.
///
/// `KEY=value` replaces an existing `KEY` or is appended; a bare `KEY`
/// removes it.
#[must_use]
pub fn replace_or_append_env_values(defaults: Vec<String>, overrides: &[String]) -> Vec<String> {
    let mut env: Vec<Option<String>> = defaults.into_iter().map(Some).collect();
    let mut index: HashMap<String, usize> = HashMap::new();
    for (i, entry) in env.iter().enumerate() {
        if let Some(entry) = entry {
            let key = entry.split_once('=').map_or(entry.as_str(), |(k, _)| k);
            let _ = index.insert(key.to_string(), i);
        }
    }
    for value in overrides {
        match value.split_once('=') {
            None => {
                if let Some(&i) = index.get(value.as_str()) {
                    env[i] = None;
                }
            }
            Some((key, _)) => {
                if let Some(&i) = index.get(key) {
                    env[i] = Some(value.clone());
                } else {
                    let _ = index.insert(key.to_string(), env.len());
                    env.push(Some(value.clone()));
                }
            }
        }
    }
    env.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(config: ContainerConfig) -> ContainerInner {
        let doc = ContainerDoc::new(ContainerId::new("c0ffee"), "web".into(), config);
        ContainerInner::new(PathBuf::from("/tmp/c0ffee"), doc, HostConfig::default())
    }

    #[test]
    fn command_is_split_into_path_and_args() {
        let doc = ContainerDoc::new(
            ContainerId::new("a"),
            "a".into(),
            ContainerConfig {
                entrypoint: vec!["/bin/sh".into(), "-c".into()],
                cmd: vec!["echo hi".into()],
                ..ContainerConfig::default()
            },
        );
        assert_eq!(doc.path, "/bin/sh");
        assert_eq!(doc.args, vec!["-c".to_string(), "echo hi".to_string()]);
    }

    #[test]
    fn env_overrides_replace_append_and_unset() {
        let merged = replace_or_append_env_values(
            vec!["PATH=/bin".into(), "HOSTNAME=x".into(), "TERM=xterm".into()],
            &["PATH=/usr/bin".into(), "FOO=1".into(), "TERM".into(), "FOO=2".into()],
        );
        assert_eq!(merged, vec!["PATH=/usr/bin", "HOSTNAME=x", "FOO=2"]);
    }

    #[test]
    fn daemon_environment_has_defaults() {
        let inner = record(ContainerConfig {
            hostname: "box".into(),
            tty: true,
            env: vec!["LANG=C".into()],
            ..ContainerConfig::default()
        });
        let env = inner.create_daemon_environment(&["LINK=1".into()]);
        assert_eq!(env[0], format!("PATH={DEFAULT_PATH_ENV}"));
        assert!(env.contains(&"HOSTNAME=box".to_string()));
        assert!(env.contains(&"TERM=xterm".to_string()));
        assert!(env.contains(&"LINK=1".to_string()));
        assert_eq!(env.last().unwrap(), "LANG=C");
    }

    #[test]
    fn stop_parameters_fall_back_to_defaults() {
        let inner = record(ContainerConfig::default());
        assert_eq!(inner.stop_signal(), Signal::SIGTERM);
        assert_eq!(inner.stop_timeout(10), 10);

        let inner = record(ContainerConfig {
            stop_signal: "SIGINT".into(),
            stop_timeout: Some(-1),
            ..ContainerConfig::default()
        });
        assert_eq!(inner.stop_signal(), Signal::SIGINT);
        assert_eq!(inner.stop_timeout(10), -1);
    }

    #[test]
    fn dns_lists_are_initialized() {
        let mut host = HostConfig {
            dns: Some(vec!["1.1.1.1".into()]),
            ..HostConfig::default()
        };
        host.init_dns();
        assert_eq!(host.dns, Some(vec!["1.1.1.1".to_string()]));
        assert_eq!(host.dns_search, Some(Vec::new()));
        assert_eq!(host.dns_options, Some(Vec::new()));
    }

    #[test]
    fn running_task_requires_running_state() {
        let inner = record(ContainerConfig::default());
        let err = inner.running_task().err().unwrap();
        assert_eq!(err.kind(), harbord_common::error::ErrorKind::Conflict);
    }

    #[test]
    fn exit_on_next_cancels_future_restarts() {
        let mut inner = record(ContainerConfig::default());
        inner.host_config.restart_policy = RestartPolicy::on_failure(0);
        inner.exit_on_next();
        let decision = inner
            .restart_manager()
            .should_restart(1, false, Duration::ZERO)
            .unwrap();
        assert!(decision.is_none());

        inner.reset_restart_manager(true);
        assert!(!inner.restart_manager().is_canceled());
    }

    #[test]
    fn logging_errors_keep_their_category() {
        let err = logging_init_error(HarbordError::invalid("logger: no log driver named 'x'"));
        assert_eq!(err.kind(), harbord_common::error::ErrorKind::InvalidParameter);
        assert!(err.to_string().contains("failed to initialize logging driver"));
    }

    #[test]
    fn health_starts_only_with_a_healthcheck() {
        assert_eq!(record(ContainerConfig::default()).initial_health(), HealthStatus::None);
        let inner = record(ContainerConfig {
            healthcheck: Some(HealthConfig::default()),
            ..ContainerConfig::default()
        });
        assert_eq!(inner.initial_health(), HealthStatus::Starting);
    }

    struct Stuck;

    #[async_trait::async_trait]
    impl Logger for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn log(&self, _message: crate::logs::LogMessage) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn non_blocking_cache_only_sees_what_the_ring_delivers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = LogDriverRegistry::new();
        registry
            .register(
                "stuck",
                Arc::new(|_: &LoggerInfo| -> Result<Arc<dyn Logger>> { Ok(Arc::new(Stuck)) }),
            )
            .expect("register");
        let doc = ContainerDoc::new(ContainerId::new("c0ffee"), "web".into(), ContainerConfig::default());
        let mut inner = ContainerInner::new(
            dir.path().to_path_buf(),
            doc,
            HostConfig {
                log_config: LogConfig::driver("stuck")
                    .with_option("mode", "non-blocking")
                    .with_option("max-buffer-size", "1k"),
                ..HostConfig::default()
            },
        );

        let logger = inner.start_logger(&registry).expect("logger");
        let line = "x".repeat(100);
        for _ in 0..200 {
            logger
                .log(crate::logs::LogMessage::new(StreamKind::Stdout, line.as_str()))
                .await
                .expect("ring push never blocks");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(logger.dropped_messages() > 0);
        let mut stream = logger
            .reader()
            .expect("cache reader")
            .read_logs(&crate::logs::ReadConfig::default());
        let mut cached = 0;
        while let Some(message) = stream.recv().await {
            if message.is_ok() {
                cached += 1;
            }
        }
        assert!(cached < 200, "cache saw {cached} lines ahead of the ring");
    }
}
