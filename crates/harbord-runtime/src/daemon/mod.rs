//! The lifecycle daemon: the public operations over all containers.
//!
//! Every operation resolves its container through the [`Store`], takes the
//! container lock, mutates the record, and checkpoints it before the lock is
//! released. Runtime calls go through [`with_deadline`] so a hung runtime can
//! never pin a container lock forever. Runtime events are applied by the
//! event loop under the same lock (see `monitor`).

mod lifecycle;
mod monitor;
mod query;
mod remove;
mod update;

use std::collections::BTreeMap;
use std::future::Future;
use std::os::unix::fs::DirBuilderExt;
use std::sync::Arc;
use std::time::Duration;

use harbord_common::config::DaemonConfig;
use harbord_common::constants::CONTAINER_DIR_MODE;
use harbord_common::error::{HarbordError, Result};
use harbord_common::types::{ContainerId, ImageId, Platform};
use tokio::sync::watch;

use crate::backend::{ImageInfo, ImageService, Runtime, with_deadline};
use crate::container::{Container, ContainerConfig, ContainerDoc, ContainerInner, HostConfig, StatusEvent};
use crate::logs::cache::cache_enabled;
use crate::logs::{LogDriverRegistry, LoggerFactory, delivery_mode};
use crate::mounts::{ConfigReference, MountPoint, SecretProvider, SecretReference, VolumeDriver, parse_bind};
use crate::store::{Store, normalize_name};
use crate::view::{ContainerSnapshot, ViewDb};

pub use lifecycle::WaitCondition;
pub use remove::RemoveOptions;
pub use update::UpdateOptions;

/// Parameters of a create request.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Requested name; generated from the ID when absent.
    pub name: Option<String>,
    /// User configuration.
    pub config: ContainerConfig,
    /// Host configuration.
    pub host_config: HostConfig,
    /// Secrets to expose to the container.
    pub secret_references: Vec<SecretReference>,
    /// Configs to expose to the container.
    pub config_references: Vec<ConfigReference>,
}

/// Builder wiring the daemon to its collaborators.
pub struct DaemonBuilder {
    config: DaemonConfig,
    runtime: Arc<dyn Runtime>,
    images: Option<Arc<dyn ImageService>>,
    volumes: Option<Arc<dyn VolumeDriver>>,
    secrets: Option<Arc<dyn SecretProvider>>,
    log_drivers: LogDriverRegistry,
}

impl DaemonBuilder {
    /// Starts a builder over `runtime` with the given configuration.
    #[must_use]
    pub fn new(config: DaemonConfig, runtime: Arc<dyn Runtime>) -> Self {
        Self {
            config,
            runtime,
            images: None,
            volumes: None,
            secrets: None,
            log_drivers: LogDriverRegistry::new(),
        }
    }

    /// Resolves image references through `images`. Without an image service
    /// the reference itself is used as the image ID.
    #[must_use]
    pub fn images(mut self, images: Arc<dyn ImageService>) -> Self {
        self.images = Some(images);
        self
    }

    /// Mounts named volumes through `volumes`.
    #[must_use]
    pub fn volumes(mut self, volumes: Arc<dyn VolumeDriver>) -> Self {
        self.volumes = Some(volumes);
        self
    }

    /// Resolves secret and config material through `secrets`.
    #[must_use]
    pub fn secrets(mut self, secrets: Arc<dyn SecretProvider>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Registers an additional log driver.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is reserved or already taken.
    pub fn log_driver(self, name: &str, factory: LoggerFactory) -> Result<Self> {
        self.log_drivers.register(name, factory)?;
        Ok(self)
    }

    /// Validates the configuration and builds the daemon.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the containers
    /// root cannot be created.
    pub fn build(self) -> Result<Arc<Daemon>> {
        self.config.validate()?;
        self.log_drivers.validate(&self.config.default_log_config)?;
        let root = self.config.containers_root();
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(CONTAINER_DIR_MODE)
            .create(&root)
            .map_err(|e| HarbordError::io(&root, e))?;
        tracing::debug!(root = %root.display(), drivers = ?self.log_drivers.names(), "daemon configured");
        Ok(Arc::new(Daemon {
            config: self.config,
            store: Store::new(),
            views: ViewDb::new(),
            runtime: self.runtime,
            images: self.images,
            volumes: self.volumes,
            secrets: self.secrets,
            log_drivers: self.log_drivers,
        }))
    }
}

/// Owner of every container and entry point of every lifecycle operation.
pub struct Daemon {
    config: DaemonConfig,
    store: Store,
    views: ViewDb,
    runtime: Arc<dyn Runtime>,
    images: Option<Arc<dyn ImageService>>,
    volumes: Option<Arc<dyn VolumeDriver>>,
    secrets: Option<Arc<dyn SecretProvider>>,
    log_drivers: LogDriverRegistry,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("data_dir", &self.config.data_dir)
            .field("containers", &self.store.size())
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Daemon configuration.
    #[must_use]
    pub const fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Live container registry.
    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }

    /// Snapshot store.
    #[must_use]
    pub const fn views(&self) -> &ViewDb {
        &self.views
    }

    /// Registered log drivers.
    #[must_use]
    pub const fn log_drivers(&self) -> &LogDriverRegistry {
        &self.log_drivers
    }

    /// Resolves a user reference to a live container.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `Ambiguous` if the reference does not resolve
    /// to exactly one container.
    pub fn container(&self, reference: &str) -> Result<Arc<Container>> {
        self.store.resolve(reference)
    }

    async fn runtime_call<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        with_deadline(self.config.runtime_timeout(), operation, call).await
    }

    // --- create ---------------------------------------------------------

    /// Creates a container: validates the request, reserves the name,
    /// allocates the directory and writes the first checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` for malformed requests, `NameConflict` for
    /// a taken name, `NotFound` for an unknown image and `System` if the
    /// directory or documents cannot be written. Nothing is left behind on
    /// failure.
    pub async fn create(&self, options: CreateOptions) -> Result<ContainerId> {
        let CreateOptions {
            name,
            mut config,
            mut host_config,
            secret_references,
            config_references,
        } = options;

        host_config.restart_policy.validate()?;
        if host_config.auto_remove && !host_config.restart_policy.is_none() {
            return Err(HarbordError::invalid(
                "can't create 'AutoRemove' container with restart policy",
            ));
        }
        if host_config.log_config.driver.is_empty() {
            host_config.log_config = self.config.default_log_config.clone();
        }
        let _ = delivery_mode(&host_config.log_config)?;
        let _ = cache_enabled(&host_config.log_config)?;
        if config.entrypoint.is_empty() && config.cmd.is_empty() {
            return Err(HarbordError::invalid("no command specified"));
        }
        let mount_points = mount_points(&host_config.binds)?;
        let name = name
            .filter(|n| !n.is_empty())
            .map(|n| normalize_name(&n))
            .transpose()?;
        let image = self.resolve_image(&config.image).await?;

        let id = self.generate_id();
        let name = name.unwrap_or_else(|| id.short().to_string());
        if config.hostname.is_empty() {
            config.hostname = id.short().to_string();
        }
        self.store.reserve_name(&name, &id)?;

        let mut doc = ContainerDoc::new(id.clone(), name.clone(), config);
        doc.image = image.id;
        doc.os.clone_from(&image.platform.os);
        doc.image_platform = image.platform;
        doc.mount_points = mount_points;
        doc.secret_references = secret_references;
        doc.config_references = config_references;
        host_config.init_dns();

        match self.register(doc, host_config) {
            Ok(()) => {
                tracing::info!(id = %id, name = %name, "container created");
                Ok(id)
            }
            Err(e) => {
                self.store.release_name(&name);
                Err(e)
            }
        }
    }

    fn register(&self, doc: ContainerDoc, host_config: HostConfig) -> Result<()> {
        let root = self.config.containers_root().join(doc.id.as_str());
        std::fs::DirBuilder::new()
            .mode(CONTAINER_DIR_MODE)
            .create(&root)
            .map_err(|e| HarbordError::io(&root, e))?;

        let mut inner = ContainerInner::new(root.clone(), doc, host_config);
        inner.set_backoff(self.config.restart_backoff);
        if let Err(e) = inner.checkpoint_to(&self.views) {
            self.views.delete(inner.id());
            if let Err(cleanup) = std::fs::remove_dir_all(&root) {
                tracing::warn!(path = %root.display(), error = %cleanup, "failed to clean up container directory");
            }
            return Err(e);
        }
        self.store.add(Arc::new(Container::new(inner)));
        Ok(())
    }

    fn generate_id(&self) -> ContainerId {
        loop {
            let id = ContainerId::generate();
            let taken = self.store.get(&id).is_some()
                || self.config.containers_root().join(id.as_str()).exists();
            if !taken {
                return id;
            }
        }
    }

    async fn resolve_image(&self, reference: &str) -> Result<ImageInfo> {
        match &self.images {
            Some(images) => images.resolve(reference).await,
            None => Ok(ImageInfo {
                id: ImageId::new(reference),
                platform: Platform::host(),
            }),
        }
    }

    // --- views ----------------------------------------------------------

    /// Returns the last checkpointed snapshot of a container.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `Ambiguous` if the reference does not resolve.
    pub fn inspect(&self, reference: &str) -> Result<ContainerSnapshot> {
        let container = self.container(reference)?;
        self.views.get(container.id())
    }

    /// Lists snapshots, newest first; stopped containers only with `all`.
    #[must_use]
    pub fn list(&self, all: bool) -> Vec<ContainerSnapshot> {
        self.views
            .list()
            .into_iter()
            .filter(|snapshot| all || snapshot.doc.state.is_active())
            .collect()
    }
}

fn mount_points(binds: &[String]) -> Result<BTreeMap<String, MountPoint>> {
    let mut mounts = BTreeMap::new();
    for bind in binds {
        let mount = parse_bind(bind)?;
        let destination = mount.destination.clone();
        if mounts.insert(destination.clone(), mount).is_some() {
            return Err(HarbordError::invalid(format!(
                "duplicate mount point: {destination}"
            )));
        }
    }
    Ok(mounts)
}

/// Waits until the published status satisfies `done`.
///
/// `None` waits indefinitely. Returns `false` on timeout.
async fn wait_status(
    rx: &mut watch::Receiver<StatusEvent>,
    timeout: Option<Duration>,
    done: impl FnMut(&StatusEvent) -> bool,
) -> bool {
    let reached = rx.wait_for(done);
    match timeout {
        None => reached.await.is_ok(),
        Some(timeout) => matches!(tokio::time::timeout(timeout, reached).await, Ok(Ok(_))),
    }
}

/// Converts a stop timeout in seconds into a wait bound; negative waits
/// forever.
fn stop_wait(seconds: i64) -> Option<Duration> {
    u64::try_from(seconds).ok().map(Duration::from_secs)
}
