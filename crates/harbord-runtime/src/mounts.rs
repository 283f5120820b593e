//! Mount points, secret and config references, and the volume and secret
//! collaborators.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use harbord_common::constants::{CONTAINER_CONFIG_MOUNT_PATH, CONTAINER_SECRET_MOUNT_PATH};
use harbord_common::error::{HarbordError, Result};
use harbord_common::types::ContainerId;
use serde::{Deserialize, Serialize};

/// Kind of a mount point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    /// Host path bound into the container.
    #[default]
    Bind,
    /// Named volume managed by a volume driver.
    Volume,
    /// In-memory filesystem.
    Tmpfs,
}

/// One mount of a container, keyed by destination in the document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct MountPoint {
    /// Host path; for volumes the path returned by the last mount.
    pub source: String,
    /// Absolute path inside the container.
    pub destination: String,
    /// Whether the mount is writable.
    #[serde(rename = "RW")]
    pub rw: bool,
    /// Volume name; empty for binds.
    pub name: String,
    /// Volume driver name.
    pub driver: String,
    /// Mount kind.
    #[serde(rename = "Type")]
    pub mount_type: MountType,
    /// Copy image content into an empty volume on first use.
    pub copy_data: bool,
}

impl MountPoint {
    /// Returns `true` for named-volume mounts.
    #[must_use]
    pub fn is_volume(&self) -> bool {
        self.mount_type == MountType::Volume && !self.name.is_empty()
    }
}

/// Parses a bind specification `source:destination[:ro|rw]`.
///
/// A source that is not an absolute path names a volume.
///
/// # Errors
///
/// Returns `InvalidParameter` if the specification is malformed.
pub fn parse_bind(spec: &str) -> Result<MountPoint> {
    let invalid = |why: &str| HarbordError::invalid(format!("invalid mount config '{spec}': {why}"));
    let parts: Vec<&str> = spec.split(':').collect();
    let (source, destination, mode) = match parts.as_slice() {
        [source, destination] => (*source, *destination, "rw"),
        [source, destination, mode] => (*source, *destination, *mode),
        _ => return Err(invalid("expected source:destination[:mode]")),
    };
    if source.is_empty() {
        return Err(invalid("source must not be empty"));
    }
    if !destination.starts_with('/') {
        return Err(invalid("destination must be an absolute path"));
    }
    if destination == "/" {
        return Err(invalid("destination can't be '/'"));
    }
    let rw = match mode {
        "rw" => true,
        "ro" => false,
        other => return Err(invalid(&format!("unknown mode '{other}'"))),
    };
    let (mount_type, name, driver) = if source.starts_with('/') {
        (MountType::Bind, String::new(), String::new())
    } else {
        (MountType::Volume, source.to_string(), "local".to_string())
    };
    Ok(MountPoint {
        source: if mount_type == MountType::Bind {
            source.to_string()
        } else {
            String::new()
        },
        destination: destination.to_string(),
        rw,
        name,
        driver,
        mount_type,
        copy_data: mount_type == MountType::Volume,
    })
}

/// Where a secret or config is placed inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileTarget {
    /// Target file name; relative names are placed under the default
    /// directory.
    pub name: String,
    /// Owner user ID.
    #[serde(rename = "UID", default)]
    pub uid: String,
    /// Owner group ID.
    #[serde(rename = "GID", default)]
    pub gid: String,
    /// File mode.
    #[serde(default = "default_file_mode")]
    pub mode: u32,
}

const fn default_file_mode() -> u32 {
    0o444
}

/// A secret the container consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SecretReference {
    /// Secret ID known to the secret provider.
    #[serde(rename = "SecretID")]
    pub secret_id: String,
    /// Human-readable secret name.
    pub secret_name: String,
    /// Placement inside the container.
    pub file: FileTarget,
}

/// A config the container consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigReference {
    /// Config ID known to the provider.
    #[serde(rename = "ConfigID")]
    pub config_id: String,
    /// Human-readable config name.
    pub config_name: String,
    /// Placement inside the container.
    pub file: FileTarget,
}

fn target_path(default_dir: &str, name: &str) -> PathBuf {
    if Path::new(name).is_absolute() {
        PathBuf::from(name)
    } else {
        Path::new(default_dir).join(name)
    }
}

impl SecretReference {
    /// Absolute path of the secret inside the container.
    #[must_use]
    pub fn target_path(&self) -> PathBuf {
        target_path(CONTAINER_SECRET_MOUNT_PATH, &self.file.name)
    }
}

impl ConfigReference {
    /// Absolute path of the config inside the container.
    #[must_use]
    pub fn target_path(&self) -> PathBuf {
        target_path(CONTAINER_CONFIG_MOUNT_PATH, &self.file.name)
    }
}

/// Named-volume collaborator.
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    /// Mounts `name` for `container`, returning the host path.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be mounted.
    async fn mount(&self, name: &str, container: &ContainerId) -> Result<PathBuf>;

    /// Releases the mount held by `container`.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be unmounted.
    async fn unmount(&self, name: &str, container: &ContainerId) -> Result<()>;

    /// Deletes the volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be removed.
    async fn remove(&self, name: &str) -> Result<()>;
}

/// Resolves secret and config material before start.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Returns the content of a secret.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the secret is unknown.
    async fn secret(&self, secret_id: &str) -> Result<Vec<u8>>;

    /// Returns the content of a config.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the config is unknown.
    async fn config(&self, config_id: &str) -> Result<Vec<u8>>;
}
