//! On-disk persistence of container records.
//!
//! Each container directory holds `config.v2.json` (the document) and
//! `hostconfig.json`. Both are replaced atomically: written to a temporary
//! file in the same directory, synced, then renamed over the target.

use std::fs::{self, Permissions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use harbord_common::constants::{CONFIG_FILE_MODE, CONFIG_FILE_NAME, HOST_CONFIG_FILE_NAME};
use harbord_common::error::{HarbordError, Result};
use harbord_common::types::Platform;
use serde::de::DeserializeOwned;

use crate::container::{ContainerDoc, ContainerInner, HostConfig};
use crate::view::{ContainerSnapshot, ViewDb};

/// Atomically replaces `path` with `data`, leaving it with `mode`.
///
/// # Errors
///
/// Returns an I/O error if any step fails; the previous content then stays
/// intact.
pub fn atomic_write(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| HarbordError::system(format!("{} has no parent", path.display())))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .map_err(|e| HarbordError::io(dir, e))?;
    tmp.write_all(data).map_err(|e| HarbordError::io(tmp.path(), e))?;
    tmp.as_file()
        .set_permissions(Permissions::from_mode(mode))
        .map_err(|e| HarbordError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| HarbordError::io(tmp.path(), e))?;
    let _ = tmp
        .persist(path)
        .map_err(|e| HarbordError::io(path, e.error))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(HarbordError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| HarbordError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Fills in the image platform of records written before it existed.
fn migrate_platform(doc: &mut ContainerDoc) {
    if doc.image_platform.os.is_empty() {
        let host = Platform::host();
        doc.image_platform = if doc.os.is_empty() {
            host
        } else {
            Platform {
                os: doc.os.clone(),
                ..host
            }
        };
        tracing::debug!(id = %doc.id, os = %doc.image_platform.os, "migrated legacy image platform");
    }
    if doc.os.is_empty() {
        doc.os.clone_from(&doc.image_platform.os);
    }
}

impl ContainerInner {
    /// Loads a container record from its directory.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the document is missing and `Corrupt` if either
    /// file cannot be decoded.
    pub fn from_disk(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE_NAME);
        let mut doc: ContainerDoc = read_json(&config_path)?.ok_or_else(|| HarbordError::NotFound {
            kind: "container document",
            id: config_path.display().to_string(),
        })?;
        migrate_platform(&mut doc);

        let mut host_config: HostConfig =
            read_json(&root.join(HOST_CONFIG_FILE_NAME))?.unwrap_or_default();
        host_config.init_dns();

        Ok(Self::new(root.to_path_buf(), doc, host_config))
    }

    /// Deep copy of the persisted part of the record.
    #[must_use]
    pub fn snapshot(&self) -> ContainerSnapshot {
        ContainerSnapshot {
            doc: self.doc.clone(),
            host_config: self.host_config.clone(),
        }
    }

    /// Writes both documents and returns what was written.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub fn to_disk(&self) -> Result<ContainerSnapshot> {
        let snapshot = self.snapshot();
        let doc = serde_json::to_vec(&snapshot.doc)?;
        atomic_write(&self.config_path(), &doc, CONFIG_FILE_MODE)?;
        let _ = self.write_host_config()?;
        Ok(snapshot)
    }

    /// Writes `hostconfig.json` alone.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub fn write_host_config(&self) -> Result<HostConfig> {
        let host_config = self.host_config.clone();
        let data = serde_json::to_vec(&host_config)?;
        atomic_write(&self.host_config_path(), &data, CONFIG_FILE_MODE)?;
        Ok(host_config)
    }

    /// Persists the record, then publishes it to the view store.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails; the view is left untouched.
    pub fn checkpoint_to(&self, views: &ViewDb) -> Result<()> {
        let snapshot = self.to_disk()?;
        views.save(snapshot);
        Ok(())
    }

    /// Publishes the record to the view store without touching disk.
    pub fn commit_in_memory(&self, views: &ViewDb) {
        views.save(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use harbord_common::types::{ContainerId, ContainerStatus, RestartPolicy};

    use super::*;
    use crate::container::ContainerConfig;

    fn record(root: &Path) -> ContainerInner {
        let doc = ContainerDoc::new(
            ContainerId::new("abc123"),
            "web".into(),
            ContainerConfig {
                cmd: vec!["sleep".into(), "60".into()],
                ..ContainerConfig::default()
            },
        );
        ContainerInner::new(root.to_path_buf(), doc, HostConfig::default())
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut inner = record(dir.path());
        inner.host_config.restart_policy = RestartPolicy::on_failure(3);
        inner.host_config.init_dns();
        inner.state_mut().set_running(42, chrono::Utc::now());
        inner.doc.image_platform = Platform::host();
        inner.doc.os = inner.doc.image_platform.os.clone();
        let written = inner.to_disk().unwrap();

        let loaded = ContainerInner::from_disk(dir.path()).unwrap();
        assert_eq!(loaded.doc, written.doc);
        assert_eq!(loaded.host_config, written.host_config);
        assert_eq!(loaded.state().status, ContainerStatus::Running);
    }

    #[test]
    fn documents_are_private() {
        let dir = tempfile::tempdir().expect("tempdir");
        let inner = record(dir.path());
        let _ = inner.to_disk().unwrap();
        for name in [CONFIG_FILE_NAME, HOST_CONFIG_FILE_NAME] {
            let mode = fs::metadata(dir.path().join(name)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{name}");
        }
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn missing_document_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = ContainerInner::from_disk(dir.path()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn garbage_document_is_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(CONFIG_FILE_NAME), b"{not json").unwrap();
        let err = ContainerInner::from_disk(dir.path()).unwrap_err();
        assert!(matches!(err, HarbordError::Corrupt { .. }));
    }

    #[test]
    fn missing_host_config_gets_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let inner = record(dir.path());
        let doc = serde_json::to_vec(&inner.doc).unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), doc).unwrap();

        let loaded = ContainerInner::from_disk(dir.path()).unwrap();
        assert!(loaded.host_config.restart_policy.is_none());
        assert_eq!(loaded.host_config.dns, Some(Vec::new()));
    }

    #[test]
    fn legacy_os_becomes_image_platform() {
        let dir = tempfile::tempdir().expect("tempdir");
        let legacy = r#"{"ID":"abc123","Created":"2024-01-01T00:00:00Z","Name":"old","OS":"linux"}"#;
        fs::write(dir.path().join(CONFIG_FILE_NAME), legacy).unwrap();

        let loaded = ContainerInner::from_disk(dir.path()).unwrap();
        assert_eq!(loaded.doc.image_platform.os, "linux");
        assert_eq!(loaded.doc.image_platform.architecture, Platform::host().architecture);
        assert_eq!(loaded.state().status, ContainerStatus::Created);
    }

    #[test]
    fn views_follow_checkpoints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let views = ViewDb::new();
        let mut inner = record(dir.path());
        inner.checkpoint_to(&views).unwrap();
        assert_eq!(views.get(inner.id()).unwrap().doc.name, "web");

        inner.doc.name = "renamed".into();
        inner.commit_in_memory(&views);
        assert_eq!(views.get(inner.id()).unwrap().doc.name, "renamed");
        let on_disk = ContainerInner::from_disk(dir.path()).unwrap();
        assert_eq!(on_disk.doc.name, "web");
    }

    #[test]
    fn failed_replace_keeps_the_target_and_cleans_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("state.json");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("keep"), b"old").unwrap();

        assert!(atomic_write(&target, b"{\"new\":true}", CONFIG_FILE_MODE).is_err());

        assert_eq!(fs::read(target.join("keep")).unwrap(), b"old");
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn interrupted_checkpoint_leaves_a_decodable_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut inner = record(dir.path());
        let _ = inner.to_disk().unwrap();

        fs::remove_file(dir.path().join(HOST_CONFIG_FILE_NAME)).unwrap();
        fs::create_dir(dir.path().join(HOST_CONFIG_FILE_NAME)).unwrap();
        fs::write(dir.path().join(HOST_CONFIG_FILE_NAME).join("x"), b"").unwrap();
        inner.doc.name = "renamed".into();
        assert!(inner.to_disk().is_err());

        let doc: ContainerDoc = read_json(&dir.path().join(CONFIG_FILE_NAME))
            .unwrap()
            .expect("document present");
        assert!(["web", "renamed"].contains(&doc.name.as_str()));
    }

    #[test]
    fn crash_before_rename_keeps_the_previous_record() {
        let root = tempfile::tempdir().expect("tempdir");
        let container_dir = root.path().join("abc123");
        fs::create_dir(&container_dir).unwrap();
        let mut inner = record(&container_dir);
        let _ = inner.to_disk().unwrap();

        inner.doc.name = "renamed".into();
        let half_written = serde_json::to_vec(&inner.doc).unwrap();
        fs::write(
            container_dir.join(".tmp-crashed"),
            &half_written[..half_written.len() / 2],
        )
        .unwrap();

        let on_disk = ContainerInner::from_disk(&container_dir).unwrap();
        assert_eq!(on_disk.doc.name, "web");

        let store = crate::store::Store::new();
        let views = ViewDb::new();
        let loaded = crate::reload::load_containers(
            root.path(),
            &store,
            &views,
            harbord_common::config::BackoffConfig::default(),
        )
        .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(store.resolve("web").unwrap().id().as_str(), "abc123");
    }
}
