//! Loading container records at daemon start.

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::sync::Arc;

use harbord_common::config::BackoffConfig;
use harbord_common::constants::CONTAINER_DIR_MODE;
use harbord_common::error::{HarbordError, Result};

use crate::container::{Container, ContainerInner};
use crate::store::Store;
use crate::view::ViewDb;

/// Loads every container directory under `root` into `store` and `views`.
///
/// Directories that cannot be loaded are logged and skipped so one broken
/// record never keeps the daemon from starting.
///
/// # Errors
///
/// Returns an error only if `root` itself cannot be created or listed.
pub fn load_containers(
    root: &Path,
    store: &Store,
    views: &ViewDb,
    backoff: BackoffConfig,
) -> Result<Vec<Arc<Container>>> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(CONTAINER_DIR_MODE)
        .create(root)
        .map_err(|e| HarbordError::io(root, e))?;
    let entries = fs::read_dir(root).map_err(|e| HarbordError::io(root, e))?;

    let mut loaded = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "failed to read container directory entry");
                continue;
            }
        };
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let dir_name = entry.file_name().to_string_lossy().into_owned();
        let mut inner = match ContainerInner::from_disk(&path) {
            Ok(inner) => inner,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to load container");
                continue;
            }
        };
        if inner.id().as_str() != dir_name {
            tracing::error!(
                path = %path.display(),
                id = %inner.id(),
                "container ID does not match its directory, skipping"
            );
            continue;
        }
        inner.set_backoff(backoff);
        if let Err(e) = store.reserve_name(inner.name(), inner.id()) {
            tracing::error!(id = %inner.id(), name = %inner.name(), error = %e, "failed to register container name");
        }
        inner.commit_in_memory(views);
        tracing::debug!(id = %inner.id(), status = %inner.state().status, "loaded container");

        let container = Arc::new(Container::new(inner));
        store.add(Arc::clone(&container));
        loaded.push(container);
    }
    tracing::info!(count = loaded.len(), "containers loaded");
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use harbord_common::constants::CONFIG_FILE_NAME;
    use harbord_common::types::ContainerId;

    use super::*;
    use crate::container::{ContainerConfig, ContainerDoc, HostConfig};

    fn write_container(root: &Path, id: &str, name: &str) {
        let dir = root.join(id);
        fs::create_dir_all(&dir).unwrap();
        let doc = ContainerDoc::new(ContainerId::new(id), name.into(), ContainerConfig::default());
        let _ = ContainerInner::new(dir, doc, HostConfig::default())
            .to_disk()
            .unwrap();
    }

    #[test]
    fn loads_good_records_and_skips_bad_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_container(dir.path(), "aaa", "web");
        write_container(dir.path(), "bbb", "db");
        fs::create_dir_all(dir.path().join("broken")).unwrap();
        fs::write(dir.path().join("broken").join(CONFIG_FILE_NAME), b"{").unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();
        fs::write(dir.path().join("stray-file"), b"x").unwrap();

        let store = Store::new();
        let views = ViewDb::new();
        let loaded =
            load_containers(dir.path(), &store, &views, BackoffConfig::default()).unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(store.size(), 2);
        assert_eq!(store.get_by_name("db").unwrap().id().as_str(), "bbb");
        assert_eq!(views.list().len(), 2);
    }

    #[test]
    fn mismatched_directory_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_container(dir.path(), "aaa", "web");
        fs::rename(dir.path().join("aaa"), dir.path().join("zzz")).unwrap();

        let store = Store::new();
        let loaded =
            load_containers(dir.path(), &store, &ViewDb::new(), BackoffConfig::default())
                .unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn creates_missing_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("containers");
        let loaded =
            load_containers(&root, &Store::new(), &ViewDb::new(), BackoffConfig::default())
                .unwrap();
        assert!(loaded.is_empty());
        assert!(root.is_dir());
    }
}
