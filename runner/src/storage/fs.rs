use super::{file_checksum, BlobInfo, ObjectStore};
use crate::error::RemoteError;
use ignore::WalkBuilder;
use itertools::Itertools;
use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Object store backed by a local (or shared network) directory.
///
/// Every container is a directory below `root`, every blob a file inside it. Blob names may
/// contain `/` which maps onto nested directories. Uploads are written to a hidden sibling and
/// renamed into place, listings skip hidden files and therefore never observe a partial upload.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
    account: String,
    key: String,
}

impl FsStore {
    pub fn new(root: PathBuf, account: String, key: String) -> Self {
        Self { root, account, key }
    }

    fn container_path(&self, container: &str) -> Result<PathBuf, RemoteError> {
        if container.is_empty() || container.contains(['/', '\\']) || container.starts_with('.') {
            return Err(RemoteError::Rejected(format!(
                "invalid container name {container:?}"
            )));
        }

        Ok(self.root.join(container))
    }

    fn blob_path(&self, container: &str, blob: &str) -> Result<PathBuf, RemoteError> {
        let relative = Path::new(blob);

        // reject anything escaping the container
        if blob.is_empty()
            || !relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(RemoteError::Rejected(format!("invalid blob name {blob:?}")));
        }

        Ok(self.container_path(container)?.join(relative))
    }
}

impl ObjectStore for FsStore {
    fn create_container(&self, container: &str) -> Result<(), RemoteError> {
        fs::create_dir_all(self.container_path(container)?)?;

        Ok(())
    }

    fn container_exists(&self, container: &str) -> Result<bool, RemoteError> {
        Ok(self.container_path(container)?.is_dir())
    }

    fn delete_container(&self, container: &str) -> Result<(), RemoteError> {
        match fs::remove_dir_all(self.container_path(container)?) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                Err(RemoteError::not_found("container", container))
            }
            Err(error) => Err(error.into()),
        }
    }

    fn list(&self, container: &str) -> Result<Vec<BlobInfo>, RemoteError> {
        let path = self.container_path(container)?;

        if !path.is_dir() {
            return Ok(Vec::new());
        }

        let mut builder = WalkBuilder::new(&path);
        builder
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .ignore(false)
            .parents(false);

        let mut blobs = Vec::new();

        for entry in builder.build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    warn!(error = ?error, container = container, "Failed to list blob");
                    continue;
                }
            };

            if !entry.file_type().map_or(false, |kind| kind.is_file()) {
                continue;
            }

            let name = match entry.path().strip_prefix(&path) {
                Ok(relative) => relative
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy())
                    .join("/"),
                Err(_) => continue,
            };

            blobs.push(BlobInfo {
                name,
                size: entry.metadata().map(|metadata| metadata.len()).unwrap_or(0),
                checksum: None,
            });
        }

        trace!(container = container, count = blobs.len(), "Listed container");

        Ok(blobs)
    }

    fn properties(&self, container: &str, blob: &str) -> Result<Option<BlobInfo>, RemoteError> {
        let path = self.blob_path(container, blob)?;

        match fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => Ok(Some(BlobInfo {
                name: blob.to_owned(),
                size: metadata.len(),
                checksum: Some(file_checksum(&path)?),
            })),
            Ok(_) => Ok(None),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn upload(&self, container: &str, blob: &str, source: &Path) -> Result<(), RemoteError> {
        let target = self.blob_path(container, blob)?;

        if !self.container_exists(container)? {
            return Err(RemoteError::not_found("container", container));
        }

        let parent = target
            .parent()
            .ok_or_else(|| RemoteError::Rejected(format!("invalid blob name {blob:?}")))?;
        fs::create_dir_all(parent)?;

        let staging = parent.join(format!(".upload-{}", Uuid::new_v4()));

        if let Err(error) = fs::copy(source, &staging).and_then(|_| fs::rename(&staging, &target)) {
            let _ = fs::remove_file(&staging);

            return Err(error.into());
        }

        debug!(container = container, blob = blob, "Uploaded blob");

        Ok(())
    }

    fn download(&self, container: &str, blob: &str, target: &Path) -> Result<(), RemoteError> {
        let source = self.blob_path(container, blob)?;

        if !source.is_file() {
            return Err(RemoteError::not_found("blob", format!("{container}/{blob}")));
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::copy(&source, target)?;

        Ok(())
    }

    fn delete(&self, container: &str, blob: &str) -> Result<(), RemoteError> {
        match fs::remove_file(self.blob_path(container, blob)?) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                Err(RemoteError::not_found("blob", format!("{container}/{blob}")))
            }
            Err(error) => Err(error.into()),
        }
    }

    fn container_url(&self, container: &str) -> String {
        format!("file://{}/{container}", self.root.to_string_lossy())
    }

    fn credentials(&self) -> (&str, &str) {
        (&self.account, &self.key)
    }
}
