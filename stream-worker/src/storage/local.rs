//! Object store that mirrors keys into a local directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::ObjectStore;
use crate::utils::fs::{ensure_parent_dir, io_error};
use crate::{Error, Result};

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path for `key`. Keys are `/`-separated and must stay under the root.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for part in key.split('/') {
            if part.is_empty() || part == "." || part == ".." || part.contains('\\') {
                return Err(Error::storage(format!("invalid object key '{key}'")));
            }
            path.push(part);
        }
        Ok(path)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, local: &Path, key: &str, content_type: &str) -> Result<()> {
        let target = self.path_for(key)?;
        ensure_parent_dir(&target).await?;
        tokio::fs::copy(local, &target)
            .await
            .map_err(|e| io_error("copying object", &target, e))?;
        debug!(key, content_type, "Stored object");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let target = self.path_for(key)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("deleting object", &target, e)),
        }
    }
}
