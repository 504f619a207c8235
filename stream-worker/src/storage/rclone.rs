//! Rclone-backed object store.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tracing::{debug, error};

use super::ObjectStore;
use crate::{Error, Result};

/// Uploads and deletes objects by running the rclone binary.
pub struct RcloneObjectStore {
    rclone_path: String,
    remote: String,
    bucket: String,
}

impl RcloneObjectStore {
    pub fn new(
        rclone_path: impl Into<String>,
        remote: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            rclone_path: rclone_path.into(),
            remote: remote.into(),
            bucket: bucket.into(),
        }
    }

    /// Remote destination for `key`, e.g. `minio:media/streams/s1/init-0.mp4`.
    pub fn destination(&self, key: &str) -> String {
        format!("{}:{}/{}", self.remote, self.bucket, key)
    }

    fn put_args(&self, local: &Path, key: &str, content_type: &str) -> Vec<String> {
        vec![
            "--log-level".to_string(),
            "ERROR".to_string(),
            "copyto".to_string(),
            local.to_string_lossy().into_owned(),
            self.destination(key),
            "--header-upload".to_string(),
            format!("Content-Type: {content_type}"),
        ]
    }

    fn delete_args(&self, key: &str) -> Vec<String> {
        vec![
            "--log-level".to_string(),
            "ERROR".to_string(),
            "deletefile".to_string(),
            self.destination(key),
        ]
    }

    async fn run(&self, op: &str, args: Vec<String>) -> Result<()> {
        debug!(op, args = ?args, "Running rclone");

        let output = process_utils::tokio_command(&self.rclone_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::storage(format!("Failed to execute rclone: {e}")))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = stderr
            .lines()
            .rfind(|l| !l.trim().is_empty())
            .unwrap_or("Unknown error")
            .trim()
            .to_string();
        error!(op, status = %process_utils::describe_exit(&output.status), "Rclone failed: {}", message);
        Err(Error::storage(format!("rclone {op} failed: {message}")))
    }
}

#[async_trait]
impl ObjectStore for RcloneObjectStore {
    async fn put(&self, local: &Path, key: &str, content_type: &str) -> Result<()> {
        self.run("copyto", self.put_args(local, key, content_type))
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.run("deletefile", self.delete_args(key)).await
    }
}
