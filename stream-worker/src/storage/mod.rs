//! Object storage for uploaded segments.

pub mod local;
pub mod rclone;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

pub use local::LocalObjectStore;
pub use rclone::RcloneObjectStore;

/// Content type of init segments.
pub const INIT_CONTENT_TYPE: &str = "video/mp4";
/// Content type of media segments.
pub const MEDIA_CONTENT_TYPE: &str = "video/iso.segment";

/// Key prefix under which all stream objects live.
pub const STREAM_KEY_PREFIX: &str = "streams";

/// Remote key for a file belonging to a stream: `streams/<stream_id>/<file_name>`.
pub fn object_key(stream_id: &str, file_name: &str) -> String {
    format!("{STREAM_KEY_PREFIX}/{stream_id}/{file_name}")
}

/// Base path recorded in stream metadata.
pub fn stream_base_path(stream_id: &str) -> String {
    format!("{STREAM_KEY_PREFIX}/{stream_id}")
}

/// Put/delete capability of the object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload `local` under `key`.
    async fn put(&self, local: &Path, key: &str, content_type: &str) -> Result<()>;

    /// Remove the object stored under `key`.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Which object store implementation to use.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum StorageBackend {
    /// Upload through the rclone binary.
    #[default]
    Rclone,
    /// Mirror objects into a local directory.
    Local,
}

/// Object store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Path to the rclone binary.
    #[serde(default = "default_rclone_path")]
    pub rclone_path: String,

    /// Name of the configured rclone remote.
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Bucket on the remote.
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Root directory for the local backend.
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
}

fn default_rclone_path() -> String {
    "rclone".to_string()
}

fn default_remote() -> String {
    "minio".to_string()
}

fn default_bucket() -> String {
    "media".to_string()
}

fn default_local_root() -> PathBuf {
    PathBuf::from("./storage")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            rclone_path: default_rclone_path(),
            remote: default_remote(),
            bucket: default_bucket(),
            local_root: default_local_root(),
        }
    }
}

/// Build the configured object store.
pub fn build_object_store(config: &StorageConfig) -> Arc<dyn ObjectStore> {
    match config.backend {
        StorageBackend::Rclone => Arc::new(RcloneObjectStore::new(
            config.rclone_path.clone(),
            config.remote.clone(),
            config.bucket.clone(),
        )),
        StorageBackend::Local => Arc::new(LocalObjectStore::new(config.local_root.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_object_key() {
        assert_eq!(object_key("s1", "chunk-0-7.m4s"), "streams/s1/chunk-0-7.m4s");
        assert_eq!(stream_base_path("s1"), "streams/s1");
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!(StorageBackend::from_str("local").unwrap(), StorageBackend::Local);
        assert_eq!(StorageBackend::from_str("RCLONE").unwrap(), StorageBackend::Rclone);
        assert!(StorageBackend::from_str("s3").is_err());
    }

    #[test]
    fn test_storage_config_serde_defaults() {
        let config: StorageConfig = serde_json::from_str(r#"{"backend":"local"}"#).unwrap();
        assert_eq!(config.backend, StorageBackend::Local);
        assert_eq!(config.rclone_path, "rclone");
        assert_eq!(config.bucket, "media");
    }
}
