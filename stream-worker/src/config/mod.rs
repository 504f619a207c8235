//! Worker configuration.
//!
//! Everything is read from environment variables (a `.env` file is loaded by
//! the binary first). Unset, empty or unparsable values keep their defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::gc::GcConfig;
use crate::lifecycle::DispatcherConfig;
use crate::storage::{StorageBackend, StorageConfig};
use crate::tracker::TrackerConfig;
use crate::transcode::{FfmpegConfig, ShutdownTimeouts, TranscodeProfile};

/// Default SQLite database location.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:stream-worker.db?mode=rwc";

/// Top-level worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub profile: TranscodeProfile,
    pub output_dir: PathBuf,
    pub ffmpeg_path: String,
    pub database_url: String,
    pub log_dir: PathBuf,
    pub dispatcher: DispatcherConfig,
    pub storage: StorageConfig,
    pub shutdown: ShutdownTimeouts,
    pub tracker: TrackerConfig,
    pub gc: GcConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            profile: TranscodeProfile::default(),
            output_dir: PathBuf::from("./output"),
            ffmpeg_path: "ffmpeg".to_string(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            log_dir: PathBuf::from("./logs"),
            dispatcher: DispatcherConfig::default(),
            storage: StorageConfig::default(),
            shutdown: ShutdownTimeouts::default(),
            tracker: TrackerConfig::default(),
            gc: GcConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Build the configuration from the process environment.
    pub fn from_env_or_default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut config = Self::default();

        if let Some(app_env) = env.string("APP_ENV") {
            config.profile = TranscodeProfile::from_env_name(&app_env);
        }
        if let Some(dir) = env.string("OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(path) = env.string("FFMPEG_PATH") {
            config.ffmpeg_path = path;
        }
        if let Some(url) = env.string("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = env.string("LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        if let Some(count) = env.parse::<usize>("WORKER_COUNT")
            && count > 0
        {
            config.dispatcher.worker_count = count;
        }
        if let Some(capacity) = env.parse::<usize>("QUEUE_CAPACITY")
            && capacity > 0
        {
            config.dispatcher.queue_capacity = capacity;
        }

        if let Some(backend) = env.parse::<StorageBackend>("STORAGE_BACKEND") {
            config.storage.backend = backend;
        }
        if let Some(path) = env.string("RCLONE_PATH") {
            config.storage.rclone_path = path;
        }
        if let Some(remote) = env.string("RCLONE_REMOTE") {
            config.storage.remote = remote;
        }
        if let Some(bucket) = env.string("STORAGE_BUCKET") {
            config.storage.bucket = bucket;
        }
        if let Some(root) = env.string("STORAGE_LOCAL_ROOT") {
            config.storage.local_root = PathBuf::from(root);
        }

        if let Some(secs) = env.parse::<u64>("STOP_NATURAL_EXIT_SECS") {
            config.shutdown.natural_exit = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("STOP_GRACEFUL_SECS") {
            config.shutdown.graceful = Duration::from_secs(secs);
        }
        if let Some(ms) = env.parse::<u64>("STOP_KILL_GRACE_MS") {
            config.shutdown.kill_grace = Duration::from_millis(ms);
        }

        config
    }

    /// Launcher settings derived from this configuration.
    pub fn ffmpeg(&self) -> FfmpegConfig {
        FfmpegConfig {
            binary_path: self.ffmpeg_path.clone(),
            output_root: self.output_dir.clone(),
            profile: self.profile,
            shutdown: self.shutdown,
            ..FfmpegConfig::default()
        }
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.string(key)?;
        match raw.parse::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(key, value = %raw, "Ignoring invalid configuration value");
                None
            }
        }
    }
}
