//! Garbage collector for local stream output.
//!
//! Periodically reconciles the stream directories under the output root with
//! the persisted stream state and removes the artifacts of streams that are
//! unknown or ended long enough ago.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::database::models::StreamStateDbModel;
use crate::database::repositories::StreamRepository;
use crate::transcode::{
    DASH_MANIFEST, DVR_PLAYLIST, LIVE_PLAYLIST, stream_directory, validate_stream_id,
};
use crate::utils::fs::{list_files_matching, list_subdirectories};

/// Subdirectories the packager may leave behind.
const KNOWN_SUBDIRECTORIES: [&str; 2] = ["internal", "public"];

/// Garbage collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    /// Interval between collection passes in seconds.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// How long after a stream ended its files are kept, in seconds.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_grace_period_secs() -> u64 {
    600
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

impl GcConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// What to do with one stream directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum GcDecision {
    /// No stream record exists.
    CleanupOrphan,
    /// The stream ended longer ago than the grace period.
    CleanupEnded,
    /// The stream is live.
    KeepLive,
    /// Not live, but still within the grace period or without an end time.
    Keep,
}

impl GcDecision {
    pub fn should_cleanup(&self) -> bool {
        matches!(self, Self::CleanupOrphan | Self::CleanupEnded)
    }
}

/// Decide the fate of a directory from the stream's persisted state.
pub fn decide(state: Option<&StreamStateDbModel>, now: DateTime<Utc>, grace: Duration) -> GcDecision {
    let Some(state) = state else {
        return GcDecision::CleanupOrphan;
    };
    if state.is_live {
        return GcDecision::KeepLive;
    }

    match state.ended_at() {
        Some(ended_at) => {
            let ended_ago = now.signed_duration_since(ended_at);
            match ended_ago.to_std() {
                Ok(ago) if ago > grace => GcDecision::CleanupEnded,
                _ => GcDecision::Keep,
            }
        }
        None => GcDecision::Keep,
    }
}

/// Whether `file_name` is an artifact the collector removes.
pub fn is_collectable_artifact(file_name: &str) -> bool {
    const EXACT: [&str; 5] = [
        DASH_MANIFEST,
        "manifest.mpd.tmp",
        DVR_PLAYLIST,
        LIVE_PLAYLIST,
        "live.m3u8.tmp",
    ];
    if EXACT.contains(&file_name) {
        return true;
    }

    let matches = |prefix: &str, suffix: &str| {
        file_name.len() > prefix.len() + suffix.len()
            && file_name.starts_with(prefix)
            && file_name.ends_with(suffix)
    };
    matches("init-", ".mp4") || matches("chunk-", ".m4s") || matches("seg_", ".ts")
}

pub struct GarbageCollector {
    repo: Arc<dyn StreamRepository>,
    output_root: PathBuf,
    config: GcConfig,
}

impl GarbageCollector {
    pub fn new(
        repo: Arc<dyn StreamRepository>,
        output_root: impl Into<PathBuf>,
        config: GcConfig,
    ) -> Self {
        Self {
            repo,
            output_root: output_root.into(),
            config,
        }
    }

    /// Spawn the collection loop; it ends when `token` is cancelled.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(token).await })
    }

    pub async fn run(&self, token: CancellationToken) {
        info!(
            interval_secs = self.config.interval_secs,
            output_root = %self.output_root.display(),
            "Garbage collector started"
        );

        let mut ticker = tokio::time::interval(self.config.interval());
        // The first tick of `interval` completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Garbage collector stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.collect_once(Utc::now()).await;
                }
            }
        }
    }

    /// One pass over the output root. Returns the ids whose directories were cleaned.
    pub async fn collect_once(&self, now: DateTime<Utc>) -> Vec<String> {
        let stream_ids = match list_subdirectories(&self.output_root).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "GC: Failed to read output directory");
                return Vec::new();
            }
        };
        if stream_ids.is_empty() {
            return Vec::new();
        }

        debug!(count = stream_ids.len(), "GC: Found local stream directories");

        let mut cleaned = Vec::new();
        for stream_id in stream_ids {
            let state = match self.repo.get_stream_by_id(&stream_id).await {
                Ok(state) => Some(state),
                Err(e) if e.is_not_found() => None,
                Err(e) => {
                    warn!(stream_id = %stream_id, error = %e, "GC: Failed to load stream state, skipping");
                    continue;
                }
            };

            let decision = decide(state.as_ref(), now, self.config.grace_period());
            if !decision.should_cleanup() {
                continue;
            }

            info!(stream_id = %stream_id, reason = %decision, "GC: Cleaning up stream directory");
            if self.cleanup_stream_directory(&stream_id).await {
                cleaned.push(stream_id);
            }
        }
        cleaned
    }

    /// Remove known artifacts and subdirectories, then the directory itself if
    /// empty. Failures are logged and skipped. Returns whether the directory is gone.
    pub async fn cleanup_stream_directory(&self, stream_id: &str) -> bool {
        if validate_stream_id(stream_id).is_err() {
            warn!(stream_id, "GC: Refusing to clean an invalid stream directory name");
            return false;
        }
        let stream_dir = stream_directory(&self.output_root, stream_id);
        if !tokio::fs::try_exists(&stream_dir).await.unwrap_or(false) {
            return true;
        }

        match list_files_matching(&stream_dir, is_collectable_artifact).await {
            Ok(files) => {
                for path in files {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => debug!(path = %path.display(), "GC: Removed file"),
                        Err(e) => warn!(path = %path.display(), error = %e, "GC: Failed to remove file"),
                    }
                }
            }
            Err(e) => warn!(stream_id, error = %e, "GC: Failed to list stream directory"),
        }

        for subdir in KNOWN_SUBDIRECTORIES {
            // Only empty subdirectories are removed.
            let _ = tokio::fs::remove_dir(stream_dir.join(subdir)).await;
        }

        match remove_dir_if_empty(&stream_dir).await {
            Ok(()) => {
                info!(stream_id, "GC: Cleaned up stream directory");
                true
            }
            Err(e) => {
                warn!(stream_id, error = %e, "GC: Stream directory not removed");
                false
            }
        }
    }
}

async fn remove_dir_if_empty(dir: &std::path::Path) -> Result<()> {
    tokio::fs::remove_dir(dir)
        .await
        .map_err(|e| crate::utils::fs::io_error("removing directory", dir, e))
}
