//! Segment tracker.
//!
//! One tracker runs per active stream. It polls the stream directory, uploads
//! segments once they have stopped changing, keeps the persisted segment
//! metadata current and prunes old local chunks behind a live buffer.

pub mod segment;
pub mod stability;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::database::models::{NewStreamMeta, SegmentProgress};
use crate::database::repositories::StreamRepository;
use crate::storage::{ObjectStore, object_key, stream_base_path};
use crate::utils::fs::list_files_matching;

pub use segment::SegmentFile;
pub use stability::is_stable;

/// Tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Interval between directory scans in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Wait between the two stats of the stability check in milliseconds.
    #[serde(default = "default_settle_window_ms")]
    pub settle_window_ms: u64,

    /// Persist progress whenever an uploaded sequence is a multiple of this.
    #[serde(default = "default_progress_every")]
    pub progress_every: i64,

    /// Uploaded chunks kept locally behind the newest sequence.
    #[serde(default = "default_live_buffer_segments")]
    pub live_buffer_segments: i64,

    /// Segment length in timescale units.
    #[serde(default = "default_segment_duration")]
    pub segment_duration: i64,

    #[serde(default = "default_timescale")]
    pub timescale: i64,

    #[serde(default = "default_representation_ids")]
    pub representation_ids: Vec<String>,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_settle_window_ms() -> u64 {
    100
}

fn default_progress_every() -> i64 {
    5
}

fn default_live_buffer_segments() -> i64 {
    30
}

fn default_segment_duration() -> i64 {
    2000
}

fn default_timescale() -> i64 {
    1000
}

fn default_representation_ids() -> Vec<String> {
    vec!["0".to_string(), "1".to_string()]
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            settle_window_ms: default_settle_window_ms(),
            progress_every: default_progress_every(),
            live_buffer_segments: default_live_buffer_segments(),
            segment_duration: default_segment_duration(),
            timescale: default_timescale(),
            representation_ids: default_representation_ids(),
        }
    }
}

impl TrackerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_settle_window_ms(mut self, ms: u64) -> Self {
        self.settle_window_ms = ms;
        self
    }

    pub fn with_live_buffer_segments(mut self, segments: i64) -> Self {
        self.live_buffer_segments = segments;
        self
    }
}

/// Upload and prune cursors. `-1` means nothing seen yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursors {
    pub uploaded_seq: i64,
    pub last_segment_seq: i64,
}

impl Default for Cursors {
    fn default() -> Self {
        Self {
            uploaded_seq: -1,
            last_segment_seq: -1,
        }
    }
}

/// Sequence below which local chunks may be deleted, or `None` when nothing
/// is eligible yet.
pub fn prune_threshold(cursors: Cursors, live_buffer_segments: i64) -> Option<i64> {
    if cursors.uploaded_seq <= 0 || cursors.last_segment_seq <= 0 {
        return None;
    }
    let behind_live = cursors.last_segment_seq - live_buffer_segments;
    if behind_live <= 0 {
        return None;
    }
    Some(behind_live.min(cursors.uploaded_seq))
}

/// Tracks the output of one stream.
pub struct SegmentTracker {
    stream_id: String,
    stream_dir: PathBuf,
    config: TrackerConfig,
    repo: Arc<dyn StreamRepository>,
    store: Arc<dyn ObjectStore>,
    cursors: RwLock<Cursors>,
    uploaded: Mutex<HashSet<String>>,
    meta_ready: AtomicBool,
    /// A stable first chunk was seen; the started mark is owed.
    pending_started: AtomicBool,
    started: AtomicBool,
}

impl SegmentTracker {
    pub fn new(
        stream_id: impl Into<String>,
        stream_dir: impl Into<PathBuf>,
        config: TrackerConfig,
        repo: Arc<dyn StreamRepository>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            stream_dir: stream_dir.into(),
            config,
            repo,
            store,
            cursors: RwLock::new(Cursors::default()),
            uploaded: Mutex::new(HashSet::new()),
            meta_ready: AtomicBool::new(false),
            pending_started: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn cursors(&self) -> Cursors {
        *self.cursors.read()
    }

    /// Whether the stream has been marked started.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Spawn the poll loop. Cancelling `token` ends it after a final flush.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(token).await })
    }

    /// Poll until `token` is cancelled, then finalize.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            stream_id = %self.stream_id,
            stream_dir = %self.stream_dir.display(),
            "Segment tracker started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.scan_and_upload().await,
            }
        }

        self.finalize().await;
    }

    /// One tick: ensure metadata, upload stable new segments, record progress, prune.
    pub async fn scan_and_upload(&self) {
        if !self.meta_ready.load(Ordering::SeqCst) {
            self.ensure_metadata().await;
        }
        if self.pending_started.load(Ordering::SeqCst) && !self.is_started() {
            self.mark_started().await;
        }

        let files = match list_files_matching(&self.stream_dir, segment::is_segment).await {
            Ok(files) => files,
            Err(e) => {
                debug!(stream_id = %self.stream_id, error = %e, "Segment scan skipped");
                return;
            }
        };

        for path in files {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };
            let Some(segment) = SegmentFile::parse(&file_name) else {
                continue;
            };
            if self.uploaded.lock().contains(&file_name) {
                continue;
            }
            if !is_stable(&path, self.config.settle_window()).await {
                continue;
            }

            if segment.seq() == Some(1) && !self.pending_started.swap(true, Ordering::SeqCst) {
                self.mark_started().await;
            }

            let key = object_key(&self.stream_id, &file_name);
            if let Err(e) = self.store.put(&path, &key, segment.content_type()).await {
                error!(stream_id = %self.stream_id, file = %file_name, error = %e, "Failed to upload segment");
                continue;
            }
            self.uploaded.lock().insert(file_name.clone());

            let Some(seq) = segment.seq() else {
                info!(stream_id = %self.stream_id, file = %file_name, "Uploaded init segment");
                continue;
            };
            debug!(stream_id = %self.stream_id, file = %file_name, seq, "Uploaded segment");

            {
                let mut cursors = self.cursors.write();
                cursors.last_segment_seq = cursors.last_segment_seq.max(seq);
                cursors.uploaded_seq = cursors.uploaded_seq.max(seq);
            }

            if self.config.progress_every > 0 && seq % self.config.progress_every == 0 {
                self.write_progress(self.progress()).await;
            }
        }

        self.prune().await;
    }

    /// Final flush: one more scan, then the definitive metadata.
    pub async fn finalize(&self) {
        self.scan_and_upload().await;

        if let Err(e) = self.repo.get_meta(&self.stream_id).await {
            if e.is_not_found() {
                if let Err(e) = self.repo.create_meta(&self.new_meta()).await {
                    error!(stream_id = %self.stream_id, error = %e, "Failed to create stream meta during finalization");
                }
            } else {
                error!(stream_id = %self.stream_id, error = %e, "Failed to check stream meta existence");
            }
        }

        let progress = self.final_progress();
        self.write_progress(progress.clone()).await;

        info!(
            stream_id = %self.stream_id,
            segments = progress.segment_count,
            duration = progress.total_duration,
            "Stream finalized"
        );
    }

    async fn ensure_metadata(&self) {
        match self.repo.get_meta(&self.stream_id).await {
            Ok(_) => self.meta_ready.store(true, Ordering::SeqCst),
            Err(e) if e.is_not_found() => match self.repo.create_meta(&self.new_meta()).await {
                Ok(_) => {
                    self.meta_ready.store(true, Ordering::SeqCst);
                    info!(stream_id = %self.stream_id, "Stream metadata initialized");
                }
                Err(e) => {
                    error!(stream_id = %self.stream_id, error = %e, "Failed to create stream meta")
                }
            },
            Err(e) => warn!(stream_id = %self.stream_id, error = %e, "Failed to load stream meta"),
        }
    }

    async fn mark_started(&self) {
        match self.repo.set_started(&self.stream_id).await {
            Ok(()) => {
                self.started.store(true, Ordering::SeqCst);
                info!(stream_id = %self.stream_id, "Stream started (first segment)");
            }
            Err(e) => {
                error!(stream_id = %self.stream_id, error = %e, "Failed to set stream started")
            }
        }
    }

    async fn write_progress(&self, progress: SegmentProgress) {
        if let Err(e) = self
            .repo
            .update_meta_with_segments(&self.stream_id, &progress)
            .await
        {
            error!(stream_id = %self.stream_id, error = %e, "Failed to update stream meta");
        }
    }

    /// Local chunks with `0 < seq < threshold` are removed.
    async fn prune(&self) {
        let Some(threshold) = prune_threshold(self.cursors(), self.config.live_buffer_segments)
        else {
            return;
        };

        let chunks = match list_files_matching(&self.stream_dir, segment::is_media_segment).await {
            Ok(chunks) => chunks,
            Err(_) => return,
        };

        let mut doomed: Vec<(PathBuf, String)> = chunks
            .into_iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?.to_string();
                let seq = SegmentFile::parse(&name)?.seq()?;
                (seq > 0 && seq < threshold).then_some((path, name))
            })
            .collect();
        doomed.sort();

        for (path, name) in doomed {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    self.uploaded.lock().remove(&name);
                    debug!(stream_id = %self.stream_id, file = %name, "Cleaned up old local chunk");
                }
                Err(e) => {
                    debug!(stream_id = %self.stream_id, file = %name, error = %e, "Failed to remove local chunk")
                }
            }
        }
    }

    fn new_meta(&self) -> NewStreamMeta {
        NewStreamMeta {
            stream_id: self.stream_id.clone(),
            segment_duration: self.config.segment_duration,
            timescale: self.config.timescale,
            representation_ids: self.config.representation_ids.clone(),
            base_path: stream_base_path(&self.stream_id),
        }
    }

    /// Running progress: the newest sequence counts as a complete segment.
    fn progress(&self) -> SegmentProgress {
        let last = self.cursors().last_segment_seq;
        self.progress_with(last + 1, last)
    }

    /// Definitive progress written once the stream is over.
    fn final_progress(&self) -> SegmentProgress {
        let last = self.cursors().last_segment_seq.max(0);
        self.progress_with(last, last)
    }

    fn progress_with(&self, count: i64, last_seq: i64) -> SegmentProgress {
        let count = count.max(0);
        SegmentProgress {
            total_duration: count * self.config.segment_duration,
            segment_count: count,
            last_segment_seq: last_seq,
            segment_duration: self.config.segment_duration,
            timescale: self.config.timescale,
            representation_ids: self.config.representation_ids.clone(),
            base_path: stream_base_path(&self.stream_id),
        }
    }
}

impl std::fmt::Debug for SegmentTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentTracker")
            .field("stream_id", &self.stream_id)
            .field("stream_dir", &self.stream_dir)
            .field("cursors", &self.cursors())
            .finish()
    }
}
