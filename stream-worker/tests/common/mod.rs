//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use stream_worker::database::models::{
    NewStreamMeta, SegmentProgress, StreamMetaDbModel, StreamStateDbModel,
};
use stream_worker::database::repositories::StreamRepository;
use stream_worker::database::time::now_ms;
use stream_worker::storage::ObjectStore;
use stream_worker::transcode::{
    ExitOutcome, ExitReporter, LaunchRequest, ProcessControl, ShutdownTimeouts, TranscodeLauncher,
    TranscodeProcess, exit_channel,
};
use stream_worker::{Error, Result};

/// Short timeouts so shutdown tests finish quickly.
pub fn fast_timeouts() -> ShutdownTimeouts {
    ShutdownTimeouts {
        natural_exit: Duration::from_millis(50),
        graceful: Duration::from_secs(1),
        kill_grace: Duration::from_secs(1),
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Control of a fake process: exits when asked to stop or killed.
struct FakeControl {
    reporter: Arc<ExitReporter>,
    ignore_graceful: bool,
}

#[async_trait]
impl ProcessControl for FakeControl {
    async fn request_graceful_stop(&self) -> std::io::Result<()> {
        if !self.ignore_graceful {
            self.reporter.report(ExitOutcome::success());
        }
        Ok(())
    }

    fn force_kill(&self) {
        self.reporter.report(ExitOutcome::failure("signal: 9 (SIGKILL)"));
    }

    fn kill_error(&self) -> Option<String> {
        None
    }
}

/// A launched fake process and the handle that ends it.
#[derive(Clone)]
pub struct Launched {
    pub request: LaunchRequest,
    pub process: Arc<TranscodeProcess>,
    reporter: Arc<ExitReporter>,
}

impl Launched {
    /// Make the process exit on its own with an error.
    pub fn crash(&self, error: &str) {
        self.reporter.report(ExitOutcome::failure(error));
    }
}

/// Launcher that records requests and hands out fake processes.
pub struct FakeLauncher {
    output_root: PathBuf,
    timeouts: ShutdownTimeouts,
    launched: Mutex<Vec<Launched>>,
    failures_left: AtomicUsize,
    crash_on_launch: bool,
    ignore_graceful: bool,
    launch_delay: Duration,
}

impl FakeLauncher {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            timeouts: fast_timeouts(),
            launched: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(0),
            crash_on_launch: false,
            ignore_graceful: false,
            launch_delay: Duration::ZERO,
        }
    }

    /// Every launched process exits with an error right away.
    pub fn crashing(mut self) -> Self {
        self.crash_on_launch = true;
        self
    }

    /// The next `count` launches fail before a process exists.
    pub fn failing(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    /// Processes ignore the graceful stop request.
    pub fn stubborn(mut self) -> Self {
        self.ignore_graceful = true;
        self
    }

    /// Every launch takes `delay` before it succeeds or fails.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    pub fn launch_count(&self) -> usize {
        self.launched.lock().len()
    }

    pub fn launched(&self) -> Vec<Launched> {
        self.launched.lock().clone()
    }

    pub fn last(&self) -> Option<Launched> {
        self.launched.lock().last().cloned()
    }
}

#[async_trait]
impl TranscodeLauncher for FakeLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<Arc<TranscodeProcess>> {
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::process("failed to start ffmpeg: not found"));
        }

        let (reporter, watch) = exit_channel();
        let reporter = Arc::new(reporter);
        let control = FakeControl {
            reporter: reporter.clone(),
            ignore_graceful: self.ignore_graceful,
        };
        let process = Arc::new(TranscodeProcess::new(
            request.stream_id.clone(),
            Box::new(control),
            self.timeouts,
            watch,
        ));

        let launched = Launched {
            request: request.clone(),
            process: process.clone(),
            reporter,
        };
        if self.crash_on_launch {
            launched.crash("exit status: 1: Connection refused");
        }
        self.launched.lock().push(launched);

        Ok(process)
    }

    fn output_root(&self) -> &Path {
        &self.output_root
    }
}

/// In-memory repository mirroring the SQL implementation's not-found rules.
#[derive(Default)]
pub struct MemoryRepository {
    streams: Mutex<HashMap<String, StreamStateDbModel>>,
    metas: Mutex<HashMap<String, StreamMetaDbModel>>,
    progress: Mutex<Vec<(String, SegmentProgress)>>,
    set_started_failures: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_stream(&self, stream_id: &str, is_live: bool) {
        let now = now_ms();
        self.streams.lock().insert(
            stream_id.to_string(),
            StreamStateDbModel {
                id: stream_id.to_string(),
                is_live,
                started_at: None,
                ended_at: None,
                created_at: now,
                updated_at: now,
            },
        );
    }

    /// The next `count` calls to `set_started` fail.
    pub fn fail_set_started(&self, count: usize) {
        self.set_started_failures.store(count, Ordering::SeqCst);
    }

    pub fn stream(&self, stream_id: &str) -> Option<StreamStateDbModel> {
        self.streams.lock().get(stream_id).cloned()
    }

    pub fn meta(&self, stream_id: &str) -> Option<StreamMetaDbModel> {
        self.metas.lock().get(stream_id).cloned()
    }

    /// Every progress write, oldest first.
    pub fn progress_writes(&self, stream_id: &str) -> Vec<SegmentProgress> {
        self.progress
            .lock()
            .iter()
            .filter(|(id, _)| id == stream_id)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl StreamRepository for MemoryRepository {
    async fn get_meta(&self, stream_id: &str) -> Result<StreamMetaDbModel> {
        self.meta(stream_id)
            .ok_or_else(|| Error::not_found("StreamMeta", stream_id))
    }

    async fn create_meta(&self, meta: &NewStreamMeta) -> Result<StreamMetaDbModel> {
        let now = now_ms();
        let model = StreamMetaDbModel {
            id: uuid::Uuid::new_v4().to_string(),
            stream_id: meta.stream_id.clone(),
            segment_duration: meta.segment_duration,
            timescale: meta.timescale,
            representation_ids: serde_json::to_string(&meta.representation_ids)?,
            base_path: meta.base_path.clone(),
            total_duration: 0,
            segment_count: 0,
            last_segment_seq: 0,
            created_at: now,
            updated_at: now,
        };
        self.metas
            .lock()
            .insert(meta.stream_id.clone(), model.clone());
        Ok(model)
    }

    async fn update_meta_with_segments(
        &self,
        stream_id: &str,
        progress: &SegmentProgress,
    ) -> Result<()> {
        let mut metas = self.metas.lock();
        let meta = metas
            .get_mut(stream_id)
            .ok_or_else(|| Error::not_found("StreamMeta", stream_id))?;
        meta.total_duration = progress.total_duration;
        meta.segment_count = progress.segment_count;
        meta.last_segment_seq = progress.last_segment_seq;
        meta.updated_at = now_ms();
        drop(metas);

        self.progress
            .lock()
            .push((stream_id.to_string(), progress.clone()));
        Ok(())
    }

    async fn get_stream_by_id(&self, stream_id: &str) -> Result<StreamStateDbModel> {
        self.stream(stream_id)
            .ok_or_else(|| Error::not_found("Stream", stream_id))
    }

    async fn set_started(&self, stream_id: &str) -> Result<()> {
        let failed = self
            .set_started_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::DatabaseSqlx(sqlx::Error::PoolTimedOut));
        }
        let mut streams = self.streams.lock();
        let stream = streams
            .get_mut(stream_id)
            .ok_or_else(|| Error::not_found("Stream", stream_id))?;
        let now = now_ms();
        stream.started_at = Some(now);
        stream.updated_at = now;
        Ok(())
    }
}

/// Object store that records uploads and can fail chosen keys once.
#[derive(Default)]
pub struct RecordingStore {
    puts: Mutex<Vec<(String, String)>>,
    fail_once: Mutex<HashSet<String>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_once(&self, key: &str) {
        self.fail_once.lock().insert(key.to_string());
    }

    /// `(key, content type)` of every successful upload.
    pub fn puts(&self) -> Vec<(String, String)> {
        self.puts.lock().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.puts.lock().iter().map(|(k, _)| k.clone()).collect()
    }
}

#[async_trait]
impl ObjectStore for RecordingStore {
    async fn put(&self, local_path: &Path, key: &str, content_type: &str) -> Result<()> {
        if self.fail_once.lock().remove(key) {
            return Err(Error::storage(format!("upload of {key} rejected")));
        }
        if !local_path.is_file() {
            return Err(Error::storage(format!("missing {}", local_path.display())));
        }
        self.puts
            .lock()
            .push((key.to_string(), content_type.to_string()));
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}
