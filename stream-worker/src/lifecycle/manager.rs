//! Stream lifecycle manager.
//!
//! Commands go through a bounded queue to a fixed pool of workers. Workers are
//! not stream-affine; every decision consults the active-stream map under its
//! lock, and nothing that can block (process stop, tracker flush, I/O) runs
//! while that lock is held.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::command::{StreamAction, StreamCommand};
use super::retry::{RetryDecision, RetryPolicy};
use crate::database::repositories::StreamRepository;
use crate::storage::ObjectStore;
use crate::tracker::{SegmentTracker, TrackerConfig};
use crate::transcode::{LaunchRequest, TranscodeLauncher, TranscodeProcess, stream_directory};
use crate::{Error, Result};

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Number of workers pulling from the queue.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Capacity of the command queue; commands beyond it are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_worker_count() -> usize {
    5
}

fn default_queue_capacity() -> usize {
    1000
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Collaborators shared by every managed stream.
#[derive(Clone)]
pub struct ManagerDeps {
    pub launcher: Arc<dyn TranscodeLauncher>,
    pub repo: Arc<dyn StreamRepository>,
    pub store: Arc<dyn ObjectStore>,
    pub tracker: TrackerConfig,
}

/// A registered stream: its process and the paired tracker.
struct ActiveStream {
    process: Arc<TranscodeProcess>,
    tracker_token: CancellationToken,
    tracker_task: JoinHandle<()>,
}

impl ActiveStream {
    /// Stop the process, then end the tracker and wait for its final flush.
    async fn teardown(self) -> Result<()> {
        let stream_id = self.process.stream_id().to_string();
        let result = self.process.stop().await;

        self.tracker_token.cancel();
        if let Err(e) = self.tracker_task.await {
            warn!(stream_id = %stream_id, error = %e, "Segment tracker task failed");
        }

        result
    }
}

struct ManagerInner {
    config: DispatcherConfig,
    deps: ManagerDeps,
    active: Mutex<HashMap<String, ActiveStream>>,
    sender: Mutex<Option<mpsc::Sender<StreamCommand>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<StreamCommand>>>,
    workers: Mutex<Option<JoinSet<()>>>,
    /// Monitors and pending retries.
    tasks: TaskTracker,
    cancellation_token: CancellationToken,
}

/// Owns the active-stream map and the worker pool.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<ManagerInner>,
}

impl StreamManager {
    pub fn new(config: DispatcherConfig, deps: ManagerDeps) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            inner: Arc::new(ManagerInner {
                config,
                deps,
                active: Mutex::new(HashMap::new()),
                sender: Mutex::new(Some(tx)),
                receiver: Arc::new(tokio::sync::Mutex::new(rx)),
                workers: Mutex::new(Some(JoinSet::new())),
                tasks: TaskTracker::new(),
                cancellation_token: CancellationToken::new(),
            }),
        }
    }

    /// Spawn the worker pool.
    pub fn start(&self) {
        info!(
            worker_count = self.inner.config.worker_count,
            queue_capacity = self.inner.config.queue_capacity,
            "Starting stream manager"
        );

        let mut workers = self.inner.workers.lock();
        let Some(join_set) = workers.as_mut() else {
            warn!("Stream manager already shut down");
            return;
        };

        for worker_id in 0..self.inner.config.worker_count {
            let inner = self.inner.clone();
            join_set.spawn(async move { inner.worker(worker_id).await });
        }
    }

    /// Enqueue a command without waiting. A full or closed queue drops it.
    pub fn dispatch(&self, command: StreamCommand) -> Result<()> {
        self.inner.dispatch(command)
    }

    /// Whether `stream_id` is currently managed here.
    pub fn is_active(&self, stream_id: &str) -> bool {
        self.inner.active.lock().contains_key(stream_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    pub fn active_stream_ids(&self) -> Vec<String> {
        self.inner.active.lock().keys().cloned().collect()
    }

    /// Process handle registered for `stream_id`.
    pub fn process(&self, stream_id: &str) -> Option<Arc<TranscodeProcess>> {
        self.inner
            .active
            .lock()
            .get(stream_id)
            .map(|entry| entry.process.clone())
    }

    /// Stop accepting commands, let workers finish what they are handling,
    /// then stop every stream that is still registered.
    pub async fn shutdown(&self) {
        info!("Shutting down stream manager");
        self.inner.cancellation_token.cancel();
        self.inner.sender.lock().take();

        let workers = self.inner.workers.lock().take();
        if let Some(mut workers) = workers {
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Stream worker task failed");
                }
            }
        }

        let remaining: Vec<(String, ActiveStream)> = self.inner.active.lock().drain().collect();
        if !remaining.is_empty() {
            info!(count = remaining.len(), "Stopping remaining streams");
        }

        join_all(remaining.into_iter().map(|(stream_id, entry)| async move {
            if let Err(e) = entry.teardown().await {
                error!(stream_id = %stream_id, error = %e, "Failed to stop stream during shutdown");
            }
        }))
        .await;

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("Stream manager stopped");
    }
}

impl ManagerInner {
    fn dispatch(&self, command: StreamCommand) -> Result<()> {
        info!(
            stream_id = %command.stream_id,
            action = %command.action,
            retry_count = command.retry_count,
            "Dispatching job"
        );

        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            warn!(stream_id = %command.stream_id, "Stream manager is shut down, dropping command");
            return Err(Error::Dispatch("stream manager is shut down".to_string()));
        };

        match tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(command)) => {
                error!(stream_id = %command.stream_id, "Stream manager queue is full");
                Err(Error::Dispatch(format!(
                    "queue is full, dropped command for stream {}",
                    command.stream_id
                )))
            }
            Err(TrySendError::Closed(command)) => {
                warn!(stream_id = %command.stream_id, "Stream manager queue is closed");
                Err(Error::Dispatch("queue is closed".to_string()))
            }
        }
    }

    async fn worker(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "Stream worker started");

        loop {
            let receiver = self.receiver.clone();
            let command = tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => break,
                command = async move { receiver.lock().await.recv().await } => command,
            };

            let Some(command) = command else {
                break;
            };
            self.handle(command).await;
        }

        debug!(worker_id, "Stream worker stopped");
    }

    async fn handle(self: &Arc<Self>, command: StreamCommand) {
        match command.action {
            StreamAction::Start => {
                if let Err(e) = self.start_stream(&command).await {
                    error!(
                        stream_id = %command.stream_id,
                        action = %command.action,
                        error = %e,
                        "Failed to handle stream action"
                    );
                    self.attempt_retry(command);
                }
            }
            StreamAction::Stop => {
                if let Err(e) = self.cleanup_process(&command.stream_id).await {
                    error!(
                        stream_id = %command.stream_id,
                        action = %command.action,
                        error = %e,
                        "Failed to handle stream action"
                    );
                }
            }
            StreamAction::Unknown => {
                warn!(stream_id = %command.stream_id, "Unknown action, dropping command");
            }
        }
    }

    async fn start_stream(self: &Arc<Self>, command: &StreamCommand) -> Result<()> {
        let stream_id = command.stream_id.as_str();

        let exists = self.active.lock().contains_key(stream_id);
        if exists {
            warn!(stream_id, "Stream already running, force stopping to restart");
            if let Err(e) = self.cleanup_process(stream_id).await {
                error!(stream_id, error = %e, "Failed to cleanup old stream");
            }
        }

        let process = self
            .deps
            .launcher
            .launch(
                &LaunchRequest::new(stream_id, command.source_url.clone())
                    .with_retry_count(command.retry_count),
            )
            .await?;

        let tracker = Arc::new(SegmentTracker::new(
            stream_id,
            self.stream_dir(stream_id),
            self.deps.tracker.clone(),
            self.deps.repo.clone(),
            self.deps.store.clone(),
        ));
        let tracker_token = CancellationToken::new();
        let tracker_task = tracker.spawn(tracker_token.clone());

        let entry = ActiveStream {
            process: process.clone(),
            tracker_token,
            tracker_task,
        };
        let displaced = self.active.lock().insert(stream_id.to_string(), entry);
        if let Some(old) = displaced {
            warn!(stream_id, "Replacing a stream registered concurrently");
            if let Err(e) = old.teardown().await {
                error!(stream_id, error = %e, "Failed to stop replaced stream");
            }
        }

        info!(stream_id, launch_id = %process.launch_id(), "Stream process started");

        let inner = self.clone();
        let command = command.clone();
        self.tasks
            .spawn(async move { inner.monitor(command, process).await });

        Ok(())
    }

    async fn monitor(self: Arc<Self>, command: StreamCommand, process: Arc<TranscodeProcess>) {
        tokio::select! {
            _ = process.done() => {}
            // Shutdown stops every registered stream itself.
            _ = self.cancellation_token.cancelled() => return,
        }

        let stream_id = command.stream_id.as_str();
        if process.is_manual_stop() {
            info!(stream_id, "Stream stopped intentionally");
            self.cleanup_launch(stream_id, process.launch_id()).await;
            return;
        }

        error!(
            stream_id,
            error = process.exit_error().as_deref().unwrap_or("exited cleanly"),
            "Stream process exited unexpectedly"
        );
        self.cleanup_launch(stream_id, process.launch_id()).await;
        self.attempt_retry(command);
    }

    fn attempt_retry(self: &Arc<Self>, command: StreamCommand) {
        match self.config.retry.decide(&command) {
            RetryDecision::Skip => {}
            RetryDecision::Abandon => {
                error!(
                    stream_id = %command.stream_id,
                    retry_count = command.retry_count,
                    max_retry = command.max_retry,
                    "Max retries reached, giving up"
                );
            }
            RetryDecision::Retry { command, delay } => {
                info!(
                    stream_id = %command.stream_id,
                    retry_count = command.retry_count,
                    delay_secs = delay.as_secs(),
                    "Scheduling retry"
                );

                let inner = self.clone();
                self.tasks.spawn(async move {
                    tokio::select! {
                        _ = inner.cancellation_token.cancelled() => {
                            debug!(stream_id = %command.stream_id, "Retry cancelled by shutdown");
                        }
                        _ = tokio::time::sleep(delay) => {
                            let stream_id = command.stream_id.clone();
                            let retry_count = command.retry_count;
                            if let Err(e) = inner.dispatch(command) {
                                error!(
                                    stream_id = %stream_id,
                                    retry_count,
                                    error = %e,
                                    "Retry dropped, stream abandoned"
                                );
                            }
                        }
                    }
                });
            }
        }
    }

    /// Detach the entry for `stream_id` and tear it down outside the lock.
    async fn cleanup_process(&self, stream_id: &str) -> Result<()> {
        let entry = self.active.lock().remove(stream_id);
        let Some(entry) = entry else {
            return Ok(());
        };

        info!(stream_id, "Cleaning up stream process");
        entry.teardown().await
    }

    /// Like [`cleanup_process`](Self::cleanup_process), but only if the
    /// registered entry still belongs to `launch_id`.
    async fn cleanup_launch(&self, stream_id: &str, launch_id: &str) {
        let entry = {
            let mut active = self.active.lock();
            match active.get(stream_id) {
                Some(entry) if entry.process.launch_id() == launch_id => active.remove(stream_id),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            return;
        };

        info!(stream_id, "Cleaning up stream process");
        if let Err(e) = entry.teardown().await {
            error!(stream_id, error = %e, "Failed to stop stream process");
        }
    }

    fn stream_dir(&self, stream_id: &str) -> PathBuf {
        stream_directory(self.deps.launcher.output_root(), stream_id)
    }
}
