//! FFmpeg launcher.
//!
//! Spawns one ffmpeg child per stream and wires it into a [`TranscodeProcess`]:
//! an exit-waiter task owns the child, a stderr reader keeps a bounded tail
//! for diagnostics, and for rolling-playlist output a maintenance loop keeps
//! the live window fresh and finalizes the playlists after exit.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::playlist::{finalize_playlist, sync_live_playlist};
use super::process::{ExitOutcome, ExitReporter, TranscodeProcess, exit_channel};
use super::profile::{DVR_PLAYLIST, LIVE_PLAYLIST, OutputFormat, TranscodeProfile};
use super::shutdown::{ProcessControl, ShutdownTimeouts};
use super::{stream_directory, validate_stream_id};
use crate::utils::fs;
use crate::{Error, Result};

/// Number of stderr lines kept for the exit report.
const STDERR_TAIL_LINES: usize = 50;

/// Parameters for one launch.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub stream_id: String,
    pub source_url: String,
    /// Retries that preceded this launch; `0` for the first attempt.
    pub retry_count: u32,
}

impl LaunchRequest {
    pub fn new(stream_id: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            source_url: source_url.into(),
            retry_count: 0,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Starts transcode processes.
#[async_trait]
pub trait TranscodeLauncher: Send + Sync {
    /// Start a process for the request, or report why it could not start.
    async fn launch(&self, request: &LaunchRequest) -> Result<Arc<TranscodeProcess>>;

    /// Root directory that holds one subdirectory per stream.
    fn output_root(&self) -> &std::path::Path;
}

/// FFmpeg launcher configuration.
#[derive(Debug, Clone)]
pub struct FfmpegConfig {
    /// Path to the ffmpeg binary.
    pub binary_path: String,
    /// Shared output root.
    pub output_root: PathBuf,
    /// Argument template.
    pub profile: TranscodeProfile,
    /// Staged shutdown timeouts.
    pub shutdown: ShutdownTimeouts,
    /// Segments kept in the derived live playlist.
    pub live_window_segments: usize,
    /// How often the live playlist is re-derived.
    pub playlist_sync_interval: Duration,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            output_root: PathBuf::from("./output"),
            profile: TranscodeProfile::default(),
            shutdown: ShutdownTimeouts::default(),
            live_window_segments: 3,
            playlist_sync_interval: Duration::from_millis(500),
        }
    }
}

/// Launcher that runs the ffmpeg binary.
pub struct FfmpegLauncher {
    config: FfmpegConfig,
    version: Option<String>,
}

impl FfmpegLauncher {
    pub fn new(config: FfmpegConfig) -> Self {
        let version = Self::detect_version(&config.binary_path);
        Self { config, version }
    }

    /// Detect ffmpeg version.
    fn detect_version(path: &str) -> Option<String> {
        process_utils::std_command(path)
            .arg("-version")
            .output()
            .ok()
            .and_then(|output| {
                String::from_utf8(output.stdout)
                    .ok()
                    .and_then(|s| s.lines().next().map(|l| l.to_string()))
            })
    }

    pub fn is_available(&self) -> bool {
        self.version.is_some()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn config(&self) -> &FfmpegConfig {
        &self.config
    }
}

#[async_trait]
impl TranscodeLauncher for FfmpegLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<Arc<TranscodeProcess>> {
        validate_stream_id(&request.stream_id)?;

        let stream_dir = stream_directory(&self.config.output_root, &request.stream_id);
        fs::ensure_dir_all_with_op("creating stream directory", &stream_dir).await?;

        let resume = tokio::fs::try_exists(stream_dir.join(DVR_PLAYLIST))
            .await
            .unwrap_or(false);
        let args = self
            .config
            .profile
            .build_args(&request.source_url, &stream_dir, resume);

        info!(
            stream_id = %request.stream_id,
            retry_count = request.retry_count,
            profile = %self.config.profile,
            "Starting ffmpeg process with args: {:?}",
            args
        );

        let mut child = process_utils::tokio_command(&self.config.binary_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::process(format!("Failed to spawn ffmpeg: {e}")))?;

        let stdin = child.stdin.take();
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::process("Failed to capture ffmpeg stderr"))?;

        let stream_id = request.stream_id.clone();
        let context = CancellationToken::new();
        let kill_error = Arc::new(parking_lot::Mutex::new(None));
        let stderr_tail = Arc::new(parking_lot::Mutex::new(VecDeque::with_capacity(
            STDERR_TAIL_LINES,
        )));

        let stderr_task = tokio::spawn(read_stderr(stream_id.clone(), stderr, stderr_tail.clone()));

        let maintenance = match self.config.profile.output_format() {
            OutputFormat::RollingPlaylist => Some(tokio::spawn(maintain_live_playlist(
                stream_dir.clone(),
                self.config.live_window_segments,
                self.config.playlist_sync_interval,
                context.clone(),
            ))),
            OutputFormat::Manifest => None,
        };

        let (reporter, watch) = exit_channel();
        tokio::spawn(wait_for_exit(ExitWaiter {
            stream_id: stream_id.clone(),
            stream_dir,
            child,
            context: context.clone(),
            kill_error: kill_error.clone(),
            stderr_task,
            stderr_tail,
            maintenance,
            reporter,
        }));

        let control = FfmpegControl {
            stdin: tokio::sync::Mutex::new(stdin),
            context,
            kill_error,
        };

        Ok(Arc::new(TranscodeProcess::new(
            stream_id,
            Box::new(control),
            self.config.shutdown,
            watch,
        )))
    }

    fn output_root(&self) -> &std::path::Path {
        &self.config.output_root
    }
}

/// Control channel into a running ffmpeg child.
struct FfmpegControl {
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    /// Execution context; cancelling it makes the exit waiter kill the child.
    context: CancellationToken,
    kill_error: Arc<parking_lot::Mutex<Option<String>>>,
}

#[async_trait]
impl ProcessControl for FfmpegControl {
    async fn request_graceful_stop(&self) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        match stdin.as_mut() {
            Some(pipe) => process_utils::send_control(pipe, process_utils::FFMPEG_QUIT).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "ffmpeg stdin is not available",
            )),
        }
    }

    fn force_kill(&self) {
        self.context.cancel();
    }

    fn kill_error(&self) -> Option<String> {
        self.kill_error.lock().clone()
    }
}

struct ExitWaiter {
    stream_id: String,
    stream_dir: PathBuf,
    child: Child,
    context: CancellationToken,
    kill_error: Arc<parking_lot::Mutex<Option<String>>>,
    stderr_task: tokio::task::JoinHandle<()>,
    stderr_tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
    maintenance: Option<tokio::task::JoinHandle<()>>,
    reporter: ExitReporter,
}

async fn wait_for_exit(mut waiter: ExitWaiter) {
    let status = tokio::select! {
        status = waiter.child.wait() => status,
        _ = waiter.context.cancelled() => {
            if let Err(e) = waiter.child.start_kill() {
                error!(stream_id = %waiter.stream_id, error = %e, "Failed to kill ffmpeg");
                *waiter.kill_error.lock() = Some(e.to_string());
            }
            waiter.child.wait().await
        }
    };

    // Stops the playlist maintenance loop before the playlists are finalized.
    waiter.context.cancel();
    let rolling = waiter.maintenance.is_some();
    if let Some(task) = waiter.maintenance.take() {
        let _ = task.await;
    }
    let _ = waiter.stderr_task.await;

    if rolling {
        for name in [DVR_PLAYLIST, LIVE_PLAYLIST] {
            let path = waiter.stream_dir.join(name);
            match finalize_playlist(&path).await {
                Ok(true) => debug!(stream_id = %waiter.stream_id, playlist = name, "Playlist finalized"),
                Ok(false) => {}
                Err(e) => warn!(stream_id = %waiter.stream_id, error = %e, "Failed to finalize playlist"),
            }
        }
    }

    let stderr_tail = waiter
        .stderr_tail
        .lock()
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .join("\n");

    let outcome = match status {
        Ok(status) if status.success() => ExitOutcome::success(),
        Ok(status) => {
            let description = process_utils::describe_exit(&status);
            if stderr_tail.is_empty() {
                ExitOutcome::failure(description)
            } else {
                ExitOutcome::failure(format!("{description}: {stderr_tail}"))
            }
        }
        Err(e) => ExitOutcome::failure(format!("failed to wait for ffmpeg: {e}")),
    };

    info!(
        stream_id = %waiter.stream_id,
        error = ?outcome.error,
        "FFmpeg process exited"
    );
    debug!(stream_id = %waiter.stream_id, stderr = %stderr_tail, "FFmpeg stderr tail");

    waiter.reporter.report(outcome);
}

async fn read_stderr(
    stream_id: String,
    stderr: tokio::process::ChildStderr,
    tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.contains("Error") || line.contains("error") {
                    warn!(stream_id = %stream_id, "FFmpeg: {}", line);
                }
                let mut tail = tail.lock();
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(stream_id = %stream_id, error = %e, "Error reading ffmpeg output");
                break;
            }
        }
    }
}

async fn maintain_live_playlist(
    stream_dir: PathBuf,
    window: usize,
    interval: Duration,
    context: CancellationToken,
) {
    let dvr_path = stream_dir.join(DVR_PLAYLIST);
    let live_path = stream_dir.join(LIVE_PLAYLIST);
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = context.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = sync_live_playlist(&dvr_path, &live_path, window).await {
                    debug!(path = %dvr_path.display(), error = %e, "Live playlist sync skipped");
                }
            }
        }
    }
}
