//! Handle to one supervised transcode process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::shutdown::{ProcessControl, ShutdownStage, ShutdownStep, ShutdownTimeouts, run_shutdown};
use crate::Result;
use crate::error::ShutdownError;

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Error describing a failed exit, `None` on a clean exit.
    pub error: Option<String>,
}

impl ExitOutcome {
    pub fn success() -> Self {
        Self { error: None }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
        }
    }
}

/// Publishing side of the exit signal, owned by whatever waits on the OS process.
pub struct ExitReporter {
    exited: CancellationToken,
    outcome: Arc<OnceLock<ExitOutcome>>,
}

impl ExitReporter {
    /// Record the outcome and fire the completion signal.
    ///
    /// Only the first report is kept; the signal fires exactly once.
    pub fn report(&self, outcome: ExitOutcome) {
        let _ = self.outcome.set(outcome);
        self.exited.cancel();
    }
}

/// Observing side of the exit signal.
#[derive(Clone)]
pub struct ExitWatch {
    exited: CancellationToken,
    outcome: Arc<OnceLock<ExitOutcome>>,
}

/// Create a connected reporter/watch pair.
pub fn exit_channel() -> (ExitReporter, ExitWatch) {
    let exited = CancellationToken::new();
    let outcome = Arc::new(OnceLock::new());
    (
        ExitReporter {
            exited: exited.clone(),
            outcome: outcome.clone(),
        },
        ExitWatch { exited, outcome },
    )
}

/// A supervised transcode process.
///
/// Exposes a completion signal ([`done`](Self::done)), the exit error, the
/// manual-stop flag and an idempotent staged [`stop`](Self::stop).
pub struct TranscodeProcess {
    stream_id: String,
    /// Unique per launch; distinguishes a restarted stream from its predecessor.
    launch_id: String,
    control: Box<dyn ProcessControl>,
    plan: [ShutdownStep; 3],
    exit: ExitWatch,
    manual_stop: AtomicBool,
    shutdown: OnceCell<std::result::Result<ShutdownStage, ShutdownError>>,
    started_at: DateTime<Utc>,
}

impl TranscodeProcess {
    pub fn new(
        stream_id: impl Into<String>,
        control: Box<dyn ProcessControl>,
        timeouts: ShutdownTimeouts,
        exit: ExitWatch,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            launch_id: uuid::Uuid::new_v4().to_string(),
            control,
            plan: timeouts.plan(),
            exit,
            manual_stop: AtomicBool::new(false),
            shutdown: OnceCell::new(),
            started_at: Utc::now(),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn launch_id(&self) -> &str {
        &self.launch_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Wait until the process has exited.
    pub async fn done(&self) {
        self.exit.exited.cancelled().await;
    }

    pub fn is_done(&self) -> bool {
        self.exit.exited.is_cancelled()
    }

    /// The exit error, available once [`done`](Self::done) has fired.
    pub fn exit_error(&self) -> Option<String> {
        self.exit.outcome.get().and_then(|o| o.error.clone())
    }

    /// Whether [`stop`](Self::stop) has been requested.
    pub fn is_manual_stop(&self) -> bool {
        self.manual_stop.load(Ordering::SeqCst)
    }

    /// Shut the process down.
    ///
    /// The staged shutdown runs exactly once; concurrent and later callers
    /// wait for that run and receive its outcome.
    pub async fn stop(&self) -> Result<()> {
        if !self.manual_stop.swap(true, Ordering::SeqCst) {
            info!(stream_id = %self.stream_id, "Shutdown sequence initiated");
        }

        let outcome = self
            .shutdown
            .get_or_init(|| {
                run_shutdown(
                    &self.stream_id,
                    &self.plan,
                    self.control.as_ref(),
                    &self.exit.exited,
                )
            })
            .await;

        outcome.clone().map(|_| ()).map_err(Into::into)
    }

    /// The stage that ended the shutdown, once it has completed.
    pub fn shutdown_stage(&self) -> Option<ShutdownStage> {
        self.shutdown.get().and_then(|r| r.as_ref().ok().copied())
    }
}

impl std::fmt::Debug for TranscodeProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeProcess")
            .field("stream_id", &self.stream_id)
            .field("launch_id", &self.launch_id)
            .field("manual_stop", &self.is_manual_stop())
            .field("done", &self.is_done())
            .finish()
    }
}
