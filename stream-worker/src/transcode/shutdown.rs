//! Staged shutdown of a transcode process.
//!
//! Shutdown is an ordered list of [`ShutdownStep`]s. Each step performs its
//! action and then waits up to its own timeout for the process to exit; the
//! first step that observes the exit ends the sequence.
//!
//! 1. [`ShutdownStage::NaturalExit`]: do nothing, let the source run dry.
//! 2. [`ShutdownStage::GracefulStop`]: ask the process to quit over stdin.
//! 3. [`ShutdownStage::ForceKill`]: cancel the execution context and kill.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ShutdownError;

/// Default wait for the process to finish on its own.
pub const DEFAULT_NATURAL_EXIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default wait after the graceful quit request.
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(60);
/// Default wait after the kill signal.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(1);

/// Per-stage timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownTimeouts {
    pub natural_exit: Duration,
    pub graceful: Duration,
    pub kill_grace: Duration,
}

impl Default for ShutdownTimeouts {
    fn default() -> Self {
        Self {
            natural_exit: DEFAULT_NATURAL_EXIT_TIMEOUT,
            graceful: DEFAULT_GRACEFUL_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

impl ShutdownTimeouts {
    /// The ordered shutdown plan for these timeouts.
    pub fn plan(&self) -> [ShutdownStep; 3] {
        [
            ShutdownStep::new(ShutdownStage::NaturalExit, self.natural_exit),
            ShutdownStep::new(ShutdownStage::GracefulStop, self.graceful),
            ShutdownStep::new(ShutdownStage::ForceKill, self.kill_grace),
        ]
    }
}

/// A shutdown stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ShutdownStage {
    NaturalExit,
    GracefulStop,
    ForceKill,
}

/// One (action, wait-with-timeout) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownStep {
    pub stage: ShutdownStage,
    pub timeout: Duration,
}

impl ShutdownStep {
    pub fn new(stage: ShutdownStage, timeout: Duration) -> Self {
        Self { stage, timeout }
    }

    /// Perform the stage's action, then wait for the exit signal.
    ///
    /// Returns `true` if the process exited within the timeout.
    pub async fn execute(
        &self,
        stream_id: &str,
        control: &dyn ProcessControl,
        exited: &CancellationToken,
    ) -> bool {
        match self.stage {
            ShutdownStage::NaturalExit => {
                info!(stream_id, timeout = ?self.timeout, "Stage 1: waiting for natural exit");
            }
            ShutdownStage::GracefulStop => {
                info!(stream_id, timeout = ?self.timeout, "Stage 2: requesting graceful stop");
                if let Err(e) = control.request_graceful_stop().await {
                    warn!(stream_id, error = %e, "Graceful stop request could not be delivered");
                }
            }
            ShutdownStage::ForceKill => {
                warn!(stream_id, "Stage 3: forcing termination");
                control.force_kill();
            }
        }

        let exited_in_time = wait_for_exit(exited, self.timeout).await;
        if exited_in_time {
            info!(stream_id, stage = %self.stage, "Process exited");
        } else {
            warn!(stream_id, stage = %self.stage, "Shutdown stage timed out");
        }
        exited_in_time
    }
}

/// Control channel into a running process used by the shutdown stages.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Ask the process to finish cleanly.
    async fn request_graceful_stop(&self) -> std::io::Result<()>;

    /// Cancel the process's execution context and deliver a kill signal.
    fn force_kill(&self);

    /// The error reported by the kill attempt, if any.
    fn kill_error(&self) -> Option<String>;
}

/// Wait up to `timeout` for `exited` to fire.
pub async fn wait_for_exit(exited: &CancellationToken, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, exited.cancelled())
        .await
        .is_ok()
}

/// Run `steps` in order, stopping at the first stage that sees the process exit.
pub async fn run_shutdown(
    stream_id: &str,
    steps: &[ShutdownStep],
    control: &dyn ProcessControl,
    exited: &CancellationToken,
) -> Result<ShutdownStage, ShutdownError> {
    for step in steps {
        if step.execute(stream_id, control, exited).await {
            return Ok(step.stage);
        }
    }

    match control.kill_error() {
        Some(e) => {
            error!(stream_id, error = %e, "Shutdown failed: kill attempt returned error");
            Err(ShutdownError::KillFailed(e))
        }
        None => {
            error!(stream_id, "Shutdown failed: process still alive after kill");
            Err(ShutdownError::StillAlive)
        }
    }
}
