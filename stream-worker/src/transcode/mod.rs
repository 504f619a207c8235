//! Transcode process supervision.
//!
//! A [`TranscodeLauncher`] starts one external transcoder per stream and hands
//! back a [`TranscodeProcess`] handle used to observe exit and run the staged
//! shutdown.

pub mod ffmpeg;
pub mod playlist;
pub mod process;
pub mod profile;
pub mod shutdown;

use std::path::{Path, PathBuf};

pub use ffmpeg::{FfmpegConfig, FfmpegLauncher, LaunchRequest, TranscodeLauncher};
pub use process::{ExitOutcome, ExitReporter, ExitWatch, TranscodeProcess, exit_channel};
pub use profile::{
    DASH_INIT_TEMPLATE, DASH_MANIFEST, DASH_MEDIA_TEMPLATE, DVR_PLAYLIST, HLS_SEGMENT_PATTERN,
    LIVE_PLAYLIST, OutputFormat, TranscodeProfile,
};
pub use shutdown::{ProcessControl, ShutdownStage, ShutdownStep, ShutdownTimeouts};

use crate::{Error, Result};

/// Reject ids that would escape the output root or collide with it.
pub fn validate_stream_id(stream_id: &str) -> Result<()> {
    if stream_id.is_empty() {
        return Err(Error::validation("stream id must not be empty"));
    }
    if stream_id == "." || stream_id == ".." {
        return Err(Error::validation(format!(
            "stream id '{stream_id}' is not allowed"
        )));
    }
    if stream_id.contains('/') || stream_id.contains('\\') {
        return Err(Error::validation(format!(
            "stream id '{stream_id}' must not contain path separators"
        )));
    }
    Ok(())
}

/// Directory that holds the output of one stream.
pub fn stream_directory(output_root: &Path, stream_id: &str) -> PathBuf {
    output_root.join(stream_id)
}
