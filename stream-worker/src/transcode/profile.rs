//! FFmpeg argument templates per deployment environment.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Rolling HLS playlist written by the passthrough profile.
pub const DVR_PLAYLIST: &str = "dvr.m3u8";
/// Sliding-window playlist derived from [`DVR_PLAYLIST`].
pub const LIVE_PLAYLIST: &str = "live.m3u8";
/// HLS segment filename pattern.
pub const HLS_SEGMENT_PATTERN: &str = "seg_%05d.ts";
/// DASH manifest written by the production profile.
pub const DASH_MANIFEST: &str = "manifest.mpd";
/// DASH init segment template (`init-<repId>.mp4`).
pub const DASH_INIT_TEMPLATE: &str = "init-$RepresentationID$.mp4";
/// DASH media segment template (`chunk-<repId>-<seq>.m4s`).
pub const DASH_MEDIA_TEMPLATE: &str = "chunk-$RepresentationID$-$Number$.m4s";

/// Segment length in seconds for both profiles.
const SEGMENT_SECONDS: &str = "2";

/// How the transcoder lays out its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// An append-only media playlist that needs an explicit end marker.
    RollingPlaylist,
    /// A self-contained manifest.
    Manifest,
}

/// Argument template selected by the deployment environment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TranscodeProfile {
    /// Stream-copy passthrough to a rolling HLS playlist.
    #[default]
    Test,
    /// Full re-encode to DASH adaptive segments.
    Production,
}

impl TranscodeProfile {
    /// Map an environment name (`APP_ENV`) to a profile.
    pub fn from_env_name(env: &str) -> Self {
        if env.trim().eq_ignore_ascii_case("production") {
            Self::Production
        } else {
            Self::Test
        }
    }

    pub fn output_format(&self) -> OutputFormat {
        match self {
            Self::Test => OutputFormat::RollingPlaylist,
            Self::Production => OutputFormat::Manifest,
        }
    }

    /// Build the ffmpeg argument list for `source_url` writing into `stream_dir`.
    ///
    /// `resume` should be true when a previous rolling playlist exists in the
    /// directory, so numbering continues instead of overwriting segments.
    pub fn build_args(&self, source_url: &str, stream_dir: &Path, resume: bool) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-rw_timeout",
            "5000000",
            "-rtmp_live",
            "live",
            "-fflags",
            "+genpts",
            "-i",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        args.push(source_url.to_string());

        match self {
            Self::Test => {
                push_all(&mut args, &["-c:v", "copy", "-c:a", "copy"]);
                push_hls_output(&mut args, stream_dir, resume);
            }
            Self::Production => {
                for (flag, value) in PRODUCTION_ENCODE_ARGS {
                    args.extend([flag.to_string(), value.to_string()]);
                }
                push_dash_output(&mut args, stream_dir);
            }
        }

        args
    }
}

/// H.264/AAC ladder for the DASH output, one flag and value per entry.
const PRODUCTION_ENCODE_ARGS: &[(&str, &str)] = &[
    ("-map", "0:v:0"),
    ("-map", "0:a:0"),
    ("-c:v", "libx264"),
    ("-preset", "veryfast"),
    ("-profile:v", "main"),
    ("-pix_fmt", "yuv420p"),
    ("-b:v", "2500k"),
    ("-maxrate", "2500k"),
    ("-bufsize", "5000k"),
    ("-g", "60"),
    ("-keyint_min", "60"),
    ("-sc_threshold", "0"),
    ("-c:a", "aac"),
    ("-b:a", "128k"),
    ("-ar", "48000"),
    ("-ac", "2"),
];

fn push_all(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn push_hls_output(args: &mut Vec<String>, stream_dir: &Path, resume: bool) {
    push_all(
        args,
        &["-f", "hls", "-hls_time", SEGMENT_SECONDS, "-hls_list_size", "0"],
    );
    if resume {
        push_all(args, &["-hls_start_number_source", "generic"]);
    }
    push_all(args, &["-hls_flags", "append_list+independent_segments"]);
    args.push("-hls_segment_filename".to_string());
    args.push(path_arg(&stream_dir.join(HLS_SEGMENT_PATTERN)));
    args.push(path_arg(&stream_dir.join(DVR_PLAYLIST)));
}

fn push_dash_output(args: &mut Vec<String>, stream_dir: &Path) {
    push_all(
        args,
        &[
            "-f",
            "dash",
            "-seg_duration",
            SEGMENT_SECONDS,
            "-use_template",
            "1",
            "-use_timeline",
            "0",
            "-streaming",
            "1",
            "-remove_at_exit",
            "0",
            "-adaptation_sets",
            "id=0,streams=v id=1,streams=a",
            "-init_seg_name",
            DASH_INIT_TEMPLATE,
            "-media_seg_name",
            DASH_MEDIA_TEMPLATE,
        ],
    );
    args.push(path_arg(&stream_dir.join(DASH_MANIFEST)));
}
