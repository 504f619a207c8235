//! Rolling playlist maintenance.
//!
//! The passthrough profile writes an append-only `dvr.m3u8`. While the process
//! runs we derive a short `live.m3u8` window from it, and once it exits both
//! playlists get an explicit `#EXT-X-ENDLIST` so players stop polling.

use std::io::SeekFrom;
use std::path::Path;

use m3u8_rs::{MediaPlaylist, parse_media_playlist_res};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::utils::fs::io_error;
use crate::{Error, Result};

/// End-of-stream tag.
pub const ENDLIST_TAG: &str = "#EXT-X-ENDLIST";

/// How much of the playlist tail is scanned for an existing end tag.
const TAIL_SCAN_BYTES: u64 = 4096;

/// Check whether the playlist at `path` already ends the stream.
///
/// Missing or unreadable files count as not finalized.
pub async fn has_endlist(path: &Path) -> bool {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return false;
    };
    let Ok(meta) = file.metadata().await else {
        return false;
    };

    if meta.len() > TAIL_SCAN_BYTES
        && file
            .seek(SeekFrom::End(-(TAIL_SCAN_BYTES as i64)))
            .await
            .is_err()
    {
        return false;
    }

    let mut tail = Vec::with_capacity(TAIL_SCAN_BYTES as usize);
    if file.read_to_end(&mut tail).await.is_err() {
        return false;
    }

    tail.windows(ENDLIST_TAG.len())
        .any(|w| w == ENDLIST_TAG.as_bytes())
}

/// Append the end tag to the playlist at `path` unless it is missing or
/// already finalized. Returns whether the file was modified.
pub async fn finalize_playlist(path: &Path) -> Result<bool> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(false);
    }
    if has_endlist(path).await {
        return Ok(false);
    }

    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .await
        .map_err(|e| io_error("opening playlist", path, e))?;
    file.write_all(format!("\n{ENDLIST_TAG}\n").as_bytes())
        .await
        .map_err(|e| io_error("finalizing playlist", path, e))?;
    file.flush()
        .await
        .map_err(|e| io_error("finalizing playlist", path, e))?;

    Ok(true)
}

/// Render a sliding-window playlist holding the last `window` segments of
/// `dvr`. Returns `None` when the source has no segments yet.
pub fn render_live_window(dvr: &[u8], window: usize) -> Result<Option<Vec<u8>>> {
    let playlist = parse_media_playlist_res(dvr)
        .map_err(|e| Error::validation(format!("Failed to parse playlist: {e}")))?;

    let Some(live) = live_window(&playlist, window) else {
        return Ok(None);
    };

    let mut out = Vec::new();
    live.write_to(&mut out)?;
    Ok(Some(out))
}

fn live_window(playlist: &MediaPlaylist, window: usize) -> Option<MediaPlaylist> {
    if playlist.segments.is_empty() || window == 0 {
        return None;
    }

    let start = playlist.segments.len().saturating_sub(window);
    let mut live = playlist.clone();
    live.segments = playlist.segments[start..].to_vec();
    live.media_sequence = playlist.media_sequence + start as u64;
    live.playlist_type = None;
    live.end_list = false;
    Some(live)
}

/// Rewrite `live_path` from `dvr_path`, atomically via a temp file.
/// Returns whether a new window was written.
pub async fn sync_live_playlist(dvr_path: &Path, live_path: &Path, window: usize) -> Result<bool> {
    let dvr = match tokio::fs::read(dvr_path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(io_error("reading playlist", dvr_path, e)),
    };

    let Some(rendered) = render_live_window(&dvr, window)? else {
        return Ok(false);
    };

    let tmp_path = live_path.with_extension("m3u8.tmp");
    tokio::fs::write(&tmp_path, rendered)
        .await
        .map_err(|e| io_error("writing playlist", &tmp_path, e))?;
    tokio::fs::rename(&tmp_path, live_path)
        .await
        .map_err(|e| io_error("replacing playlist", live_path, e))?;

    Ok(true)
}
