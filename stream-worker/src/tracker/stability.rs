//! Double-stat check that a file is no longer being written.

use std::path::Path;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    len: u64,
    modified: Option<SystemTime>,
}

async fn snapshot(path: &Path) -> Option<Snapshot> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some(Snapshot {
        len: meta.len(),
        modified: meta.modified().ok(),
    })
}

/// Stat `path`, wait `settle`, stat again.
///
/// Stable means both stats succeeded, size and modification time are equal,
/// and the file is not empty.
pub async fn is_stable(path: &Path, settle: Duration) -> bool {
    let Some(first) = snapshot(path).await else {
        return false;
    };
    tokio::time::sleep(settle).await;
    let Some(second) = snapshot(path).await else {
        return false;
    };

    first == second && second.len > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_stable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk-0-1.m4s");
        std::fs::write(&path, b"data").unwrap();

        assert!(is_stable(&path, Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_empty_and_missing_files_are_unstable() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("chunk-0-2.m4s");
        std::fs::write(&empty, b"").unwrap();

        assert!(!is_stable(&empty, Duration::from_millis(10)).await);
        assert!(!is_stable(&dir.path().join("missing.m4s"), Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_growing_file_is_unstable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk-0-3.m4s");
        std::fs::write(&path, b"head").unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(writer_path)
                .unwrap();
            file.write_all(b"more bytes").unwrap();
        });

        assert!(!is_stable(&path, Duration::from_millis(150)).await);
        writer.await.unwrap();
    }
}
