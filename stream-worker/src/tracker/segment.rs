//! DASH segment file naming.

use std::sync::LazyLock;

use regex::Regex;

use crate::storage::{INIT_CONTENT_TYPE, MEDIA_CONTENT_TYPE};

static INIT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^init-([A-Za-z0-9_]+)\.mp4$").unwrap());
static CHUNK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^chunk-([A-Za-z0-9_]+)-(\d+)\.m4s$").unwrap());

/// A recognised segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentFile {
    /// `init-<rep>.mp4`
    Init { representation: String },
    /// `chunk-<rep>-<seq>.m4s`
    Media { representation: String, seq: i64 },
}

impl SegmentFile {
    /// Parse a file name; anything that is not an init or media segment yields `None`.
    pub fn parse(file_name: &str) -> Option<Self> {
        if let Some(caps) = CHUNK_REGEX.captures(file_name) {
            let seq = caps[2].parse::<i64>().ok()?;
            return Some(Self::Media {
                representation: caps[1].to_string(),
                seq,
            });
        }
        INIT_REGEX.captures(file_name).map(|caps| Self::Init {
            representation: caps[1].to_string(),
        })
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Init { .. } => INIT_CONTENT_TYPE,
            Self::Media { .. } => MEDIA_CONTENT_TYPE,
        }
    }

    /// Sequence number of a media segment.
    pub fn seq(&self) -> Option<i64> {
        match self {
            Self::Media { seq, .. } => Some(*seq),
            Self::Init { .. } => None,
        }
    }
}

/// Whether `file_name` is a media segment.
pub fn is_media_segment(file_name: &str) -> bool {
    CHUNK_REGEX.is_match(file_name)
}

/// Whether `file_name` is an init or media segment.
pub fn is_segment(file_name: &str) -> bool {
    CHUNK_REGEX.is_match(file_name) || INIT_REGEX.is_match(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_segment_names() {
        assert_eq!(
            SegmentFile::parse("init-0.mp4"),
            Some(SegmentFile::Init {
                representation: "0".to_string()
            })
        );
        assert_eq!(
            SegmentFile::parse("chunk-1-00042.m4s"),
            Some(SegmentFile::Media {
                representation: "1".to_string(),
                seq: 42
            })
        );
        assert_eq!(SegmentFile::parse("manifest.mpd"), None);
        assert_eq!(SegmentFile::parse("chunk-0-1.m4s.tmp"), None);
        assert_eq!(SegmentFile::parse("seg_00001.ts"), None);
    }

    #[test]
    fn test_content_types() {
        assert_eq!(SegmentFile::parse("init-1.mp4").unwrap().content_type(), "video/mp4");
        assert_eq!(
            SegmentFile::parse("chunk-0-3.m4s").unwrap().content_type(),
            "video/iso.segment"
        );
    }

    #[test]
    fn test_predicates() {
        assert!(is_media_segment("chunk-0-7.m4s"));
        assert!(!is_media_segment("init-0.mp4"));
        assert!(is_segment("init-0.mp4"));
        assert!(!is_segment("dvr.m3u8"));
    }
}
