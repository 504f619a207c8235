//! Stream state and segment metadata models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::ms_to_datetime;

/// Stream state row. Written by the publishing side; the worker only reads it
/// and sets `started_at`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StreamStateDbModel {
    pub id: String,
    pub is_live: bool,
    /// Unix epoch milliseconds (UTC) of the first uploaded segment.
    pub started_at: Option<i64>,
    /// Unix epoch milliseconds (UTC) when the stream ended.
    pub ended_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl StreamStateDbModel {
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at.map(ms_to_datetime)
    }
}

/// Segment metadata row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StreamMetaDbModel {
    pub id: String,
    pub stream_id: String,
    /// Segment length in timescale units.
    pub segment_duration: i64,
    pub timescale: i64,
    /// JSON array of representation ids.
    pub representation_ids: String,
    pub base_path: String,
    pub total_duration: i64,
    pub segment_count: i64,
    pub last_segment_seq: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl StreamMetaDbModel {
    /// Decode the representation id list. Malformed values yield an empty list.
    pub fn representation_ids(&self) -> Vec<String> {
        serde_json::from_str(&self.representation_ids).unwrap_or_default()
    }
}

/// Fields of a freshly created metadata record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStreamMeta {
    pub stream_id: String,
    pub segment_duration: i64,
    pub timescale: i64,
    pub representation_ids: Vec<String>,
    pub base_path: String,
}

/// Incremental or final segment progress of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentProgress {
    pub total_duration: i64,
    pub segment_count: i64,
    pub last_segment_seq: i64,
    pub segment_duration: i64,
    pub timescale: i64,
    pub representation_ids: Vec<String>,
    pub base_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_representation_ids_decoding() {
        let mut meta = StreamMetaDbModel {
            id: "m1".to_string(),
            stream_id: "s1".to_string(),
            segment_duration: 2000,
            timescale: 1000,
            representation_ids: r#"["0","1"]"#.to_string(),
            base_path: "streams/s1".to_string(),
            total_duration: 0,
            segment_count: 0,
            last_segment_seq: 0,
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(meta.representation_ids(), vec!["0", "1"]);

        meta.representation_ids = "not json".to_string();
        assert!(meta.representation_ids().is_empty());
    }
}
