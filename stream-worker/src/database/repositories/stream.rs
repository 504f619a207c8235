//! Stream repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{
    NewStreamMeta, SegmentProgress, StreamMetaDbModel, StreamStateDbModel,
};
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Metadata-store capability used by the tracker and the garbage collector.
#[async_trait]
pub trait StreamRepository: Send + Sync {
    async fn get_meta(&self, stream_id: &str) -> Result<StreamMetaDbModel>;
    async fn create_meta(&self, meta: &NewStreamMeta) -> Result<StreamMetaDbModel>;
    async fn update_meta_with_segments(
        &self,
        stream_id: &str,
        progress: &SegmentProgress,
    ) -> Result<()>;
    async fn get_stream_by_id(&self, stream_id: &str) -> Result<StreamStateDbModel>;
    /// Record the start time. Never touches `is_live`.
    async fn set_started(&self, stream_id: &str) -> Result<()>;
}

/// SQLx implementation of StreamRepository.
pub struct SqlxStreamRepository {
    pool: SqlitePool,
}

impl SqlxStreamRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn encode_ids(ids: &[String]) -> Result<String> {
    Ok(serde_json::to_string(ids)?)
}

#[async_trait]
impl StreamRepository for SqlxStreamRepository {
    async fn get_meta(&self, stream_id: &str) -> Result<StreamMetaDbModel> {
        sqlx::query_as::<_, StreamMetaDbModel>("SELECT * FROM stream_meta WHERE stream_id = ?")
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("StreamMeta", stream_id))
    }

    async fn create_meta(&self, meta: &NewStreamMeta) -> Result<StreamMetaDbModel> {
        let now = now_ms();
        let model = StreamMetaDbModel {
            id: uuid::Uuid::new_v4().to_string(),
            stream_id: meta.stream_id.clone(),
            segment_duration: meta.segment_duration,
            timescale: meta.timescale,
            representation_ids: encode_ids(&meta.representation_ids)?,
            base_path: meta.base_path.clone(),
            total_duration: 0,
            segment_count: 0,
            last_segment_seq: 0,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO stream_meta (
                id, stream_id, segment_duration, timescale, representation_ids,
                base_path, total_duration, segment_count, last_segment_seq,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&model.id)
        .bind(&model.stream_id)
        .bind(model.segment_duration)
        .bind(model.timescale)
        .bind(&model.representation_ids)
        .bind(&model.base_path)
        .bind(model.total_duration)
        .bind(model.segment_count)
        .bind(model.last_segment_seq)
        .bind(model.created_at)
        .bind(model.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(model)
    }

    async fn update_meta_with_segments(
        &self,
        stream_id: &str,
        progress: &SegmentProgress,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE stream_meta SET
                total_duration = ?,
                segment_count = ?,
                last_segment_seq = ?,
                segment_duration = ?,
                timescale = ?,
                representation_ids = ?,
                base_path = ?,
                updated_at = ?
            WHERE stream_id = ?
            "#,
        )
        .bind(progress.total_duration)
        .bind(progress.segment_count)
        .bind(progress.last_segment_seq)
        .bind(progress.segment_duration)
        .bind(progress.timescale)
        .bind(encode_ids(&progress.representation_ids)?)
        .bind(&progress.base_path)
        .bind(now_ms())
        .bind(stream_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("StreamMeta", stream_id));
        }
        Ok(())
    }

    async fn get_stream_by_id(&self, stream_id: &str) -> Result<StreamStateDbModel> {
        sqlx::query_as::<_, StreamStateDbModel>("SELECT * FROM streams WHERE id = ?")
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Stream", stream_id))
    }

    async fn set_started(&self, stream_id: &str) -> Result<()> {
        let now = now_ms();
        let result = sqlx::query("UPDATE streams SET started_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(stream_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Stream", stream_id));
        }
        Ok(())
    }
}
