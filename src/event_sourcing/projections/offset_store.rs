use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::projector::ProjectionError;

// ============================================================================
// Projection Offsets
// ============================================================================
//
// One record per (projector group, topic): the sequence of the last event
// the group projected from that topic. A missing record means offset 0.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct OffsetRecord {
    pub projector_group_id: String,
    pub topic: String,
    pub offset: u64,
    pub projection_time: DateTime<Utc>,
}

#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn get_offset(&self, group_id: &str, topic: &str) -> Result<u64, ProjectionError>;

    async fn set_offset(&self, group_id: &str, topic: &str, offset: u64) -> Result<(), ProjectionError>;
}

#[derive(Default)]
pub struct InMemoryOffsetStore {
    records: Mutex<HashMap<(String, String), OffsetRecord>>,
}

impl InMemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, group_id: &str, topic: &str) -> Option<OffsetRecord> {
        self.records
            .lock()
            .await
            .get(&(group_id.to_string(), topic.to_string()))
            .cloned()
    }
}

#[async_trait]
impl OffsetStore for InMemoryOffsetStore {
    async fn get_offset(&self, group_id: &str, topic: &str) -> Result<u64, ProjectionError> {
        Ok(self.record(group_id, topic).await.map(|r| r.offset).unwrap_or(0))
    }

    async fn set_offset(&self, group_id: &str, topic: &str, offset: u64) -> Result<(), ProjectionError> {
        let record = OffsetRecord {
            projector_group_id: group_id.to_string(),
            topic: topic.to_string(),
            offset,
            projection_time: Utc::now(),
        };
        self.records
            .lock()
            .await
            .insert((group_id.to_string(), topic.to_string()), record);
        Ok(())
    }
}

/// Offsets in the `projection_offsets` table.
pub struct PostgresOffsetStore {
    pool: PgPool,
}

impl PostgresOffsetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projection_offsets (
                projector_group_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                "offset" BIGINT NOT NULL,
                projection_time TIMESTAMPTZ NOT NULL,
                UNIQUE (projector_group_id, topic)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record(&self, group_id: &str, topic: &str) -> Result<Option<OffsetRecord>, ProjectionError> {
        let row = sqlx::query(
            r#"
            SELECT projector_group_id, topic, "offset", projection_time
            FROM projection_offsets
            WHERE projector_group_id = $1 AND topic = $2
            "#,
        )
        .bind(group_id)
        .bind(topic)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<_, ProjectionError> {
            Ok(OffsetRecord {
                projector_group_id: row.try_get("projector_group_id")?,
                topic: row.try_get("topic")?,
                offset: row.try_get::<i64, _>("offset")? as u64,
                projection_time: row.try_get("projection_time")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl OffsetStore for PostgresOffsetStore {
    async fn get_offset(&self, group_id: &str, topic: &str) -> Result<u64, ProjectionError> {
        Ok(self.record(group_id, topic).await?.map(|r| r.offset).unwrap_or(0))
    }

    async fn set_offset(&self, group_id: &str, topic: &str, offset: u64) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            INSERT INTO projection_offsets (projector_group_id, topic, "offset", projection_time)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (projector_group_id, topic)
            DO UPDATE SET "offset" = EXCLUDED."offset", projection_time = EXCLUDED.projection_time
            "#,
        )
        .bind(group_id)
        .bind(topic)
        .bind(offset as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_offsets_per_group_and_topic() {
        let store = InMemoryOffsetStore::new();

        assert_eq!(store.get_offset("user_view", "authentication.events.user").await.unwrap(), 0);

        store.set_offset("user_view", "authentication.events.user", 5).await.unwrap();
        store.set_offset("audit", "authentication.events.user", 2).await.unwrap();

        assert_eq!(store.get_offset("user_view", "authentication.events.user").await.unwrap(), 5);
        assert_eq!(store.get_offset("audit", "authentication.events.user").await.unwrap(), 2);
        assert_eq!(store.get_offset("user_view", "authentication.events.session").await.unwrap(), 0);

        let record = store.record("user_view", "authentication.events.user").await.unwrap();
        assert_eq!(record.projector_group_id, "user_view");
        assert_eq!(record.offset, 5);
    }
}
