use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::event_store::{concurrency_conflict, stamp_events, EventStore};
use super::snapshot_store::SnapshotStore;
use crate::event_sourcing::core::{
    AggregateId, EventName, EventSourcingError, EventsStream, StoredEvent, StoredSnapshot,
};
use crate::event_sourcing::publishing::DomainEventsPublisher;
use crate::metrics::Metrics;

// ============================================================================
// PostgreSQL Event Store
// ============================================================================
//
// One table per stream family (`user_events`, `session_events`, ...).
//
// Append transaction:
// 1. Bump this store's row in `event_store_sequences`. The row lock
//    serializes appends to this store only, and keeps `sequence` gapless
//    and committed in order.
// 2. Read the aggregate's last event and compare with the expected version.
// 3. Bulk insert the batch.
// 4. Commit, then publish.
//
// A unique violation on (aggregate_id, version) is reported as a
// concurrency conflict as well.
//
// ============================================================================

const SEQUENCES_TABLE: &str = "event_store_sequences";

pub struct PostgresEventStore {
    pool: PgPool,
    table: String,
    publisher: DomainEventsPublisher,
    metrics: Option<Arc<Metrics>>,
}

impl PostgresEventStore {
    pub fn new(
        pool: PgPool,
        table: &str,
        publisher: DomainEventsPublisher,
    ) -> Result<Self, EventSourcingError> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            publisher,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Create the event table and this store's sequence counter.
    pub async fn migrate(&self) -> Result<(), EventSourcingError> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                event_id UUID PRIMARY KEY,
                aggregate_id TEXT NOT NULL,
                version BIGINT NOT NULL,
                name TEXT NOT NULL,
                data JSONB NOT NULL,
                inserted_at TIMESTAMPTZ NOT NULL,
                sequence BIGINT NOT NULL UNIQUE,
                UNIQUE (aggregate_id, version)
            )",
            table = self.table
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {SEQUENCES_TABLE} (
                store TEXT PRIMARY KEY,
                last_sequence BIGINT NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "INSERT INTO {SEQUENCES_TABLE} (store, last_sequence) VALUES ($1, 0)
             ON CONFLICT (store) DO NOTHING"
        ))
        .bind(&self.table)
        .execute(&self.pool)
        .await?;

        tracing::info!(table = %self.table, "Event store schema ready");
        Ok(())
    }

    fn select_columns(&self) -> String {
        format!(
            "SELECT event_id, aggregate_id, version, name, data, inserted_at, sequence FROM {}",
            self.table
        )
    }

    async fn last_event(
        &self,
        executor: impl sqlx::PgExecutor<'_>,
        aggregate_id: &AggregateId,
    ) -> Result<Option<(u64, u64, Uuid)>, EventSourcingError> {
        let row = sqlx::query(&format!(
            "SELECT event_id, version, sequence FROM {} WHERE aggregate_id = $1
             ORDER BY version DESC LIMIT 1",
            self.table
        ))
        .bind(aggregate_id.as_str())
        .fetch_optional(executor)
        .await?;

        row.map(|row| -> Result<_, EventSourcingError> {
            Ok((
                row.try_get::<i64, _>("version")? as u64,
                row.try_get::<i64, _>("sequence")? as u64,
                row.try_get::<Uuid, _>("event_id")?,
            ))
        })
        .transpose()
    }

    fn record_conflict(&self, stream: &EventsStream, expected_version: u64, last_version: u64) {
        tracing::warn!(
            store = %self.table,
            aggregate_id = %stream.aggregate_id(),
            expected_version = expected_version,
            last_version = last_version,
            "Optimistic concurrency conflict"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_conflict(&self.table);
        }
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    fn name(&self) -> &str {
        &self.table
    }

    async fn get_events_for_aggregate(
        &self,
        aggregate_id: &AggregateId,
        after: Option<u64>,
    ) -> Result<Vec<StoredEvent>, EventSourcingError> {
        let rows = sqlx::query(&format!(
            "{} WHERE aggregate_id = $1 AND version > $2 ORDER BY version ASC",
            self.select_columns()
        ))
        .bind(aggregate_id.as_str())
        .bind(after.unwrap_or(0) as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    async fn get_all_events(&self, after: u64) -> Result<Vec<StoredEvent>, EventSourcingError> {
        let rows = sqlx::query(&format!(
            "{} WHERE sequence > $1 ORDER BY sequence ASC",
            self.select_columns()
        ))
        .bind(after as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    async fn store_events(
        &self,
        stream: &EventsStream,
        expected_version: u64,
    ) -> Result<Vec<StoredEvent>, EventSourcingError> {
        if stream.is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let count = stream.len() as i64;
        let mut tx = self.pool.begin().await?;

        let last_sequence: i64 = sqlx::query_scalar(&format!(
            "UPDATE {SEQUENCES_TABLE} SET last_sequence = last_sequence + $2
             WHERE store = $1 RETURNING last_sequence"
        ))
        .bind(&self.table)
        .bind(count)
        .fetch_one(&mut *tx)
        .await?;

        if let Some((version, sequence, event_id)) =
            self.last_event(&mut *tx, stream.aggregate_id()).await?
        {
            if version != expected_version {
                tx.rollback().await?;
                self.record_conflict(stream, expected_version, version);
                return Err(
                    concurrency_conflict(stream, expected_version, version, sequence, event_id).into(),
                );
            }
        }

        let first_sequence = (last_sequence - count + 1) as u64;
        let events = stamp_events(stream, first_sequence);

        let mut insert = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {} (event_id, aggregate_id, version, name, data, inserted_at, sequence) ",
            self.table
        ));
        insert.push_values(events.iter(), |mut row, event| {
            row.push_bind(event.event_id)
                .push_bind(event.aggregate_id.as_str())
                .push_bind(event.version as i64)
                .push_bind(event.name.to_string())
                .push_bind(Json(event.data.clone()))
                .push_bind(event.inserted_at)
                .push_bind(event.sequence as i64);
        });

        if let Err(e) = insert.build().execute(&mut *tx).await {
            if !is_unique_violation(&e) {
                return Err(e.into());
            }
            tx.rollback().await?;
            let (version, sequence, event_id) = self
                .last_event(&self.pool, stream.aggregate_id())
                .await?
                .unwrap_or((0, 0, Uuid::nil()));
            self.record_conflict(stream, expected_version, version);
            return Err(
                concurrency_conflict(stream, expected_version, version, sequence, event_id).into(),
            );
        }

        tx.commit().await?;
        // The counter row lock is released here; a concurrent writer may
        // publish a later sequence before this one

        tracing::info!(
            store = %self.table,
            aggregate_id = %stream.aggregate_id(),
            first_sequence = first_sequence,
            event_count = events.len(),
            "✅ Appended events to event store"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_append(&self.table, events.len(), started.elapsed().as_secs_f64());
        }

        self.publisher.publish(&events);
        Ok(events)
    }
}

// ============================================================================
// PostgreSQL Snapshot Store
// ============================================================================

pub struct PostgresSnapshotStore {
    pool: PgPool,
    table: String,
}

impl PostgresSnapshotStore {
    pub fn new(pool: PgPool, table: &str) -> Result<Self, EventSourcingError> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    pub async fn migrate(&self) -> Result<(), EventSourcingError> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                aggregate_id TEXT PRIMARY KEY,
                version BIGINT NOT NULL,
                data JSONB NOT NULL,
                taken_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            self.table
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for PostgresSnapshotStore {
    async fn get(&self, aggregate_id: &AggregateId) -> Result<Option<StoredSnapshot>, EventSourcingError> {
        let row = sqlx::query(&format!(
            "SELECT aggregate_id, version, data FROM {} WHERE aggregate_id = $1",
            self.table
        ))
        .bind(aggregate_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<_, EventSourcingError> {
            Ok(StoredSnapshot {
                aggregate_id: AggregateId::from(row.try_get::<String, _>("aggregate_id")?),
                version: row.try_get::<i64, _>("version")? as u64,
                data: row.try_get::<Json<Value>, _>("data")?.0,
            })
        })
        .transpose()
    }

    async fn store(&self, snapshot: StoredSnapshot) -> Result<(), EventSourcingError> {
        sqlx::query(&format!(
            "INSERT INTO {table} (aggregate_id, version, data, taken_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (aggregate_id) DO UPDATE
             SET version = EXCLUDED.version, data = EXCLUDED.data, taken_at = EXCLUDED.taken_at
             WHERE {table}.version < EXCLUDED.version",
            table = self.table
        ))
        .bind(snapshot.aggregate_id.as_str())
        .bind(snapshot.version as i64)
        .bind(Json(snapshot.data))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Table names are interpolated into SQL, so only plain lowercase
/// identifiers are allowed.
pub fn validate_table_name(name: &str) -> Result<(), EventSourcingError> {
    let mut chars = name.chars();
    let valid = name.len() <= 63
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(EventSourcingError::InvalidTableName(name.to_string()))
    }
}

fn row_to_event(row: &PgRow) -> Result<StoredEvent, EventSourcingError> {
    let name: String = row.try_get("name")?;

    Ok(StoredEvent {
        event_id: row.try_get("event_id")?,
        aggregate_id: AggregateId::from(row.try_get::<String, _>("aggregate_id")?),
        version: row.try_get::<i64, _>("version")? as u64,
        name: EventName::parse(&name)?,
        data: row.try_get::<Json<Value>, _>("data")?.0,
        inserted_at: row.try_get("inserted_at")?,
        sequence: row.try_get::<i64, _>("sequence")? as u64,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_validation() {
        for good in ["user_events", "session_events", "_scratch", "events2"] {
            assert!(validate_table_name(good).is_ok(), "{good}");
        }

        for bad in ["", "User_events", "2events", "events; DROP TABLE x", "user-events", "a.b"] {
            assert!(
                matches!(validate_table_name(bad), Err(EventSourcingError::InvalidTableName(_))),
                "{bad}"
            );
        }

        assert!(validate_table_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_non_database_errors_are_not_conflicts() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
        assert!(!is_unique_violation(&sqlx::Error::PoolTimedOut));
    }
}
