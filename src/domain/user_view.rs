use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::contracts::{SESSION_TOPIC, SIGN_UP_REQUESTED, USER_CREATED, USER_EMAIL_CHANGED, USER_TOPIC};
use super::session::SignUpRequested;
use super::user::{UserCreated, UserEmailChanged};
use crate::event_sourcing::core::{AggregateId, EventSourcingError, StoredEvent};
use crate::event_sourcing::projections::{EventHandlerTable, HandlerRegistrationError, OffsetStore, Projector};
use crate::event_sourcing::store::EventStore;

// ============================================================================
// User View - query model of users and their latest sign-up session
// ============================================================================
//
// Rows are keyed by user id and filled column by column, because the user
// and session topics replay independently: a session can land before the
// user it belongs to. A row only shows up in queries once the user itself
// has been projected.
//
// Every write is an upsert, so re-applying an event after a crash between
// the write and the offset update leaves the row unchanged. The rows must
// be exactly as durable as the projector's offsets.
//
// ============================================================================

pub const USER_PROJECTOR_GROUP: &str = "user_projector";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserViewRecord {
    pub user_id: AggregateId,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub session_id: Option<AggregateId>,
}

#[async_trait]
pub trait UserViewStore: Send + Sync {
    async fn get(&self, user_id: &AggregateId) -> Result<Option<UserViewRecord>, EventSourcingError>;

    async fn find_by_email(&self, email: &str) -> Result<Option<UserViewRecord>, EventSourcingError>;

    /// Create the user's row, keeping a session recorded ahead of it.
    async fn upsert_user(
        &self,
        user_id: &AggregateId,
        email: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), EventSourcingError>;

    /// `false` when the user has no row yet.
    async fn set_email(&self, user_id: &AggregateId, email: &str) -> Result<bool, EventSourcingError>;

    async fn set_session(&self, user_id: &AggregateId, session_id: &AggregateId) -> Result<(), EventSourcingError>;

    /// Number of projected users.
    async fn count(&self) -> Result<usize, EventSourcingError>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Clone, Default)]
struct PartialRow {
    email: Option<String>,
    created_at: Option<DateTime<Utc>>,
    session_id: Option<AggregateId>,
}

impl PartialRow {
    fn record(&self, user_id: &AggregateId) -> Option<UserViewRecord> {
        Some(UserViewRecord {
            user_id: user_id.clone(),
            email: self.email.clone()?,
            created_at: self.created_at?,
            session_id: self.session_id.clone(),
        })
    }
}

#[derive(Default)]
pub struct InMemoryUserViewStore {
    rows: RwLock<HashMap<AggregateId, PartialRow>>,
}

impl InMemoryUserViewStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserViewStore for InMemoryUserViewStore {
    async fn get(&self, user_id: &AggregateId) -> Result<Option<UserViewRecord>, EventSourcingError> {
        Ok(self.rows.read().await.get(user_id).and_then(|row| row.record(user_id)))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserViewRecord>, EventSourcingError> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|(_, row)| row.email.as_deref() == Some(email))
            .find_map(|(user_id, row)| row.record(user_id)))
    }

    async fn upsert_user(
        &self,
        user_id: &AggregateId,
        email: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), EventSourcingError> {
        let mut rows = self.rows.write().await;
        let row = rows.entry(user_id.clone()).or_default();
        row.email = Some(email.to_string());
        row.created_at = Some(created_at);
        Ok(())
    }

    async fn set_email(&self, user_id: &AggregateId, email: &str) -> Result<bool, EventSourcingError> {
        match self.rows.write().await.get_mut(user_id) {
            Some(row) if row.created_at.is_some() => {
                row.email = Some(email.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_session(&self, user_id: &AggregateId, session_id: &AggregateId) -> Result<(), EventSourcingError> {
        self.rows
            .write()
            .await
            .entry(user_id.clone())
            .or_default()
            .session_id = Some(session_id.clone());
        Ok(())
    }

    async fn count(&self) -> Result<usize, EventSourcingError> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|row| row.created_at.is_some())
            .count())
    }
}

// ============================================================================
// PostgreSQL store
// ============================================================================

/// Rows in the `user_view` table.
pub struct PostgresUserViewStore {
    pool: PgPool,
}

impl PostgresUserViewStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), EventSourcingError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_view (
                user_id TEXT PRIMARY KEY,
                email TEXT,
                created_at TIMESTAMPTZ,
                session_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS user_view_email_idx ON user_view (email)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn record(row: &sqlx::postgres::PgRow) -> Result<UserViewRecord, EventSourcingError> {
        Ok(UserViewRecord {
            user_id: AggregateId::from(row.try_get::<String, _>("user_id")?),
            email: row.try_get("email")?,
            created_at: row.try_get("created_at")?,
            session_id: row.try_get::<Option<String>, _>("session_id")?.map(AggregateId::from),
        })
    }
}

#[async_trait]
impl UserViewStore for PostgresUserViewStore {
    async fn get(&self, user_id: &AggregateId) -> Result<Option<UserViewRecord>, EventSourcingError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, email, created_at, session_id
            FROM user_view
            WHERE user_id = $1 AND created_at IS NOT NULL
            "#,
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::record).transpose()
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserViewRecord>, EventSourcingError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, email, created_at, session_id
            FROM user_view
            WHERE email = $1 AND created_at IS NOT NULL
            LIMIT 1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::record).transpose()
    }

    async fn upsert_user(
        &self,
        user_id: &AggregateId,
        email: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), EventSourcingError> {
        sqlx::query(
            r#"
            INSERT INTO user_view (user_id, email, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id)
            DO UPDATE SET email = EXCLUDED.email, created_at = EXCLUDED.created_at
            "#,
        )
        .bind(user_id.as_str())
        .bind(email)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_email(&self, user_id: &AggregateId, email: &str) -> Result<bool, EventSourcingError> {
        let result = sqlx::query("UPDATE user_view SET email = $2 WHERE user_id = $1 AND created_at IS NOT NULL")
            .bind(user_id.as_str())
            .bind(email)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_session(&self, user_id: &AggregateId, session_id: &AggregateId) -> Result<(), EventSourcingError> {
        sqlx::query(
            r#"
            INSERT INTO user_view (user_id, session_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id)
            DO UPDATE SET session_id = EXCLUDED.session_id
            "#,
        )
        .bind(user_id.as_str())
        .bind(session_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count(&self) -> Result<usize, EventSourcingError> {
        let row = sqlx::query("SELECT COUNT(*) AS users FROM user_view WHERE created_at IS NOT NULL")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("users")? as usize)
    }
}

// ============================================================================
// Projection
// ============================================================================

pub struct UserView {
    store: Arc<dyn UserViewStore>,
}

impl UserView {
    pub fn new(store: Arc<dyn UserViewStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryUserViewStore::new()))
    }

    pub async fn get(&self, user_id: &AggregateId) -> Result<Option<UserViewRecord>, EventSourcingError> {
        self.store.get(user_id).await
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<UserViewRecord>, EventSourcingError> {
        self.store.find_by_email(email).await
    }

    pub async fn len(&self) -> Result<usize, EventSourcingError> {
        self.store.count().await
    }

    async fn on_user_created(self: Arc<Self>, event: StoredEvent) -> anyhow::Result<()> {
        let data: UserCreated = serde_json::from_value(event.data)?;
        self.store
            .upsert_user(&event.aggregate_id, data.email.as_str(), data.created_at)
            .await?;
        Ok(())
    }

    async fn on_email_changed(self: Arc<Self>, event: StoredEvent) -> anyhow::Result<()> {
        let data: UserEmailChanged = serde_json::from_value(event.data)?;
        if !self.store.set_email(&event.aggregate_id, data.email.as_str()).await? {
            anyhow::bail!("email changed for unknown user {}", event.aggregate_id);
        }
        Ok(())
    }

    async fn on_sign_up_requested(self: Arc<Self>, event: StoredEvent) -> anyhow::Result<()> {
        let data: SignUpRequested = serde_json::from_value(event.data)?;
        self.store.set_session(&data.user_id, &data.session_id).await?;
        Ok(())
    }

    pub fn handlers() -> Result<EventHandlerTable<UserView>, HandlerRegistrationError> {
        EventHandlerTable::new()
            .on(USER_CREATED, UserView::on_user_created)?
            .on(USER_EMAIL_CHANGED, UserView::on_email_changed)?
            .on(SIGN_UP_REQUESTED, UserView::on_sign_up_requested)
    }
}

/// Projector feeding `view` from the user and session stores. `offsets`
/// must live exactly as long as the view's rows.
pub fn user_view_projector(
    view: Arc<UserView>,
    offsets: Arc<dyn OffsetStore>,
    user_events: Arc<dyn EventStore>,
    session_events: Arc<dyn EventStore>,
) -> Result<Projector<UserView>, HandlerRegistrationError> {
    Ok(Projector::new(USER_PROJECTOR_GROUP, view, UserView::handlers()?, offsets)
        .with_source(USER_TOPIC, user_events)
        .with_source(SESSION_TOPIC, session_events))
}
