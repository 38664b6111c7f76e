use super::StatusStore;
use crate::config::DatabaseConfig;
use crate::error::{PipelineError, Result};
use crate::model::{ItemId, ItemState, Metadata, StatusRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Row shape of `item_status`
#[derive(Debug, FromRow)]
struct StatusRow {
    item_id: String,
    state: String,
    metadata: serde_json::Value,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StatusRow> for StatusRecord {
    type Error = PipelineError;

    fn try_from(row: StatusRow) -> Result<Self> {
        let metadata = match row.metadata {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => Metadata::new(),
            other => {
                return Err(PipelineError::Malformed(format!(
                    "metadata for {} is not an object: {other}",
                    row.item_id
                )))
            }
        };

        Ok(StatusRecord {
            item_id: ItemId(row.item_id),
            state: row.state.parse()?,
            metadata,
            last_error: row.last_error,
            updated_at: row.updated_at,
        })
    }
}

/// Status store in PostgreSQL
pub struct PgStatusStore {
    pool: PgPool,
}

impl PgStatusStore {
    /// Create a new status store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .map_err(|e| PipelineError::transient("connect to PostgreSQL", e))?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| PipelineError::transient("run migrations", e))?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Check database connectivity
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl StatusStore for PgStatusStore {
    #[instrument(skip(self, record), fields(item_id = %record.item_id, state = %record.state))]
    async fn upsert(&self, record: &StatusRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO item_status (item_id, state, metadata, last_error, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (item_id) DO UPDATE SET
                state = EXCLUDED.state,
                metadata = EXCLUDED.metadata,
                last_error = EXCLUDED.last_error,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.item_id.as_str())
        .bind(record.state.as_str())
        .bind(serde_json::Value::Object(record.metadata.clone()))
        .bind(&record.last_error)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("Status record upserted");
        metrics::counter!("status.upserts").increment(1);

        Ok(())
    }

    async fn get(&self, item_id: &ItemId) -> Result<Option<StatusRecord>> {
        let row = sqlx::query_as::<_, StatusRow>(
            r#"
            SELECT item_id, state, metadata, last_error, updated_at
            FROM item_status
            WHERE item_id = $1
            "#,
        )
        .bind(item_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(StatusRecord::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn list(&self, state: Option<ItemState>, limit: usize) -> Result<Vec<StatusRecord>> {
        let rows = sqlx::query_as::<_, StatusRow>(
            r#"
            SELECT item_id, state, metadata, last_error, updated_at
            FROM item_status
            WHERE ($1::TEXT IS NULL OR state = $1)
            ORDER BY updated_at DESC, item_id
            LIMIT $2
            "#,
        )
        .bind(state.map(ItemState::as_str))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StatusRecord::try_from).collect()
    }
}
