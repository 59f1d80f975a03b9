//! PostgreSQL implementation of the stores
//!
//! Production persistence using PostgreSQL with:
//! - Compare-and-append on a per-run row lock
//! - Gapless per-run sequence numbers
//! - A timer table indexed on pending fire times

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::workflow::{WorkflowError, WorkflowEvent};

/// PostgreSQL implementation of [`EventStore`] and [`TimerStore`]
///
/// # Example
///
/// ```ignore
/// use flowline_durable::PostgresEventStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/flowline").await?;
/// let store = PostgresEventStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and build a store
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(db_err)?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(e.to_string())
        }
        other => StoreError::Database(other.to_string()),
    }
}

fn decode_err(e: sqlx::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn run_from_row(row: &PgRow) -> Result<RunInfo, StoreError> {
    let status: String = row.try_get("status").map_err(decode_err)?;
    let error: Option<serde_json::Value> = row.try_get("error").map_err(decode_err)?;
    let error = error
        .map(serde_json::from_value::<WorkflowError>)
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(RunInfo {
        id: row.try_get("id").map_err(decode_err)?,
        workflow_type: row.try_get("workflow_type").map_err(decode_err)?,
        status: status.parse().map_err(StoreError::Serialization)?,
        input: row.try_get("input").map_err(decode_err)?,
        result: row.try_get("result").map_err(decode_err)?,
        error,
        created_at: row.try_get("created_at").map_err(decode_err)?,
        updated_at: row.try_get("updated_at").map_err(decode_err)?,
    })
}

fn timer_from_row(row: &PgRow) -> Result<TimerRecord, StoreError> {
    let resume: serde_json::Value = row.try_get("resume").map_err(decode_err)?;
    Ok(TimerRecord {
        id: row.try_get("id").map_err(decode_err)?,
        run_id: row.try_get("run_id").map_err(decode_err)?,
        fire_at: row.try_get("fire_at").map_err(decode_err)?,
        resume: serde_json::from_value(resume)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
    })
}

const RUN_COLUMNS: &str =
    "id, workflow_type, status, input, result, error, created_at, updated_at";

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(skip(self, input))]
    async fn create_run(
        &self,
        run_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO durable_runs (id, workflow_type, status, input)
            VALUES ($1, $2, 'pending', $3)
            "#,
        )
        .bind(run_id)
        .bind(workflow_type)
        .bind(&input)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error().is_some_and(|d| d.is_unique_violation()) {
                return StoreError::RunAlreadyExists(run_id);
            }
            error!("Failed to create run: {}", e);
            db_err(e)
        })?;

        debug!(%run_id, %workflow_type, "created run");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_run(&self, run_id: Uuid) -> Result<RunInfo, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM durable_runs WHERE id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::RunNotFound(run_id))?;

        run_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunInfo>, StoreError> {
        let limit = i64::try_from(filter.limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM durable_runs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR workflow_type = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.workflow_type.as_deref())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(run_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn list_active_runs(&self) -> Result<Vec<RunInfo>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM durable_runs
            WHERE status NOT IN ('completed', 'failed', 'cancelled')
            ORDER BY created_at, id
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(run_from_row).collect()
    }

    #[instrument(skip(self, result, error))]
    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let error_json = error
            .map(|e| serde_json::to_value(&e))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let updated = sqlx::query(
            r#"
            UPDATE durable_runs
            SET status = $2,
                result = COALESCE($3, result),
                error = COALESCE($4, error),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(&result)
        .bind(&error_json)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(run_id));
        }
        Ok(())
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append_events(
        &self,
        run_id: Uuid,
        expected_sequence: i64,
        events: Vec<WorkflowEvent>,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Row lock serializes writers of this run until commit
        let row = sqlx::query("SELECT next_sequence FROM durable_runs WHERE id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::RunNotFound(run_id))?;

        let current: i64 = row.try_get("next_sequence").map_err(decode_err)?;
        if current != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current,
            });
        }

        let mut next = current;
        for event in events {
            let event_data = serde_json::to_value(&event)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            sqlx::query(
                r#"
                INSERT INTO durable_run_events (run_id, sequence_num, event_type, event_data)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(run_id)
            .bind(next)
            .bind(event.event_type())
            .bind(&event_data)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            next += 1;
        }

        sqlx::query("UPDATE durable_runs SET next_sequence = $2, updated_at = NOW() WHERE id = $1")
            .bind(run_id)
            .bind(next)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        debug!(%run_id, from = current, to = next, "appended events");
        Ok(next)
    }

    #[instrument(skip(self))]
    async fn load_events(&self, run_id: Uuid) -> Result<Vec<HistoryEntry>, StoreError> {
        let exists = sqlx::query("SELECT 1 FROM durable_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(StoreError::RunNotFound(run_id));
        }

        let rows = sqlx::query(
            r#"
            SELECT sequence_num, event_data, recorded_at
            FROM durable_run_events
            WHERE run_id = $1
            ORDER BY sequence_num
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let data: serde_json::Value = row.try_get("event_data").map_err(decode_err)?;
                Ok(HistoryEntry {
                    sequence: row.try_get("sequence_num").map_err(decode_err)?,
                    event: serde_json::from_value(data)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                    recorded_at: row.try_get("recorded_at").map_err(decode_err)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl TimerStore for PostgresEventStore {
    #[instrument(skip(self, timer), fields(timer_id = %timer.id, run_id = %timer.run_id))]
    async fn upsert_timer(&self, timer: &TimerRecord) -> Result<(), StoreError> {
        let resume = serde_json::to_value(&timer.resume)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO durable_timers (id, run_id, fire_at, resume, status)
            VALUES ($1, $2, $3, $4, 'pending')
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(timer.id)
        .bind(timer.run_id)
        .bind(timer.fire_at)
        .bind(&resume)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_timer(&self, timer_id: Uuid) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            "UPDATE durable_timers SET status = 'cancelled' WHERE id = $1 AND status = 'pending'",
        )
        .bind(timer_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(updated.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn mark_timer_fired(&self, timer_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE durable_timers
            SET status = 'fired', fired_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(timer_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimerRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, fire_at, resume
            FROM durable_timers
            WHERE status = 'pending' AND fire_at <= $1
            ORDER BY fire_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(timer_from_row).collect()
    }

    async fn next_fire_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query("SELECT MIN(fire_at) AS next FROM durable_timers WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        row.try_get("next").map_err(decode_err)
    }

    #[instrument(skip(self))]
    async fn pending_timers(&self, run_id: Uuid) -> Result<Vec<TimerRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, fire_at, resume
            FROM durable_timers
            WHERE run_id = $1 AND status = 'pending'
            ORDER BY fire_at
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(timer_from_row).collect()
    }
}
