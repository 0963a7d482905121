//! SQLite-backed `Store`: `BEGIN IMMEDIATE` transactions for the two
//! composite writes, a `sea-query`-built schema with an index on
//! `(processed, scheduled_for)` for the relay's claim query.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sea_query::{ColumnDef, Expr, Iden, Index, Query, SqliteQueryBuilder, Table};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::model::{OutboxRow, Record, SagaInstance};

use super::{PendingOutbox, Result, Store, StoreError};

#[derive(Iden)]
enum Records {
    Table,
    Id,
    StepData,
}

#[derive(Iden)]
enum Outbox {
    Table,
    Id,
    EventType,
    Payload,
    ScheduledFor,
    Processed,
    ProcessedAt,
    RetryCount,
    LastError,
    Sequence,
}

#[derive(Iden)]
enum Sagas {
    Table,
    CorrelationId,
    Data,
    Version,
}

/// SQLite implementation of [`Store`]. Write transactions use
/// `BEGIN IMMEDIATE` to acquire the write lock upfront, the way
/// `storage/sqlite/event_store.rs::add` does, avoiding the deadlock that
/// can occur when concurrent `DEFERRED` transactions race to upgrade from
/// a shared to an exclusive lock.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the three tables and the `(processed, scheduled_for)` index
    /// required by the relay's claim query. Idempotent.
    pub async fn init(&self) -> Result<()> {
        let records = Table::create()
            .table(Records::Table)
            .if_not_exists()
            .col(ColumnDef::new(Records::Id).text().primary_key())
            .col(ColumnDef::new(Records::StepData).text().not_null())
            .to_string(SqliteQueryBuilder);
        sqlx::query(&records).execute(&self.pool).await?;

        let outbox = Table::create()
            .table(Outbox::Table)
            .if_not_exists()
            .col(ColumnDef::new(Outbox::Id).text().primary_key())
            .col(ColumnDef::new(Outbox::EventType).text().not_null())
            .col(ColumnDef::new(Outbox::Payload).blob().not_null())
            .col(ColumnDef::new(Outbox::ScheduledFor).text().not_null())
            .col(
                ColumnDef::new(Outbox::Processed)
                    .integer()
                    .not_null()
                    .default(0),
            )
            .col(ColumnDef::new(Outbox::ProcessedAt).text())
            .col(
                ColumnDef::new(Outbox::RetryCount)
                    .integer()
                    .not_null()
                    .default(0),
            )
            .col(ColumnDef::new(Outbox::LastError).text())
            .col(ColumnDef::new(Outbox::Sequence).big_integer().not_null())
            .to_string(SqliteQueryBuilder);
        sqlx::query(&outbox).execute(&self.pool).await?;

        let index = Index::create()
            .if_not_exists()
            .name("idx_outbox_processed_scheduled")
            .table(Outbox::Table)
            .col(Outbox::Processed)
            .col(Outbox::ScheduledFor)
            .to_string(SqliteQueryBuilder);
        sqlx::query(&index).execute(&self.pool).await?;

        let sagas = Table::create()
            .table(Sagas::Table)
            .if_not_exists()
            .col(ColumnDef::new(Sagas::CorrelationId).text().primary_key())
            .col(ColumnDef::new(Sagas::Data).text().not_null())
            .col(ColumnDef::new(Sagas::Version).big_integer().not_null())
            .to_string(SqliteQueryBuilder);
        sqlx::query(&sagas).execute(&self.pool).await?;

        Ok(())
    }

    fn parse_ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).single().unwrap())
    }
}

fn row_to_outbox(row: &sqlx::sqlite::SqliteRow) -> Result<OutboxRow> {
    let id: String = row.get("id");
    let scheduled_for: String = row.get("scheduled_for");
    let processed_at: Option<String> = row.get("processed_at");
    Ok(OutboxRow {
        id: Uuid::parse_str(&id)?,
        event_type: row.get("event_type"),
        payload: row.get("payload"),
        scheduled_for: SqliteStore::parse_ts(&scheduled_for),
        processed: row.get::<i64, _>("processed") != 0,
        processed_at: processed_at.map(|s| SqliteStore::parse_ts(&s)),
        retry_count: row.get::<i64, _>("retry_count") as u32,
        last_error: row.get("last_error"),
        sequence: row.get("sequence"),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_record_and_enqueue(
        &self,
        record: &Record,
        outbox: PendingOutbox,
    ) -> Result<Uuid> {
        // BEGIN IMMEDIATE acquires the write lock upfront, preventing
        // deadlocks when concurrent DEFERRED transactions race to upgrade
        // from shared to exclusive.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<Uuid> = async {
            let existing = sqlx::query("SELECT 1 FROM records WHERE id = ?")
                .bind(record.id.to_string())
                .fetch_optional(&mut *conn)
                .await?;
            if existing.is_some() {
                return Err(StoreError::DuplicateKey(record.id));
            }

            let step_data = serde_json::to_string(&record.step_data)?;
            sqlx::query("INSERT INTO records (id, step_data) VALUES (?, ?)")
                .bind(record.id.to_string())
                .bind(step_data)
                .execute(&mut *conn)
                .await?;

            let outbox_id = Uuid::new_v4();
            let sequence = Utc::now().timestamp_nanos_opt().unwrap_or_default();
            sqlx::query(
                "INSERT INTO outbox (id, event_type, payload, scheduled_for, processed, retry_count, sequence) \
                 VALUES (?, ?, ?, ?, 0, 0, ?)",
            )
            .bind(outbox_id.to_string())
            .bind(&outbox.event_type)
            .bind(&outbox.payload)
            .bind(outbox.scheduled_for.to_rfc3339())
            .bind(sequence)
            .execute(&mut *conn)
            .await?;

            Ok(outbox_id)
        }
        .await;

        match result {
            Ok(outbox_id) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(outbox_id)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn save_saga_and_enqueue(
        &self,
        instance: &SagaInstance,
        expected_version: i64,
        outbox: Vec<PendingOutbox>,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<()> = async {
            let stored_version: Option<i64> =
                sqlx::query("SELECT version FROM sagas WHERE correlation_id = ?")
                    .bind(instance.correlation_id.to_string())
                    .fetch_optional(&mut *conn)
                    .await?
                    .map(|row| row.get("version"));

            let actual = stored_version.unwrap_or(0);
            if actual != expected_version {
                return Err(StoreError::ConcurrencyConflict {
                    correlation_id: instance.correlation_id,
                    expected: expected_version,
                    actual,
                });
            }

            let new_version = expected_version + 1;
            let mut saved = instance.clone();
            saved.version = new_version;
            let data = serde_json::to_string(&saved)?;
            sqlx::query(
                "INSERT INTO sagas (correlation_id, data, version) VALUES (?, ?, ?) \
                 ON CONFLICT(correlation_id) DO UPDATE SET data = excluded.data, version = excluded.version",
            )
            .bind(instance.correlation_id.to_string())
            .bind(data)
            .bind(new_version)
            .execute(&mut *conn)
            .await?;

            for pending in outbox {
                let outbox_id = Uuid::new_v4();
                let sequence = Utc::now().timestamp_nanos_opt().unwrap_or_default();
                sqlx::query(
                    "INSERT INTO outbox (id, event_type, payload, scheduled_for, processed, retry_count, sequence) \
                     VALUES (?, ?, ?, ?, 0, 0, ?)",
                )
                .bind(outbox_id.to_string())
                .bind(&pending.event_type)
                .bind(&pending.payload)
                .bind(pending.scheduled_for.to_rfc3339())
                .bind(sequence)
                .execute(&mut *conn)
                .await?;
            }

            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn claim_due_outbox(&self, now: DateTime<Utc>, batch_size: u32) -> Result<Vec<OutboxRow>> {
        let rows = sqlx::query(
            "SELECT id, event_type, payload, scheduled_for, processed, processed_at, retry_count, last_error, sequence \
             FROM outbox WHERE processed = 0 AND scheduled_for <= ? \
             ORDER BY scheduled_for ASC, sequence ASC LIMIT ?",
        )
        .bind(now.to_rfc3339())
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_outbox).collect()
    }

    async fn mark_processed(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE outbox SET processed = 1, processed_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: String,
        next_scheduled_for: DateTime<Utc>,
        new_retry_count: u32,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE outbox SET retry_count = ?, scheduled_for = ?, last_error = ? WHERE id = ?",
        )
        .bind(new_retry_count)
        .bind(next_scheduled_for.to_rfc3339())
        .bind(error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_dead_letter(&self, id: Uuid, error: String, retry_count: u32) -> Result<()> {
        sqlx::query(
            "UPDATE outbox SET processed = 1, processed_at = ?, retry_count = ?, last_error = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(retry_count)
        .bind(error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn requeue_outbox_row(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE outbox SET processed = 0, processed_at = NULL, retry_count = 0, last_error = NULL, scheduled_for = ? WHERE id = ?",
        )
        .bind(now.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_saga(&self, correlation_id: Uuid) -> Result<Option<SagaInstance>> {
        let row = sqlx::query("SELECT data FROM sagas WHERE correlation_id = ?")
            .bind(correlation_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: String = row.get("data");
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn count_records(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("c") as u64)
    }

    async fn count_unprocessed_outbox(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM outbox WHERE processed = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("c") as u64)
    }

    async fn count_sagas_by_state(&self) -> Result<Vec<(String, u64)>> {
        let rows = sqlx::query("SELECT data FROM sagas")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = std::collections::HashMap::new();
        for row in rows {
            let data: String = row.get("data");
            let saga: SagaInstance = serde_json::from_str(&data)?;
            *counts.entry(saga.current_state).or_insert(0u64) += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn recent_outbox_rows(&self, limit: u32) -> Result<Vec<OutboxRow>> {
        let rows = sqlx::query(
            "SELECT id, event_type, payload, scheduled_for, processed, processed_at, retry_count, last_error, sequence \
             FROM outbox ORDER BY sequence DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_outbox).collect()
    }
}
