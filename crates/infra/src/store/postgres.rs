//! Postgres-backed entry store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database | any | `Database` (message carries the code) |
//! | PoolClosed | N/A | `PoolClosed` |
//! | ColumnDecode / ColumnNotFound | N/A | `InvalidRow` |
//! | Other | N/A | `Database` |
//!
//! ## Blocking
//!
//! The store traits are synchronous. Every statement is driven through
//! `Handle::block_on` on the runtime captured at construction, so callers must
//! be plain threads (the dispatch and reaper workers are), never tasks running
//! on that runtime.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tokio::runtime::Handle;
use tracing::{instrument, warn};

use dbq_core::{OwnerId, ProcessingState, QueueEntry, RecordId, UserToken};

use super::r#trait::{EntryStore, EntryTransaction, StoreError, StoreResult};

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

const COLUMNS: &str = "record_id, class_name, event_json, queue_name, user_token, \
    future_user_token, created_date, creating_owner, processing_owner, \
    processing_available_date, processing_state, error_count, search_key1, \
    search_key2, effective_date";

/// Postgres entry store over a sqlx pool.
#[derive(Debug, Clone)]
pub struct PostgresEntryStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresEntryStore {
    /// Use the runtime the caller is currently running in.
    pub fn new(pool: PgPool) -> StoreResult<Self> {
        let handle = Handle::try_current().map_err(|_| {
            StoreError::Runtime(
                "PostgresEntryStore must be created inside a tokio runtime".to_string(),
            )
        })?;
        Ok(Self::with_handle(pool, handle))
    }

    pub fn with_handle(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the active and history tables if they are missing.
    #[instrument(skip(self), err)]
    pub fn create_tables(&self, table: &str, history_table: &str) -> StoreResult<()> {
        let active = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                record_id BIGSERIAL PRIMARY KEY,
                class_name VARCHAR(128) NOT NULL,
                event_json TEXT NOT NULL,
                queue_name VARCHAR(128) NOT NULL,
                user_token UUID NOT NULL,
                future_user_token UUID,
                created_date TIMESTAMPTZ NOT NULL,
                creating_owner VARCHAR(128) NOT NULL,
                processing_owner VARCHAR(128),
                processing_available_date TIMESTAMPTZ,
                processing_state VARCHAR(14) NOT NULL DEFAULT 'AVAILABLE',
                error_count INTEGER NOT NULL DEFAULT 0,
                search_key1 BIGINT,
                search_key2 BIGINT,
                effective_date TIMESTAMPTZ NOT NULL
            )
            "#
        );
        let active_index = format!(
            "CREATE INDEX IF NOT EXISTS {idx}_ready ON {table} (processing_state, effective_date, record_id)",
            idx = table.replace('.', "_"),
        );
        let history = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {history_table} (
                record_id BIGINT PRIMARY KEY,
                class_name VARCHAR(128) NOT NULL,
                event_json TEXT NOT NULL,
                queue_name VARCHAR(128) NOT NULL,
                user_token UUID NOT NULL,
                future_user_token UUID,
                created_date TIMESTAMPTZ NOT NULL,
                creating_owner VARCHAR(128) NOT NULL,
                processing_owner VARCHAR(128),
                processing_available_date TIMESTAMPTZ,
                processing_state VARCHAR(14) NOT NULL,
                error_count INTEGER NOT NULL DEFAULT 0,
                search_key1 BIGINT,
                search_key2 BIGINT,
                effective_date TIMESTAMPTZ NOT NULL
            )
            "#
        );

        self.handle.block_on(async {
            for statement in [&active, &active_index, &history] {
                sqlx::query(statement)
                    .execute(&*self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("create_tables", e))?;
            }
            Ok::<(), StoreError>(())
        })
    }
}

impl EntryStore for PostgresEntryStore {
    fn in_transaction<R, F>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut dyn EntryTransaction) -> StoreResult<R>,
    {
        let mut tx = self
            .handle
            .block_on(self.pool.begin())
            .map_err(|e| map_sqlx_error("begin", e))?;

        let result = {
            let mut entry_tx = PgEntryTransaction::attach(&mut *tx, self.handle.clone());
            let entry_tx: &mut dyn EntryTransaction = &mut entry_tx;
            f(entry_tx)
        };

        match result {
            Ok(value) => {
                self.handle
                    .block_on(tx.commit())
                    .map_err(|e| map_sqlx_error("commit", e))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self.handle.block_on(tx.rollback()) {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

/// Entry statements bound to one open Postgres connection.
///
/// Built by [`PostgresEntryStore::in_transaction`], or by callers that want
/// queue writes to commit with their own transaction:
/// `PgEntryTransaction::attach(&mut *their_tx, handle)`.
pub struct PgEntryTransaction<'c> {
    conn: &'c mut PgConnection,
    handle: Handle,
}

impl<'c> PgEntryTransaction<'c> {
    pub fn attach(conn: &'c mut PgConnection, handle: Handle) -> Self {
        Self { conn, handle }
    }

    fn fetch_entries(
        &mut self,
        operation: &'static str,
        sql: &str,
        bind: impl FnOnce(PgQuery<'_>) -> PgQuery<'_>,
    ) -> StoreResult<Vec<QueueEntry>> {
        let conn = &mut *self.conn;
        let rows = self
            .handle
            .block_on(async { bind(sqlx::query(sql)).fetch_all(&mut *conn).await })
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(|row| entry_from_row(operation, row)).collect()
    }
}

impl EntryTransaction for PgEntryTransaction<'_> {
    #[instrument(skip(self, entry), fields(queue = %entry.queue_name), err)]
    fn insert_entry(&mut self, entry: &QueueEntry, table: &str) -> StoreResult<RecordId> {
        let sql = format!(
            r#"
            INSERT INTO {table} (
                class_name, event_json, queue_name, user_token, future_user_token,
                created_date, creating_owner, processing_owner, processing_available_date,
                processing_state, error_count, search_key1, search_key2, effective_date
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING record_id
            "#
        );
        let conn = &mut *self.conn;
        let record_id: i64 = self
            .handle
            .block_on(async {
                sqlx::query_scalar(&sql)
                    .bind(&entry.class_name)
                    .bind(&entry.event_json)
                    .bind(&entry.queue_name)
                    .bind(entry.user_token.as_uuid())
                    .bind(entry.future_user_token.map(uuid::Uuid::from))
                    .bind(entry.created_date)
                    .bind(entry.creating_owner.as_str())
                    .bind(entry.processing_owner.as_ref().map(OwnerId::as_str))
                    .bind(entry.processing_available_date)
                    .bind(entry.processing_state.as_str())
                    .bind(count_to_db(entry.error_count))
                    .bind(entry.search_key1)
                    .bind(entry.search_key2)
                    .bind(entry.effective_date)
                    .fetch_one(&mut *conn)
                    .await
            })
            .map_err(|e| map_sqlx_error("insert_entry", e))?;
        Ok(RecordId::new(record_id))
    }

    #[instrument(skip(self, entries), fields(count = entries.len()), err)]
    fn insert_history(&mut self, entries: &[QueueEntry], history_table: &str) -> StoreResult<u64> {
        let sql = format!(
            r#"
            INSERT INTO {history_table} ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (record_id) DO NOTHING
            "#
        );
        let conn = &mut *self.conn;
        self.handle
            .block_on(async {
                let mut written = 0;
                for entry in entries {
                    let result = sqlx::query(&sql)
                        .bind(entry.record_id.value())
                        .bind(&entry.class_name)
                        .bind(&entry.event_json)
                        .bind(&entry.queue_name)
                        .bind(entry.user_token.as_uuid())
                        .bind(entry.future_user_token.map(uuid::Uuid::from))
                        .bind(entry.created_date)
                        .bind(entry.creating_owner.as_str())
                        .bind(entry.processing_owner.as_ref().map(OwnerId::as_str))
                        .bind(entry.processing_available_date)
                        .bind(entry.processing_state.as_str())
                        .bind(count_to_db(entry.error_count))
                        .bind(entry.search_key1)
                        .bind(entry.search_key2)
                        .bind(entry.effective_date)
                        .execute(&mut *conn)
                        .await?;
                    written += result.rows_affected();
                }
                Ok::<u64, sqlx::Error>(written)
            })
            .map_err(|e| map_sqlx_error("insert_history", e))
    }

    #[instrument(skip(self), fields(record_id = %record_id, owner = %owner), err)]
    fn claim_entry(
        &mut self,
        record_id: RecordId,
        owner: &OwnerId,
        claim_expiry: DateTime<Utc>,
        table: &str,
    ) -> StoreResult<u64> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET processing_owner = $2,
                processing_available_date = $3,
                processing_state = 'IN_PROCESSING'
            WHERE record_id = $1
              AND processing_state = 'AVAILABLE'
              AND processing_owner IS NULL
            "#
        );
        let conn = &mut *self.conn;
        let result = self
            .handle
            .block_on(async {
                sqlx::query(&sql)
                    .bind(record_id.value())
                    .bind(owner.as_str())
                    .bind(claim_expiry)
                    .execute(&mut *conn)
                    .await
            })
            .map_err(|e| map_sqlx_error("claim_entry", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(owner = %owner), err)]
    fn claim_entries(
        &mut self,
        owner: &OwnerId,
        now: DateTime<Utc>,
        claim_expiry: DateTime<Utc>,
        limit: usize,
        table: &str,
    ) -> StoreResult<Vec<RecordId>> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET processing_owner = $1,
                processing_available_date = $2,
                processing_state = 'IN_PROCESSING'
            WHERE record_id IN (
                SELECT record_id FROM {table}
                WHERE processing_state = 'AVAILABLE'
                  AND processing_owner IS NULL
                  AND effective_date <= $3
                ORDER BY record_id ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
              AND processing_state = 'AVAILABLE'
              AND processing_owner IS NULL
            RETURNING record_id
            "#
        );
        let conn = &mut *self.conn;
        let mut ids: Vec<i64> = self
            .handle
            .block_on(async {
                sqlx::query_scalar(&sql)
                    .bind(owner.as_str())
                    .bind(claim_expiry)
                    .bind(now)
                    .bind(limit_to_db(limit))
                    .fetch_all(&mut *conn)
                    .await
            })
            .map_err(|e| map_sqlx_error("claim_entries", e))?;
        ids.sort_unstable();
        Ok(ids.into_iter().map(RecordId::new).collect())
    }

    #[instrument(skip(self), err)]
    fn ready_entries(
        &mut self,
        now: DateTime<Utc>,
        owner: Option<&OwnerId>,
        limit: usize,
        table: &str,
    ) -> StoreResult<Vec<QueueEntry>> {
        match owner {
            None => {
                let sql = format!(
                    r#"
                    SELECT {COLUMNS} FROM {table}
                    WHERE processing_state = 'AVAILABLE'
                      AND processing_owner IS NULL
                      AND effective_date <= $1
                    ORDER BY record_id ASC
                    LIMIT $2
                    "#
                );
                self.fetch_entries("ready_entries", &sql, |q| {
                    q.bind(now).bind(limit_to_db(limit))
                })
            }
            Some(owner) => {
                let sql = format!(
                    r#"
                    SELECT {COLUMNS} FROM {table}
                    WHERE processing_state = 'IN_PROCESSING'
                      AND processing_owner = $1
                    ORDER BY record_id ASC
                    LIMIT $2
                    "#
                );
                let owner = owner.as_str().to_string();
                self.fetch_entries("ready_entries", &sql, move |q| {
                    q.bind(owner).bind(limit_to_db(limit))
                })
            }
        }
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    fn entries_by_ids(&mut self, ids: &[RecordId], table: &str) -> StoreResult<Vec<QueueEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {COLUMNS} FROM {table} WHERE record_id = ANY($1) ORDER BY record_id ASC"
        );
        let ids: Vec<i64> = ids.iter().map(RecordId::value).collect();
        self.fetch_entries("entries_by_ids", &sql, move |q| q.bind(ids))
    }

    #[instrument(skip(self), fields(record_id = %record_id), err)]
    fn entry(&mut self, record_id: RecordId, table: &str) -> StoreResult<Option<QueueEntry>> {
        let sql = format!("SELECT {COLUMNS} FROM {table} WHERE record_id = $1");
        Ok(self
            .fetch_entries("entry", &sql, |q| q.bind(record_id.value()))?
            .into_iter()
            .next())
    }

    #[instrument(skip(self), err)]
    fn entries_left_behind(
        &mut self,
        cutoff: DateTime<Utc>,
        owner: &OwnerId,
        max_redispatch_count: u32,
        limit: usize,
        table: &str,
    ) -> StoreResult<Vec<QueueEntry>> {
        // Row locks keep two reapers from re-dispatching the same orphan.
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM {table}
            WHERE ((processing_state = 'IN_PROCESSING'
                    AND processing_available_date <= $1
                    AND processing_owner <> $2)
                OR (processing_state = 'AVAILABLE'
                    AND processing_owner IS NULL
                    AND effective_date <= $1
                    AND creating_owner <> $2))
              AND error_count < $3
            ORDER BY record_id ASC
            LIMIT $4
            FOR UPDATE SKIP LOCKED
            "#
        );
        let owner = owner.as_str().to_string();
        self.fetch_entries("entries_left_behind", &sql, move |q| {
            q.bind(cutoff)
                .bind(owner)
                .bind(count_to_db(max_redispatch_count))
                .bind(limit_to_db(limit))
        })
    }

    #[instrument(skip(self), err)]
    fn own_entries_left_behind(
        &mut self,
        cutoff: DateTime<Utc>,
        owner: &OwnerId,
        limit: usize,
        table: &str,
    ) -> StoreResult<Vec<QueueEntry>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM {table}
            WHERE (processing_state = 'IN_PROCESSING'
                   AND processing_available_date <= $1
                   AND processing_owner = $2)
               OR (processing_state = 'AVAILABLE'
                   AND processing_owner IS NULL
                   AND effective_date <= $1
                   AND creating_owner = $2)
            ORDER BY record_id ASC
            LIMIT $3
            "#
        );
        let owner = owner.as_str().to_string();
        self.fetch_entries("own_entries_left_behind", &sql, move |q| {
            q.bind(cutoff).bind(owner).bind(limit_to_db(limit))
        })
    }

    #[instrument(skip(self), fields(record_id = %record_id), err)]
    fn update_on_error(
        &mut self,
        record_id: RecordId,
        error_count: u32,
        effective_date: DateTime<Utc>,
        table: &str,
    ) -> StoreResult<u64> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET processing_state = 'AVAILABLE',
                processing_owner = NULL,
                processing_available_date = NULL,
                error_count = $2,
                effective_date = $3
            WHERE record_id = $1
            "#
        );
        let conn = &mut *self.conn;
        let result = self
            .handle
            .block_on(async {
                sqlx::query(&sql)
                    .bind(record_id.value())
                    .bind(count_to_db(error_count))
                    .bind(effective_date)
                    .execute(&mut *conn)
                    .await
            })
            .map_err(|e| map_sqlx_error("update_on_error", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    fn remove_entries(&mut self, ids: &[RecordId], table: &str) -> StoreResult<Vec<RecordId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("DELETE FROM {table} WHERE record_id = ANY($1) RETURNING record_id");
        let ids: Vec<i64> = ids.iter().map(RecordId::value).collect();
        let conn = &mut *self.conn;
        let mut removed: Vec<i64> = self
            .handle
            .block_on(async { sqlx::query_scalar(&sql).bind(ids).fetch_all(&mut *conn).await })
            .map_err(|e| map_sqlx_error("remove_entries", e))?;
        removed.sort_unstable();
        Ok(removed.into_iter().map(RecordId::new).collect())
    }

    #[instrument(skip(self), err)]
    fn count_ready(&mut self, now: DateTime<Utc>, table: &str) -> StoreResult<u64> {
        let sql = format!(
            r#"
            SELECT COUNT(*) FROM {table}
            WHERE processing_state = 'AVAILABLE' AND effective_date <= $1
            "#
        );
        let conn = &mut *self.conn;
        let count: i64 = self
            .handle
            .block_on(async { sqlx::query_scalar(&sql).bind(now).fetch_one(&mut *conn).await })
            .map_err(|e| map_sqlx_error("count_ready", e))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    #[instrument(skip(self), err)]
    fn entries_for_search_keys(
        &mut self,
        search_key1: Option<i64>,
        search_key2: Option<i64>,
        table: &str,
    ) -> StoreResult<Vec<QueueEntry>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM {table}
            WHERE ($1::BIGINT IS NULL OR search_key1 = $1)
              AND ($2::BIGINT IS NULL OR search_key2 = $2)
            ORDER BY record_id ASC
            "#
        );
        self.fetch_entries("entries_for_search_keys", &sql, |q| {
            q.bind(search_key1).bind(search_key2)
        })
    }

    #[instrument(skip(self), err)]
    fn in_processing_entries(&mut self, table: &str) -> StoreResult<Vec<QueueEntry>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {table} WHERE processing_state = 'IN_PROCESSING' ORDER BY record_id ASC"
        );
        self.fetch_entries("in_processing_entries", &sql, |q| q)
    }
}

fn limit_to_db(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn count_to_db(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

fn entry_from_row(operation: &'static str, row: &PgRow) -> StoreResult<QueueEntry> {
    let invalid = |message: String| StoreError::InvalidRow { operation, message };
    let column_err = |e: sqlx::Error| invalid(e.to_string());

    let state: String = row.try_get("processing_state").map_err(column_err)?;
    let processing_state: ProcessingState = state.parse().map_err(|e| invalid(format!("{e}")))?;
    let creating_owner: String = row.try_get("creating_owner").map_err(column_err)?;
    let processing_owner: Option<String> = row.try_get("processing_owner").map_err(column_err)?;
    let error_count: i32 = row.try_get("error_count").map_err(column_err)?;
    let future_user_token: Option<uuid::Uuid> =
        row.try_get("future_user_token").map_err(column_err)?;

    Ok(QueueEntry {
        record_id: RecordId::new(row.try_get("record_id").map_err(column_err)?),
        class_name: row.try_get("class_name").map_err(column_err)?,
        event_json: row.try_get("event_json").map_err(column_err)?,
        queue_name: row.try_get("queue_name").map_err(column_err)?,
        user_token: UserToken::from_uuid(row.try_get("user_token").map_err(column_err)?),
        future_user_token: future_user_token.map(UserToken::from_uuid),
        created_date: row.try_get("created_date").map_err(column_err)?,
        creating_owner: OwnerId::new(creating_owner).map_err(|e| invalid(e.to_string()))?,
        processing_owner: processing_owner
            .map(OwnerId::new)
            .transpose()
            .map_err(|e| invalid(e.to_string()))?,
        processing_available_date: row
            .try_get("processing_available_date")
            .map_err(column_err)?,
        processing_state,
        error_count: u32::try_from(error_count).unwrap_or_default(),
        search_key1: row.try_get("search_key1").map_err(column_err)?,
        search_key2: row.try_get("search_key2").map_err(column_err)?,
        effective_date: row.try_get("effective_date").map_err(column_err)?,
    })
}

/// Map SQLx errors to `StoreError`, keyed by the statement that failed.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            StoreError::Database {
                operation,
                message: if code.is_empty() {
                    db_err.message().to_string()
                } else {
                    format!("[{code}] {}", db_err.message())
                },
            }
        }
        sqlx::Error::PoolClosed => StoreError::PoolClosed(operation),
        other @ (sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_)) => {
            StoreError::InvalidRow {
                operation,
                message: other.to_string(),
            }
        }
        other => StoreError::Database {
            operation,
            message: other.to_string(),
        },
    }
}
