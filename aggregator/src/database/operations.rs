use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use openvote_core::{Batch, BatchFailure, BatchState, CommitRecord, Digest, Record};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::debug;

use super::models::QueuedRecord;
use super::sql::*;

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

impl QueuedRecord {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let seq: i64 = row.try_get("seq")?;
        Ok(Self {
            seq: seq as u64,
            record: Record {
                payload: row.try_get("payload")?,
                dedup_key: row.try_get("dedup_key")?,
                origin: row.try_get("origin")?,
                arrival_time: row.try_get("arrival_time")?,
            },
        })
    }

    /// Append a record unless a non-duplicate row already holds its dedup
    /// key. Returns the new position, or `None` for a repeated key.
    pub async fn insert_if_new(pool: &SqlitePool, record: &Record) -> Result<Option<u64>> {
        let seq: Option<i64> = sqlx::query_scalar(INSERT_INTAKE_IF_NEW_SQL)
            .bind(&record.payload)
            .bind(&record.dedup_key)
            .bind(&record.origin)
            .bind(record.arrival_time)
            .bind(&record.dedup_key)
            .fetch_optional(pool)
            .await?;
        Ok(seq.map(|s| s as u64))
    }

    /// Append without the dedup check.
    #[cfg(test)]
    pub async fn insert(pool: &SqlitePool, record: &Record) -> Result<u64> {
        let result = sqlx::query(INSERT_INTAKE_SQL)
            .bind(&record.payload)
            .bind(&record.dedup_key)
            .bind(&record.origin)
            .bind(record.arrival_time)
            .execute(pool)
            .await?;
        Ok(result.last_insert_rowid() as u64)
    }

    /// Tag the `limit` oldest pending rows with `local_id` and return them in
    /// queue order.
    pub async fn claim_pending(
        conn: &mut SqliteConnection,
        limit: usize,
        local_id: u64,
    ) -> Result<Vec<Self>> {
        let rows = sqlx::query(CLAIM_PENDING_SQL)
            .bind(local_id as i64)
            .bind(limit as i64)
            .fetch_all(&mut *conn)
            .await?;

        // RETURNING order is unspecified
        let mut claimed = rows
            .iter()
            .map(Self::from_row)
            .collect::<Result<Vec<_>>>()?;
        claimed.sort_by_key(|q| q.seq);
        debug!("Claimed {} intake rows for batch {}", claimed.len(), local_id);
        Ok(claimed)
    }

    pub async fn mark_duplicate(conn: &mut SqliteConnection, seq: u64) -> Result<()> {
        sqlx::query(MARK_DUPLICATE_SQL)
            .bind(seq as i64)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn count_pending(pool: &SqlitePool) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(COUNT_PENDING_SQL)
            .fetch_one(pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn oldest_pending(pool: &SqlitePool) -> Result<Option<Self>> {
        let row = sqlx::query(OLDEST_PENDING_SQL).fetch_optional(pool).await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    /// Highest batch id seen in either the batch table or claimed queue rows.
    pub async fn max_claimed_local_id(pool: &SqlitePool) -> Result<u64> {
        let max: Option<i64> = sqlx::query_scalar(MAX_CLAIMED_LOCAL_ID_SQL)
            .fetch_one(pool)
            .await?;
        Ok(max.unwrap_or(0) as u64)
    }
}

/// Persistence for sealed batches and their lifecycle.
#[derive(Clone)]
pub struct BatchStore {
    pool: SqlitePool,
}

impl BatchStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a freshly sealed batch. Runs on the caller's connection so the
    /// queue claim and the insert commit together.
    pub async fn insert(conn: &mut SqliteConnection, batch: &Batch) -> Result<()> {
        debug!(
            "Inserting batch {} ({} records, root {})",
            batch.local_id,
            batch.len(),
            batch.root
        );

        let (ledger_batch_id, committed_at) = commit_columns(batch);
        let (failure_kind, failure_reason, failed_at) = failure_columns(batch);

        sqlx::query(INSERT_BATCH_SQL)
            .bind(batch.local_id as i64)
            .bind(batch.state.as_str())
            .bind(batch.hash_version.as_str())
            .bind(batch.root.to_hex())
            .bind(batch.trigger.as_str())
            .bind(batch.sealed_at.to_rfc3339())
            .bind(serde_json::to_string(&batch.records)?)
            .bind(ledger_batch_id)
            .bind(committed_at)
            .bind(failure_kind)
            .bind(failure_reason)
            .bind(failed_at)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Persist the lifecycle columns of `batch`.
    pub async fn save_lifecycle(&self, batch: &Batch) -> Result<()> {
        debug!("Batch {} -> {}", batch.local_id, batch.state);

        let (ledger_batch_id, committed_at) = commit_columns(batch);
        let (failure_kind, failure_reason, failed_at) = failure_columns(batch);

        let result = sqlx::query(UPDATE_BATCH_LIFECYCLE_SQL)
            .bind(batch.state.as_str())
            .bind(ledger_batch_id)
            .bind(committed_at)
            .bind(failure_kind)
            .bind(failure_reason)
            .bind(failed_at)
            .bind(Utc::now().to_rfc3339())
            .bind(batch.local_id as i64)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("batch {} not found", batch.local_id));
        }
        Ok(())
    }

    pub async fn get(&self, local_id: u64) -> Result<Option<Batch>> {
        let sql = format!("{} WHERE local_id = ?", SELECT_BATCH_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(local_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    pub async fn get_by_ledger_id(&self, ledger_batch_id: u64) -> Result<Option<Batch>> {
        let sql = format!("{} WHERE ledger_batch_id = ?", SELECT_BATCH_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(ledger_batch_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    /// Batches in `state`, oldest first.
    pub async fn in_state(&self, state: BatchState) -> Result<Vec<Batch>> {
        let sql = format!("{} WHERE state = ? ORDER BY local_id", SELECT_BATCH_COLUMNS);
        let rows = sqlx::query(&sql)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(batch_from_row).collect()
    }

    /// Most recent batches first, optionally filtered by state.
    pub async fn list(&self, state: Option<BatchState>, limit: u32) -> Result<Vec<Batch>> {
        let rows = match state {
            Some(state) => {
                let sql = format!(
                    "{} WHERE state = ? ORDER BY local_id DESC LIMIT ?",
                    SELECT_BATCH_COLUMNS
                );
                sqlx::query(&sql)
                    .bind(state.as_str())
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("{} ORDER BY local_id DESC LIMIT ?", SELECT_BATCH_COLUMNS);
                sqlx::query(&sql)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(batch_from_row).collect()
    }

    pub async fn count_by_state(&self) -> Result<Vec<(BatchState, u64)>> {
        let rows = sqlx::query(COUNT_BATCHES_BY_STATE_SQL)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let state: String = row.try_get("state")?;
                let n: i64 = row.try_get("n")?;
                Ok((state.parse().map_err(anyhow::Error::msg)?, n as u64))
            })
            .collect()
    }
}

fn commit_columns(batch: &Batch) -> (Option<i64>, Option<String>) {
    match &batch.commit {
        Some(c) => (
            Some(c.ledger_batch_id as i64),
            Some(c.committed_at.to_rfc3339()),
        ),
        None => (None, None),
    }
}

fn failure_columns(batch: &Batch) -> (Option<&'static str>, Option<String>, Option<String>) {
    match &batch.failure {
        Some(f) => (
            Some(f.kind.as_str()),
            Some(f.reason.clone()),
            Some(f.failed_at.to_rfc3339()),
        ),
        None => (None, None, None),
    }
}

fn batch_from_row(row: &SqliteRow) -> Result<Batch> {
    let local_id: i64 = row.try_get("local_id")?;
    let state: String = row.try_get("state")?;
    let hash_version: String = row.try_get("hash_version")?;
    let root: String = row.try_get("root")?;
    let trigger: String = row.try_get("seal_trigger")?;
    let sealed_at: String = row.try_get("sealed_at")?;
    let records: String = row.try_get("records")?;
    let ledger_batch_id: Option<i64> = row.try_get("ledger_batch_id")?;
    let committed_at: Option<String> = row.try_get("committed_at")?;
    let failure_kind: Option<String> = row.try_get("failure_kind")?;
    let failure_reason: Option<String> = row.try_get("failure_reason")?;
    let failed_at: Option<String> = row.try_get("failed_at")?;

    let root = Digest::from_hex(&root)?;

    let commit = match (ledger_batch_id, committed_at) {
        (Some(id), Some(at)) => Some(CommitRecord {
            ledger_batch_id: id as u64,
            root,
            committed_at: parse_ts(&at)?,
        }),
        _ => None,
    };

    let failure = match (failure_kind, failed_at) {
        (Some(kind), Some(at)) => Some(BatchFailure {
            kind: kind.parse().map_err(anyhow::Error::msg)?,
            reason: failure_reason.unwrap_or_default(),
            failed_at: parse_ts(&at)?,
        }),
        _ => None,
    };

    Ok(Batch {
        local_id: local_id as u64,
        state: state.parse().map_err(anyhow::Error::msg)?,
        hash_version: hash_version.parse()?,
        root,
        trigger: trigger.parse().map_err(anyhow::Error::msg)?,
        sealed_at: parse_ts(&sealed_at)?,
        records: serde_json::from_str(&records)?,
        commit,
        failure,
    })
}
