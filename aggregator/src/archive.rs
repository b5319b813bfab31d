//! Batch archive: the record lists behind committed roots, addressable by
//! ledger batch id, for anyone who wants to recompute a root.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use openvote_core::{ArchivedBatch, Digest, Error};
use reqwest::{Client, StatusCode};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::{debug, error};

use crate::database::sql::{INSERT_ARCHIVE_SQL, SELECT_ARCHIVE_SQL};

/// Read side of the archive. `Ok(None)` means the archive has nothing for
/// the id, which reconciliation reports as DATA_UNAVAILABLE. An entry that
/// exists but does not decode, or answers for another id, is `ArchiveCorrupt`.
#[async_trait]
pub trait ArchiveReader: Send + Sync {
    async fn fetch(&self, ledger_batch_id: u64) -> Result<Option<ArchivedBatch>, Error>;
}

/// Write side. Ids are write-once: storing identical content again is a
/// no-op, storing different content is `ArchiveConflict`.
#[async_trait]
pub trait ArchiveStore: ArchiveReader {
    async fn store(&self, batch: &ArchivedBatch) -> Result<(), Error>;
}

/// Archive kept in the aggregator's own SQLite database.
#[derive(Clone)]
pub struct SqliteArchive {
    pool: SqlitePool,
}

impl SqliteArchive {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// A row that exists but does not decode is `ArchiveCorrupt`.
    async fn load(&self, ledger_batch_id: u64) -> Result<Option<ArchivedBatch>, Error> {
        let row = sqlx::query(SELECT_ARCHIVE_SQL)
            .bind(ledger_batch_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::ArchiveUnreachable(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        decode_row(ledger_batch_id, &row)
            .map(Some)
            .map_err(|e| Error::ArchiveCorrupt {
                ledger_batch_id,
                reason: format!("{:#}", e),
            })
    }
}

fn decode_row(ledger_batch_id: u64, row: &SqliteRow) -> anyhow::Result<ArchivedBatch> {
    let hash_version: String = row.try_get("hash_version")?;
    let root: String = row.try_get("root")?;
    let records: String = row.try_get("records")?;
    Ok(ArchivedBatch {
        ledger_batch_id,
        hash_version: hash_version.parse()?,
        root: Digest::from_hex(&root)?,
        records: serde_json::from_str(&records)?,
    })
}

#[async_trait]
impl ArchiveReader for SqliteArchive {
    async fn fetch(&self, ledger_batch_id: u64) -> Result<Option<ArchivedBatch>, Error> {
        self.load(ledger_batch_id).await
    }
}

#[async_trait]
impl ArchiveStore for SqliteArchive {
    async fn store(&self, batch: &ArchivedBatch) -> Result<(), Error> {
        let write_failed = |e: &dyn std::fmt::Display| Error::ArchiveWriteFailed {
            ledger_batch_id: batch.ledger_batch_id,
            reason: e.to_string(),
        };

        let records = serde_json::to_string(&batch.records).map_err(|e| write_failed(&e))?;
        let inserted = sqlx::query(INSERT_ARCHIVE_SQL)
            .bind(batch.ledger_batch_id as i64)
            .bind(batch.hash_version.as_str())
            .bind(batch.root.to_hex())
            .bind(&records)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| write_failed(&e))?
            .rows_affected();

        if inserted == 1 {
            debug!(
                "Archived ledger batch {} ({} records)",
                batch.ledger_batch_id,
                batch.records.len()
            );
            return Ok(());
        }

        // Already present: fine only if it is the same content
        let existing = match self.load(batch.ledger_batch_id).await {
            Ok(existing) => existing,
            Err(e @ Error::ArchiveCorrupt { .. }) => {
                error!("{}", e);
                return Err(Error::ArchiveConflict(batch.ledger_batch_id));
            }
            Err(e) => return Err(write_failed(&e)),
        };
        match existing {
            Some(existing) if existing == *batch => Ok(()),
            Some(_) => {
                error!(
                    "Archive already holds different records for ledger batch {}",
                    batch.ledger_batch_id
                );
                Err(Error::ArchiveConflict(batch.ledger_batch_id))
            }
            None => Err(write_failed(&"row vanished after insert was ignored")),
        }
    }
}

/// Read-only client for another aggregator's `GET /batch/{id}`.
pub struct HttpArchive {
    client: Client,
    base_url: String,
}

impl HttpArchive {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ArchiveReader for HttpArchive {
    async fn fetch(&self, ledger_batch_id: u64) -> Result<Option<ArchivedBatch>, Error> {
        let url = format!("{}/batch/{}", self.base_url, ledger_batch_id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::ArchiveUnreachable(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNPROCESSABLE_ENTITY => Err(Error::ArchiveCorrupt {
                ledger_batch_id,
                reason: format!("GET {} reports an unreadable entry", url),
            }),
            s if s.is_success() => {
                let batch = resp.json::<ArchivedBatch>().await.map_err(|e| {
                    if e.is_decode() {
                        Error::ArchiveCorrupt {
                            ledger_batch_id,
                            reason: e.to_string(),
                        }
                    } else {
                        Error::ArchiveUnreachable(e.to_string())
                    }
                })?;
                // Never trust an entry served under a different id
                if batch.ledger_batch_id != ledger_batch_id {
                    return Err(Error::ArchiveCorrupt {
                        ledger_batch_id,
                        reason: format!("served entry for ledger batch {}", batch.ledger_batch_id),
                    });
                }
                Ok(Some(batch))
            }
            s => Err(Error::ArchiveUnreachable(format!("GET {} returned {}", url, s))),
        }
    }
}
