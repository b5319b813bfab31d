//! Durable intake queue.
//!
//! Every accepted record is written to SQLite before intake acknowledges it,
//! so a crash between intake and sealing loses nothing. Records stay in the
//! table after they are claimed, tagged with the batch that took them.

use std::time::Duration;

use openvote_core::{Error, Record};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use crate::database::models::QueuedRecord;

#[derive(Clone)]
pub struct IntakeQueue {
    pool: SqlitePool,
    write_timeout: Duration,
}

impl IntakeQueue {
    pub fn new(pool: SqlitePool, write_timeout: Duration) -> Self {
        Self {
            pool,
            write_timeout,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Validate and persist `record`, returning its queue position.
    ///
    /// Structural problems and dedup keys already accepted earlier are
    /// `IntakeRejected`. A storage failure or a write that does not finish
    /// within the timeout is `QueuePersistFailed`; the record was not accepted.
    pub async fn enqueue(&self, record: &Record) -> Result<u64, Error> {
        record.validate()?;

        let write = QueuedRecord::insert_if_new(&self.pool, record);
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(Some(position))) => {
                debug!("Enqueued record at position {}", position);
                Ok(position)
            }
            Ok(Ok(None)) => Err(Error::IntakeRejected(
                "dedup key already accepted".to_string(),
            )),
            Ok(Err(e)) => {
                warn!("Queue write failed: {}", e);
                Err(Error::QueuePersistFailed(e.to_string()))
            }
            Err(_) => {
                warn!("Queue write timed out after {:?}", self.write_timeout);
                Err(Error::QueuePersistFailed(format!(
                    "write timed out after {}ms",
                    self.write_timeout.as_millis()
                )))
            }
        }
    }

    /// Claim up to `n` of the oldest pending records for batch `claim`.
    pub async fn drain_up_to(&self, n: usize, claim: u64) -> Result<Vec<QueuedRecord>, Error> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| Error::QueuePersistFailed(e.to_string()))?;
        Self::drain_on(&mut conn, n, claim).await
    }

    /// [`IntakeQueue::drain_up_to`] on a caller-held connection, typically a
    /// transaction that also inserts the sealed batch.
    pub async fn drain_on(
        conn: &mut SqliteConnection,
        n: usize,
        claim: u64,
    ) -> Result<Vec<QueuedRecord>, Error> {
        QueuedRecord::claim_pending(conn, n, claim)
            .await
            .map_err(|e| Error::QueuePersistFailed(e.to_string()))
    }

    /// Number of records waiting for a batch.
    pub async fn depth(&self) -> Result<u64, Error> {
        QueuedRecord::count_pending(&self.pool)
            .await
            .map_err(|e| Error::QueuePersistFailed(e.to_string()))
    }

    pub async fn oldest_pending(&self) -> Result<Option<QueuedRecord>, Error> {
        QueuedRecord::oldest_pending(&self.pool)
            .await
            .map_err(|e| Error::QueuePersistFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::database::Database;

    fn record(i: usize) -> Record {
        Record::new(
            format!("ballot-{}", i).into_bytes(),
            format!("voter-{}", i),
            "station-1",
            1_700_000_000_000,
        )
    }

    async fn queue() -> IntakeQueue {
        let db = Database::in_memory().await.unwrap();
        IntakeQueue::new(db.pool().clone(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn enqueue_assigns_increasing_positions() {
        let q = queue().await;
        let a = q.enqueue(&record(0)).await.unwrap();
        let b = q.enqueue(&record(1)).await.unwrap();
        assert!(b > a);
        assert_eq!(q.depth().await.unwrap(), 2);
        assert_eq!(q.oldest_pending().await.unwrap().unwrap().seq, a);
    }

    #[tokio::test]
    async fn rejects_invalid_and_repeated_records() {
        let q = queue().await;
        let empty = Record::new(vec![], "voter-x", "station-1", 1);
        assert!(matches!(
            q.enqueue(&empty).await,
            Err(Error::IntakeRejected(_))
        ));

        q.enqueue(&record(7)).await.unwrap();
        let mut again = record(7);
        again.payload = b"second ballot".to_vec();
        assert!(matches!(
            q.enqueue(&again).await,
            Err(Error::IntakeRejected(_))
        ));
        assert_eq!(q.depth().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_intakes_of_one_voter_accept_exactly_one() {
        let dir = std::env::temp_dir().join(format!("ov_queue_{}", rand::random::<u32>()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("intake.db");
        let db = Database::connect(path.to_str().unwrap()).await.unwrap();
        let q = IntakeQueue::new(db.pool().clone(), Duration::from_secs(10));

        for round in 0..20 {
            let mut handles = Vec::new();
            for attempt in 0..8 {
                let q = q.clone();
                let mut r = record(round);
                r.payload = format!("ballot-{}-try-{}", round, attempt).into_bytes();
                handles.push(tokio::spawn(async move { q.enqueue(&r).await }));
            }

            let mut accepted = 0;
            for h in handles {
                match h.await.unwrap() {
                    Ok(_) => accepted += 1,
                    Err(Error::IntakeRejected(_)) => {}
                    Err(e) => panic!("round {}: unexpected {}", round, e),
                }
            }
            assert_eq!(accepted, 1, "round {}", round);
        }
        assert_eq!(q.depth().await.unwrap(), 20);

        db.pool().close().await;
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn closed_pool_is_persist_failure() {
        let q = queue().await;
        q.pool().close().await;
        assert!(matches!(
            q.enqueue(&record(0)).await,
            Err(Error::QueuePersistFailed(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_enqueue_then_drain_loses_nothing() {
        let q = queue().await;
        let mut handles = Vec::new();
        for i in 0..50 {
            let q = q.clone();
            handles.push(tokio::spawn(async move { q.enqueue(&record(i)).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let mut seen = HashSet::new();
        let mut claim = 1;
        loop {
            let drained = q.drain_up_to(8, claim).await.unwrap();
            if drained.is_empty() {
                break;
            }
            assert!(drained.len() <= 8);
            for item in drained {
                assert!(seen.insert(item.record.dedup_key));
            }
            claim += 1;
        }
        assert_eq!(seen.len(), 50);
        assert_eq!(q.depth().await.unwrap(), 0);
    }
}
