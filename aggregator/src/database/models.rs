use chrono::{DateTime, Utc};
use openvote_core::{Batch, BatchFailure, BatchState, Digest, Record, SealTrigger};
use serde::Serialize;

/// A row of the intake queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRecord {
    /// Queue position, strictly increasing in arrival order.
    pub seq: u64,
    pub record: Record,
}

/// Batch without its record list, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub local_id: u64,
    pub state: BatchState,
    pub root: Digest,
    pub trigger: SealTrigger,
    pub record_count: usize,
    pub sealed_at: DateTime<Utc>,
    pub ledger_batch_id: Option<u64>,
    pub committed_at: Option<DateTime<Utc>>,
    pub failure: Option<BatchFailure>,
}

impl From<&Batch> for BatchSummary {
    fn from(batch: &Batch) -> Self {
        Self {
            local_id: batch.local_id,
            state: batch.state,
            root: batch.root,
            trigger: batch.trigger,
            record_count: batch.len(),
            sealed_at: batch.sealed_at,
            ledger_batch_id: batch.ledger_batch_id(),
            committed_at: batch.commit.as_ref().map(|c| c.committed_at),
            failure: batch.failure.clone(),
        }
    }
}

