use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::leaf::HashVersion;

/// What the ledger returns once it has accepted a root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub ledger_batch_id: u64,
    pub root: Digest,
    pub committed_at: DateTime<Utc>,
}

/// Payload of a ledger submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub root: Digest,
    pub dedup_keys: Vec<Digest>,
    /// Idempotency key; the ledger returns the original [`CommitRecord`] when
    /// it sees the same id twice.
    pub submission_id: String,
    pub hash_version: HashVersion,
}
