use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::leaf::{hash_records, HashVersion};
use crate::merkle::MerkleTree;
use crate::state::{CommitRecord, Record};

/// Lifecycle of a batch.
///
/// ```text
/// OPEN -> SEALED -> COMMITTED -> ARCHIVED
///            \          \
///             +-> FAILED <-+
/// ```
///
/// `FAILED -> SEALED` is allowed only for failures that left the ledger
/// untouched (see [`FailureKind::is_retryable`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchState {
    Open,
    Sealed,
    Committed,
    Archived,
    Failed,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Open => "OPEN",
            BatchState::Sealed => "SEALED",
            BatchState::Committed => "COMMITTED",
            BatchState::Archived => "ARCHIVED",
            BatchState::Failed => "FAILED",
        }
    }

    pub fn can_transition_to(self, next: BatchState) -> bool {
        use BatchState::*;
        matches!(
            (self, next),
            (Open, Sealed)
                | (Sealed, Committed)
                | (Sealed, Failed)
                | (Committed, Archived)
                | (Committed, Failed)
                | (Failed, Sealed)
        )
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "OPEN" => Ok(BatchState::Open),
            "SEALED" => Ok(BatchState::Sealed),
            "COMMITTED" => Ok(BatchState::Committed),
            "ARCHIVED" => Ok(BatchState::Archived),
            "FAILED" => Ok(BatchState::Failed),
            other => Err(format!("invalid batch state: {}", other)),
        }
    }
}

/// What closed the OPEN batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SealTrigger {
    Size,
    Timer,
    Forced,
}

impl SealTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SealTrigger::Size => "size",
            SealTrigger::Timer => "timer",
            SealTrigger::Forced => "forced",
        }
    }
}

impl FromStr for SealTrigger {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "size" => Ok(SealTrigger::Size),
            "timer" => Ok(SealTrigger::Timer),
            "forced" => Ok(SealTrigger::Forced),
            other => Err(format!("invalid seal trigger: {}", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The ledger refused the batch as submitted.
    LedgerRejected,
    /// The ledger could not be reached within the attempt budget.
    LedgerUnreachable,
    /// The archive already holds different records under the ledger id.
    ArchiveConflict,
}

impl FailureKind {
    /// Only an unreachable ledger leaves the batch untouched on the ledger
    /// side; resubmitting the identical root is then safe.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::LedgerUnreachable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::LedgerRejected => "ledger_rejected",
            FailureKind::LedgerUnreachable => "ledger_unreachable",
            FailureKind::ArchiveConflict => "archive_conflict",
        }
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ledger_rejected" => Ok(FailureKind::LedgerRejected),
            "ledger_unreachable" => Ok(FailureKind::LedgerUnreachable),
            "archive_conflict" => Ok(FailureKind::ArchiveConflict),
            other => Err(format!("invalid failure kind: {}", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub kind: FailureKind,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// A sealed batch and everything that happened to it afterwards.
///
/// There is no `Batch` value for the OPEN stage: the OPEN batch is the set of
/// pending intake rows, owned by the accumulator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub local_id: u64,
    pub state: BatchState,
    pub hash_version: HashVersion,
    pub root: Digest,
    pub trigger: SealTrigger,
    pub sealed_at: DateTime<Utc>,
    pub records: Vec<Record>,
    pub commit: Option<CommitRecord>,
    pub failure: Option<BatchFailure>,
}

impl Batch {
    /// Close an OPEN batch: computes the root so that a sealed batch always
    /// carries it. An empty record list is [`Error::SealNoOp`].
    pub fn seal(
        local_id: u64,
        hash_version: HashVersion,
        records: Vec<Record>,
        trigger: SealTrigger,
    ) -> Result<Self> {
        if records.is_empty() {
            return Err(Error::SealNoOp);
        }
        Ok(Self::seal_unchecked(local_id, hash_version, records, trigger))
    }

    /// Like [`Batch::seal`] but accepts an empty record list.
    pub fn seal_unchecked(
        local_id: u64,
        hash_version: HashVersion,
        records: Vec<Record>,
        trigger: SealTrigger,
    ) -> Self {
        let root = MerkleTree::new(hash_version, &hash_records(hash_version, &records)).root();
        Self {
            local_id,
            state: BatchState::Sealed,
            hash_version,
            root,
            trigger,
            sealed_at: Utc::now(),
            records,
            commit: None,
            failure: None,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn leaves(&self) -> Vec<Digest> {
        hash_records(self.hash_version, &self.records)
    }

    pub fn tree(&self) -> MerkleTree {
        MerkleTree::new(self.hash_version, &self.leaves())
    }

    /// Dedup key digests submitted to the ledger alongside the root.
    pub fn dedup_digests(&self) -> Vec<Digest> {
        self.records
            .iter()
            .map(|r| r.dedup_digest(self.hash_version))
            .collect()
    }

    /// Idempotency key for ledger submissions of this exact content.
    pub fn submission_id(&self) -> String {
        format!("{}:{}", self.local_id, self.root)
    }

    pub fn ledger_batch_id(&self) -> Option<u64> {
        self.commit.as_ref().map(|c| c.ledger_batch_id)
    }

    pub fn transition(&mut self, next: BatchState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn mark_committed(&mut self, commit: CommitRecord) -> Result<()> {
        self.transition(BatchState::Committed)?;
        self.commit = Some(commit);
        Ok(())
    }

    pub fn mark_archived(&mut self) -> Result<()> {
        self.transition(BatchState::Archived)
    }

    pub fn mark_failed(&mut self, kind: FailureKind, reason: impl Into<String>) -> Result<()> {
        self.transition(BatchState::Failed)?;
        self.failure = Some(BatchFailure {
            kind,
            reason: reason.into(),
            failed_at: Utc::now(),
        });
        Ok(())
    }

    /// Operator retry of a failed batch with unchanged content.
    pub fn reopen_for_retry(&mut self) -> Result<()> {
        let retryable = self
            .failure
            .as_ref()
            .map(|f| f.kind.is_retryable())
            .unwrap_or(false);
        if self.state != BatchState::Failed || !retryable {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: BatchState::Sealed.to_string(),
            });
        }
        self.transition(BatchState::Sealed)?;
        self.failure = None;
        Ok(())
    }
}

/// Split `items` into those kept for the batch and later arrivals whose
/// dedup key already appeared. Order of kept items is preserved.
pub fn partition_duplicates<T, F>(items: Vec<T>, dedup_key: F) -> (Vec<T>, Vec<T>)
where
    F: Fn(&T) -> &str,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .partition(|item| seen.insert(dedup_key(item).to_string()))
}

/// Record list held by the archive for one committed ledger batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedBatch {
    pub ledger_batch_id: u64,
    pub hash_version: HashVersion,
    /// Root the archive writer committed. Informational only: verifiers
    /// compare against the ledger, never against this field.
    pub root: Digest,
    pub records: Vec<Record>,
}

impl ArchivedBatch {
    pub fn from_batch(batch: &Batch, ledger_batch_id: u64) -> Self {
        Self {
            ledger_batch_id,
            hash_version: batch.hash_version,
            root: batch.root,
            records: batch.records.clone(),
        }
    }

    pub fn recompute_root(&self) -> Digest {
        MerkleTree::new(
            self.hash_version,
            &hash_records(self.hash_version, &self.records),
        )
        .root()
    }
}
