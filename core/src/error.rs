use thiserror::Error;

/// Failure taxonomy shared by intake, batching, commitment, archive and
/// reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Intake rejected: {0}")]
    IntakeRejected(String),
    #[error("Queue persist failed: {0}")]
    QueuePersistFailed(String),
    #[error("Seal skipped: open batch is empty")]
    SealNoOp,
    #[error("Ledger rejected commit: {0}")]
    LedgerRejected(String),
    #[error("Ledger unreachable: {0}")]
    LedgerUnreachable(String),
    #[error("Archive write failed for ledger batch {ledger_batch_id}: {reason}")]
    ArchiveWriteFailed { ledger_batch_id: u64, reason: String },
    #[error("Archive already holds different records for ledger batch {0}")]
    ArchiveConflict(u64),
    #[error("Archive unreachable: {0}")]
    ArchiveUnreachable(String),
    #[error("Archive entry for ledger batch {ledger_batch_id} is unreadable: {reason}")]
    ArchiveCorrupt { ledger_batch_id: u64, reason: String },
    #[error("No archived data for ledger batch {0}")]
    DataUnavailable(u64),
    #[error("Root mismatch for ledger batch {ledger_batch_id}: committed {expected}, recomputed {recomputed}")]
    Mismatch {
        ledger_batch_id: u64,
        expected: String,
        recomputed: String,
    },
    #[error("Not found")]
    NotFound,
    #[error("Unsupported hash version: {0}")]
    UnsupportedHashVersion(String),
    #[error("Invalid batch transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
}

impl Error {
    /// Errors worth retrying with the same payload.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::LedgerUnreachable(_)
                | Error::ArchiveWriteFailed { .. }
                | Error::ArchiveUnreachable(_)
                | Error::QueuePersistFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_archive_is_not_retried() {
        let corrupt = Error::ArchiveCorrupt {
            ledger_batch_id: 4,
            reason: "bad base64".to_string(),
        };
        assert!(!corrupt.is_transient());
        assert!(Error::ArchiveUnreachable("timeout".to_string()).is_transient());
    }
}

