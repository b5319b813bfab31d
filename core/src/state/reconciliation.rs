use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::Error;
use crate::state::ArchivedBatch;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationStatus {
    Match,
    Mismatch,
    DataUnavailable,
}

impl ReconciliationStatus {
    /// MATCH and MISMATCH are final; DATA_UNAVAILABLE is re-checked later.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReconciliationStatus::DataUnavailable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationStatus::Match => "MATCH",
            ReconciliationStatus::Mismatch => "MISMATCH",
            ReconciliationStatus::DataUnavailable => "DATA_UNAVAILABLE",
        }
    }
}

impl fmt::Display for ReconciliationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub ledger_batch_id: u64,
    pub expected_root: Digest,
    pub recomputed_root: Option<Digest>,
    pub status: ReconciliationStatus,
    pub checked_at: DateTime<Utc>,
}

impl ReconciliationResult {
    /// Compare the ledger's root for `ledger_batch_id` with a root recomputed
    /// from the archived records. `None` means the archive had nothing.
    pub fn evaluate(
        ledger_batch_id: u64,
        expected_root: Digest,
        archived: Option<&ArchivedBatch>,
    ) -> Self {
        let recomputed_root = archived.map(|a| a.recompute_root());
        let status = match recomputed_root {
            None => ReconciliationStatus::DataUnavailable,
            Some(root) if root == expected_root => ReconciliationStatus::Match,
            Some(_) => ReconciliationStatus::Mismatch,
        };
        Self {
            ledger_batch_id,
            expected_root,
            recomputed_root,
            status,
            checked_at: Utc::now(),
        }
    }

    /// An archive entry exists for the id but cannot be read back. Nothing
    /// can be recomputed from it, so it cannot stand for the committed root.
    pub fn unreadable(ledger_batch_id: u64, expected_root: Digest) -> Self {
        Self {
            ledger_batch_id,
            expected_root,
            recomputed_root: None,
            status: ReconciliationStatus::Mismatch,
            checked_at: Utc::now(),
        }
    }

    /// The finding as an error, for callers that propagate it.
    pub fn as_error(&self) -> Option<Error> {
        match self.status {
            ReconciliationStatus::Match => None,
            ReconciliationStatus::DataUnavailable => {
                Some(Error::DataUnavailable(self.ledger_batch_id))
            }
            ReconciliationStatus::Mismatch => Some(Error::Mismatch {
                ledger_batch_id: self.ledger_batch_id,
                expected: self.expected_root.to_hex(),
                recomputed: self
                    .recomputed_root
                    .map(|r| r.to_hex())
                    .unwrap_or_else(|| "unreadable archive".to_string()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaf::HashVersion;
    use crate::state::{Batch, Record, SealTrigger};

    fn archived() -> ArchivedBatch {
        let records = ["A", "B", "C"]
            .iter()
            .map(|s| Record::new(s.as_bytes().to_vec(), format!("voter-{}", s), "s", 1))
            .collect();
        let batch = Batch::seal(1, HashVersion::V1, records, SealTrigger::Size).unwrap();
        ArchivedBatch::from_batch(&batch, 9)
    }

    #[test]
    fn match_when_roots_agree() {
        let a = archived();
        let result = ReconciliationResult::evaluate(9, a.root, Some(&a));
        assert_eq!(result.status, ReconciliationStatus::Match);
        assert!(result.as_error().is_none());
    }

    #[test]
    fn flipped_byte_is_mismatch() {
        let mut a = archived();
        let expected = a.root;
        a.records[1].payload[0] ^= 0x01;
        let result = ReconciliationResult::evaluate(9, expected, Some(&a));
        assert_eq!(result.status, ReconciliationStatus::Mismatch);
        assert!(matches!(result.as_error(), Some(Error::Mismatch { .. })));
    }

    #[test]
    fn archive_claimed_root_is_ignored() {
        // A tampered archive that also rewrites its own root is still caught.
        let mut a = archived();
        let expected = a.root;
        a.records.pop();
        a.root = a.recompute_root();
        let result = ReconciliationResult::evaluate(9, expected, Some(&a));
        assert_eq!(result.status, ReconciliationStatus::Mismatch);
    }

    #[test]
    fn unreadable_archive_is_final_mismatch() {
        let a = archived();
        let result = ReconciliationResult::unreadable(9, a.root);
        assert_eq!(result.status, ReconciliationStatus::Mismatch);
        assert!(result.status.is_terminal());
        assert_eq!(result.recomputed_root, None);
        match result.as_error() {
            Some(Error::Mismatch { recomputed, .. }) => assert_eq!(recomputed, "unreadable archive"),
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn missing_data_is_unavailable_not_mismatch() {
        let a = archived();
        let result = ReconciliationResult::evaluate(9, a.root, None);
        assert_eq!(result.status, ReconciliationStatus::DataUnavailable);
        assert!(!result.status.is_terminal());
        assert_eq!(result.as_error(), Some(Error::DataUnavailable(9)));
    }
}
