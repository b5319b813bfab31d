use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use openvote_core::{CommitRecord, CommitRequest, Digest, Error};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::Ledger;

#[derive(Default)]
struct LedgerState {
    /// Index `i` holds ledger batch id `i + 1`.
    commits: Vec<CommitRecord>,
    dedup_keys: HashSet<Digest>,
    submissions: HashMap<String, u64>,
}

/// Process-local ledger with the same guarantees as the real one: ids are
/// sequential from 1, dedup keys are unique across all commits and checked
/// atomically with the append, submissions are idempotent.
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    offline: AtomicBool,
    drop_next_ack: AtomicBool,
    events: broadcast::Sender<u64>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(LedgerState::default()),
            offline: AtomicBool::new(false),
            drop_next_ack: AtomicBool::new(false),
            events,
        }
    }

    /// While offline every call fails with `LedgerUnreachable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Apply the next commit but report it as unreachable, as if the
    /// acknowledgement were lost in transit.
    pub fn drop_next_ack(&self) {
        self.drop_next_ack.store(true, Ordering::SeqCst);
    }

    pub fn commit_count(&self) -> usize {
        self.state
            .lock()
            .expect("ledger mutex poisoned")
            .commits
            .len()
    }

    fn check_online(&self) -> Result<(), Error> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::LedgerUnreachable("ledger offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn commit(&self, request: &CommitRequest) -> Result<CommitRecord, Error> {
        self.check_online()?;

        let record = {
            let mut state = self.state.lock().expect("ledger mutex poisoned");

            if let Some(id) = state.submissions.get(&request.submission_id) {
                info!(
                    "Submission {} already recorded as ledger batch {}",
                    request.submission_id, id
                );
                return Ok(state.commits[(*id - 1) as usize].clone());
            }

            let mut batch_keys = HashSet::with_capacity(request.dedup_keys.len());
            for key in &request.dedup_keys {
                if state.dedup_keys.contains(key) || !batch_keys.insert(*key) {
                    warn!("Rejecting submission {}: dedup key {} reused", request.submission_id, key);
                    return Err(Error::LedgerRejected(format!(
                        "dedup key {} already recorded",
                        key
                    )));
                }
            }

            let record = CommitRecord {
                ledger_batch_id: state.commits.len() as u64 + 1,
                root: request.root,
                committed_at: Utc::now(),
            };
            state.dedup_keys.extend(batch_keys);
            state.commits.push(record.clone());
            state
                .submissions
                .insert(request.submission_id.clone(), record.ledger_batch_id);
            record
        };

        // No subscribers is fine
        let _ = self.events.send(record.ledger_batch_id);

        if self.drop_next_ack.swap(false, Ordering::SeqCst) {
            return Err(Error::LedgerUnreachable(
                "connection reset before acknowledgement".to_string(),
            ));
        }
        Ok(record)
    }

    async fn committed_root(&self, ledger_batch_id: u64) -> Result<Option<Digest>, Error> {
        self.check_online()?;
        let state = self.state.lock().expect("ledger mutex poisoned");
        Ok(ledger_batch_id
            .checked_sub(1)
            .and_then(|i| state.commits.get(i as usize))
            .map(|c| c.root))
    }

    async fn latest_batch_id(&self) -> Result<Option<u64>, Error> {
        self.check_online()?;
        let state = self.state.lock().expect("ledger mutex poisoned");
        Ok(state.commits.last().map(|c| c.ledger_batch_id))
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<u64>> {
        Some(self.events.subscribe())
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openvote_core::{HashVersion, Record};

    fn request(keys: &[&str], submission_id: &str) -> CommitRequest {
        CommitRequest {
            root: HashVersion::V1.hash_leaf(submission_id.as_bytes()),
            dedup_keys: keys
                .iter()
                .map(|k| HashVersion::V1.hash_dedup_key(k))
                .collect(),
            submission_id: submission_id.to_string(),
            hash_version: HashVersion::V1,
        }
    }

    #[tokio::test]
    async fn ids_are_sequential_and_readable() {
        let ledger = InMemoryLedger::new();
        assert_eq!(ledger.latest_batch_id().await.unwrap(), None);

        let a = ledger.commit(&request(&["v1"], "1:a")).await.unwrap();
        let b = ledger.commit(&request(&["v2"], "2:b")).await.unwrap();
        assert_eq!((a.ledger_batch_id, b.ledger_batch_id), (1, 2));
        assert_eq!(ledger.committed_root(2).await.unwrap(), Some(b.root));
        assert_eq!(ledger.committed_root(0).await.unwrap(), None);
        assert_eq!(ledger.committed_root(3).await.unwrap(), None);
        assert_eq!(ledger.latest_batch_id().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn reused_dedup_key_is_rejected_atomically() {
        let ledger = InMemoryLedger::new();
        ledger.commit(&request(&["v1", "v2"], "1:a")).await.unwrap();

        let err = ledger
            .commit(&request(&["v3", "v2"], "2:b"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LedgerRejected(_)));

        // v3 was not recorded by the rejected call
        ledger.commit(&request(&["v3"], "3:c")).await.unwrap();
        assert_eq!(ledger.commit_count(), 2);

        let dup_within = ledger.commit(&request(&["v4", "v4"], "4:d")).await;
        assert!(matches!(dup_within, Err(Error::LedgerRejected(_))));
    }

    #[tokio::test]
    async fn resubmission_is_idempotent_even_after_lost_ack() {
        let ledger = InMemoryLedger::new();
        ledger.drop_next_ack();
        let first = ledger.commit(&request(&["v1"], "1:a")).await;
        assert!(matches!(first, Err(Error::LedgerUnreachable(_))));

        let again = ledger.commit(&request(&["v1"], "1:a")).await.unwrap();
        assert_eq!(again.ledger_batch_id, 1);
        assert_eq!(ledger.commit_count(), 1);
    }

    #[tokio::test]
    async fn offline_is_unreachable_and_events_are_published() {
        let ledger = InMemoryLedger::new();
        let mut events = ledger.subscribe().unwrap();

        ledger.set_offline(true);
        assert!(matches!(
            ledger.commit(&request(&["v1"], "1:a")).await,
            Err(Error::LedgerUnreachable(_))
        ));
        ledger.set_offline(false);

        let record = Record::new(b"x".to_vec(), "v1", "s", 1);
        let mut req = request(&[], "1:a");
        req.dedup_keys = vec![record.dedup_digest(HashVersion::V1)];
        ledger.commit(&req).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), 1);
    }
}
