//! Commit pipeline: the single consumer of sealed batches.
//!
//! For each batch, in seal order: submit the root and dedup keys to the
//! ledger (bounded retries with a per-attempt timeout), persist the ledger
//! batch id, then write the record list to the archive. The archive write
//! only ever happens after the ledger acknowledged the commit.
//!
//! Outcomes:
//! - ledger rejection: FAILED, never retried with the same payload;
//! - ledger unreachable after all attempts: FAILED, operator may retry;
//! - archive write keeps failing: stays COMMITTED and the repair sweep
//!   retries it until durable;
//! - archive holds different records for the id: FAILED.

use std::sync::Arc;
use std::time::Duration;

use openvote_core::{ArchivedBatch, Batch, BatchState, CommitRequest, Error, FailureKind};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::archive::ArchiveStore;
use crate::database::operations::BatchStore;
use crate::ledger::Ledger;
use crate::metrics::Metrics;
use crate::retry::{retry_if, RetryConfig};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub commit_retry: RetryConfig,
    /// Upper bound on a single ledger call.
    pub commit_timeout: Duration,
    pub archive_retry: RetryConfig,
    /// How often COMMITTED-but-not-archived batches are retried.
    pub repair_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            commit_retry: RetryConfig::commit(5),
            commit_timeout: Duration::from_secs(30),
            archive_retry: RetryConfig::archive(),
            repair_interval: Duration::from_secs(30),
        }
    }
}

pub struct CommitPipeline {
    store: BatchStore,
    ledger: Arc<dyn Ledger>,
    archive: Arc<dyn ArchiveStore>,
    metrics: Arc<Metrics>,
    config: PipelineConfig,
    archived: broadcast::Sender<u64>,
}

impl CommitPipeline {
    pub fn new(
        store: BatchStore,
        ledger: Arc<dyn Ledger>,
        archive: Arc<dyn ArchiveStore>,
        metrics: Arc<Metrics>,
        config: PipelineConfig,
    ) -> Self {
        let (archived, _) = broadcast::channel(1024);
        Self {
            store,
            ledger,
            archive,
            metrics,
            config,
            archived,
        }
    }

    /// Ledger batch ids as their records become available in the archive.
    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.archived.subscribe()
    }

    /// Recover leftovers from a previous run, then consume `sealed` until it
    /// closes or `shutdown` flips.
    pub async fn run(
        self,
        mut sealed: mpsc::UnboundedReceiver<Batch>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.recover().await;

        let mut repair = tokio::time::interval(self.config.repair_interval);
        repair.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; recover() just did that work
        repair.tick().await;

        loop {
            tokio::select! {
                next = sealed.recv() => match next {
                    Some(batch) => {
                        self.process(batch).await;
                    }
                    None => {
                        info!("Sealed batch channel closed, commit pipeline stopping");
                        break;
                    }
                },
                _ = repair.tick() => {
                    self.repair_unarchived().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Commit pipeline shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Resubmit SEALED batches left by a crash (with their original
    /// submission id, so a commit that did land is not duplicated) and
    /// archive COMMITTED ones. Returns the number of SEALED batches found.
    pub async fn recover(&self) -> usize {
        let sealed = match self.store.in_state(BatchState::Sealed).await {
            Ok(batches) => batches,
            Err(e) => {
                error!("Failed to load SEALED batches: {}", e);
                return 0;
            }
        };
        let count = sealed.len();
        if count > 0 {
            info!("Resubmitting {} SEALED batches from a previous run", count);
        }
        for batch in sealed {
            self.process(batch).await;
        }
        self.repair_unarchived().await;
        count
    }

    /// Drive one batch as far as it will go and return its final state.
    pub async fn process(&self, batch: Batch) -> Batch {
        // The stored copy is authoritative; a batch can reach the channel
        // more than once (recovery plus handoff)
        let mut batch = match self.store.get(batch.local_id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                error!("Batch {} was handed over but never persisted", batch.local_id);
                return batch;
            }
            Err(e) => {
                error!("Failed to load batch {}: {}", batch.local_id, e);
                return batch;
            }
        };

        if batch.state == BatchState::Sealed {
            self.commit(&mut batch).await;
        }
        if batch.state == BatchState::Committed {
            self.archive(&mut batch).await;
        }
        batch
    }

    /// Retry the archive write for every COMMITTED batch. Returns how many
    /// reached ARCHIVED.
    pub async fn repair_unarchived(&self) -> usize {
        let committed = match self.store.in_state(BatchState::Committed).await {
            Ok(batches) => batches,
            Err(e) => {
                error!("Failed to load COMMITTED batches: {}", e);
                return 0;
            }
        };

        let mut repaired = 0;
        for mut batch in committed {
            if self.archive(&mut batch).await {
                repaired += 1;
            }
        }
        if repaired > 0 {
            info!("Archive repair sweep stored {} batches", repaired);
        }
        repaired
    }

    async fn commit(&self, batch: &mut Batch) {
        let request = CommitRequest {
            root: batch.root,
            dedup_keys: batch.dedup_digests(),
            submission_id: batch.submission_id(),
            hash_version: batch.hash_version,
        };
        let request = &request;
        let ledger = &self.ledger;
        let timeout = self.config.commit_timeout;

        let result = retry_if(
            &format!("commit batch {}", batch.local_id),
            &self.config.commit_retry,
            move || async move {
                match tokio::time::timeout(timeout, ledger.commit(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::LedgerUnreachable(format!(
                        "no answer within {}ms",
                        timeout.as_millis()
                    ))),
                }
            },
            Error::is_transient,
        )
        .await;

        match result {
            Ok(record) if record.root != batch.root => {
                let reason = format!(
                    "ledger recorded root {} for submission {}",
                    record.root, request.submission_id
                );
                self.fail(batch, FailureKind::LedgerRejected, reason).await;
            }
            Ok(record) => {
                let ledger_batch_id = record.ledger_batch_id;
                if let Err(e) = batch.mark_committed(record) {
                    error!("Batch {}: {}", batch.local_id, e);
                    return;
                }
                if let Err(e) = self.store.save_lifecycle(batch).await {
                    // Stays SEALED on disk; recovery resubmits with the same
                    // submission id and gets this commit back
                    error!(
                        "Batch {} committed as ledger batch {} but could not be saved: {}",
                        batch.local_id, ledger_batch_id, e
                    );
                    return;
                }
                self.metrics.record_commit();
                info!(
                    "Batch {} committed as ledger batch {} (root {})",
                    batch.local_id, ledger_batch_id, batch.root
                );
            }
            Err(Error::LedgerRejected(reason)) => {
                self.fail(batch, FailureKind::LedgerRejected, reason).await;
            }
            Err(e) => {
                self.fail(batch, FailureKind::LedgerUnreachable, e.to_string())
                    .await;
            }
        }
    }

    /// Returns true once the batch is ARCHIVED.
    async fn archive(&self, batch: &mut Batch) -> bool {
        let Some(ledger_batch_id) = batch.ledger_batch_id() else {
            error!("Batch {} is COMMITTED without a ledger batch id", batch.local_id);
            return false;
        };
        let entry = ArchivedBatch::from_batch(batch, ledger_batch_id);
        let entry = &entry;
        let archive = &self.archive;

        let result = retry_if(
            &format!("archive ledger batch {}", ledger_batch_id),
            &self.config.archive_retry,
            move || archive.store(entry),
            Error::is_transient,
        )
        .await;

        match result {
            Ok(()) => {
                if let Err(e) = batch.mark_archived() {
                    error!("Batch {}: {}", batch.local_id, e);
                    return false;
                }
                if let Err(e) = self.store.save_lifecycle(batch).await {
                    error!("Batch {} archived but could not be saved: {}", batch.local_id, e);
                    return false;
                }
                info!(
                    "Batch {} archived as ledger batch {} ({} records)",
                    batch.local_id,
                    ledger_batch_id,
                    batch.len()
                );
                // No subscribers is fine
                let _ = self.archived.send(ledger_batch_id);
                true
            }
            Err(Error::ArchiveConflict(id)) => {
                let reason = format!("archive holds different records for ledger batch {}", id);
                self.fail(batch, FailureKind::ArchiveConflict, reason).await;
                false
            }
            Err(e) => {
                warn!(
                    "Archive write for ledger batch {} deferred to repair sweep: {}",
                    ledger_batch_id, e
                );
                self.metrics.record_archive_deferred();
                false
            }
        }
    }

    async fn fail(&self, batch: &mut Batch, kind: FailureKind, reason: String) {
        error!(
            "Batch {} FAILED ({}): {}",
            batch.local_id,
            kind.as_str(),
            reason
        );
        if let Err(e) = batch.mark_failed(kind, reason) {
            error!("Batch {}: {}", batch.local_id, e);
            return;
        }
        self.metrics.record_failure(kind);
        if let Err(e) = self.store.save_lifecycle(batch).await {
            error!("Failed to save FAILED state of batch {}: {}", batch.local_id, e);
        }
    }
}

/// Operator retry: move a FAILED batch whose ledger call never landed back
/// to SEALED so it can be handed to the pipeline again with unchanged
/// content.
pub async fn reopen_failed(store: &BatchStore, local_id: u64) -> Result<Batch, Error> {
    let mut batch = store
        .get(local_id)
        .await
        .map_err(|e| Error::QueuePersistFailed(e.to_string()))?
        .ok_or(Error::NotFound)?;
    batch.reopen_for_retry()?;
    store
        .save_lifecycle(&batch)
        .await
        .map_err(|e| Error::QueuePersistFailed(e.to_string()))?;
    info!("Batch {} reopened for retry", local_id);
    Ok(batch)
}
