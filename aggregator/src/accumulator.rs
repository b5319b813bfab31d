//! Batch accumulator.
//!
//! Exactly one batch is OPEN at a time: the pending rows of the intake queue.
//! It is sealed when `max_batch_size` records are pending or when
//! `max_batch_interval` has passed since its first record arrived, whichever
//! comes first. All sealing happens under one async mutex, and the claim of
//! queue rows plus the insert of the SEALED batch share one SQLite
//! transaction, so a record is either in exactly one sealed batch or still
//! pending.
//!
//! The interval timer is a single background task watching the current
//! deadline. Sealing disarms it; the next record to arrive re-arms it for
//! the new OPEN batch. A deadline that fires after its batch was already
//! sealed by size finds a different OPEN batch id and does nothing.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use openvote_core::{partition_duplicates, Batch, Error, HashVersion, Record, SealTrigger};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::database::models::QueuedRecord;
use crate::database::operations::BatchStore;
use crate::metrics::{IntakeOutcome, Metrics};
use crate::queue::IntakeQueue;

#[derive(Debug, Clone)]
pub struct AccumulatorConfig {
    pub max_batch_size: usize,
    pub max_batch_interval: Duration,
    pub hash_version: HashVersion,
    /// Seal empty batches instead of reporting `SealNoOp`. Tests only.
    pub force_empty: bool,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            max_batch_interval: Duration::from_secs(300),
            hash_version: HashVersion::CURRENT,
            force_empty: false,
        }
    }
}

/// Intake acknowledgement.
#[derive(Debug, Clone, Serialize)]
pub struct Accepted {
    /// Position in the intake queue.
    pub position: u64,
    /// OPEN batch at the time of acceptance.
    pub open_batch: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenBatchStatus {
    pub local_id: u64,
    pub pending: u64,
    pub max_batch_size: usize,
    pub opened_at: Option<DateTime<Utc>>,
    /// Time left before the interval trigger fires, if armed.
    pub seals_in_ms: Option<u64>,
}

struct OpenBatch {
    local_id: u64,
    deadline: Option<Instant>,
    opened_at: Option<DateTime<Utc>>,
}

type Deadline = Option<(u64, Instant)>;

struct Inner {
    config: AccumulatorConfig,
    queue: IntakeQueue,
    metrics: Arc<Metrics>,
    open: Mutex<OpenBatch>,
    timer: watch::Sender<Deadline>,
    sealed_tx: mpsc::UnboundedSender<Batch>,
}

#[derive(Clone)]
pub struct BatchAccumulator {
    inner: Arc<Inner>,
}

impl BatchAccumulator {
    /// Start the accumulator over `queue`. Sealed batches are delivered on the
    /// returned channel, after they are persisted.
    ///
    /// Pending rows left by a previous run are picked up: full batches are
    /// sealed immediately and the timer is armed for the rest.
    pub async fn start(
        config: AccumulatorConfig,
        queue: IntakeQueue,
        metrics: Arc<Metrics>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Batch>), Error> {
        let last_id = QueuedRecord::max_claimed_local_id(queue.pool())
            .await
            .map_err(|e| Error::QueuePersistFailed(e.to_string()))?;

        let (sealed_tx, sealed_rx) = mpsc::unbounded_channel();
        let (timer, timer_rx) = watch::channel(None);
        let inner = Arc::new(Inner {
            config: AccumulatorConfig {
                max_batch_size: config.max_batch_size.max(1),
                ..config
            },
            queue,
            metrics,
            open: Mutex::new(OpenBatch {
                local_id: last_id + 1,
                deadline: None,
                opened_at: None,
            }),
            timer,
            sealed_tx,
        });
        tokio::spawn(run_timer(Arc::downgrade(&inner), timer_rx));

        let accumulator = Self { inner };
        {
            let mut open = accumulator.inner.open.lock().await;
            info!(
                "Accumulator started at batch {} (max {} records / {:?})",
                open.local_id,
                accumulator.inner.config.max_batch_size,
                accumulator.inner.config.max_batch_interval
            );
            accumulator.settle_logged(&mut open).await;
        }
        Ok((accumulator, sealed_rx))
    }

    pub fn config(&self) -> &AccumulatorConfig {
        &self.inner.config
    }

    /// Sender for re-queueing a batch to the commit pipeline (operator retry).
    pub fn handoff(&self) -> mpsc::UnboundedSender<Batch> {
        self.inner.sealed_tx.clone()
    }

    /// Enqueue a record durably, then seal if that filled the OPEN batch.
    pub async fn submit(&self, record: Record) -> Result<Accepted, Error> {
        let position = match self.inner.queue.enqueue(&record).await {
            Ok(position) => {
                self.inner.metrics.record_intake(IntakeOutcome::Accepted);
                position
            }
            Err(e) => {
                let outcome = match e {
                    Error::QueuePersistFailed(_) => IntakeOutcome::PersistFailed,
                    _ => IntakeOutcome::Rejected,
                };
                self.inner.metrics.record_intake(outcome);
                return Err(e);
            }
        };

        let mut open = self.inner.open.lock().await;
        let open_batch = open.local_id;
        self.settle_logged(&mut open).await;
        Ok(Accepted {
            position,
            open_batch,
        })
    }

    /// Seal batch `local_id` now. Sealing a batch that is already sealed is a
    /// no-op returning `Ok(None)`.
    pub async fn seal(&self, local_id: u64, trigger: SealTrigger) -> Result<Option<Batch>, Error> {
        let mut open = self.inner.open.lock().await;
        if local_id < open.local_id {
            debug!("Batch {} is already sealed", local_id);
            return Ok(None);
        }
        if local_id > open.local_id {
            return Err(Error::NotFound);
        }
        let batch = self.seal_locked(&mut open, trigger).await?;
        self.settle_logged(&mut open).await;
        Ok(Some(batch))
    }

    /// Operator force-seal of whatever is pending.
    pub async fn force_seal(&self) -> Result<Batch, Error> {
        let mut open = self.inner.open.lock().await;
        let result = self.seal_locked(&mut open, SealTrigger::Forced).await;
        self.settle_logged(&mut open).await;
        result
    }

    pub async fn status(&self) -> Result<OpenBatchStatus, Error> {
        let open = self.inner.open.lock().await;
        let pending = self.inner.queue.depth().await?;
        Ok(OpenBatchStatus {
            local_id: open.local_id,
            pending,
            max_batch_size: self.inner.config.max_batch_size,
            opened_at: open.opened_at,
            seals_in_ms: open
                .deadline
                .map(|d| d.saturating_duration_since(Instant::now()).as_millis() as u64),
        })
    }

    async fn on_timer(&self, local_id: u64) {
        let mut open = self.inner.open.lock().await;
        if open.local_id != local_id {
            debug!("Timer for batch {} fired after it was sealed", local_id);
            return;
        }

        match self.seal_locked(&mut open, SealTrigger::Timer).await {
            Ok(_) => {}
            Err(Error::SealNoOp) => {
                debug!("Timer fired for empty batch {}", local_id);
                self.disarm(&mut open);
            }
            Err(e) => {
                error!("Timer seal of batch {} failed: {}", local_id, e);
                // Try again after another interval
                self.arm(&mut open);
            }
        }
        self.settle_logged(&mut open).await;
    }

    /// Seal while the queue holds a full batch, then make sure the timer is
    /// armed if anything is left pending.
    async fn settle(&self, open: &mut OpenBatch) -> Result<(), Error> {
        let max = self.inner.config.max_batch_size as u64;
        let mut depth = self.inner.queue.depth().await?;
        while depth >= max {
            self.seal_locked(open, SealTrigger::Size).await?;
            depth = self.inner.queue.depth().await?;
        }
        if depth > 0 && open.deadline.is_none() {
            self.arm(open);
        }
        Ok(())
    }

    async fn settle_logged(&self, open: &mut OpenBatch) {
        if let Err(e) = self.settle(open).await {
            error!("Sealing batch {} failed: {}", open.local_id, e);
            if open.deadline.is_none() {
                self.arm(open);
            }
        }
    }

    fn arm(&self, open: &mut OpenBatch) {
        let deadline = Instant::now() + self.inner.config.max_batch_interval;
        open.deadline = Some(deadline);
        open.opened_at.get_or_insert_with(Utc::now);
        self.inner.timer.send_replace(Some((open.local_id, deadline)));
        debug!("Armed timer for batch {}", open.local_id);
    }

    fn disarm(&self, open: &mut OpenBatch) {
        open.deadline = None;
        open.opened_at = None;
        self.inner.timer.send_replace(None);
    }

    /// Claim up to one batch worth of pending rows, seal and persist them,
    /// then open the next batch. Must be called with the `open` lock held.
    async fn seal_locked(&self, open: &mut OpenBatch, trigger: SealTrigger) -> Result<Batch, Error> {
        let inner = &self.inner;
        let local_id = open.local_id;
        let persist = |e: &dyn std::fmt::Display| Error::QueuePersistFailed(e.to_string());

        let mut tx = inner.queue.pool().begin().await.map_err(|e| persist(&e))?;
        let claimed = IntakeQueue::drain_on(&mut tx, inner.config.max_batch_size, local_id).await?;
        if claimed.is_empty() && !inner.config.force_empty {
            return Err(Error::SealNoOp);
        }

        let (kept, duplicates) = partition_duplicates(claimed, |q| q.record.dedup_key.as_str());
        for dup in &duplicates {
            warn!(
                "Dropping repeated dedup key from batch {} (queue position {})",
                local_id, dup.seq
            );
            QueuedRecord::mark_duplicate(&mut tx, dup.seq)
                .await
                .map_err(|e| persist(&e))?;
        }

        let records = kept.into_iter().map(|q| q.record).collect();
        let batch = Batch::seal_unchecked(local_id, inner.config.hash_version, records, trigger);
        BatchStore::insert(&mut tx, &batch)
            .await
            .map_err(|e| persist(&e))?;
        tx.commit().await.map_err(|e| persist(&e))?;

        open.local_id += 1;
        self.disarm(open);

        inner
            .metrics
            .record_seal(trigger, batch.len(), duplicates.len());
        info!(
            "Sealed batch {} by {}: {} records, root {}",
            batch.local_id,
            trigger.as_str(),
            batch.len(),
            batch.root
        );

        if inner.sealed_tx.send(batch.clone()).is_err() {
            warn!(
                "Commit pipeline is not running; batch {} stays SEALED until restart",
                batch.local_id
            );
        }
        Ok(batch)
    }
}

/// Sleeps until the armed deadline and fires it once. Exits when the
/// accumulator is dropped.
async fn run_timer(inner: Weak<Inner>, mut armed: watch::Receiver<Deadline>) {
    let mut fired: Deadline = None;
    loop {
        let current = *armed.borrow_and_update();
        match current {
            Some((local_id, deadline)) if fired != current => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        fired = current;
                        let Some(inner) = inner.upgrade() else {
                            return;
                        };
                        BatchAccumulator { inner }.on_timer(local_id).await;
                    }
                    changed = armed.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            _ => {
                if armed.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}
