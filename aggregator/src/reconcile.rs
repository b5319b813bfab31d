//! Reconciliation loop.
//!
//! For every ledger batch: read the committed root from the ledger, fetch the
//! archived records, recompute the root and compare. The ledger is the only
//! source of the expected root. MATCH and MISMATCH are final; DATA_UNAVAILABLE
//! is re-checked on later passes. A MISMATCH is never retried into a MATCH.
//!
//! Passes run on a fixed interval (backing off while the ledger is down) and
//! are nudged early by hints carrying freshly archived ledger batch ids.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use openvote_core::{Error, ReconciliationResult, ReconciliationStatus};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::archive::ArchiveReader;
use crate::ledger::Ledger;
use crate::metrics::Metrics;
use crate::retry::{retry_if, RetryConfig};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// Ceiling for the pass interval while passes keep failing.
    pub max_backoff: Duration,
    pub fetch_retry: RetryConfig,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_backoff: Duration::from_secs(600),
            fetch_retry: RetryConfig::query(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationCounts {
    pub matched: u64,
    pub mismatched: u64,
    pub unavailable: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub counts: ReconciliationCounts,
    pub last_pass_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub mismatches: Vec<ReconciliationResult>,
}

#[derive(Default)]
struct ReportState {
    results: BTreeMap<u64, ReconciliationResult>,
    last_pass_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Latest result per ledger batch, shared with the HTTP layer.
#[derive(Clone, Default)]
pub struct ReconciliationReport {
    state: Arc<RwLock<ReportState>>,
}

impl ReconciliationReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `result` unless a final result already exists for its id.
    /// Returns whether it was stored.
    pub fn record(&self, result: ReconciliationResult) -> bool {
        let mut state = self.state.write().expect("report lock poisoned");
        if let Some(existing) = state.results.get(&result.ledger_batch_id) {
            if existing.status.is_terminal() {
                return false;
            }
        }
        state.results.insert(result.ledger_batch_id, result);
        true
    }

    pub fn get(&self, ledger_batch_id: u64) -> Option<ReconciliationResult> {
        let state = self.state.read().expect("report lock poisoned");
        state.results.get(&ledger_batch_id).cloned()
    }

    /// True once the id has a final result.
    pub fn is_settled(&self, ledger_batch_id: u64) -> bool {
        self.get(ledger_batch_id)
            .map(|r| r.status.is_terminal())
            .unwrap_or(false)
    }

    pub fn results(&self) -> Vec<ReconciliationResult> {
        let state = self.state.read().expect("report lock poisoned");
        state.results.values().cloned().collect()
    }

    pub fn counts(&self) -> ReconciliationCounts {
        let state = self.state.read().expect("report lock poisoned");
        let mut counts = ReconciliationCounts::default();
        for result in state.results.values() {
            match result.status {
                ReconciliationStatus::Match => counts.matched += 1,
                ReconciliationStatus::Mismatch => counts.mismatched += 1,
                ReconciliationStatus::DataUnavailable => counts.unavailable += 1,
            }
        }
        counts
    }

    pub fn summary(&self) -> ReportSummary {
        let counts = self.counts();
        let state = self.state.read().expect("report lock poisoned");
        ReportSummary {
            counts,
            last_pass_at: state.last_pass_at,
            last_error: state.last_error.clone(),
            mismatches: state
                .results
                .values()
                .filter(|r| r.status == ReconciliationStatus::Mismatch)
                .cloned()
                .collect(),
        }
    }

    fn mark_pass(&self, error: Option<String>) {
        let mut state = self.state.write().expect("report lock poisoned");
        state.last_pass_at = Some(Utc::now());
        state.last_error = error;
    }
}

pub struct Reconciler {
    ledger: Arc<dyn Ledger>,
    archive: Arc<dyn ArchiveReader>,
    report: ReconciliationReport,
    metrics: Arc<Metrics>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        archive: Arc<dyn ArchiveReader>,
        report: ReconciliationReport,
        metrics: Arc<Metrics>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            ledger,
            archive,
            report,
            metrics,
            config,
        }
    }

    pub fn report(&self) -> &ReconciliationReport {
        &self.report
    }

    /// Check one ledger batch and record the result.
    ///
    /// `NotFound` if the ledger has no root under the id. An archive that
    /// cannot be reached counts as DATA_UNAVAILABLE; one that answers with
    /// an unreadable entry is a MISMATCH.
    pub async fn reconcile(&self, ledger_batch_id: u64) -> Result<ReconciliationResult, Error> {
        let ledger = &self.ledger;
        let expected = retry_if(
            &format!("ledger root {}", ledger_batch_id),
            &self.config.fetch_retry,
            move || ledger.committed_root(ledger_batch_id),
            Error::is_transient,
        )
        .await?
        .ok_or(Error::NotFound)?;

        let archive = &self.archive;
        let fetched = retry_if(
            &format!("archive fetch {}", ledger_batch_id),
            &self.config.fetch_retry,
            move || archive.fetch(ledger_batch_id),
            Error::is_transient,
        )
        .await;

        let result = match fetched {
            Ok(archived) => {
                ReconciliationResult::evaluate(ledger_batch_id, expected, archived.as_ref())
            }
            Err(e @ Error::ArchiveCorrupt { .. }) => {
                error!("{}", e);
                ReconciliationResult::unreadable(ledger_batch_id, expected)
            }
            Err(e) => {
                warn!("Archive fetch for ledger batch {} failed: {}", ledger_batch_id, e);
                ReconciliationResult::evaluate(ledger_batch_id, expected, None)
            }
        };

        match result.status {
            ReconciliationStatus::Match => {
                info!("Ledger batch {} MATCH (root {})", ledger_batch_id, expected)
            }
            ReconciliationStatus::Mismatch => error!(
                "Ledger batch {} MISMATCH: committed {}, archive recomputes to {}",
                ledger_batch_id,
                expected,
                result
                    .recomputed_root
                    .map(|r| r.to_hex())
                    .unwrap_or_else(|| "nothing (unreadable)".to_string())
            ),
            ReconciliationStatus::DataUnavailable => {
                warn!("Ledger batch {} DATA_UNAVAILABLE", ledger_batch_id)
            }
        }

        self.metrics.record_reconciliation_attempt(result.status);
        if !self.report.record(result.clone()) {
            debug!("Ledger batch {} already has a final result", ledger_batch_id);
        }
        Ok(result)
    }

    /// Check every ledger batch without a final result. Returns how many
    /// were checked; fails if the ledger cannot be read.
    pub async fn pass(&self) -> Result<usize, Error> {
        let ledger = &self.ledger;
        let latest = retry_if(
            "ledger latest batch",
            &self.config.fetch_retry,
            move || ledger.latest_batch_id(),
            Error::is_transient,
        )
        .await?;

        let mut checked = 0;
        for ledger_batch_id in 1..=latest.unwrap_or(0) {
            if self.report.is_settled(ledger_batch_id) {
                continue;
            }
            match self.reconcile(ledger_batch_id).await {
                Ok(_) => checked += 1,
                Err(Error::NotFound) => {
                    debug!("Ledger has no root for batch {} yet", ledger_batch_id)
                }
                Err(e) => return Err(e),
            }
        }

        self.report.mark_pass(None);
        Ok(checked)
    }

    /// Run passes until `shutdown` flips. Ids arriving on `hints` are
    /// checked right away without waiting for the next pass.
    pub async fn run(
        self,
        mut hints: Option<broadcast::Receiver<u64>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            "Reconciliation loop started (interval {:?}, hints {})",
            self.config.interval,
            if hints.is_some() { "on" } else { "off" }
        );
        let mut delay = self.config.interval;

        loop {
            match self.pass().await {
                Ok(checked) => {
                    delay = self.config.interval;
                    debug!("Reconciliation pass checked {} batches", checked);
                }
                Err(e) => {
                    self.report.mark_pass(Some(e.to_string()));
                    delay = (delay * 2).min(self.config.max_backoff);
                    warn!("Reconciliation pass failed: {}. Next pass in {:?}", e, delay);
                }
            }

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    hint = next_hint(&mut hints) => {
                        if let Some(id) = hint {
                            if !self.report.is_settled(id) {
                                if let Err(e) = self.reconcile(id).await {
                                    warn!("Reconciling hinted ledger batch {} failed: {}", id, e);
                                }
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Reconciliation loop shutting down");
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Next hinted id. A closed channel disables hints; a lagging receiver just
/// skips ahead since the periodic pass covers what was missed.
async fn next_hint(hints: &mut Option<broadcast::Receiver<u64>>) -> Option<u64> {
    let Some(rx) = hints.as_mut() else {
        return std::future::pending().await;
    };
    match rx.recv().await {
        Ok(id) => Some(id),
        Err(RecvError::Lagged(missed)) => {
            debug!("Missed {} reconciliation hints", missed);
            None
        }
        Err(RecvError::Closed) => {
            *hints = None;
            None
        }
    }
}
