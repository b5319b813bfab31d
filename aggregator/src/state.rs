//! Shared application state

use std::sync::Arc;

use openvote_core::Batch;
use tokio::sync::mpsc;

use crate::accumulator::BatchAccumulator;
use crate::archive::SqliteArchive;
use crate::config::AggregatorConfig;
use crate::database::operations::BatchStore;
use crate::ledger::{InMemoryLedger, Ledger};
use crate::metrics::Metrics;
use crate::reconcile::ReconciliationReport;

/// Everything the HTTP handlers need. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AggregatorConfig>,
    pub accumulator: BatchAccumulator,
    pub store: BatchStore,
    pub archive: SqliteArchive,
    pub ledger: Arc<dyn Ledger>,
    pub report: ReconciliationReport,
    pub metrics: Arc<Metrics>,
    /// Set when running against the in-memory ledger, which is then also
    /// served under `/dev-ledger`.
    pub dev_ledger: Option<Arc<InMemoryLedger>>,
}

impl AppState {
    /// Channel into the commit pipeline, for operator retries.
    pub fn handoff(&self) -> mpsc::UnboundedSender<Batch> {
        self.accumulator.handoff()
    }
}
