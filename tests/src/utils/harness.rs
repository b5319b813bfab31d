use std::sync::Arc;
use std::time::Duration;

use aggregator::{
    accumulator::{Accepted, AccumulatorConfig, BatchAccumulator},
    archive::SqliteArchive,
    database::{operations::BatchStore, Database},
    ledger::InMemoryLedger,
    metrics::Metrics,
    pipeline::{CommitPipeline, PipelineConfig},
    queue::IntakeQueue,
    reconcile::{ReconciliationReport, Reconciler, ReconcilerConfig},
    retry::RetryConfig,
};
use openvote_core::{Batch, BatchState, Error, HashVersion, Record};
use tokio::{sync::watch, task::JoinHandle};

/// One aggregator wired in process: SQLite queue and archive, in-memory
/// ledger, accumulator and commit pipeline running. Reconciliation is
/// driven by the test.
pub struct TestContext {
    pub db: Database,
    pub ledger: Arc<InMemoryLedger>,
    pub archive: Arc<SqliteArchive>,
    pub store: BatchStore,
    pub accumulator: BatchAccumulator,
    pub reconciler: Reconciler,
    pub report: ReconciliationReport,
    shutdown: watch::Sender<bool>,
    pipeline_task: JoinHandle<()>,
}

impl TestContext {
    pub async fn start(max_batch_size: usize, max_batch_interval: Duration) -> Self {
        let db = Database::in_memory().await.unwrap();
        Self::start_on(db, max_batch_size, max_batch_interval).await
    }

    pub async fn start_on(db: Database, max_batch_size: usize, max_batch_interval: Duration) -> Self {
        let metrics = Arc::new(Metrics::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let archive = Arc::new(SqliteArchive::new(db.pool().clone()));
        let store = BatchStore::new(db.pool().clone());

        let queue = IntakeQueue::new(db.pool().clone(), Duration::from_secs(5));
        let (accumulator, sealed_rx) = BatchAccumulator::start(
            AccumulatorConfig {
                max_batch_size,
                max_batch_interval,
                hash_version: HashVersion::V1,
                force_empty: false,
            },
            queue,
            metrics.clone(),
        )
        .await
        .unwrap();

        let pipeline = CommitPipeline::new(
            store.clone(),
            ledger.clone(),
            archive.clone(),
            metrics.clone(),
            PipelineConfig {
                commit_retry: RetryConfig::fast(3),
                commit_timeout: Duration::from_secs(2),
                archive_retry: RetryConfig::fast(2),
                repair_interval: Duration::from_millis(100),
            },
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        let pipeline_task = tokio::spawn(pipeline.run(sealed_rx, shutdown_rx));

        let report = ReconciliationReport::new();
        let reconciler = Reconciler::new(
            ledger.clone(),
            archive.clone(),
            report.clone(),
            metrics,
            ReconcilerConfig {
                interval: Duration::from_secs(60),
                max_backoff: Duration::from_secs(60),
                fetch_retry: RetryConfig::fast(2),
            },
        );

        Self {
            db,
            ledger,
            archive,
            store,
            accumulator,
            reconciler,
            report,
            shutdown,
            pipeline_task,
        }
    }

    pub async fn submit(&self, voter: &str) -> Result<Accepted, Error> {
        self.accumulator.submit(record(voter)).await
    }

    /// Poll the batch store until `local_id` reaches `state`.
    pub async fn wait_for_state(&self, local_id: u64, state: BatchState) -> Batch {
        for _ in 0..250 {
            if let Some(batch) = self.store.get(local_id).await.unwrap() {
                if batch.state == state {
                    return batch;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let current = self.store.get(local_id).await.unwrap().map(|b| b.state);
        panic!("batch {} never reached {} (now {:?})", local_id, state, current);
    }

    /// Stop the pipeline and hand back the database.
    pub async fn stop(self) -> Database {
        let _ = self.shutdown.send(true);
        let _ = self.pipeline_task.await;
        self.db
    }
}

pub fn record(voter: &str) -> Record {
    Record::new(
        format!("signed-ballot:{}:candidate-3", voter).into_bytes(),
        voter,
        "station-9",
        1_700_000_000_000,
    )
}

pub fn temp_db_path(tag: &str) -> String {
    std::env::temp_dir()
        .join(format!("ov_flow_{}_{}.db", tag, rand::random::<u32>()))
        .to_string_lossy()
        .to_string()
}
