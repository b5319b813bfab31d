use std::net::SocketAddr;
use std::sync::Arc;

use aggregator::{
    accumulator::BatchAccumulator,
    archive::SqliteArchive,
    config::AggregatorConfig,
    database::{operations::BatchStore, Database},
    ledger::{HttpLedger, InMemoryLedger, Ledger},
    metrics::Metrics,
    pipeline::CommitPipeline,
    queue::IntakeQueue,
    reconcile::{ReconciliationReport, Reconciler},
    routes,
    state::AppState,
};
use axum::extract::DefaultBodyLimit;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting OpenVote aggregator");
    let config = Arc::new(AggregatorConfig::from_env());

    // Initialize database (create tables, run migrations)
    let db = Database::connect(&config.db_path).await?;
    let metrics = Arc::new(Metrics::new());
    let queue = IntakeQueue::new(db.pool().clone(), config.queue_write_timeout);
    let store = BatchStore::new(db.pool().clone());
    let archive = SqliteArchive::new(db.pool().clone());

    let (ledger, dev_ledger): (Arc<dyn Ledger>, Option<Arc<InMemoryLedger>>) =
        match &config.ledger_url {
            Some(url) => {
                info!("Using ledger gateway at {}", url);
                let ledger: Arc<dyn Ledger> =
                    Arc::new(HttpLedger::new(url.clone(), config.ledger_timeout)?);
                (ledger, None)
            }
            None => {
                warn!("LEDGER_URL not set, using the in-memory dev ledger under /dev-ledger");
                let dev = Arc::new(InMemoryLedger::new());
                let ledger: Arc<dyn Ledger> = dev.clone();
                (ledger, Some(dev))
            }
        };

    // Accumulator first: rows left pending by a previous run may seal right away
    let (accumulator, sealed_rx) =
        BatchAccumulator::start(config.accumulator(), queue, metrics.clone()).await?;

    let pipeline = CommitPipeline::new(
        store.clone(),
        ledger.clone(),
        Arc::new(archive.clone()),
        metrics.clone(),
        config.pipeline(),
    );
    let hints = pipeline.subscribe();

    let report = ReconciliationReport::new();
    let reconciler = Reconciler::new(
        ledger.clone(),
        Arc::new(archive.clone()),
        report.clone(),
        metrics.clone(),
        config.reconciler(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pipeline_task = tokio::spawn(pipeline.run(sealed_rx, shutdown_rx.clone()));
    let reconcile_task = tokio::spawn(reconciler.run(Some(hints), shutdown_rx));

    let state = AppState {
        config: config.clone(),
        accumulator,
        store,
        archive,
        ledger,
        report,
        metrics,
        dev_ledger,
    };

    let app = routes::router(state)
        .layer(DefaultBodyLimit::max(config.intake_body_limit))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        );

    // Run the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, waiting for background tasks");
    let _ = shutdown_tx.send(true);
    let _ = pipeline_task.await;
    let _ = reconcile_task.await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
