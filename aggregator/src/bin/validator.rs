//! Independent validator: reconciles a ledger against a remote archive.
//!
//! Env: `LEDGER_URL`, `ARCHIVE_URL` (an aggregator base URL serving
//! `GET /batch/{id}`), `RECONCILE_INTERVAL_SECS`, `LEDGER_TIMEOUT_MS`.
//! With `VALIDATOR_ONCE=true` a single pass runs and the exit code is
//! non-zero if any batch is MISMATCH.

use std::sync::Arc;

use aggregator::{
    archive::HttpArchive,
    config::ValidatorConfig,
    ledger::{HttpLedger, Ledger},
    metrics::Metrics,
    reconcile::{ReconciliationReport, Reconciler},
    utils::env_parse,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs on stderr; stdout carries the one-shot report
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = ValidatorConfig::from_env()?;
    info!(
        "Starting OpenVote validator (ledger {}, archive {})",
        config.ledger_url, config.archive_url
    );

    let ledger: Arc<dyn Ledger> = Arc::new(HttpLedger::new(
        config.ledger_url.clone(),
        config.request_timeout,
    )?);
    let archive = Arc::new(HttpArchive::new(
        config.archive_url.clone(),
        config.request_timeout,
    )?);
    let report = ReconciliationReport::new();
    let hints = ledger.subscribe();
    let reconciler = Reconciler::new(
        ledger,
        archive,
        report.clone(),
        Arc::new(Metrics::new()),
        config.reconciler(),
    );

    if env_parse("VALIDATOR_ONCE", false) {
        let checked = reconciler.pass().await?;
        let summary = report.summary();
        info!(
            "Checked {} batches: {} MATCH, {} MISMATCH, {} DATA_UNAVAILABLE",
            checked, summary.counts.matched, summary.counts.mismatched, summary.counts.unavailable
        );
        println!("{}", serde_json::to_string_pretty(&summary)?);
        if summary.counts.mismatched > 0 {
            error!("Committed roots do not match archived data");
            std::process::exit(1);
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(reconciler.run(hints, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = task.await;

    let counts = report.counts();
    info!(
        "Final tally: {} MATCH, {} MISMATCH, {} DATA_UNAVAILABLE",
        counts.matched, counts.mismatched, counts.unavailable
    );
    Ok(())
}
